mod handlers;
pub mod history;
pub mod stats;

use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use thiserror::Error;
use tiny_http::{Header, Method, Response, Server, StatusCode};

use crate::classes::ClassMapping;
use crate::config::{AppConfig, ServerConfig, SmoothingConfig};
use crate::error::ResourceError;
use crate::pipeline::classifier::{LoadedModel, ModelSearch};
use crate::pipeline::landmarks::{HandTracker, start_ort_tracker};
use crate::recovery::{RetryPolicy, retry};
use crate::smoothing::TemporalSmoother;
use crate::tts::TtsService;
use history::TranslationHistory;
use stats::PerformanceStats;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Endpoint not found")]
    NotFound,
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Request payload too large")]
    PayloadTooLarge,
    #[error("{0}")]
    TooManyRequests(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::NotFound => 404,
            ApiError::MethodNotAllowed => 405,
            ApiError::PayloadTooLarge => 413,
            ApiError::TooManyRequests(_) => 429,
            ApiError::Internal(_) => 500,
        }
    }
}

impl From<ApiError> for ApiResponse {
    fn from(err: ApiError) -> Self {
        ApiResponse {
            status: err.status(),
            body: json!({ "error": err.to_string() }),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Vec<u8>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method,
            path: path.into(),
            body: body.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }
}

pub type ModelLoader = Box<dyn Fn() -> Result<LoadedModel, ResourceError> + Send + Sync>;

/// Everything the handlers share. Locks are taken in field order.
pub struct AppState {
    config: ServerConfig,
    smoothing: SmoothingConfig,
    tracker: Mutex<Option<Box<dyn HandTracker>>>,
    model: Mutex<Option<LoadedModel>>,
    smoother: Mutex<TemporalSmoother<usize>>,
    history: Mutex<TranslationHistory>,
    stats: Mutex<PerformanceStats>,
    tts: Option<Arc<TtsService>>,
    loader: ModelLoader,
    reload_policy: RetryPolicy,
    load_attempts: AtomicUsize,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AppState {
    /// Builds the state without loading a model; call [`AppState::load_model`].
    pub fn new(
        config: &AppConfig,
        tracker: Option<Box<dyn HandTracker>>,
        loader: ModelLoader,
        tts: Option<Arc<TtsService>>,
    ) -> Self {
        Self {
            config: config.server.clone(),
            smoothing: config.smoothing.clone(),
            tracker: Mutex::new(tracker),
            model: Mutex::new(None),
            smoother: Mutex::new(TemporalSmoother::new(
                config.smoothing.web(config.server.default_smoothing_frames),
            )),
            history: Mutex::new(TranslationHistory::new(config.server.history_limit)),
            stats: Mutex::new(PerformanceStats::default()),
            tts,
            loader,
            reload_policy: config.model.reload_policy(),
            load_attempts: AtomicUsize::new(0),
        }
    }

    /// ONNX tracker, ONNX classifier search and system speech, as configured.
    pub fn from_config(config: &AppConfig) -> Self {
        let tracker = start_ort_tracker(&config.tracker);
        let search = ModelSearch::from(&config.model);
        let tts = match TtsService::system(&config.tts) {
            Ok(service) => Some(Arc::new(service)),
            Err(err) => {
                log::error!("text-to-speech disabled: {err:#}");
                None
            }
        };
        Self::new(config, tracker, Box::new(move || search.load_ort()), tts)
    }

    /// Runs the model search, repeating it with exponential backoff. The
    /// previous model is dropped when every round fails.
    pub fn load_model(&self) -> bool {
        let loaded = retry(&self.reload_policy, "model load", |round| {
            let total = self.load_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            log::info!(
                "loading sign classifier (round {round}/{}, attempt {total} overall)",
                self.reload_policy.attempts
            );
            (self.loader)().map_err(anyhow::Error::from)
        });
        let mut model = lock(&self.model);
        let ok = match loaded {
            Ok(loaded) => {
                log::info!(
                    "sign classifier ready: {:?} ({} classes)",
                    loaded.path,
                    loaded.mapping.len()
                );
                *model = Some(loaded);
                true
            }
            Err(err) => {
                log::error!("{err}; recognition disabled");
                *model = None;
                false
            }
        };
        drop(model);
        lock(&self.smoother).clear();
        ok
    }

    pub fn model_loaded(&self) -> bool {
        lock(&self.model).is_some()
    }

    pub fn tracker_ready(&self) -> bool {
        lock(&self.tracker).is_some()
    }

    pub fn class_names(&self) -> Vec<String> {
        match lock(&self.model).as_ref() {
            Some(model) => model.mapping.names().to_vec(),
            None => ClassMapping::default().names().to_vec(),
        }
    }

    pub fn load_attempts(&self) -> usize {
        self.load_attempts.load(Ordering::SeqCst)
    }

    /// Speech requests still playing.
    pub fn tts_active(&self) -> usize {
        self.tts.as_ref().map_or(0, |tts| tts.active_requests())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Background cleanup for the speech service, if there is one.
    pub fn spawn_janitor(&self) -> Result<()> {
        if let Some(tts) = &self.tts {
            tts.spawn_janitor()?;
        }
        Ok(())
    }
}

/// Dispatches one request. Paths may carry a query string, which is ignored.
pub fn route(state: &AppState, request: &ApiRequest) -> ApiResponse {
    let path = request.path.split('?').next().unwrap_or_default();
    let (method, handler): (Method, fn(&AppState, &ApiRequest) -> Result<Value, ApiError>) = match path {
        "/api/process_frame" | "/video_feed" => (Method::Post, handlers::process_frame),
        "/api/text_to_speech" | "/text_to_speech" => (Method::Post, handlers::text_to_speech),
        "/api/get_history" | "/get_history" => (Method::Get, handlers::get_history),
        "/api/health" => (Method::Get, handlers::health),
        "/api/clear_history" => (Method::Post, handlers::clear_history),
        "/api/model/reload" => (Method::Post, handlers::reload_model),
        "/api/performance" => (Method::Get, handlers::performance),
        _ => return ApiError::NotFound.into(),
    };
    if request.method != method {
        return ApiError::MethodNotAllowed.into();
    }
    match handler(state, request) {
        Ok(body) => ApiResponse::ok(body),
        Err(err) => {
            if err.status() >= 500 {
                log::error!("{} {path}: {err}", request.method);
            } else {
                log::debug!("{} {path}: {err}", request.method);
            }
            err.into()
        }
    }
}

/// Binds `server.host:server.port` and serves with a fixed pool of workers.
/// Blocks for as long as the workers run.
pub fn serve(state: Arc<AppState>) -> Result<()> {
    let addr = state.config.bind_addr();
    let server = Server::http(&addr).map_err(|err| anyhow!("failed to bind {addr}: {err}"))?;
    let server = Arc::new(server);
    log::info!("listening on http://{addr} with {} workers", state.config.workers);

    let handles: Vec<_> = (0..state.config.workers.max(1))
        .map(|id| {
            let server = Arc::clone(&server);
            let state = Arc::clone(&state);
            thread::spawn(move || worker_loop(id, &server, &state))
        })
        .collect();
    for handle in handles {
        if handle.join().is_err() {
            log::error!("http worker panicked");
        }
    }
    Ok(())
}

fn worker_loop(id: usize, server: &Server, state: &AppState) {
    loop {
        let request = match server.recv() {
            Ok(request) => request,
            Err(err) => {
                log::error!("http worker {id} stopped: {err}");
                return;
            }
        };
        handle(state, request);
    }
}

fn handle(state: &AppState, mut request: tiny_http::Request) {
    let response = match read_body(&mut request, state.config.max_body_bytes) {
        Ok(body) => {
            let api = ApiRequest::new(request.method().clone(), request.url(), body);
            route(state, &api)
        }
        Err(err) => err.into(),
    };
    respond(request, response);
}

fn read_body(request: &mut tiny_http::Request, limit: usize) -> Result<Vec<u8>, ApiError> {
    if request.body_length().is_some_and(|len| len > limit) {
        return Err(ApiError::PayloadTooLarge);
    }
    let mut body = Vec::new();
    request
        .as_reader()
        .take(limit as u64 + 1)
        .read_to_end(&mut body)
        .map_err(|err| ApiError::BadRequest(format!("failed to read request body: {err}")))?;
    if body.len() > limit {
        return Err(ApiError::PayloadTooLarge);
    }
    Ok(body)
}

fn respond(request: tiny_http::Request, response: ApiResponse) {
    let data = serde_json::to_vec(&response.body).unwrap_or_default();
    let mut http = Response::from_data(data).with_status_code(StatusCode(response.status));
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        http = http.with_header(header);
    }
    if let Err(err) = request.respond(http) {
        log::warn!("failed to send response: {err}");
    }
}
