use std::time::Instant;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Local;
use serde::Deserialize;
use serde_json::{Value, json};

use super::history::round_to;
use super::stats::{FrameHealth, fps_estimate};
use super::{ApiError, ApiRequest, AppState, lock};
use crate::pipeline::decode::decode_image_bytes;
use crate::pipeline::recognizer::{RecognitionStatus, outcome_for_hands};
use crate::tts::TtsError;
use crate::types::Frame;

#[derive(Debug, Default, Deserialize)]
struct FrameRequest {
    image: Option<String>,
    confidence_threshold: Option<f32>,
    smoothing_frames: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct SpeechRequest {
    #[serde(default)]
    text: String,
    request_id: Option<String>,
}

fn parse_json<T: for<'de> Deserialize<'de>>(body: &[u8], missing: &str) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::BadRequest(missing.to_string()));
    }
    serde_json::from_slice(body).map_err(|err| ApiError::BadRequest(format!("Invalid JSON body: {err}")))
}

/// Accepts plain base64 or a `data:image/...;base64,` URL.
pub(super) fn decode_frame(image: &str) -> anyhow::Result<Frame> {
    let payload = match image.split_once(',') {
        Some((_, data)) => data,
        None => image,
    };
    let bytes = STANDARD.decode(payload.trim())?;
    decode_image_bytes(&bytes)
}

fn now_iso() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

pub(super) fn process_frame(state: &AppState, request: &ApiRequest) -> Result<Value, ApiError> {
    let started = Instant::now();
    let body: FrameRequest = parse_json(&request.body, "No image data received")?;
    let Some(image) = body.image.filter(|image| !image.is_empty()) else {
        return Err(ApiError::BadRequest("No image data received".into()));
    };
    let threshold = body
        .confidence_threshold
        .unwrap_or(state.config.default_confidence_threshold);
    let frames = body
        .smoothing_frames
        .map(|frames| frames.max(0) as usize)
        .unwrap_or(state.config.default_smoothing_frames);

    let frame = match decode_frame(&image) {
        Ok(frame) => frame.mirrored(),
        Err(err) => {
            log::warn!("could not decode image: {err:#}");
            lock(&state.stats).record_error();
            return Err(ApiError::BadRequest("Could not decode image".into()));
        }
    };

    let hands = {
        let mut tracker = lock(&state.tracker);
        let Some(tracker) = tracker.as_mut() else {
            return Err(ApiError::Internal("Hand tracker not initialized".into()));
        };
        match tracker.detect(&frame) {
            Ok(hands) => hands,
            Err(err) => {
                let mut stats = lock(&state.stats);
                stats.record_error();
                return Err(ApiError::Internal(format!(
                    "Processing error: {err:#} (consecutive errors: {})",
                    stats.consecutive_errors()
                )));
            }
        }
    };

    let (outcome, model_loaded) = {
        let mut model = lock(&state.model);
        let mut smoother = lock(&state.smoother);
        let wanted = state.smoothing.web(frames);
        if smoother.config() != wanted {
            smoother.reconfigure(wanted);
        }
        let outcome = outcome_for_hands(hands, model.as_mut(), &mut smoother, Some(threshold), Instant::now());
        (outcome, model.is_some())
    };

    if outcome.smoothed {
        lock(&state.history).record(&outcome.status.to_string(), outcome.confidence, outcome.raw_confidence);
    }

    let elapsed_ms = round_to((started.elapsed().as_secs_f64() * 1000.0) as f32, 2);
    let health = match outcome.status {
        RecognitionStatus::PredictionError => FrameHealth::Failed,
        RecognitionStatus::ModelNotLoaded | RecognitionStatus::LandmarkProcessingFailed => FrameHealth::Neutral,
        _ => FrameHealth::Ok,
    };
    let performance = {
        let mut stats = lock(&state.stats);
        stats.record_frame(elapsed_ms, health);
        json!({
            "fps_estimate": fps_estimate(elapsed_ms),
            "total_frames": stats.total_frames(),
            "avg_processing_time": round_to(stats.average_ms() as f32, 2),
            "consecutive_errors": stats.consecutive_errors(),
        })
    };

    let prediction = outcome.status.to_string();
    let smoothed_prediction = match &outcome.status {
        RecognitionStatus::NoHand { held: Some(held) } => held.clone(),
        _ => prediction.clone(),
    };
    let landmarks: Vec<Value> = outcome
        .hands
        .first()
        .map(|hand| {
            hand.mirrored()
                .points
                .iter()
                .map(|[x, y, z]| json!({ "x": x, "y": y, "z": z }))
                .collect()
        })
        .unwrap_or_default();

    log::debug!("frame processed: {prediction} ({:.1}%) in {elapsed_ms}ms", outcome.confidence * 100.0);
    Ok(json!({
        "success": true,
        "prediction": prediction,
        "confidence": round_to(outcome.confidence, 3),
        "raw_confidence": round_to(outcome.raw_confidence, 3),
        "landmarks_detected": outcome.hand_detected(),
        "hand_count": outcome.hands.len(),
        "processing_time_ms": elapsed_ms,
        "model_loaded": model_loaded,
        "timestamp": now_iso(),
        "landmarks": landmarks,
        "smoothed_prediction": smoothed_prediction,
        "performance": performance,
    }))
}

pub(super) fn text_to_speech(state: &AppState, request: &ApiRequest) -> Result<Value, ApiError> {
    let body: SpeechRequest = parse_json(&request.body, "No JSON data received")?;
    let Some(tts) = state.tts.as_ref() else {
        return Err(ApiError::Internal("Audio system unavailable".into()));
    };
    match tts.speak(&body.text, body.request_id) {
        Ok(accepted) => Ok(json!({
            "status": "success",
            "message": "Audio playing",
            "request_id": accepted.request_id,
            "text_length": accepted.text_length,
        })),
        Err(err @ TtsError::EmptyText) => Err(ApiError::BadRequest(err.to_string())),
        Err(err @ TtsError::Duplicate { .. }) => Err(ApiError::TooManyRequests(err.to_string())),
        Err(err) => {
            if let Some(cause) = std::error::Error::source(&err) {
                log::error!("{err}: {cause}");
            }
            Err(ApiError::Internal(err.to_string()))
        }
    }
}

pub(super) fn get_history(state: &AppState, _request: &ApiRequest) -> Result<Value, ApiError> {
    let history = lock(&state.history).recent(state.config.history_page);
    Ok(json!({ "history": history }))
}

pub(super) fn health(state: &AppState, _request: &ApiRequest) -> Result<Value, ApiError> {
    let model_loaded = state.model_loaded();
    let tracker_ready = state.tracker_ready();
    let class_names = state.class_names();
    let prediction_history_size = lock(&state.smoother).len();
    let history_count = lock(&state.history).len();
    let stats = lock(&state.stats).clone();

    let status = if !model_loaded {
        "unhealthy"
    } else if stats.consecutive_errors() > state.config.degraded_error_threshold {
        "degraded"
    } else {
        "healthy"
    };
    Ok(json!({
        "status": status,
        "model_loaded": model_loaded,
        "tracker_initialized": tracker_ready,
        "translation_history_count": history_count,
        "model_load_attempts": state.load_attempts(),
        "timestamp": now_iso(),
        "class_names": class_names,
        "version": env!("CARGO_PKG_VERSION"),
        "performance": {
            "uptime_seconds": round_to(stats.uptime().as_secs_f32(), 2),
            "total_frames_processed": stats.total_frames(),
            "average_processing_time_ms": round_to(stats.average_ms() as f32, 2),
            "last_processing_time_ms": stats.last_ms(),
            "consecutive_errors": stats.consecutive_errors(),
            "seconds_since_last_success": round_to(stats.since_last_success().as_secs_f32(), 2),
        },
        "system": {
            "active_tts_requests": state.tts_active(),
            "prediction_history_size": prediction_history_size,
        },
    }))
}

pub(super) fn clear_history(state: &AppState, _request: &ApiRequest) -> Result<Value, ApiError> {
    lock(&state.smoother).clear();
    lock(&state.history).clear();
    log::info!("translation history cleared");
    Ok(json!({ "status": "success", "message": "History cleared" }))
}

pub(super) fn reload_model(state: &AppState, _request: &ApiRequest) -> Result<Value, ApiError> {
    let loaded = state.load_model();
    Ok(json!({
        "status": if loaded { "success" } else { "error" },
        "model_loaded": loaded,
        "class_names": state.class_names(),
    }))
}

pub(super) fn performance(state: &AppState, _request: &ApiRequest) -> Result<Value, ApiError> {
    let snapshot = lock(&state.stats).snapshot();
    serde_json::to_value(snapshot).map_err(|err| ApiError::Internal(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    fn png_base64() -> String {
        let image = RgbImage::from_pixel(4, 2, image::Rgb([200, 10, 10]));
        let mut bytes = Vec::new();
        image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        STANDARD.encode(bytes)
    }

    #[test]
    fn data_urls_and_plain_base64_decode() {
        let plain = png_base64();
        let frame = decode_frame(&plain).unwrap();
        assert_eq!((frame.width, frame.height), (4, 2));
        let url = format!("data:image/png;base64,{plain}");
        assert_eq!(decode_frame(&url).unwrap().rgba, frame.rgba);
        assert!(decode_frame("not base64 at all!").is_err());
    }
}
