use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow, bail};
use reqwest::blocking::Client;
use thiserror::Error;

use crate::config::TtsConfig;
use crate::error::ResourceError;
use crate::recovery::{RetryPolicy, retry};

const AUDIO_PREFIX: &str = "temp_audio_";
const CHUNK_CHARS: usize = 100;

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("No text provided")]
    EmptyText,
    #[error("Duplicate TTS request - please wait before speaking again")]
    Duplicate { request_id: String },
    #[error("Speech generation failed")]
    Synthesis(#[source] ResourceError),
    #[error("Audio playback failed")]
    Playback(#[source] ResourceError),
}

/// Turns text into an audio file.
pub trait Synthesizer: Send + Sync {
    fn synthesize(&self, text: &str, dest: &Path) -> Result<()>;
}

/// A running playback.
pub trait Playback: Send {
    fn is_busy(&mut self) -> bool;
    fn stop(&mut self);
}

pub trait AudioPlayer: Send + Sync {
    fn play(&self, path: &Path) -> Result<Box<dyn Playback>>;
}

/// Google Translate's speech endpoint, the one gTTS talks to.
pub struct GoogleTts {
    client: Client,
    endpoint: String,
    language: String,
}

impl GoogleTts {
    pub fn new(endpoint: impl Into<String>, language: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent("Mozilla/5.0")
            .build()
            .context("failed to build TTS http client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            language: language.into(),
        })
    }
}

impl Synthesizer for GoogleTts {
    fn synthesize(&self, text: &str, dest: &Path) -> Result<()> {
        let chunks = split_text(text, CHUNK_CHARS);
        let total = chunks.len().to_string();
        let mut audio = Vec::new();
        for (idx, chunk) in chunks.iter().enumerate() {
            let idx = idx.to_string();
            let textlen = chunk.chars().count().to_string();
            let bytes = self
                .client
                .get(&self.endpoint)
                .query(&[
                    ("ie", "UTF-8"),
                    ("q", chunk.as_str()),
                    ("tl", self.language.as_str()),
                    ("client", "tw-ob"),
                    ("total", total.as_str()),
                    ("idx", idx.as_str()),
                    ("textlen", textlen.as_str()),
                ])
                .send()
                .with_context(|| format!("TTS request failed for chunk {idx}"))?
                .error_for_status()?
                .bytes()?;
            audio.extend_from_slice(&bytes);
        }
        if audio.is_empty() {
            bail!("TTS endpoint returned no audio");
        }
        fs::write(dest, &audio).with_context(|| format!("failed to write {dest:?}"))
    }
}

/// Packs words into chunks of at most `max_chars` characters. Words longer
/// than that are cut.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            chunks.push(word.drain(..max_chars).collect());
        }
        if word.is_empty() {
            continue;
        }
        let len = current.chars().count();
        if len > 0 && len + 1 + word.len() > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.extend(word);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Plays files through the first external player that starts.
pub struct CommandPlayer {
    commands: Vec<Vec<String>>,
}

impl CommandPlayer {
    pub fn new(commands: Vec<Vec<String>>) -> Self {
        Self { commands }
    }
}

impl AudioPlayer for CommandPlayer {
    fn play(&self, path: &Path) -> Result<Box<dyn Playback>> {
        let mut errors = Vec::new();
        for command in &self.commands {
            let Some((program, args)) = command.split_first() else {
                continue;
            };
            match Command::new(program)
                .args(args)
                .arg(path)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
            {
                Ok(child) => {
                    log::debug!("playing {path:?} with {program}");
                    return Ok(Box::new(ChildPlayback { child }));
                }
                Err(err) => errors.push(format!("{program}: {err}")),
            }
        }
        Err(anyhow!("no audio player could be started ({})", errors.join("; ")))
    }
}

struct ChildPlayback {
    child: Child,
}

impl Playback for ChildPlayback {
    fn is_busy(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn stop(&mut self) {
        if self.is_busy() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

/// Request ids seen recently and the ones still playing.
#[derive(Debug)]
pub struct TtsRegistry {
    requests: HashMap<String, Instant>,
    active: HashSet<String>,
    last_sweep: Instant,
    dedupe_window: Duration,
    ttl: Duration,
    sweep_interval: Duration,
}

impl TtsRegistry {
    pub fn new(dedupe_window: Duration, ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            requests: HashMap::new(),
            active: HashSet::new(),
            last_sweep: Instant::now(),
            dedupe_window,
            ttl,
            sweep_interval,
        }
    }

    pub fn from_config(config: &TtsConfig) -> Self {
        Self::new(
            Duration::from_millis(config.dedupe_window_ms),
            Duration::from_millis(config.request_ttl_ms),
            Duration::from_millis(config.cleanup_interval_ms),
        )
    }

    pub fn register_at(&mut self, request_id: &str, now: Instant) -> Result<(), TtsError> {
        if let Some(seen) = self.requests.get(request_id) {
            if now.saturating_duration_since(*seen) < self.dedupe_window {
                return Err(TtsError::Duplicate {
                    request_id: request_id.to_string(),
                });
            }
        }
        self.requests.insert(request_id.to_string(), now);
        self.active.insert(request_id.to_string());
        Ok(())
    }

    pub fn finish(&mut self, request_id: &str) {
        self.active.remove(request_id);
    }

    /// Forgets requests older than the ttl, at most once per sweep interval.
    pub fn sweep_at(&mut self, now: Instant) -> usize {
        if now.saturating_duration_since(self.last_sweep) < self.sweep_interval {
            return 0;
        }
        self.last_sweep = now;
        let ttl = self.ttl;
        let expired: Vec<String> = self
            .requests
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.requests.remove(id);
            self.active.remove(id);
        }
        expired.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn tracked_count(&self) -> usize {
        self.requests.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpeakAccepted {
    pub request_id: String,
    pub text_length: usize,
}

pub struct TtsService {
    synthesizer: Box<dyn Synthesizer>,
    player: Box<dyn AudioPlayer>,
    registry: Arc<Mutex<TtsRegistry>>,
    audio_dir: PathBuf,
    synthesis_policy: RetryPolicy,
    playback_policy: RetryPolicy,
    playback_timeout: Duration,
    stale_audio: Duration,
    janitor_interval: Duration,
}

impl TtsService {
    pub fn new(config: &TtsConfig, synthesizer: Box<dyn Synthesizer>, player: Box<dyn AudioPlayer>) -> Self {
        Self {
            synthesizer,
            player,
            registry: Arc::new(Mutex::new(TtsRegistry::from_config(config))),
            audio_dir: config.audio_dir(),
            synthesis_policy: RetryPolicy::fixed(config.synthesis_attempts, Duration::from_secs(1)),
            playback_policy: RetryPolicy::fixed(config.playback_attempts, Duration::from_millis(500)),
            playback_timeout: Duration::from_millis(config.playback_timeout_ms),
            stale_audio: Duration::from_secs(config.stale_audio_secs),
            janitor_interval: Duration::from_secs(config.janitor_interval_secs),
        }
    }

    /// Google speech plus the configured external players.
    pub fn system(config: &TtsConfig) -> Result<Self> {
        let synthesizer = GoogleTts::new(&config.endpoint, &config.language)?;
        let player = CommandPlayer::new(config.players.clone());
        Ok(Self::new(config, Box::new(synthesizer), Box::new(player)))
    }

    pub fn active_requests(&self) -> usize {
        self.registry().active_count()
    }

    fn registry(&self) -> MutexGuard<'_, TtsRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn audio_path(&self, request_id: &str) -> PathBuf {
        let safe: String = request_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.audio_dir.join(format!("{AUDIO_PREFIX}{safe}.mp3"))
    }

    /// Synthesizes and starts playing `text`. Returns once playback has
    /// started; a background thread waits for it to end and cleans up.
    pub fn speak(&self, text: &str, request_id: Option<String>) -> Result<SpeakAccepted, TtsError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(TtsError::EmptyText);
        }
        let request_id = request_id.unwrap_or_else(|| {
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or_default();
            format!("tts_{millis}")
        });

        {
            let mut registry = self.registry();
            let now = Instant::now();
            registry.sweep_at(now);
            if let Err(err) = registry.register_at(&request_id, now) {
                log::warn!("duplicate TTS request rejected: {request_id}");
                return Err(err);
            }
        }

        let audio = self.audio_path(&request_id);
        if let Err(err) = retry(&self.synthesis_policy, "speech synthesis", |_| {
            self.synthesizer.synthesize(text, &audio)
        }) {
            self.registry().finish(&request_id);
            return Err(TtsError::Synthesis(err));
        }

        let playback = match retry(&self.playback_policy, "audio playback", |_| self.player.play(&audio)) {
            Ok(playback) => playback,
            Err(err) => {
                remove_audio_file(&audio);
                self.registry().finish(&request_id);
                return Err(TtsError::Playback(err));
            }
        };

        log::info!("TTS playing: '{text}' (request: {request_id})");
        self.wait_in_background(playback, audio, request_id.clone());
        Ok(SpeakAccepted {
            request_id,
            text_length: text.chars().count(),
        })
    }

    fn wait_in_background(&self, mut playback: Box<dyn Playback>, audio: PathBuf, request_id: String) {
        let registry = Arc::clone(&self.registry);
        let timeout = self.playback_timeout;
        let (waiter_audio, waiter_id) = (audio.clone(), request_id.clone());
        let spawned = thread::Builder::new()
            .name("tts-playback".into())
            .spawn(move || {
                let started = Instant::now();
                while playback.is_busy() {
                    if started.elapsed() > timeout {
                        log::warn!("TTS playback timed out for request {waiter_id}");
                        break;
                    }
                    thread::sleep(Duration::from_millis(100));
                }
                playback.stop();
                release_request(&registry, &waiter_audio, &waiter_id);
                log::info!("TTS playback completed (request: {waiter_id})");
            });
        if let Err(err) = spawned {
            log::error!("failed to spawn TTS playback waiter: {err}");
            release_request(&self.registry, &audio, &request_id);
        }
    }

    /// Forgets old request ids and deletes abandoned audio files.
    pub fn sweep(&self) -> usize {
        self.registry().sweep_at(Instant::now());
        sweep_stale_audio(&self.audio_dir, self.stale_audio)
    }

    pub fn spawn_janitor(self: &Arc<Self>) -> Result<thread::JoinHandle<()>> {
        let service = Arc::clone(self);
        thread::Builder::new()
            .name("tts-janitor".into())
            .spawn(move || loop {
                let removed = service.sweep();
                if removed > 0 {
                    log::info!("removed {removed} stale audio files");
                }
                thread::sleep(service.janitor_interval);
            })
            .context("failed to spawn TTS janitor")
    }
}

/// Deletes the request's audio and frees its id for reuse.
fn release_request(registry: &Mutex<TtsRegistry>, audio: &Path, request_id: &str) {
    remove_audio_file(audio);
    registry
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .finish(request_id);
}

fn remove_audio_file(path: &Path) {
    for attempt in 1..=3 {
        match fs::remove_file(path) {
            Ok(()) => {
                log::debug!("removed audio file {path:?}");
                return;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                if attempt == 3 {
                    log::error!("failed to remove audio file {path:?}: {err}");
                    return;
                }
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

/// Deletes `temp_audio_*.mp3` files in `dir` older than `max_age`.
pub fn sweep_stale_audio(dir: &Path, max_age: Duration) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(AUDIO_PREFIX) || !name.ends_with(".mp3") {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_some_and(|age| age > max_age) && fs::remove_file(entry.path()).is_ok() {
            log::info!("cleaned up old audio file {name}");
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct WriteFile {
        calls: AtomicUsize,
        fail_first: usize,
    }

    impl Synthesizer for WriteFile {
        fn synthesize(&self, text: &str, dest: &Path) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                bail!("offline");
            }
            fs::write(dest, text.as_bytes())?;
            Ok(())
        }
    }

    struct Done;

    impl Playback for Done {
        fn is_busy(&mut self) -> bool {
            false
        }
        fn stop(&mut self) {}
    }

    struct Player(bool);

    impl AudioPlayer for Player {
        fn play(&self, _path: &Path) -> Result<Box<dyn Playback>> {
            if self.0 { Ok(Box::new(Done)) } else { bail!("no device") }
        }
    }

    fn service(dir: &Path, fail_synth: usize, can_play: bool) -> TtsService {
        let config = TtsConfig {
            audio_dir: Some(dir.to_path_buf()),
            ..TtsConfig::default()
        };
        let mut service = TtsService::new(
            &config,
            Box::new(WriteFile {
                calls: AtomicUsize::new(0),
                fail_first: fail_synth,
            }),
            Box::new(Player(can_play)),
        );
        service.synthesis_policy = RetryPolicy::fixed(2, Duration::ZERO);
        service.playback_policy = RetryPolicy::fixed(2, Duration::ZERO);
        service
    }

    fn wait_idle(service: &TtsService) {
        let start = Instant::now();
        while service.active_requests() > 0 && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn duplicate_ids_are_rejected_within_window() {
        let mut registry = TtsRegistry::new(Duration::from_secs(2), Duration::from_secs(30), Duration::from_secs(30));
        let t0 = Instant::now();
        registry.register_at("a", t0).unwrap();
        assert!(matches!(
            registry.register_at("a", t0 + Duration::from_millis(1500)),
            Err(TtsError::Duplicate { .. })
        ));
        registry.register_at("a", t0 + Duration::from_millis(2500)).unwrap();
        registry.register_at("b", t0).unwrap();
        assert_eq!(registry.active_count(), 2);
        registry.finish("a");
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn sweep_runs_at_most_once_per_interval() {
        let mut registry = TtsRegistry::new(Duration::from_secs(2), Duration::from_secs(30), Duration::from_secs(30));
        let t0 = Instant::now();
        registry.register_at("old", t0).unwrap();
        assert_eq!(registry.sweep_at(t0 + Duration::from_secs(10)), 0);
        assert_eq!(registry.sweep_at(t0 + Duration::from_secs(31)), 1);
        assert_eq!(registry.tracked_count(), 0);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn speak_plays_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), 1, true);
        let accepted = service.speak("  hello there ", Some("req-1".into())).unwrap();
        assert_eq!(accepted.text_length, 11);
        assert_eq!(accepted.request_id, "req-1");
        wait_idle(&service);
        assert_eq!(service.active_requests(), 0);
        assert!(!service.audio_path("req-1").exists());
        assert!(matches!(
            service.speak("again", Some("req-1".into())),
            Err(TtsError::Duplicate { .. })
        ));
    }

    #[test]
    fn failures_release_the_request() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(service(dir.path(), 0, true).speak("   ", None), Err(TtsError::EmptyText)));

        let broken_synth = service(dir.path(), 5, true);
        assert!(matches!(broken_synth.speak("hi", None), Err(TtsError::Synthesis(_))));
        assert_eq!(broken_synth.active_requests(), 0);

        let no_player = service(dir.path(), 0, false);
        assert!(matches!(no_player.speak("hi", Some("x".into())), Err(TtsError::Playback(_))));
        assert_eq!(no_player.active_requests(), 0);
        assert!(!no_player.audio_path("x").exists());
    }

    #[test]
    fn released_requests_free_their_id_and_audio() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), 0, true);
        let audio = service.audio_path("req-9");
        fs::write(&audio, b"mp3").unwrap();
        service.registry().register_at("req-9", Instant::now()).unwrap();
        assert_eq!(service.active_requests(), 1);

        release_request(&service.registry, &audio, "req-9");
        assert_eq!(service.active_requests(), 0);
        assert!(!audio.exists());
    }

    #[test]
    fn audio_names_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), 0, true);
        assert_eq!(
            service.audio_path("../etc/passwd"),
            dir.path().join("temp_audio____etc_passwd.mp3")
        );
    }

    #[test]
    fn stale_audio_sweep_only_touches_audio_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("temp_audio_a.mp3"), b"x").unwrap();
        fs::write(dir.path().join("notes.mp3"), b"x").unwrap();
        assert_eq!(sweep_stale_audio(dir.path(), Duration::from_secs(300)), 0);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(sweep_stale_audio(dir.path(), Duration::ZERO), 1);
        assert!(dir.path().join("notes.mp3").exists());
    }

    #[test]
    fn text_is_chunked_on_word_boundaries() {
        assert_eq!(split_text("thank you very much", 9), vec!["thank you", "very much"]);
        assert_eq!(split_text("abcdefghij k", 4), vec!["abcd", "efgh", "ij k"]);
        assert!(split_text("   ", 100).is_empty());
    }
}
