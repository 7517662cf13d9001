use std::mem;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};

use crate::config::AppConfig;
use crate::dataset::DatasetLayout;
use crate::dataset::collect::{CaptureResult, CollectMode, CollectSession};
use crate::pipeline::camera::{CaptureError, CaptureSettings, SupervisedCamera, default_provider};
use crate::pipeline::classifier::ModelSearch;
use crate::pipeline::landmarks::start_ort_tracker;
use crate::pipeline::recognizer::{FrameOutcome, RecognitionStatus, Recognizer};
use crate::pipeline::skeleton::{Canvas, centered_square, draw_confidence_bar, draw_guide_box, draw_hand, GUIDE_COLOR};
use crate::types::{Frame, HandLandmarks};

const ERROR_DISPLAY: Duration = Duration::from_secs(2);
const ERROR_FRAME: (u32, u32) = (640, 480);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Quit,
    ClearHistory,
    RestartCamera,
    ToggleDebug,
    Emergency,
    Capture,
    NextSign,
    PrevSign,
}

impl Command {
    /// Keyboard shortcut, as used by the window and the headless prompt.
    pub fn from_key(key: &str) -> Option<Self> {
        Some(match key {
            "q" | "escape" => Command::Quit,
            "c" => Command::ClearHistory,
            "r" => Command::RestartCamera,
            "d" => Command::ToggleDebug,
            "e" => Command::Emergency,
            "space" | "s" => Command::Capture,
            "n" | "right" => Command::NextSign,
            "p" | "left" => Command::PrevSign,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Banner {
    Emergency,
    CameraError,
    Error(String),
}

impl Banner {
    pub fn lines(&self) -> Vec<String> {
        match self {
            Banner::Emergency => vec![
                "EMERGENCY MODE - Camera Working".into(),
                "ASL Translation Not Available".into(),
                "Press 'e' to leave emergency mode".into(),
            ],
            Banner::CameraError => vec![
                "Camera Error - Attempting to reconnect...".into(),
                "Press 'e' for emergency mode".into(),
            ],
            Banner::Error(message) => {
                let short: String = message.chars().take(50).collect();
                vec![format!("Error: {short}...")]
            }
        }
    }
}

/// Everything the window needs to draw one frame.
#[derive(Clone, Debug)]
pub struct TesterSnapshot {
    pub frame: Frame,
    pub status: String,
    pub confidence: f32,
    pub confident: bool,
    pub hand_detected: bool,
    pub fps: f32,
    pub banner: Option<Banner>,
    pub debug: Vec<String>,
    /// Collection progress and the result of the last capture.
    pub collect: Option<(String, Option<String>)>,
}

impl TesterSnapshot {
    fn blank(banner: Banner, fps: f32) -> Self {
        Self {
            frame: Frame::blank(ERROR_FRAME.0, ERROR_FRAME.1),
            status: banner.lines().first().cloned().unwrap_or_default(),
            confidence: 0.0,
            confident: false,
            hand_detected: false,
            fps,
            banner: Some(banner),
            debug: Vec::new(),
            collect: None,
        }
    }
}

pub enum LoopMode {
    Recognize,
    Collect(CollectSession),
}

/// Capture → track → classify → smooth → annotate, one frame per step.
pub struct TesterLoop {
    camera: SupervisedCamera,
    recognizer: Recognizer,
    mode: LoopMode,
    display_threshold: f32,
    reconnect_pause: Duration,
    emergency: bool,
    debug: bool,
    capture_requested: bool,
    frames: u64,
    started: Instant,
    error: Option<(Instant, String)>,
    last_capture: Option<String>,
}

impl TesterLoop {
    pub fn new(
        camera: SupervisedCamera,
        recognizer: Recognizer,
        mode: LoopMode,
        display_threshold: f32,
        reconnect_pause: Duration,
    ) -> Self {
        let emergency = match &mode {
            LoopMode::Recognize => !recognizer.tracker_ready() || recognizer.model().is_none(),
            LoopMode::Collect(session) => session.mode() == CollectMode::Landmarks && !recognizer.tracker_ready(),
        };
        if emergency {
            log::warn!("essential components missing, starting in emergency mode");
        }
        Self {
            camera,
            recognizer,
            mode,
            display_threshold,
            reconnect_pause,
            emergency,
            debug: false,
            capture_requested: false,
            frames: 0,
            started: Instant::now(),
            error: None,
            last_capture: None,
        }
    }

    /// Real camera, ONNX tracker and, when recognizing, the classifier search.
    pub fn from_config(config: &AppConfig, mode: LoopMode) -> Self {
        let camera = SupervisedCamera::new(default_provider(), CaptureSettings::from(&config.camera));
        let needs_tracker = match &mode {
            LoopMode::Recognize => true,
            LoopMode::Collect(session) => session.mode() == CollectMode::Landmarks,
        };
        let tracker = if needs_tracker {
            start_ort_tracker(&config.tracker)
        } else {
            None
        };
        let model = match &mode {
            LoopMode::Recognize => match ModelSearch::from(&config.model).load_ort() {
                Ok(model) => Some(model),
                Err(err) => {
                    log::error!("recognition disabled: {err}");
                    None
                }
            },
            LoopMode::Collect(_) => None,
        };
        let recognizer = Recognizer::new(tracker, model, config.smoothing.desktop(), None);
        Self::new(
            camera,
            recognizer,
            mode,
            config.smoothing.display_threshold,
            config.camera.reconnect_pause(),
        )
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency
    }

    pub fn fps(&self) -> f32 {
        let elapsed = self.started.elapsed().as_secs_f32();
        if elapsed > 0.0 { self.frames as f32 / elapsed } else { 0.0 }
    }

    /// Applies a command. Returns `false` when the loop should stop.
    pub fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::Quit => {
                log::info!("quit requested");
                return false;
            }
            Command::ClearHistory => {
                self.recognizer.clear_history();
                log::info!("prediction history cleared");
            }
            Command::RestartCamera => {
                log::info!("camera restart requested");
                self.camera.release();
                match self.camera.acquire() {
                    Ok(index) => log::info!("camera {index} restarted"),
                    Err(err) => log::error!("camera restart failed: {err}"),
                }
                self.frames = 0;
                self.started = Instant::now();
            }
            Command::ToggleDebug => {
                self.debug = !self.debug;
                log::info!("debug overlay {}", if self.debug { "enabled" } else { "disabled" });
            }
            Command::Emergency => {
                self.emergency = !self.emergency;
                log::info!("emergency mode {}", if self.emergency { "on" } else { "off" });
            }
            Command::Capture => match self.mode {
                LoopMode::Collect(_) => self.capture_requested = true,
                LoopMode::Recognize => log::debug!("capture ignored outside collection"),
            },
            Command::NextSign | Command::PrevSign => {
                if let LoopMode::Collect(session) = &mut self.mode {
                    if command == Command::NextSign {
                        session.next_sign();
                    } else {
                        session.prev_sign();
                    }
                    self.last_capture = None;
                }
            }
        }
        true
    }

    /// One iteration. Camera trouble is reported in the snapshot; other
    /// failures are returned.
    pub fn step(&mut self) -> Result<TesterSnapshot> {
        if self.camera.is_open() {
            if let Err(err) = self.camera.check_timeout() {
                log::error!("camera lost: {err}");
                self.enter_emergency();
            }
        }
        let raw = match self.camera.capture() {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("{err}");
                if matches!(err, CaptureError::Unavailable(_)) {
                    self.enter_emergency();
                }
                let banner = if self.emergency { Banner::Emergency } else { Banner::CameraError };
                return Ok(TesterSnapshot::blank(banner, self.fps()));
            }
        };
        self.frames += 1;
        let frame = raw.mirrored();

        let mut snapshot = if self.emergency {
            TesterSnapshot {
                status: "Emergency mode".into(),
                banner: Some(Banner::Emergency),
                ..self.plain(frame)
            }
        } else if matches!(self.mode, LoopMode::Collect(_)) {
            self.collect_step(frame)?
        } else {
            let outcome = self.recognizer.process(&frame);
            self.recognition_snapshot(frame, outcome)
        };

        if self.error.as_ref().is_some_and(|(since, _)| since.elapsed() >= ERROR_DISPLAY) {
            self.error = None;
        }
        if let Some((_, message)) = &self.error {
            snapshot.banner.get_or_insert_with(|| Banner::Error(message.clone()));
        }
        if self.debug {
            snapshot.debug.extend([
                format!("camera: {:?}", self.camera.active_index()),
                format!("read errors: {}", self.camera.consecutive_errors()),
                format!("history: {}", self.recognizer.history_len()),
            ]);
        }
        Ok(snapshot)
    }

    fn enter_emergency(&mut self) {
        if !self.emergency {
            log::warn!("no camera available, switching to emergency mode");
            self.emergency = true;
        }
    }

    fn plain(&self, frame: Frame) -> TesterSnapshot {
        TesterSnapshot {
            frame,
            status: String::new(),
            confidence: 0.0,
            confident: false,
            hand_detected: false,
            fps: self.fps(),
            banner: None,
            debug: Vec::new(),
            collect: None,
        }
    }

    fn recognition_snapshot(&self, mut frame: Frame, outcome: FrameOutcome) -> TesterSnapshot {
        let threshold = self.display_threshold;
        let (status, confident, show_bar) = match &outcome.status {
            RecognitionStatus::Sign { label } if outcome.confidence >= threshold => (label.clone(), true, true),
            RecognitionStatus::Sign { .. } => (
                format!("Low confidence: {:.0}%", outcome.confidence * 100.0),
                false,
                true,
            ),
            RecognitionStatus::NoHand { held: Some(label) } if outcome.confidence >= threshold => {
                (label.clone(), true, true)
            }
            other => (other.to_string(), false, false),
        };

        annotate(&mut frame, &outcome.hands);
        {
            let mut canvas = Canvas::new(&mut frame);
            draw_guide_box(&mut canvas);
            if show_bar {
                draw_confidence_bar(&mut canvas, outcome.confidence, confident);
            }
        }

        let mut snapshot = TesterSnapshot {
            status,
            confidence: outcome.confidence,
            confident,
            hand_detected: outcome.hand_detected(),
            ..self.plain(frame)
        };
        if self.debug {
            snapshot.debug.extend([
                format!("hands: {}", outcome.hands.len()),
                format!("raw confidence: {:.2}", outcome.raw_confidence),
                format!("status: {:?}", outcome.status),
            ]);
        }
        snapshot
    }

    fn collect_step(&mut self, mut frame: Frame) -> Result<TesterSnapshot> {
        let LoopMode::Collect(session) = &mut self.mode else {
            return Ok(self.plain(frame));
        };
        let hands = match session.mode() {
            CollectMode::Landmarks => self.recognizer.detect(&frame),
            CollectMode::Raw => Vec::new(),
        };
        if mem::take(&mut self.capture_requested) {
            let sign = session.current_sign().to_string();
            self.last_capture = Some(match session.capture(&frame, &hands)? {
                CaptureResult::Saved { index, .. } => format!("Saved {sign} #{index:04}"),
                CaptureResult::NoHand => "No hand detected - not saved".to_string(),
                CaptureResult::TargetReached => format!("Target reached for {sign}"),
            });
        }

        let progress = session.status_line();
        let crop = session.crop_size();
        let raw_mode = session.mode() == CollectMode::Raw;
        annotate(&mut frame, &hands);
        {
            let mut canvas = Canvas::new(&mut frame);
            if raw_mode {
                let [x1, y1, x2, y2] = centered_square(canvas.width(), canvas.height(), crop);
                canvas.rect([x1 as f32, y1 as f32, x2 as f32, y2 as f32], GUIDE_COLOR, 2);
            } else {
                draw_guide_box(&mut canvas);
            }
        }
        let hand_detected = !hands.is_empty();
        Ok(TesterSnapshot {
            status: progress.clone(),
            hand_detected,
            collect: Some((progress, self.last_capture.clone())),
            ..self.plain(frame)
        })
    }

    /// Runs until `Quit` arrives or the receiving side hangs up.
    pub fn run(mut self, commands: Receiver<Command>, snapshots: Sender<TesterSnapshot>) {
        log::info!("tester loop started");
        loop {
            loop {
                match commands.try_recv() {
                    Ok(command) => {
                        if !self.apply(command) {
                            log::info!("tester loop stopped");
                            return;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        log::info!("command channel closed, stopping tester loop");
                        return;
                    }
                }
            }

            let snapshot = match self.step() {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    log::error!("unexpected error in tester loop: {err:?}");
                    let message = format!("{err:#}");
                    self.error = Some((Instant::now(), message.clone()));
                    TesterSnapshot::blank(Banner::Error(message), self.fps())
                }
            };
            let pause = !self.camera.is_open();
            match snapshots.try_send(snapshot) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => {
                    log::info!("display closed, stopping tester loop");
                    return;
                }
            }
            if pause {
                thread::sleep(self.reconnect_pause);
            }
        }
    }
}

fn annotate(frame: &mut Frame, hands: &[HandLandmarks]) {
    let (width, height) = (frame.width, frame.height);
    let mut canvas = Canvas::new(frame);
    for hand in hands {
        draw_hand(&mut canvas, &hand.pixel_points(width, height));
    }
}

/// Builds the loop on its own thread; camera handles stay on the thread that
/// opened them.
pub fn spawn_worker<F>(build: F, commands: Receiver<Command>, snapshots: Sender<TesterSnapshot>) -> thread::JoinHandle<()>
where
    F: FnOnce() -> TesterLoop + Send + 'static,
{
    thread::spawn(move || {
        let tester = build();
        tester.run(commands, snapshots);
    })
}

/// Collection session rooted at the configured dataset directory.
pub fn collect_mode(config: &AppConfig, mode: CollectMode) -> Result<LoopMode> {
    let session = CollectSession::start(
        DatasetLayout::new(&config.dataset.root),
        mode,
        config.dataset.signs.clone(),
        config.dataset.target_per_sign,
        config.dataset.crop_size,
    )?;
    Ok(LoopMode::Collect(session))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::ClassMapping;
    use crate::pipeline::camera::{CameraProvider, FrameSource};
    use crate::pipeline::classifier::{LoadedModel, SignClassifier};
    use crate::pipeline::landmarks::HandTracker;
    use crate::recovery::RetryPolicy;
    use crate::smoothing::SmootherConfig;
    use crate::types::{Handedness, LandmarkVector, NUM_LANDMARKS};
    use anyhow::anyhow;
    use crossbeam_channel::{bounded, unbounded};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Camera {
        works: bool,
    }

    struct Source;

    impl FrameSource for Source {
        fn read(&mut self) -> Result<Frame> {
            Ok(Frame::blank(64, 48))
        }
        fn label(&self) -> String {
            "test".into()
        }
    }

    impl CameraProvider for Camera {
        fn open(&mut self, index: u32) -> Result<Box<dyn FrameSource>> {
            if self.works { Ok(Box::new(Source)) } else { Err(anyhow!("no camera {index}")) }
        }
    }

    struct OneHand;

    impl HandTracker for OneHand {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<HandLandmarks>> {
            Ok(vec![HandLandmarks {
                points: [[0.5, 0.5, 0.0]; NUM_LANDMARKS],
                score: 0.9,
                handedness: Handedness::Right,
            }])
        }
    }

    struct Hello;

    impl SignClassifier for Hello {
        fn predict(&mut self, _input: &LandmarkVector) -> Result<Vec<f32>> {
            Ok(vec![0.02, 0.9, 0.02, 0.02, 0.02, 0.02])
        }
    }

    /// Never opens; counts the attempts.
    struct Counting {
        opens: Arc<AtomicUsize>,
    }

    impl CameraProvider for Counting {
        fn open(&mut self, index: u32) -> Result<Box<dyn FrameSource>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("no camera {index}"))
        }
    }

    /// Opens fine, then every read after the test frame and the first real one fails.
    struct Flaky;

    struct FlakySource {
        reads: usize,
    }

    impl FrameSource for FlakySource {
        fn read(&mut self) -> Result<Frame> {
            self.reads += 1;
            if self.reads <= 2 { Ok(Frame::blank(64, 48)) } else { Err(anyhow!("usb hiccup")) }
        }
        fn label(&self) -> String {
            "flaky".into()
        }
    }

    impl CameraProvider for Flaky {
        fn open(&mut self, _index: u32) -> Result<Box<dyn FrameSource>> {
            Ok(Box::new(FlakySource { reads: 0 }))
        }
    }

    fn settings(policy: RetryPolicy) -> CaptureSettings {
        CaptureSettings {
            indices: vec![0, 1],
            policy,
            max_consecutive_errors: 10,
            frame_timeout: Duration::from_secs(5),
        }
    }

    fn camera(works: bool) -> SupervisedCamera {
        SupervisedCamera::new(Box::new(Camera { works }), settings(RetryPolicy::once()))
    }

    fn recognizer(with_model: bool) -> Recognizer {
        let model = with_model.then(|| LoadedModel {
            classifier: Box::new(Hello),
            path: PathBuf::from("hello.onnx"),
            mapping: ClassMapping::default(),
        });
        Recognizer::new(Some(Box::new(OneHand)), model, SmootherConfig::desktop(), None)
    }

    fn tester(camera_works: bool, with_model: bool) -> TesterLoop {
        TesterLoop::new(camera(camera_works), recognizer(with_model), LoopMode::Recognize, 0.7, Duration::ZERO)
    }

    #[test]
    fn recognizes_and_annotates() {
        let mut tester = tester(true, true);
        assert!(!tester.is_emergency());
        let snapshot = tester.step().unwrap();
        assert_eq!(snapshot.status, "hello");
        assert!(snapshot.confident);
        assert!(snapshot.hand_detected);
        assert!(snapshot.banner.is_none());
        assert_eq!((snapshot.frame.width, snapshot.frame.height), (64, 48));
        assert_ne!(snapshot.frame.rgba, Frame::blank(64, 48).rgba);
    }

    #[test]
    fn exhausted_camera_enters_emergency_mode() {
        let mut tester = tester(false, true);
        assert!(!tester.is_emergency());
        for _ in 0..3 {
            let snapshot = tester.step().unwrap();
            assert_eq!(snapshot.banner, Some(Banner::Emergency));
            assert_eq!(snapshot.status, "EMERGENCY MODE - Camera Working");
        }
        assert!(tester.is_emergency());
    }

    #[test]
    fn read_failures_show_reconnect_banner() {
        let mut tester = TesterLoop::new(
            SupervisedCamera::new(Box::new(Flaky), settings(RetryPolicy::once())),
            recognizer(true),
            LoopMode::Recognize,
            0.7,
            Duration::ZERO,
        );
        assert_eq!(tester.step().unwrap().status, "hello");
        let snapshot = tester.step().unwrap();
        assert_eq!(snapshot.banner, Some(Banner::CameraError));
        assert_eq!(snapshot.status, "Camera Error - Attempting to reconnect...");
        assert!(!tester.is_emergency());
    }

    #[test]
    fn dead_camera_does_not_stall_the_loop() {
        let opens = Arc::new(AtomicUsize::new(0));
        let provider = Counting { opens: opens.clone() };
        let policy = RetryPolicy::fixed(3, Duration::from_millis(200));
        let mut tester = TesterLoop::new(
            SupervisedCamera::new(Box::new(provider), settings(policy)),
            recognizer(true),
            LoopMode::Recognize,
            0.7,
            Duration::ZERO,
        );
        tester.step().unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 6);

        let started = Instant::now();
        tester.step().unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(opens.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn missing_model_means_emergency_mode() {
        let mut tester = tester(true, false);
        assert!(tester.is_emergency());
        let snapshot = tester.step().unwrap();
        assert_eq!(snapshot.banner, Some(Banner::Emergency));
        assert_eq!(
            Banner::Emergency.lines()[..2],
            ["EMERGENCY MODE - Camera Working".to_string(), "ASL Translation Not Available".to_string()]
        );
        assert!(tester.apply(Command::Emergency));
        assert!(!tester.is_emergency());
    }

    #[test]
    fn commands_update_state() {
        let mut tester = tester(true, true);
        for _ in 0..3 {
            tester.step().unwrap();
        }
        assert_eq!(tester.recognizer.history_len(), 3);
        assert!(tester.apply(Command::ClearHistory));
        assert_eq!(tester.recognizer.history_len(), 0);
        assert!(tester.apply(Command::ToggleDebug));
        assert!(!tester.step().unwrap().debug.is_empty());
        assert!(!tester.apply(Command::Quit));
    }

    #[test]
    fn run_stops_on_quit_and_publishes_snapshots() {
        let (cmd_tx, cmd_rx) = unbounded();
        let (snap_tx, snap_rx) = bounded(1);
        let handle = spawn_worker(|| tester(true, true), cmd_rx, snap_tx);
        let first = snap_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.status, "hello");
        cmd_tx.send(Command::Quit).unwrap();
        while snap_rx.recv_timeout(Duration::from_millis(50)).is_ok() {}
        handle.join().unwrap();
    }

    #[test]
    fn collection_saves_on_capture() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DatasetLayout::new(dir.path());
        let session = CollectSession::start(layout.clone(), CollectMode::Raw, vec!["yes".into()], 10, 32).unwrap();
        let mut tester = TesterLoop::new(camera(true), recognizer(false), LoopMode::Collect(session), 0.7, Duration::ZERO);
        assert!(!tester.is_emergency());
        tester.apply(Command::Capture);
        let snapshot = tester.step().unwrap();
        let (progress, last) = snapshot.collect.unwrap();
        assert_eq!(progress, "Sign: yes | Images: 1/10");
        assert_eq!(last.as_deref(), Some("Saved yes #0000"));
        assert!(layout.raw_image_path("yes", 0).is_file());
    }
}
