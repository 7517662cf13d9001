use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use thiserror::Error;

use crate::config::CameraConfig;
use crate::error::ResourceError;
use crate::recovery::{RetryPolicy, first_success, retry};
use crate::types::Frame;

/// An opened camera. Native handles are usually tied to the thread that
/// opened them, so sources are not required to be `Send`.
pub trait FrameSource {
    fn read(&mut self) -> Result<Frame>;
    fn label(&self) -> String;
}

/// Opens cameras by index. Providers move into the capture thread.
pub trait CameraProvider: Send {
    fn open(&mut self, index: u32) -> Result<Box<dyn FrameSource>>;

    fn list(&self) -> Result<Vec<CameraDevice>> {
        Ok(Vec::new())
    }
}

#[derive(Clone, Debug)]
pub struct CameraDevice {
    pub index: u32,
    pub label: String,
}

/// Walks the candidate indices; each index gets `policy.attempts` tries and
/// only counts as acquired once a test frame has been read.
pub fn acquire_camera(
    provider: &mut dyn CameraProvider,
    indices: &[u32],
    policy: &RetryPolicy,
) -> Result<(Box<dyn FrameSource>, u32), ResourceError> {
    first_success(indices, "camera", |index| {
        let source = retry(policy, &format!("camera {index}"), |_| {
            let mut source = provider.open(*index)?;
            source
                .read()
                .with_context(|| format!("camera {index} opened but returned no test frame"))?;
            Ok(source)
        })?;
        Ok(source)
    })
}

#[derive(Clone, Debug)]
pub struct CaptureSettings {
    pub indices: Vec<u32>,
    pub policy: RetryPolicy,
    pub max_consecutive_errors: u32,
    pub frame_timeout: Duration,
}

impl From<&CameraConfig> for CaptureSettings {
    fn from(config: &CameraConfig) -> Self {
        Self {
            indices: config.indices.clone(),
            policy: config.retry_policy(),
            max_consecutive_errors: config.max_consecutive_errors.max(1),
            frame_timeout: config.frame_timeout(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera read failed ({consecutive} consecutive failures): {reason}")]
    ReadFailed { consecutive: u32, reason: String },
    #[error("camera unavailable: {0}")]
    Unavailable(#[from] ResourceError),
}

/// Camera handle that re-acquires the device after repeated read failures or
/// when frames stop arriving.
pub struct SupervisedCamera {
    provider: Box<dyn CameraProvider>,
    source: Option<Box<dyn FrameSource>>,
    active_index: Option<u32>,
    settings: CaptureSettings,
    consecutive_errors: u32,
    last_success: Instant,
    exhausted: bool,
}

impl SupervisedCamera {
    pub fn new(provider: Box<dyn CameraProvider>, settings: CaptureSettings) -> Self {
        Self {
            provider,
            source: None,
            active_index: None,
            settings,
            consecutive_errors: 0,
            last_success: Instant::now(),
            exhausted: false,
        }
    }

    /// Full acquisition with the configured policy, as on start-up or an
    /// explicit restart.
    pub fn acquire(&mut self) -> Result<u32, ResourceError> {
        let policy = self.settings.policy;
        let acquired = self.acquire_with(&policy);
        self.exhausted = acquired.is_err();
        acquired
    }

    /// Once the full policy has been exhausted, later attempts make a single
    /// pass over the indices so the caller's loop stays responsive.
    fn reacquire(&mut self) -> Result<u32, ResourceError> {
        if !self.exhausted {
            return self.acquire();
        }
        let acquired = self.acquire_with(&RetryPolicy::once());
        if acquired.is_ok() {
            log::info!("camera recovered");
            self.exhausted = false;
        }
        acquired
    }

    /// True after the retry policy failed on every candidate index.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn acquire_with(&mut self, policy: &RetryPolicy) -> Result<u32, ResourceError> {
        self.release();
        let (source, index) = acquire_camera(self.provider.as_mut(), &self.settings.indices, policy)?;
        log::info!("camera {index} ready: {}", source.label());
        self.source = Some(source);
        self.active_index = Some(index);
        self.mark_success(Instant::now());
        Ok(index)
    }

    pub fn release(&mut self) {
        if self.source.take().is_some() {
            log::info!("released camera {:?}", self.active_index);
        }
        self.active_index = None;
    }

    pub fn is_open(&self) -> bool {
        self.source.is_some()
    }

    pub fn active_index(&self) -> Option<u32> {
        self.active_index
    }

    pub fn label(&self) -> Option<String> {
        self.source.as_ref().map(|s| s.label())
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn list_devices(&self) -> Result<Vec<CameraDevice>> {
        self.provider.list()
    }

    pub fn capture(&mut self) -> Result<Frame, CaptureError> {
        let Some(source) = self.source.as_mut() else {
            self.reacquire()?;
            return self.read_once();
        };

        match source.read() {
            Ok(frame) => {
                self.mark_success(Instant::now());
                Ok(frame)
            }
            Err(err) => {
                self.consecutive_errors += 1;
                log::warn!(
                    "frame read failed ({}/{}): {err:?}",
                    self.consecutive_errors,
                    self.settings.max_consecutive_errors
                );
                if self.consecutive_errors >= self.settings.max_consecutive_errors {
                    log::error!("too many consecutive camera errors, re-acquiring");
                    self.reacquire()?;
                    return self.read_once();
                }
                Err(CaptureError::ReadFailed {
                    consecutive: self.consecutive_errors,
                    reason: format!("{err:#}"),
                })
            }
        }
    }

    /// Re-acquires the camera when no frame arrived within the timeout.
    /// Returns whether a re-acquisition happened.
    pub fn check_timeout(&mut self) -> Result<bool, ResourceError> {
        self.check_timeout_at(Instant::now())
    }

    pub fn check_timeout_at(&mut self, now: Instant) -> Result<bool, ResourceError> {
        let silent_for = now.saturating_duration_since(self.last_success);
        if silent_for <= self.settings.frame_timeout {
            return Ok(false);
        }
        log::warn!("no camera frame for {silent_for:?}, re-acquiring");
        self.reacquire()?;
        Ok(true)
    }

    fn read_once(&mut self) -> Result<Frame, CaptureError> {
        let Some(source) = self.source.as_mut() else {
            return Err(CaptureError::ReadFailed {
                consecutive: self.consecutive_errors,
                reason: "camera not open".to_string(),
            });
        };
        match source.read() {
            Ok(frame) => {
                self.mark_success(Instant::now());
                Ok(frame)
            }
            Err(err) => {
                self.consecutive_errors += 1;
                Err(CaptureError::ReadFailed {
                    consecutive: self.consecutive_errors,
                    reason: format!("{err:#}"),
                })
            }
        }
    }

    fn mark_success(&mut self, now: Instant) {
        self.consecutive_errors = 0;
        self.last_success = now;
    }
}

/// Stand-in used when the crate is built without a camera backend.
pub struct NoCameraProvider;

impl CameraProvider for NoCameraProvider {
    fn open(&mut self, index: u32) -> Result<Box<dyn FrameSource>> {
        anyhow::bail!("camera {index}: built without camera support")
    }
}

pub fn default_provider() -> Box<dyn CameraProvider> {
    #[cfg(feature = "camera-nokhwa")]
    {
        Box::new(native::NokhwaProvider)
    }
    #[cfg(not(feature = "camera-nokhwa"))]
    {
        Box::new(NoCameraProvider)
    }
}

#[cfg(feature = "camera-nokhwa")]
pub use native::NokhwaProvider;

#[cfg(feature = "camera-nokhwa")]
mod native {
    use anyhow::{Result, anyhow};
    use nokhwa::{
        Camera,
        pixel_format::RgbFormat,
        query,
        utils::{ApiBackend, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType},
    };

    use super::{CameraDevice, CameraProvider, FrameSource};
    use crate::pipeline::decode;
    use crate::types::Frame;

    // macOS built-in cameras often reject YUYV even though Nokhwa reports it.
    const PREFERRED_PIXEL_FORMATS: &[FrameFormat] = &[
        FrameFormat::RAWRGB,
        FrameFormat::RAWBGR,
        FrameFormat::GRAY,
        FrameFormat::YUYV,
        FrameFormat::NV12,
        FrameFormat::MJPEG,
    ];

    fn requested_formats() -> [RequestedFormat<'static>; 3] {
        [
            RequestedFormat::with_formats(
                RequestedFormatType::AbsoluteHighestFrameRate,
                PREFERRED_PIXEL_FORMATS,
            ),
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
        ]
    }

    pub struct NokhwaProvider;

    impl CameraProvider for NokhwaProvider {
        fn open(&mut self, index: u32) -> Result<Box<dyn FrameSource>> {
            let mut last_err = None;
            for requested in requested_formats() {
                match Camera::new(CameraIndex::Index(index), requested) {
                    Ok(mut camera) => match camera.open_stream() {
                        Ok(()) => {
                            let label = camera.info().human_name();
                            return Ok(Box::new(NokhwaSource { camera, label }));
                        }
                        Err(err) => last_err = Some(err.into()),
                    },
                    Err(err) => last_err = Some(err.into()),
                }
            }
            Err(last_err.unwrap_or_else(|| anyhow!("failed to open camera {index} with any supported format")))
        }

        fn list(&self) -> Result<Vec<CameraDevice>> {
            let cameras = query(ApiBackend::Auto)?;
            Ok(cameras
                .into_iter()
                .filter_map(|info| match info.index() {
                    CameraIndex::Index(index) => Some(CameraDevice {
                        index: *index,
                        label: info.human_name(),
                    }),
                    CameraIndex::String(_) => None,
                })
                .collect())
        }
    }

    struct NokhwaSource {
        camera: Camera,
        label: String,
    }

    impl FrameSource for NokhwaSource {
        fn read(&mut self) -> Result<Frame> {
            let buffer = self.camera.frame()?;
            decode::convert_camera_frame(&buffer)
        }

        fn label(&self) -> String {
            self.label.clone()
        }
    }

    impl Drop for NokhwaSource {
        fn drop(&mut self) {
            if let Err(err) = self.camera.stop_stream() {
                log::warn!("failed to stop camera stream: {err:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Scripted camera: `opens` decides which indices can be opened, `reads`
    /// is the shared queue of read outcomes (true = frame).
    struct ScriptedProvider {
        working: Vec<u32>,
        reads: Arc<Mutex<VecDeque<bool>>>,
        opened: Arc<Mutex<Vec<u32>>>,
    }

    struct ScriptedSource {
        reads: Arc<Mutex<VecDeque<bool>>>,
    }

    impl FrameSource for ScriptedSource {
        fn read(&mut self) -> Result<Frame> {
            let ok = self.reads.lock().unwrap().pop_front().unwrap_or(true);
            if ok { Ok(Frame::blank(4, 4)) } else { Err(anyhow!("read failed")) }
        }

        fn label(&self) -> String {
            "scripted".into()
        }
    }

    impl CameraProvider for ScriptedProvider {
        fn open(&mut self, index: u32) -> Result<Box<dyn FrameSource>> {
            self.opened.lock().unwrap().push(index);
            if self.working.contains(&index) {
                Ok(Box::new(ScriptedSource { reads: self.reads.clone() }))
            } else {
                Err(anyhow!("no device {index}"))
            }
        }
    }

    fn settings(indices: Vec<u32>) -> CaptureSettings {
        CaptureSettings {
            indices,
            policy: RetryPolicy::fixed(2, Duration::ZERO),
            max_consecutive_errors: 3,
            frame_timeout: Duration::from_secs(5),
        }
    }

    fn camera(working: Vec<u32>, reads: Vec<bool>) -> (SupervisedCamera, Arc<Mutex<Vec<u32>>>) {
        let opened = Arc::new(Mutex::new(Vec::new()));
        let provider = ScriptedProvider {
            working,
            reads: Arc::new(Mutex::new(reads.into())),
            opened: opened.clone(),
        };
        (SupervisedCamera::new(Box::new(provider), settings(vec![0, 1, 2])), opened)
    }

    #[test]
    fn falls_through_to_first_working_index() {
        let (mut cam, opened) = camera(vec![2], vec![]);
        assert_eq!(cam.acquire().unwrap(), 2);
        assert_eq!(*opened.lock().unwrap(), vec![0, 0, 1, 1, 2]);
    }

    #[test]
    fn exhaustion_when_nothing_opens() {
        let (mut cam, _) = camera(vec![], vec![]);
        assert!(matches!(cam.acquire(), Err(ResourceError::Exhausted { .. })));
        assert!(!cam.is_open());
    }

    #[test]
    fn reacquires_after_consecutive_failures() {
        // test frame, then three failures, then the re-acquire test frame and a good read
        let (mut cam, opened) = camera(vec![0], vec![true, false, false, false, true, true]);
        cam.acquire().unwrap();
        assert!(matches!(cam.capture(), Err(CaptureError::ReadFailed { consecutive: 1, .. })));
        assert!(matches!(cam.capture(), Err(CaptureError::ReadFailed { consecutive: 2, .. })));
        assert!(cam.capture().is_ok());
        assert_eq!(cam.consecutive_errors(), 0);
        assert_eq!(opened.lock().unwrap().len(), 2);
    }

    #[test]
    fn success_resets_error_count() {
        let (mut cam, _) = camera(vec![0], vec![true, false, true]);
        cam.acquire().unwrap();
        assert!(cam.capture().is_err());
        assert!(cam.capture().is_ok());
        assert_eq!(cam.consecutive_errors(), 0);
    }

    #[test]
    fn frame_timeout_triggers_reacquire() {
        let (mut cam, opened) = camera(vec![1], vec![]);
        cam.acquire().unwrap();
        let now = Instant::now();
        assert!(!cam.check_timeout_at(now).unwrap());
        assert!(cam.check_timeout_at(now + Duration::from_secs(6)).unwrap());
        assert_eq!(opened.lock().unwrap().iter().filter(|i| **i == 1).count(), 2);
    }

    #[test]
    fn capture_opens_lazily() {
        let (mut cam, _) = camera(vec![0], vec![]);
        assert!(cam.capture().is_ok());
        assert_eq!(cam.active_index(), Some(0));
    }

    #[test]
    fn exhausted_camera_retries_with_a_single_pass() {
        let (mut cam, opened) = camera(vec![], vec![]);
        assert!(matches!(cam.capture(), Err(CaptureError::Unavailable(_))));
        assert!(cam.is_exhausted());
        assert_eq!(opened.lock().unwrap().len(), 6);

        assert!(cam.capture().is_err());
        assert_eq!(opened.lock().unwrap().len(), 9);
    }

    #[test]
    fn recovered_camera_clears_exhaustion() {
        let (mut cam, _) = camera(vec![2], vec![]);
        cam.exhausted = true;
        assert!(cam.capture().is_ok());
        assert!(!cam.is_exhausted());
        assert_eq!(cam.active_index(), Some(2));
    }
}
