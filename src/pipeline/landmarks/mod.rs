mod ort;
pub mod palm;
pub mod preprocess;

use anyhow::{Context, Result};

pub use self::ort::OrtHandTracker;
use crate::config::TrackerConfig;
use crate::model_download::ensure_tracker_models;
use crate::recovery::{RetryPolicy, retry};
use crate::types::{Frame, HandLandmarks};

/// Finds hands in a frame. Results are ordered by detection score.
pub trait HandTracker: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<HandLandmarks>>;
}

const PROBE_SIZE: u32 = 100;

/// Builds a tracker and checks it on a blank probe frame, retrying per
/// `policy`. `None` means hand tracking stays disabled.
pub fn initialize_tracker<F>(policy: &RetryPolicy, mut build: F) -> Option<Box<dyn HandTracker>>
where
    F: FnMut() -> Result<Box<dyn HandTracker>>,
{
    let probe = Frame::blank(PROBE_SIZE, PROBE_SIZE);
    let result = retry(policy, "hand tracker", |_| {
        let mut tracker = build()?;
        tracker
            .detect(&probe)
            .context("tracker failed on probe frame")?;
        Ok(tracker)
    });
    match result {
        Ok(tracker) => Some(tracker),
        Err(err) => {
            log::error!("hand tracking disabled: {err}");
            None
        }
    }
}

/// Downloads missing tracker weights and starts the ONNX tracker.
pub fn start_ort_tracker(config: &TrackerConfig) -> Option<Box<dyn HandTracker>> {
    if config.auto_download {
        if let Err(err) = ensure_tracker_models(&config.palm_model, &config.handpose_model) {
            log::error!("failed to prepare hand tracking models: {err:?}");
        }
    }
    initialize_tracker(&config.retry_policy(), || {
        Ok(Box::new(OrtHandTracker::new(config)?) as Box<dyn HandTracker>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::time::Duration;

    struct ProbeTracker {
        healthy: bool,
    }

    impl HandTracker for ProbeTracker {
        fn detect(&mut self, frame: &Frame) -> Result<Vec<HandLandmarks>> {
            assert_eq!((frame.width, frame.height), (PROBE_SIZE, PROBE_SIZE));
            if self.healthy { Ok(Vec::new()) } else { Err(anyhow!("runtime error")) }
        }
    }

    #[test]
    fn retries_until_probe_passes() {
        let mut builds = 0;
        let tracker = initialize_tracker(&RetryPolicy::fixed(3, Duration::ZERO), || {
            builds += 1;
            Ok(Box::new(ProbeTracker { healthy: builds == 3 }) as Box<dyn HandTracker>)
        });
        assert!(tracker.is_some());
        assert_eq!(builds, 3);
    }

    #[test]
    fn gives_up_after_policy_is_exhausted() {
        let mut builds = 0;
        let tracker = initialize_tracker(&RetryPolicy::fixed(3, Duration::ZERO), || {
            builds += 1;
            Err(anyhow!("model missing"))
        });
        assert!(tracker.is_none());
        assert_eq!(builds, 3);
    }
}
