use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use super::history::round_to;

/// How a processed frame affects the error streak.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameHealth {
    Ok,
    Failed,
    /// Degraded but not the frame's fault (no model, bad landmarks).
    Neutral,
}

#[derive(Clone, Debug)]
pub struct PerformanceStats {
    start: SystemTime,
    total_frames: u64,
    average_ms: f64,
    last_ms: f64,
    consecutive_errors: u64,
    last_success: SystemTime,
}

/// Raw counters as served by `/api/performance`.
#[derive(Clone, Debug, Serialize)]
pub struct PerformanceSnapshot {
    pub total_frames_processed: u64,
    pub average_processing_time: f64,
    pub last_processing_time: f64,
    pub start_time: f64,
    pub consecutive_errors: u64,
    pub last_successful_frame: f64,
}

fn epoch_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

impl Default for PerformanceStats {
    fn default() -> Self {
        let now = SystemTime::now();
        Self {
            start: now,
            total_frames: 0,
            average_ms: 0.0,
            last_ms: 0.0,
            consecutive_errors: 0,
            last_success: now,
        }
    }
}

impl PerformanceStats {
    pub fn record_frame(&mut self, elapsed_ms: f64, health: FrameHealth) {
        self.total_frames += 1;
        self.last_ms = elapsed_ms;
        self.average_ms += (elapsed_ms - self.average_ms) / self.total_frames as f64;
        match health {
            FrameHealth::Ok => {
                self.consecutive_errors = 0;
                self.last_success = SystemTime::now();
            }
            FrameHealth::Failed => self.consecutive_errors += 1,
            FrameHealth::Neutral => {}
        }
    }

    /// A request that failed before a frame could be processed.
    pub fn record_error(&mut self) {
        self.consecutive_errors += 1;
    }

    pub fn consecutive_errors(&self) -> u64 {
        self.consecutive_errors
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn average_ms(&self) -> f64 {
        self.average_ms
    }

    pub fn last_ms(&self) -> f64 {
        self.last_ms
    }

    pub fn uptime(&self) -> Duration {
        SystemTime::now().duration_since(self.start).unwrap_or_default()
    }

    pub fn since_last_success(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.last_success)
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        PerformanceSnapshot {
            total_frames_processed: self.total_frames,
            average_processing_time: self.average_ms,
            last_processing_time: self.last_ms,
            start_time: epoch_secs(self.start),
            consecutive_errors: self.consecutive_errors,
            last_successful_frame: epoch_secs(self.last_success),
        }
    }
}

pub fn fps_estimate(elapsed_ms: f64) -> f64 {
    if elapsed_ms > 0.0 {
        round_to((1000.0 / elapsed_ms) as f32, 1)
    } else {
        0.0
    }
}
