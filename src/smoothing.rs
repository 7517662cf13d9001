use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const MIN_WEB_FRAMES: usize = 3;
pub const MAX_WEB_FRAMES: usize = 15;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SmootherConfig {
    /// Maximum number of retained observations.
    pub capacity: usize,
    /// Number of most recent observations that take part in the vote.
    pub window: usize,
    /// Below this many observations the raw prediction passes through.
    pub min_history: usize,
    pub max_age: Duration,
    /// Confidence multiplier applied when the hand disappears.
    pub absent_decay: f32,
}

impl SmootherConfig {
    pub fn desktop() -> Self {
        Self {
            capacity: 15,
            window: 5,
            min_history: 3,
            max_age: Duration::from_secs(2),
            absent_decay: 0.9,
        }
    }

    /// Web clients pick the history size per request.
    pub fn web(frames: usize) -> Self {
        let capacity = frames.clamp(MIN_WEB_FRAMES, MAX_WEB_FRAMES);
        Self {
            capacity,
            window: capacity,
            ..Self::desktop()
        }
    }
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self::desktop()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Smoothed<L> {
    pub label: Option<L>,
    pub confidence: f32,
}

impl<L> Smoothed<L> {
    pub fn absent() -> Self {
        Self {
            label: None,
            confidence: 0.0,
        }
    }
}

#[derive(Clone, Debug)]
struct Entry<L> {
    label: L,
    confidence: f32,
    at: Instant,
}

/// Majority vote over recent predictions, so a single misclassified frame does
/// not flip the displayed sign.
#[derive(Clone, Debug)]
pub struct TemporalSmoother<L> {
    config: SmootherConfig,
    history: VecDeque<Entry<L>>,
}

impl<L: Clone + PartialEq> TemporalSmoother<L> {
    pub fn new(config: SmootherConfig) -> Self {
        Self {
            config,
            history: VecDeque::with_capacity(config.capacity),
        }
    }

    pub fn config(&self) -> SmootherConfig {
        self.config
    }

    pub fn reconfigure(&mut self, config: SmootherConfig) {
        self.config = config;
        while self.history.len() > self.config.capacity {
            self.history.pop_front();
        }
    }

    pub fn observe(&mut self, label: Option<L>, confidence: f32) -> Smoothed<L> {
        self.observe_at(label, confidence, Instant::now())
    }

    pub fn observe_at(&mut self, label: Option<L>, confidence: f32, now: Instant) -> Smoothed<L> {
        let Some(label) = label else {
            return self.hold(now);
        };

        self.history.push_back(Entry {
            label: label.clone(),
            confidence,
            at: now,
        });
        self.evict_expired(now);
        while self.history.len() > self.config.capacity {
            self.history.pop_front();
        }

        if self.history.len() < self.config.min_history {
            return Smoothed {
                label: Some(label),
                confidence,
            };
        }
        self.vote()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.history.back().map(|e| e.at)
    }

    // Absent observation: replay the newest entry with decayed confidence.
    // History is left untouched so repeated absences do not compound.
    fn hold(&mut self, now: Instant) -> Smoothed<L> {
        let Some(last) = self.history.back() else {
            return Smoothed::absent();
        };
        if now.saturating_duration_since(last.at) > self.config.max_age {
            self.history.clear();
            return Smoothed::absent();
        }
        Smoothed {
            label: Some(last.label.clone()),
            confidence: last.confidence * self.config.absent_decay,
        }
    }

    fn evict_expired(&mut self, now: Instant) {
        let max_age = self.config.max_age;
        self.history
            .retain(|e| now.saturating_duration_since(e.at) <= max_age);
    }

    fn vote(&self) -> Smoothed<L> {
        let skip = self.history.len().saturating_sub(self.config.window.max(1));
        let window: Vec<&Entry<L>> = self.history.iter().skip(skip).collect();

        let mut tally: Vec<(&L, usize, f32)> = Vec::new();
        for entry in &window {
            match tally.iter_mut().find(|(l, _, _)| **l == entry.label) {
                Some(slot) => {
                    slot.1 += 1;
                    slot.2 += entry.confidence;
                }
                None => tally.push((&entry.label, 1, entry.confidence)),
            }
        }

        let mut best: Option<(&L, usize, f32)> = None;
        for candidate in tally {
            if best.is_none_or(|(_, count, _)| candidate.1 > count) {
                best = Some(candidate);
            }
        }

        match best {
            Some((label, count, sum)) => Smoothed {
                label: Some(label.clone()),
                confidence: sum / count as f32,
            },
            None => Smoothed::absent(),
        }
    }
}
