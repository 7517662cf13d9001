use std::collections::VecDeque;

use chrono::Local;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryEntry {
    /// Local wall-clock time, `HH:MM:SS`.
    pub timestamp: String,
    pub text: String,
    pub confidence: f64,
    pub raw_confidence: f64,
}

/// Confirmed translations, oldest first, bounded to `limit` entries.
#[derive(Debug)]
pub struct TranslationHistory {
    entries: VecDeque<HistoryEntry>,
    limit: usize,
}

pub(crate) fn round_to(value: f32, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value as f64 * factor).round() / factor
}

impl TranslationHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit.min(1024)),
            limit: limit.max(1),
        }
    }

    pub fn record(&mut self, text: &str, confidence: f32, raw_confidence: f32) {
        self.push(HistoryEntry {
            timestamp: Local::now().format("%H:%M:%S").to_string(),
            text: text.to_string(),
            confidence: round_to(confidence, 3),
            raw_confidence: round_to(raw_confidence, 3),
        });
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    /// The newest `count` entries, oldest first.
    pub fn recent(&self, count: usize) -> Vec<HistoryEntry> {
        let skip = self.entries.len().saturating_sub(count);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
