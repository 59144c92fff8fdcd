//! Bounded debug timeline for operator inspection.
//!
//! Keeps the last 200 events with a level and a one-line summary.
//! Token values and full URLs are never recorded here.

use std::collections::VecDeque;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of retained entries.
pub const TIMELINE_CAP: usize = 200;

/// One timeline entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    /// When the event was recorded (ISO-8601).
    pub at: String,
    /// `debug`, `info`, or `warn`.
    pub level: String,
    /// Machine-readable event name (e.g. `quarantine`).
    pub event: String,
    /// One-line human summary.
    pub summary: String,
}

/// Ring of recent debug events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DebugTimeline {
    entries: VecDeque<TimelineEntry>,
}

impl DebugTimeline {
    /// Create an empty timeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, evicting the oldest past the cap.
    pub fn record(
        &mut self,
        level: &str,
        event: &str,
        summary: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.entries.push_back(TimelineEntry {
            at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            level: level.to_string(),
            event: event.to_string(),
            summary: summary.into(),
        });
        while self.entries.len() > TIMELINE_CAP {
            self.entries.pop_front();
        }
    }

    /// All retained entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &TimelineEntry> {
        self.entries.iter()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the timeline is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Whether any entry matches the given event name.
    pub fn has_event(&self, event: &str) -> bool {
        self.entries.iter().any(|e| e.event == event)
    }
}
