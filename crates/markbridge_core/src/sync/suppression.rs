//! Echo suppression: apply-epoch plus cooldown window.
//!
//! While the bridge is mutating local bookmarks (the apply epoch) and
//! for a short tail afterwards (the cooldown), locally-observed
//! mutations are assumed to be echoes of the apply and are not captured.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Cooldown tail applied after every apply cycle, in milliseconds.
pub const COOLDOWN_MS: i64 = 3_000;

/// Persisted suppression window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SuppressionState {
    /// Whether an inbound apply cycle is currently running.
    pub apply_epoch: bool,
    /// When the current epoch started (ISO-8601), if one is open.
    pub epoch_started_at: Option<String>,
    /// Epoch-ms until which capture stays suppressed after an apply.
    pub cooldown_until: Option<i64>,
}

impl SuppressionState {
    /// Whether outbound capture is currently suppressed.
    pub fn is_suppressed(&self, now_ms: i64) -> bool {
        self.apply_epoch || self.cooldown_until.map(|t| t > now_ms).unwrap_or(false)
    }

    /// Open or close the apply epoch.
    ///
    /// Closing clears both the epoch timestamp and any cooldown; the
    /// apply cycle re-arms the cooldown explicitly on exit.
    pub fn set_apply_epoch(&mut self, on: bool, now: DateTime<Utc>) {
        self.apply_epoch = on;
        if on {
            self.epoch_started_at = Some(now.to_rfc3339_opts(SecondsFormat::Millis, true));
        } else {
            self.epoch_started_at = None;
            self.cooldown_until = None;
        }
    }

    /// Extend suppression for `ms` past `now_ms`.
    pub fn set_cooldown(&mut self, ms: i64, now_ms: i64) {
        self.cooldown_until = Some(now_ms + ms);
    }
}
