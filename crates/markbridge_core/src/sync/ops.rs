//! Ops surface: the operations the UI and runtime invoke.
//!
//! A thin facade over the engine: config get/set, manual sync trigger,
//! debug timeline access, session summary, and the legacy HTTP push.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{BridgeError, Result};

use super::config::BridgeSettings;
use super::engine::SyncEngine;
use super::reverse_http::{push_reverse_batch, ReverseBatch};
use super::state::SessionSummary;
use super::timeline::TimelineEntry;

/// One status snapshot for display.
#[derive(Debug, Clone)]
pub struct StatusReport {
    /// The persisted session summary.
    pub session: SessionSummary,
    /// Depth of the durable reverse queue.
    pub reverse_queue_len: usize,
    /// Whether auto-sync is on.
    pub auto_sync: bool,
}

/// Result of a legacy HTTP push.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Nothing queued.
    Empty,
    /// The batch was posted and its acks reconciled.
    Acked {
        /// Events sent.
        sent: usize,
        /// Results with status `applied`.
        applied: usize,
    },
}

/// The message surface offered to the CLI and embedders.
pub struct Bridge {
    engine: Arc<SyncEngine>,
    http: reqwest::Client,
}

impl Bridge {
    /// Wrap an engine.
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            http: reqwest::Client::new(),
        }
    }

    /// The underlying engine (for the connection loop).
    pub fn engine(&self) -> Arc<SyncEngine> {
        Arc::clone(&self.engine)
    }

    /// Read the bridge settings.
    pub async fn settings(&self) -> BridgeSettings {
        self.engine.settings().await
    }

    /// Replace the bridge settings.
    pub async fn update_settings(&self, settings: BridgeSettings) -> Result<BridgeSettings> {
        self.engine.update_settings(settings).await
    }

    /// Trigger a manual sync (resolves to "ensure connected").
    pub async fn trigger_sync(&self) -> Result<()> {
        self.engine
            .record_timeline("info", "manual_sync", "requested")
            .await?;
        self.engine.request_sync();
        Ok(())
    }

    /// Read the debug timeline.
    pub async fn debug_events(&self) -> Vec<TimelineEntry> {
        self.engine.timeline_entries().await
    }

    /// Clear the debug timeline.
    pub async fn clear_debug_events(&self) -> Result<()> {
        self.engine.clear_timeline().await
    }

    /// Read the persisted session summary.
    pub async fn session_summary(&self) -> SessionSummary {
        self.engine.session_summary().await
    }

    /// Assemble a status snapshot.
    pub async fn status(&self) -> StatusReport {
        StatusReport {
            session: self.engine.session_summary().await,
            reverse_queue_len: self.engine.reverse_queue_len().await,
            auto_sync: self.engine.settings().await.auto_sync,
        }
    }

    /// Push the coalesced reverse queue over the legacy HTTP endpoint.
    ///
    /// A successful round reconciles the returned acks and sweeps the
    /// coalesced-away predecessors; a failed round records a retry.
    pub async fn push_reverse_http(&self) -> Result<PushOutcome> {
        let settings = self.engine.settings().await;
        let profile = settings
            .resolve_active()
            .filter(|p| p.enabled)
            .cloned()
            .ok_or_else(|| BridgeError::Config("no enabled bridge profile".to_string()))?;

        let (coalesced, snapshot_ids) = self.engine.coalesced_snapshot().await;
        if coalesced.is_empty() {
            return Ok(PushOutcome::Empty);
        }
        let batch = ReverseBatch::new(
            Uuid::new_v4().to_string(),
            coalesced.iter().map(|item| item.event.clone()).collect(),
        );

        match push_reverse_batch(&self.http, &profile.url, &profile.token, &batch).await {
            Ok(response) => {
                let applied = response
                    .results
                    .iter()
                    .filter(|r| r.status == "applied")
                    .count();
                self.engine.reconcile_acks(&response).await?;
                self.engine
                    .sweep_after_send(&coalesced, &snapshot_ids)
                    .await?;
                Ok(PushOutcome::Acked {
                    sent: batch.events.len(),
                    applied,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                self.engine.mark_flush_failure(&coalesced, &reason).await?;
                Err(e)
            }
        }
    }
}
