//! Persistent bridge connection loop.
//!
//! `BridgeClient` owns the transport lifecycle: profile resolution,
//! connect, reconnection with exponential backoff, the heartbeat timer
//! and its watchdog, the in-process inbound/outbound queues, and the
//! periodic reverse-flush alarm. Protocol logic lives in
//! `BridgeSession`; durable semantics live in `SyncEngine`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bookmarks::{BookmarkEvent, BookmarkObserver};

use super::engine::{SessionStatusUpdate, SyncEngine};
use super::envelope::{Envelope, EnvelopeBody, EnvelopeMeta};
use super::reverse_queue::{FLUSH_ALARM_MS, FLUSH_DEBOUNCE_MS};
use super::session::{BridgeSession, SessionAction, SessionEvent};
use super::transport::{Transport, TransportConnector, WsMessage};

/// Heartbeat pings are sent at most this often, whatever was negotiated.
pub const HEARTBEAT_SEND_CAP_MS: u64 = 25_000;

/// Reconnect backoff: `min(30 s, 500 ms * 2^min(attempt, 6))`.
pub fn backoff_ms(attempt: u32) -> u64 {
    std::cmp::min(30_000, 500 * 2u64.pow(std::cmp::min(attempt, 6)))
}

/// Build an observer callback that forwards events into a channel.
pub fn bookmark_event_channel() -> (BookmarkObserver, mpsc::UnboundedReceiver<BookmarkEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let observer: BookmarkObserver = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    (observer, rx)
}

/// Drain observed bookmark events into the engine's capture handlers.
///
/// Runs until the channel closes or `running` clears.
pub async fn run_capture_pump(
    engine: Arc<SyncEngine>,
    mut events: mpsc::UnboundedReceiver<BookmarkEvent>,
    running: Arc<AtomicBool>,
) {
    while let Some(event) = events.recv().await {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = engine.on_bookmark_event(&event).await {
            log::error!("capture failed: {}", e);
        }
    }
}

enum SessionExit {
    Closed { code: Option<u16>, reason: String },
    Transport(String),
    Watchdog,
    Stopped,
}

/// Persistent connection manager for the bridge WebSocket.
pub struct BridgeClient<C: TransportConnector> {
    engine: Arc<SyncEngine>,
    connector: C,
    outbound: Mutex<VecDeque<Envelope>>,
}

impl<C: TransportConnector> BridgeClient<C> {
    /// Create a client around an engine and a connector.
    pub fn new(engine: Arc<SyncEngine>, connector: C) -> Self {
        Self {
            engine,
            connector,
            outbound: Mutex::new(VecDeque::new()),
        }
    }

    /// Run the connect/reconnect loop until `running` clears.
    pub async fn run_persistent(&self, running: Arc<AtomicBool>) {
        while running.load(Ordering::SeqCst) {
            let settings = self.engine.settings().await;
            let profile = match settings.resolve_active() {
                Some(profile) if profile.enabled => profile.clone(),
                _ => {
                    let _ = self
                        .engine
                        .update_session(SessionStatusUpdate::ProfileDisabled)
                        .await;
                    log::info!("no enabled bridge profile; waiting");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        _ = self.engine.sync_requested() => {}
                    }
                    continue;
                }
            };

            if !settings.auto_sync {
                // Manual mode: connect only when asked.
                self.engine.sync_requested().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
            }

            let attempt = self.engine.session_summary().await.reconnect_attempt;
            if attempt > 0 {
                let delay = backoff_ms(attempt);
                log::info!("reconnecting in {} ms (attempt {})", delay, attempt);
                // A manual sync request supersedes the reconnect timer.
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                    _ = self.engine.sync_requested() => {}
                }
                if !running.load(Ordering::SeqCst) {
                    break;
                }
            }

            let _ = self
                .engine
                .update_session(SessionStatusUpdate::Connecting {
                    client_id: &profile.client_id,
                    ws_url: &profile.ws_url,
                })
                .await;

            let session = BridgeSession::new(
                &profile.client_id,
                &Uuid::new_v4().to_string(),
                &profile.token,
            );

            let mut transport = match self.connector.connect(&profile.ws_url).await {
                Ok(transport) => transport,
                Err(e) => {
                    log::warn!("bridge connect failed: {}", e);
                    let _ = self
                        .engine
                        .update_session(SessionStatusUpdate::Disconnected {
                            reason: "constructor_error",
                            detail: &e.to_string(),
                        })
                        .await;
                    continue;
                }
            };

            let _ = self
                .engine
                .update_session(SessionStatusUpdate::Connected)
                .await;
            log::info!("bridge connected (session {})", session.session_id());

            let exit = self
                .run_session(&mut transport, &session, &profile.client_id, &running)
                .await;
            let _ = transport.close().await;

            match exit {
                SessionExit::Closed { code, reason } => {
                    let status = match code {
                        Some(code) => format!("close_{}", code),
                        None => "close".to_string(),
                    };
                    let _ = self
                        .engine
                        .update_session(SessionStatusUpdate::Disconnected {
                            reason: &status,
                            detail: &reason,
                        })
                        .await;
                }
                SessionExit::Transport(detail) => {
                    let _ = self
                        .engine
                        .update_session(SessionStatusUpdate::Disconnected {
                            reason: "transport_error",
                            detail: &detail,
                        })
                        .await;
                }
                SessionExit::Watchdog => {
                    let _ = self
                        .engine
                        .update_session(SessionStatusUpdate::Disconnected {
                            reason: "heartbeat_watchdog",
                            detail: "no frames within 2x heartbeat",
                        })
                        .await;
                }
                SessionExit::Stopped => break,
            }
        }
        log::info!("bridge connection loop exited");
    }

    /// Drive one open connection until it dies.
    async fn run_session(
        &self,
        transport: &mut C::Transport,
        session: &BridgeSession,
        client_id: &str,
        running: &Arc<AtomicBool>,
    ) -> SessionExit {
        let mut inbound: VecDeque<Envelope> = VecDeque::new();

        // Handshake, then anything a dead socket left behind.
        let actions = session.process(SessionEvent::Connected, Utc::now());
        self.execute_actions(actions, transport, &mut inbound, client_id)
            .await;
        self.drain_outbound(transport).await;
        self.publish_depths(&inbound).await;

        let heartbeat_ms = self.engine.session_summary().await.heartbeat_ms;
        let mut heartbeat = tokio::time::interval(Duration::from_millis(std::cmp::min(
            heartbeat_ms,
            HEARTBEAT_SEND_CAP_MS,
        )));
        heartbeat.tick().await; // consume the immediate tick
        let mut flush_alarm =
            tokio::time::interval(Duration::from_millis(FLUSH_ALARM_MS));
        flush_alarm.tick().await;
        let mut watchdog_ms = heartbeat_ms.saturating_mul(2);
        let mut last_frame = tokio::time::Instant::now();

        loop {
            if !running.load(Ordering::SeqCst) {
                return SessionExit::Stopped;
            }

            let mut negotiated: Option<u64> = None;
            tokio::select! {
                message = transport.recv() => {
                    match message {
                        Some(Ok(WsMessage::Text(text))) => {
                            last_frame = tokio::time::Instant::now();
                            let actions = session.process(SessionEvent::Frame(text), Utc::now());
                            negotiated = self
                                .execute_actions(actions, transport, &mut inbound, client_id)
                                .await;
                            self.drain_inbound(&mut inbound, transport, client_id).await;
                        }
                        Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                            last_frame = tokio::time::Instant::now();
                        }
                        Some(Ok(WsMessage::Close(code, reason))) => {
                            session.process(SessionEvent::Disconnected, Utc::now());
                            return SessionExit::Closed { code, reason };
                        }
                        Some(Err(e)) => return SessionExit::Transport(e.to_string()),
                        None => {
                            return SessionExit::Closed { code: None, reason: String::new() };
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if last_frame.elapsed() >= Duration::from_millis(watchdog_ms) {
                        log::warn!("no frames within watchdog window; dropping socket");
                        return SessionExit::Watchdog;
                    }
                    let ping = session.heartbeat_ping(Utc::now());
                    self.send_or_queue(transport, ping).await;
                }
                _ = flush_alarm.tick() => {
                    if let Err(e) = self.engine.flush_reverse(transport, client_id).await {
                        log::error!("reverse flush failed: {}", e);
                    }
                }
                _ = self.engine.flush_requested() => {
                    // Debounce so a burst of captures flushes once.
                    tokio::time::sleep(Duration::from_millis(FLUSH_DEBOUNCE_MS)).await;
                    if let Err(e) = self.engine.flush_reverse(transport, client_id).await {
                        log::error!("reverse flush failed: {}", e);
                    }
                }
                _ = self.engine.sync_requested() => {
                    // Already connected: "ensure" degenerates to a flush.
                    if let Err(e) = self.engine.flush_reverse(transport, client_id).await {
                        log::error!("reverse flush failed: {}", e);
                    }
                }
            }

            if let Some(ms) = negotiated {
                let send_every = std::cmp::min(ms, HEARTBEAT_SEND_CAP_MS);
                heartbeat = tokio::time::interval(Duration::from_millis(send_every));
                heartbeat.tick().await;
                watchdog_ms = ms.saturating_mul(2);
            }
            self.publish_depths(&inbound).await;
        }
    }

    /// Execute session actions; returns a freshly-negotiated heartbeat.
    async fn execute_actions(
        &self,
        actions: Vec<SessionAction>,
        transport: &mut C::Transport,
        inbound: &mut VecDeque<Envelope>,
        _client_id: &str,
    ) -> Option<u64> {
        let mut negotiated = None;
        for action in actions {
            match action {
                SessionAction::Send(env) => {
                    self.send_or_queue(transport, env).await;
                }
                SessionAction::HeartbeatNegotiated(ms) => {
                    let _ = self
                        .engine
                        .update_session(SessionStatusUpdate::Heartbeat(ms))
                        .await;
                    negotiated = Some(ms);
                }
                SessionAction::InboundAction(env) => {
                    inbound.push_back(env);
                }
                SessionAction::AckBatch(batch) => {
                    if let Err(e) = self.engine.reconcile_acks(&batch).await {
                        log::error!("ack reconciliation failed: {}", e);
                    }
                }
                SessionAction::Record {
                    level,
                    event,
                    summary,
                } => {
                    let _ = self.engine.record_timeline(level, event, &summary).await;
                }
            }
        }
        negotiated
    }

    /// Apply queued inbound actions and send their acks.
    async fn drain_inbound(
        &self,
        inbound: &mut VecDeque<Envelope>,
        transport: &mut C::Transport,
        client_id: &str,
    ) {
        while let Some(env) = inbound.pop_front() {
            self.publish_depths(inbound).await;
            let outcome = match self.engine.handle_inbound_action(&env).await {
                Ok(Some(outcome)) => outcome,
                Ok(None) => continue,
                Err(e) => {
                    log::error!("inbound apply failed: {}", e);
                    continue;
                }
            };
            let mut meta = EnvelopeMeta::fresh(client_id, Utc::now());
            meta.correlation_id = Some(env.meta.event_id.clone());
            let ack = Envelope {
                meta,
                body: EnvelopeBody::Ack {
                    correlation_id: env.meta.event_id.clone(),
                    status: outcome.status.to_ws(),
                    legacy_status: Some(outcome.status),
                    reason: outcome.reason.clone(),
                    resolved_path: None,
                    resolved_key: outcome.resolved_key.clone(),
                },
            };
            self.send_or_queue(transport, ack).await;
        }
    }

    /// Send an envelope, or park it on the outbound queue on failure.
    async fn send_or_queue(&self, transport: &mut C::Transport, env: Envelope) {
        if let Err(e) = transport.send_text(env.to_text()).await {
            log::debug!("send failed ({}); queueing {}", e, env.body.type_name());
            self.outbound.lock().unwrap().push_back(env);
        }
    }

    /// Flush the outbound queue onto a freshly-opened socket.
    async fn drain_outbound(&self, transport: &mut C::Transport) {
        loop {
            let Some(env) = self.outbound.lock().unwrap().pop_front() else {
                break;
            };
            if let Err(e) = transport.send_text(env.to_text()).await {
                log::debug!("outbound drain stalled: {}", e);
                self.outbound.lock().unwrap().push_front(env);
                break;
            }
        }
    }

    async fn publish_depths(&self, inbound: &VecDeque<Envelope>) {
        let outbound = self.outbound.lock().unwrap().len();
        let _ = self.engine.set_queue_depths(inbound.len(), outbound).await;
    }
}
