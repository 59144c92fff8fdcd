//! Envelope-level session protocol handler.
//!
//! `BridgeSession` encapsulates the wire protocol (handshake, envelope
//! validation and routing, heartbeat replies, ack bridging) without
//! owning the socket or any timer. The connection loop in `client.rs`
//! feeds events in and executes the returned actions, which keeps the
//! protocol testable with scripted frames.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::ack::{BatchAckResponse, BatchAckResult};
use super::envelope::{
    clamp_heartbeat, parse_envelope, ws_status_to_legacy_name, Envelope, EnvelopeBody,
    EnvelopeMeta,
};

/// Capabilities advertised in the handshake.
pub const CAPABILITIES: [&str; 3] = ["action", "ack", "heartbeat"];

#[derive(Debug, Clone, Copy, PartialEq)]
enum SessionState {
    /// Waiting for `Connected`.
    AwaitingConnect,
    /// Handshake sent, nothing negotiated yet.
    HandshakeSent,
    /// Handshake acknowledged.
    Established,
}

/// Events fed into the session by the connection loop.
#[derive(Debug)]
pub enum SessionEvent {
    /// The socket opened.
    Connected,
    /// A text frame arrived.
    Frame(String),
    /// The socket closed.
    Disconnected,
}

/// Actions for the connection loop to execute.
#[derive(Debug)]
pub enum SessionAction {
    /// Serialize and send an envelope (or queue it if the socket died).
    Send(Envelope),
    /// The bridge negotiated a heartbeat interval (already clamped).
    HeartbeatNegotiated(u64),
    /// A validated inbound `action` envelope for the engine.
    InboundAction(Envelope),
    /// An ack, bridged into a one-result legacy batch for the engine.
    AckBatch(BatchAckResponse),
    /// A debug-timeline record.
    Record {
        /// `debug`, `info`, or `warn`.
        level: &'static str,
        /// Event name.
        event: &'static str,
        /// One-line summary.
        summary: String,
    },
}

/// Wire-protocol state machine for one connection attempt.
pub struct BridgeSession {
    client_id: String,
    session_id: String,
    token: String,
    state: Mutex<SessionState>,
}

impl BridgeSession {
    /// Create a session for a fresh connection attempt.
    pub fn new(client_id: &str, session_id: &str, token: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            session_id: session_id.to_string(),
            token: token.to_string(),
            state: Mutex::new(SessionState::AwaitingConnect),
        }
    }

    /// This attempt's session id.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether the handshake has been acknowledged.
    pub fn is_established(&self) -> bool {
        *self.state.lock().unwrap() == SessionState::Established
    }

    /// Process an event and return the actions it produces.
    pub fn process(&self, event: SessionEvent, now: DateTime<Utc>) -> Vec<SessionAction> {
        match event {
            SessionEvent::Connected => self.handle_connected(now),
            SessionEvent::Frame(text) => self.handle_frame(&text, now),
            SessionEvent::Disconnected => {
                *self.state.lock().unwrap() = SessionState::AwaitingConnect;
                Vec::new()
            }
        }
    }

    /// Build a heartbeat ping envelope.
    pub fn heartbeat_ping(&self, now: DateTime<Utc>) -> Envelope {
        Envelope {
            meta: EnvelopeMeta::fresh(&self.client_id, now),
            body: EnvelopeBody::HeartbeatPing,
        }
    }

    fn handle_connected(&self, now: DateTime<Utc>) -> Vec<SessionAction> {
        *self.state.lock().unwrap() = SessionState::HandshakeSent;
        let handshake = Envelope {
            meta: EnvelopeMeta::fresh(&self.client_id, now),
            body: EnvelopeBody::Handshake {
                session_id: self.session_id.clone(),
                token: self.token.clone(),
                capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            },
        };
        vec![SessionAction::Send(handshake)]
    }

    fn handle_frame(&self, text: &str, now: DateTime<Utc>) -> Vec<SessionAction> {
        let value = match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => value,
            Err(_) => {
                return vec![SessionAction::Record {
                    level: "warn",
                    event: "ws_invalid_message",
                    summary: format!("undecodable frame ({} bytes)", text.len()),
                }];
            }
        };
        let env = match parse_envelope(&value) {
            Some(env) => env,
            None => {
                let kind = value
                    .get("type")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("?");
                return vec![SessionAction::Record {
                    level: "warn",
                    event: "ws_invalid_message",
                    summary: format!("rejected envelope type={}", kind),
                }];
            }
        };

        if matches!(env.body, EnvelopeBody::Action { .. }) {
            return vec![SessionAction::InboundAction(env)];
        }

        match &env.body {
            EnvelopeBody::HandshakeAck {
                accepted,
                heartbeat_ms,
                ..
            } => {
                let mut actions = Vec::new();
                if *accepted {
                    *self.state.lock().unwrap() = SessionState::Established;
                    actions.push(SessionAction::HeartbeatNegotiated(clamp_heartbeat(
                        *heartbeat_ms,
                    )));
                } else {
                    log::warn!("bridge refused handshake for session {}", self.session_id);
                    actions.push(SessionAction::Record {
                        level: "warn",
                        event: "ws_handshake_refused",
                        summary: format!("sessionId={}", self.session_id),
                    });
                }
                actions
            }
            EnvelopeBody::HeartbeatPing => {
                let pong = Envelope {
                    meta: EnvelopeMeta::fresh(&self.client_id, now),
                    body: EnvelopeBody::HeartbeatPong {
                        correlation_id: env.meta.event_id.clone(),
                    },
                };
                vec![SessionAction::Send(pong)]
            }
            EnvelopeBody::HeartbeatPong { .. } => Vec::new(),
            EnvelopeBody::Ack {
                correlation_id,
                status,
                legacy_status,
                reason,
                resolved_path,
                resolved_key,
            } => {
                let batch = BatchAckResponse {
                    batch_id: env
                        .meta
                        .idempotency_key
                        .clone()
                        .or_else(|| env.meta.correlation_id.clone())
                        .unwrap_or_else(|| "ws".to_string()),
                    results: vec![BatchAckResult {
                        event_id: correlation_id.clone(),
                        status: legacy_status
                            .map(|l| l.as_str().to_string())
                            .unwrap_or_else(|| ws_status_to_legacy_name(*status).to_string()),
                        reason: reason.clone(),
                        resolved_key: resolved_key.clone(),
                        resolved_path: resolved_path.clone(),
                    }],
                };
                vec![SessionAction::AckBatch(batch)]
            }
            EnvelopeBody::Error {
                code,
                message,
                retryable,
                ..
            } => {
                log::warn!("bridge error {} (retryable={}): {}", code, retryable, message);
                vec![SessionAction::Record {
                    level: "warn",
                    event: "ws_bridge_error",
                    summary: format!("code={} retryable={}", code, retryable),
                }]
            }
            EnvelopeBody::Action { .. } => unreachable!("handled above"),
            EnvelopeBody::Handshake { .. } => {
                log::debug!("ignoring peer handshake envelope");
                Vec::new()
            }
        }
    }
}
