//! Wire envelope codec.
//!
//! Every WebSocket frame is a JSON object carrying the shared header
//! fields plus variant fields keyed by `type`. The wire schema is
//! untyped, so parsing maps it onto a closed sum and rejects anything
//! that misses a required field or uses an unknown enum value. Parsing
//! never throws: a bad record yields `None` and the caller drops it.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Schema version stamped on outgoing envelopes.
pub const WIRE_SCHEMA_VERSION: &str = "1.0";

/// Lower clamp for the negotiated heartbeat interval.
pub const HEARTBEAT_MIN_MS: u64 = 1_000;
/// Upper clamp for the negotiated heartbeat interval.
pub const HEARTBEAT_MAX_MS: u64 = 120_000;

/// Clamp a proposed heartbeat interval into the allowed range.
pub fn clamp_heartbeat(ms: u64) -> u64 {
    ms.clamp(HEARTBEAT_MIN_MS, HEARTBEAT_MAX_MS)
}

/// Current ack vocabulary used on the WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// The bridge received the action but has not applied it yet.
    Received,
    /// The action was applied.
    Applied,
    /// The action was a duplicate of one already applied.
    Duplicate,
    /// The action was skipped (unmanaged or ambiguous target).
    Skipped,
    /// The action was rejected as invalid.
    Rejected,
}

impl AckStatus {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AckStatus::Received => "received",
            AckStatus::Applied => "applied",
            AckStatus::Duplicate => "duplicate",
            AckStatus::Skipped => "skipped",
            AckStatus::Rejected => "rejected",
        }
    }

    /// Parse a wire name; unknown values are rejected.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(AckStatus::Received),
            "applied" => Some(AckStatus::Applied),
            "duplicate" => Some(AckStatus::Duplicate),
            "skipped" => Some(AckStatus::Skipped),
            "rejected" => Some(AckStatus::Rejected),
            _ => None,
        }
    }
}

/// Legacy ack vocabulary used by the HTTP endpoint and in `legacyStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyAckStatus {
    /// Applied.
    Applied,
    /// Duplicate of an already-applied event.
    Duplicate,
    /// Skipped because the target resolution was ambiguous.
    SkippedAmbiguous,
    /// Skipped because the target is not managed.
    SkippedUnmanaged,
    /// Rejected as invalid.
    RejectedInvalid,
}

impl LegacyAckStatus {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LegacyAckStatus::Applied => "applied",
            LegacyAckStatus::Duplicate => "duplicate",
            LegacyAckStatus::SkippedAmbiguous => "skipped_ambiguous",
            LegacyAckStatus::SkippedUnmanaged => "skipped_unmanaged",
            LegacyAckStatus::RejectedInvalid => "rejected_invalid",
        }
    }

    /// Parse a wire name; unknown values are rejected.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "applied" => Some(LegacyAckStatus::Applied),
            "duplicate" => Some(LegacyAckStatus::Duplicate),
            "skipped_ambiguous" => Some(LegacyAckStatus::SkippedAmbiguous),
            "skipped_unmanaged" => Some(LegacyAckStatus::SkippedUnmanaged),
            "rejected_invalid" => Some(LegacyAckStatus::RejectedInvalid),
            _ => None,
        }
    }

    /// Map into the current WebSocket vocabulary.
    pub fn to_ws(self) -> AckStatus {
        match self {
            LegacyAckStatus::Applied => AckStatus::Applied,
            LegacyAckStatus::Duplicate => AckStatus::Duplicate,
            LegacyAckStatus::SkippedAmbiguous | LegacyAckStatus::SkippedUnmanaged => {
                AckStatus::Skipped
            }
            LegacyAckStatus::RejectedInvalid => AckStatus::Rejected,
        }
    }
}

/// Map a WebSocket ack status back into the legacy vocabulary name.
///
/// `received` has no legacy counterpart; it passes through unchanged so
/// the reconciler's unknown-status path retains the queue item.
pub fn ws_status_to_legacy_name(status: AckStatus) -> &'static str {
    match status {
        AckStatus::Applied => LegacyAckStatus::Applied.as_str(),
        AckStatus::Duplicate => LegacyAckStatus::Duplicate.as_str(),
        AckStatus::Skipped => LegacyAckStatus::SkippedUnmanaged.as_str(),
        AckStatus::Rejected => LegacyAckStatus::RejectedInvalid.as_str(),
        AckStatus::Received => "received",
    }
}

/// Shared header fields carried by every envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeMeta {
    /// Unique id of this envelope.
    pub event_id: String,
    /// Sender's client id.
    pub client_id: String,
    /// When the sender produced the envelope (ISO-8601).
    pub occurred_at: String,
    /// Wire schema version.
    pub schema_version: String,
    /// Idempotency key (required on `action`).
    pub idempotency_key: Option<String>,
    /// Correlates acks and pongs with their cause.
    pub correlation_id: Option<String>,
}

impl EnvelopeMeta {
    /// Mint a header for an outgoing envelope.
    pub fn fresh(client_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            occurred_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            schema_version: WIRE_SCHEMA_VERSION.to_string(),
            idempotency_key: None,
            correlation_id: None,
        }
    }
}

/// Variant payloads, keyed by the wire `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeBody {
    /// Client opens a session.
    Handshake {
        /// Fresh session id.
        session_id: String,
        /// Bridge access token.
        token: String,
        /// Advertised capabilities.
        capabilities: Vec<String>,
    },
    /// Bridge accepts (or not) and sets the heartbeat cadence.
    HandshakeAck {
        /// Echoed session id.
        session_id: String,
        /// Whether the session was accepted.
        accepted: bool,
        /// Heartbeat interval, already range-checked.
        heartbeat_ms: u64,
    },
    /// A sync action in either direction.
    Action {
        /// Operation name (e.g. `bookmark_created`).
        op: String,
        /// Target managed key or node id.
        target: String,
        /// Operation payload.
        payload: Map<String, Value>,
    },
    /// Per-action result.
    Ack {
        /// Event id of the acknowledged action.
        correlation_id: String,
        /// Result in the current vocabulary.
        status: AckStatus,
        /// Result in the legacy vocabulary, when supplied.
        legacy_status: Option<LegacyAckStatus>,
        /// Failure or skip reason.
        reason: Option<String>,
        /// Bridge-side resolved path.
        resolved_path: Option<String>,
        /// Bridge-assigned stable key.
        resolved_key: Option<String>,
    },
    /// Bridge-reported error.
    Error {
        /// Machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
        /// Whether retrying may help.
        retryable: bool,
        /// Extra context.
        details: Option<Map<String, Value>>,
    },
    /// Keepalive probe.
    HeartbeatPing,
    /// Keepalive answer.
    HeartbeatPong {
        /// Event id of the ping being answered.
        correlation_id: String,
    },
}

impl EnvelopeBody {
    /// Wire `type` of this variant.
    pub fn type_name(&self) -> &'static str {
        match self {
            EnvelopeBody::Handshake { .. } => "handshake",
            EnvelopeBody::HandshakeAck { .. } => "handshake_ack",
            EnvelopeBody::Action { .. } => "action",
            EnvelopeBody::Ack { .. } => "ack",
            EnvelopeBody::Error { .. } => "error",
            EnvelopeBody::HeartbeatPing => "heartbeat_ping",
            EnvelopeBody::HeartbeatPong { .. } => "heartbeat_pong",
        }
    }
}

/// One validated wire frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Shared header.
    pub meta: EnvelopeMeta,
    /// Typed payload.
    pub body: EnvelopeBody,
}

// ==================== Parsing ====================

fn required_string(obj: &Map<String, Value>, key: &str) -> Option<String> {
    let trimmed = obj.get(key)?.as_str()?.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

fn optional_string(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Validate an already-decoded JSON record into an `Envelope`.
///
/// Returns `None` on any missing required field, wrong field type, or
/// unknown constrained-enum value.
pub fn parse_envelope(value: &Value) -> Option<Envelope> {
    let obj = value.as_object()?;

    let kind = required_string(obj, "type")?;
    let meta = EnvelopeMeta {
        event_id: required_string(obj, "eventId")?,
        client_id: required_string(obj, "clientId")?,
        occurred_at: required_string(obj, "occurredAt")?,
        schema_version: required_string(obj, "schemaVersion")?,
        idempotency_key: optional_string(obj, "idempotencyKey"),
        correlation_id: optional_string(obj, "correlationId"),
    };

    let body = match kind.as_str() {
        "handshake" => {
            let capabilities = match obj.get("capabilities") {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(items)) => {
                    let mut caps = Vec::with_capacity(items.len());
                    for item in items {
                        let cap = item.as_str()?.trim();
                        if cap.is_empty() {
                            return None;
                        }
                        caps.push(cap.to_string());
                    }
                    caps
                }
                Some(_) => return None,
            };
            EnvelopeBody::Handshake {
                session_id: required_string(obj, "sessionId")?,
                token: required_string(obj, "token")?,
                capabilities,
            }
        }
        "handshake_ack" => {
            let heartbeat_ms = obj.get("heartbeatMs")?.as_u64()?;
            if !(HEARTBEAT_MIN_MS..=HEARTBEAT_MAX_MS).contains(&heartbeat_ms) {
                return None;
            }
            EnvelopeBody::HandshakeAck {
                session_id: required_string(obj, "sessionId")?,
                accepted: obj.get("accepted")?.as_bool()?,
                heartbeat_ms,
            }
        }
        "action" => {
            // idempotencyKey is mandatory for actions.
            meta.idempotency_key.as_ref()?;
            EnvelopeBody::Action {
                op: required_string(obj, "op")?,
                target: required_string(obj, "target")?,
                payload: obj.get("payload")?.as_object()?.clone(),
            }
        }
        "ack" => {
            let correlation_id = meta.correlation_id.clone()?;
            let status = AckStatus::parse(&required_string(obj, "status")?)?;
            let legacy_status = match obj.get("legacyStatus") {
                None | Some(Value::Null) => None,
                Some(v) => Some(LegacyAckStatus::parse(v.as_str()?)?),
            };
            EnvelopeBody::Ack {
                correlation_id,
                status,
                legacy_status,
                reason: optional_string(obj, "reason"),
                resolved_path: optional_string(obj, "resolvedPath"),
                resolved_key: optional_string(obj, "resolvedKey"),
            }
        }
        "error" => EnvelopeBody::Error {
            code: required_string(obj, "code")?,
            message: required_string(obj, "message")?,
            retryable: obj.get("retryable")?.as_bool()?,
            details: match obj.get("details") {
                None | Some(Value::Null) => None,
                Some(v) => Some(v.as_object()?.clone()),
            },
        },
        "heartbeat_ping" => EnvelopeBody::HeartbeatPing,
        "heartbeat_pong" => EnvelopeBody::HeartbeatPong {
            correlation_id: meta.correlation_id.clone()?,
        },
        _ => return None,
    };

    Some(Envelope { meta, body })
}

// ==================== Serialization ====================

impl Envelope {
    /// Serialize to the wire JSON object.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("type".into(), json!(self.body.type_name()));
        obj.insert("eventId".into(), json!(self.meta.event_id));
        obj.insert("clientId".into(), json!(self.meta.client_id));
        obj.insert("occurredAt".into(), json!(self.meta.occurred_at));
        obj.insert("schemaVersion".into(), json!(self.meta.schema_version));
        if let Some(key) = &self.meta.idempotency_key {
            obj.insert("idempotencyKey".into(), json!(key));
        }
        if let Some(id) = &self.meta.correlation_id {
            obj.insert("correlationId".into(), json!(id));
        }

        match &self.body {
            EnvelopeBody::Handshake {
                session_id,
                token,
                capabilities,
            } => {
                obj.insert("sessionId".into(), json!(session_id));
                obj.insert("token".into(), json!(token));
                obj.insert("capabilities".into(), json!(capabilities));
            }
            EnvelopeBody::HandshakeAck {
                session_id,
                accepted,
                heartbeat_ms,
            } => {
                obj.insert("sessionId".into(), json!(session_id));
                obj.insert("accepted".into(), json!(accepted));
                obj.insert("heartbeatMs".into(), json!(heartbeat_ms));
            }
            EnvelopeBody::Action { op, target, payload } => {
                obj.insert("op".into(), json!(op));
                obj.insert("target".into(), json!(target));
                obj.insert("payload".into(), Value::Object(payload.clone()));
            }
            EnvelopeBody::Ack {
                correlation_id,
                status,
                legacy_status,
                reason,
                resolved_path,
                resolved_key,
            } => {
                obj.insert("correlationId".into(), json!(correlation_id));
                obj.insert("status".into(), json!(status.as_str()));
                if let Some(legacy) = legacy_status {
                    obj.insert("legacyStatus".into(), json!(legacy.as_str()));
                }
                if let Some(reason) = reason {
                    obj.insert("reason".into(), json!(reason));
                }
                if let Some(path) = resolved_path {
                    obj.insert("resolvedPath".into(), json!(path));
                }
                if let Some(key) = resolved_key {
                    obj.insert("resolvedKey".into(), json!(key));
                }
            }
            EnvelopeBody::Error {
                code,
                message,
                retryable,
                details,
            } => {
                obj.insert("code".into(), json!(code));
                obj.insert("message".into(), json!(message));
                obj.insert("retryable".into(), json!(retryable));
                if let Some(details) = details {
                    obj.insert("details".into(), Value::Object(details.clone()));
                }
            }
            EnvelopeBody::HeartbeatPing => {}
            EnvelopeBody::HeartbeatPong { correlation_id } => {
                obj.insert("correlationId".into(), json!(correlation_id));
            }
        }

        Value::Object(obj)
    }

    /// Serialize to a wire text frame.
    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(kind: &str) -> Value {
        json!({
            "type": kind,
            "eventId": "e1",
            "clientId": "c1",
            "occurredAt": "2024-01-01T00:00:00Z",
            "schemaVersion": "1.0",
        })
    }

    fn with(mut value: Value, key: &str, extra: Value) -> Value {
        value.as_object_mut().unwrap().insert(key.into(), extra);
        value
    }

    #[test]
    fn test_missing_shared_field_rejected() {
        let mut value = base("heartbeat_ping");
        value.as_object_mut().unwrap().remove("clientId");
        assert!(parse_envelope(&value).is_none());
    }

    #[test]
    fn test_blank_shared_field_rejected() {
        let value = with(base("heartbeat_ping"), "clientId", json!("   "));
        assert!(parse_envelope(&value).is_none());
    }

    #[test]
    fn test_shared_fields_are_trimmed() {
        let value = with(base("heartbeat_ping"), "clientId", json!("  c1  "));
        let env = parse_envelope(&value).unwrap();
        assert_eq!(env.meta.client_id, "c1");
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(parse_envelope(&base("mystery")).is_none());
    }

    #[test]
    fn test_handshake_requires_session_and_token() {
        let value = with(
            with(base("handshake"), "sessionId", json!("s1")),
            "token",
            json!("t1"),
        );
        let env = parse_envelope(&value).unwrap();
        assert!(matches!(env.body, EnvelopeBody::Handshake { .. }));

        let value = with(base("handshake"), "sessionId", json!("s1"));
        assert!(parse_envelope(&value).is_none());
    }

    #[test]
    fn test_handshake_capabilities_must_be_nonempty_strings() {
        let ok = with(
            with(
                with(base("handshake"), "sessionId", json!("s1")),
                "token",
                json!("t1"),
            ),
            "capabilities",
            json!(["action", "ack"]),
        );
        assert!(parse_envelope(&ok).is_some());

        let bad = with(
            with(
                with(base("handshake"), "sessionId", json!("s1")),
                "token",
                json!("t1"),
            ),
            "capabilities",
            json!(["action", ""]),
        );
        assert!(parse_envelope(&bad).is_none());
    }

    #[test]
    fn test_handshake_ack_heartbeat_range() {
        let mk = |ms: i64| {
            with(
                with(
                    with(base("handshake_ack"), "sessionId", json!("s1")),
                    "accepted",
                    json!(true),
                ),
                "heartbeatMs",
                json!(ms),
            )
        };
        assert!(parse_envelope(&mk(1_000)).is_some());
        assert!(parse_envelope(&mk(120_000)).is_some());
        assert!(parse_envelope(&mk(999)).is_none());
        assert!(parse_envelope(&mk(120_001)).is_none());
    }

    #[test]
    fn test_action_requires_idempotency_key_and_payload_object() {
        let action = |idem: Option<&str>, payload: Value| {
            let mut value = with(
                with(base("action"), "op", json!("bookmark_created")),
                "target",
                json!("note:Projects/A.md"),
            );
            value
                .as_object_mut()
                .unwrap()
                .insert("payload".into(), payload);
            if let Some(idem) = idem {
                value
                    .as_object_mut()
                    .unwrap()
                    .insert("idempotencyKey".into(), json!(idem));
            }
            value
        };
        assert!(parse_envelope(&action(Some("k1"), json!({}))).is_some());
        assert!(parse_envelope(&action(None, json!({}))).is_none());
        assert!(parse_envelope(&action(Some("k1"), json!("nope"))).is_none());
    }

    #[test]
    fn test_ack_statuses_are_closed() {
        let ack = |status: &str| {
            with(
                with(base("ack"), "correlationId", json!("e9")),
                "status",
                json!(status),
            )
        };
        for status in ["received", "applied", "duplicate", "skipped", "rejected"] {
            assert!(parse_envelope(&ack(status)).is_some(), "status {}", status);
        }
        assert!(parse_envelope(&ack("done")).is_none());
    }

    #[test]
    fn test_ack_unknown_legacy_status_rejected() {
        let value = with(
            with(
                with(base("ack"), "correlationId", json!("e9")),
                "status",
                json!("applied"),
            ),
            "legacyStatus",
            json!("totally_new"),
        );
        assert!(parse_envelope(&value).is_none());
    }

    #[test]
    fn test_error_requires_retryable_bool() {
        let value = with(
            with(base("error"), "code", json!("E1")),
            "message",
            json!("boom"),
        );
        assert!(parse_envelope(&value).is_none());
        let value = with(value, "retryable", json!(true));
        assert!(parse_envelope(&value).is_some());
    }

    #[test]
    fn test_heartbeat_pong_requires_correlation() {
        assert!(parse_envelope(&base("heartbeat_pong")).is_none());
        let value = with(base("heartbeat_pong"), "correlationId", json!("p1"));
        assert!(parse_envelope(&value).is_some());
    }

    #[test]
    fn test_roundtrip_action() {
        let env = Envelope {
            meta: EnvelopeMeta {
                event_id: "e1".into(),
                client_id: "c1".into(),
                occurred_at: "2024-01-01T00:00:00Z".into(),
                schema_version: WIRE_SCHEMA_VERSION.into(),
                idempotency_key: Some("b1".into()),
                correlation_id: None,
            },
            body: EnvelopeBody::Action {
                op: "bookmark_created".into(),
                target: "Projects/A.md|0".into(),
                payload: json!({"bookmarkId": "301"}).as_object().unwrap().clone(),
            },
        };
        let parsed = parse_envelope(&env.to_value()).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn test_legacy_mapping_both_directions() {
        assert_eq!(LegacyAckStatus::Applied.to_ws(), AckStatus::Applied);
        assert_eq!(LegacyAckStatus::Duplicate.to_ws(), AckStatus::Duplicate);
        assert_eq!(LegacyAckStatus::SkippedAmbiguous.to_ws(), AckStatus::Skipped);
        assert_eq!(LegacyAckStatus::SkippedUnmanaged.to_ws(), AckStatus::Skipped);
        assert_eq!(LegacyAckStatus::RejectedInvalid.to_ws(), AckStatus::Rejected);

        assert_eq!(ws_status_to_legacy_name(AckStatus::Applied), "applied");
        assert_eq!(
            ws_status_to_legacy_name(AckStatus::Skipped),
            "skipped_unmanaged"
        );
        assert_eq!(
            ws_status_to_legacy_name(AckStatus::Rejected),
            "rejected_invalid"
        );
        assert_eq!(ws_status_to_legacy_name(AckStatus::Received), "received");
    }
}
