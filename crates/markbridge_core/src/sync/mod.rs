//! The reverse-sync core.
//!
//! ```text
//!      Connection loop                 Protocol                 Semantics
//!   ┌─────────────────┐         ┌──────────────────┐      ┌────────────────┐
//!   │  BridgeClient   │ frames  │  BridgeSession   │ acts │   SyncEngine   │
//!   │  (tokio, timers)├────────►│  (envelope state ├─────►│ (durable state,│
//!   │                 │◄────────┤   machine)       │      │  queue, apply) │
//!   └────────┬────────┘  sends  └──────────────────┘      └───────┬────────┘
//!            │                                                    │
//!       Transport trait                                   KeyValueStore +
//!   (tokio-tungstenite / test)                            BookmarkStore
//! ```
//!
//! Outbound: capture handlers gate on suppression, derive the managed
//! key, and append to the durable reverse queue; flush coalesces and
//! transmits `action` envelopes; acks drain the queue. Inbound:
//! validated `action` envelopes are deduped, applied inside the
//! apply-epoch window, and acknowledged.

pub mod ack;
pub mod apply;
pub mod capture;
pub mod client;
pub mod config;
pub mod dedupe;
pub mod engine;
pub mod envelope;
pub mod node_index;
pub mod ops;
pub mod reverse_http;
pub mod reverse_queue;
pub mod session;
pub mod state;
pub mod suppression;
pub mod timeline;
pub mod tokio_transport;
pub mod transport;

pub use ack::{BatchAckResponse, BatchAckResult};
pub use apply::{ApplyOutcome, GATEWAY_ROOT_TITLE};
pub use capture::CaptureOutcome;
pub use client::{bookmark_event_channel, run_capture_pump, BridgeClient};
pub use config::{BridgeSettings, ClientProfile, DEFAULT_HTTP_URL, DEFAULT_WS_URL};
pub use engine::{FlushOutcome, SessionStatusUpdate, SyncEngine};
pub use envelope::{
    parse_envelope, AckStatus, Envelope, EnvelopeBody, EnvelopeMeta, LegacyAckStatus,
};
pub use ops::{Bridge, PushOutcome, StatusReport};
pub use session::{BridgeSession, SessionAction, SessionEvent};
pub use state::{
    migrate, BridgeState, QueueItem, ReverseEvent, ReverseEventKind, SessionStatus,
    SessionSummary, StateStore, ROOT_FOLDER_KEY,
};
pub use suppression::SuppressionState;
pub use timeline::{DebugTimeline, TimelineEntry};
pub use tokio_transport::{TokioConnector, TokioTransport};
pub use transport::{Transport, TransportConnector, TransportError, WsMessage};
