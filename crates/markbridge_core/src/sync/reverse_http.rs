//! Legacy HTTP reverse endpoint (retained for interoperability).
//!
//! Posts the coalesced reverse queue as one batch and returns the
//! bridge's per-event results, which feed the same ack reconciler as
//! WebSocket acks.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::error::BridgeError;

use super::ack::BatchAckResponse;
use super::state::ReverseEvent;

/// Auth header carried by every reverse-sync request.
pub const TOKEN_HEADER: &str = "X-Project2Chrome-Token";

/// Wire body of a reverse-sync POST.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverseBatch {
    /// Batch id echoed in the response.
    pub batch_id: String,
    /// Coalesced events, in queue order.
    pub events: Vec<ReverseEvent>,
    /// When the batch was sent (ISO-8601).
    pub sent_at: String,
}

impl ReverseBatch {
    /// Assemble a batch from coalesced events.
    pub fn new(batch_id: String, events: Vec<ReverseEvent>) -> Self {
        Self {
            batch_id,
            events,
            sent_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// Derive the reverse-sync URL from a profile's payload URL.
pub fn reverse_endpoint(payload_url: &str) -> String {
    if let Some(base) = payload_url.strip_suffix("/payload") {
        format!("{}/reverse-sync", base)
    } else {
        format!("{}/reverse-sync", payload_url.trim_end_matches('/'))
    }
}

/// POST one reverse batch and decode the ack response.
pub async fn push_reverse_batch(
    http: &reqwest::Client,
    payload_url: &str,
    token: &str,
    batch: &ReverseBatch,
) -> Result<BatchAckResponse, BridgeError> {
    let url = reverse_endpoint(payload_url);
    let response = http
        .post(&url)
        .header(TOKEN_HEADER, token)
        .json(batch)
        .send()
        .await
        .map_err(|e| BridgeError::Http(format!("request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        // Status only; the URL may carry routing detail we never log.
        return Err(BridgeError::Http(format!("status {}", status.as_u16())));
    }
    response
        .json::<BatchAckResponse>()
        .await
        .map_err(|e| BridgeError::Http(format!("undecodable ack response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reverse_endpoint_from_payload_url() {
        assert_eq!(
            reverse_endpoint("http://127.0.0.1:27123/payload"),
            "http://127.0.0.1:27123/reverse-sync"
        );
        assert_eq!(
            reverse_endpoint("http://bridge.local:9000/"),
            "http://bridge.local:9000/reverse-sync"
        );
    }

    #[test]
    fn test_batch_serializes_camel_case() {
        let batch = ReverseBatch::new("b1".to_string(), Vec::new());
        let value = serde_json::to_value(&batch).unwrap();
        assert_eq!(value["batchId"], "b1");
        assert!(value["sentAt"].is_string());
        assert!(value["events"].as_array().unwrap().is_empty());
    }
}
