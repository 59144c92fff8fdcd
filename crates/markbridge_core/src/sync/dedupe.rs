//! Per-direction idempotency ledger with TTL eviction.
//!
//! Keys are bucketed by a logical client id: the synthetic `"outbound"`
//! bucket rejects locally re-generated event ids before enqueue, while
//! each real peer client id gets its own bucket for inbound idempotency
//! keys, so two peers reusing the same key do not collide.

use std::collections::HashMap;

/// Ledger entries older than this are evicted on access.
pub const DEDUPE_TTL_MS: i64 = 5 * 60 * 1_000;

/// Synthetic client id for the outbound direction.
pub const OUTBOUND_CLIENT: &str = "outbound";

/// Nested ledger map: client id -> (dedupe key -> recorded-at epoch-ms).
pub type DedupeMap = HashMap<String, HashMap<String, i64>>;

/// Record `key` under `client_id` unless it was seen within the TTL.
///
/// Evicts expired entries in the bucket first. Returns `true` when the
/// key was fresh (and is now recorded); `false` for a duplicate, in
/// which case the existing timestamp is left untouched.
pub fn record_and_check(ledger: &mut DedupeMap, client_id: &str, key: &str, now_ms: i64) -> bool {
    let bucket = ledger.entry(client_id.to_string()).or_default();
    bucket.retain(|_, recorded_at| now_ms - *recorded_at < DEDUPE_TTL_MS);
    if bucket.contains_key(key) {
        return false;
    }
    bucket.insert(key.to_string(), now_ms);
    true
}
