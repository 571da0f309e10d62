//! Time-bounded store of recently seen transport messages.
//!
//! The transport occasionally asks for the original payload of an earlier
//! message (delivery retries, decryption key continuity). Entries are evicted
//! by age rather than by count: recency matters more than total volume, and a
//! lookup miss degrades to a placeholder instead of failing delivery.

use std::{collections::HashMap, sync::Mutex};

use serde_json::{json, Value};

use crate::transport::MessageLookup;

/// Fixed retention window for cached messages.
pub const MESSAGE_RETENTION_MS: u64 = 24 * 60 * 60 * 1_000;

#[derive(Debug, Clone)]
struct CachedMessage {
    payload: Value,
    received_unix_ms: u64,
}

#[derive(Debug, Default)]
pub struct MessageCache {
    entries: Mutex<HashMap<String, CachedMessage>>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the entry for `id`. The payload shape is owned by
    /// the transport and treated as opaque.
    pub fn record(&self, id: &str, payload: Value, received_unix_ms: u64) {
        let mut entries = self.lock_entries();
        entries.insert(
            id.to_string(),
            CachedMessage {
                payload,
                received_unix_ms,
            },
        );
    }

    /// Shallow-merges `patch`'s top-level keys onto the stored payload.
    /// Updates for unseen ids are dropped; they carry no recoverable context.
    pub fn merge(&self, id: &str, patch: &Value) {
        let mut entries = self.lock_entries();
        let Some(entry) = entries.get_mut(id) else {
            return;
        };
        match (entry.payload.as_object_mut(), patch.as_object()) {
            (Some(target), Some(source)) => {
                for (key, value) in source {
                    target.insert(key.clone(), value.clone());
                }
            }
            _ => entry.payload = patch.clone(),
        }
    }

    /// Returns the stored payload, or a well-formed placeholder when absent.
    /// Never fails; the transport must always receive some message object.
    pub fn lookup(&self, id: &str) -> Value {
        let entries = self.lock_entries();
        entries
            .get(id)
            .map(|entry| entry.payload.clone())
            .unwrap_or_else(placeholder_payload)
    }

    /// Removes every entry strictly older than `now - max_age`; entries whose
    /// age equals `max_age` exactly survive. Returns the removal count.
    pub fn sweep(&self, now_unix_ms: u64, max_age_ms: u64) -> usize {
        let mut entries = self.lock_entries();
        let before = entries.len();
        entries.retain(|_, entry| now_unix_ms.saturating_sub(entry.received_unix_ms) <= max_age_ms);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, CachedMessage>> {
        // Cache operations are infallible by contract; a poisoned guard still
        // holds a structurally valid map.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn placeholder_payload() -> Value {
    json!({ "conversation": "message not found in cache" })
}

impl MessageLookup for MessageCache {
    fn lookup_message(&self, id: &str) -> Value {
        self.lookup(id)
    }
}
