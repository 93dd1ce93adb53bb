//! Cross-turn memory for provider-opaque tool-call metadata.
//!
//! Gemini-backed upstreams attach a thought signature to each function call
//! and reject the next turn if it is not echoed back. Anthropic clients replay
//! history without it, so the gateway remembers it by tool call id.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

pub const TOOL_CALL_CACHE_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct ToolCallCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, Value>,
    order: VecDeque<String>,
}

impl Default for ToolCallCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallCache {
    pub fn new() -> Self {
        Self::with_capacity(TOOL_CALL_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Remember `value` for `id`. Re-inserting an id replaces the value but
    /// keeps its original eviction position.
    pub fn insert(&self, id: &str, value: Value) {
        if id.is_empty() || value.is_null() {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.entries.get_mut(id) {
            *existing = value;
            return;
        }
        inner.entries.insert(id.to_string(), value);
        inner.order.push_back(id.to_string());
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.entries.remove(&evicted);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        let hit = self.inner.lock().entries.get(id).cloned();
        if hit.is_some() {
            debug!(tool_call_id = id, "re-hydrating cached tool call metadata");
        }
        hit
    }

    /// Thought signature stored under `extra_content.google.thought_signature`.
    pub fn thought_signature(&self, id: &str) -> Option<String> {
        self.get(id)?
            .pointer("/google/thought_signature")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}

/// Extra content shape shared by the Chat and Cloud Code paths.
pub fn thought_signature_extra(signature: &str) -> Value {
    serde_json::json!({ "google": { "thought_signature": signature } })
}
