//! Cache of structured UI snapshots.
//!
//! Same contract as the screenshot cache, with three differences:
//!
//! - The TTL is capped at [`MAX_CONTEXT_TTL`] whatever the configuration says.
//! - Passive telemetry (`route_change`, `interaction`) updates cached
//!   snapshots in place without a device round trip.
//! - Oversized component trees are compressed before they are stored.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use devbridge_core::protocol::{ContextSnapshot, Interaction, RouteChange};
use serde_json::{Map, Value};
use tracing::debug;

use crate::application::cache::{CacheStats, ResponseCache};
use crate::domain::{BridgeError, CacheConfig};

pub const MAX_CONTEXT_TTL: Duration = Duration::from_secs(30);
pub const MAX_INTERACTIONS: usize = 50;
/// Serialized tree size above which the tree is compressed.
pub const COMPRESS_THRESHOLD_BYTES: usize = 50_000;
pub const MAX_TREE_NODES: usize = 100;
pub const MAX_ATTRIBUTE_CHARS: usize = 100;
/// Node attributes that survive compression.
pub const ALLOWED_ATTRIBUTES: &[&str] = &[
    "type",
    "name",
    "id",
    "testID",
    "text",
    "label",
    "accessibilityLabel",
    "bounds",
    "visible",
];

pub struct ContextCache {
    inner: Arc<ResponseCache<ContextSnapshot>>,
    sweep_interval: Duration,
}

impl ContextCache {
    pub fn new(config: &CacheConfig) -> Self {
        let ttl = config.ttl.min(MAX_CONTEXT_TTL);
        Self {
            inner: Arc::new(ResponseCache::new("context-cache", config.capacity, ttl)),
            sweep_interval: config.sweep_interval,
        }
    }

    pub fn start_sweeper(&self) {
        self.inner.start_sweeper(self.sweep_interval);
    }

    pub fn stop_sweeper(&self) {
        self.inner.stop_sweeper();
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl()
    }

    pub fn get(&self, key: &str) -> Option<ContextSnapshot> {
        self.inner.get(key)
    }

    /// Like [`ResponseCache::fetch_or_get`], compressing the fetched snapshot
    /// before it is stored and returned.
    ///
    /// # Errors
    ///
    /// Returns the fetcher's error.
    pub async fn fetch_or_get<F, Fut>(&self, key: &str, fetcher: F) -> Result<ContextSnapshot, BridgeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ContextSnapshot, BridgeError>>,
    {
        self.inner
            .fetch_or_get(key, move || async move {
                let mut snapshot = fetcher().await?;
                compress_snapshot(&mut snapshot);
                cap_interactions(&mut snapshot.recent_interactions);
                Ok(snapshot)
            })
            .await
    }

    /// Applies a route change to every cached snapshot of `target`.
    pub fn track_route_change(&self, target: &str, change: &RouteChange) -> usize {
        let prefix = format!("{target}:");
        self.inner.update_where(
            |key| key.starts_with(&prefix),
            |snapshot| {
                snapshot.route = change.route.clone();
                snapshot.route_params = change.params.clone();
            },
        )
    }

    /// Appends an interaction to every cached snapshot of `target`, dropping
    /// the oldest beyond [`MAX_INTERACTIONS`].
    pub fn track_interaction(&self, target: &str, interaction: Interaction) -> usize {
        let prefix = format!("{target}:");
        self.inner.update_where(
            |key| key.starts_with(&prefix),
            |snapshot| {
                snapshot.recent_interactions.push(interaction.clone());
                cap_interactions(&mut snapshot.recent_interactions);
            },
        )
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.invalidate(key)
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}

fn cap_interactions(list: &mut Vec<Interaction>) {
    if list.len() > MAX_INTERACTIONS {
        let excess = list.len() - MAX_INTERACTIONS;
        list.drain(..excess);
    }
}

/// Compresses the component tree in place if its JSON exceeds
/// [`COMPRESS_THRESHOLD_BYTES`].  Returns `true` if it did.
///
/// The result is a flat array of at most [`MAX_TREE_NODES`] nodes in
/// depth-first order, with children removed, only [`ALLOWED_ATTRIBUTES`]
/// kept, and string values cut to [`MAX_ATTRIBUTE_CHARS`] characters.
pub fn compress_snapshot(snapshot: &mut ContextSnapshot) -> bool {
    let size = serde_json::to_vec(&snapshot.component_tree)
        .map(|v| v.len())
        .unwrap_or(0);
    if size <= COMPRESS_THRESHOLD_BYTES {
        return false;
    }

    let mut nodes = Vec::with_capacity(MAX_TREE_NODES);
    collect_nodes(&snapshot.component_tree, &mut nodes);
    debug!(
        "compressed component tree of {size} bytes to {} nodes",
        nodes.len()
    );
    snapshot.component_tree = Value::Array(nodes);
    snapshot.truncated = true;
    true
}

fn collect_nodes(value: &Value, out: &mut Vec<Value>) {
    if out.len() >= MAX_TREE_NODES {
        return;
    }
    match value {
        Value::Array(items) => {
            for item in items {
                collect_nodes(item, out);
                if out.len() >= MAX_TREE_NODES {
                    return;
                }
            }
        }
        Value::Object(node) => {
            out.push(Value::Object(filter_attributes(node)));
            if let Some(children) = node.get("children") {
                collect_nodes(children, out);
            }
        }
        _ => {}
    }
}

fn filter_attributes(node: &Map<String, Value>) -> Map<String, Value> {
    node.iter()
        .filter(|(k, _)| ALLOWED_ATTRIBUTES.contains(&k.as_str()))
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => Value::String(s.chars().take(MAX_ATTRIBUTE_CHARS).collect()),
                other => other.clone(),
            };
            (k.clone(), v)
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
