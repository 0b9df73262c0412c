//! Correlation tracer.
//!
//! Records a causal graph of every dispatched event. Nodes are keyed by
//! correlation id in a sharded map so concurrent dispatches never contend on
//! a single lock. A node is only ever created with an id that no live node
//! uses or points at, which keeps the parent graph acyclic even after
//! pruning. Child start times are clamped to their parent's.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    CorrelationId, TraceNode, TraceOutcome, TraceStats, TraceTree, TracerConfig,
};
use crate::infrastructure::logging::SecretScrubber;

const REDACTED: &str = "[REDACTED]";

/// Redacts sensitive keys and scrubs secrets out of string values.
#[derive(Debug, Clone)]
pub struct PayloadSanitizer {
    key_patterns: Vec<Regex>,
    scrubber: SecretScrubber,
    max_bytes: usize,
}

impl PayloadSanitizer {
    pub fn new(extra_key_patterns: &[String], max_bytes: usize) -> DomainResult<Self> {
        let mut sources = vec![
            r"(?i)(^|[_\-])(password|passwd|secret|token|api[_\-]?key|credentials?|authorization|cookie)$"
                .to_string(),
        ];
        sources.extend(extra_key_patterns.iter().cloned());
        let key_patterns = sources
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DomainError::Internal(format!("invalid redaction pattern: {e}")))?;
        let scrubber = SecretScrubber::new()
            .map_err(|e| DomainError::Internal(format!("invalid scrubbing pattern: {e}")))?;
        Ok(Self {
            key_patterns,
            scrubber,
            max_bytes,
        })
    }

    fn is_sensitive_key(&self, key: &str) -> bool {
        self.key_patterns.iter().any(|p| p.is_match(key))
    }

    fn redact(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| {
                        let v = if self.is_sensitive_key(k) {
                            Value::String(REDACTED.to_string())
                        } else {
                            self.redact(v)
                        };
                        (k.clone(), v)
                    })
                    .collect::<Map<_, _>>(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact(v)).collect()),
            Value::String(s) => Value::String(self.scrubber.scrub_message(s)),
            other => other.clone(),
        }
    }

    /// Redact, then truncate anything whose serialized form exceeds the size limit.
    pub fn sanitize(&self, value: &Value) -> Value {
        let redacted = self.redact(value);
        let serialized = redacted.to_string();
        if serialized.len() <= self.max_bytes {
            return redacted;
        }
        let mut cut = self.max_bytes;
        while !serialized.is_char_boundary(cut) {
            cut -= 1;
        }
        serde_json::json!({
            "_truncated": true,
            "original_bytes": serialized.len(),
            "preview": &serialized[..cut],
        })
    }
}

/// Causal trace store.
#[derive(Debug)]
pub struct CorrelationTracer {
    nodes: DashMap<CorrelationId, TraceNode>,
    children: DashMap<CorrelationId, Vec<CorrelationId>>,
    sanitizer: PayloadSanitizer,
}

impl CorrelationTracer {
    pub fn new(config: &TracerConfig) -> DomainResult<Self> {
        Ok(Self {
            nodes: DashMap::new(),
            children: DashMap::new(),
            sanitizer: PayloadSanitizer::new(&config.redact_keys, config.max_data_bytes)?,
        })
    }

    /// Start a trace node for `event_name`.
    ///
    /// `requested` is adopted when no node uses it or names it as parent;
    /// otherwise a fresh id is assigned. Returns the id of the new node.
    pub fn start_trace(
        &self,
        event_name: &str,
        parent_id: Option<CorrelationId>,
        requested: Option<CorrelationId>,
        data: &Value,
    ) -> CorrelationId {
        let correlation_id = match requested {
            Some(id) if Some(id) != parent_id && !self.is_referenced(id) => id,
            Some(id) => {
                debug!(correlation_id = %id, event = event_name, "correlation id already traced, assigning a fresh one");
                CorrelationId::new()
            }
            None => CorrelationId::new(),
        };

        let mut started_at = Utc::now();
        let (root_id, depth) = match parent_id {
            Some(parent) => match self.nodes.get(&parent) {
                Some(parent_node) => {
                    if started_at < parent_node.started_at {
                        started_at = parent_node.started_at;
                    }
                    (parent_node.root_id, parent_node.depth + 1)
                }
                None => {
                    debug!(parent = %parent, event = event_name, "parent trace not found, linking to pruned or foreign parent");
                    (parent, 1)
                }
            },
            None => (correlation_id, 0),
        };

        let node = TraceNode {
            correlation_id,
            parent_id,
            root_id,
            event_name: event_name.to_string(),
            started_at,
            duration_ms: None,
            outcome: TraceOutcome::Pending,
            data: self.sanitizer.sanitize(data),
            depth,
        };
        self.nodes.insert(correlation_id, node);
        if let Some(parent) = parent_id {
            self.children.entry(parent).or_default().push(correlation_id);
        }
        correlation_id
    }

    fn is_referenced(&self, id: CorrelationId) -> bool {
        self.nodes.contains_key(&id) || self.children.contains_key(&id)
    }

    /// Record the outcome of a traced dispatch.
    pub fn record(&self, correlation_id: CorrelationId, outcome: TraceOutcome, duration_ms: u64) {
        match self.nodes.get_mut(&correlation_id) {
            Some(mut node) => {
                node.outcome = outcome;
                node.duration_ms = Some(duration_ms);
            }
            None => warn!(correlation_id = %correlation_id, "record for unknown trace node"),
        }
    }

    pub fn get(&self, correlation_id: CorrelationId) -> DomainResult<TraceNode> {
        self.nodes
            .get(&correlation_id)
            .map(|n| n.clone())
            .ok_or_else(|| DomainError::CorrelationNotFound(correlation_id.to_string()))
    }

    /// Ancestors of `correlation_id`, root first, ending with the node itself.
    ///
    /// Stops at the first pruned ancestor.
    pub fn chain(&self, correlation_id: CorrelationId) -> DomainResult<Vec<TraceNode>> {
        let mut current = Some(self.get(correlation_id)?);
        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        while let Some(node) = current.take() {
            if !seen.insert(node.correlation_id) {
                warn!(correlation_id = %node.correlation_id, "cycle in trace graph");
                break;
            }
            current = node
                .parent_id
                .and_then(|p| self.nodes.get(&p).map(|n| n.clone()));
            chain.push(node);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Descendant graph rooted at `correlation_id`.
    pub fn tree(&self, correlation_id: CorrelationId) -> DomainResult<TraceTree> {
        let node = self.get(correlation_id)?;
        let mut seen = HashSet::new();
        Ok(self.build_tree(node, &mut seen))
    }

    fn build_tree(&self, node: TraceNode, seen: &mut HashSet<CorrelationId>) -> TraceTree {
        seen.insert(node.correlation_id);
        let child_ids = self
            .children
            .get(&node.correlation_id)
            .map(|c| c.clone())
            .unwrap_or_default();
        let mut children: Vec<TraceNode> = child_ids
            .into_iter()
            .filter(|id| !seen.contains(id))
            .filter_map(|id| self.nodes.get(&id).map(|n| n.clone()))
            .collect();
        children.sort_by_key(|n| n.started_at);
        let children = children
            .into_iter()
            .map(|child| self.build_tree(child, seen))
            .collect();
        TraceTree { node, children }
    }

    pub fn stats(&self) -> TraceStats {
        let mut stats = TraceStats::default();
        for node in &self.nodes {
            stats.nodes += 1;
            if node.parent_id.is_none() {
                stats.roots += 1;
            }
            match node.outcome {
                TraceOutcome::Pending => stats.pending += 1,
                TraceOutcome::Failed => stats.failed += 1,
                TraceOutcome::Handled | TraceOutcome::Unhandled => {}
            }
            stats.max_depth = stats.max_depth.max(node.depth);
            stats.oldest = Some(stats.oldest.map_or(node.started_at, |t| t.min(node.started_at)));
            stats.newest = Some(stats.newest.map_or(node.started_at, |t| t.max(node.started_at)));
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Delete nodes older than `max_age`. Returns how many were removed.
    ///
    /// A pruned node keeps its child index while any child survives.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let expired: HashSet<CorrelationId> = self
            .nodes
            .iter()
            .filter(|n| n.started_at < cutoff)
            .map(|n| n.correlation_id)
            .collect();
        if expired.is_empty() {
            return 0;
        }
        for id in &expired {
            self.nodes.remove(id);
        }
        self.children.retain(|_, kids| {
            kids.retain(|k| !expired.contains(k));
            !kids.is_empty()
        });
        debug!(removed = expired.len(), "pruned trace nodes");
        expired.len()
    }
}
