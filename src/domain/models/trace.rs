//! Correlation trace nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::CorrelationId;

/// How the handling of a traced event ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceOutcome {
    Pending,
    Handled,
    Unhandled,
    Failed,
}

impl TraceOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Handled => "handled",
            Self::Unhandled => "unhandled",
            Self::Failed => "failed",
        }
    }
}

/// One hop in the causal graph. Append-only except for its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceNode {
    pub correlation_id: CorrelationId,
    pub parent_id: Option<CorrelationId>,
    pub root_id: CorrelationId,
    pub event_name: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub outcome: TraceOutcome,
    /// Redacted and truncated copy of the event data.
    pub data: Value,
    pub depth: u32,
}

/// A node and its descendants.
#[derive(Debug, Clone, Serialize)]
pub struct TraceTree {
    #[serde(flatten)]
    pub node: TraceNode,
    pub children: Vec<TraceTree>,
}

impl TraceTree {
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(TraceTree::size).sum::<usize>()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceStats {
    pub nodes: usize,
    pub roots: usize,
    pub pending: usize,
    pub failed: usize,
    pub max_depth: u32,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}
