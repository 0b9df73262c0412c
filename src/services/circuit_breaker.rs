//! Circuit breaker for injection chains.
//!
//! Each chain root gets its own breaker. A breaker trips when a chain gets
//! too deep, when too many injections happen back to back without external
//! input, or when the injection rate within a sliding window is exceeded.
//! A tripped breaker stays open until external input resets it.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::models::InjectionConfig;

/// Configuration for chain breakers.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Deepest allowed chain; also bounds consecutive injections.
    pub max_chain_depth: u32,
    /// Injections allowed within `window`.
    pub max_injections_per_window: u32,
    pub window: Duration,
    /// Whether to enable circuit breakers.
    pub enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&InjectionConfig::default())
    }
}

impl From<&InjectionConfig> for CircuitBreakerConfig {
    fn from(config: &InjectionConfig) -> Self {
        Self {
            max_chain_depth: config.max_chain_depth,
            max_injections_per_window: config.max_injections_per_window,
            window: Duration::seconds(i64::try_from(config.window_secs).unwrap_or(i64::MAX)),
            enabled: true,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a more sensitive circuit breaker.
    pub fn sensitive() -> Self {
        Self {
            max_chain_depth: 2,
            max_injections_per_window: 5,
            window: Duration::minutes(1),
            enabled: true,
        }
    }

    /// Create a more resilient circuit breaker.
    pub fn resilient() -> Self {
        Self {
            max_chain_depth: 20,
            max_injections_per_window: 100,
            window: Duration::minutes(1),
            enabled: true,
        }
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Injections flow normally.
    Closed,
    /// Injections are rejected until external input arrives.
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
        }
    }
}

/// Breaker state for one chain root.
#[derive(Debug, Clone, Serialize)]
pub struct ChainBreakerState {
    pub chain_root: String,
    pub state: CircuitState,
    pub consecutive_injections: u32,
    pub window_start: Option<DateTime<Utc>>,
    #[serde(skip)]
    recent: VecDeque<DateTime<Utc>>,
    pub trip_count: u32,
    pub last_trip_reason: Option<String>,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
}

impl ChainBreakerState {
    fn new(chain_root: &str) -> Self {
        Self {
            chain_root: chain_root.to_string(),
            state: CircuitState::Closed,
            consecutive_injections: 0,
            window_start: None,
            recent: VecDeque::new(),
            trip_count: 0,
            last_trip_reason: None,
            opened_at: None,
            last_activity: Utc::now(),
        }
    }

    pub fn injections_in_window(&self) -> usize {
        self.recent.len()
    }

    fn trip(&mut self, reason: String, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.trip_count += 1;
        self.opened_at = Some(now);
        self.last_trip_reason = Some(reason);
    }
}

/// Result of checking an injection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerCheck {
    Allowed,
    Tripped { reason: String },
}

/// Summary across all chains.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CircuitBreakerStats {
    pub chains: usize,
    pub open: usize,
    pub total_trips: u32,
}

/// Per-chain breakers keyed by chain root.
pub struct ChainCircuitBreaker {
    config: CircuitBreakerConfig,
    chains: DashMap<String, ChainBreakerState>,
}

impl ChainCircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            chains: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check and count one injection attempt at `depth` for `chain_root`.
    ///
    /// Allowed attempts are counted; rejected ones trip (or keep open) the breaker.
    pub fn record_attempt(&self, chain_root: &str, depth: u32) -> BreakerCheck {
        if !self.config.enabled {
            return BreakerCheck::Allowed;
        }
        let now = Utc::now();
        let mut entry = self
            .chains
            .entry(chain_root.to_string())
            .or_insert_with(|| ChainBreakerState::new(chain_root));
        let state = entry.value_mut();
        state.last_activity = now;

        if state.state == CircuitState::Open {
            let reason = state
                .last_trip_reason
                .clone()
                .unwrap_or_else(|| "circuit open".to_string());
            return BreakerCheck::Tripped { reason };
        }

        let cutoff = now - self.config.window;
        while state.recent.front().is_some_and(|t| *t < cutoff) {
            state.recent.pop_front();
        }
        state.window_start = state.recent.front().copied();

        let max = self.config.max_chain_depth;
        let reason = if depth > max {
            Some(format!("chain depth {depth} exceeds limit {max}"))
        } else if state.consecutive_injections >= max {
            Some(format!(
                "{} consecutive injections without external input (limit {max})",
                state.consecutive_injections
            ))
        } else if state.recent.len() >= self.config.max_injections_per_window as usize {
            Some(format!(
                "{} injections within {}s (limit {})",
                state.recent.len(),
                self.config.window.num_seconds(),
                self.config.max_injections_per_window
            ))
        } else {
            None
        };

        match reason {
            Some(reason) => {
                warn!(chain_root, depth, reason = %reason, "injection circuit breaker tripped");
                state.trip(reason.clone(), now);
                BreakerCheck::Tripped { reason }
            }
            None => {
                state.consecutive_injections += 1;
                state.recent.push_back(now);
                if state.window_start.is_none() {
                    state.window_start = Some(now);
                }
                BreakerCheck::Allowed
            }
        }
    }

    /// Close the breaker for `chain_root` after external input. Returns
    /// whether there was any state to reset.
    pub fn reset(&self, chain_root: &str) -> bool {
        let removed = self.chains.remove(chain_root).is_some();
        if removed {
            debug!(chain_root, "injection circuit breaker reset by external input");
        }
        removed
    }

    pub fn state(&self, chain_root: &str) -> Option<ChainBreakerState> {
        self.chains.get(chain_root).map(|s| s.clone())
    }

    pub fn is_open(&self, chain_root: &str) -> bool {
        self.chains
            .get(chain_root)
            .is_some_and(|s| s.state == CircuitState::Open)
    }

    pub fn states(&self) -> Vec<ChainBreakerState> {
        let mut states: Vec<_> = self.chains.iter().map(|s| s.clone()).collect();
        states.sort_by(|a, b| a.chain_root.cmp(&b.chain_root));
        states
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut stats = CircuitBreakerStats::default();
        for state in &self.chains {
            stats.chains += 1;
            if state.state == CircuitState::Open {
                stats.open += 1;
            }
            stats.total_trips += state.trip_count;
        }
        stats
    }

    /// Drop closed breakers idle for longer than the window.
    pub fn prune_idle(&self) -> usize {
        let cutoff = Utc::now() - self.config.window;
        let before = self.chains.len();
        self.chains
            .retain(|_, s| s.state == CircuitState::Open || s.last_activity >= cutoff);
        before.saturating_sub(self.chains.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(max_depth: u32, per_window: u32) -> ChainCircuitBreaker {
        ChainCircuitBreaker::new(CircuitBreakerConfig {
            max_chain_depth: max_depth,
            max_injections_per_window: per_window,
            window: Duration::minutes(1),
            enabled: true,
        })
    }

    #[test]
    fn test_depth_threshold() {
        let cb = breaker(3, 100);
        assert_eq!(cb.record_attempt("c1", 1), BreakerCheck::Allowed);
        assert_eq!(cb.record_attempt("c1", 2), BreakerCheck::Allowed);
        assert_eq!(cb.record_attempt("c1", 3), BreakerCheck::Allowed);
        assert!(matches!(cb.record_attempt("c1", 4), BreakerCheck::Tripped { .. }));
        assert!(cb.is_open("c1"));
        // Stays open even for shallow attempts.
        assert!(matches!(cb.record_attempt("c1", 1), BreakerCheck::Tripped { .. }));
        assert_eq!(cb.state("c1").unwrap().trip_count, 1);
    }

    #[test]
    fn test_consecutive_injections_trip() {
        let cb = breaker(2, 100);
        assert_eq!(cb.record_attempt("s1", 1), BreakerCheck::Allowed);
        assert_eq!(cb.record_attempt("s1", 1), BreakerCheck::Allowed);
        assert!(matches!(cb.record_attempt("s1", 1), BreakerCheck::Tripped { .. }));
    }

    #[test]
    fn test_rate_window_trip() {
        let cb = breaker(100, 2);
        assert_eq!(cb.record_attempt("s1", 1), BreakerCheck::Allowed);
        assert_eq!(cb.record_attempt("s1", 1), BreakerCheck::Allowed);
        match cb.record_attempt("s1", 1) {
            BreakerCheck::Tripped { reason } => assert!(reason.contains("within")),
            BreakerCheck::Allowed => panic!("rate limit should trip"),
        }
    }

    #[test]
    fn test_reset_closes_breaker() {
        let cb = breaker(1, 100);
        cb.record_attempt("c1", 1);
        assert!(matches!(cb.record_attempt("c1", 2), BreakerCheck::Tripped { .. }));
        assert!(cb.reset("c1"));
        assert!(!cb.is_open("c1"));
        assert_eq!(cb.record_attempt("c1", 1), BreakerCheck::Allowed);
        assert!(!cb.reset("unknown"));
    }

    #[test]
    fn test_chains_are_independent() {
        let cb = breaker(1, 100);
        cb.record_attempt("a", 1);
        assert!(matches!(cb.record_attempt("a", 2), BreakerCheck::Tripped { .. }));
        assert_eq!(cb.record_attempt("b", 1), BreakerCheck::Allowed);
        let stats = cb.stats();
        assert_eq!(stats.chains, 2);
        assert_eq!(stats.open, 1);
        assert_eq!(stats.total_trips, 1);
    }

    #[test]
    fn test_disabled_allows_everything() {
        let cb = ChainCircuitBreaker::new(CircuitBreakerConfig {
            enabled: false,
            ..CircuitBreakerConfig::sensitive()
        });
        assert_eq!(cb.record_attempt("c1", 99), BreakerCheck::Allowed);
    }
}
