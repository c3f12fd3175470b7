use crate::chat::ChatCompletionRequest;
use crate::registry::SourceRegistry;
use crate::source::Source;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteStrategy {
    Priority,
    RoundRobin,
    Weighted,
    LeastLatency,
    LeastCost,
}

impl RouteStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Priority => "priority",
            Self::RoundRobin => "round-robin",
            Self::Weighted => "weighted",
            Self::LeastLatency => "least-latency",
            Self::LeastCost => "least-cost",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "priority" => Some(Self::Priority),
            "round-robin" => Some(Self::RoundRobin),
            "weighted" => Some(Self::Weighted),
            "least-latency" => Some(Self::LeastLatency),
            "least-cost" => Some(Self::LeastCost),
            _ => None,
        }
    }
}

impl Default for RouteStrategy {
    fn default() -> Self {
        Self::Priority
    }
}

/// Capability-filtered, strategy-driven upstream selection.
pub struct Router {
    registry: Arc<SourceRegistry>,
    strategy: RwLock<RouteStrategy>,
    rr_index: AtomicU64,
}

impl Router {
    pub fn new(registry: Arc<SourceRegistry>, strategy: RouteStrategy) -> Self {
        Self {
            registry,
            strategy: RwLock::new(strategy),
            rr_index: AtomicU64::new(0),
        }
    }

    pub fn strategy(&self) -> RouteStrategy {
        *self.strategy.read().expect("strategy lock")
    }

    pub fn set_strategy(&self, strategy: RouteStrategy) {
        *self.strategy.write().expect("strategy lock") = strategy;
    }

    /// Picks a source for the request, excluding already-tried sources.
    ///
    /// When the request needs function calling and no FC-capable source
    /// qualifies, the pool deliberately widens to non-FC sources and the
    /// compatibility layer bridges the semantics downstream.
    pub fn route(
        &self,
        req: &ChatCompletionRequest,
        exclude: &[String],
    ) -> Option<Arc<Source>> {
        let need_fc = req.has_tools();
        let need_thinking = req.has_thinking();
        let need_vision = req.has_vision();

        let mut candidates =
            self.registry
                .get_by_capability(need_fc, need_thinking, need_vision, &req.model);

        if candidates.is_empty() && need_fc {
            candidates =
                self.registry
                    .get_by_capability(false, need_thinking, need_vision, &req.model);
        }

        if !exclude.is_empty() {
            candidates.retain(|src| !exclude.contains(&src.id));
        }

        // The exclusion pass may have emptied the FC pool; degrade again
        // against the same exclusion set.
        if candidates.is_empty() && need_fc {
            candidates =
                self.registry
                    .get_by_capability(false, need_thinking, need_vision, &req.model);
            if !exclude.is_empty() {
                candidates.retain(|src| !exclude.contains(&src.id));
            }
        }

        if candidates.is_empty() {
            return None;
        }

        match self.strategy() {
            RouteStrategy::Priority => Some(self.pick_priority(candidates)),
            RouteStrategy::RoundRobin => Some(self.pick_round_robin(candidates)),
            RouteStrategy::Weighted => Some(self.pick_weighted(candidates)),
            RouteStrategy::LeastLatency => Some(pick_least_latency(candidates)),
            RouteStrategy::LeastCost => Some(pick_least_cost(candidates)),
        }
    }

    fn pick_priority(&self, mut candidates: Vec<Arc<Source>>) -> Arc<Source> {
        candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
        let top = candidates[0].priority;
        let band: Vec<_> = candidates
            .iter()
            .take_while(|src| src.priority == top)
            .cloned()
            .collect();
        if band.len() > 1 {
            let idx = self.rr_index.fetch_add(1, Ordering::Relaxed) as usize % band.len();
            return band[idx].clone();
        }
        candidates.swap_remove(0)
    }

    fn pick_round_robin(&self, mut candidates: Vec<Arc<Source>>) -> Arc<Source> {
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        let idx = self.rr_index.fetch_add(1, Ordering::Relaxed) as usize % candidates.len();
        candidates.swap_remove(idx)
    }

    fn pick_weighted(&self, mut candidates: Vec<Arc<Source>>) -> Arc<Source> {
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        let total: u64 = candidates.iter().map(|src| src.weight.max(1) as u64).sum();
        let offset = self.rr_index.fetch_add(1, Ordering::Relaxed) % total;
        let mut cumulative = 0u64;
        for src in &candidates {
            cumulative += src.weight.max(1) as u64;
            if offset < cumulative {
                return src.clone();
            }
        }
        candidates.swap_remove(0)
    }
}

fn pick_least_latency(mut candidates: Vec<Arc<Source>>) -> Arc<Source> {
    candidates.sort_by(|a, b| {
        a.status()
            .latency_ms
            .cmp(&b.status().latency_ms)
            .then(a.id.cmp(&b.id))
    });
    candidates.swap_remove(0)
}

fn pick_least_cost(mut candidates: Vec<Arc<Source>>) -> Arc<Source> {
    // Highest balance wins.
    candidates.sort_by(|a, b| {
        b.status()
            .balance
            .partial_cmp(&a.status().balance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    candidates.swap_remove(0)
}
