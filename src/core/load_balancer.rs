use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use rand::Rng;

use crate::config::LoadBalanceStrategy;

/// Trait defining the interface for load balancing strategies.
///
/// Strategies pick an index among candidates described by their weights, so they stay
/// independent of the endpoint type and keep their state across endpoint snapshots.
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    /// Select a candidate, returning its index
    fn select(&self, weights: &[u32]) -> Option<usize>;

    /// Create a new instance of this strategy as a shared trait object
    fn shared(self) -> Arc<dyn LoadBalancingStrategy>
    where
        Self: Sized,
    {
        Arc::new(self)
    }
}

/// Round-robin load balancing strategy
#[derive(Default)]
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select(&self, weights: &[u32]) -> Option<usize> {
        if weights.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(count % weights.len())
    }
}

/// Random selection load balancing strategy
#[derive(Default)]
pub struct RandomStrategy;

impl LoadBalancingStrategy for RandomStrategy {
    fn select(&self, weights: &[u32]) -> Option<usize> {
        if weights.is_empty() {
            return None;
        }
        Some(rand::rng().random_range(0..weights.len()))
    }
}

/// Round-robin over a virtual ring where each candidate occupies `weight` slots.
/// Zero weights count as one.
#[derive(Default)]
pub struct WeightedRoundRobinStrategy {
    counter: AtomicUsize,
}

impl LoadBalancingStrategy for WeightedRoundRobinStrategy {
    fn select(&self, weights: &[u32]) -> Option<usize> {
        let total: usize = weights.iter().map(|w| (*w).max(1) as usize).sum();
        if total == 0 {
            return None;
        }
        let slot = self.counter.fetch_add(1, Ordering::Relaxed) % total;
        pick_slot(weights, slot)
    }
}

/// Random selection proportional to weight. Zero weights count as one.
#[derive(Default)]
pub struct WeightedRandomStrategy;

impl LoadBalancingStrategy for WeightedRandomStrategy {
    fn select(&self, weights: &[u32]) -> Option<usize> {
        let total: usize = weights.iter().map(|w| (*w).max(1) as usize).sum();
        if total == 0 {
            return None;
        }
        let slot = rand::rng().random_range(0..total);
        pick_slot(weights, slot)
    }
}

fn pick_slot(weights: &[u32], mut slot: usize) -> Option<usize> {
    for (index, weight) in weights.iter().enumerate() {
        let weight = (*weight).max(1) as usize;
        if slot < weight {
            return Some(index);
        }
        slot -= weight;
    }
    None
}

/// Factory for creating load balancing strategies from configuration
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    pub fn create_strategy(strategy: &LoadBalanceStrategy) -> Arc<dyn LoadBalancingStrategy> {
        match strategy {
            LoadBalanceStrategy::RoundRobin => RoundRobinStrategy::new().shared(),
            LoadBalanceStrategy::Random => RandomStrategy.shared(),
            LoadBalanceStrategy::WeightedRoundRobin => WeightedRoundRobinStrategy::default().shared(),
            LoadBalanceStrategy::WeightedRandom => WeightedRandomStrategy.shared(),
        }
    }
}
