//! Metrics contains the metrics setup for the controller.

use metrics::{Counter, counter, describe_counter};

/// Common metrics for the controller.
#[derive(Clone)]
pub struct Metrics {
    /// Metrics collected from reconcilers.
    pub reconcile: ReconcileMetrics,
    /// Metrics collected from the resolver.
    pub resolve: ResolveMetrics,
    /// Metrics collected from the applyset engine driver.
    pub apply: ApplyMetrics,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            reconcile: ReconcileMetrics::default(),
            resolve: ResolveMetrics::default(),
            apply: ApplyMetrics::default(),
        }
    }
}

/// Metrics collected from reconcilers.
#[derive(Clone)]
pub struct ReconcileMetrics {
    /// Runs records the total number of calls to a reconciler.
    pub runs: Counter,
    /// Failures records the total number of reconciler calls that resulted in
    /// a failure.
    pub failures: Counter,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        describe_counter!("deployer_reconciles_total", "reconciler invocations");
        describe_counter!("deployer_reconcile_failures_total", "failed reconciles");
        Self {
            runs: counter!("deployer_reconciles_total"),
            failures: counter!("deployer_reconcile_failures_total"),
        }
    }
}

/// Metrics collected from the resolver.
#[derive(Clone)]
pub struct ResolveMetrics {
    /// Requests records resolve calls.
    pub requests: Counter,
    /// Cache_hits records resolve calls served from the descriptor cache.
    pub cache_hits: Counter,
    /// Queue_full records submissions rejected for backpressure.
    pub queue_full: Counter,
    /// Completed records finished resolution jobs.
    pub completed: Counter,
}

impl Default for ResolveMetrics {
    fn default() -> Self {
        Self {
            requests: counter!("deployer_resolutions_total"),
            cache_hits: counter!("deployer_resolution_cache_hits_total"),
            queue_full: counter!("deployer_resolution_queue_full_total"),
            completed: counter!("deployer_resolutions_completed_total"),
        }
    }
}

/// Metrics collected from apply and prune passes.
#[derive(Clone)]
pub struct ApplyMetrics {
    /// Applied records objects sent through server-side apply.
    pub applied: Counter,
    /// Pruned records objects deleted as orphans.
    pub pruned: Counter,
}

impl Default for ApplyMetrics {
    fn default() -> Self {
        Self {
            applied: counter!("deployer_objects_applied_total"),
            pruned: counter!("deployer_objects_pruned_total"),
        }
    }
}
