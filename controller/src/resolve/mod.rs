//! Resolve is the front door for component-version resolution.
//!
//! Reconcilers call [`Resolver::resolve`] synchronously: a cache hit returns
//! the descriptor immediately, anything else lands on a bounded worker pool
//! and the caller yields with [`Resolution::InProgress`]. Completions are
//! pushed onto a trigger channel wired into the controller, so the affected
//! CRs re-enter reconcile and find the cache populated.

use std::{sync::Arc, time::Duration};

use kube::{Client, runtime::reflector::ObjectRef};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    Error, Result,
    cache::DescriptorCache,
    config,
    metrics::ResolveMetrics,
    plugin::{ComponentProvider, Descriptor},
};
use api::v1alpha1::{Deployer, OcmConfigRef};

pub mod key;

mod inflight;
mod worker;

use inflight::InflightRegistry;
use worker::Job;

/// ResolveResult is one successful resolution: the descriptor plus the hash
/// of the configuration it was resolved under.
#[derive(Clone, Debug)]
pub struct ResolveResult {
    /// Descriptor of the component version.
    pub descriptor: Arc<Descriptor>,
    /// ConfigHash is the hex sha256 of the effective configuration.
    pub config_hash: String,
}

/// ResolveOutcome is what a finished job publishes to its waiters.
pub type ResolveOutcome = std::result::Result<ResolveResult, Arc<Error>>;

/// CompletionValue is the state of a completion handle: `None` while the job
/// runs, `Some` once it finished.
pub type CompletionValue = Option<ResolveOutcome>;

/// Completion is a readable handle on one in-flight resolution.
pub type Completion = watch::Receiver<CompletionValue>;

/// Resolution is the synchronous answer to a resolve call.
pub enum Resolution {
    /// Ready carries a cached result.
    Ready(ResolveResult),
    /// InProgress signals that a worker owns the resolution; the reconcile
    /// loop should yield and wait for its trigger.
    InProgress(Completion),
}

/// ResolveParams identify what to resolve.
#[derive(Clone, Debug)]
pub struct ResolveParams {
    /// Namespace configuration references default to.
    pub namespace: String,
    /// RepositorySpec is the opaque repository specification.
    pub repository_spec: Value,
    /// Component name.
    pub component: String,
    /// Component version.
    pub version: String,
    /// Config_refs are the effective configuration references.
    pub config_refs: Vec<OcmConfigRef>,
}

/// ResolverOptions sizes the resolver.
#[derive(Clone, Debug)]
pub struct ResolverOptions {
    /// Workers is the number of concurrent resolution workers.
    pub workers: usize,
    /// Queue_depth bounds the submission queue; overflow is backpressure.
    pub queue_depth: usize,
    /// Cache_capacity bounds the descriptor cache.
    pub cache_capacity: usize,
    /// Cache_ttl expires cache entries; zero disables expiry.
    pub cache_ttl: Duration,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        ResolverOptions {
            workers: 4,
            queue_depth: 64,
            cache_capacity: 128,
            cache_ttl: Duration::ZERO,
        }
    }
}

pub(crate) struct Shared {
    pub(crate) client: Client,
    pub(crate) provider: Arc<dyn ComponentProvider>,
    pub(crate) cache: DescriptorCache,
    pub(crate) registry: InflightRegistry,
    pub(crate) triggers: mpsc::Sender<ObjectRef<Deployer>>,
    pub(crate) metrics: ResolveMetrics,
}

/// Resolver deduplicates, caches, and dispatches component-version
/// resolutions.
pub struct Resolver {
    shared: Arc<Shared>,
    queue: mpsc::Sender<Job>,
}

impl Resolver {
    /// Spawn builds a resolver and starts its worker pool on the current
    /// runtime.
    ///
    /// Completion notifications for interested Deployers are sent on
    /// `triggers`; cancellation of `cancel` aborts running plugin calls and
    /// publishes the cancellation to every waiter.
    pub fn spawn(
        client: Client,
        provider: Arc<dyn ComponentProvider>,
        opts: ResolverOptions,
        triggers: mpsc::Sender<ObjectRef<Deployer>>,
        metrics: ResolveMetrics,
        cancel: CancellationToken,
    ) -> Arc<Resolver> {
        let shared = Arc::new(Shared {
            client,
            provider,
            cache: DescriptorCache::new(opts.cache_capacity, opts.cache_ttl),
            registry: InflightRegistry::default(),
            triggers,
            metrics,
        });
        let (tx, rx) = mpsc::channel(opts.queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..opts.workers.max(1) {
            tokio::spawn(worker::run(shared.clone(), rx.clone(), cancel.clone()));
        }
        Arc::new(Resolver { shared, queue: tx })
    }

    /// Resolve answers from the cache or hands the resolution to the pool.
    ///
    /// Computing the key requires loading the effective configuration, which
    /// can fail before the pool is ever involved. A full queue surfaces as
    /// [`Error::QueueFull`] immediately.
    #[instrument(skip_all, fields(component = params.component, version = params.version))]
    pub async fn resolve(
        &self,
        waiter: ObjectRef<Deployer>,
        params: ResolveParams,
    ) -> Result<Resolution> {
        self.shared.metrics.requests.increment(1);
        let cfg =
            config::load(&self.shared.client, &params.namespace, &params.config_refs).await?;
        let key = key::resolution_key(
            &params.repository_spec,
            &params.component,
            &params.version,
            &cfg,
        );
        if let Some(hit) = self.shared.cache.get(&key) {
            self.shared.metrics.cache_hits.increment(1);
            return Ok(Resolution::Ready(hit));
        }

        let submitted = self.shared.registry.submit(key, waiter, || {
            self.queue.try_send(Job {
                key,
                params: params.clone(),
            })
        });
        match submitted {
            Ok(rx) => Ok(Resolution::InProgress(rx)),
            Err(Error::QueueFull) => {
                self.shared.metrics.queue_full.increment(1);
                Err(Error::QueueFull)
            }
            Err(err) => Err(err),
        }
    }

    /// Download_blob fetches one resource's content through the provider.
    pub async fn download_blob(&self, req: crate::plugin::DownloadRequest) -> Result<Vec<u8>> {
        self.shared.provider.download_resource(req).await
    }

    /// Load_config assembles the effective configuration for `params`.
    pub async fn load_config(&self, params: &ResolveParams) -> Result<config::EffectiveConfig> {
        config::load(&self.shared.client, &params.namespace, &params.config_refs).await
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &DescriptorCache {
        &self.shared.cache
    }
}
