//! Worker holds the resolution worker loop.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use super::{ResolveParams, ResolveResult, Shared, inflight::outcome_err, key};
use crate::{Error, Result, config, plugin::ComponentRequest};

/// Job is one queued resolution.
pub(crate) struct Job {
    /// Key the submission was registered under.
    pub(crate) key: key::ResolutionKey,
    /// Params to resolve with.
    pub(crate) params: ResolveParams,
}

/// Run consumes jobs from the shared queue until it closes or `cancel` fires.
///
/// N copies of this loop share one receiver; together they form the worker
/// pool.
pub(crate) async fn run(
    shared: Arc<Shared>,
    queue: Arc<Mutex<mpsc::Receiver<Job>>>,
    cancel: CancellationToken,
) {
    loop {
        let job = {
            let mut rx = queue.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else {
            debug!("resolution worker stopping");
            return;
        };

        // Cancellation mid-job aborts the plugin call; every waiter sees the
        // cancellation instead of hanging on the completion handle.
        let outcome = tokio::select! {
            _ = cancel.cancelled() => outcome_err(Error::Canceled),
            res = execute(&shared, &job) => res.map_err(Arc::new),
        };
        let waiters = shared.registry.complete(&job.key, outcome);
        shared.metrics.completed.increment(1);
        for w in waiters {
            let _ = shared.triggers.send(w).await;
        }
        if cancel.is_cancelled() {
            return;
        }
    }
}

/// Execute runs one resolution end to end.
///
/// The effective configuration is re-loaded and the key re-derived here: the
/// configuration may have changed since submission, and another worker may
/// have populated the cache in the meantime.
#[instrument(skip_all, fields(key = %job.key, component = job.params.component))]
async fn execute(shared: &Shared, job: &Job) -> Result<ResolveResult> {
    let p = &job.params;
    let cfg = config::load(&shared.client, &p.namespace, &p.config_refs).await?;
    let key = key::resolution_key(&p.repository_spec, &p.component, &p.version, &cfg);
    if let Some(hit) = shared.cache.get(&key) {
        trace!("resolution raced into the cache");
        return Ok(hit);
    }

    let descriptor = shared
        .provider
        .component_version(ComponentRequest {
            repository_spec: p.repository_spec.clone(),
            component: p.component.clone(),
            version: p.version.clone(),
            config: cfg.clone(),
        })
        .await?;
    debug!(
        name = descriptor.name,
        version = descriptor.version,
        "resolved component version"
    );
    let result = ResolveResult {
        descriptor: Arc::new(descriptor),
        config_hash: cfg.hash_hex(),
    };
    shared.cache.insert(key, result.clone());
    Ok(result)
}
