//! Inflight tracks resolutions that are queued or running so duplicate
//! requests coalesce onto one worker.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use kube::runtime::reflector::ObjectRef;
use tokio::sync::{mpsc::error::TrySendError, watch};
use tracing::trace;

use super::{Completion, CompletionValue, ResolveOutcome, key::ResolutionKey, worker::Job};
use crate::{Error, Result};
use api::v1alpha1::Deployer;

/// InflightRegistry maps resolution keys to their completion handles.
///
/// One mutex guards the whole registry; nothing awaits while it is held. Job
/// submission holds this lock while consulting the queue (registry before
/// cache); completion inserts into the cache first and takes this lock last,
/// so neither path ever holds both locks.
#[derive(Default)]
pub(crate) struct InflightRegistry {
    inner: Mutex<HashMap<ResolutionKey, Inflight>>,
}

struct Inflight {
    tx: watch::Sender<CompletionValue>,
    waiters: Vec<ObjectRef<Deployer>>,
}

impl InflightRegistry {
    /// Submit registers `waiter` for `key`, enqueueing a job via `enqueue`
    /// only when no resolution for the key is already in flight.
    ///
    /// Register-or-piggyback happens under the single registry lock, so at
    /// most one job per key ever reaches the queue.
    pub(crate) fn submit<F>(
        &self,
        key: ResolutionKey,
        waiter: ObjectRef<Deployer>,
        enqueue: F,
    ) -> Result<Completion>
    where
        F: FnOnce() -> std::result::Result<(), TrySendError<Job>>,
    {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        if let Some(entry) = inner.get_mut(&key) {
            trace!(%key, "joining in-flight resolution");
            entry.waiters.push(waiter);
            return Ok(entry.tx.subscribe());
        }
        match enqueue() {
            Ok(()) => {
                let (tx, rx) = watch::channel(None);
                inner.insert(
                    key,
                    Inflight {
                        tx,
                        waiters: vec![waiter],
                    },
                );
                trace!(%key, "registered new resolution");
                Ok(rx)
            }
            Err(TrySendError::Full(_)) => Err(Error::QueueFull),
            Err(TrySendError::Closed(_)) => Err(Error::Canceled),
        }
    }

    /// Complete publishes `outcome` for `key` and removes the entry, in one
    /// critical section, returning the waiters to notify.
    ///
    /// Waiters registered before this call observe the outcome through their
    /// completion handle; later callers find no entry and re-check the cache,
    /// which already holds the result.
    pub(crate) fn complete(
        &self,
        key: &ResolutionKey,
        outcome: ResolveOutcome,
    ) -> Vec<ObjectRef<Deployer>> {
        let entry = self
            .inner
            .lock()
            .expect("registry mutex poisoned")
            .remove(key);
        match entry {
            Some(e) => {
                e.tx.send_replace(Some(outcome));
                e.waiters
            }
            None => Vec::new(),
        }
    }

    /// Contains reports whether `key` is in flight.
    pub(crate) fn contains(&self, key: &ResolutionKey) -> bool {
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .contains_key(key)
    }
}

/// Outcome_err wraps a controller error for fan-out to every waiter.
pub(crate) fn outcome_err(err: Error) -> ResolveOutcome {
    Err(Arc::new(err))
}
