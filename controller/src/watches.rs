//! Watches tracks dynamic watches on deployed objects.
//!
//! Every applied object (and the Resource a Deployer points at) gets a
//! field-selector watch that re-triggers the owning Deployer's reconcile on
//! any event. Registration is idempotent per (parent, child); unregistering a
//! parent tears all of its watches down.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use futures::StreamExt;
use kube::{
    Api, Client,
    api::{ApiResource, DynamicObject},
    discovery::Scope,
    runtime::{WatchStreamExt, reflector::ObjectRef, watcher},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, trace};

use api::v1alpha1::Deployer;

/// WatchKey identifies one (parent, child) watch.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct WatchKey {
    parent: String,
    api_version: String,
    kind: String,
    namespace: Option<String>,
    name: String,
}

/// WatchRegistry owns the watch tasks for all Deployers.
pub struct WatchRegistry {
    client: Client,
    triggers: mpsc::Sender<ObjectRef<Deployer>>,
    inner: Mutex<HashMap<WatchKey, JoinHandle<()>>>,
}

impl WatchRegistry {
    /// New builds a registry feeding reconcile triggers into `triggers`.
    pub fn new(client: Client, triggers: mpsc::Sender<ObjectRef<Deployer>>) -> Arc<WatchRegistry> {
        Arc::new(WatchRegistry {
            client,
            triggers,
            inner: Mutex::new(HashMap::new()),
        })
    }

    /// Watch starts watching one object for `parent`, if not already watched.
    pub fn watch(
        &self,
        parent: &ObjectRef<Deployer>,
        ar: &ApiResource,
        scope: Scope,
        namespace: Option<&str>,
        name: &str,
    ) {
        let key = WatchKey {
            parent: parent_key(parent),
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
            namespace: namespace.map(String::from),
            name: name.to_string(),
        };
        let mut inner = self.inner.lock().expect("watch registry mutex poisoned");
        if inner.contains_key(&key) {
            return;
        }

        let api: Api<DynamicObject> = match scope {
            Scope::Cluster => Api::all_with(self.client.clone(), ar),
            Scope::Namespaced => match namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
                None => Api::default_namespaced_with(self.client.clone(), ar),
            },
        };
        let cfg = watcher::Config::default().fields(&format!("metadata.name={name}"));
        let parent = parent.clone();
        let triggers = self.triggers.clone();
        debug!(kind = key.kind, name = key.name, parent = key.parent, "starting watch");
        let handle = tokio::spawn(async move {
            let mut stream = std::pin::pin!(watcher(api, cfg).touched_objects());
            while let Some(ev) = stream.next().await {
                match ev {
                    Ok(obj) => {
                        trace!(name = obj.metadata.name, "watch event");
                        if triggers.send(parent.clone()).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => trace!(error = %err, "watch error, stream will retry"),
                }
            }
        });
        inner.insert(key, handle);
    }

    /// Unregister stops every watch owned by `parent`, reporting how many
    /// were removed.
    pub fn unregister(&self, parent: &ObjectRef<Deployer>) -> usize {
        let parent = parent_key(parent);
        let mut inner = self.inner.lock().expect("watch registry mutex poisoned");
        let keys: Vec<WatchKey> = inner
            .keys()
            .filter(|k| k.parent == parent)
            .cloned()
            .collect();
        for k in &keys {
            if let Some(handle) = inner.remove(k) {
                handle.abort();
            }
        }
        if !keys.is_empty() {
            debug!(parent, removed = keys.len(), "unregistered watches");
        }
        keys.len()
    }

    /// Active reports how many watches `parent` holds.
    pub fn active(&self, parent: &ObjectRef<Deployer>) -> usize {
        let parent = parent_key(parent);
        self.inner
            .lock()
            .expect("watch registry mutex poisoned")
            .keys()
            .filter(|k| k.parent == parent)
            .count()
    }
}

impl Drop for WatchRegistry {
    fn drop(&mut self) {
        let inner = self.inner.lock().expect("watch registry mutex poisoned");
        for handle in inner.values() {
            handle.abort();
        }
    }
}

fn parent_key(parent: &ObjectRef<Deployer>) -> String {
    format!(
        "{}/{}",
        parent.namespace.as_deref().unwrap_or(""),
        parent.name
    )
}
