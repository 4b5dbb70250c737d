#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Controller implements common functionality for the controller binary and
//! the controller functions themselves.

use std::{env, pin::Pin, sync::Arc, sync::LazyLock};

use futures::Future;
use kube::runtime::events;

/// Prelude is the common types for CRD controllers.
pub(crate) mod prelude {
    pub use std::{borrow::Cow, collections::BTreeMap, sync::Arc};

    pub use futures::prelude::*;
    pub use k8s_openapi::apimachinery::pkg::apis::meta::{self, v1::Condition};
    pub use kube::{
        self,
        api::{Api, Patch, PatchParams},
        runtime::{
            controller::{Action, Controller},
            events::{Event, EventType},
            reflector::ObjectRef,
            watcher,
        },
        Resource, ResourceExt,
    };
    pub use tokio_util::sync::CancellationToken;
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use api::v1alpha1;

    pub use super::{now, ocm_annotation, ocm_label};
    pub use super::{Context, ControllerFuture, Error, Result};
    pub use super::{CONTROLLER_NAME, FIELD_MANAGER, PARENT_FIELD_MANAGER, PATCH_PARAMS, TOOLING};
}

pub mod cache;
pub mod config;
pub mod deployers;
pub mod manifest;
pub mod metrics;
pub mod plugin;
pub mod resolve;
pub mod watches;

#[cfg(test)]
pub(crate) mod testing;

/// Error enumerates the failure modes of the controller.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// TracingConfig indicates the error came from the tracing setup.
    #[error("tracing_subscriber error: {0}")]
    TracingConfig(#[from] tracing_subscriber::filter::ParseError),
    /// Tracing indicates the error came from installing the tracing subscriber.
    #[error("tracing error: {0}")]
    Tracing(#[from] tracing::subscriber::SetGlobalDefaultError),
    /// Kube is a generic error from the `kube` crate.
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    /// KubeConfig indicates the process was unable to find a kubeconfig.
    #[error("kubeconfig error: {0}")]
    KubeConfig(#[from] kube::config::InferConfigError),
    /// Io indicates some OS-level I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON indicates a JSON serialization failed.
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),
    /// YAML indicates a YAML deserialization failed.
    #[error("yaml error: {0}")]
    YAML(#[from] serde_yaml::Error),
    /// AddrParse indicates the provided string failed to parse into an address.
    #[error("parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    /// Tokio indicates an error starting tasks.
    #[error("tokio error: {0}")]
    Tokio(#[from] tokio::task::JoinError),
    /// ApplySet is an error from the applyset engine.
    #[error("applyset error: {0}")]
    ApplySet(#[from] applyset::Error),

    /// Configuration indicates an invalid or unresolvable OCM configuration
    /// reference.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// QueueFull indicates the resolution queue rejected a submission;
    /// transient, retried with backoff.
    #[error("resolution queue is full")]
    QueueFull,
    /// Provider indicates the component-descriptor provider failed.
    #[error("component version provider error: {0}")]
    Provider(String),
    /// DigestMismatch indicates downloaded content did not match its pinned
    /// digest.
    #[error("digest mismatch: {0}")]
    DigestMismatch(String),
    /// Decode indicates a malformed or empty manifest stream.
    #[error("manifest decode error: {0}")]
    Decode(String),
    /// Canceled indicates a resolution was aborted by shutdown.
    #[error("resolution canceled")]
    Canceled,

    /// MissingName indicates a name was needed and not provided.
    #[error("missing name for kubernetes object: {0}")]
    MissingName(&'static str),
    /// Other is a catch-all error.
    #[error("some other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Result typedef for controllers.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Context is common context for controllers.
pub struct Context {
    /// Client is a k8s client. This should only ever be `clone()`'d out of
    /// the Context.
    pub client: kube::Client,
    /// Recorder publishes Events for the controllers.
    pub recorder: events::Recorder,
    /// Resolver is the shared component-version resolver.
    pub resolver: Arc<resolve::Resolver>,
    /// Watches tracks the dynamic watches registered for deployed objects.
    pub watches: Arc<watches::WatchRegistry>,
    /// Discovery is the REST-mapping source for the applyset engine.
    pub discovery: Arc<kube::Discovery>,
    /// Metrics are the controller-wide counters.
    pub metrics: metrics::Metrics,
    /// Apply_concurrency bounds concurrent SSA patches inside one reconcile.
    pub apply_concurrency: usize,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ctx")
    }
}

/// ControllerFuture is the type the controller constructors should return.
pub type ControllerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// REPORTER identifies this controller in published Events.
pub static REPORTER: LazyLock<events::Reporter> = LazyLock::new(|| events::Reporter {
    controller: CONTROLLER_NAME.to_string(),
    instance: env::var("CONTROLLER_POD_NAME").ok(),
});

/// Now reports the current time as kubernetes metadata.
pub fn now() -> k8s_openapi::apimachinery::pkg::apis::meta::v1::Time {
    k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(k8s_openapi::jiff::Timestamp::now())
}

/// Keyify sanitizes the key for use in k8s metadata.
fn keyify<S: ToString, K: AsRef<str>>(space: S, key: K) -> String {
    let mut out = space.to_string();
    key.as_ref()
        .chars()
        .map(|c| match c {
            '_' | ' ' | '\t' | '\n' => '-',
            _ => c.to_ascii_lowercase(),
        })
        .for_each(|c| out.push(c));
    out
}

/// Ocm_label returns the provided argument as a name in the controller's
/// space, suitable for use as a label.
pub fn ocm_label<S: AsRef<str>>(s: S) -> String {
    keyify("delivery.ocm.software/", s)
}

/// Ocm_annotation returns the provided argument as a name in the controller's
/// space, suitable for use as an annotation.
///
/// Unlike [ocm_label], path-style suffixes are kept as-is so that nested keys
/// like `resource/digest/value` survive.
pub fn ocm_annotation<S: AsRef<str>>(s: S) -> String {
    format!("delivery.ocm.software/{}", s.as_ref())
}

/// MANAGED_BY_LABEL marks objects managed by this controller.
pub static MANAGED_BY_LABEL: LazyLock<String> = LazyLock::new(|| ocm_label("managed-by"));
/// RESOURCE_NAME_LABEL carries the name of the deployed resource entry.
pub static RESOURCE_NAME_LABEL: LazyLock<String> = LazyLock::new(|| ocm_label("resource-name"));
/// RESOURCE_VERSION_LABEL carries the version of the deployed resource entry.
pub static RESOURCE_VERSION_LABEL: LazyLock<String> =
    LazyLock::new(|| ocm_label("resource-version"));

/// PATCH_PARAMS is default patch parameters.
pub static PATCH_PARAMS: LazyLock<kube::api::PatchParams> =
    LazyLock::new(|| kube::api::PatchParams::apply(CONTROLLER_NAME));

/// PARENT_PATCH_PARAMS is the patch parameters for ApplySet parent metadata,
/// written under a dedicated field owner so member ownership and parent
/// bookkeeping never collide.
pub static PARENT_PATCH_PARAMS: LazyLock<kube::api::PatchParams> =
    LazyLock::new(|| kube::api::PatchParams::apply(PARENT_FIELD_MANAGER).force());

/// TOOLING is the KEP-3659 tooling tag of this controller.
pub static TOOLING: LazyLock<String> =
    LazyLock::new(|| format!("{CONTROLLER_NAME}/{}", env!("CARGO_PKG_VERSION")));

/// CONTROLLER_NAME is the name the controller uses whenever it needs a
/// human-readable name.
pub const CONTROLLER_NAME: &str = "deployer-controller";

/// FIELD_MANAGER is the field owner for member objects.
pub const FIELD_MANAGER: &str = CONTROLLER_NAME;

/// PARENT_FIELD_MANAGER is the field owner for ApplySet parent metadata.
pub const PARENT_FIELD_MANAGER: &str = "deployer-controller-parent";
