//! Extras that only show up during tests.
#![allow(missing_docs)]

use std::sync::Arc;

use assert_json_diff::assert_json_include;
use futures::future::BoxFuture;
use http::{Request, Response, StatusCode};
use kube::{
    Resource, ResourceExt,
    client::{Body, Client},
    runtime::events::Recorder,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_test::mock::SendResponse;

use super::*;
use crate::{
    metrics::Metrics,
    plugin::{ComponentProvider, ComponentRequest, Descriptor, DownloadRequest},
    resolve::{Resolver, ResolverOptions},
    watches::WatchRegistry,
};
use api::v1alpha1::{Deployer, DeployerSpec, ResourceReference};

pub use test_log::test;

/// StaticProvider serves a fixed descriptor; scenarios that never resolve
/// don't care.
pub struct StaticProvider;

impl ComponentProvider for StaticProvider {
    fn component_version(&self, req: ComponentRequest) -> BoxFuture<'_, Result<Descriptor>> {
        Box::pin(async move {
            Ok(Descriptor {
                name: req.component,
                version: req.version,
                provider: None,
                resources: vec![],
            })
        })
    }

    fn download_resource(&self, _req: DownloadRequest) -> BoxFuture<'_, Result<Vec<u8>>> {
        Box::pin(async { Ok(b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n".to_vec()) })
    }
}

impl Context {
    pub fn deployer_tests() -> (Arc<Self>, DeployerServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let (triggers, triggers_rx) = mpsc::channel(64);
        let resolver = Resolver::spawn(
            mock_client.clone(),
            Arc::new(StaticProvider),
            ResolverOptions::default(),
            triggers.clone(),
            Metrics::default().resolve,
            CancellationToken::new(),
        );
        let watches = WatchRegistry::new(mock_client.clone(), triggers);
        let ctx = Self {
            client: mock_client.clone(),
            recorder: Recorder::new(mock_client.clone(), REPORTER.clone()),
            resolver,
            watches,
            discovery: Arc::new(kube::Discovery::new(mock_client)),
            metrics: Metrics::default(),
            apply_concurrency: 2,
        };
        (Arc::new(ctx), DeployerServerVerifier::new(handle, triggers_rx))
    }
}

pub mod deployer {
    use kube::Resource as _;

    use super::*;
    use crate::deployers::{PRUNE_FINALIZER, WATCH_FINALIZER};

    /// Return a minimal Deployer instance.
    pub fn test() -> Deployer {
        let mut d = Deployer::new(
            "test",
            DeployerSpec {
                resource_ref: ResourceReference {
                    name: "test-res".into(),
                    namespace: None,
                },
                ..Default::default()
            },
        );
        d.meta_mut().namespace = Some("default".into());
        d.meta_mut().uid = Some("42".into());
        d
    }

    pub fn finalized(mut d: Deployer) -> Deployer {
        d.finalizers_mut().push(PRUNE_FINALIZER.into());
        d.finalizers_mut().push(WATCH_FINALIZER.into());
        d
    }

    pub fn deleting(mut d: Deployer) -> Deployer {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
        d.meta_mut().deletion_timestamp = Some(Time(k8s_openapi::jiff::Timestamp::UNIX_EPOCH));
        d
    }
}

pub mod resource {
    use api::v1alpha1::{
        ComponentInfo, Digest, Resource, ResourceInfo, ResourceSpec, ResourceStatus,
    };
    use kube::Resource as _;
    use serde_json::json;

    /// Unready returns a Resource that has resolved identity but is not yet
    /// Ready.
    pub fn unready() -> Resource {
        let mut r = Resource::new("test-res", ResourceSpec::default());
        r.meta_mut().namespace = Some("default".into());
        r.status = Some(ResourceStatus {
            component: Some(ComponentInfo {
                name: "acme.org/app".into(),
                version: "1.0.0".into(),
                repository_spec: json!({"type": "oci", "baseUrl": "ghcr.io"}),
            }),
            resource: Some(ResourceInfo {
                name: "manifests".into(),
                digest: Some(Digest {
                    value: "abc".into(),
                    hash_algorithm: "SHA-256".into(),
                    normalisation_algorithm: "jsonNormalisation/v3".into(),
                }),
                ..Default::default()
            }),
            conditions: None,
            requeue_after: None,
        });
        r
    }
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

pub struct DeployerServerVerifier {
    handle: ApiServerHandle,
    // Keeps the trigger channel open so completions do not error.
    _triggers: mpsc::Receiver<kube::runtime::reflector::ObjectRef<Deployer>>,
}

/// Scenarios we want to test for.
pub enum DeployerScenario {
    /// No requests are expected at all.
    RadioSilence,
    /// Finalizers get added, the referenced Resource is missing, and the
    /// status records ResourceNotAvailable.
    MissingResource(Deployer),
    /// The referenced Resource exists but is not Ready; the status records
    /// ResourceNotSynced.
    UnreadyResource(Deployer),
    /// A deleted Deployer with no members drops both finalizers and events.
    CleanDeletion(Deployer),
}

impl DeployerServerVerifier {
    fn new(
        handle: ApiServerHandle,
        triggers: mpsc::Receiver<kube::runtime::reflector::ObjectRef<Deployer>>,
    ) -> Self {
        Self {
            handle,
            _triggers: triggers,
        }
    }

    /// Next_app_request returns the next reconciler-originated request,
    /// answering dynamic-watch traffic (list/watch with field selectors)
    /// inline so it cannot interleave with the scenario.
    async fn next_app_request(&mut self) -> Option<(Request<Body>, SendResponse<Response<Body>>)> {
        loop {
            let (request, send) = self.handle.next_request().await?;
            let uri = request.uri().to_string();
            if uri.contains("fieldSelector=") || uri.contains("watch=true") {
                let body = if uri.contains("watch=true") {
                    Vec::new()
                } else {
                    serde_json::to_vec(&json!({
                        "metadata": {"resourceVersion": "1"},
                        "items": [],
                    }))
                    .unwrap()
                };
                send.send_response(Response::builder().body(Body::from(body)).unwrap());
                continue;
            }
            eprintln!("{}\t{}", request.method(), &uri);
            return Some((request, send));
        }
    }

    pub fn run(self, scenario: DeployerScenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            use DeployerScenario::*;
            match scenario {
                RadioSilence => Ok(self),
                MissingResource(d) => {
                    self.handle_finalizer_patch(&d)
                        .await
                        .unwrap()
                        .handle_resource_get(None)
                        .await
                        .unwrap()
                        .handle_status_patch(&d, "ResourceNotAvailable")
                        .await
                }
                UnreadyResource(d) => {
                    self.handle_resource_get(Some(resource::unready()))
                        .await
                        .unwrap()
                        .handle_status_patch(&d, "ResourceNotSynced")
                        .await
                }
                CleanDeletion(d) => {
                    self.handle_finalizer_removal(&d, vec![crate::deployers::WATCH_FINALIZER])
                        .await
                        .unwrap()
                        .handle_finalizer_removal(&d, vec![])
                        .await
                        .unwrap()
                        .handle_event("DeleteRequested")
                        .await
                }
            }
            .expect("scenario completed without errors");
        })
    }

    async fn handle_finalizer_patch(mut self, d: &Deployer) -> Result<Self> {
        let (request, send) = self.next_app_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        let uri = request.uri().to_string();
        assert!(
            uri.starts_with(&format!(
                "/apis/delivery.ocm.software/v1alpha1/namespaces/default/deployers/{}",
                d.name_any()
            )),
            "unexpected path: {uri}"
        );
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let patch: Value = serde_json::from_slice(&req_body).expect("valid patch");
        assert_json_include!(
            actual: patch,
            expected: json!({
                "metadata": {
                    "finalizers": [
                        crate::deployers::PRUNE_FINALIZER,
                        crate::deployers::WATCH_FINALIZER,
                    ],
                },
            })
        );

        let d = deployer::finalized(d.clone());
        let response = serde_json::to_vec(&d).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }

    async fn handle_finalizer_removal(
        mut self,
        d: &Deployer,
        remaining: Vec<&str>,
    ) -> Result<Self> {
        let (request, send) = self.next_app_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let patch: Value = serde_json::from_slice(&req_body).expect("valid patch");
        let got = patch
            .pointer("/metadata/finalizers")
            .and_then(Value::as_array)
            .expect("patch carries finalizers");
        let got: Vec<&str> = got.iter().filter_map(Value::as_str).collect();
        assert_eq!(got, remaining, "unexpected finalizer set");

        let mut next = d.clone();
        next.meta_mut().finalizers = Some(remaining.iter().map(|s| s.to_string()).collect());
        let response = serde_json::to_vec(&next).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }

    async fn handle_resource_get(
        mut self,
        found: Option<api::v1alpha1::Resource>,
    ) -> Result<Self> {
        let (request, send) = self.next_app_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        let uri = request.uri().to_string();
        assert!(
            uri.starts_with("/apis/delivery.ocm.software/v1alpha1/namespaces/default/resources/"),
            "unexpected path: {uri}"
        );

        let response = match found {
            Some(r) => Response::builder()
                .body(Body::from(serde_json::to_vec(&r).unwrap()))
                .unwrap(),
            None => {
                let err = json!({
                    "code": 404,
                    "status": "Failure",
                    "reason": "NotFound",
                    "details": {
                        "group": "delivery.ocm.software",
                        "kind": "Resource",
                    },
                });
                Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from(serde_json::to_vec(&err).unwrap()))
                    .unwrap()
            }
        };
        send.send_response(response);
        Ok(self)
    }

    async fn handle_status_patch(mut self, d: &Deployer, reason: &str) -> Result<Self> {
        let (request, send) = self.next_app_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        let uri = request.uri().to_string();
        assert!(
            uri.starts_with(&format!(
                "/apis/delivery.ocm.software/v1alpha1/namespaces/default/deployers/{}/status",
                d.name_any()
            )),
            "unexpected path: {uri}"
        );

        let req_body = request.into_body().collect_bytes().await.unwrap();
        let patch: Value = serde_json::from_slice(&req_body).expect("valid patch");
        let conditions = patch
            .pointer("/status/conditions")
            .and_then(Value::as_array)
            .expect("status carries conditions");
        let ready = conditions
            .iter()
            .find(|c| c.get("type").and_then(Value::as_str) == Some("Ready"))
            .expect("Ready condition present");
        assert_eq!(ready.get("status").and_then(Value::as_str), Some("False"));
        assert_eq!(ready.get("reason").and_then(Value::as_str), Some(reason));

        let mut next = d.clone();
        next.status = serde_json::from_value(patch.get("status").cloned().unwrap()).ok();
        let response = serde_json::to_vec(&next).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }

    async fn handle_event(mut self, reason: &str) -> Result<Self> {
        let (request, send) = self.next_app_request().await.expect("service not called");
        assert!(
            matches!(*request.method(), http::Method::POST | http::Method::PATCH),
            "unexpected method"
        );
        let uri = request.uri().to_string();
        assert!(
            uri.starts_with("/apis/events.k8s.io/v1/namespaces/default/events"),
            "unexpected path: {uri}"
        );
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let event: Value = serde_json::from_slice(&req_body).expect("event object is json");
        assert_eq!(event.get("reason").and_then(Value::as_str), Some(reason));

        send.send_response(Response::builder().body(Body::from(req_body)).unwrap());
        Ok(self)
    }
}
