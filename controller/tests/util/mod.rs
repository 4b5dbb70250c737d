#![allow(dead_code)]
use std::sync::Arc;

use kube::runtime::{events::Recorder, reflector::ObjectRef};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use api::v1alpha1;
use controller::{
    Context, REPORTER,
    plugin::PluginClient,
    resolve::{Resolver, ResolverOptions},
    watches::WatchRegistry,
};

pub async fn test_context() -> (
    Arc<Context>,
    mpsc::Receiver<ObjectRef<v1alpha1::Deployer>>,
) {
    let config = kube::Config::infer()
        .await
        .expect("unable to infer kubeconfig");
    let client = kube::client::ClientBuilder::try_from(config.clone())
        .expect("unable to create client builder")
        .build();
    let discovery = kube::Discovery::new(client.clone())
        .run()
        .await
        .expect("unable to run discovery");

    let metrics = controller::metrics::Metrics::default();
    let (triggers_tx, triggers_rx) = mpsc::channel(64);
    let resolver = Resolver::spawn(
        client.clone(),
        PluginClient::new(
            std::env::var("PLUGIN_MANAGER_SOCKET")
                .unwrap_or_else(|_| "/run/deployer/plugin.sock".into()),
        ),
        ResolverOptions::default(),
        triggers_tx.clone(),
        metrics.resolve.clone(),
        CancellationToken::new(),
    );
    let watches = WatchRegistry::new(client.clone(), triggers_tx);
    let ctx = Arc::new(Context {
        client: client.clone(),
        recorder: Recorder::new(client, REPORTER.clone()),
        resolver,
        watches,
        discovery: Arc::new(discovery),
        metrics,
        apply_concurrency: 4,
    });
    (ctx, triggers_rx)
}

macro_rules! load_each {
    ($api:ident, $($kind:ty),+) => {
        use kube::{api::PostParams, CustomResourceExt, ResourceExt};
        let params = PostParams::default();
        $({
        let crd = <$kind>::crd();
        let name = crd.name_any();
        trace!(name, "checking CRD");
        if $api.get_metadata_opt(&name).await?.is_none() {
            trace!(name, "creating CRD");
            $api.create(&params, &crd).await?;
        }
        trace!(name, "CRD ok");
        })+
    }
}

pub async fn load_crds(client: &kube::Client) -> controller::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::Api;
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());

    load_each!(api, v1alpha1::Deployer, v1alpha1::Resource);

    Ok(())
}

pub mod prelude {
    pub use std::sync::Arc;

    pub use kube::{Api, api::PostParams};
    pub use serde_json::json;
    pub use test_log::test;
    pub use tokio::{signal, task, time::Duration};
    pub use tokio_util::sync::CancellationToken;
}
