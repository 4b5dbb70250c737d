//! Plugin is the contract with the external plugin manager.
//!
//! The core consumes exactly two operations: resolving a component version to
//! its descriptor, and downloading one resource's content. The RPC framework
//! behind them is not this crate's business; the shipped client speaks
//! newline-delimited JSON over a Unix socket and nothing more.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, instrument};

use crate::{Error, Result, config::EffectiveConfig};
use api::v1alpha1;

/// Descriptor is a deeply immutable record of one component version.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Name of the component.
    pub name: String,
    /// Version of the component.
    pub version: String,
    /// Provider of the component, if recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Resources embedded in the component version.
    #[serde(default)]
    pub resources: Vec<DescriptorResource>,
}

impl Descriptor {
    /// Select finds the resource entry matching `info`'s identity.
    ///
    /// The `name` key is mandatory; every extra-identity key must match; the
    /// version is only compared when `info` pins one.
    pub fn select(&self, info: &v1alpha1::ResourceInfo) -> Option<&DescriptorResource> {
        self.resources.iter().find(|r| {
            r.name == info.name
                && info
                    .extra_identity
                    .iter()
                    .all(|(k, v)| r.extra_identity.get(k) == Some(v))
                && match &info.version {
                    Some(v) => r.version.as_ref() == Some(v),
                    None => true,
                }
        })
    }
}

/// DescriptorResource is one resource entry of a descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorResource {
    /// Name is the mandatory identity key.
    pub name: String,
    /// Version of the resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// ExtraIdentity holds additional identity keys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_identity: BTreeMap<String, String>,
    /// Digest pins the resource content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<v1alpha1::Digest>,
    /// Access is the opaque serialized access specification.
    #[serde(default)]
    pub access: Value,
}

/// ComponentRequest asks for one component version's descriptor.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRequest {
    /// RepositorySpec is the opaque repository specification.
    pub repository_spec: Value,
    /// Component name.
    pub component: String,
    /// Component version.
    pub version: String,
    /// Config is the effective configuration credentials are resolved from.
    pub config: EffectiveConfig,
}

/// DownloadRequest asks for one resource's content.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    /// RepositorySpec is the opaque repository specification.
    pub repository_spec: Value,
    /// Component name.
    pub component: String,
    /// Component version.
    pub version: String,
    /// Resource identity to download.
    pub resource: v1alpha1::ResourceInfo,
    /// Config is the effective configuration credentials are resolved from.
    pub config: EffectiveConfig,
}

/// ComponentProvider is the narrow interface to the plugin manager.
pub trait ComponentProvider: Send + Sync {
    /// Component_version resolves a component version to its descriptor.
    fn component_version(&self, req: ComponentRequest) -> BoxFuture<'_, Result<Descriptor>>;
    /// Download_resource fetches one resource's content, verifying its
    /// digest.
    fn download_resource(&self, req: DownloadRequest) -> BoxFuture<'_, Result<Vec<u8>>>;
}

/// PluginClient talks to the plugin manager over a Unix socket.
///
/// One request per connection; requests and responses are single
/// newline-terminated JSON documents.
pub struct PluginClient {
    socket: PathBuf,
}

impl PluginClient {
    /// New builds a client for the plugin manager listening on `socket`.
    pub fn new<P: Into<PathBuf>>(socket: P) -> Arc<PluginClient> {
        Arc::new(PluginClient {
            socket: socket.into(),
        })
    }

    #[instrument(skip_all, fields(socket = %self.socket.display()))]
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let mut stream = UnixStream::connect(&self.socket).await?;
        let mut buf = serde_json::to_vec(&json!({"method": method, "params": params}))?;
        buf.push(b'\n');
        stream.write_all(&buf).await?;
        stream.shutdown().await?;

        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).await?;
        debug!(method, bytes = line.len(), "plugin call returned");
        let reply: Value = serde_json::from_str(&line)?;
        if let Some(err) = reply.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified plugin error")
                .to_string();
            return Err(match err.get("kind").and_then(Value::as_str) {
                Some("DigestMismatch") => Error::DigestMismatch(message),
                _ => Error::Provider(message),
            });
        }
        reply
            .get("result")
            .cloned()
            .ok_or_else(|| Error::Provider("plugin reply carries no result".into()))
    }
}

impl ComponentProvider for PluginClient {
    fn component_version(&self, req: ComponentRequest) -> BoxFuture<'_, Result<Descriptor>> {
        Box::pin(async move {
            let result = self
                .call("GetComponentVersionRepository", serde_json::to_value(&req)?)
                .await?;
            Ok(serde_json::from_value(result)?)
        })
    }

    fn download_resource(&self, req: DownloadRequest) -> BoxFuture<'_, Result<Vec<u8>>> {
        Box::pin(async move {
            let result = self
                .call("DownloadResource", serde_json::to_value(&req)?)
                .await?;
            let data = result
                .get("data")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Provider("download reply carries no data".into()))?;
            STANDARD
                .decode(data)
                .map_err(|err| Error::Provider(format!("undecodable download payload: {err}")))
        })
    }
}
