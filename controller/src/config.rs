//! Config assembles the effective OCM configuration for one reconcile.
//!
//! A Deployer names its own configuration objects; the Resource it deploys
//! from may carry more. The effective configuration is the deduplicated
//! concatenation of both, with entries marked `DoNotPropagate` on the
//! Resource kept out. Entry data is loaded so semantically identical
//! configurations hash identically regardless of reference order.

use std::collections::{BTreeMap, BTreeSet};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, Client};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{instrument, trace};

use crate::{Error, Result};
use api::v1alpha1::{self, PropagationPolicy};

/// ConfigEntry is one loaded configuration object.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ConfigEntry {
    /// Kind of the source object.
    pub kind: String,
    /// Namespace the object was loaded from.
    pub namespace: String,
    /// Name of the source object.
    pub name: String,
    /// Data is the object's payload; Secret values are base64-encoded.
    pub data: BTreeMap<String, String>,
}

/// EffectiveConfig is the transitively resolved configuration for one CR.
#[derive(Clone, Debug, Default, Serialize)]
pub struct EffectiveConfig {
    /// Entries in canonical order.
    pub entries: Vec<ConfigEntry>,
}

impl EffectiveConfig {
    /// Canonical_bytes renders the configuration deterministically for
    /// hashing: entries sorted, keys sorted, propagation metadata absent.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut entries = self.entries.clone();
        entries.sort_unstable();
        serde_json::to_vec(&entries).expect("string maps always serialize")
    }

    /// Hash_hex is the hex sha256 of the canonical rendering.
    pub fn hash_hex(&self) -> String {
        hex(&Sha256::digest(self.canonical_bytes()))
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Effective_refs merges a Deployer's configuration references with the ones
/// its Resource propagates.
///
/// Order is preserved (Deployer first), duplicates by (kind, namespace, name)
/// collapse to the first occurrence, and the Resource's `DoNotPropagate`
/// entries stay behind.
pub fn effective_refs(
    deployer: &v1alpha1::Deployer,
    resource: &v1alpha1::Resource,
) -> Vec<v1alpha1::OcmConfigRef> {
    use kube::ResourceExt;
    let deployer_ns = deployer.namespace();
    let resource_ns = resource.namespace();

    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    let propagated = resource.spec.ocm_config.iter().filter(|r| {
        !matches!(r.policy, Some(PropagationPolicy::DoNotPropagate))
    });
    for (r, holder_ns) in deployer
        .spec
        .ocm_config
        .iter()
        .map(|r| (r, &deployer_ns))
        .chain(propagated.map(|r| (r, &resource_ns)))
    {
        let mut r = r.clone();
        if r.namespace.is_none() {
            r.namespace = holder_ns.clone();
        }
        if seen.insert((r.kind.clone(), r.namespace.clone(), r.name.clone())) {
            out.push(r);
        }
    }
    out
}

/// Echo_refs strips propagation metadata from references for the status echo.
pub fn echo_refs(refs: &[v1alpha1::OcmConfigRef]) -> Vec<v1alpha1::OcmConfigRef> {
    refs.iter()
        .map(|r| v1alpha1::OcmConfigRef {
            policy: None,
            ..r.clone()
        })
        .collect()
}

/// Load fetches the referenced objects and assembles the effective
/// configuration.
#[instrument(skip(client, refs), fields(refs = refs.len()))]
pub async fn load(
    client: &Client,
    default_namespace: &str,
    refs: &[v1alpha1::OcmConfigRef],
) -> Result<EffectiveConfig> {
    let mut entries = Vec::with_capacity(refs.len());
    for r in refs {
        let ns = r.namespace.as_deref().unwrap_or(default_namespace);
        let data = match r.kind.as_str() {
            "ConfigMap" => {
                let api = Api::<ConfigMap>::namespaced(client.clone(), ns);
                let cm = api.get_opt(&r.name).await?.ok_or_else(|| {
                    Error::Configuration(format!("ConfigMap {ns}/{} not found", r.name))
                })?;
                let mut data: BTreeMap<String, String> = cm.data.unwrap_or_default();
                for (k, v) in cm.binary_data.unwrap_or_default() {
                    data.insert(k, STANDARD.encode(v.0));
                }
                data
            }
            "Secret" => {
                let api = Api::<Secret>::namespaced(client.clone(), ns);
                let sec = api.get_opt(&r.name).await?.ok_or_else(|| {
                    Error::Configuration(format!("Secret {ns}/{} not found", r.name))
                })?;
                sec.data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k, STANDARD.encode(v.0)))
                    .collect()
            }
            kind => {
                return Err(Error::Configuration(format!(
                    "unsupported ocmConfig kind {kind:?}"
                )));
            }
        };
        trace!(kind = r.kind, name = r.name, ns, "loaded config entry");
        entries.push(ConfigEntry {
            kind: r.kind.clone(),
            namespace: ns.to_string(),
            name: r.name.clone(),
            data,
        });
    }
    Ok(EffectiveConfig { entries })
}
