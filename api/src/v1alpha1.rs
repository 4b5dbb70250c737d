//! Module `v1alpha1` implements the v1alpha1 deployer CRD API.
use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta;
use kube::{CustomResource, KubeSchema};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// VERSION is the kubernetes API group's version.
pub static VERSION: &str = "v1alpha1";

/// DeployerSpec describes the desired state of a Deployer.
///
/// A Deployer points at a [Resource] and keeps the manifest embedded in that
/// resource continuously applied to the cluster.
#[derive(
    KubeSchema, Clone, CustomResource, Debug, Default, Deserialize, PartialEq, Serialize, Validate,
)]
#[kube(
    group = "delivery.ocm.software",
    version = "v1alpha1",
    kind = "Deployer",
    namespaced,
    status = "DeployerStatus",
    shortname = "dep",
    category = "ocm",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct DeployerSpec {
    /// ResourceRef names the Resource holding the manifest to deploy.
    pub resource_ref: ResourceReference,
    /// Suspend stops all reconciliation of this Deployer when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
    /// OcmConfig references configuration objects consulted when resolving
    /// the component version, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ocm_config: Vec<OcmConfigRef>,
}

/// DeployerStatus describes the observed state of a Deployer.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeployerStatus {
    /// Conditions reports k8s-style conditions for various parts of the system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "schema::conditions")]
    pub conditions: Option<Vec<meta::v1::Condition>>,

    /// Deployed lists the objects applied by the most recent successful
    /// reconcile.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployed: Vec<DeployedObjectReference>,

    /// EffectiveOcmConfig echoes the configuration references that were
    /// actually used, after propagation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effective_ocm_config: Vec<OcmConfigRef>,
}

impl DeployerStatus {
    /// Add_condition adds a Condition, ensuring the list is deduplicated.
    pub fn add_condition(&mut self, cnd: meta::v1::Condition) {
        let mut out = self.conditions.take().unwrap_or_default();
        out.retain(|c| c.type_ != cnd.type_);
        out.push(cnd);
        out.sort_unstable_by(|a, b| a.type_.cmp(&b.type_));
        self.conditions = Some(out);
    }

    /// Add_deployed records a deployed object, deduplicating by identity.
    pub fn add_deployed(&mut self, r: DeployedObjectReference) {
        self.deployed.retain(|d| !d.same_object(&r));
        self.deployed.push(r);
        self.deployed.sort_unstable();
    }
}

/// ResourceReference names a Resource, defaulting to the referrer's
/// namespace.
#[derive(
    Clone, Default, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize, Validate,
    KubeSchema,
)]
#[serde(rename_all = "camelCase")]
#[x_kube(validation = ("self.name != ''", r#""name" must be populated"#))]
pub struct ResourceReference {
    /// The name of the referent.
    pub name: String,
    /// The namespace of the referent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// OcmConfigRef references a ConfigMap or Secret carrying OCM configuration.
#[derive(
    Clone, Default, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize, Validate,
    KubeSchema,
)]
#[serde(rename_all = "camelCase")]
#[x_kube(validation = ("self.kind == 'ConfigMap' || self.kind == 'Secret'", r#""kind" must be "ConfigMap" or "Secret""#))]
pub struct OcmConfigRef {
    /// Kind of the referent. Only "ConfigMap" and "Secret" are supported.
    pub kind: String,
    /// The name of the referent.
    pub name: String,
    /// The namespace of the referent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Policy controls whether this entry propagates to referring objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<PropagationPolicy>,
}

/// PropagationPolicy selects whether a configuration entry is inherited by
/// objects that reference its holder.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize, JsonSchema,
)]
pub enum PropagationPolicy {
    /// Propagate makes the entry visible to referring objects.
    #[default]
    Propagate,
    /// DoNotPropagate keeps the entry local to its holder.
    DoNotPropagate,
}

/// DeployedObjectReference is a stable reference to an object applied to the
/// cluster.
#[derive(
    Clone, Default, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize, Validate,
    KubeSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct DeployedObjectReference {
    /// ApiVersion of the referent.
    pub api_version: String,
    /// Kind of the referent.
    pub kind: String,
    /// Name of the referent.
    pub name: String,
    /// Namespace of the referent, empty for cluster-scoped objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// UID of the referent as observed after apply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl DeployedObjectReference {
    /// Same_object reports whether both references name the same object,
    /// ignoring the observed UID.
    pub fn same_object(&self, other: &Self) -> bool {
        self.api_version == other.api_version
            && self.kind == other.kind
            && self.name == other.name
            && self.namespace == other.namespace
    }
}

/// ResourceSpec describes a single resource inside a component version.
///
/// The resource controller reconciles this into the status fields the
/// deployer consumes; the deployer never writes to these objects.
#[derive(
    KubeSchema, Clone, CustomResource, Debug, Default, Deserialize, PartialEq, Serialize, Validate,
)]
#[kube(
    group = "delivery.ocm.software",
    version = "v1alpha1",
    kind = "Resource",
    namespaced,
    status = "ResourceStatus",
    shortname = "res",
    category = "ocm",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// OcmConfig references configuration objects used when resolving the
    /// component version this resource belongs to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ocm_config: Vec<OcmConfigRef>,
}

/// ResourceStatus describes the observed state of a Resource.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Conditions reports k8s-style conditions for various parts of the system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "schema::conditions")]
    pub conditions: Option<Vec<meta::v1::Condition>>,

    /// Component identifies the component version the resource was resolved
    /// from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<ComponentInfo>,

    /// Resource identifies the resolved resource inside the component
    /// descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceInfo>,

    /// RequeueAfter is the interval after which the resource controller
    /// re-checks the repository, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requeue_after: Option<i64>,
}

impl ResourceStatus {
    /// Ready reports whether the Ready condition is "True".
    pub fn ready(&self) -> bool {
        self.conditions
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True")
    }
}

/// ComponentInfo names a component version and the repository it came from.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentInfo {
    /// Name of the component.
    pub name: String,
    /// Version of the component.
    pub version: String,
    /// RepositorySpec is the opaque serialized repository specification.
    #[schemars(schema_with = "schema::raw")]
    pub repository_spec: serde_json::Value,
}

/// ResourceInfo identifies one resource entry of a component descriptor.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    /// Name is the mandatory identity key of the resource.
    pub name: String,
    /// Version of the resource, if pinned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// ExtraIdentity holds any additional identity keys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_identity: BTreeMap<String, String>,
    /// Digest of the resource content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    /// Access is the opaque serialized access specification.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "schema::raw_opt")]
    pub access: Option<serde_json::Value>,
}

/// Digest pins the content of a resource.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize, Validate, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct Digest {
    /// Value is the digest value, hex-encoded.
    pub value: String,
    /// HashAlgorithm names the hash algorithm, e.g. "SHA-256".
    pub hash_algorithm: String,
    /// NormalisationAlgorithm names the normalisation applied before hashing.
    pub normalisation_algorithm: String,
}

mod schema {
    use k8s_openapi::apimachinery::pkg::apis::meta;
    use schemars::{Schema, generate::SchemaGenerator};
    use serde_json::json;

    pub fn conditions(generator: &mut SchemaGenerator) -> Schema {
        let mut schema = generator.subschema_for::<Vec<meta::v1::Condition>>();

        schema
            .ensure_object()
            .entry("x-kubernetes-list-type")
            .or_insert_with(|| json!("map"));
        schema
            .ensure_object()
            .entry("x-kubernetes-list-map-keys")
            .or_insert_with(|| json!(["type"]));
        schema
            .ensure_object()
            .insert("items".into(), condition(generator).into());

        schema
    }

    pub fn condition(generator: &mut SchemaGenerator) -> Schema {
        let mut schema = generator.subschema_for::<meta::v1::Condition>();

        schema.ensure_object().entry("required").or_insert_with(|| {
            json!(["type", "status", "lastTransitionTime", "reason", "message"])
        });

        schema
            .ensure_object()
            .entry("properties")
            .or_insert_with(|| json!({
                "type": {
                    "type": "string",
                    "pattern": r#"^([a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*/)?(([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])$"#,
                    "max_length": 316,
                },
                "status": {
                    "enum": ["True", "False", "Unknown"],
                },
                "observedGeneration": {
                    "type": "number",
                    "minimum": 0,
                },
                "lastTransitionTime": { "format": "date-time" },
                "reason": {
                    "type": "string",
                    "pattern": r#"^[A-Za-z]([A-Za-z0-9_,:]*[A-Za-z0-9_])?$"#,
                    "min_length": 1,
                    "max_length": 1024,
                },
                "message": {
                    "type": "string",
                    "max_length": 32768,
                },
            }));

        schema
    }

    pub fn raw(_generator: &mut SchemaGenerator) -> Schema {
        schemars::json_schema!({
            "x-kubernetes-preserve-unknown-fields": true,
        })
    }

    pub fn raw_opt(generator: &mut SchemaGenerator) -> Schema {
        raw(generator)
    }
}
