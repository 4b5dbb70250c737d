#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Applyset implements declarative set-based resource management per
//! [KEP-3659].
//!
//! A parent object anchors a set of member objects. Members carry the
//! `applyset.kubernetes.io/part-of` label; the parent carries the set id and
//! bookkeeping annotations that remember which group-kinds and namespaces
//! ever held members, so orphans can be found for deletion even after the
//! desired set shrinks.
//!
//! [KEP-3659]: https://github.com/kubernetes/enhancements/tree/master/keps/sig-cli/3659-kubectl-apply-prune

use std::collections::{BTreeMap, BTreeSet};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use kube::{Resource, ResourceExt, core::GroupVersionKind};
use sha2::{Digest, Sha256};

mod engine;
pub use engine::{
    ApplyOptions, ApplyResult, AppliedResource, ApplySet, DesiredResource, PruneOptions,
    PruneResult, PruneScope, PrunedResource, RestMapper,
};

/// LABEL_ID is the parent label carrying the ApplySet id.
pub const LABEL_ID: &str = "applyset.kubernetes.io/id";
/// LABEL_PART_OF is the member label carrying the owning ApplySet id.
pub const LABEL_PART_OF: &str = "applyset.kubernetes.io/part-of";
/// ANNOTATION_TOOLING is the parent annotation naming the managing tool.
pub const ANNOTATION_TOOLING: &str = "applyset.kubernetes.io/tooling";
/// ANNOTATION_GROUP_KINDS is the parent annotation listing member group-kinds.
pub const ANNOTATION_GROUP_KINDS: &str = "applyset.kubernetes.io/contains-group-kinds";
/// ANNOTATION_NAMESPACES is the parent annotation listing member namespaces
/// beyond the parent's own.
pub const ANNOTATION_NAMESPACES: &str = "applyset.kubernetes.io/additional-namespaces";

/// Error enumerates the errors reported by this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// MappingUnknown indicates the REST mapper does not recognise a
    /// group-kind; retryable once discovery refreshes.
    #[error("no REST mapping for {group}/{kind}")]
    MappingUnknown {
        /// Group of the unmapped kind, empty for the core group.
        group: String,
        /// The unmapped kind.
        kind: String,
    },
    /// Conflict indicates a member already belongs to a different ApplySet.
    #[error("object {name:?} belongs to ApplySet {found:?}, not {expected:?}")]
    Conflict {
        /// Name of the contested object.
        name: String,
        /// The id found on the live object.
        found: String,
        /// The id of this ApplySet.
        expected: String,
    },
    /// ClusterScopedNamespace indicates a cluster-scoped resource carried a
    /// namespace in its manifest.
    #[error("cluster-scoped {kind} {name:?} must not set a namespace")]
    ClusterScopedNamespace {
        /// Kind of the offending resource.
        kind: String,
        /// Name of the offending resource.
        name: String,
    },
    /// MissingName indicates a resource in the batch has no name.
    #[error("resource of kind {0} has no name")]
    MissingName(String),
    /// MissingKind indicates a resource in the batch has no usable type meta.
    #[error("resource {0:?} has no apiVersion/kind")]
    MissingKind(String),
    /// Ssa indicates the server rejected an apply patch.
    #[error("server-side apply failed: {0}")]
    Ssa(#[source] kube::Error),
    /// Get indicates a live-object lookup failed.
    #[error("get failed: {0}")]
    Get(#[source] kube::Error),
    /// List indicates a member listing failed during prune.
    #[error("list failed: {0}")]
    List(#[source] kube::Error),
    /// Delete indicates a member deletion failed during prune.
    #[error("delete failed: {0}")]
    Delete(#[source] kube::Error),
}

/// Result typedef for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Parent identifies the object anchoring an ApplySet, along with a snapshot
/// of its current annotations (the set's memory of prior reconciles).
#[derive(Clone, Debug, Default)]
pub struct Parent {
    /// Name of the parent object.
    pub name: String,
    /// Namespace of the parent object, `None` for cluster-scoped parents.
    pub namespace: Option<String>,
    /// Kind of the parent object.
    pub kind: String,
    /// API group of the parent object, empty for the core group.
    pub group: String,
    /// Annotations currently present on the parent.
    pub annotations: BTreeMap<String, String>,
}

impl Parent {
    /// Of captures the parent identity and annotation snapshot from a typed
    /// object.
    pub fn of<K>(obj: &K) -> Parent
    where
        K: Resource<DynamicType = ()>,
    {
        Parent {
            name: obj.name_any(),
            namespace: obj.namespace(),
            kind: K::kind(&()).to_string(),
            group: K::group(&()).to_string(),
            annotations: obj.annotations().clone(),
        }
    }

    /// Id computes the ApplySet id for this parent.
    ///
    /// The identity components are joined with "." without escaping; KEP-3659
    /// specifies this and cross-tool interoperability depends on it.
    pub fn id(&self) -> String {
        let mut h = Sha256::new();
        h.update(&self.name);
        h.update(".");
        h.update(self.namespace.as_deref().unwrap_or(""));
        h.update(".");
        h.update(&self.kind);
        h.update(".");
        h.update(&self.group);
        format!("applyset-{}-v1", URL_SAFE_NO_PAD.encode(h.finalize()))
    }

    /// Default_namespace is the namespace members fall back to: the parent's,
    /// or "default" for cluster-scoped parents.
    pub fn default_namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or("default")
    }
}

/// GroupKind is a (group, kind) pair ordered by its KEP-3659 rendering.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct GroupKind {
    /// Kind, e.g. "ConfigMap".
    pub kind: String,
    /// Group, empty for the core group.
    pub group: String,
}

impl GroupKind {
    /// New builds a GroupKind.
    pub fn new<K: ToString, G: ToString>(kind: K, group: G) -> GroupKind {
        GroupKind {
            kind: kind.to_string(),
            group: group.to_string(),
        }
    }

    /// Of extracts the GroupKind of a GroupVersionKind.
    pub fn of(gvk: &GroupVersionKind) -> GroupKind {
        GroupKind::new(&gvk.kind, &gvk.group)
    }

    fn parse(s: &str) -> Option<GroupKind> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        // A missing group means the core group.
        Some(match s.split_once('.') {
            Some((kind, group)) => GroupKind::new(kind, group),
            None => GroupKind::new(s, ""),
        })
    }
}

impl std::fmt::Display for GroupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            f.write_str(&self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Metadata is the ApplySet bookkeeping rendered onto the parent: the set id,
/// the tooling tag, and the memory of member group-kinds and namespaces.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Metadata {
    /// Id is the ApplySet id.
    pub id: String,
    /// Tooling is the `<name>/<semver>` tag of the managing tool.
    pub tooling: String,
    /// GroupKinds is the set of member group-kinds.
    pub group_kinds: BTreeSet<GroupKind>,
    /// AdditionalNamespaces is the set of member namespaces, excluding the
    /// parent's own namespace.
    pub additional_namespaces: BTreeSet<String>,
}

impl Metadata {
    /// Parse reads the bookkeeping annotations of a parent back into a
    /// Metadata.
    ///
    /// Tolerates absent annotations, empty strings, whitespace around commas,
    /// and group-less entries (core group).
    pub fn parse(id: String, tooling: String, annotations: &BTreeMap<String, String>) -> Metadata {
        let group_kinds = annotations
            .get(ANNOTATION_GROUP_KINDS)
            .map(|s| s.split(',').filter_map(GroupKind::parse).collect())
            .unwrap_or_default();
        let additional_namespaces = annotations
            .get(ANNOTATION_NAMESPACES)
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|ns| !ns.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        Metadata {
            id,
            tooling,
            group_kinds,
            additional_namespaces,
        }
    }

    /// Group_kinds_string renders the sorted comma-separated group-kind list.
    pub fn group_kinds_string(&self) -> String {
        let v: Vec<String> = self.group_kinds.iter().map(GroupKind::to_string).collect();
        v.join(",")
    }

    /// Namespaces_string renders the sorted comma-separated namespace list,
    /// empty when there are no additional namespaces.
    pub fn namespaces_string(&self) -> String {
        let v: Vec<&str> = self
            .additional_namespaces
            .iter()
            .map(String::as_str)
            .collect();
        v.join(",")
    }

    /// Labels renders the parent labels.
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(LABEL_ID.to_string(), self.id.clone())])
    }

    /// Annotations renders the parent annotations.
    pub fn annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (ANNOTATION_TOOLING.to_string(), self.tooling.clone()),
            (ANNOTATION_GROUP_KINDS.to_string(), self.group_kinds_string()),
            (ANNOTATION_NAMESPACES.to_string(), self.namespaces_string()),
        ])
    }

    /// Union folds another metadata's group-kinds and namespaces into this
    /// one.
    pub fn union(mut self, other: &Metadata) -> Metadata {
        self.group_kinds.extend(other.group_kinds.iter().cloned());
        self.additional_namespaces
            .extend(other.additional_namespaces.iter().cloned());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent(name: &str, namespace: Option<&str>) -> Parent {
        Parent {
            name: name.into(),
            namespace: namespace.map(String::from),
            kind: "ConfigMap".into(),
            group: "".into(),
            annotations: BTreeMap::new(),
        }
    }

    #[test]
    fn id_is_stable_and_distinct() {
        let a = parent("parent", Some("default"));
        assert_eq!(a.id(), a.id());
        assert!(a.id().starts_with("applyset-"));
        assert!(a.id().ends_with("-v1"));
        // Base64url alphabet only, no padding.
        let a_id = a.id();
        let body = a_id
            .trim_start_matches("applyset-")
            .trim_end_matches("-v1");
        assert!(
            body.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );

        let b = parent("parent", Some("other"));
        assert_ne!(a.id(), b.id());
        let c = parent("parent", None);
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn id_matches_known_derivation() {
        use sha2::{Digest, Sha256};
        let p = parent("parent", Some("default"));
        let digest = Sha256::digest(b"parent.default.ConfigMap.");
        let want = format!("applyset-{}-v1", URL_SAFE_NO_PAD.encode(digest));
        assert_eq!(p.id(), want);
    }

    #[test]
    fn group_kinds_render_sorted() {
        let md = Metadata {
            id: "x".into(),
            tooling: "t/0.1.0".into(),
            group_kinds: BTreeSet::from([
                GroupKind::new("Deployment", "apps"),
                GroupKind::new("Secret", ""),
                GroupKind::new("ConfigMap", ""),
            ]),
            additional_namespaces: BTreeSet::new(),
        };
        assert_eq!(md.group_kinds_string(), "ConfigMap,Deployment.apps,Secret");
        assert_eq!(md.namespaces_string(), "");
    }

    #[test]
    fn parse_tolerates_messy_annotations() {
        let annotations = BTreeMap::from([
            (
                ANNOTATION_GROUP_KINDS.to_string(),
                " ConfigMap , Deployment.apps ,,".to_string(),
            ),
            (
                ANNOTATION_NAMESPACES.to_string(),
                " kube-system , , monitoring".to_string(),
            ),
        ]);
        let md = Metadata::parse("id".into(), "t/0.1.0".into(), &annotations);
        assert_eq!(
            md.group_kinds,
            BTreeSet::from([
                GroupKind::new("ConfigMap", ""),
                GroupKind::new("Deployment", "apps"),
            ])
        );
        assert_eq!(
            md.additional_namespaces,
            BTreeSet::from(["kube-system".to_string(), "monitoring".to_string()])
        );
    }

    #[test]
    fn parse_render_round_trip() {
        let md = Metadata {
            id: "applyset-abc-v1".into(),
            tooling: "deployer-controller/0.1.0".into(),
            group_kinds: BTreeSet::from([
                GroupKind::new("ConfigMap", ""),
                GroupKind::new("Role", "rbac.authorization.k8s.io"),
            ]),
            additional_namespaces: BTreeSet::from(["kube-system".to_string()]),
        };
        let parsed = Metadata::parse(md.id.clone(), md.tooling.clone(), &md.annotations());
        assert_eq!(parsed, md);
    }

    #[test]
    fn empty_annotations_parse_empty() {
        let md = Metadata::parse("id".into(), "t/0".into(), &BTreeMap::new());
        assert!(md.group_kinds.is_empty());
        assert!(md.additional_namespaces.is_empty());

        let empties = BTreeMap::from([
            (ANNOTATION_GROUP_KINDS.to_string(), String::new()),
            (ANNOTATION_NAMESPACES.to_string(), String::new()),
        ]);
        let md = Metadata::parse("id".into(), "t/0".into(), &empties);
        assert!(md.group_kinds.is_empty());
        assert!(md.additional_namespaces.is_empty());
    }
}
