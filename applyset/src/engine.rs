//! Engine holds the project/apply/prune operations of an ApplySet.

use std::collections::BTreeSet;

use futures::prelude::*;
use kube::{
    Api, Client, Discovery, ResourceExt,
    api::{ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams},
    core::GroupVersionKind,
    discovery::{ApiCapabilities, Scope},
};
use tracing::{debug, instrument, trace};

use crate::{Error, GroupKind, LABEL_PART_OF, Metadata, Parent, Result};

/// RestMapper resolves group-kinds to concrete REST resources.
///
/// The canonical implementation is [`kube::Discovery`]; tests substitute a
/// static table.
pub trait RestMapper {
    /// Map_gvk resolves a full GroupVersionKind.
    fn map_gvk(&self, gvk: &GroupVersionKind) -> Option<(ApiResource, ApiCapabilities)>;
    /// Map_gk resolves a group-kind at whatever version the mapper prefers.
    fn map_gk(&self, gk: &GroupKind) -> Option<(ApiResource, ApiCapabilities)>;
}

impl RestMapper for Discovery {
    fn map_gvk(&self, gvk: &GroupVersionKind) -> Option<(ApiResource, ApiCapabilities)> {
        self.resolve_gvk(gvk)
    }

    fn map_gk(&self, gk: &GroupKind) -> Option<(ApiResource, ApiCapabilities)> {
        self.groups()
            .find(|g| g.name() == gk.group)?
            .recommended_resources()
            .into_iter()
            .find(|(ar, _)| ar.kind == gk.kind)
    }
}

/// DesiredResource is one element of a batch handed to the engine.
#[derive(Clone, Debug)]
pub struct DesiredResource {
    /// Object is the desired state.
    pub object: DynamicObject,
    /// SkipApply omits the object from apply and from the batch metadata
    /// while leaving prior instances discoverable through the parent's
    /// annotation memory.
    pub skip_apply: bool,
    /// CurrentRevision is the resourceVersion the caller last observed, used
    /// for change detection.
    pub current_revision: Option<String>,
}

impl DesiredResource {
    /// New wraps an object with default flags.
    pub fn new(object: DynamicObject) -> DesiredResource {
        DesiredResource {
            object,
            skip_apply: false,
            current_revision: None,
        }
    }
}

/// ApplyOptions tunes one apply pass.
#[derive(Clone, Debug)]
pub struct ApplyOptions {
    /// Concurrency bounds the number of in-flight apply patches.
    pub concurrency: usize,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        ApplyOptions { concurrency: 4 }
    }
}

/// AppliedResource records the outcome for a single batch element.
#[derive(Debug)]
pub struct AppliedResource {
    /// ApiVersion of the resource.
    pub api_version: String,
    /// Kind of the resource.
    pub kind: String,
    /// Name of the resource.
    pub name: String,
    /// Namespace the resource was applied in, `None` for cluster scope.
    pub namespace: Option<String>,
    /// UID reported by the server.
    pub uid: Option<String>,
    /// ResourceVersion reported by the server.
    pub resource_version: Option<String>,
    /// Changed is false only when the caller supplied a revision and the
    /// server echoed it back.
    pub changed: bool,
    /// Error is the per-resource failure, if any.
    pub error: Option<Error>,
}

/// ApplyResult is the per-resource outcome of one apply pass.
#[derive(Debug, Default)]
pub struct ApplyResult {
    /// Applied lists one record per non-skipped batch element.
    pub applied: Vec<AppliedResource>,
}

impl ApplyResult {
    /// Errors returns the per-resource failures of this pass.
    pub fn errors(&self) -> Vec<&Error> {
        self.applied.iter().filter_map(|a| a.error.as_ref()).collect()
    }

    /// Keep_uids collects the UIDs of successfully applied resources, the
    /// set a subsequent prune must retain.
    pub fn keep_uids(&self) -> BTreeSet<String> {
        self.applied
            .iter()
            .filter(|a| a.error.is_none())
            .filter_map(|a| a.uid.clone())
            .collect()
    }
}

/// PruneScope is the search space for orphan detection.
#[derive(Clone, Debug, Default)]
pub struct PruneScope {
    /// GroupKinds to search.
    pub group_kinds: BTreeSet<GroupKind>,
    /// Namespaces to search for namespaced group-kinds.
    pub namespaces: BTreeSet<String>,
}

/// PruneOptions tunes one prune pass.
#[derive(Clone, Debug, Default)]
pub struct PruneOptions {
    /// Scope is the search space, normally derived from a projection.
    pub scope: PruneScope,
    /// KeepUids are the members that must survive.
    pub keep_uids: BTreeSet<String>,
    /// Concurrency bounds concurrent lists and deletes.
    pub concurrency: usize,
}

/// PrunedResource identifies one deleted member.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrunedResource {
    /// ApiVersion of the deleted member.
    pub api_version: String,
    /// Kind of the deleted member.
    pub kind: String,
    /// Name of the deleted member.
    pub name: String,
    /// Namespace of the deleted member.
    pub namespace: Option<String>,
}

/// PruneResult reports what one prune pass removed.
#[derive(Debug, Default)]
pub struct PruneResult {
    /// Deleted lists the removed members.
    pub deleted: Vec<PrunedResource>,
}

impl PruneResult {
    /// Has_pruned reports whether anything was removed.
    pub fn has_pruned(&self) -> bool {
        !self.deleted.is_empty()
    }
}

/// ApplySet binds the engine operations to one parent.
///
/// The engine is stateless across calls: everything it needs to remember
/// lives on the parent (annotations) or in returned values. Callers must not
/// prune after an apply that reported per-resource errors, since the failed
/// resources' UIDs are missing from the keep set.
pub struct ApplySet<'a, M> {
    parent: Parent,
    id: String,
    tooling: String,
    field_manager: String,
    client: Client,
    mapper: &'a M,
}

impl<'a, M> ApplySet<'a, M>
where
    M: RestMapper + Sync,
{
    /// New builds an ApplySet for `parent`.
    pub fn new<S, T>(
        client: Client,
        mapper: &'a M,
        parent: Parent,
        tooling: S,
        field_manager: T,
    ) -> ApplySet<'a, M>
    where
        S: ToString,
        T: ToString,
    {
        let id = parent.id();
        ApplySet {
            parent,
            id,
            tooling: tooling.to_string(),
            field_manager: field_manager.to_string(),
            client,
            mapper,
        }
    }

    /// Id reports the ApplySet id of the parent.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Parent reports the parent this set is bound to.
    pub fn parent(&self) -> &Parent {
        &self.parent
    }

    /// Project computes the metadata the parent must carry before `resources`
    /// are applied: the union of the batch's group-kinds and namespaces with
    /// whatever the parent's annotations already remember.
    ///
    /// The parent's own namespace is never part of the additional-namespaces
    /// set.
    #[instrument(skip_all, fields(id = %self.id))]
    pub fn project(&self, resources: &[DesiredResource]) -> Result<Metadata> {
        let batch = self.batch_metadata(resources)?;
        let memory = Metadata::parse(
            self.id.clone(),
            self.tooling.clone(),
            &self.parent.annotations,
        );
        Ok(memory.union(&batch))
    }

    /// Batch_metadata computes the metadata implied by `resources` alone.
    fn batch_metadata(&self, resources: &[DesiredResource]) -> Result<Metadata> {
        let mut md = Metadata {
            id: self.id.clone(),
            tooling: self.tooling.clone(),
            ..Default::default()
        };
        for r in resources.iter().filter(|r| !r.skip_apply) {
            let gvk = gvk_of(&r.object)?;
            let (_, caps) = self
                .mapper
                .map_gvk(&gvk)
                .ok_or_else(|| Error::MappingUnknown {
                    group: gvk.group.clone(),
                    kind: gvk.kind.clone(),
                })?;
            match caps.scope {
                Scope::Cluster => {
                    if r.object.metadata.namespace.is_some() {
                        return Err(Error::ClusterScopedNamespace {
                            kind: gvk.kind.clone(),
                            name: r.object.name_any(),
                        });
                    }
                }
                Scope::Namespaced => {
                    let ns = r
                        .object
                        .metadata
                        .namespace
                        .clone()
                        .unwrap_or_else(|| self.parent.default_namespace().to_string());
                    if self.parent.namespace.as_deref() != Some(ns.as_str()) {
                        md.additional_namespaces.insert(ns);
                    }
                }
            }
            md.group_kinds.insert(GroupKind::of(&gvk));
        }
        Ok(md)
    }

    /// Prune_scope widens a projection into the search space for orphan
    /// detection, always including the parent's namespace (or "default" for
    /// cluster-scoped parents).
    pub fn prune_scope(&self, md: &Metadata) -> PruneScope {
        let mut namespaces = md.additional_namespaces.clone();
        namespaces.insert(self.parent.default_namespace().to_string());
        PruneScope {
            group_kinds: md.group_kinds.clone(),
            namespaces,
        }
    }

    /// Apply server-side-applies every non-skipped resource, injecting the
    /// membership label and defaulting namespaces.
    ///
    /// REST-mapping failures abort before any patch is issued; everything
    /// after that is recorded per resource. The returned metadata covers the
    /// batch only, never the parent's annotation memory.
    #[instrument(skip_all, fields(id = %self.id, resources = resources.len()))]
    pub async fn apply(
        &self,
        resources: &[DesiredResource],
        opts: &ApplyOptions,
    ) -> Result<(ApplyResult, Metadata)> {
        let batch = self.batch_metadata(resources)?;

        let mut work = Vec::new();
        for r in resources.iter().filter(|r| !r.skip_apply) {
            let gvk = gvk_of(&r.object)?;
            let (ar, caps) = self
                .mapper
                .map_gvk(&gvk)
                .ok_or_else(|| Error::MappingUnknown {
                    group: gvk.group.clone(),
                    kind: gvk.kind.clone(),
                })?;
            let namespace = match caps.scope {
                Scope::Cluster => None,
                Scope::Namespaced => Some(
                    r.object
                        .metadata
                        .namespace
                        .clone()
                        .unwrap_or_else(|| self.parent.default_namespace().to_string()),
                ),
            };
            work.push(ApplyWork {
                object: r.object.clone(),
                current_revision: r.current_revision.clone(),
                ar,
                caps,
                namespace,
            });
        }

        let width = opts.concurrency.min(work.len()).max(1);
        debug!(width, "applying batch");
        let applied = stream::iter(work)
            .map(|w| self.apply_one(w))
            .buffer_unordered(width)
            .collect::<Vec<_>>()
            .await;

        Ok((ApplyResult { applied }, batch))
    }

    async fn apply_one(&self, w: ApplyWork) -> AppliedResource {
        let mut item = AppliedResource {
            api_version: w.ar.api_version.clone(),
            kind: w.ar.kind.clone(),
            name: w.object.name_any(),
            namespace: w.namespace.clone(),
            uid: None,
            resource_version: None,
            changed: true,
            error: None,
        };
        if item.name.is_empty() {
            item.error = Some(Error::MissingName(w.ar.kind.clone()));
            return item;
        }
        let api = self.dynamic_api(&w.ar, &w.caps, w.namespace.as_deref());

        // A member already claimed by another set is left untouched.
        match api.get_opt(&item.name).await {
            Err(err) => {
                item.error = Some(Error::Get(err));
                return item;
            }
            Ok(Some(live)) => {
                if let Some(found) = live.labels().get(LABEL_PART_OF) {
                    if *found != self.id {
                        item.error = Some(Error::Conflict {
                            name: item.name.clone(),
                            found: found.clone(),
                            expected: self.id.clone(),
                        });
                        return item;
                    }
                }
            }
            Ok(None) => {}
        }

        let mut obj = w.object;
        obj.labels_mut()
            .insert(LABEL_PART_OF.to_string(), self.id.clone());
        obj.metadata.namespace = w.namespace.clone();

        let pp = PatchParams::apply(&self.field_manager).force();
        match api.patch(&item.name, &pp, &Patch::Apply(&obj)).await {
            Ok(returned) => {
                item.uid = returned.uid();
                item.resource_version = returned.resource_version();
                item.changed = match (&w.current_revision, &item.resource_version) {
                    (Some(prev), Some(cur)) => prev != cur,
                    _ => true,
                };
                trace!(name = item.name, changed = item.changed, "applied");
            }
            Err(err) => item.error = Some(Error::Ssa(err)),
        }
        item
    }

    /// Prune deletes every live member inside `opts.scope` whose UID is not
    /// in `opts.keep_uids`, treating NotFound as success.
    ///
    /// Listing and deletion both run concurrently under `opts.concurrency`.
    /// The first list or delete failure aborts the pass; prune is idempotent,
    /// so the next reconcile resumes cleanly.
    #[instrument(skip_all, fields(id = %self.id))]
    pub async fn prune(&self, opts: &PruneOptions) -> Result<PruneResult> {
        let mut apis = Vec::new();
        for gk in &opts.scope.group_kinds {
            let (ar, caps) = self.mapper.map_gk(gk).ok_or_else(|| Error::MappingUnknown {
                group: gk.group.clone(),
                kind: gk.kind.clone(),
            })?;
            match caps.scope {
                Scope::Cluster => apis.push(self.dynamic_api(&ar, &caps, None)),
                Scope::Namespaced => {
                    let mut namespaces = opts.scope.namespaces.clone();
                    namespaces.insert(self.parent.default_namespace().to_string());
                    for ns in namespaces {
                        apis.push(self.dynamic_api(&ar, &caps, Some(&ns)));
                    }
                }
            }
        }

        let width = opts.concurrency.max(1);
        let lp = ListParams::default().labels(&format!("{LABEL_PART_OF}={}", self.id));
        let listed = stream::iter(apis)
            .map(|api| {
                let lp = lp.clone();
                async move {
                    let items = api.list(&lp).await.map_err(Error::List)?;
                    Ok::<_, Error>((api, items.items))
                }
            })
            .buffer_unordered(width)
            .collect::<Vec<_>>()
            .await;

        let mut candidates = Vec::new();
        for r in listed {
            let (api, items) = r?;
            for obj in items {
                match obj.uid() {
                    Some(uid) if opts.keep_uids.contains(&uid) => {}
                    Some(_) => candidates.push((api.clone(), obj)),
                    // An object the server reports without a UID cannot be
                    // compared against the keep set; leave it alone.
                    None => {}
                }
            }
        }
        debug!(candidates = candidates.len(), "pruning");

        let deleted = stream::iter(candidates)
            .map(|(api, obj)| async move {
                let name = obj.name_any();
                match api.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                    Err(err) => return Err(Error::Delete(err)),
                }
                trace!(name, "pruned");
                Ok(PrunedResource {
                    api_version: obj
                        .types
                        .as_ref()
                        .map(|t| t.api_version.clone())
                        .unwrap_or_default(),
                    kind: obj
                        .types
                        .as_ref()
                        .map(|t| t.kind.clone())
                        .unwrap_or_default(),
                    name: obj.name_any(),
                    namespace: obj.namespace(),
                })
            })
            .buffer_unordered(width)
            .collect::<Vec<_>>()
            .await;

        let mut out = PruneResult::default();
        for r in deleted {
            out.deleted.push(r?);
        }
        Ok(out)
    }

    fn dynamic_api(
        &self,
        ar: &ApiResource,
        caps: &ApiCapabilities,
        namespace: Option<&str>,
    ) -> Api<DynamicObject> {
        match caps.scope {
            Scope::Cluster => Api::all_with(self.client.clone(), ar),
            Scope::Namespaced => match namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
                None => Api::default_namespaced_with(self.client.clone(), ar),
            },
        }
    }
}

struct ApplyWork {
    object: DynamicObject,
    current_revision: Option<String>,
    ar: ApiResource,
    caps: ApiCapabilities,
    namespace: Option<String>,
}

fn gvk_of(obj: &DynamicObject) -> Result<GroupVersionKind> {
    obj.types
        .as_ref()
        .and_then(|t| GroupVersionKind::try_from(t).ok())
        .ok_or_else(|| Error::MissingKind(obj.name_any()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use http::{Request, Response, StatusCode};
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
    use kube::client::Body;
    use serde_json::{Value, json};
    use tower_test::mock::{Handle, pair};

    use super::*;

    const TOOLING: &str = "deployer-controller/0.1.0";
    const MANAGER: &str = "test-manager";

    struct StaticMapper(Vec<(ApiResource, ApiCapabilities)>);

    impl StaticMapper {
        fn test() -> StaticMapper {
            StaticMapper(vec![
                (
                    ApiResource::erase::<ConfigMap>(&()),
                    ApiCapabilities {
                        scope: Scope::Namespaced,
                        subresources: vec![],
                        operations: vec![],
                    },
                ),
                (
                    ApiResource::erase::<Namespace>(&()),
                    ApiCapabilities {
                        scope: Scope::Cluster,
                        subresources: vec![],
                        operations: vec![],
                    },
                ),
            ])
        }
    }

    impl RestMapper for StaticMapper {
        fn map_gvk(&self, gvk: &GroupVersionKind) -> Option<(ApiResource, ApiCapabilities)> {
            self.0
                .iter()
                .find(|(ar, _)| ar.group == gvk.group && ar.kind == gvk.kind)
                .cloned()
        }
        fn map_gk(&self, gk: &GroupKind) -> Option<(ApiResource, ApiCapabilities)> {
            self.0
                .iter()
                .find(|(ar, _)| ar.group == gk.group && ar.kind == gk.kind)
                .cloned()
        }
    }

    fn test_parent() -> Parent {
        Parent {
            name: "parent".into(),
            namespace: Some("default".into()),
            kind: "Deployer".into(),
            group: "delivery.ocm.software".into(),
            annotations: BTreeMap::new(),
        }
    }

    fn configmap(name: &str, namespace: Option<&str>) -> DynamicObject {
        let ar = ApiResource::erase::<ConfigMap>(&());
        let mut obj = DynamicObject::new(name, &ar);
        obj.metadata.namespace = namespace.map(String::from);
        obj.data = json!({"data": {"k": "v"}});
        obj
    }

    type MockHandle = Handle<Request<Body>, Response<Body>>;

    fn mock_client() -> (Client, MockHandle) {
        let (service, handle) = pair::<Request<Body>, Response<Body>>();
        (Client::new(service, "default"), handle)
    }

    fn not_found(name: &str) -> Response<Body> {
        let body = json!({
            "code": 404,
            "status": "Failure",
            "reason": "NotFound",
            "details": {"name": name},
        });
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    fn ok_json(v: &Value) -> Response<Body> {
        Response::builder()
            .body(Body::from(serde_json::to_vec(v).unwrap()))
            .unwrap()
    }

    fn live_configmap(name: &str, uid: &str, rv: &str, part_of: Option<&str>) -> Value {
        let mut metadata = json!({
            "name": name,
            "namespace": "default",
            "uid": uid,
            "resourceVersion": rv,
        });
        if let Some(id) = part_of {
            metadata["labels"] = json!({ LABEL_PART_OF: id });
        }
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": metadata})
    }

    async fn handle_apply_sequence(mut handle: MockHandle, live: Vec<Option<Value>>) {
        for entry in live {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            let uri = request.uri().to_string();
            let name = uri
                .split('?')
                .next()
                .unwrap()
                .rsplit('/')
                .next()
                .unwrap()
                .to_string();
            match &entry {
                Some(obj) => send.send_response(ok_json(obj)),
                None => send.send_response(not_found(&name)),
            }
            // A conflicting live object means no patch follows.
            let conflicted = entry
                .as_ref()
                .and_then(|o| o.pointer("/metadata/labels"))
                .and_then(|l| l.get(LABEL_PART_OF))
                .is_some();
            if conflicted {
                continue;
            }

            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            let uri = request.uri().to_string();
            assert!(uri.contains(&format!("fieldManager={MANAGER}")), "{uri}");
            assert!(uri.contains("force=true"), "{uri}");
            let buf = request.into_body().collect_bytes().await.unwrap();
            let mut obj: Value = serde_json::from_slice(&buf).unwrap();
            let labels = obj.pointer("/metadata/labels").expect("labels injected");
            let id = labels.get(LABEL_PART_OF).expect("part-of injected").clone();
            assert!(id.as_str().unwrap().starts_with("applyset-"));
            obj["metadata"]["uid"] = json!(format!("uid-{name}"));
            obj["metadata"]["resourceVersion"] = json!("1");
            send.send_response(ok_json(&obj));
        }
    }

    #[tokio::test]
    async fn apply_labels_and_patches_each_resource() {
        let (client, handle) = mock_client();
        let mapper = StaticMapper::test();
        let set = ApplySet::new(client, &mapper, test_parent(), TOOLING, MANAGER);

        let batch = vec![
            DesiredResource::new(configmap("cm1", None)),
            DesiredResource::new(configmap("cm2", Some("default"))),
        ];

        let server = tokio::spawn(handle_apply_sequence(handle, vec![None, None]));
        let (result, md) = set
            .apply(&batch, &ApplyOptions { concurrency: 1 })
            .await
            .expect("apply");
        server.await.unwrap();

        assert_eq!(result.applied.len(), 2);
        assert!(result.errors().is_empty());
        assert!(result.applied.iter().all(|a| a.changed));
        assert_eq!(result.keep_uids().len(), 2);
        assert_eq!(md.group_kinds_string(), "ConfigMap");
        assert_eq!(md.namespaces_string(), "");
    }

    #[tokio::test]
    async fn apply_records_conflicts_without_mutating() {
        let (client, handle) = mock_client();
        let mapper = StaticMapper::test();
        let set = ApplySet::new(client, &mapper, test_parent(), TOOLING, MANAGER);

        let batch = vec![DesiredResource::new(configmap("existing-cm", None))];
        let live = live_configmap("existing-cm", "u1", "9", Some("applyset-XYZ-v1"));
        let server = tokio::spawn(handle_apply_sequence(handle, vec![Some(live)]));

        let (result, _) = set
            .apply(&batch, &ApplyOptions { concurrency: 1 })
            .await
            .expect("apply");
        server.await.unwrap();

        assert_eq!(result.applied.len(), 1);
        let errs = result.errors();
        assert_eq!(errs.len(), 1);
        assert!(matches!(errs[0], Error::Conflict { found, .. } if found == "applyset-XYZ-v1"));
        assert!(result.keep_uids().is_empty());
    }

    #[tokio::test]
    async fn apply_skips_marked_resources() {
        let (client, handle) = mock_client();
        let mapper = StaticMapper::test();
        let set = ApplySet::new(client, &mapper, test_parent(), TOOLING, MANAGER);

        let mut skipped = DesiredResource::new(configmap("skipped", None));
        skipped.skip_apply = true;
        let batch = vec![skipped, DesiredResource::new(configmap("kept", None))];

        let server = tokio::spawn(handle_apply_sequence(handle, vec![None]));
        let (result, md) = set
            .apply(&batch, &ApplyOptions { concurrency: 1 })
            .await
            .expect("apply");
        server.await.unwrap();

        assert_eq!(result.applied.len(), 1);
        assert_eq!(result.applied[0].name, "kept");
        assert_eq!(md.group_kinds_string(), "ConfigMap");
    }

    #[tokio::test]
    async fn apply_empty_batch_is_a_noop() {
        let (client, _handle) = mock_client();
        let mapper = StaticMapper::test();
        let set = ApplySet::new(client, &mapper, test_parent(), TOOLING, MANAGER);

        let (result, md) = set
            .apply(&[], &ApplyOptions::default())
            .await
            .expect("apply");
        assert!(result.applied.is_empty());
        assert!(md.group_kinds.is_empty());
    }

    #[tokio::test]
    async fn apply_change_detection_uses_supplied_revision() {
        let (client, mut handle) = mock_client();
        let mapper = StaticMapper::test();
        let set = ApplySet::new(client, &mapper, test_parent(), TOOLING, MANAGER);

        let mut r = DesiredResource::new(configmap("cm1", None));
        r.current_revision = Some("7".into());
        let server = tokio::spawn(async move {
            let (_, send) = handle.next_request().await.expect("get");
            send.send_response(ok_json(&live_configmap("cm1", "u1", "7", None)));
            let (request, send) = handle.next_request().await.expect("patch");
            let buf = request.into_body().collect_bytes().await.unwrap();
            let mut obj: Value = serde_json::from_slice(&buf).unwrap();
            obj["metadata"]["uid"] = json!("u1");
            obj["metadata"]["resourceVersion"] = json!("7");
            send.send_response(ok_json(&obj));
        });

        let (result, _) = set
            .apply(&[r], &ApplyOptions { concurrency: 1 })
            .await
            .expect("apply");
        server.await.unwrap();
        assert!(!result.applied[0].changed);
    }

    #[tokio::test]
    async fn project_unions_parent_memory() {
        let (client, _handle) = mock_client();
        let mapper = StaticMapper::test();
        let mut parent = test_parent();
        parent.annotations.insert(
            crate::ANNOTATION_GROUP_KINDS.to_string(),
            "Deployment.apps,Secret".to_string(),
        );
        parent.annotations.insert(
            crate::ANNOTATION_NAMESPACES.to_string(),
            "kube-system".to_string(),
        );
        let set = ApplySet::new(client, &mapper, parent, TOOLING, MANAGER);

        let batch = vec![DesiredResource::new(configmap("cm1", Some("monitoring")))];
        let md = set.project(&batch).expect("project");
        assert_eq!(
            md.group_kinds_string(),
            "ConfigMap,Deployment.apps,Secret"
        );
        assert_eq!(md.namespaces_string(), "kube-system,monitoring");

        // Idempotent given the same inputs.
        let again = set.project(&batch).expect("project");
        assert_eq!(again, md);
    }

    #[tokio::test]
    async fn project_excludes_parent_namespace() {
        let (client, _handle) = mock_client();
        let mapper = StaticMapper::test();
        let set = ApplySet::new(client, &mapper, test_parent(), TOOLING, MANAGER);

        let batch = vec![
            DesiredResource::new(configmap("cm-a", Some("default"))),
            DesiredResource::new(configmap("cm-b", Some("kube-system"))),
        ];
        let md = set.project(&batch).expect("project");
        assert_eq!(md.namespaces_string(), "kube-system");
    }

    #[tokio::test]
    async fn project_rejects_namespaced_cluster_resource() {
        let (client, _handle) = mock_client();
        let mapper = StaticMapper::test();
        let set = ApplySet::new(client, &mapper, test_parent(), TOOLING, MANAGER);

        let ar = ApiResource::erase::<Namespace>(&());
        let mut ns = DynamicObject::new("bad", &ar);
        ns.metadata.namespace = Some("default".into());
        let batch = vec![DesiredResource::new(ns)];
        let err = set.project(&batch).expect_err("must reject");
        assert!(matches!(err, Error::ClusterScopedNamespace { .. }));
    }

    #[tokio::test]
    async fn project_fails_on_unknown_mapping() {
        let (client, _handle) = mock_client();
        let mapper = StaticMapper(vec![]);
        let set = ApplySet::new(client, &mapper, test_parent(), TOOLING, MANAGER);

        let batch = vec![DesiredResource::new(configmap("cm1", None))];
        let err = set.project(&batch).expect_err("must fail");
        assert!(matches!(err, Error::MappingUnknown { .. }));
    }

    #[tokio::test]
    async fn prune_deletes_only_orphans() {
        let (client, mut handle) = mock_client();
        let mapper = StaticMapper::test();
        let set = ApplySet::new(client, &mapper, test_parent(), TOOLING, MANAGER);

        let scope = PruneScope {
            group_kinds: BTreeSet::from([GroupKind::new("ConfigMap", "")]),
            namespaces: BTreeSet::from(["default".to_string()]),
        };
        let opts = PruneOptions {
            scope,
            keep_uids: BTreeSet::from(["uid-keep".to_string()]),
            concurrency: 2,
        };

        let id = set.id().to_string();
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("list");
            assert_eq!(request.method(), http::Method::GET);
            let uri = request.uri().to_string();
            assert!(uri.contains("labelSelector="), "{uri}");
            let list = json!({
                "apiVersion": "v1",
                "kind": "ConfigMapList",
                "metadata": {},
                "items": [
                    live_configmap("new-cm", "uid-keep", "1", Some(&id)),
                    live_configmap("old-cm", "uid-old", "1", Some(&id)),
                ],
            });
            send.send_response(ok_json(&list));

            let (request, send) = handle.next_request().await.expect("delete");
            assert_eq!(request.method(), http::Method::DELETE);
            assert!(request.uri().to_string().contains("/configmaps/old-cm"));
            send.send_response(ok_json(&json!({
                "kind": "Status", "apiVersion": "v1", "status": "Success",
            })));
        });

        let result = set.prune(&opts).await.expect("prune");
        server.await.unwrap();
        assert!(result.has_pruned());
        assert_eq!(result.deleted.len(), 1);
        assert_eq!(result.deleted[0].name, "old-cm");
    }

    #[tokio::test]
    async fn prune_empty_scope_is_a_noop() {
        let (client, _handle) = mock_client();
        let mapper = StaticMapper::test();
        let set = ApplySet::new(client, &mapper, test_parent(), TOOLING, MANAGER);

        let result = set.prune(&PruneOptions::default()).await.expect("prune");
        assert!(!result.has_pruned());
    }

    #[tokio::test]
    async fn prune_tolerates_not_found_on_delete() {
        let (client, mut handle) = mock_client();
        let mapper = StaticMapper::test();
        let set = ApplySet::new(client, &mapper, test_parent(), TOOLING, MANAGER);

        let opts = PruneOptions {
            scope: PruneScope {
                group_kinds: BTreeSet::from([GroupKind::new("ConfigMap", "")]),
                namespaces: BTreeSet::new(),
            },
            keep_uids: BTreeSet::new(),
            concurrency: 1,
        };

        let id = set.id().to_string();
        let server = tokio::spawn(async move {
            let (_, send) = handle.next_request().await.expect("list");
            let list = json!({
                "apiVersion": "v1",
                "kind": "ConfigMapList",
                "metadata": {},
                "items": [live_configmap("gone", "uid-gone", "1", Some(&id))],
            });
            send.send_response(ok_json(&list));
            let (_, send) = handle.next_request().await.expect("delete");
            send.send_response(not_found("gone"));
        });

        let result = set.prune(&opts).await.expect("prune");
        server.await.unwrap();
        assert_eq!(result.deleted.len(), 1);
    }
}
