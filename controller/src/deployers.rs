//! Deployers holds the controller for the "Deployer" CRD.

use std::sync::{Arc, LazyLock};

use kube::{
    Resource, ResourceExt,
    api::{Api, ListParams, Patch},
    core::{GroupVersion, GroupVersionKind},
    runtime::{
        controller::Error as CtrlErr,
        events::{Event, EventType},
        reflector::ObjectRef,
    },
};
use serde_json::json;
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::mpsc,
    time::Duration,
};
use tokio_stream::wrappers::{ReceiverStream, SignalStream};
use tracing::*;

use crate::{
    CONTROLLER_NAME, FIELD_MANAGER, MANAGED_BY_LABEL, PARENT_PATCH_PARAMS, RESOURCE_NAME_LABEL,
    RESOURCE_VERSION_LABEL, config, manifest, ocm_annotation,
    plugin::DownloadRequest,
    prelude::*,
    resolve::{Resolution, ResolveParams},
};
use api::v1alpha1::{DeployedObjectReference, Deployer, DeployerStatus};
use applyset::{ApplyOptions, ApplySet, DesiredResource, Metadata, Parent, PruneOptions};

/// PRUNE_FINALIZER guards member cleanup on Deployer deletion.
pub(crate) static PRUNE_FINALIZER: &str = "delivery.ocm.software/applyset-prune";
/// WATCH_FINALIZER guards dynamic-watch teardown on Deployer deletion.
pub(crate) static WATCH_FINALIZER: &str = "delivery.ocm.software/watch";

static SELF_GVK: LazyLock<GroupVersionKind> = LazyLock::new(|| GroupVersionKind {
    group: Deployer::group(&()).to_string(),
    version: Deployer::version(&()).to_string(),
    kind: Deployer::kind(&()).to_string(),
});
static DEFAULT_REQUEUE: LazyLock<Action> =
    LazyLock::new(|| Action::requeue(Duration::from_secs(3600)));

/// Controller is the Deployer controller.
///
/// Resolution completions and dynamic-watch events arrive on `triggers` and
/// re-enqueue the affected Deployers. An error is returned if any setup
/// fails.
#[instrument(skip_all)]
pub fn controller(
    cancel: CancellationToken,
    ctx: Arc<Context>,
    triggers: mpsc::Receiver<ObjectRef<Deployer>>,
) -> Result<ControllerFuture> {
    let client = ctx.client.clone();
    let ctlcfg = watcher::Config::default();
    let root: Api<Deployer> = Api::all(client);
    let sig = SignalStream::new(signal(SignalKind::user_defined1())?);

    Ok(async move {
        if let Err(e) = root.list(&ListParams::default().limit(1)).await {
            error!("CRD ({SELF_GVK:?}) is not queryable ({e:?}); is the CRD installed?");
            return Err(Error::MissingName("no CRD"));
        }

        let ctl = Controller::new(root, ctlcfg)
            .reconcile_on(ReceiverStream::new(triggers))
            .reconcile_all_on(sig)
            .graceful_shutdown_on(cancel.cancelled_owned());
        info!("starting deployer controller");

        ctl.run(reconcile, error_policy, ctx)
            .for_each(|ret| {
                if let Err(err) = ret {
                    match err {
                        CtrlErr::ObjectNotFound(objref) => error!(%objref, "object not found"),
                        CtrlErr::ReconcilerFailed(error, objref) => {
                            error!(%objref, %error, "reconcile error")
                        }
                        CtrlErr::QueueError(error) => error!(%error, "queue error"),
                        CtrlErr::RunnerError(error) => error!(%error, "runner error"),
                    };
                }
                futures::future::ready(())
            })
            .await;
        debug!("deployer controller finished");
        Ok(())
    }
    .boxed())
}

fn error_policy(obj: Arc<Deployer>, err: &Error, ctx: Arc<Context>) -> Action {
    ctx.metrics.reconcile.failures.increment(1);
    error!(
        error = err.to_string(),
        obj.metadata.name, obj.metadata.uid, "reconcile error"
    );
    Action::requeue(Duration::from_secs(5))
}

#[instrument(skip(ctx, deployer), fields(
    kind = Deployer::kind(&()).as_ref(),
    namespace = deployer.namespace().unwrap(),
    name = deployer.name_any(),
    generation = deployer.metadata.generation,
    resource_version = deployer.metadata.resource_version
))]
async fn reconcile(deployer: Arc<Deployer>, ctx: Arc<Context>) -> Result<Action> {
    ctx.metrics.reconcile.runs.increment(1);
    if deployer.spec.suspend.unwrap_or(false) {
        debug!("deployer suspended, skipping");
        return Ok(Action::await_change());
    }
    if deployer.meta().deletion_timestamp.is_some() {
        return cleanup(deployer, ctx).await;
    }
    reconcile_one(deployer, ctx).await
}

#[instrument(skip_all)]
async fn reconcile_one(deployer: Arc<Deployer>, ctx: Arc<Context>) -> Result<Action> {
    let ns = deployer.namespace().unwrap();
    let name = deployer.name_any();
    let oref = deployer.object_ref(&());
    let parent_ref = ObjectRef::from_obj(&*deployer);
    let deployers: Api<Deployer> = Api::namespaced(ctx.client.clone(), &ns);

    ensure_finalizers(&deployers, &deployer).await?;

    // The linked Resource drives everything else; watch it so its progress
    // re-triggers this Deployer without polling.
    let rns = deployer
        .spec
        .resource_ref
        .namespace
        .clone()
        .unwrap_or_else(|| ns.clone());
    let rname = &deployer.spec.resource_ref.name;
    ctx.watches.watch(
        &parent_ref,
        &kube::api::ApiResource::erase::<v1alpha1::Resource>(&()),
        kube::discovery::Scope::Namespaced,
        Some(&rns),
        rname,
    );
    let resources: Api<v1alpha1::Resource> = Api::namespaced(ctx.client.clone(), &rns);
    let Some(resource) = resources.get_opt(rname).await? else {
        info!(resource = %rname, "referenced resource does not exist");
        return not_ready(
            &deployers,
            &deployer,
            "ResourceNotAvailable",
            format!("Resource {rns}/{rname} not found"),
        )
        .await;
    };
    let rstatus = resource.status.clone().unwrap_or_default();
    let (Some(component), Some(resinfo)) = (rstatus.component.clone(), rstatus.resource.clone())
    else {
        return not_ready(
            &deployers,
            &deployer,
            "ResourceNotAvailable",
            format!("Resource {rns}/{rname} has not resolved yet"),
        )
        .await;
    };
    if !rstatus.ready() || resinfo.digest.is_none() {
        return not_ready(
            &deployers,
            &deployer,
            "ResourceNotSynced",
            format!("Resource {rns}/{rname} is not ready"),
        )
        .await;
    }

    // Resolution: cache hit proceeds, anything in flight yields until the
    // completion event re-triggers this reconcile.
    let refs = config::effective_refs(&deployer, &resource);
    let params = ResolveParams {
        namespace: ns.clone(),
        repository_spec: component.repository_spec.clone(),
        component: component.name.clone(),
        version: component.version.clone(),
        config_refs: refs.clone(),
    };
    let resolved = match ctx.resolver.resolve(parent_ref.clone(), params.clone()).await {
        Ok(Resolution::Ready(r)) => r,
        Ok(Resolution::InProgress(_)) => {
            debug!("resolution in progress");
            return not_ready(
                &deployers,
                &deployer,
                "ResolutionInProgress",
                format!("resolving {} {}", component.name, component.version),
            )
            .await;
        }
        Err(Error::QueueFull) => {
            set_ready_condition(
                &deployers,
                &deployer,
                "False",
                "ResolutionInProgress",
                "resolution queue is full".into(),
            )
            .await?;
            return Err(Error::QueueFull);
        }
        Err(err) => {
            set_ready_condition(
                &deployers,
                &deployer,
                "False",
                "GetComponentVersionFailed",
                err.to_string(),
            )
            .await?;
            return Err(err);
        }
    };

    let Some(entry) = resolved.descriptor.select(&resinfo) else {
        return not_ready(
            &deployers,
            &deployer,
            "ResourceNotAvailable",
            format!(
                "resource {:?} not present in component {} {}",
                resinfo.name, resolved.descriptor.name, resolved.descriptor.version
            ),
        )
        .await;
    };
    trace!(resource = entry.name, "selected descriptor resource");

    let cfg = ctx.resolver.load_config(&params).await?;
    let blob = match ctx
        .resolver
        .download_blob(DownloadRequest {
            repository_spec: component.repository_spec.clone(),
            component: component.name.clone(),
            version: component.version.clone(),
            resource: resinfo.clone(),
            config: cfg,
        })
        .await
    {
        Ok(blob) => blob,
        Err(err @ Error::DigestMismatch(_)) => {
            // Digest failures do not self-heal; surface and wait.
            warn_event(&ctx, &oref, "DigestMismatch", err.to_string()).await?;
            return not_ready(&deployers, &deployer, "DigestMismatch", err.to_string()).await;
        }
        Err(err) => {
            set_ready_condition(
                &deployers,
                &deployer,
                "False",
                "GetComponentVersionFailed",
                err.to_string(),
            )
            .await?;
            return Err(err);
        }
    };

    let objects = match manifest::decode(&blob) {
        Ok(objects) => objects,
        Err(err) => {
            warn_event(&ctx, &oref, "DecodeError", err.to_string()).await?;
            return not_ready(&deployers, &deployer, "DecodeError", err.to_string()).await;
        }
    };
    debug!(objects = objects.len(), "decoded manifest stream");

    let batch = to_batch(&deployer, &component, &resinfo, objects);

    // Project -> parent metadata -> apply -> prune, in that order. The prune
    // scope comes from the projection so orphans under group-kinds that left
    // the batch are still found.
    let set = ApplySet::new(
        ctx.client.clone(),
        ctx.discovery.as_ref(),
        Parent::of(&*deployer),
        TOOLING.as_str(),
        FIELD_MANAGER,
    );
    let projected = match set.project(&batch) {
        Ok(md) => md,
        Err(err) => {
            set_ready_condition(&deployers, &deployer, "False", "ApplyFailed", err.to_string())
                .await?;
            return Err(err.into());
        }
    };
    write_parent_metadata(&deployers, &name, &projected).await?;

    let (result, batch_md) = set
        .apply(
            &batch,
            &ApplyOptions {
                concurrency: ctx.apply_concurrency,
            },
        )
        .await?;
    ctx.metrics
        .apply
        .applied
        .increment(u64::try_from(result.applied.len()).unwrap_or(0));

    let errors = result.errors();
    if !errors.is_empty() {
        // A failed apply leaves its UID out of the keep set; pruning now
        // could delete a healthy prior instance.
        let message = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        warn!(errors = errors.len(), note = %message, "apply reported errors, skipping prune");
        warn_event(&ctx, &oref, "ApplyFailed", message.clone()).await?;
        set_ready_condition(&deployers, &deployer, "False", "ApplyFailed", message).await?;
        let conflicted = errors
            .iter()
            .all(|e| matches!(e, applyset::Error::Conflict { .. }));
        return if conflicted {
            // Somebody else owns those objects; nothing to retry until a
            // human intervenes.
            Ok(Action::await_change())
        } else {
            Ok(Action::requeue(Duration::from_secs(30)))
        };
    }

    let pruned = set
        .prune(&PruneOptions {
            scope: set.prune_scope(&projected),
            keep_uids: result.keep_uids(),
            concurrency: ctx.apply_concurrency,
        })
        .await?;
    ctx.metrics
        .apply
        .pruned
        .increment(u64::try_from(pruned.deleted.len()).unwrap_or(0));
    if pruned.has_pruned() {
        info!(deleted = pruned.deleted.len(), "pruned orphaned members");
    }

    // The batch is now the whole truth; shrink the parent's memory to it.
    write_parent_metadata(&deployers, &name, &batch_md).await?;

    for a in result.applied.iter().filter(|a| a.error.is_none()) {
        let Ok(gv) = a.api_version.parse::<GroupVersion>() else {
            continue;
        };
        if let Some((ar, caps)) = ctx.discovery.resolve_gvk(&gv.with_kind(&a.kind)) {
            ctx.watches
                .watch(&parent_ref, &ar, caps.scope, a.namespace.as_deref(), &a.name);
        }
    }

    let mut next = deployer.status.clone().unwrap_or_default();
    next.deployed.clear();
    for a in result.applied.iter().filter(|a| a.error.is_none()) {
        next.add_deployed(DeployedObjectReference {
            api_version: a.api_version.clone(),
            kind: a.kind.clone(),
            name: a.name.clone(),
            namespace: a.namespace.clone(),
            uid: a.uid.clone(),
        });
    }
    next.effective_ocm_config = config::echo_refs(&refs);
    next.add_condition(Condition {
        type_: "Ready".into(),
        status: "True".into(),
        reason: "Applied".into(),
        message: format!(
            "applied {} {} ({} objects)",
            component.name,
            component.version,
            result.applied.len()
        ),
        observed_generation: deployer.metadata.generation,
        last_transition_time: crate::now(),
    });
    publish_status(&deployers, &name, next).await?;

    ctx.recorder
        .publish(
            &Event {
                type_: EventType::Normal,
                reason: "Applied".into(),
                note: Some(format!("applied {} {}", component.name, component.version)),
                action: "Reconcile".into(),
                secondary: None,
            },
            &oref,
        )
        .await
        .map_err(Error::Kube)?;

    Ok(DEFAULT_REQUEUE.clone())
}

/// To_batch stamps ownership metadata onto the decoded objects.
fn to_batch(
    deployer: &Deployer,
    component: &v1alpha1::ComponentInfo,
    resinfo: &v1alpha1::ResourceInfo,
    objects: Vec<kube::api::DynamicObject>,
) -> Vec<DesiredResource> {
    let owner = deployer
        .controller_owner_ref(&())
        .expect("unable to create owner ref");
    objects
        .into_iter()
        .map(|mut o| {
            let labels = o.labels_mut();
            labels.insert(MANAGED_BY_LABEL.clone(), CONTROLLER_NAME.into());
            labels.insert(RESOURCE_NAME_LABEL.clone(), resinfo.name.clone());
            if let Some(v) = &resinfo.version {
                labels.insert(RESOURCE_VERSION_LABEL.clone(), v.clone());
            }

            let annotations = o.annotations_mut();
            annotations.insert(ocm_annotation("component/name"), component.name.clone());
            annotations.insert(ocm_annotation("component/version"), component.version.clone());
            annotations.insert(
                ocm_annotation("resource/identity.name"),
                resinfo.name.clone(),
            );
            for (k, v) in &resinfo.extra_identity {
                annotations.insert(ocm_annotation(format!("resource/identity.{k}")), v.clone());
            }
            if let Some(d) = &resinfo.digest {
                annotations.insert(ocm_annotation("resource/digest/value"), d.value.clone());
                annotations.insert(
                    ocm_annotation("resource/digest/hashAlgorithm"),
                    d.hash_algorithm.clone(),
                );
                annotations.insert(
                    ocm_annotation("resource/digest/normalisationAlgorithm"),
                    d.normalisation_algorithm.clone(),
                );
            }
            if let Some(access) = &resinfo.access {
                annotations.insert(ocm_annotation("resource/access"), access.to_string());
            }

            o.owner_references_mut().push(owner.clone());
            DesiredResource::new(o)
        })
        .collect()
}

/// Write_parent_metadata applies ApplySet bookkeeping to the Deployer under
/// the dedicated parent field owner.
async fn write_parent_metadata(api: &Api<Deployer>, name: &str, md: &Metadata) -> Result<()> {
    let patch = json!({
        "apiVersion": Deployer::api_version(&()),
        "kind": Deployer::kind(&()),
        "metadata": {
            "name": name,
            "labels": md.labels(),
            "annotations": md.annotations(),
        },
    });
    api.patch(name, &PARENT_PATCH_PARAMS, &Patch::Apply(&patch))
        .await?;
    Ok(())
}

async fn ensure_finalizers(api: &Api<Deployer>, deployer: &Deployer) -> Result<()> {
    let have = deployer.finalizers();
    if have.iter().any(|f| f == PRUNE_FINALIZER) && have.iter().any(|f| f == WATCH_FINALIZER) {
        return Ok(());
    }
    let mut want = have.to_vec();
    for f in [PRUNE_FINALIZER, WATCH_FINALIZER] {
        if !want.iter().any(|x| x == f) {
            want.push(f.to_string());
        }
    }
    trace!(?want, "adding finalizers");
    let patch = json!({"metadata": {"finalizers": want}});
    api.patch(&deployer.name_any(), &PATCH_PARAMS, &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn write_finalizers(api: &Api<Deployer>, name: &str, want: &[String]) -> Result<()> {
    trace!(?want, "writing finalizers");
    let patch = json!({"metadata": {"finalizers": want}});
    api.patch(name, &PATCH_PARAMS, &Patch::Merge(&patch)).await?;
    Ok(())
}

/// Cleanup runs the deletion flow: prune every member discoverable through
/// the parent's annotation memory, then tear down the dynamic watches; each
/// step drops its finalizer once quiescent.
#[instrument(skip_all)]
async fn cleanup(deployer: Arc<Deployer>, ctx: Arc<Context>) -> Result<Action> {
    let ns = deployer.namespace().unwrap();
    let name = deployer.name_any();
    let oref = deployer.object_ref(&());
    let parent_ref = ObjectRef::from_obj(&*deployer);
    let deployers: Api<Deployer> = Api::namespaced(ctx.client.clone(), &ns);
    let mut remaining = deployer.finalizers().to_vec();

    if remaining.iter().any(|f| f == PRUNE_FINALIZER) {
        let parent = Parent::of(&*deployer);
        let md = Metadata::parse(parent.id(), TOOLING.clone(), &parent.annotations);
        if !md.group_kinds.is_empty() {
            let set = ApplySet::new(
                ctx.client.clone(),
                ctx.discovery.as_ref(),
                parent,
                TOOLING.as_str(),
                FIELD_MANAGER,
            );
            let pruned = set
                .prune(&PruneOptions {
                    scope: set.prune_scope(&md),
                    keep_uids: Default::default(),
                    concurrency: ctx.apply_concurrency,
                })
                .await?;
            if pruned.has_pruned() {
                info!(deleted = pruned.deleted.len(), "pruned members on deletion");
                return Ok(Action::requeue(Duration::from_secs(1)));
            }
        }
        remaining.retain(|f| f != PRUNE_FINALIZER);
        write_finalizers(&deployers, &name, &remaining).await?;
    }

    if remaining.iter().any(|f| f == WATCH_FINALIZER) {
        ctx.watches.unregister(&parent_ref);
        remaining.retain(|f| f != WATCH_FINALIZER);
        write_finalizers(&deployers, &name, &remaining).await?;
    }

    ctx.recorder
        .publish(
            &Event {
                type_: EventType::Normal,
                reason: "DeleteRequested".into(),
                note: Some(format!("Delete `{}`", deployer.name_any())),
                action: "Deleting".into(),
                secondary: None,
            },
            &oref,
        )
        .await
        .map_err(Error::Kube)?;
    Ok(Action::await_change())
}

/// Not_ready records a Ready=False condition and yields without error; the
/// registered watches or resolver events re-trigger the reconcile.
async fn not_ready(
    api: &Api<Deployer>,
    deployer: &Deployer,
    reason: &str,
    message: String,
) -> Result<Action> {
    debug!(reason, note = %message, "deployer not ready");
    set_ready_condition(api, deployer, "False", reason, message).await?;
    Ok(Action::await_change())
}

async fn set_ready_condition(
    api: &Api<Deployer>,
    deployer: &Deployer,
    status: &str,
    reason: &str,
    message: String,
) -> Result<()> {
    let mut next = deployer.status.clone().unwrap_or_default();
    next.add_condition(Condition {
        type_: "Ready".into(),
        status: status.into(),
        reason: reason.into(),
        message,
        observed_generation: deployer.metadata.generation,
        last_transition_time: crate::now(),
    });
    publish_status(api, &deployer.name_any(), next).await
}

async fn publish_status(api: &Api<Deployer>, name: &str, status: DeployerStatus) -> Result<()> {
    let patch = json!({
        "apiVersion": Deployer::api_version(&()),
        "kind": Deployer::kind(&()),
        "status": status,
    });
    api.patch_status(name, &PATCH_PARAMS, &Patch::Apply(&patch))
        .await?;
    Ok(())
}

async fn warn_event(
    ctx: &Context,
    oref: &k8s_openapi::api::core::v1::ObjectReference,
    reason: &str,
    note: String,
) -> Result<()> {
    ctx.recorder
        .publish(
            &Event {
                type_: EventType::Warning,
                reason: reason.into(),
                note: Some(note),
                action: "Reconcile".into(),
                secondary: None,
            },
            oref,
        )
        .await
        .map_err(Error::Kube)?;
    Ok(())
}
