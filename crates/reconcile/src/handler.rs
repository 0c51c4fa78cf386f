//! The generic syncing handler: one full reconciliation pass per signal.

use std::any::Any;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use ferry_apply::{are_equal, PatchOutcome, ResourceComparer, ResourcePatcher};
use ferry_core::ResourceIdentityPair;
use ferry_events::StateModified;
use ferry_kubehub::{ClusterApi, ClusterError};
use ferry_store::StateContainer;
use futures::FutureExt;
use metrics::{counter, histogram};
use rustc_hash::FxHashSet;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::cluster_id::ClusterIdState;
use crate::gate::ReactionGate;
use crate::namespaces::NamespaceClassifier;
use crate::targets::SyncTarget;

/// Collaborators shared by every handler instance.
#[derive(Clone)]
pub struct HandlerContext {
    pub state: Arc<StateContainer>,
    pub classifier: Arc<dyn NamespaceClassifier>,
    pub comparer: Arc<dyn ResourceComparer>,
    pub client: Arc<dyn ClusterApi>,
    pub gate: Arc<dyn ReactionGate>,
    /// Only templates living here are considered.
    pub operator_namespace: String,
    pub cluster_id: Arc<ClusterIdState>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub gated: bool,
    pub namespaces: usize,
    pub created: usize,
    pub patched: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub skipped_dirty: usize,
    pub failed: usize,
}

impl PassReport {
    pub fn writes(&self) -> usize {
        self.created + self.patched + self.deleted
    }
}

/// Result of one namespace step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Idle,
    Unchanged,
    SkippedDirty,
    Created,
    Patched,
    Deleted,
    Vanished,
}

pub struct SyncingHandler<K: SyncTarget> {
    ctx: HandlerContext,
    patcher: ResourcePatcher,
    _kind: PhantomData<fn() -> K>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn merge_annotations(entity: &mut Json, annotations: &BTreeMap<String, String>) {
    let Some(meta) = entity.get_mut("metadata").and_then(|m| m.as_object_mut()) else { return };
    let slot = meta.entry("annotations").or_insert_with(|| Json::Object(Default::default()));
    if !slot.is_object() {
        *slot = Json::Object(Default::default());
    }
    if let Some(map) = slot.as_object_mut() {
        for (k, v) in annotations {
            map.insert(k.clone(), Json::String(v.clone()));
        }
    }
}

impl<K: SyncTarget> SyncingHandler<K> {
    pub fn new(ctx: HandlerContext) -> Self {
        let patcher = ResourcePatcher::new(Arc::clone(&ctx.client));
        Self { ctx, patcher, _kind: PhantomData }
    }

    fn available_bases(&self) -> Vec<ResourceIdentityPair<K::Base>> {
        self.ctx
            .state
            .get_by_type::<K::Base>()
            .into_iter()
            .filter(|b| b.identity.namespace.eq_ignore_ascii_case(&self.ctx.operator_namespace))
            .collect()
    }

    /// Run one full pass over every namespace.
    pub async fn handle(&self, cancel: &CancellationToken) -> PassReport {
        let mut report = PassReport::default();
        if !self.ctx.gate.can_react() {
            trace!(entity = K::ENTITY_NAME, "not reacting; gate closed");
            report.gated = true;
            return report;
        }

        let t0 = Instant::now();
        let all = self.ctx.classifier.all_namespaces();
        let valid: FxHashSet<String> = self
            .ctx
            .classifier
            .valid_namespaces_for_defaults()
            .into_iter()
            .map(|n| n.to_ascii_lowercase())
            .collect();
        let bases = self.available_bases();
        trace!(entity = K::ENTITY_NAME, templates = bases.len(), namespaces = all.len(), "checking for generation");

        for ns in &all {
            if cancel.is_cancelled() {
                debug!(entity = K::ENTITY_NAME, "pass cancelled");
                break;
            }
            report.namespaces += 1;
            let is_valid = valid.contains(&ns.to_ascii_lowercase());
            let step = AssertUnwindSafe(self.reconcile_namespace(ns, is_valid, &bases)).catch_unwind().await;
            match step {
                Ok(Ok(Step::Created)) => report.created += 1,
                Ok(Ok(Step::Patched)) => report.patched += 1,
                Ok(Ok(Step::Deleted)) => report.deleted += 1,
                Ok(Ok(Step::Unchanged)) => report.unchanged += 1,
                Ok(Ok(Step::SkippedDirty)) => report.skipped_dirty += 1,
                Ok(Ok(Step::Idle | Step::Vanished)) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(entity = K::ENTITY_NAME, ns = %ns, transient = e.is_transient(), error = %e, "namespace step failed");
                }
                Err(panic) => {
                    report.failed += 1;
                    error!(entity = K::ENTITY_NAME, ns = %ns, panic = %panic_message(panic.as_ref()), "namespace step panicked");
                }
            }
        }

        let took_ms = t0.elapsed().as_secs_f64() * 1000.0;
        histogram!("reconcile_pass_ms", took_ms);
        counter!("reconcile_writes_total", report.writes() as u64);
        debug!(entity = K::ENTITY_NAME, took_ms = took_ms as u64, report = ?report, "pass completed");
        report
    }

    async fn reconcile_namespace(
        &self,
        ns: &str,
        is_valid: bool,
        bases: &[ResourceIdentityPair<K::Base>],
    ) -> Result<Step, ClusterError> {
        let name = K::target_name(ns);
        let state = &self.ctx.state;
        if state.get_is_dirty::<K::Target>(&name, ns) {
            trace!(entity = K::ENTITY_NAME, ns = %ns, name = %name, "ignoring dirty target");
            return Ok(Step::SkippedDirty);
        }
        let existing = state.get_by_id::<K::Target>(&name, ns);

        let desired = if is_valid {
            K::select_best_base(bases, ns).and_then(|b| K::compute_desired(b, &name, ns).map(|d| (b, d)))
        } else {
            None
        };

        match desired {
            Some((base, desired)) => {
                if are_equal(self.ctx.comparer.as_ref(), &desired, existing.as_deref()) {
                    return Ok(Step::Unchanged);
                }
                info!(entity = K::ENTITY_NAME, ns = %ns, name = %name, "out-dated target detected; creating or patching");
                state.mark_as_dirty::<K::Target>(&name, ns);
                self.create_or_update(base, &desired, &name, ns).await
            }
            None if existing.is_some() => {
                info!(entity = K::ENTITY_NAME, ns = %ns, name = %name, "superfluous target detected; deleting");
                state.mark_as_dirty::<K::Target>(&name, ns);
                self.delete(&name, ns).await
            }
            None => Ok(Step::Idle),
        }
    }

    async fn create_or_update(
        &self,
        base: &ResourceIdentityPair<K::Base>,
        desired: &K::Target,
        name: &str,
        ns: &str,
    ) -> Result<Step, ClusterError> {
        let t0 = Instant::now();
        let Some(mut entity) = K::build_entity(base, desired, name, ns) else {
            info!(entity = K::ENTITY_NAME, ns = %ns, name = %name, "target data disappeared; skipping");
            return Ok(Step::Vanished);
        };
        let annotations = self
            .ctx
            .classifier
            .annotations_for_managed(&base.identity.name, &base.identity.namespace);
        merge_annotations(&mut entity, &annotations);

        let api = K::api_kind();
        let step = match self.ctx.client.get(&api, name, ns).await? {
            Some(live) => {
                let spec = entity.get("spec").cloned().unwrap_or(Json::Null);
                let outcome = self
                    .patcher
                    .patch(&api, &live, move |v| {
                        if let Some(obj) = v.as_object_mut() {
                            obj.insert("spec".into(), spec);
                        }
                        merge_annotations(v, &annotations);
                    })
                    .await?;
                match outcome {
                    PatchOutcome::Patched { .. } => Step::Patched,
                    PatchOutcome::Unchanged => {
                        warn!(
                            entity = K::ENTITY_NAME,
                            ns = %ns,
                            name = %name,
                            "live target already matches a stale cache entry; dirty until the watch reports it"
                        );
                        Step::Unchanged
                    }
                }
            }
            None => {
                self.ctx.client.save(&api, entity).await?;
                Step::Created
            }
        };
        info!(
            entity = K::ENTITY_NAME,
            ns = %ns,
            name = %name,
            outcome = ?step,
            took_ms = t0.elapsed().as_millis() as u64,
            "target reconciled"
        );
        Ok(step)
    }

    async fn delete(&self, name: &str, ns: &str) -> Result<Step, ClusterError> {
        let t0 = Instant::now();
        match self.ctx.client.delete(&K::api_kind(), name, ns).await {
            Ok(()) => {}
            Err(ClusterError::NotFound(_)) => {
                debug!(entity = K::ENTITY_NAME, ns = %ns, name = %name, "target already gone");
            }
            Err(e) => return Err(e),
        }
        info!(entity = K::ENTITY_NAME, ns = %ns, name = %name, took_ms = t0.elapsed().as_millis() as u64, "deleted target");
        Ok(Step::Deleted)
    }

    /// Consume signals until cancelled or the stream closes.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<StateModified>, cancel: CancellationToken) {
        info!(entity = K::ENTITY_NAME, "syncing handler started");
        loop {
            let signal = tokio::select! {
                _ = cancel.cancelled() => break,
                s = rx.recv() => match s {
                    Some(s) => s,
                    None => break,
                },
            };
            let report = self.handle(&cancel).await;
            debug!(entity = K::ENTITY_NAME, seq = signal.seq, merged = signal.merged, writes = report.writes(), "signal handled");
        }
        info!(entity = K::ENTITY_NAME, "syncing handler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_annotations_keeps_foreign_keys() {
        let mut e = json!({ "metadata": { "name": "x", "annotations": { "other": "1" } } });
        let a = BTreeMap::from([("ferry.dev/managed-by".to_string(), "ferry-operator".to_string())]);
        merge_annotations(&mut e, &a);
        assert_eq!(e["metadata"]["annotations"], json!({ "other": "1", "ferry.dev/managed-by": "ferry-operator" }));

        let mut bare = json!({ "metadata": { "name": "x" } });
        merge_annotations(&mut bare, &a);
        assert_eq!(bare["metadata"]["annotations"]["ferry.dev/managed-by"], "ferry-operator");
    }

    #[test]
    fn panic_messages_are_extracted() {
        let p: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(p.as_ref()), "boom");
        let p: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(p.as_ref()), "bang");
    }
}
