//! Stable cluster identity, kept in a ConfigMap in the operator namespace.
//!
//! The record is created once and never overwritten while readable. If it is
//! deleted, the identity already loaded by this process is written back so
//! the id survives.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use ferry_events::StateModified;
use ferry_kubehub::{ClusterError, CONFIG_MAP};
use futures::future::BoxFuture;
use futures::FutureExt;
use metrics::counter;
use serde_json::{json, Value as Json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::handler::{HandlerContext, PassReport};
use crate::namespaces::{MANAGED_BY_ANNOTATION, MANAGED_BY_VALUE};

pub const ENTITY_NAME: &str = "ClusterId";
const ID_KEY: &str = "cluster-id";
const CREATED_ON_KEY: &str = "created-on";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterId {
    pub guid: Uuid,
    pub created_on: DateTime<Utc>,
}

impl ClusterId {
    pub fn new_id() -> Self {
        Self { guid: Uuid::new_v4(), created_on: Utc::now().trunc_subsecs(0) }
    }

    fn from_entity(entity: &Json) -> Option<Self> {
        let data = entity.get("data")?;
        let guid = Uuid::parse_str(data.get(ID_KEY)?.as_str()?).ok()?;
        let created_on = DateTime::parse_from_rfc3339(data.get(CREATED_ON_KEY)?.as_str()?).ok()?;
        Some(Self { guid, created_on: created_on.with_timezone(&Utc) })
    }

    fn to_entity(self, name: &str, namespace: &str) -> Json {
        let guid = self.guid.to_string();
        let created_on = self.created_on.to_rfc3339_opts(SecondsFormat::Secs, true);
        json!({
            "apiVersion": CONFIG_MAP.api_version(),
            "kind": CONFIG_MAP.kind,
            "metadata": {
                "name": name,
                "namespace": namespace,
                "annotations": { MANAGED_BY_ANNOTATION: MANAGED_BY_VALUE },
            },
            "data": { ID_KEY: guid, CREATED_ON_KEY: created_on },
        })
    }
}

/// Process-wide view of the cluster identity.
#[derive(Debug)]
pub struct ClusterIdState {
    name: String,
    current: ArcSwapOption<ClusterId>,
}

impl ClusterIdState {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), current: ArcSwapOption::empty() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> Option<ClusterId> {
        self.current.load_full().map(|id| *id)
    }

    fn set(&self, id: ClusterId) {
        self.current.store(Some(Arc::new(id)));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Unchanged,
    Created,
    Repaired,
}

async fn sync(ctx: &HandlerContext) -> Result<Outcome, ClusterError> {
    let ids = &ctx.cluster_id;
    let ns = ctx.operator_namespace.as_str();
    match ctx.client.get(&CONFIG_MAP, ids.name(), ns).await? {
        Some(entity) => match ClusterId::from_entity(&entity) {
            Some(id) => {
                if ids.get() != Some(id) {
                    info!(guid = %id.guid, created_on = %id.created_on, "cluster id loaded");
                    ids.set(id);
                }
                Ok(Outcome::Unchanged)
            }
            None => {
                let id = ids.get().unwrap_or_else(ClusterId::new_id);
                warn!(name = %ids.name(), ns = %ns, guid = %id.guid, "cluster id record unreadable; rewriting");
                ctx.client.save(&CONFIG_MAP, id.to_entity(ids.name(), ns)).await?;
                ids.set(id);
                Ok(Outcome::Repaired)
            }
        },
        None => {
            let id = ids.get().unwrap_or_else(ClusterId::new_id);
            ctx.client.save(&CONFIG_MAP, id.to_entity(ids.name(), ns)).await?;
            info!(name = %ids.name(), ns = %ns, guid = %id.guid, "cluster id record created");
            ids.set(id);
            Ok(Outcome::Created)
        }
    }
}

/// One pass over the identity record.
pub async fn ensure_cluster_id(ctx: &HandlerContext, cancel: &CancellationToken) -> PassReport {
    let mut report = PassReport::default();
    if !ctx.gate.can_react() {
        trace!(entity = ENTITY_NAME, "not reacting; gate closed");
        report.gated = true;
        return report;
    }
    if cancel.is_cancelled() {
        return report;
    }
    report.namespaces = 1;
    match sync(ctx).await {
        Ok(Outcome::Unchanged) => report.unchanged += 1,
        Ok(Outcome::Created) => report.created += 1,
        Ok(Outcome::Repaired) => report.patched += 1,
        Err(e) => {
            report.failed += 1;
            warn!(entity = ENTITY_NAME, transient = e.is_transient(), error = %e, "cluster id sync failed");
        }
    }
    counter!("reconcile_writes_total", report.writes() as u64);
    report
}

pub(crate) fn spawn(
    ctx: HandlerContext,
    mut rx: mpsc::Receiver<StateModified>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(entity = ENTITY_NAME, "syncing handler started");
        loop {
            let signal = tokio::select! {
                _ = cancel.cancelled() => break,
                s = rx.recv() => match s {
                    Some(s) => s,
                    None => break,
                },
            };
            let report = ensure_cluster_id(&ctx, &cancel).await;
            debug!(entity = ENTITY_NAME, seq = signal.seq, writes = report.writes(), "signal handled");
        }
        info!(entity = ENTITY_NAME, "syncing handler stopped");
    })
}

pub(crate) fn run_once(ctx: HandlerContext, cancel: CancellationToken) -> BoxFuture<'static, PassReport> {
    async move { ensure_cluster_id(&ctx, &cancel).await }.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ferry_apply::comparer_for;
    use ferry_core::config::ComparerKind;
    use ferry_kubehub::{ClusterApi, ClusterCall, LeaderElectionState, MockClusterApi};
    use ferry_store::StateContainer;

    use crate::gate::ReactionHelper;
    use crate::namespaces::ClusterDefaults;

    const NS: &str = "ferry-system";
    const NAME: &str = "ferry-cluster-id";

    fn context(leader: bool) -> (HandlerContext, Arc<MockClusterApi>) {
        let state = Arc::new(StateContainer::new());
        let mock = Arc::new(MockClusterApi::new());
        let ctx = HandlerContext {
            state: Arc::clone(&state),
            classifier: Arc::new(ClusterDefaults::new(state, Vec::new())),
            comparer: comparer_for(ComparerKind::Fast),
            client: mock.clone(),
            gate: Arc::new(ReactionHelper::new(Arc::new(LeaderElectionState::new(leader)), Duration::ZERO)),
            operator_namespace: NS.into(),
            cluster_id: Arc::new(ClusterIdState::new(NAME)),
        };
        (ctx, mock)
    }

    #[tokio::test]
    async fn missing_record_is_created_once() {
        let (ctx, mock) = context(true);
        let cancel = CancellationToken::new();

        let first = ensure_cluster_id(&ctx, &cancel).await;
        assert_eq!(first.created, 1);
        let id = ctx.cluster_id.get().unwrap();
        let stored = mock.object(&CONFIG_MAP, NAME, NS).unwrap();
        assert_eq!(ClusterId::from_entity(&stored), Some(id));
        assert_eq!(stored["metadata"]["annotations"][MANAGED_BY_ANNOTATION], MANAGED_BY_VALUE);

        mock.clear_calls();
        let second = ensure_cluster_id(&ctx, &cancel).await;
        assert_eq!((second.unchanged, second.writes()), (1, 0));
        assert_eq!(mock.writes(), 0);
    }

    #[tokio::test]
    async fn existing_record_is_adopted() {
        let (ctx, mock) = context(true);
        let existing = ClusterId::new_id();
        mock.insert(&CONFIG_MAP, existing.to_entity(NAME, NS));

        let report = ensure_cluster_id(&ctx, &CancellationToken::new()).await;
        assert_eq!(report.unchanged, 1);
        assert_eq!(ctx.cluster_id.get(), Some(existing));
        assert_eq!(mock.writes(), 0);
    }

    #[tokio::test]
    async fn deleted_record_comes_back_with_the_same_id() {
        let (ctx, mock) = context(true);
        let cancel = CancellationToken::new();
        ensure_cluster_id(&ctx, &cancel).await;
        let id = ctx.cluster_id.get().unwrap();

        mock.delete(&CONFIG_MAP, NAME, NS).await.unwrap();
        assert_eq!(ensure_cluster_id(&ctx, &cancel).await.created, 1);
        let stored = mock.object(&CONFIG_MAP, NAME, NS).unwrap();
        assert_eq!(ClusterId::from_entity(&stored).map(|c| c.guid), Some(id.guid));
    }

    #[tokio::test]
    async fn unreadable_record_is_rewritten() {
        let (ctx, mock) = context(true);
        mock.insert(
            &CONFIG_MAP,
            json!({ "metadata": { "name": NAME, "namespace": NS }, "data": { "cluster-id": "not-a-uuid" } }),
        );
        let report = ensure_cluster_id(&ctx, &CancellationToken::new()).await;
        assert_eq!(report.patched, 1);
        let stored = mock.object(&CONFIG_MAP, NAME, NS).unwrap();
        assert_eq!(ClusterId::from_entity(&stored), ctx.cluster_id.get());
        assert!(matches!(&mock.calls()[0], ClusterCall::Save { name, .. } if name == NAME));
    }

    #[tokio::test]
    async fn followers_leave_the_record_alone() {
        let (ctx, mock) = context(false);
        let report = ensure_cluster_id(&ctx, &CancellationToken::new()).await;
        assert!(report.gated);
        assert!(mock.calls().is_empty());
        assert!(ctx.cluster_id.get().is_none());
    }

    #[tokio::test]
    async fn transport_failure_is_reported() {
        let (ctx, mock) = context(true);
        mock.fail_namespace(NS);
        let report = ensure_cluster_id(&ctx, &CancellationToken::new()).await;
        assert_eq!(report.failed, 1);
        assert!(ctx.cluster_id.get().is_none());
    }
}
