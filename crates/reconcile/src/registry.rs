use std::sync::Arc;

use ferry_events::StateModified;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster_id;
use crate::handler::{HandlerContext, PassReport, SyncingHandler};
use crate::targets::{ConfigurationSync, ConnectionSync, SyncTarget};

/// A registered derived-resource kind.
pub struct KindRegistration {
    pub entity: &'static str,
    /// Spawn a handler consuming signals from `rx`.
    pub spawn: fn(HandlerContext, mpsc::Receiver<StateModified>, CancellationToken) -> JoinHandle<()>,
    /// A single pass, for one-shot runs.
    pub run_once: fn(HandlerContext, CancellationToken) -> BoxFuture<'static, PassReport>,
}

impl KindRegistration {
    pub const fn of<K: SyncTarget>() -> Self {
        Self { entity: K::ENTITY_NAME, spawn: spawn_handler::<K>, run_once: run_once::<K> }
    }
}

fn spawn_handler<K: SyncTarget>(
    ctx: HandlerContext,
    rx: mpsc::Receiver<StateModified>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let handler = Arc::new(SyncingHandler::<K>::new(ctx));
    tokio::spawn(handler.run(rx, cancel))
}

fn run_once<K: SyncTarget>(ctx: HandlerContext, cancel: CancellationToken) -> BoxFuture<'static, PassReport> {
    async move { SyncingHandler::<K>::new(ctx).handle(&cancel).await }.boxed()
}

pub static KINDS: &[KindRegistration] = &[
    KindRegistration::of::<ConnectionSync>(),
    KindRegistration::of::<ConfigurationSync>(),
    KindRegistration { entity: cluster_id::ENTITY_NAME, spawn: cluster_id::spawn, run_once: cluster_id::run_once },
];
