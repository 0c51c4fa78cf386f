//! Typed list+watch loops that project entities and send state deltas to the
//! ingest channel.

use anyhow::Result;
use ferry_core::StateDelta;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use metrics::counter;
use rustc_hash::FxHashSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::entities::{ClusterConfiguration, ClusterConnection, Configuration, Connection, Projection};

/// `(namespace, name)` of an observed entity.
type Key = (String, String);

fn key_of<K: Projection>(obj: &K) -> Key {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn applied<K: Projection>(obj: &K) -> StateDelta {
    let (ns, name) = key_of(obj);
    StateDelta::applied(name, ns, obj.project(), obj.resource_version())
}

/// Keys present before a relist but missing from it.
fn vanished(known: &FxHashSet<Key>, fresh: &FxHashSet<Key>) -> Vec<Key> {
    let mut gone: Vec<Key> = known.difference(fresh).cloned().collect();
    gone.sort();
    gone
}

/// Watch one kind until cancelled or until the ingest side hangs up.
///
/// Stream errors are logged and retried with the watcher's default backoff.
/// A relist emits deletes for every entity that disappeared while the watch
/// was down.
pub async fn watch_kind<K: Projection>(api: Api<K>, tx: mpsc::Sender<StateDelta>, cancel: CancellationToken) -> Result<()> {
    let kind = K::API.kind;
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    let mut known: FxHashSet<Key> = FxHashSet::default();
    info!(kind, "watcher started");

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = stream.next() => ev,
        };
        let Some(ev) = next else {
            warn!(kind, "watcher stream ended");
            break;
        };
        let ev = match ev {
            Ok(ev) => ev,
            Err(e) => {
                warn!(kind, error = %e, "watch error; backing off");
                continue;
            }
        };
        let mut out = Vec::new();
        match ev {
            Event::Applied(o) => {
                known.insert(key_of(&o));
                out.push(applied(&o));
            }
            Event::Deleted(o) => {
                let (ns, name) = key_of(&o);
                known.remove(&(ns.clone(), name.clone()));
                out.push(StateDelta::deleted::<K::Output>(name, ns));
            }
            Event::Restarted(list) => {
                let fresh: FxHashSet<Key> = list.iter().map(key_of).collect();
                let gone = vanished(&known, &fresh);
                debug!(kind, count = list.len(), vanished = gone.len(), "watch relisted");
                for (ns, name) in gone {
                    out.push(StateDelta::deleted::<K::Output>(name, ns));
                }
                out.extend(list.iter().map(applied));
                known = fresh;
            }
        }
        for d in out {
            counter!("watch_deltas_total", 1u64);
            if tx.send(d).await.is_err() {
                debug!(kind, "ingest channel closed; stopping watcher");
                return Ok(());
            }
        }
    }
    info!(kind, "watcher stopped");
    Ok(())
}

/// Spawn watchers for every kind the controller caches, cluster-wide.
pub fn spawn_watchers(client: Client, tx: mpsc::Sender<StateDelta>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
    fn spawn<K: Projection>(api: Api<K>, tx: mpsc::Sender<StateDelta>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = watch_kind(api, tx, cancel).await {
                warn!(kind = K::API.kind, error = %e, "watcher exited with error");
            }
        })
    }

    vec![
        spawn(Api::<Namespace>::all(client.clone()), tx.clone(), cancel.clone()),
        spawn(Api::<ClusterConnection>::all(client.clone()), tx.clone(), cancel.clone()),
        spawn(Api::<Connection>::all(client.clone()), tx.clone(), cancel.clone()),
        spawn(Api::<ClusterConfiguration>::all(client.clone()), tx.clone(), cancel.clone()),
        spawn(Api::<Configuration>::all(client), tx, cancel),
    ]
}
