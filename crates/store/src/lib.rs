//! Ferry store: the in-process state container with dirty tracking, and the
//! watch ingest loop feeding it.
//!
//! Readers load an immutable [`StateSnapshot`] through `ArcSwap` and never
//! block. Writers go through [`StateContainer::apply`], which serializes
//! batches, publishes the next snapshot and only then clears dirty flags for
//! every observed identity.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use ferry_core::{DeltaKind, NamespacedResource, Payload, ResourceIdentity, ResourceIdentityPair, StateDelta};
use ferry_events::{EventStream, StateChange};
use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A cached watch observation.
#[derive(Clone)]
pub struct CachedResource {
    pub identity: ResourceIdentity,
    pub payload: Payload,
    pub last_observed_version: Option<String>,
}

impl std::fmt::Debug for CachedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedResource")
            .field("identity", &self.identity)
            .field("last_observed_version", &self.last_observed_version)
            .finish()
    }
}

/// `(namespace, name)` within one kind.
type NameKey = (String, String);
type KindMap = FxHashMap<NameKey, CachedResource>;

/// Immutable view of the cache at one epoch.
#[derive(Default)]
pub struct StateSnapshot {
    pub epoch: u64,
    kinds: FxHashMap<&'static str, Arc<KindMap>>,
}

impl StateSnapshot {
    pub fn len(&self) -> usize {
        self.kinds.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry(&self, identity: &ResourceIdentity) -> Option<&CachedResource> {
        self.kinds
            .get(identity.kind)?
            .get(&(identity.namespace.clone(), identity.name.clone()))
    }

    /// All cached resources of type `T`, ordered by identity.
    pub fn get_by_type<T: NamespacedResource>(&self) -> Vec<ResourceIdentityPair<T>> {
        let Some(map) = self.kinds.get(T::KIND) else { return Vec::new() };
        let mut out: Vec<ResourceIdentityPair<T>> = map
            .values()
            .filter_map(|c| {
                let resource = Arc::clone(&c.payload).downcast::<T>().ok()?;
                Some(ResourceIdentityPair { identity: c.identity.clone(), resource })
            })
            .collect();
        out.sort_by(|a, b| a.identity.cmp(&b.identity));
        out
    }

    pub fn get_by_id<T: NamespacedResource>(&self, name: &str, namespace: &str) -> Option<Arc<T>> {
        let c = self.kinds.get(T::KIND)?.get(&(namespace.to_string(), name.to_string()))?;
        Arc::clone(&c.payload).downcast::<T>().ok()
    }
}

/// Authoritative in-process cache of watched resources.
pub struct StateContainer {
    snap: ArcSwap<StateSnapshot>,
    writer: Mutex<()>,
    dirty: Mutex<FxHashSet<ResourceIdentity>>,
}

impl Default for StateContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl StateContainer {
    pub fn new() -> Self {
        Self {
            snap: ArcSwap::from_pointee(StateSnapshot::default()),
            writer: Mutex::new(()),
            dirty: Mutex::new(FxHashSet::default()),
        }
    }

    pub fn snapshot(&self) -> Arc<StateSnapshot> {
        self.snap.load_full()
    }

    pub fn epoch(&self) -> u64 {
        self.snap.load().epoch
    }

    pub fn len(&self) -> usize {
        self.snap.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_by_type<T: NamespacedResource>(&self) -> Vec<ResourceIdentityPair<T>> {
        self.snap.load().get_by_type::<T>()
    }

    pub fn get_by_id<T: NamespacedResource>(&self, name: &str, namespace: &str) -> Option<Arc<T>> {
        self.snap.load().get_by_id::<T>(name, namespace)
    }

    /// Exclude an identity from reconciliation until the watch observes it again.
    pub fn mark_as_dirty<T: NamespacedResource>(&self, name: &str, namespace: &str) {
        let identity = ResourceIdentity::of::<T>(name, namespace);
        let inserted = self.dirty.lock().unwrap_or_else(PoisonError::into_inner).insert(identity);
        if inserted {
            counter!("state_dirty_marked_total", 1u64);
        }
    }

    pub fn get_is_dirty<T: NamespacedResource>(&self, name: &str, namespace: &str) -> bool {
        let identity = ResourceIdentity::of::<T>(name, namespace);
        self.dirty.lock().unwrap_or_else(PoisonError::into_inner).contains(&identity)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn upsert<T: NamespacedResource>(&self, name: &str, namespace: &str, resource: T, resource_version: Option<String>) -> u64 {
        self.apply(vec![StateDelta::applied(name, namespace, resource, resource_version)])
    }

    pub fn remove<T: NamespacedResource>(&self, name: &str, namespace: &str) -> u64 {
        self.apply(vec![StateDelta::deleted::<T>(name, namespace)])
    }

    /// Apply a batch of watch observations and publish the next snapshot.
    /// Returns the new epoch.
    pub fn apply(&self, batch: Vec<StateDelta>) -> u64 {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let cur = self.snap.load_full();
        let mut kinds = cur.kinds.clone();
        let mut observed = Vec::with_capacity(batch.len());
        histogram!("state_apply_batch_size", batch.len() as f64);

        for d in batch {
            let key = (d.identity.namespace.clone(), d.identity.name.clone());
            let map = Arc::make_mut(kinds.entry(d.identity.kind).or_default());
            match d.kind {
                DeltaKind::Applied => {
                    let Some(payload) = d.payload else {
                        warn!(identity = %d.identity, "applied delta without payload; ignoring");
                        continue;
                    };
                    map.insert(
                        key,
                        CachedResource {
                            identity: d.identity.clone(),
                            payload,
                            last_observed_version: d.resource_version,
                        },
                    );
                }
                DeltaKind::Deleted => {
                    map.remove(&key);
                }
            }
            observed.push(d.identity);
        }

        let epoch = cur.epoch.saturating_add(1);
        let next = StateSnapshot { epoch, kinds };
        gauge!("state_entries", next.len() as f64);
        self.snap.store(Arc::new(next));

        // Cleared only after the snapshot reflecting the observation is visible.
        let mut dirty = self.dirty.lock().unwrap_or_else(PoisonError::into_inner);
        for identity in &observed {
            if dirty.remove(identity) {
                debug!(identity = %identity, "dirty flag cleared by watch observation");
            }
        }
        epoch
    }
}

/// Keyed batch of pending deltas; the latest delta per identity wins and
/// first-arrival order is kept.
pub struct Coalescer {
    map: FxHashMap<ResourceIdentity, StateDelta>,
    order: VecDeque<ResourceIdentity>,
}

impl Default for Coalescer {
    fn default() -> Self {
        Self::new()
    }
}

impl Coalescer {
    pub fn new() -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new() }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn push(&mut self, d: StateDelta) {
        if !self.map.contains_key(&d.identity) {
            self.order.push_back(d.identity.clone());
        }
        self.map.insert(d.identity.clone(), d);
    }

    pub fn drain_ready(&mut self) -> Vec<StateDelta> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(identity) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&identity) {
                out.push(d);
            }
        }
        out
    }
}

pub const DEFAULT_FLUSH_EVERY: Duration = Duration::from_millis(8);

async fn flush(coalescer: &mut Coalescer, state: &StateContainer, events: &EventStream) {
    let batch = coalescer.drain_ready();
    if batch.is_empty() {
        return;
    }
    let changed = batch.len();
    let epoch = state.apply(batch);
    events.publish(StateChange { epoch, changed }).await;
}

/// Spawn the ingest loop: watchers send deltas into the returned channel, the
/// loop applies them in coalesced batches and publishes one change per batch.
pub fn spawn_ingest(
    state: Arc<StateContainer>,
    events: Arc<EventStream>,
    cap: usize,
    flush_every: Duration,
    cancel: CancellationToken,
) -> (mpsc::Sender<StateDelta>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<StateDelta>(cap.max(1));
    let handle = tokio::spawn(async move {
        let mut coalescer = Coalescer::new();
        let mut ticker = tokio::time::interval(flush_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("ingest cancelled");
                    break;
                }
                maybe = rx.recv() => {
                    match maybe {
                        Some(d) => coalescer.push(d),
                        None => {
                            debug!("delta channel closed; draining and exiting ingest loop");
                            flush(&mut coalescer, &state, &events).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => flush(&mut coalescer, &state, &events).await,
            }
        }
        info!(epoch = state.epoch(), entries = state.len(), "ingest loop stopped");
    });
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::resources::{ConnectionResource, ConnectionSpec, NamespaceResource};

    fn conn(url: &str) -> ConnectionResource {
        ConnectionResource { spec: ConnectionSpec { url: url.into(), ..Default::default() } }
    }

    #[test]
    fn get_by_type_and_id_are_typed_and_ordered() {
        let state = StateContainer::new();
        state.upsert("b", "", NamespaceResource::default(), None);
        state.upsert("a", "", NamespaceResource::default(), None);
        state.upsert("default-connection", "a", conn("https://x"), Some("1".into()));

        let namespaces = state.get_by_type::<NamespaceResource>();
        let names: Vec<_> = namespaces.iter().map(|p| p.identity.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let c = state.get_by_id::<ConnectionResource>("default-connection", "a").unwrap();
        assert_eq!(c.spec.url, "https://x");
        assert!(state.get_by_id::<ConnectionResource>("default-connection", "b").is_none());
        assert!(state.get_by_id::<NamespaceResource>("default-connection", "a").is_none());
    }

    #[test]
    fn snapshots_are_isolated_from_later_writes() {
        let state = StateContainer::new();
        state.upsert("c", "ns", conn("one"), None);
        let before = state.snapshot();
        state.upsert("c", "ns", conn("two"), None);
        state.remove::<ConnectionResource>("c", "ns");

        assert_eq!(before.get_by_id::<ConnectionResource>("c", "ns").unwrap().spec.url, "one");
        assert!(state.get_by_id::<ConnectionResource>("c", "ns").is_none());
        assert_eq!(state.epoch(), before.epoch + 2);
    }

    #[test]
    fn dirty_flag_is_cleared_only_by_observation() {
        let state = StateContainer::new();
        state.mark_as_dirty::<ConnectionResource>("c", "ns");
        assert!(state.get_is_dirty::<ConnectionResource>("c", "ns"));
        assert!(!state.get_is_dirty::<ConnectionResource>("c", "other"));

        // Unrelated observation leaves it set.
        state.upsert("c", "other", conn("x"), None);
        assert!(state.get_is_dirty::<ConnectionResource>("c", "ns"));

        state.upsert("c", "ns", conn("x"), Some("2".into()));
        assert!(!state.get_is_dirty::<ConnectionResource>("c", "ns"));

        state.mark_as_dirty::<ConnectionResource>("c", "ns");
        state.remove::<ConnectionResource>("c", "ns");
        assert!(!state.get_is_dirty::<ConnectionResource>("c", "ns"));
        assert_eq!(state.dirty_count(), 0);
    }

    #[test]
    fn last_observed_version_is_recorded() {
        let state = StateContainer::new();
        state.upsert("c", "ns", conn("x"), Some("42".into()));
        let snap = state.snapshot();
        let entry = snap.entry(&ResourceIdentity::of::<ConnectionResource>("c", "ns")).unwrap();
        assert_eq!(entry.last_observed_version.as_deref(), Some("42"));
    }

    #[test]
    fn coalescer_keeps_latest_per_identity_in_first_arrival_order() {
        let mut c = Coalescer::new();
        c.push(StateDelta::applied("a", "", NamespaceResource::default(), Some("1".into())));
        c.push(StateDelta::applied("b", "", NamespaceResource::default(), Some("1".into())));
        c.push(StateDelta::deleted::<NamespaceResource>("a", ""));
        assert_eq!(c.len(), 2);
        let out = c.drain_ready();
        assert_eq!(out[0].identity.name, "a");
        assert_eq!(out[0].kind, DeltaKind::Deleted);
        assert_eq!(out[1].identity.name, "b");
        assert!(c.is_empty());
    }
}
