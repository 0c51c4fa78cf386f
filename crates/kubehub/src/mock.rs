// ----------------- Mock implementation -----------------

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use serde_json::Value as Json;

use crate::{meta_str, ApiKind, ClusterApi, ClusterError};

/// A recorded mutating call.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterCall {
    Save { kind: &'static str, name: String, namespace: String, entity: Json },
    Delete { kind: &'static str, name: String, namespace: String },
    Patch { kind: &'static str, name: String, namespace: String, ops: Vec<Json> },
}

impl ClusterCall {
    pub fn namespace(&self) -> &str {
        match self {
            Self::Save { namespace, .. } | Self::Delete { namespace, .. } | Self::Patch { namespace, .. } => namespace,
        }
    }
}

type ObjKey = (&'static str, String, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjKey, Json>,
    calls: Vec<ClusterCall>,
    failing: Vec<String>,
    next_version: u64,
}

impl Inner {
    fn bump(&mut self, entity: &mut Json) {
        self.next_version += 1;
        if let Some(meta) = entity.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("resourceVersion".into(), Json::String(self.next_version.to_string()));
        }
    }

    fn check(&self, namespace: &str) -> Result<(), ClusterError> {
        if self.failing.iter().any(|n| n == namespace) {
            return Err(ClusterError::Transport(format!("injected failure for namespace {namespace}")));
        }
        Ok(())
    }
}

/// In-memory `ClusterApi` for tests: stores entities, records every mutating
/// call and can inject transport failures per namespace.
#[derive(Default)]
pub struct MockClusterApi {
    inner: Mutex<Inner>,
}

impl MockClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a live entity without recording a call. Returns its assigned version.
    pub fn insert(&self, kind: &ApiKind, mut entity: Json) -> String {
        let name = meta_str(&entity, "name").unwrap_or_default().to_string();
        let ns = meta_str(&entity, "namespace").unwrap_or_default().to_string();
        let mut inner = self.lock();
        inner.bump(&mut entity);
        let rv = inner.next_version.to_string();
        inner.objects.insert((kind.kind, ns, name), entity);
        rv
    }

    pub fn object(&self, kind: &ApiKind, name: &str, namespace: &str) -> Option<Json> {
        self.lock().objects.get(&(kind.kind, namespace.to_string(), name.to_string())).cloned()
    }

    pub fn calls(&self) -> Vec<ClusterCall> {
        self.lock().calls.clone()
    }

    pub fn writes(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Every call touching `namespace` fails with a transport error.
    pub fn fail_namespace(&self, namespace: &str) {
        self.lock().failing.push(namespace.to_string());
    }
}

#[async_trait::async_trait]
impl ClusterApi for MockClusterApi {
    async fn list(&self, kind: &ApiKind, namespace: Option<&str>) -> Result<Vec<Json>, ClusterError> {
        let inner = self.lock();
        Ok(inner
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind.kind && namespace.map_or(true, |n| n == ns))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn get(&self, kind: &ApiKind, name: &str, namespace: &str) -> Result<Option<Json>, ClusterError> {
        let inner = self.lock();
        inner.check(namespace)?;
        Ok(inner.objects.get(&(kind.kind, namespace.to_string(), name.to_string())).cloned())
    }

    async fn save(&self, kind: &ApiKind, mut entity: Json) -> Result<Json, ClusterError> {
        let name = meta_str(&entity, "name")
            .ok_or_else(|| ClusterError::Invalid("entity missing metadata.name".into()))?
            .to_string();
        let namespace = meta_str(&entity, "namespace").unwrap_or_default().to_string();
        let mut inner = self.lock();
        inner.calls.push(ClusterCall::Save {
            kind: kind.kind,
            name: name.clone(),
            namespace: namespace.clone(),
            entity: entity.clone(),
        });
        inner.check(&namespace)?;
        inner.bump(&mut entity);
        inner.objects.insert((kind.kind, namespace, name), entity.clone());
        Ok(entity)
    }

    async fn delete(&self, kind: &ApiKind, name: &str, namespace: &str) -> Result<(), ClusterError> {
        let mut inner = self.lock();
        inner.calls.push(ClusterCall::Delete { kind: kind.kind, name: name.into(), namespace: namespace.into() });
        inner.check(namespace)?;
        match inner.objects.remove(&(kind.kind, namespace.to_string(), name.to_string())) {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound(format!("{}/{}", namespace, name))),
        }
    }

    async fn patch(
        &self,
        kind: &ApiKind,
        name: &str,
        namespace: &str,
        resource_version: Option<&str>,
        ops: &json_patch::Patch,
    ) -> Result<(), ClusterError> {
        let wire: Vec<Json> = ops.0.iter().map(serde_json::to_value).collect::<Result<_, _>>()?;
        let mut inner = self.lock();
        inner.calls.push(ClusterCall::Patch {
            kind: kind.kind,
            name: name.into(),
            namespace: namespace.into(),
            ops: wire,
        });
        inner.check(namespace)?;
        let key = (kind.kind, namespace.to_string(), name.to_string());
        let Some(mut live) = inner.objects.get(&key).cloned() else {
            return Err(ClusterError::NotFound(format!("{}/{}", namespace, name)));
        };
        if let Some(rv) = resource_version {
            if meta_str(&live, "resourceVersion") != Some(rv) {
                return Err(ClusterError::Conflict(format!("{}/{} moved past {}", namespace, name, rv)));
            }
        }
        json_patch::patch(&mut live, &ops.0).map_err(|e| ClusterError::Invalid(e.to_string()))?;
        inner.bump(&mut live);
        inner.objects.insert(key, live);
        Ok(())
    }
}
