//! Minimal-diff patching: mutate a copy, diff it against the original and send
//! only the changed operations.

use std::sync::Arc;

use ferry_kubehub::{ApiKind, ClusterApi, ClusterError};
use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as Json;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum PatchOutcome {
    Unchanged,
    Patched { ops: json_patch::Patch },
}

impl PatchOutcome {
    pub fn is_patched(&self) -> bool {
        matches!(self, Self::Patched { .. })
    }
}

fn meta<'a>(v: &'a Json, field: &str) -> Option<&'a str> {
    v.get("metadata").and_then(|m| m.get(field)).and_then(|s| s.as_str())
}

#[derive(Clone)]
pub struct ResourcePatcher {
    client: Arc<dyn ClusterApi>,
}

impl ResourcePatcher {
    pub fn new(client: Arc<dyn ClusterApi>) -> Self {
        Self { client }
    }

    /// Apply `mutator` to a copy of `entity` and patch the difference. A no-op
    /// mutation issues no call.
    pub async fn patch<F>(&self, kind: &ApiKind, entity: &Json, mutator: F) -> Result<PatchOutcome, ClusterError>
    where
        F: FnOnce(&mut Json) + Send,
    {
        let mut mutated = entity.clone();
        mutator(&mut mutated);
        self.send_diff(kind, entity, &mutated).await
    }

    pub async fn patch_typed<E, F>(&self, kind: &ApiKind, entity: &E, mutator: F) -> Result<PatchOutcome, ClusterError>
    where
        E: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce(&mut E) + Send,
    {
        let original = serde_json::to_value(entity)?;
        let mut copy: E = serde_json::from_value(original.clone())?;
        mutator(&mut copy);
        let mutated = serde_json::to_value(&copy)?;
        self.send_diff(kind, &original, &mutated).await
    }

    async fn send_diff(&self, kind: &ApiKind, original: &Json, mutated: &Json) -> Result<PatchOutcome, ClusterError> {
        let ops = json_patch::diff(original, mutated);
        let name = meta(original, "name").ok_or_else(|| ClusterError::Invalid("entity missing metadata.name".into()))?;
        let namespace = meta(original, "namespace").unwrap_or_default();
        if ops.0.is_empty() {
            counter!("patch_skipped_total", 1u64);
            debug!(kind = kind.kind, ns = %namespace, name = %name, "mutation is a no-op; no patch sent");
            return Ok(PatchOutcome::Unchanged);
        }
        let rv = meta(original, "resourceVersion");
        self.client.patch(kind, name, namespace, rv, &ops).await?;
        counter!("patch_sent_total", 1u64);
        Ok(PatchOutcome::Patched { ops })
    }
}
