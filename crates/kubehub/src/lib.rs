//! Ferry kubehub: the cluster API collaborator and its kube-rs implementation,
//! typed watchers feeding the state container, and the leader lease.

#![forbid(unsafe_code)]

use anyhow::Result;
use serde_json::Value as Json;
use tracing::{debug, info};

use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};

pub mod entities;
pub mod leader;
pub mod mock;
pub mod watch;

pub use leader::{LeaderElectionState, LeaseElector};
pub use mock::{ClusterCall, MockClusterApi};

/// Static description of a served kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApiKind {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
}

impl ApiKind {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(self.group, self.version, self.kind);
        ApiResource::from_gvk_with_plural(&gvk, self.plural)
    }
}

pub const NAMESPACE: ApiKind = ApiKind { group: "", version: "v1", kind: "Namespace", plural: "namespaces" };
pub const CLUSTER_CONNECTION: ApiKind =
    ApiKind { group: "ferry.dev", version: "v1beta1", kind: "ClusterConnection", plural: "clusterconnections" };
pub const CONNECTION: ApiKind = ApiKind { group: "ferry.dev", version: "v1beta1", kind: "Connection", plural: "connections" };
pub const CLUSTER_CONFIGURATION: ApiKind =
    ApiKind { group: "ferry.dev", version: "v1beta1", kind: "ClusterConfiguration", plural: "clusterconfigurations" };
pub const CONFIGURATION: ApiKind =
    ApiKind { group: "ferry.dev", version: "v1beta1", kind: "Configuration", plural: "configurations" };
pub const CONFIG_MAP: ApiKind = ApiKind { group: "", version: "v1", kind: "ConfigMap", plural: "configmaps" };
pub const LEASE: ApiKind = ApiKind { group: "coordination.k8s.io", version: "v1", kind: "Lease", plural: "leases" };

/// One RBAC rule the operator's service account needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RbacRule {
    pub kind: ApiKind,
    pub verbs: &'static [&'static str],
}

const READ: &[&str] = &["get", "list", "watch"];
const READ_WRITE: &[&str] = &["get", "list", "watch", "create", "update", "patch", "delete"];

/// Declarative RBAC table consumed by deployment tooling.
pub const RBAC: &[RbacRule] = &[
    RbacRule { kind: NAMESPACE, verbs: READ },
    RbacRule { kind: CLUSTER_CONNECTION, verbs: READ },
    RbacRule { kind: CONNECTION, verbs: READ_WRITE },
    RbacRule { kind: CLUSTER_CONFIGURATION, verbs: READ },
    RbacRule { kind: CONFIGURATION, verbs: READ_WRITE },
    RbacRule { kind: CONFIG_MAP, verbs: &["get", "create", "update"] },
    RbacRule { kind: LEASE, verbs: &["get", "create", "update"] },
];

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid entity: {0}")]
    Invalid(String),
}

impl ClusterError {
    /// Conflicts and transport failures heal on the next reconciliation pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Transport(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound(resp.message.clone()),
            // 422 is what a failed json-patch `test` op returns.
            kube::Error::Api(resp) if resp.code == 409 || resp.code == 422 => Self::Conflict(resp.message.clone()),
            _ => Self::Transport(e.to_string()),
        }
    }
}

/// Cluster API collaborator. Entities travel as JSON so one object-safe trait
/// serves every kind.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    /// List a kind, optionally within one namespace.
    async fn list(&self, kind: &ApiKind, namespace: Option<&str>) -> Result<Vec<Json>, ClusterError>;

    async fn get(&self, kind: &ApiKind, name: &str, namespace: &str) -> Result<Option<Json>, ClusterError>;

    /// Create-or-update the full entity.
    async fn save(&self, kind: &ApiKind, entity: Json) -> Result<Json, ClusterError>;

    async fn delete(&self, kind: &ApiKind, name: &str, namespace: &str) -> Result<(), ClusterError>;

    /// Apply RFC 6902 operations. When `resource_version` is known the patch
    /// is rejected if the object moved on.
    async fn patch(
        &self,
        kind: &ApiKind,
        name: &str,
        namespace: &str,
        resource_version: Option<&str>,
        ops: &json_patch::Patch,
    ) -> Result<(), ClusterError>;
}

pub async fn get_kube_client() -> Result<Client> {
    Ok(Client::try_default().await?)
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

pub(crate) fn meta_str<'a>(v: &'a Json, field: &str) -> Option<&'a str> {
    v.get("metadata").and_then(|m| m.get(field)).and_then(|s| s.as_str())
}

/// `ClusterApi` backed by a kube-rs client using dynamic objects.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(get_kube_client().await?))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn api(&self, kind: &ApiKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) if !ns.is_empty() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn to_json(obj: &DynamicObject) -> Result<Json, ClusterError> {
        let mut raw = serde_json::to_value(obj)?;
        strip_managed_fields(&mut raw);
        Ok(raw)
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list(&self, kind: &ApiKind, namespace: Option<&str>) -> Result<Vec<Json>, ClusterError> {
        let list = self.api(kind, namespace).list(&ListParams::default()).await?;
        list.items.iter().map(Self::to_json).collect()
    }

    async fn get(&self, kind: &ApiKind, name: &str, namespace: &str) -> Result<Option<Json>, ClusterError> {
        match self.api(kind, Some(namespace)).get_opt(name).await? {
            Some(obj) => Ok(Some(Self::to_json(&obj)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, kind: &ApiKind, entity: Json) -> Result<Json, ClusterError> {
        let name = meta_str(&entity, "name")
            .ok_or_else(|| ClusterError::Invalid("entity missing metadata.name".into()))?
            .to_string();
        let namespace = meta_str(&entity, "namespace").unwrap_or_default().to_string();
        let mut obj: DynamicObject = serde_json::from_value(entity)?;
        let api = self.api(kind, Some(&namespace));
        let saved = match api.get_opt(&name).await? {
            Some(existing) => {
                obj.metadata.resource_version = existing.metadata.resource_version.clone();
                debug!(kind = kind.kind, ns = %namespace, name = %name, "replacing existing entity");
                api.replace(&name, &PostParams::default(), &obj).await?
            }
            None => {
                debug!(kind = kind.kind, ns = %namespace, name = %name, "creating entity");
                api.create(&PostParams::default(), &obj).await?
            }
        };
        Self::to_json(&saved)
    }

    async fn delete(&self, kind: &ApiKind, name: &str, namespace: &str) -> Result<(), ClusterError> {
        self.api(kind, Some(namespace)).delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn patch(
        &self,
        kind: &ApiKind,
        name: &str,
        namespace: &str,
        resource_version: Option<&str>,
        ops: &json_patch::Patch,
    ) -> Result<(), ClusterError> {
        let mut all = Vec::with_capacity(ops.0.len() + 1);
        if let Some(rv) = resource_version {
            all.push(serde_json::from_value(serde_json::json!({
                "op": "test",
                "path": "/metadata/resourceVersion",
                "value": rv,
            }))?);
        }
        all.extend(ops.0.iter().cloned());
        let patch = json_patch::Patch(all);
        self.api(kind, Some(namespace))
            .patch(name, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await?;
        info!(kind = kind.kind, ns = %namespace, name = %name, ops = ops.0.len(), "patched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_handles_core_group() {
        assert_eq!(NAMESPACE.api_version(), "v1");
        assert_eq!(CONNECTION.api_version(), "ferry.dev/v1beta1");
        let ar = CONFIGURATION.api_resource();
        assert_eq!(ar.plural, "configurations");
        assert_eq!(ar.api_version, "ferry.dev/v1beta1");
    }

    #[test]
    fn rbac_grants_writes_only_on_derived_kinds() {
        for rule in RBAC {
            let writes = rule.verbs.contains(&"delete");
            let derived = rule.kind == CONNECTION || rule.kind == CONFIGURATION;
            assert_eq!(writes, derived, "{}", rule.kind.kind);
        }
    }

    #[test]
    fn strip_managed_fields_prunes_metadata() {
        let mut v = serde_json::json!({ "metadata": { "name": "x", "managedFields": [{}] } });
        strip_managed_fields(&mut v);
        assert_eq!(v, serde_json::json!({ "metadata": { "name": "x" } }));
    }

    #[test]
    fn transient_classification() {
        assert!(ClusterError::Conflict("x".into()).is_transient());
        assert!(ClusterError::Transport("x".into()).is_transient());
        assert!(!ClusterError::NotFound("x".into()).is_transient());
    }
}
