//! Ferry core types: resource identities, capability traits and state deltas.

#![forbid(unsafe_code)]

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

pub mod config;
pub mod resources;

/// Stable cache key `(kind, name, namespace)`. Cluster-scoped kinds use an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceIdentity {
    pub kind: &'static str,
    pub name: String,
    pub namespace: String,
}

impl ResourceIdentity {
    pub fn new(kind: &'static str, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { kind, name: name.into(), namespace: namespace.into() }
    }

    pub fn of<T: NamespacedResource>(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::new(T::KIND, name, namespace)
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {}", self.kind, self.name)
        } else {
            write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Any resource addressable by identity and held in the state cache.
///
/// Implementors are projections: they carry only what reconciliation compares,
/// never server-managed metadata.
pub trait NamespacedResource: Any + Clone + fmt::Debug + PartialEq + Serialize + Send + Sync + 'static {
    const KIND: &'static str;
}

/// A derived resource the controller owns and may create, update or delete.
pub trait MutableResource: NamespacedResource {}

/// Type-erased cached payload.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// `(identity, value)` pair returned by bulk state queries.
#[derive(Debug)]
pub struct ResourceIdentityPair<T> {
    pub identity: ResourceIdentity,
    pub resource: Arc<T>,
}

impl<T> Clone for ResourceIdentityPair<T> {
    fn clone(&self) -> Self {
        Self { identity: self.identity.clone(), resource: Arc::clone(&self.resource) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// A single watch observation destined for the state cache.
#[derive(Clone)]
pub struct StateDelta {
    pub identity: ResourceIdentity,
    pub kind: DeltaKind,
    /// Present for `Applied`, absent for `Deleted`.
    pub payload: Option<Payload>,
    pub resource_version: Option<String>,
}

impl StateDelta {
    pub fn applied<T: NamespacedResource>(
        name: impl Into<String>,
        namespace: impl Into<String>,
        resource: T,
        resource_version: Option<String>,
    ) -> Self {
        Self {
            identity: ResourceIdentity::of::<T>(name, namespace),
            kind: DeltaKind::Applied,
            payload: Some(Arc::new(resource)),
            resource_version,
        }
    }

    pub fn deleted<T: NamespacedResource>(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            identity: ResourceIdentity::of::<T>(name, namespace),
            kind: DeltaKind::Deleted,
            payload: None,
            resource_version: None,
        }
    }
}

impl fmt::Debug for StateDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateDelta")
            .field("identity", &self.identity)
            .field("kind", &self.kind)
            .field("has_payload", &self.payload.is_some())
            .field("resource_version", &self.resource_version)
            .finish()
    }
}

pub mod prelude {
    pub use super::resources::*;
    pub use super::{
        DeltaKind, MutableResource, NamespacedResource, Payload, ResourceIdentity, ResourceIdentityPair,
        StateDelta,
    };
}

#[cfg(test)]
mod tests {
    use super::resources::NamespaceResource;
    use super::*;

    #[test]
    fn identity_display_omits_empty_namespace() {
        let ns = ResourceIdentity::of::<NamespaceResource>("team-a", "");
        assert_eq!(ns.to_string(), "Namespace team-a");
        let cm = ResourceIdentity::new("Connection", "default-connection", "team-a");
        assert_eq!(cm.to_string(), "Connection team-a/default-connection");
    }

    #[test]
    fn applied_delta_carries_downcastable_payload() {
        let d = StateDelta::applied("team-a", "", NamespaceResource::default(), Some("7".into()));
        assert_eq!(d.kind, DeltaKind::Applied);
        assert_eq!(d.identity.kind, "Namespace");
        let payload = d.payload.expect("payload");
        assert!(payload.downcast::<NamespaceResource>().is_ok());
    }
}
