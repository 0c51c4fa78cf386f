//! Derived-resource kinds and their capability trait.

use ferry_core::resources::{
    ClusterConfigurationResource, ClusterConnectionResource, ConfigurationResource, ConnectionResource,
};
use ferry_core::{MutableResource, NamespacedResource, ResourceIdentityPair};
use ferry_kubehub::entities::{Configuration, ConfigurationEntitySpec, Connection, ConnectionEntitySpec};
use ferry_kubehub::{ApiKind, CONFIGURATION, CONNECTION};
use serde_json::Value as Json;
use tracing::warn;

use crate::glob::Glob;

/// One derived-resource kind: how to pick its template for a namespace and
/// what the derived resource should look like.
pub trait SyncTarget: Send + Sync + 'static {
    type Base: NamespacedResource;
    type Target: MutableResource;

    const ENTITY_NAME: &'static str;

    fn api_kind() -> ApiKind;

    fn target_name(namespace: &str) -> String;

    /// Must be deterministic for the same candidate set.
    fn select_best_base<'a>(
        bases: &'a [ResourceIdentityPair<Self::Base>],
        namespace: &str,
    ) -> Option<&'a ResourceIdentityPair<Self::Base>>;

    fn compute_desired(base: &ResourceIdentityPair<Self::Base>, name: &str, namespace: &str) -> Option<Self::Target>;

    /// Full entity as sent on create. `None` when the data needed vanished.
    fn build_entity(
        base: &ResourceIdentityPair<Self::Base>,
        desired: &Self::Target,
        name: &str,
        namespace: &str,
    ) -> Option<Json>;
}

/// `(exact, literal characters)` of the best pattern matching `namespace`.
fn pattern_score(patterns: &[String], namespace: &str) -> Option<(bool, usize)> {
    patterns
        .iter()
        .filter_map(|p| match Glob::new(p) {
            Ok(g) => Some(g),
            Err(e) => {
                warn!(pattern = %p, error = %e, "ignoring unusable namespace pattern");
                None
            }
        })
        .filter(|g| g.is_match(namespace))
        .map(|g| (g.is_exact(), g.literal_len()))
        .max()
}

/// Highest pattern score wins; ties go to the smallest `(name, namespace)`.
pub fn best_by_patterns<'a, B: NamespacedResource>(
    bases: &'a [ResourceIdentityPair<B>],
    namespace: &str,
    patterns: impl Fn(&B) -> &[String],
) -> Option<&'a ResourceIdentityPair<B>> {
    bases
        .iter()
        .filter_map(|b| pattern_score(patterns(&b.resource), namespace).map(|s| (s, b)))
        .max_by(|(sa, a), (sb, b)| {
            sa.cmp(sb)
                .then_with(|| b.identity.name.cmp(&a.identity.name))
                .then_with(|| b.identity.namespace.cmp(&a.identity.namespace))
        })
        .map(|(_, b)| b)
}

fn to_entity<E: serde::Serialize>(entity: &E, name: &str, namespace: &str) -> Option<Json> {
    match serde_json::to_value(entity) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(ns = %namespace, name = %name, error = %e, "could not serialize target entity");
            None
        }
    }
}

pub struct ConnectionSync;

impl SyncTarget for ConnectionSync {
    type Base = ClusterConnectionResource;
    type Target = ConnectionResource;

    const ENTITY_NAME: &'static str = "Connection";

    fn api_kind() -> ApiKind {
        CONNECTION
    }

    fn target_name(_namespace: &str) -> String {
        "default-connection".to_string()
    }

    fn select_best_base<'a>(
        bases: &'a [ResourceIdentityPair<ClusterConnectionResource>],
        namespace: &str,
    ) -> Option<&'a ResourceIdentityPair<ClusterConnectionResource>> {
        best_by_patterns(bases, namespace, |b| b.namespace_patterns.as_slice())
    }

    fn compute_desired(
        base: &ResourceIdentityPair<ClusterConnectionResource>,
        _name: &str,
        _namespace: &str,
    ) -> Option<ConnectionResource> {
        Some(ConnectionResource { spec: base.resource.template.clone() })
    }

    fn build_entity(
        _base: &ResourceIdentityPair<ClusterConnectionResource>,
        desired: &ConnectionResource,
        name: &str,
        namespace: &str,
    ) -> Option<Json> {
        let mut entity = Connection::new(name, ConnectionEntitySpec { inner: desired.spec.clone() });
        entity.metadata.namespace = Some(namespace.to_string());
        to_entity(&entity, name, namespace)
    }
}

pub struct ConfigurationSync;

impl SyncTarget for ConfigurationSync {
    type Base = ClusterConfigurationResource;
    type Target = ConfigurationResource;

    const ENTITY_NAME: &'static str = "Configuration";

    fn api_kind() -> ApiKind {
        CONFIGURATION
    }

    fn target_name(_namespace: &str) -> String {
        "default-configuration".to_string()
    }

    fn select_best_base<'a>(
        bases: &'a [ResourceIdentityPair<ClusterConfigurationResource>],
        namespace: &str,
    ) -> Option<&'a ResourceIdentityPair<ClusterConfigurationResource>> {
        best_by_patterns(bases, namespace, |b| b.namespace_patterns.as_slice())
    }

    fn compute_desired(
        base: &ResourceIdentityPair<ClusterConfigurationResource>,
        _name: &str,
        _namespace: &str,
    ) -> Option<ConfigurationResource> {
        Some(ConfigurationResource { spec: base.resource.template.clone() })
    }

    fn build_entity(
        _base: &ResourceIdentityPair<ClusterConfigurationResource>,
        desired: &ConfigurationResource,
        name: &str,
        namespace: &str,
    ) -> Option<Json> {
        let mut entity = Configuration::new(name, ConfigurationEntitySpec { inner: desired.spec.clone() });
        entity.metadata.namespace = Some(namespace.to_string());
        to_entity(&entity, name, namespace)
    }
}
