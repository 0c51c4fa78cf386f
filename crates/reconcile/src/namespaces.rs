//! Namespace eligibility policy and ownership annotations.

use std::collections::BTreeMap;
use std::sync::Arc;

use ferry_core::resources::NamespaceResource;
use ferry_store::StateContainer;

pub const MANAGED_BY_ANNOTATION: &str = "ferry.dev/managed-by";
pub const MANAGED_BY_VALUE: &str = "ferry-operator";
pub const TEMPLATE_NAME_ANNOTATION: &str = "ferry.dev/template-name";
pub const TEMPLATE_NAMESPACE_ANNOTATION: &str = "ferry.dev/template-namespace";

pub trait NamespaceClassifier: Send + Sync {
    fn all_namespaces(&self) -> Vec<String>;

    /// Namespaces eligible to receive derived resources.
    fn valid_namespaces_for_defaults(&self) -> Vec<String>;

    fn is_valid_for_defaults(&self, namespace: &str) -> bool {
        self.valid_namespaces_for_defaults().iter().any(|n| n.eq_ignore_ascii_case(namespace))
    }

    fn annotations_for_managed(&self, template_name: &str, template_namespace: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (MANAGED_BY_ANNOTATION.to_string(), MANAGED_BY_VALUE.to_string()),
            (TEMPLATE_NAME_ANNOTATION.to_string(), template_name.to_string()),
            (TEMPLATE_NAMESPACE_ANNOTATION.to_string(), template_namespace.to_string()),
        ])
    }
}

/// Classifier over the cached namespaces: all of them minus configured
/// exclusions and terminating ones.
pub struct ClusterDefaults {
    state: Arc<StateContainer>,
    excluded: Vec<String>,
}

impl ClusterDefaults {
    pub fn new(state: Arc<StateContainer>, excluded: Vec<String>) -> Self {
        Self { state, excluded }
    }

    fn is_excluded(&self, namespace: &str) -> bool {
        self.excluded.iter().any(|e| e.eq_ignore_ascii_case(namespace))
    }
}

impl NamespaceClassifier for ClusterDefaults {
    fn all_namespaces(&self) -> Vec<String> {
        self.state
            .get_by_type::<NamespaceResource>()
            .into_iter()
            .map(|p| p.identity.name)
            .collect()
    }

    fn valid_namespaces_for_defaults(&self) -> Vec<String> {
        self.state
            .get_by_type::<NamespaceResource>()
            .into_iter()
            .filter(|p| !p.resource.terminating && !self.is_excluded(&p.identity.name))
            .map(|p| p.identity.name)
            .collect()
    }
}
