//! Projections of the watched kinds as held in the state cache.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{MutableResource, NamespacedResource};

/// Reference to a key inside a Secret in the same namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSpec {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: SecretRef,
    #[serde(default)]
    pub service_key: SecretRef,
    #[serde(default)]
    pub user_name: SecretRef,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationSpec {
    #[serde(default)]
    pub yaml: String,
    #[serde(default)]
    pub suppress_default_server_name: bool,
    #[serde(default)]
    pub suppress_default_application_name: bool,
}

/// Cluster namespace. Identity namespace is always empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceResource {
    pub labels: BTreeMap<String, String>,
    pub terminating: bool,
}

impl NamespacedResource for NamespaceResource {
    const KIND: &'static str = "Namespace";
}

/// Operator-authored connection template projected into eligible namespaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConnectionResource {
    /// Glob patterns (`*`, `?`) selecting target namespaces.
    pub namespace_patterns: Vec<String>,
    pub template: ConnectionSpec,
}

impl NamespacedResource for ClusterConnectionResource {
    const KIND: &'static str = "ClusterConnection";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionResource {
    pub spec: ConnectionSpec,
}

impl NamespacedResource for ConnectionResource {
    const KIND: &'static str = "Connection";
}

impl MutableResource for ConnectionResource {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfigurationResource {
    pub namespace_patterns: Vec<String>,
    pub template: ConfigurationSpec,
}

impl NamespacedResource for ClusterConfigurationResource {
    const KIND: &'static str = "ClusterConfiguration";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationResource {
    pub spec: ConfigurationSpec,
}

impl NamespacedResource for ConfigurationResource {
    const KIND: &'static str = "Configuration";
}

impl MutableResource for ConfigurationResource {}
