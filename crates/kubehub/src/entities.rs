//! Custom resource entity types served under `ferry.dev/v1beta1`, and their
//! projections into cache records.

use ferry_core::resources::{
    ClusterConfigurationResource, ClusterConnectionResource, ConfigurationResource, ConfigurationSpec,
    ConnectionResource, ConnectionSpec, NamespaceResource,
};
use ferry_core::NamespacedResource;
use k8s_openapi::api::core::v1::Namespace;
use kube::CustomResource;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{ApiKind, CLUSTER_CONFIGURATION, CLUSTER_CONNECTION, CONFIGURATION, CONNECTION, NAMESPACE};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(group = "ferry.dev", version = "v1beta1", kind = "ClusterConnection", namespaced, schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct ClusterConnectionEntitySpec {
    #[serde(default)]
    pub namespace_patterns: Vec<String>,
    #[serde(flatten)]
    pub template: ConnectionSpec,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(group = "ferry.dev", version = "v1beta1", kind = "Connection", namespaced, schema = "disabled")]
pub struct ConnectionEntitySpec {
    #[serde(flatten)]
    pub inner: ConnectionSpec,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(group = "ferry.dev", version = "v1beta1", kind = "ClusterConfiguration", namespaced, schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfigurationEntitySpec {
    #[serde(default)]
    pub namespace_patterns: Vec<String>,
    #[serde(flatten)]
    pub template: ConfigurationSpec,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(group = "ferry.dev", version = "v1beta1", kind = "Configuration", namespaced, schema = "disabled")]
pub struct ConfigurationEntitySpec {
    #[serde(flatten)]
    pub inner: ConfigurationSpec,
}

/// A watched kube entity that maps onto a cache record.
///
/// Projections are pure and drop every server-managed field.
pub trait Projection:
    kube::Resource<DynamicType = ()> + Clone + std::fmt::Debug + DeserializeOwned + Send + Sync + 'static
{
    type Output: NamespacedResource;
    const API: ApiKind;

    fn project(&self) -> Self::Output;
}

impl Projection for Namespace {
    type Output = NamespaceResource;
    const API: ApiKind = NAMESPACE;

    fn project(&self) -> NamespaceResource {
        let phase_terminating = self
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(|p| p.eq_ignore_ascii_case("Terminating"))
            .unwrap_or(false);
        NamespaceResource {
            labels: self.metadata.labels.clone().unwrap_or_default(),
            terminating: phase_terminating || self.metadata.deletion_timestamp.is_some(),
        }
    }
}

impl Projection for ClusterConnection {
    type Output = ClusterConnectionResource;
    const API: ApiKind = CLUSTER_CONNECTION;

    fn project(&self) -> ClusterConnectionResource {
        ClusterConnectionResource {
            namespace_patterns: self.spec.namespace_patterns.clone(),
            template: self.spec.template.clone(),
        }
    }
}

impl Projection for Connection {
    type Output = ConnectionResource;
    const API: ApiKind = CONNECTION;

    fn project(&self) -> ConnectionResource {
        ConnectionResource { spec: self.spec.inner.clone() }
    }
}

impl Projection for ClusterConfiguration {
    type Output = ClusterConfigurationResource;
    const API: ApiKind = CLUSTER_CONFIGURATION;

    fn project(&self) -> ClusterConfigurationResource {
        ClusterConfigurationResource {
            namespace_patterns: self.spec.namespace_patterns.clone(),
            template: self.spec.template.clone(),
        }
    }
}

impl Projection for Configuration {
    type Output = ConfigurationResource;
    const API: ApiKind = CONFIGURATION;

    fn project(&self) -> ConfigurationResource {
        ConfigurationResource { spec: self.spec.inner.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NamespaceStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn namespace_projection_reads_labels_and_phase() {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some("team-a".into()),
                labels: Some([("tier".to_string(), "gold".to_string())].into_iter().collect()),
                resource_version: Some("99".into()),
                ..Default::default()
            },
            status: Some(NamespaceStatus { phase: Some("Terminating".into()), ..Default::default() }),
            ..Default::default()
        };
        let p = ns.project();
        assert!(p.terminating);
        assert_eq!(p.labels.get("tier").map(String::as_str), Some("gold"));
    }

    #[test]
    fn connection_entity_spec_is_flat_on_the_wire() {
        let raw = serde_json::json!({
            "apiVersion": "ferry.dev/v1beta1",
            "kind": "ClusterConnection",
            "metadata": { "name": "shared", "namespace": "ferry-system" },
            "spec": {
                "namespacePatterns": ["team-*"],
                "url": "https://collector",
                "apiKey": { "name": "creds", "key": "api" },
                "serviceKey": { "name": "creds", "key": "svc" },
                "userName": { "name": "creds", "key": "user" }
            }
        });
        let cc: ClusterConnection = serde_json::from_value(raw).unwrap();
        let p = cc.project();
        assert_eq!(p.namespace_patterns, vec!["team-*".to_string()]);
        assert_eq!(p.template.url, "https://collector");
        assert_eq!(p.template.service_key.key, "svc");
    }

    #[test]
    fn configuration_defaults_missing_flags() {
        let raw = serde_json::json!({
            "apiVersion": "ferry.dev/v1beta1",
            "kind": "Configuration",
            "metadata": { "name": "default-configuration", "namespace": "team-a" },
            "spec": { "yaml": "level: 1" }
        });
        let c: Configuration = serde_json::from_value(raw).unwrap();
        let p = c.project();
        assert_eq!(p.spec.yaml, "level: 1");
        assert!(!p.spec.suppress_default_server_name);
    }

    #[test]
    fn partial_connection_still_deserializes() {
        let raw = serde_json::json!({
            "apiVersion": "ferry.dev/v1beta1",
            "kind": "ClusterConnection",
            "metadata": { "name": "half-done", "namespace": "ferry-system" },
            "spec": {
                "namespacePatterns": ["*"],
                "url": "https://collector",
                "apiKey": { "name": "creds" }
            }
        });
        let cc: ClusterConnection = serde_json::from_value(raw).unwrap();
        let p = cc.project();
        assert_eq!(p.template.api_key.name, "creds");
        assert!(p.template.api_key.key.is_empty());
        assert_eq!(p.template.service_key, Default::default());
    }
}
