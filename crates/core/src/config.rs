//! Environment-sourced operator settings.
//!
//! Everything is optional with defaults except the default image registry,
//! whose absence is a startup-fatal misconfiguration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no default registry was set (FERRY_DEFAULT_REGISTRY)")]
    MissingRegistry,
}

/// Behaviour of the event queue when it is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueFullMode {
    /// Publishers wait for a free slot.
    Wait,
    /// The oldest queued event is discarded to admit the newest.
    DropOldest,
}

impl QueueFullMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wait" => Some(Self::Wait),
            "drop-oldest" | "dropoldest" | "drop_oldest" => Some(Self::DropOldest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparerKind {
    Fast,
    Slow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorOptions {
    pub namespace: String,
    pub settle_duration: Duration,
    pub event_queue_size: usize,
    pub event_queue_full_mode: QueueFullMode,
    pub event_queue_merge_window: Duration,
    pub comparer: ComparerKind,
    pub excluded_namespaces: Vec<String>,
    pub leader_election: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRepositoryOptions {
    pub default_registry: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsCertificateOptions {
    pub subject_name: String,
    pub dns_names: Vec<String>,
    pub expires_after: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsStorageOptions {
    pub secret_name: String,
    pub secret_namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutatingWebHookOptions {
    pub configuration_name: String,
}

/// Where the cluster identity record lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryOptions {
    pub cluster_id_name: String,
    pub cluster_id_namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InjectorOptions {
    pub enable_early_chaining: bool,
}

/// All settings the composition root needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub operator: OperatorOptions,
    pub images: ImageRepositoryOptions,
    pub tls_certificate: TlsCertificateOptions,
    pub tls_storage: TlsStorageOptions,
    pub webhook: MutatingWebHookOptions,
    pub telemetry: TelemetryOptions,
    pub injector: InjectorOptions,
}

pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 10 * 1024;
pub const DEFAULT_MERGE_WINDOW_SECS: u64 = 10;
pub const DEFAULT_SETTLE_SECS: u64 = 10;
pub const DEFAULT_CLUSTER_ID_NAME: &str = "ferry-cluster-id";
pub const DEFAULT_EXCLUDED_NAMESPACES: &[&str] = &["kube-system", "kube-public", "kube-node-lease"];

fn is_truthy(v: &str) -> bool {
    let v = v.trim();
    v == "1" || v.eq_ignore_ascii_case("true")
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parse settings from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let namespace = get("POD_NAMESPACE")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "default".to_string());

        let settle_secs = get("FERRY_SETTLE_DURATION")
            .and_then(|s| s.trim().parse::<i64>().ok())
            .filter(|v| *v > -1)
            .map(|v| v as u64)
            .unwrap_or(DEFAULT_SETTLE_SECS);

        let event_queue_size = get("FERRY_EVENT_QUEUE_SIZE")
            .and_then(|s| s.trim().parse::<i64>().ok())
            .filter(|v| *v > -1)
            .map(|v| (v as usize).max(1))
            .unwrap_or(DEFAULT_EVENT_QUEUE_SIZE);

        let event_queue_full_mode = get("FERRY_EVENT_QUEUE_FULL_MODE")
            .and_then(|s| QueueFullMode::parse(&s))
            .unwrap_or(QueueFullMode::Wait);

        let merge_secs = get("FERRY_EVENT_QUEUE_MERGE_WINDOW_SECONDS")
            .and_then(|s| s.trim().parse::<i64>().ok())
            .map(|v| v.max(0) as u64)
            .unwrap_or(DEFAULT_MERGE_WINDOW_SECS);

        let comparer = match get("FERRY_USE_SLOW_COMPARER") {
            Some(v) if is_truthy(&v) => ComparerKind::Slow,
            _ => ComparerKind::Fast,
        };

        let excluded_namespaces = get("FERRY_EXCLUDED_NAMESPACES")
            .map(|v| split_list(&v))
            .unwrap_or_else(|| DEFAULT_EXCLUDED_NAMESPACES.iter().map(|s| s.to_string()).collect());

        let leader_election = get("FERRY_LEADER_ELECTION")
            .map(|v| !(v.trim() == "0" || v.trim().eq_ignore_ascii_case("false")))
            .unwrap_or(true);

        let default_registry = get("FERRY_DEFAULT_REGISTRY")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingRegistry)?;

        let mut dns_names = vec!["localhost".to_string()];
        if let Some(hosts) = get("FERRY_WEBHOOK_HOSTS") {
            dns_names.extend(split_list(&hosts));
        }

        let secret_name = get("FERRY_WEBHOOK_SECRET")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| "ferry-web-hook-secret".to_string());
        let configuration_name = get("FERRY_WEBHOOK_CONFIGURATION")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| "ferry-web-hook-configuration".to_string());

        let enable_early_chaining = get("FERRY_ENABLE_EARLY_CHAINING").map(|v| is_truthy(&v)).unwrap_or(false);

        Ok(Self {
            telemetry: TelemetryOptions {
                cluster_id_name: DEFAULT_CLUSTER_ID_NAME.to_string(),
                cluster_id_namespace: namespace.clone(),
            },
            injector: InjectorOptions { enable_early_chaining },
            tls_storage: TlsStorageOptions { secret_name, secret_namespace: namespace.clone() },
            operator: OperatorOptions {
                namespace,
                settle_duration: Duration::from_secs(settle_secs),
                event_queue_size,
                event_queue_full_mode,
                event_queue_merge_window: Duration::from_secs(merge_secs),
                comparer,
                excluded_namespaces,
                leader_election,
            },
            images: ImageRepositoryOptions { default_registry },
            tls_certificate: TlsCertificateOptions {
                subject_name: "ferry-web-hook".to_string(),
                dns_names,
                expires_after: Duration::from_secs(60 * 60 * 24 * 365 * 100),
            },
            webhook: MutatingWebHookOptions { configuration_name },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parse(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Settings::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_only_registry_is_set() {
        let s = parse(&[("FERRY_DEFAULT_REGISTRY", "registry.example.com")]).unwrap();
        assert_eq!(s.operator.namespace, "default");
        assert_eq!(s.operator.event_queue_size, 10240);
        assert_eq!(s.operator.event_queue_full_mode, QueueFullMode::Wait);
        assert_eq!(s.operator.event_queue_merge_window, Duration::from_secs(10));
        assert_eq!(s.operator.settle_duration, Duration::from_secs(10));
        assert_eq!(s.operator.comparer, ComparerKind::Fast);
        assert!(s.operator.leader_election);
        assert_eq!(s.operator.excluded_namespaces, vec!["kube-system", "kube-public", "kube-node-lease"]);
        assert_eq!(s.tls_certificate.dns_names, vec!["localhost"]);
        assert_eq!(s.tls_storage.secret_namespace, "default");
        assert_eq!(s.telemetry.cluster_id_name, "ferry-cluster-id");
        assert_eq!(s.telemetry.cluster_id_namespace, "default");
        assert!(!s.injector.enable_early_chaining);
    }

    #[test]
    fn missing_registry_is_fatal() {
        let err = parse(&[("POD_NAMESPACE", "ferry")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRegistry));
        assert!(parse(&[("FERRY_DEFAULT_REGISTRY", "  ")]).is_err());
    }

    #[test]
    fn overrides_are_parsed_and_bad_values_ignored() {
        let s = parse(&[
            ("FERRY_DEFAULT_REGISTRY", "r"),
            ("POD_NAMESPACE", " ferry-system "),
            ("FERRY_SETTLE_DURATION", "-5"),
            ("FERRY_EVENT_QUEUE_SIZE", "64"),
            ("FERRY_EVENT_QUEUE_FULL_MODE", "DropOldest"),
            ("FERRY_EVENT_QUEUE_MERGE_WINDOW_SECONDS", "0"),
            ("FERRY_USE_SLOW_COMPARER", "TRUE"),
            ("FERRY_WEBHOOK_HOSTS", "hook,hook.ferry-system.svc,"),
            ("FERRY_LEADER_ELECTION", "false"),
        ])
        .unwrap();
        assert_eq!(s.operator.namespace, "ferry-system");
        assert_eq!(s.operator.settle_duration, Duration::from_secs(10));
        assert_eq!(s.operator.event_queue_size, 64);
        assert_eq!(s.operator.event_queue_full_mode, QueueFullMode::DropOldest);
        assert_eq!(s.operator.event_queue_merge_window, Duration::ZERO);
        assert_eq!(s.operator.comparer, ComparerKind::Slow);
        assert!(!s.operator.leader_election);
        assert_eq!(s.tls_certificate.dns_names, vec!["localhost", "hook", "hook.ferry-system.svc"]);
        assert_eq!(s.tls_storage.secret_namespace, "ferry-system");
        assert_eq!(s.telemetry.cluster_id_namespace, "ferry-system");
    }

    #[test]
    fn early_chaining_accepts_one_or_true_only() {
        for (raw, want) in [("1", true), ("True", true), ("yes", false), ("0", false)] {
            let s = parse(&[("FERRY_DEFAULT_REGISTRY", "r"), ("FERRY_ENABLE_EARLY_CHAINING", raw)]).unwrap();
            assert_eq!(s.injector.enable_early_chaining, want, "{raw}");
        }
    }

    #[test]
    fn unknown_full_mode_falls_back_to_wait() {
        assert_eq!(QueueFullMode::parse("sometimes"), None);
        let s = parse(&[("FERRY_DEFAULT_REGISTRY", "r"), ("FERRY_EVENT_QUEUE_FULL_MODE", "sometimes")]).unwrap();
        assert_eq!(s.operator.event_queue_full_mode, QueueFullMode::Wait);
    }
}
