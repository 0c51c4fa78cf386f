#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ferry_apply::comparer_for;
use ferry_core::config::ComparerKind;
use ferry_core::resources::{ClusterConnectionResource, ConnectionResource, ConnectionSpec, NamespaceResource, SecretRef};
use ferry_kubehub::{LeaderElectionState, MockClusterApi, CONNECTION};
use ferry_reconcile::{ClusterDefaults, ClusterIdState, HandlerContext, ReactionHelper};
use ferry_store::StateContainer;
use serde_json::{json, Value as Json};

pub const OPERATOR_NS: &str = "ferry-system";
pub const TARGET: &str = "default-connection";
pub const CLUSTER_ID: &str = "ferry-cluster-id";

pub struct Fixture {
    pub state: Arc<StateContainer>,
    pub mock: Arc<MockClusterApi>,
    pub leader: Arc<LeaderElectionState>,
    pub ctx: HandlerContext,
}

pub fn template_spec() -> ConnectionSpec {
    let secret = |key: &str| SecretRef { name: "collector-creds".into(), key: key.into() };
    ConnectionSpec {
        url: "https://collector.example".into(),
        api_key: secret("api-key"),
        service_key: secret("service-key"),
        user_name: secret("user-name"),
    }
}

pub fn managed_annotations() -> Json {
    json!({
        "ferry.dev/managed-by": "ferry-operator",
        "ferry.dev/template-name": "shared",
        "ferry.dev/template-namespace": OPERATOR_NS,
    })
}

pub fn live_connection(ns: &str, spec: &ConnectionSpec) -> Json {
    json!({
        "apiVersion": "ferry.dev/v1beta1",
        "kind": "Connection",
        "metadata": { "name": TARGET, "namespace": ns, "annotations": managed_annotations() },
        "spec": serde_json::to_value(spec).unwrap(),
    })
}

/// ns1..ns4 with one template matching ns1..ns3, ns3 excluded, ns2 holding a
/// diverging target and ns3 a stale one.
pub fn decision_table_fixture(comparer: ComparerKind) -> Fixture {
    let state = Arc::new(StateContainer::new());
    let mock = Arc::new(MockClusterApi::new());
    let leader = Arc::new(LeaderElectionState::new(true));

    for ns in ["ns1", "ns2", "ns3", "ns4"] {
        state.upsert(ns, "", NamespaceResource::default(), None);
    }
    state.upsert(
        "shared",
        OPERATOR_NS,
        ClusterConnectionResource {
            namespace_patterns: vec!["ns1".into(), "ns2".into(), "ns3".into()],
            template: template_spec(),
        },
        Some("1".into()),
    );
    // A template outside the operator namespace must be ignored.
    state.upsert(
        "foreign",
        "tenant",
        ClusterConnectionResource { namespace_patterns: vec!["ns4".into()], template: template_spec() },
        Some("1".into()),
    );

    let stale = ConnectionSpec { url: "https://old.example".into(), ..template_spec() };
    state.upsert(TARGET, "ns2", ConnectionResource { spec: stale.clone() }, Some("5".into()));
    mock.insert(&CONNECTION, live_connection("ns2", &stale));

    state.upsert(TARGET, "ns3", ConnectionResource { spec: template_spec() }, Some("6".into()));
    mock.insert(&CONNECTION, live_connection("ns3", &template_spec()));

    let ctx = HandlerContext {
        state: Arc::clone(&state),
        classifier: Arc::new(ClusterDefaults::new(Arc::clone(&state), vec!["ns3".into()])),
        comparer: comparer_for(comparer),
        client: mock.clone(),
        gate: Arc::new(ReactionHelper::new(Arc::clone(&leader), Duration::ZERO)),
        operator_namespace: OPERATOR_NS.into(),
        cluster_id: Arc::new(ClusterIdState::new(CLUSTER_ID)),
    };
    Fixture { state, mock, leader, ctx }
}

/// Feed what the watch would observe after the writes land.
pub fn confirm_writes(f: &Fixture) {
    for ns in ["ns1", "ns2"] {
        f.state.upsert(TARGET, ns, ConnectionResource { spec: template_spec() }, Some("10".into()));
    }
    f.state.remove::<ConnectionResource>(TARGET, "ns3");
}
