//! Ferry reconcile: the reaction gate, namespace policy, derived-resource kinds
//! and the generic syncing handler that drives them.
//!
//! Each pass re-reads the state container from scratch. A target whose
//! identity is dirty is skipped: a write for it is in flight and the cache
//! does not reflect it yet.

#![forbid(unsafe_code)]

pub mod cluster_id;
pub mod gate;
pub mod glob;
pub mod handler;
pub mod namespaces;
pub mod registry;
pub mod targets;

pub use ferry_kubehub::LeaderElectionState;
pub use cluster_id::{ensure_cluster_id, ClusterId, ClusterIdState};
pub use gate::{ReactionGate, ReactionHelper};
pub use handler::{HandlerContext, PassReport, SyncingHandler};
pub use namespaces::{ClusterDefaults, NamespaceClassifier};
pub use registry::{KindRegistration, KINDS};
pub use targets::{ConfigurationSync, ConnectionSync, SyncTarget};
