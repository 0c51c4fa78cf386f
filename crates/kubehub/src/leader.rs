//! Leader election over a `coordination.k8s.io/v1` Lease.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use metrics::gauge;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared leadership flag read by the reaction gate. Transitions can be
/// observed through [`LeaderElectionState::subscribe`].
#[derive(Debug)]
pub struct LeaderElectionState {
    leader: watch::Sender<bool>,
}

impl Default for LeaderElectionState {
    fn default() -> Self {
        Self::new(false)
    }
}

impl LeaderElectionState {
    pub fn new(leader: bool) -> Self {
        let (tx, _) = watch::channel(leader);
        Self { leader: tx }
    }

    pub fn is_leader(&self) -> bool {
        *self.leader.borrow()
    }

    /// Returns the previous value.
    pub fn set(&self, leader: bool) -> bool {
        self.leader.send_replace(leader)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.leader.subscribe()
    }
}

pub const DEFAULT_LEASE_NAME: &str = "ferry-operator-leader";
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);

/// Whether `me` may take or keep the lease at `now`.
fn may_hold(spec: Option<&LeaseSpec>, me: &str, now: DateTime<Utc>) -> bool {
    let Some(spec) = spec else { return true };
    let holder = spec.holder_identity.as_deref().unwrap_or_default();
    if holder.is_empty() || holder == me {
        return true;
    }
    let duration = i64::from(spec.lease_duration_seconds.unwrap_or(0));
    match &spec.renew_time {
        Some(MicroTime(renewed)) => *renewed + chrono::Duration::seconds(duration) < now,
        None => true,
    }
}

/// Minimal lease loop: acquire when free or expired, renew while held.
pub struct LeaseElector {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
    lease_duration: Duration,
    state: Arc<LeaderElectionState>,
}

impl LeaseElector {
    pub fn new(client: Client, namespace: &str, state: Arc<LeaderElectionState>) -> Self {
        let identity = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| format!("ferry-{}", uuid::Uuid::new_v4()));
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            identity,
            lease_duration: DEFAULT_LEASE_DURATION,
            state,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn desired(&self, existing: Option<&Lease>, now: DateTime<Utc>) -> Lease {
        let prev = existing.and_then(|l| l.spec.as_ref());
        let held = prev.and_then(|s| s.holder_identity.as_deref()) == Some(self.identity.as_str());
        let transitions = prev.and_then(|s| s.lease_transitions).unwrap_or(0);
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                resource_version: existing.and_then(|l| l.metadata.resource_version.clone()),
                ..existing.map(|l| l.metadata.clone()).unwrap_or_default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: if held { prev.and_then(|s| s.acquire_time.clone()) } else { Some(MicroTime(now)) },
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(if held { transitions } else { transitions + 1 }),
                ..Default::default()
            }),
        }
    }

    /// One acquire/renew attempt. Returns whether this replica holds the lease.
    async fn try_acquire(&self) -> Result<bool> {
        let now = Utc::now();
        let pp = PostParams::default();
        match self.api.get_opt(&self.lease_name).await.context("reading lease")? {
            None => {
                self.api.create(&pp, &self.desired(None, now)).await.context("creating lease")?;
                Ok(true)
            }
            Some(lease) if may_hold(lease.spec.as_ref(), &self.identity, now) => {
                self.api
                    .replace(&self.lease_name, &pp, &self.desired(Some(&lease), now))
                    .await
                    .context("renewing lease")?;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    /// Run until cancelled, flipping the shared state on every transition.
    pub async fn run(self, cancel: CancellationToken) {
        let retry = self.lease_duration / 3;
        info!(identity = %self.identity, lease = %self.lease_name, "leader elector started");
        loop {
            let leader = match self.try_acquire().await {
                Ok(v) => v,
                Err(e) => {
                    debug!(error = %e, "lease attempt failed");
                    false
                }
            };
            let was = self.state.set(leader);
            if was != leader {
                if leader {
                    info!(identity = %self.identity, "acquired leadership");
                } else {
                    warn!(identity = %self.identity, "lost leadership");
                }
            }
            gauge!("leader_is_leader", if leader { 1.0 } else { 0.0 });
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(retry) => {}
            }
        }
        self.state.set(false);
        info!(identity = %self.identity, "leader elector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(holder: &str, renewed_secs_ago: i64, duration: i32, now: DateTime<Utc>) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(holder.to_string()),
            lease_duration_seconds: Some(duration),
            renew_time: Some(MicroTime(now - chrono::Duration::seconds(renewed_secs_ago))),
            ..Default::default()
        }
    }

    #[test]
    fn lease_is_takeable_when_free_held_or_expired() {
        let now = Utc::now();
        assert!(may_hold(None, "me", now));
        assert!(may_hold(Some(&LeaseSpec::default()), "me", now));
        assert!(may_hold(Some(&spec("me", 1, 15, now)), "me", now));
        assert!(!may_hold(Some(&spec("other", 1, 15, now)), "me", now));
        assert!(may_hold(Some(&spec("other", 30, 15, now)), "me", now));
    }

    #[test]
    fn state_swap_reports_previous() {
        let s = LeaderElectionState::new(false);
        assert!(!s.set(true));
        assert!(s.is_leader());
        assert!(s.set(false));
    }

    #[tokio::test]
    async fn subscribers_see_leadership_gain() {
        let s = LeaderElectionState::default();
        let mut rx = s.subscribe();
        assert!(!*rx.borrow_and_update());
        s.set(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
    }
}
