use std::sync::Arc;
use std::time::Duration;

use ferry_events::{EventStream, StateChange};
use ferry_kubehub::LeaderElectionState;
use ferry_store::StateContainer;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Checked at the start of every reconciliation pass.
pub trait ReactionGate: Send + Sync {
    fn can_react(&self) -> bool;
}

/// Leader and past the startup settle period.
pub struct ReactionHelper {
    leader: Arc<LeaderElectionState>,
    started: Instant,
    settle: Duration,
}

impl ReactionHelper {
    pub fn new(leader: Arc<LeaderElectionState>, settle: Duration) -> Self {
        Self { leader, started: Instant::now(), settle }
    }

    pub fn settled(&self) -> bool {
        self.started.elapsed() >= self.settle
    }

    /// Publish a state change every time the gate opens: once when the
    /// settle period ends, then on each leadership gain. Signals that arrived
    /// while the gate was closed were discarded by the handlers.
    pub fn spawn_wakeups(
        self: &Arc<Self>,
        state: Arc<StateContainer>,
        events: Arc<EventStream>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let mut leadership = gate.leader.subscribe();
            let remaining = gate.settle.saturating_sub(gate.started.elapsed());
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(remaining) => {}
            }
            leadership.borrow_and_update();
            if gate.can_react() {
                info!(epoch = state.epoch(), "settle period over; requesting a pass");
                events.publish(StateChange { epoch: state.epoch(), changed: 0 }).await;
            } else {
                debug!("settle period over; not leader");
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = leadership.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *leadership.borrow_and_update() {
                            info!(epoch = state.epoch(), "leadership gained; requesting a pass");
                            events.publish(StateChange { epoch: state.epoch(), changed: 0 }).await;
                        }
                    }
                }
            }
        })
    }
}

impl ReactionGate for ReactionHelper {
    fn can_react(&self) -> bool {
        self.leader.is_leader() && self.settled()
    }
}
