use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::flow::{
    error::FlowError,
    executor::FlowExecutor,
    lock::StateLocks,
    manager::FlowManager,
    state::PathAction,
};

#[derive(Debug, Clone, PartialEq)]
pub struct TimerSettings {
    pub interval: Duration,
    /// States fired per pass.
    pub batch_size: usize,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

/// Wakes flows parked on a `delay` node once their time has come.
#[derive(Debug, Clone)]
pub struct DelayTimer {
    flows: Arc<FlowManager>,
    executor: FlowExecutor,
    locks: Arc<StateLocks>,
    settings: TimerSettings,
}

impl DelayTimer {
    pub fn new(
        flows: Arc<FlowManager>,
        executor: FlowExecutor,
        locks: Arc<StateLocks>,
        settings: TimerSettings,
    ) -> Self {
        Self {
            flows,
            executor,
            locks,
            settings,
        }
    }

    pub async fn fire_due(&self) -> Result<usize, FlowError> {
        self.fire_due_at(Utc::now()).await
    }

    /// Continue every state whose `resume_at` is at or before `now`.
    /// Returns how many were moved past their delay node.
    pub async fn fire_due_at(&self, now: DateTime<Utc>) -> Result<usize, FlowError> {
        let due = self
            .executor
            .states()
            .due_delays(now, self.settings.batch_size)
            .await?;
        let mut fired = 0;

        for candidate in due {
            let key = candidate.key();
            let _guard = self.locks.acquire(&key).await;

            let Some(mut state) = self.executor.states().get(&key).await? else {
                continue;
            };
            if state.completed || !state.resume_at.is_some_and(|at| at <= now) {
                continue;
            }
            let Some(flow) = self.flows.resolve(&state.flow_id, state.flow_version) else {
                warn!(flow_id = %state.flow_id, "delayed flow no longer published");
                continue;
            };

            let node_id = state.current_node_id.clone();
            state.resume_at = None;
            state.record(&node_id, PathAction::Completed, None);

            match self.executor.continue_after(&flow, state, &node_id, None).await {
                Ok(report) => {
                    fired += 1;
                    debug!(flow_id = %flow.id(), contact_id = %key.contact_id, outcome = ?report.outcome, "delay elapsed");
                }
                Err(e) if e.is_conflict() => debug!(flow_id = %flow.id(), "delay fired elsewhere"),
                Err(e) => {
                    fired += 1;
                    warn!(flow_id = %flow.id(), contact_id = %key.contact_id, error = %e, "flow stalled after delay");
                }
            }
        }

        if fired > 0 {
            self.locks.prune();
        }
        Ok(fired)
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval_ms = self.settings.interval.as_millis() as u64, "delay timer started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {
                    if let Err(e) = self.fire_due().await {
                        error!(error = %e, "delay pass failed");
                    }
                }
            }
        }
        info!("delay timer stopped");
    }
}
