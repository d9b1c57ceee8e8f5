use std::{collections::HashMap, sync::Arc};

use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::{
    flow::{
        LAST_USER_MESSAGE,
        error::{FlowError, GraphError},
        executor::{AdvanceReport, FlowExecutor},
        lock::StateLocks,
        manager::FlowManager,
        state::{PathAction, StateKey, TurnRole},
    },
    node::NodeKind,
};

/// Result of resuming one suspended flow.
#[derive(Debug, Clone)]
pub struct Resumed {
    pub flow_id: String,
    pub result: Result<AdvanceReport, FlowError>,
}

/// Feeds a contact's reply into every flow of theirs that is waiting on
/// a `userInput` node.
#[derive(Debug, Clone)]
pub struct ResumptionTrigger {
    flows: Arc<FlowManager>,
    executor: FlowExecutor,
    locks: Arc<StateLocks>,
}

impl ResumptionTrigger {
    pub fn new(flows: Arc<FlowManager>, executor: FlowExecutor, locks: Arc<StateLocks>) -> Self {
        Self { flows, executor, locks }
    }

    /// Resume each awaiting flow for `contact_id` with `reply`. Flows are
    /// handled one after another; a failure in one does not stop the rest.
    /// An empty result means nothing was waiting.
    #[instrument(skip(self, reply), fields(len = reply.len()))]
    pub async fn resume(&self, contact_id: &str, reply: &str) -> Result<Vec<Resumed>, FlowError> {
        let waiting = self.executor.states().awaiting_input(contact_id).await?;
        let mut resumed = Vec::with_capacity(waiting.len());

        for candidate in waiting {
            let key = candidate.key();
            let _guard = self.locks.acquire(&key).await;

            // someone may have resumed it while we waited for the lock
            let Some(mut state) = self.executor.states().get(&key).await? else {
                continue;
            };
            if !state.awaiting_input || state.completed {
                debug!(flow_id = %key.flow_id, "already resumed elsewhere");
                continue;
            }

            let Some(flow) = self.flows.resolve(&state.flow_id, state.flow_version) else {
                warn!(flow_id = %state.flow_id, "awaiting flow no longer published");
                resumed.push(Resumed {
                    flow_id: state.flow_id.clone(),
                    result: Err(FlowError::FlowNotFound(state.flow_id.clone())),
                });
                continue;
            };

            let node_id = state.current_node_id.clone();
            let Some(node) = flow.node(&node_id) else {
                resumed.push(Resumed {
                    flow_id: state.flow_id.clone(),
                    result: Err(FlowError::graph(flow.id(), GraphError::MissingNode(node_id))),
                });
                continue;
            };

            if let NodeKind::UserInput(cfg) = &node.kind {
                state.set_var(cfg.key(), reply);
            }
            state.set_var(LAST_USER_MESSAGE, reply);
            state.push_turn(TurnRole::User, reply);
            state.awaiting_input = false;
            state.record(&node_id, PathAction::Resumed, None);
            state.record(&node_id, PathAction::Completed, None);

            let result = self
                .executor
                .continue_after(&flow, state, &node_id, Some(json!({ "response": reply })))
                .await;
            match &result {
                Ok(report) => info!(flow_id = %flow.id(), outcome = ?report.outcome, "flow resumed"),
                Err(e) if e.is_conflict() => debug!(flow_id = %flow.id(), "lost resume race"),
                Err(e) => warn!(flow_id = %flow.id(), error = %e, "resumed flow stalled"),
            }
            resumed.push(Resumed {
                flow_id: flow.id().to_string(),
                result,
            });
        }

        self.locks.prune();
        Ok(resumed)
    }

    /// Merge extra variables into a suspended state without moving it.
    pub async fn set_variables(
        &self,
        contact_id: &str,
        flow_id: &str,
        variables: HashMap<String, String>,
    ) -> Result<bool, FlowError> {
        let key = StateKey::new(contact_id, flow_id);
        let _guard = self.locks.acquire(&key).await;
        let Some(mut state) = self.executor.states().get(&key).await? else {
            return Ok(false);
        };
        state.variables.extend(variables);
        self.executor.persist(state).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collab::{Collaborators, MemoryCollaborators, NodeAction},
        dispatch::{ChannelLimits, DispatchQueue, HumanizeSettings, InMemoryOutboundStore, OutboundStore},
        flow::{
            definition::FlowDefinition,
            executor::{AdvanceOutcome, ExecutorSettings},
            state::{FlowState, FlowStateStore, InMemoryFlowStateStore},
        },
        node::{BotResponseConfig, UserInputConfig},
        store::StoreError,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Loses the next write to another process when `contested` is set.
    #[derive(Debug, Default)]
    struct ContestedStore {
        inner: InMemoryFlowStateStore,
        contested: AtomicBool,
    }

    #[async_trait]
    impl FlowStateStore for ContestedStore {
        async fn get(&self, key: &StateKey) -> Result<Option<FlowState>, StoreError> {
            self.inner.get(key).await
        }

        async fn insert_if_absent(&self, state: FlowState) -> Result<bool, StoreError> {
            self.inner.insert_if_absent(state).await
        }

        async fn compare_and_swap(&self, state: FlowState) -> Result<Option<FlowState>, StoreError> {
            if self.contested.swap(false, Ordering::SeqCst) {
                let mut rival = state.clone();
                rival.set_var("answer", "from elsewhere");
                rival.awaiting_input = false;
                self.inner.compare_and_swap(rival).await?;
            }
            self.inner.compare_and_swap(state).await
        }

        async fn awaiting_input(&self, contact_id: &str) -> Result<Vec<FlowState>, StoreError> {
            self.inner.awaiting_input(contact_id).await
        }

        async fn due_delays(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FlowState>, StoreError> {
            self.inner.due_delays(now, limit).await
        }

        async fn for_contact(&self, contact_id: &str) -> Result<Vec<FlowState>, StoreError> {
            self.inner.for_contact(contact_id).await
        }
    }

    struct Fixture {
        trigger: ResumptionTrigger,
        executor: FlowExecutor,
        states: Arc<ContestedStore>,
        recorder: Arc<MemoryCollaborators>,
        flows: Arc<FlowManager>,
    }

    fn fixture() -> Fixture {
        let states = Arc::new(ContestedStore::default());
        let recorder = MemoryCollaborators::new();
        let queue = DispatchQueue::new(
            InMemoryOutboundStore::new(),
            HumanizeSettings {
                min_delay_ms: 0,
                max_delay_ms: 0,
                typing_chars_per_second: 0.0,
            },
            ChannelLimits::default(),
        );
        let executor = FlowExecutor::new(
            states.clone(),
            queue,
            Collaborators::recording(recorder.clone()),
            ExecutorSettings::default(),
        );
        let flows = FlowManager::new();
        let trigger = ResumptionTrigger::new(flows.clone(), executor.clone(), Arc::new(StateLocks::new()));
        Fixture {
            trigger,
            executor,
            states,
            recorder,
            flows,
        }
    }

    fn survey(id: &str) -> FlowDefinition {
        FlowDefinition::new(id, "org1")
            .add_node("start", NodeKind::Start)
            .add_node(
                "ask",
                NodeKind::UserInput(UserInputConfig {
                    save_as: Some("answer".into()),
                }),
            )
            .add_node(
                "thanks",
                NodeKind::BotResponse(BotResponseConfig {
                    message: "You said {{answer}}".into(),
                    media_url: None,
                }),
            )
            .connect("start", "ask")
            .connect("ask", "thanks")
    }

    impl Fixture {
        async fn park(&self, flow_id: &str) {
            let flow = self.flows.publish(survey(flow_id)).unwrap();
            let state = FlowState::start(&flow, "c1", "wa");
            self.states.insert_if_absent(state.clone()).await.unwrap();
            let report = self.executor.advance(&flow, state, HashMap::new()).await.unwrap();
            assert!(matches!(report.outcome, AdvanceOutcome::AwaitingInput { .. }));
        }
    }

    #[tokio::test]
    async fn test_reply_resumes_and_saves_answer() {
        let f = fixture();
        f.park("survey").await;

        let resumed = f.trigger.resume("c1", "yes").await.unwrap();
        assert_eq!(resumed.len(), 1);
        let report = resumed[0].result.as_ref().unwrap();
        assert_eq!(report.outcome, AdvanceOutcome::Completed);

        let state = f.states.get(&StateKey::new("c1", "survey")).await.unwrap().unwrap();
        assert_eq!(state.var("answer"), Some("yes"));
        assert_eq!(state.var(LAST_USER_MESSAGE), Some("yes"));
        assert!(state.completed);
        assert!(!state.awaiting_input);
        assert_eq!(state.conversation.first().map(|t| t.role), Some(TurnRole::User));

        let sent: Vec<String> = f
            .executor
            .queue()
            .store()
            .all()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(sent, vec!["You said yes".to_string()]);

        let completed = f
            .recorder
            .node_events()
            .into_iter()
            .find(|e| e.node_id == "ask" && e.action == NodeAction::Completed)
            .unwrap();
        assert_eq!(completed.payload, Some(json!({ "response": "yes" })));
    }

    #[tokio::test]
    async fn test_nothing_waiting_is_empty() {
        let f = fixture();
        assert!(f.trigger.resume("c1", "hello").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resumes_every_awaiting_flow() {
        let f = fixture();
        f.park("a").await;
        f.park("b").await;

        let resumed = f.trigger.resume("c1", "ok").await.unwrap();
        let ids: Vec<&str> = resumed.iter().map(|r| r.flow_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(resumed.iter().all(|r| r.result.is_ok()));

        // a second reply finds nothing left to resume
        assert!(f.trigger.resume("c1", "again").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_replies_resume_once() {
        let f = fixture();
        f.park("survey").await;

        let (a, b) = tokio::join!(f.trigger.resume("c1", "first"), f.trigger.resume("c1", "second"));
        let total = a.unwrap().len() + b.unwrap().len();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_set_variables_keeps_position() {
        let f = fixture();
        f.park("survey").await;
        let updated = f
            .trigger
            .set_variables("c1", "survey", HashMap::from([("plan".to_string(), "pro".to_string())]))
            .await
            .unwrap();
        assert!(updated);

        let state = f.states.get(&StateKey::new("c1", "survey")).await.unwrap().unwrap();
        assert_eq!(state.var("plan"), Some("pro"));
        assert!(state.awaiting_input);
        assert_eq!(state.current_node_id, "ask");
    }

    #[tokio::test]
    async fn test_lost_resume_race_reports_no_completion() {
        let f = fixture();
        f.park("survey").await;
        f.states.contested.store(true, Ordering::SeqCst);

        let resumed = f.trigger.resume("c1", "yes").await.unwrap();
        assert!(resumed[0].result.as_ref().is_err_and(|e| e.is_conflict()));

        let events = f.recorder.node_events();
        assert!(!events.iter().any(|e| e.node_id == "ask" && e.action == NodeAction::Completed));
        assert!(f.executor.queue().store().all().await.unwrap().is_empty());
        let state = f.states.get(&StateKey::new("c1", "survey")).await.unwrap().unwrap();
        assert_eq!(state.var("answer"), Some("from elsewhere"));
    }
}
