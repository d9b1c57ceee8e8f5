use std::{collections::HashMap, sync::Arc};

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::flow::{
    LAST_USER_MESSAGE,
    definition::FlowDefinition,
    error::FlowError,
    executor::{AdvanceReport, FlowExecutor},
    lock::StateLocks,
    manager::FlowManager,
    state::{FlowState, StateKey, TurnRole},
};

/// Variable holding the text or event that started the flow.
pub const TRIGGER_KEYWORD: &str = "trigger_keyword";
/// Variable holding the event name for event-started flows.
pub const TRIGGER_EVENT: &str = "trigger_event";

/// What happened to one matching flow.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started(AdvanceReport),
    /// The contact is already inside this flow; nothing was changed.
    AlreadyRunning,
    Failed(FlowError),
}

#[derive(Debug, Clone)]
pub struct FlowMatch {
    pub flow: Arc<FlowDefinition>,
    pub outcome: StartOutcome,
}

impl FlowMatch {
    pub fn started(&self) -> bool {
        matches!(self.outcome, StartOutcome::Started(_))
    }
}

/// Who and where a start request is for.
#[derive(Debug, Clone, Copy)]
pub struct StartContext<'a> {
    pub contact_id: &'a str,
    pub organization_id: &'a str,
    pub channel_id: &'a str,
}

/// Starts flows whose triggers match inbound text or events.
#[derive(Debug, Clone)]
pub struct TriggerMatcher {
    flows: Arc<FlowManager>,
    executor: FlowExecutor,
    locks: Arc<StateLocks>,
}

impl TriggerMatcher {
    pub fn new(flows: Arc<FlowManager>, executor: FlowExecutor, locks: Arc<StateLocks>) -> Self {
        Self { flows, executor, locks }
    }

    /// Start every active flow of the organization whose keywords match
    /// `text`. Matching is idempotent: a contact already running a flow is
    /// left alone, a contact who completed it starts over.
    #[instrument(skip(self, text), fields(contact_id = ctx.contact_id, org = ctx.organization_id))]
    pub async fn match_text(&self, ctx: StartContext<'_>, text: &str) -> Vec<FlowMatch> {
        let mut matches = Vec::new();
        for flow in self.flows.active_for_organization(ctx.organization_id) {
            if !flow.matches_text(text) {
                continue;
            }
            let variables = HashMap::from([
                (LAST_USER_MESSAGE.to_string(), text.to_string()),
                (TRIGGER_KEYWORD.to_string(), text.trim().to_string()),
            ]);
            let outcome = self.start(&flow, ctx, variables, Some(text)).await;
            matches.push(FlowMatch { flow, outcome });
        }
        if matches.is_empty() {
            debug!("no flow matched");
        }
        matches
    }

    /// Start every active flow listening for `event_type`. Top-level string,
    /// number and bool fields of `payload` become variables.
    #[instrument(skip(self, payload), fields(contact_id = ctx.contact_id, org = ctx.organization_id))]
    pub async fn match_event(
        &self,
        ctx: StartContext<'_>,
        event_type: &str,
        payload: Option<&Value>,
    ) -> Vec<FlowMatch> {
        let mut matches = Vec::new();
        for flow in self.flows.active_for_organization(ctx.organization_id) {
            if !flow.matches_event(event_type) {
                continue;
            }
            let mut variables = payload_variables(payload);
            variables.insert(TRIGGER_EVENT.to_string(), event_type.to_string());
            variables.insert(TRIGGER_KEYWORD.to_string(), event_type.to_string());
            let outcome = self.start(&flow, ctx, variables, None).await;
            matches.push(FlowMatch { flow, outcome });
        }
        matches
    }

    /// Start one flow for a contact by id, ignoring its triggers.
    pub async fn start_flow(
        &self,
        flow_id: &str,
        ctx: StartContext<'_>,
        variables: HashMap<String, String>,
    ) -> Result<FlowMatch, FlowError> {
        let flow = self
            .flows
            .get(flow_id)
            .ok_or_else(|| FlowError::FlowNotFound(flow_id.to_string()))?;
        let outcome = self.start(&flow, ctx, variables, None).await;
        Ok(FlowMatch { flow, outcome })
    }

    async fn start(
        &self,
        flow: &Arc<FlowDefinition>,
        ctx: StartContext<'_>,
        variables: HashMap<String, String>,
        user_text: Option<&str>,
    ) -> StartOutcome {
        match self.try_start(flow, ctx, variables, user_text).await {
            Ok(Some(report)) => {
                info!(flow_id = %flow.id(), version = flow.version(), outcome = ?report.outcome, "flow started");
                StartOutcome::Started(report)
            }
            Ok(None) => {
                debug!(flow_id = %flow.id(), "flow already running");
                StartOutcome::AlreadyRunning
            }
            Err(e) if e.is_conflict() => {
                debug!(flow_id = %flow.id(), "lost start race");
                StartOutcome::AlreadyRunning
            }
            Err(e) => {
                warn!(flow_id = %flow.id(), error = %e, "flow failed to start");
                StartOutcome::Failed(e)
            }
        }
    }

    async fn try_start(
        &self,
        flow: &FlowDefinition,
        ctx: StartContext<'_>,
        variables: HashMap<String, String>,
        user_text: Option<&str>,
    ) -> Result<Option<AdvanceReport>, FlowError> {
        let key = StateKey::new(ctx.contact_id, flow.id());
        let _guard = self.locks.acquire(&key).await;
        let states = self.executor.states();

        let state = match states.get(&key).await? {
            Some(existing) if existing.is_running() => return Ok(None),
            Some(mut finished) => {
                finished.restart(flow, ctx.channel_id);
                if let Some(text) = user_text {
                    finished.push_turn(TurnRole::User, text);
                }
                self.executor.persist(finished).await?
            }
            None => {
                let mut fresh = FlowState::start(flow, ctx.contact_id, ctx.channel_id);
                if let Some(text) = user_text {
                    fresh.push_turn(TurnRole::User, text);
                }
                if !states.insert_if_absent(fresh.clone()).await? {
                    return Ok(None);
                }
                fresh
            }
        };

        if let Err(e) = self
            .executor
            .collaborators()
            .analytics
            .start_journey(ctx.contact_id, flow.id())
            .await
        {
            warn!(error = %e, "could not record journey start");
        }

        self.executor.advance(flow, state, variables).await.map(Some)
    }
}

fn payload_variables(payload: Option<&Value>) -> HashMap<String, String> {
    let Some(Value::Object(fields)) = payload else {
        return HashMap::new();
    };
    fields
        .iter()
        .filter_map(|(k, v)| {
            let text = match v {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((k.clone(), text))
        })
        .collect()
}
