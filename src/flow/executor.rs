use std::{collections::HashMap, time::Duration};

use channel_plugin::MediaRef;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::{
    agent::ReplyRequest,
    collab::{CollaboratorError, Collaborators, NodeAction, NodeEvent},
    dispatch::{DispatchQueue, OutboundMessage},
    flow::{
        LAST_USER_MESSAGE,
        condition,
        definition::FlowDefinition,
        error::{FlowError, GraphError},
        state::{FlowState, PathAction, StateStore, TurnRole},
        template::render,
    },
    integration::HttpRequestSpec,
    node::{AiResponseConfig, IntegrationConfig, Node, NodeKind},
    util::{mime_from_url, to_delta},
};

/// Variable an `aiResponse` node stores its reply under.
pub const AI_RESPONSE: &str = "ai_response";

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    /// Upper bound on nodes executed by one `advance` call.
    pub max_steps: usize,
    pub ai_timeout: Duration,
    pub integration_timeout: Duration,
    /// Sent when the reply capability fails and the node has no fallback of its own.
    pub ai_fallback_message: String,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_steps: 100,
            ai_timeout: Duration::from_secs(30),
            integration_timeout: Duration::from_secs(10),
            ai_fallback_message:
                "Sorry, I can't answer that right now. Someone from our team will get back to you soon."
                    .to_string(),
        }
    }
}

/// Where an `advance` call left the flow.
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    AwaitingInput { node_id: String },
    Delayed { node_id: String, until: DateTime<Utc> },
    Completed,
    /// An `assignAgent` node gave the contact to a human; the flow is over.
    HandedOff { node_id: String },
}

#[derive(Debug, Clone)]
pub struct AdvanceReport {
    /// The state as persisted.
    pub state: FlowState,
    pub outcome: AdvanceOutcome,
    /// Nodes executed by this call.
    pub steps: usize,
}

enum Step {
    /// Move on to the given node, or complete the flow when there is none.
    Follow(Option<String>),
    Suspend(AdvanceOutcome),
    Finish(AdvanceOutcome),
}

/// Walks a flow graph for one contact until it has to wait.
///
/// Stateless between calls: everything it needs is in the `FlowState` it is
/// handed, and every transition is written back with compare-and-swap.
#[derive(Debug, Clone)]
pub struct FlowExecutor {
    states: StateStore,
    queue: DispatchQueue,
    collab: Collaborators,
    settings: ExecutorSettings,
}

impl FlowExecutor {
    pub fn new(
        states: StateStore,
        queue: DispatchQueue,
        collab: Collaborators,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            states,
            queue,
            collab,
            settings,
        }
    }

    pub fn states(&self) -> &StateStore {
        &self.states
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collab
    }

    /// Execute nodes from `state.current_node_id` until the flow suspends,
    /// completes, or fails.
    ///
    /// `state` must be the row as currently stored; its `version` is used for
    /// compare-and-swap. A failing critical node leaves the stored row exactly
    /// as it was before that node ran.
    #[instrument(skip_all, fields(flow_id = %flow.id(), contact_id = %state.contact_id))]
    pub async fn advance(
        &self,
        flow: &FlowDefinition,
        mut state: FlowState,
        variables: HashMap<String, String>,
    ) -> Result<AdvanceReport, FlowError> {
        state.variables.extend(variables);
        if state.completed {
            return Ok(AdvanceReport {
                state,
                outcome: AdvanceOutcome::Completed,
                steps: 0,
            });
        }

        let mut steps = 0;
        loop {
            if steps >= self.settings.max_steps {
                let err = FlowError::graph(flow.id(), GraphError::StepLimitExceeded(steps));
                error!(node_id = %state.current_node_id, error = %err, "flow stalled");
                if let Some(node) = flow.node(&state.current_node_id) {
                    self.drop_off(&state, node, &err).await;
                }
                return Err(err);
            }
            steps += 1;

            let Some(node) = flow.node(&state.current_node_id) else {
                let err = FlowError::graph(
                    flow.id(),
                    GraphError::MissingNode(state.current_node_id.clone()),
                );
                error!(error = %err, "flow stalled");
                self.abandon(&state).await;
                return Err(err);
            };

            self.emit(&state, node, NodeAction::Entered, None).await;
            let mut next = state.clone();
            next.record(&node.id, PathAction::Entered, None);

            let mut queued = Vec::new();
            let step = match self.run_node(flow, node, &mut next, &mut queued).await {
                Ok(step) => step,
                Err(err) => {
                    error!(
                        node_id = %node.id,
                        node_type = node.type_name(),
                        criticality = ?node.kind.criticality(),
                        error = %err,
                        "node failed, flow stalled"
                    );
                    self.drop_off(&state, node, &err).await;
                    return Err(err);
                }
            };

            match step {
                Step::Follow(Some(target)) => {
                    next.record(&node.id, PathAction::Completed, None);
                    next.current_node_id = target;
                    state = self.settle(self.persist(next).await, &queued).await?;
                    self.emit(&state, node, NodeAction::Completed, None).await;
                }
                Step::Follow(None) => {
                    next.record(&node.id, PathAction::Completed, None);
                    let state = self.settle(self.finish(next).await, &queued).await?;
                    self.emit(&state, node, NodeAction::Completed, None).await;
                    return Ok(AdvanceReport {
                        state,
                        outcome: AdvanceOutcome::Completed,
                        steps,
                    });
                }
                Step::Suspend(outcome) => {
                    let state = self.settle(self.persist(next).await, &queued).await?;
                    debug!(outcome = ?outcome, steps, "flow suspended");
                    return Ok(AdvanceReport {
                        state,
                        outcome,
                        steps,
                    });
                }
                Step::Finish(outcome) => {
                    next.record(&node.id, PathAction::Completed, None);
                    let state = self.settle(self.finish(next).await, &queued).await?;
                    self.emit(&state, node, NodeAction::Completed, None).await;
                    return Ok(AdvanceReport {
                        state,
                        outcome,
                        steps,
                    });
                }
            }
        }
    }

    /// Move past a suspended node: follow its outgoing edge and advance, or
    /// complete the flow when it has none. The node's `Completed` event
    /// carries `payload` and is reported once the move is stored.
    pub async fn continue_after(
        &self,
        flow: &FlowDefinition,
        mut state: FlowState,
        node_id: &str,
        payload: Option<Value>,
    ) -> Result<AdvanceReport, FlowError> {
        let target = flow.next_after(node_id).map(|e| e.target_node_id.clone());
        let stored = match &target {
            Some(target) => {
                state.current_node_id = target.clone();
                self.persist(state).await?
            }
            None => self.finish(state).await?,
        };
        if let Some(node) = flow.node(node_id) {
            self.emit(&stored, node, NodeAction::Completed, payload).await;
        }

        match target {
            Some(_) => self.advance(flow, stored, HashMap::new()).await,
            None => Ok(AdvanceReport {
                state: stored,
                outcome: AdvanceOutcome::Completed,
                steps: 0,
            }),
        }
    }

    async fn run_node(
        &self,
        flow: &FlowDefinition,
        node: &Node,
        state: &mut FlowState,
        queued: &mut Vec<Uuid>,
    ) -> Result<Step, FlowError> {
        let follow = || Step::Follow(flow.next_after(&node.id).map(|e| e.target_node_id.clone()));

        match &node.kind {
            NodeKind::Start => flow
                .next_after(&node.id)
                .map(|e| Step::Follow(Some(e.target_node_id.clone())))
                .ok_or_else(|| {
                    FlowError::graph(flow.id(), GraphError::NoOutgoingEdge(node.id.clone()))
                }),

            NodeKind::BotResponse(cfg) => {
                let text = render(&cfg.message, &state.variables);
                let media = cfg
                    .media_url
                    .as_deref()
                    .map(|url| render(url, &state.variables))
                    .filter(|url| !url.trim().is_empty())
                    .map(|url| {
                        let media = MediaRef::new(url.clone());
                        match mime_from_url(&url) {
                            Some(mime) => media.with_mime_type(mime),
                            None => media,
                        }
                    });
                queued.push(self.send(flow, state, &text, media).await?.id);
                Ok(follow())
            }

            NodeKind::UserInput(_) => {
                state.awaiting_input = true;
                state.record(&node.id, PathAction::Awaiting, None);
                Ok(Step::Suspend(AdvanceOutcome::AwaitingInput {
                    node_id: node.id.clone(),
                }))
            }

            NodeKind::Condition(cfg) => {
                let outcome = condition::evaluate(cfg, state.var(&cfg.variable));
                debug!(node_id = %node.id, variable = %cfg.variable, outcome, "condition evaluated");
                Ok(Step::Follow(
                    flow.branch(&node.id, outcome).map(|e| e.target_node_id.clone()),
                ))
            }

            NodeKind::Delay(cfg) => {
                if cfg.seconds == 0 {
                    return Ok(follow());
                }
                let until = Utc::now() + to_delta(Duration::from_secs(cfg.seconds));
                state.resume_at = Some(until);
                state.record(&node.id, PathAction::Delayed, Some(until.to_rfc3339()));
                Ok(Step::Suspend(AdvanceOutcome::Delayed {
                    node_id: node.id.clone(),
                    until,
                }))
            }

            NodeKind::AiResponse(cfg) => {
                queued.push(self.ai_response(flow, node, cfg, state).await?);
                Ok(follow())
            }

            NodeKind::AssignAgent(cfg) => {
                self.collab
                    .handoff
                    .assign_agent(&state.contact_id, cfg.department.as_deref())
                    .await
                    .map_err(|e| collaborator(node, e))?;
                Ok(Step::Finish(AdvanceOutcome::HandedOff {
                    node_id: node.id.clone(),
                }))
            }

            NodeKind::AddTag(cfg) => {
                let tag = render(&cfg.tag, &state.variables);
                self.collab
                    .tagging
                    .add_tag(&state.contact_id, &tag)
                    .await
                    .map_err(|e| collaborator(node, e))?;
                Ok(follow())
            }

            NodeKind::UpdateScore(cfg) => {
                let score = state.adjust_score(cfg.delta);
                self.collab
                    .scoring
                    .update_score(&state.contact_id, cfg.delta, score)
                    .await
                    .map_err(|e| collaborator(node, e))?;
                Ok(follow())
            }

            NodeKind::LogEvent(cfg) => {
                self.collab
                    .analytics
                    .log_event(&state.contact_id, &cfg.event, cfg.payload.clone())
                    .await
                    .map_err(|e| collaborator(node, e))?;
                Ok(follow())
            }

            NodeKind::Integration(cfg) => {
                self.integration(node, cfg, state).await;
                Ok(follow())
            }
        }
    }

    async fn send(
        &self,
        flow: &FlowDefinition,
        state: &mut FlowState,
        text: &str,
        media: Option<MediaRef>,
    ) -> Result<OutboundMessage, FlowError> {
        let message = self
            .queue
            .enqueue_for_flow(flow.id(), &state.channel_id, &state.contact_id, text, media)
            .await?;
        state.push_turn(TurnRole::Bot, text);
        Ok(message)
    }

    async fn ai_response(
        &self,
        flow: &FlowDefinition,
        node: &Node,
        cfg: &AiResponseConfig,
        state: &mut FlowState,
    ) -> Result<Uuid, FlowError> {
        let last_message = state.var(LAST_USER_MESSAGE).unwrap_or_default().to_string();
        let request = ReplyRequest {
            contact_id: &state.contact_id,
            last_message: &last_message,
            history: &state.conversation,
        };
        let timeout = self.settings.ai_timeout;
        let generated = match tokio::time::timeout(timeout, self.collab.replies.generate(request)).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::Timeout(timeout.as_millis() as u64)),
        };

        let sent = match generated {
            Ok(reply) if !reply.text.trim().is_empty() => {
                state.set_var(AI_RESPONSE, reply.text.clone());
                let sent = self.send(flow, state, &reply.text, None).await?;
                if reply.should_escalate {
                    match self
                        .collab
                        .handoff
                        .assign_agent(&state.contact_id, cfg.escalation_department.as_deref())
                        .await
                    {
                        Ok(()) => state.record(&node.id, PathAction::Completed, Some("escalated".into())),
                        Err(e) => warn!(node_id = %node.id, error = %e, "escalation handoff failed"),
                    }
                }
                sent
            }
            other => {
                match other {
                    Err(e) => warn!(node_id = %node.id, error = %e, "reply generation failed, sending fallback"),
                    Ok(_) => warn!(node_id = %node.id, "reply generation returned nothing, sending fallback"),
                }
                let fallback = cfg
                    .fallback_message
                    .as_deref()
                    .unwrap_or(&self.settings.ai_fallback_message);
                let text = render(fallback, &state.variables);
                self.send(flow, state, &text, None).await?
            }
        };
        Ok(sent.id)
    }

    async fn integration(&self, node: &Node, cfg: &IntegrationConfig, state: &mut FlowState) {
        let vars = &state.variables;
        let request = HttpRequestSpec {
            method: cfg.method.clone(),
            url: render(&cfg.url, vars),
            headers: cfg
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), render(v, vars)))
                .collect(),
            body: cfg.body.as_deref().map(|b| render(b, vars)),
        };
        let url = request.url.clone();
        let timeout = self.settings.integration_timeout;
        let result = match tokio::time::timeout(timeout, self.collab.integrations.call(request)).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::Timeout(timeout.as_millis() as u64)),
        };

        match result {
            Ok(response) => {
                debug!(node_id = %node.id, %url, status = response.status, "integration call succeeded");
                if let Some(key) = cfg.save_as.as_deref().filter(|k| !k.trim().is_empty()) {
                    state.set_var(key, response.body);
                }
            }
            Err(e) => warn!(node_id = %node.id, %url, error = %e, "integration call failed, continuing"),
        }
    }

    /// Write a transition; losing the compare-and-swap is a conflict.
    pub(crate) async fn persist(&self, state: FlowState) -> Result<FlowState, FlowError> {
        let (contact_id, flow_id) = (state.contact_id.clone(), state.flow_id.clone());
        self.states
            .compare_and_swap(state)
            .await?
            .ok_or(FlowError::ConcurrencyConflict { contact_id, flow_id })
    }

    /// Pass a transition's write result through, withdrawing the sends the
    /// transition queued when another writer committed first. Sends a
    /// dispatcher already claimed can no longer be withdrawn.
    async fn settle(
        &self,
        written: Result<FlowState, FlowError>,
        queued: &[Uuid],
    ) -> Result<FlowState, FlowError> {
        if let Err(err) = &written {
            if err.is_conflict() && !queued.is_empty() {
                match self.queue.withdraw(queued).await {
                    Ok(withdrawn) => warn!(withdrawn, queued = queued.len(), "transition lost, queued sends withdrawn"),
                    Err(e) => error!(error = %e, "transition lost, could not withdraw queued sends"),
                }
            }
        }
        written
    }

    async fn finish(&self, mut state: FlowState) -> Result<FlowState, FlowError> {
        state.completed = true;
        state.awaiting_input = false;
        state.resume_at = None;
        let stored = self.persist(state).await?;
        if let Err(e) = self
            .collab
            .analytics
            .complete_journey(&stored.contact_id, &stored.flow_id)
            .await
        {
            warn!(error = %e, "could not record journey completion");
        }
        debug!(contact_id = %stored.contact_id, flow_id = %stored.flow_id, "flow completed");
        Ok(stored)
    }

    /// Report a node event; analytics failures never affect the flow.
    pub(crate) async fn emit(
        &self,
        state: &FlowState,
        node: &Node,
        action: NodeAction,
        payload: Option<Value>,
    ) {
        let event = NodeEvent {
            contact_id: state.contact_id.clone(),
            flow_id: state.flow_id.clone(),
            node_id: node.id.clone(),
            node_type: node.type_name().to_string(),
            action,
            payload,
        };
        if let Err(e) = self.collab.analytics.record_node_event(event).await {
            warn!(node_id = %node.id, error = %e, "could not record node event");
        }
    }

    async fn drop_off(&self, state: &FlowState, node: &Node, err: &FlowError) {
        self.emit(
            state,
            node,
            NodeAction::DroppedOff,
            Some(json!({ "error": err.to_string() })),
        )
        .await;
        self.abandon(state).await;
    }

    async fn abandon(&self, state: &FlowState) {
        if let Err(e) = self
            .collab
            .analytics
            .abandon_journey(&state.contact_id, &state.flow_id)
            .await
        {
            warn!(error = %e, "could not record journey abandonment");
        }
    }
}

fn collaborator(node: &Node, source: CollaboratorError) -> FlowError {
    FlowError::Collaborator {
        node_id: node.id.clone(),
        source,
    }
}
