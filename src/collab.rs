//! Interfaces to the subsystems the flow engine drives but does not own:
//! analytics, tagging, human handoff, scoring, contact lookup and message
//! history. Each comes with a tracing-only default so an engine can run with
//! nothing wired in, and [`MemoryCollaborators`] records every call for tests.

use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    agent::{ReplyGenerator, UnavailableGenerator},
    dispatch::message::OutboundMessage,
    integration::{IntegrationClient, ReqwestIntegration},
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("timed out after {0} ms")]
    Timeout(u64),
    #[error("{0}")]
    Failed(String),
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CollaboratorError::Timeout(0)
        } else {
            CollaboratorError::Failed(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeAction {
    Entered,
    Completed,
    DroppedOff,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub contact_id: String,
    pub flow_id: String,
    pub node_id: String,
    pub node_type: String,
    pub action: NodeAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[async_trait]
pub trait Analytics: Send + Sync + Debug {
    async fn record_node_event(&self, event: NodeEvent) -> Result<(), CollaboratorError>;
    async fn start_journey(&self, contact_id: &str, flow_id: &str) -> Result<(), CollaboratorError>;
    async fn complete_journey(&self, contact_id: &str, flow_id: &str) -> Result<(), CollaboratorError>;
    async fn abandon_journey(&self, contact_id: &str, flow_id: &str) -> Result<(), CollaboratorError>;
    /// Free-form event emitted by a `logEvent` node.
    async fn log_event(
        &self,
        contact_id: &str,
        event: &str,
        payload: Option<Value>,
    ) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait Tagging: Send + Sync + Debug {
    async fn add_tag(&self, contact_id: &str, tag: &str) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait Handoff: Send + Sync + Debug {
    async fn assign_agent(&self, contact_id: &str, department: Option<&str>) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait Scoring: Send + Sync + Debug {
    /// `score` is the contact's clamped engagement score after `delta` was applied.
    async fn update_score(&self, contact_id: &str, delta: i32, score: i32) -> Result<(), CollaboratorError>;
}

/// Resolves a contact to the address a channel delivers to (a phone number
/// for WhatsApp, a user id for Instagram).
#[async_trait]
pub trait ContactDirectory: Send + Sync + Debug {
    async fn address(&self, contact_id: &str, channel_id: &str) -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait MessageHistory: Send + Sync + Debug {
    async fn record_outbound(&self, message: &OutboundMessage) -> Result<(), CollaboratorError>;
}

/// Logs everything at `info`/`debug` and never fails.
#[derive(Debug, Default, Clone)]
pub struct TracingCollaborator;

#[async_trait]
impl Analytics for TracingCollaborator {
    async fn record_node_event(&self, event: NodeEvent) -> Result<(), CollaboratorError> {
        debug!(
            contact_id = %event.contact_id,
            flow_id = %event.flow_id,
            node_id = %event.node_id,
            node_type = %event.node_type,
            action = ?event.action,
            "node event"
        );
        Ok(())
    }

    async fn start_journey(&self, contact_id: &str, flow_id: &str) -> Result<(), CollaboratorError> {
        info!(contact_id, flow_id, "journey started");
        Ok(())
    }

    async fn complete_journey(&self, contact_id: &str, flow_id: &str) -> Result<(), CollaboratorError> {
        info!(contact_id, flow_id, "journey completed");
        Ok(())
    }

    async fn abandon_journey(&self, contact_id: &str, flow_id: &str) -> Result<(), CollaboratorError> {
        info!(contact_id, flow_id, "journey abandoned");
        Ok(())
    }

    async fn log_event(
        &self,
        contact_id: &str,
        event: &str,
        payload: Option<Value>,
    ) -> Result<(), CollaboratorError> {
        info!(contact_id, event, payload = ?payload, "flow event");
        Ok(())
    }
}

#[async_trait]
impl Tagging for TracingCollaborator {
    async fn add_tag(&self, contact_id: &str, tag: &str) -> Result<(), CollaboratorError> {
        info!(contact_id, tag, "tag added");
        Ok(())
    }
}

#[async_trait]
impl Handoff for TracingCollaborator {
    async fn assign_agent(&self, contact_id: &str, department: Option<&str>) -> Result<(), CollaboratorError> {
        info!(contact_id, department = ?department, "handed off to a human agent");
        Ok(())
    }
}

#[async_trait]
impl Scoring for TracingCollaborator {
    async fn update_score(&self, contact_id: &str, delta: i32, score: i32) -> Result<(), CollaboratorError> {
        info!(contact_id, delta, score, "engagement score updated");
        Ok(())
    }
}

#[async_trait]
impl MessageHistory for TracingCollaborator {
    async fn record_outbound(&self, message: &OutboundMessage) -> Result<(), CollaboratorError> {
        debug!(message_id = %message.id, contact_id = %message.contact_id, "message delivered");
        Ok(())
    }
}

/// Uses the contact id itself as the channel address.
#[derive(Debug, Default, Clone)]
pub struct ContactIdAddress;

#[async_trait]
impl ContactDirectory for ContactIdAddress {
    async fn address(&self, contact_id: &str, _channel_id: &str) -> Result<String, CollaboratorError> {
        Ok(contact_id.to_string())
    }
}

/// Keeps every call in memory.
#[derive(Debug, Default)]
pub struct MemoryCollaborators {
    pub node_events: Mutex<Vec<NodeEvent>>,
    /// `(kind, contact_id, flow_id)` where kind is started / completed / abandoned.
    pub journeys: Mutex<Vec<(String, String, String)>>,
    pub logged: Mutex<Vec<(String, String, Option<Value>)>>,
    pub tags: Mutex<Vec<(String, String)>>,
    pub handoffs: Mutex<Vec<(String, Option<String>)>>,
    pub scores: Mutex<Vec<(String, i32, i32)>>,
    pub delivered: Mutex<Vec<OutboundMessage>>,
}

impl MemoryCollaborators {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push<T>(list: &Mutex<Vec<T>>, item: T) -> Result<(), CollaboratorError> {
        list.lock()
            .map_err(|_| CollaboratorError::Failed("recorder lock poisoned".into()))?
            .push(item);
        Ok(())
    }

    fn read<T: Clone>(list: &Mutex<Vec<T>>) -> Vec<T> {
        list.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn node_events(&self) -> Vec<NodeEvent> {
        Self::read(&self.node_events)
    }

    /// `(node_id, action)` pairs in call order.
    pub fn node_trail(&self) -> Vec<(String, NodeAction)> {
        self.node_events()
            .into_iter()
            .map(|e| (e.node_id, e.action))
            .collect()
    }

    pub fn journeys(&self) -> Vec<(String, String, String)> {
        Self::read(&self.journeys)
    }

    pub fn logged(&self) -> Vec<(String, String, Option<Value>)> {
        Self::read(&self.logged)
    }

    pub fn tags(&self) -> Vec<(String, String)> {
        Self::read(&self.tags)
    }

    pub fn handoffs(&self) -> Vec<(String, Option<String>)> {
        Self::read(&self.handoffs)
    }

    pub fn scores(&self) -> Vec<(String, i32, i32)> {
        Self::read(&self.scores)
    }

    pub fn delivered(&self) -> Vec<OutboundMessage> {
        Self::read(&self.delivered)
    }
}

#[async_trait]
impl Analytics for MemoryCollaborators {
    async fn record_node_event(&self, event: NodeEvent) -> Result<(), CollaboratorError> {
        Self::push(&self.node_events, event)
    }

    async fn start_journey(&self, contact_id: &str, flow_id: &str) -> Result<(), CollaboratorError> {
        Self::push(&self.journeys, ("started".into(), contact_id.into(), flow_id.into()))
    }

    async fn complete_journey(&self, contact_id: &str, flow_id: &str) -> Result<(), CollaboratorError> {
        Self::push(&self.journeys, ("completed".into(), contact_id.into(), flow_id.into()))
    }

    async fn abandon_journey(&self, contact_id: &str, flow_id: &str) -> Result<(), CollaboratorError> {
        Self::push(&self.journeys, ("abandoned".into(), contact_id.into(), flow_id.into()))
    }

    async fn log_event(
        &self,
        contact_id: &str,
        event: &str,
        payload: Option<Value>,
    ) -> Result<(), CollaboratorError> {
        Self::push(&self.logged, (contact_id.into(), event.into(), payload))
    }
}

#[async_trait]
impl Tagging for MemoryCollaborators {
    async fn add_tag(&self, contact_id: &str, tag: &str) -> Result<(), CollaboratorError> {
        Self::push(&self.tags, (contact_id.into(), tag.into()))
    }
}

#[async_trait]
impl Handoff for MemoryCollaborators {
    async fn assign_agent(&self, contact_id: &str, department: Option<&str>) -> Result<(), CollaboratorError> {
        Self::push(&self.handoffs, (contact_id.into(), department.map(str::to_string)))
    }
}

#[async_trait]
impl Scoring for MemoryCollaborators {
    async fn update_score(&self, contact_id: &str, delta: i32, score: i32) -> Result<(), CollaboratorError> {
        Self::push(&self.scores, (contact_id.into(), delta, score))
    }
}

#[async_trait]
impl MessageHistory for MemoryCollaborators {
    async fn record_outbound(&self, message: &OutboundMessage) -> Result<(), CollaboratorError> {
        Self::push(&self.delivered, message.clone())
    }
}

/// Everything the executor and dispatcher call out to.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub analytics: Arc<dyn Analytics>,
    pub tagging: Arc<dyn Tagging>,
    pub handoff: Arc<dyn Handoff>,
    pub scoring: Arc<dyn Scoring>,
    pub replies: Arc<dyn ReplyGenerator>,
    pub integrations: Arc<dyn IntegrationClient>,
    pub contacts: Arc<dyn ContactDirectory>,
    pub history: Arc<dyn MessageHistory>,
}

impl Default for Collaborators {
    fn default() -> Self {
        let tracing = Arc::new(TracingCollaborator);
        Collaborators {
            analytics: tracing.clone(),
            tagging: tracing.clone(),
            handoff: tracing.clone(),
            scoring: tracing.clone(),
            replies: Arc::new(UnavailableGenerator),
            integrations: Arc::new(ReqwestIntegration::default()),
            contacts: Arc::new(ContactIdAddress),
            history: tracing,
        }
    }
}

impl Collaborators {
    /// Route analytics, tagging, handoff, scoring and history into one recorder.
    pub fn recording(recorder: Arc<MemoryCollaborators>) -> Self {
        Collaborators {
            analytics: recorder.clone(),
            tagging: recorder.clone(),
            handoff: recorder.clone(),
            scoring: recorder.clone(),
            history: recorder,
            ..Default::default()
        }
    }

    pub fn with_analytics(mut self, analytics: Arc<dyn Analytics>) -> Self {
        self.analytics = analytics;
        self
    }

    pub fn with_tagging(mut self, tagging: Arc<dyn Tagging>) -> Self {
        self.tagging = tagging;
        self
    }

    pub fn with_handoff(mut self, handoff: Arc<dyn Handoff>) -> Self {
        self.handoff = handoff;
        self
    }

    pub fn with_scoring(mut self, scoring: Arc<dyn Scoring>) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn with_replies(mut self, replies: Arc<dyn ReplyGenerator>) -> Self {
        self.replies = replies;
        self
    }

    pub fn with_integrations(mut self, integrations: Arc<dyn IntegrationClient>) -> Self {
        self.integrations = integrations;
        self
    }

    pub fn with_contacts(mut self, contacts: Arc<dyn ContactDirectory>) -> Self {
        self.contacts = contacts;
        self
    }

    pub fn with_history(mut self, history: Arc<dyn MessageHistory>) -> Self {
        self.history = history;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_collaborators_capture_calls() {
        let recorder = MemoryCollaborators::new();
        let collab = Collaborators::recording(recorder.clone());

        collab.tagging.add_tag("c1", "vip").await.unwrap();
        collab.handoff.assign_agent("c1", Some("sales")).await.unwrap();
        collab.analytics.start_journey("c1", "f1").await.unwrap();

        assert_eq!(recorder.tags(), vec![("c1".to_string(), "vip".to_string())]);
        assert_eq!(recorder.handoffs(), vec![("c1".to_string(), Some("sales".to_string()))]);
        assert_eq!(recorder.journeys()[0].0, "started");
    }

    #[tokio::test]
    async fn test_default_contact_address_is_contact_id() {
        let address = ContactIdAddress.address("+15550100", "whatsapp").await.unwrap();
        assert_eq!(address, "+15550100");
    }
}
