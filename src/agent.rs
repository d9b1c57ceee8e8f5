use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{collab::CollaboratorError, flow::state::ConversationTurn};

/// What the reply capability hands back for an `aiResponse` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiReply {
    pub text: String,
    #[serde(default)]
    pub should_escalate: bool,
}

impl AiReply {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            should_escalate: false,
        }
    }

    pub fn escalating(mut self) -> Self {
        self.should_escalate = true;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRequest<'a> {
    pub contact_id: &'a str,
    pub last_message: &'a str,
    pub history: &'a [ConversationTurn],
}

/// Opaque "generate a reply" capability.
#[async_trait]
pub trait ReplyGenerator: Send + Sync + Debug {
    async fn generate(&self, request: ReplyRequest<'_>) -> Result<AiReply, CollaboratorError>;
}

/// Used when no AI backend is wired in; every call takes the fallback path.
#[derive(Debug, Default, Clone)]
pub struct UnavailableGenerator;

#[async_trait]
impl ReplyGenerator for UnavailableGenerator {
    async fn generate(&self, _request: ReplyRequest<'_>) -> Result<AiReply, CollaboratorError> {
        Err(CollaboratorError::Failed("no reply generator configured".into()))
    }
}

/// Posts the request as JSON to an endpoint that answers with an [`AiReply`].
#[derive(Debug, Clone)]
pub struct HttpReplyGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpReplyGenerator {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollaboratorError::Failed(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

#[async_trait]
impl ReplyGenerator for HttpReplyGenerator {
    async fn generate(&self, request: ReplyRequest<'_>) -> Result<AiReply, CollaboratorError> {
        let mut call = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }
        let response = call.send().await.map_err(CollaboratorError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(CollaboratorError::Failed(format!(
                "reply endpoint answered {}",
                status
            )));
        }
        let reply: AiReply = response.json().await.map_err(CollaboratorError::from)?;
        debug!(contact_id = request.contact_id, escalate = reply.should_escalate, "generated reply");
        Ok(reply)
    }
}

/// Answers from a fixed script; handy for demos and tests.
#[derive(Debug, Clone)]
pub struct ScriptedGenerator {
    reply: AiReply,
}

impl ScriptedGenerator {
    pub fn new(reply: AiReply) -> Self {
        Self { reply }
    }
}

#[async_trait]
impl ReplyGenerator for ScriptedGenerator {
    async fn generate(&self, _request: ReplyRequest<'_>) -> Result<AiReply, CollaboratorError> {
        Ok(self.reply.clone())
    }
}
