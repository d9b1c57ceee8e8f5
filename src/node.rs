use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};

use crate::flow::definition::DefinitionError;

/// Whether a failure inside a node stalls the flow or is logged and skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    Critical,
    BestEffort,
}

/// The on-disk shape of a node: `{ "id": .., "type": .., "config": {..} }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RawNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
}

/// A node with its config parsed into the struct for its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self { id: id.into(), kind }
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Start,
    BotResponse(BotResponseConfig),
    UserInput(UserInputConfig),
    Condition(ConditionConfig),
    Delay(DelayConfig),
    AiResponse(AiResponseConfig),
    AssignAgent(AssignAgentConfig),
    AddTag(AddTagConfig),
    UpdateScore(UpdateScoreConfig),
    LogEvent(LogEventConfig),
    Integration(IntegrationConfig),
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::BotResponse(_) => "botResponse",
            NodeKind::UserInput(_) => "userInput",
            NodeKind::Condition(_) => "condition",
            NodeKind::Delay(_) => "delay",
            NodeKind::AiResponse(_) => "aiResponse",
            NodeKind::AssignAgent(_) => "assignAgent",
            NodeKind::AddTag(_) => "addTag",
            NodeKind::UpdateScore(_) => "updateScore",
            NodeKind::LogEvent(_) => "logEvent",
            NodeKind::Integration(_) => "integration",
        }
    }

    /// AI replies and outbound webhooks never halt the graph.
    pub fn criticality(&self) -> Criticality {
        match self {
            NodeKind::AiResponse(_) | NodeKind::Integration(_) => Criticality::BestEffort,
            _ => Criticality::Critical,
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, NodeKind::Start)
    }

    fn config_value(&self) -> Value {
        let value = match self {
            NodeKind::Start => Ok(Value::Null),
            NodeKind::BotResponse(c) => serde_json::to_value(c),
            NodeKind::UserInput(c) => serde_json::to_value(c),
            NodeKind::Condition(c) => serde_json::to_value(c),
            NodeKind::Delay(c) => serde_json::to_value(c),
            NodeKind::AiResponse(c) => serde_json::to_value(c),
            NodeKind::AssignAgent(c) => serde_json::to_value(c),
            NodeKind::AddTag(c) => serde_json::to_value(c),
            NodeKind::UpdateScore(c) => serde_json::to_value(c),
            NodeKind::LogEvent(c) => serde_json::to_value(c),
            NodeKind::Integration(c) => serde_json::to_value(c),
        };
        value.unwrap_or_default()
    }
}

impl TryFrom<RawNode> for Node {
    type Error = DefinitionError;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let config = if raw.config.is_null() { json!({}) } else { raw.config };
        let invalid = |e: serde_json::Error| DefinitionError::InvalidNode {
            node_id: raw.id.clone(),
            reason: e.to_string(),
        };

        let kind = match raw.node_type.as_str() {
            "start" => NodeKind::Start,
            "botResponse" => NodeKind::BotResponse(serde_json::from_value(config).map_err(invalid)?),
            "userInput" => NodeKind::UserInput(serde_json::from_value(config).map_err(invalid)?),
            "condition" => NodeKind::Condition(serde_json::from_value(config).map_err(invalid)?),
            "delay" => NodeKind::Delay(serde_json::from_value(config).map_err(invalid)?),
            "aiResponse" => NodeKind::AiResponse(serde_json::from_value(config).map_err(invalid)?),
            "assignAgent" => NodeKind::AssignAgent(serde_json::from_value(config).map_err(invalid)?),
            "addTag" => NodeKind::AddTag(serde_json::from_value(config).map_err(invalid)?),
            "updateScore" => NodeKind::UpdateScore(serde_json::from_value(config).map_err(invalid)?),
            "logEvent" => NodeKind::LogEvent(serde_json::from_value(config).map_err(invalid)?),
            "integration" => NodeKind::Integration(serde_json::from_value(config).map_err(invalid)?),
            other => {
                return Err(DefinitionError::InvalidNode {
                    node_id: raw.id.clone(),
                    reason: format!("unknown node type `{}`", other),
                });
            }
        };

        Ok(Node { id: raw.id, kind })
    }
}

impl From<Node> for RawNode {
    fn from(node: Node) -> Self {
        RawNode {
            node_type: node.kind.type_name().to_string(),
            config: node.kind.config_value(),
            id: node.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotResponseConfig {
    /// May contain `{{variable}}` tokens.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_as: Option<String>,
}

impl UserInputConfig {
    pub const DEFAULT_KEY: &'static str = "user_input";

    pub fn key(&self) -> &str {
        match self.save_as.as_deref() {
            Some(k) if !k.trim().is_empty() => k,
            _ => Self::DEFAULT_KEY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOperator {
    Equals,
    Contains,
    Greater,
    Less,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub variable: String,
    pub operator: ConditionOperator,
    #[serde(deserialize_with = "string_or_scalar")]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    pub seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiResponseConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_message: Option<String>,
    /// Department handed to the human agent when the reply asks to escalate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_department: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignAgentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddTagConfig {
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateScoreConfig {
    #[serde(alias = "points", alias = "score")]
    pub delta: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEventConfig {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationConfig {
    #[serde(default = "IntegrationConfig::default_method")]
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Stores the response body under this variable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_as: Option<String>,
}

impl IntegrationConfig {
    fn default_method() -> String {
        "POST".to_string()
    }
}

// flow editors store comparison values as whatever the user typed: "50" or 50
fn string_or_scalar<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number, got {}",
            other
        ))),
    }
}
