use channel_plugin::{MediaRef, SendRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    /// Claimed by a dispatcher; the claim expires after the lease.
    Dispatching,
    Sent,
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Failed)
    }
}

/// One queued outbound send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub channel_id: String,
    pub contact_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
    pub status: MessageStatus,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Held by the dispatcher that owns the current claim. Renewals and
    /// completions must present it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_token: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Flow that produced the send, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
}

impl OutboundMessage {
    pub fn pending(
        channel_id: impl Into<String>,
        contact_id: impl Into<String>,
        content: impl Into<String>,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        OutboundMessage {
            id: Uuid::new_v4(),
            channel_id: channel_id.into(),
            contact_id: contact_id.into(),
            content: content.into(),
            media: None,
            status: MessageStatus::Pending,
            scheduled_at,
            created_at: Utc::now(),
            claimed_at: None,
            claim_token: None,
            sent_at: None,
            delivery_id: None,
            retry_count: 0,
            last_error: None,
            flow_id: None,
        }
    }

    pub fn with_media(mut self, media: Option<MediaRef>) -> Self {
        self.media = media;
        self
    }

    pub fn with_flow(mut self, flow_id: Option<String>) -> Self {
        self.flow_id = flow_id;
        self
    }

    pub fn to_send_request(&self, to: impl Into<String>) -> SendRequest {
        SendRequest::new(self.id.to_string(), self.channel_id.clone(), to, self.content.clone())
            .with_media(self.media.clone())
    }
}

/// How a claimed row ended up after a send attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Sent {
        delivery_id: String,
        at: DateTime<Utc>,
    },
    Retry {
        error: String,
        next_attempt_at: DateTime<Utc>,
    },
    Failed {
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_request_carries_message_id() {
        let msg = OutboundMessage::pending("whatsapp", "c1", "hi", Utc::now())
            .with_media(Some(MediaRef::new("https://cdn/x.png")));
        let req = msg.to_send_request("+15550100");
        assert_eq!(req.message_id, msg.id.to_string());
        assert_eq!(req.to, "+15550100");
        assert!(req.media.is_some());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&MessageStatus::Dispatching).unwrap(), "\"dispatching\"");
        assert!(MessageStatus::Failed.is_terminal());
        assert!(!MessageStatus::Pending.is_terminal());
    }
}
