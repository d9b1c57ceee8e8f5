use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reference to media stored elsewhere; the transport fetches it by url.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaRef {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

impl MediaRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mime_type: None,
            caption: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

/// One outbound send handed to a transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendRequest {
    pub message_id: String,              // Queue entry id, stable across retries
    pub channel_id: String,              // Which connected account sends it
    pub to: String,                      // Channel address, e.g. a phone number
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
}

impl SendRequest {
    pub fn new(
        message_id: impl Into<String>,
        channel_id: impl Into<String>,
        to: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            channel_id: channel_id.into(),
            to: to.into(),
            content: content.into(),
            media: None,
        }
    }

    pub fn with_media(mut self, media: Option<MediaRef>) -> Self {
        self.media = media;
        self
    }
}

/// What a transport hands back when the platform accepted the message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryReceipt {
    pub delivery_id: String,
    pub accepted_at: DateTime<Utc>,
}

impl DeliveryReceipt {
    pub fn new(delivery_id: impl Into<String>) -> Self {
        Self {
            delivery_id: delivery_id.into(),
            accepted_at: Utc::now(),
        }
    }

    /// Receipt with a generated id, for transports that do not return one.
    pub fn generated() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

/// A text message a contact sent us.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundMessage {
    pub id: String,
    pub organization_id: String,
    pub channel_id: String,
    pub contact_id: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        organization_id: impl Into<String>,
        channel_id: impl Into<String>,
        contact_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: organization_id.into(),
            channel_id: channel_id.into(),
            contact_id: contact_id.into(),
            text: text.into(),
            received_at: Utc::now(),
        }
    }
}

/// A non-text occurrence for a contact (e.g. "contact_created", "order_paid").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundEvent {
    pub organization_id: String,
    pub channel_id: String,
    pub contact_id: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_payload: Option<Value>,
}
