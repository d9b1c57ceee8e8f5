use std::collections::HashMap;

use channel_plugin::MediaRef;
use chrono::{TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    dispatch::{humanize::HumanizeSettings, message::OutboundMessage, store::Outbox},
    store::StoreError,
    util::{day_start, to_delta},
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("channel `{channel_id}` reached its daily limit of {limit} messages")]
    CapacityExceeded { channel_id: String, limit: u32 },
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Daily send limits: one default plus per-channel overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLimits {
    default_limit: u32,
    overrides: HashMap<String, u32>,
}

impl ChannelLimits {
    pub fn new(default_limit: u32) -> Self {
        Self {
            default_limit,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, channel_id: &str, limit: u32) -> Self {
        self.overrides.insert(Self::normalize(channel_id), limit);
        self
    }

    /// Channel ids compare case-insensitively with `-` and `_` treated alike,
    /// so `CHATFLOW_DAILY_LIMIT_WA_MAIN` matches channel `wa-main`.
    pub fn normalize(channel_id: &str) -> String {
        channel_id.trim().to_lowercase().replace('-', "_")
    }

    pub fn limit_for(&self, channel_id: &str) -> u32 {
        self.overrides
            .get(&Self::normalize(channel_id))
            .copied()
            .unwrap_or(self.default_limit)
    }

    pub fn default_limit(&self) -> u32 {
        self.default_limit
    }
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self::new(1_000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    pub sent_today: u32,
    /// Enqueued and not yet sent; these already count against the cap.
    pub queued: u32,
    pub remaining_today: u32,
    pub limit: u32,
}

/// Producer side of the outbound queue: admission against the daily cap and
/// humanized scheduling.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    store: Outbox,
    humanize: HumanizeSettings,
    limits: ChannelLimits,
}

impl DispatchQueue {
    pub fn new(store: Outbox, humanize: HumanizeSettings, limits: ChannelLimits) -> Self {
        Self {
            store,
            humanize,
            limits,
        }
    }

    pub fn store(&self) -> &Outbox {
        &self.store
    }

    pub fn limits(&self) -> &ChannelLimits {
        &self.limits
    }

    /// Queue a send. Fails with `CapacityExceeded` once the channel used up
    /// today's budget; nothing is carried over to tomorrow.
    pub async fn enqueue(
        &self,
        channel_id: &str,
        contact_id: &str,
        content: &str,
        media: Option<MediaRef>,
    ) -> Result<OutboundMessage, DispatchError> {
        self.submit(channel_id, contact_id, content, media, None).await
    }

    /// Same as [`DispatchQueue::enqueue`], tagging the row with the flow that produced it.
    pub async fn enqueue_for_flow(
        &self,
        flow_id: &str,
        channel_id: &str,
        contact_id: &str,
        content: &str,
        media: Option<MediaRef>,
    ) -> Result<OutboundMessage, DispatchError> {
        self.submit(channel_id, contact_id, content, media, Some(flow_id.to_string()))
            .await
    }

    #[instrument(skip(self, content, media), fields(len = content.len()))]
    async fn submit(
        &self,
        channel_id: &str,
        contact_id: &str,
        content: &str,
        media: Option<MediaRef>,
        flow_id: Option<String>,
    ) -> Result<OutboundMessage, DispatchError> {
        if channel_id.trim().is_empty() {
            return Err(DispatchError::InvalidMessage("channel id is empty".into()));
        }
        if contact_id.trim().is_empty() {
            return Err(DispatchError::InvalidMessage("contact id is empty".into()));
        }
        if content.trim().is_empty() && media.is_none() {
            return Err(DispatchError::InvalidMessage("message has neither text nor media".into()));
        }

        let delay = {
            let mut rng = rand::rng();
            self.humanize.delay_for(content, &mut rng)
        };
        let now = Utc::now();
        let message = OutboundMessage::pending(channel_id, contact_id, content, now + to_delta(delay))
            .with_media(media)
            .with_flow(flow_id);

        let limit = self.limits.limit_for(channel_id);
        if !self
            .store
            .insert_within_cap(message.clone(), day_start(now), limit)
            .await?
        {
            warn!(channel_id, limit, "daily send limit reached");
            return Err(DispatchError::CapacityExceeded {
                channel_id: channel_id.to_string(),
                limit,
            });
        }

        debug!(
            target: "dispatch",
            message_id = %message.id,
            channel_id,
            contact_id,
            delay_ms = delay.as_millis() as u64,
            "message queued"
        );
        Ok(message)
    }

    pub async fn daily_stats(&self, channel_id: &str) -> Result<DailyStats, DispatchError> {
        let today = day_start(Utc::now());
        let limit = self.limits.limit_for(channel_id);
        let sent_today = self.store.sent_since(channel_id, today).await?;
        let used = self.store.used_since(channel_id, today).await?;
        Ok(DailyStats {
            sent_today,
            queued: used.saturating_sub(sent_today),
            remaining_today: limit.saturating_sub(used),
            limit,
        })
    }

    /// Drop queued sends no dispatcher has claimed yet. Returns how many
    /// were removed.
    pub async fn withdraw(&self, ids: &[Uuid]) -> Result<usize, DispatchError> {
        Ok(self.store.withdraw(ids).await?)
    }

    /// Purge sent and failed rows older than the retention window.
    pub async fn cleanup(&self, older_than_days: u32) -> Result<usize, DispatchError> {
        let cutoff = Utc::now() - TimeDelta::days(i64::from(older_than_days));
        let purged = self.store.purge_terminal(cutoff).await?;
        if purged > 0 {
            info!(purged, older_than_days, "outbound queue cleaned up");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{message::MessageStatus, store::InMemoryOutboundStore};

    fn instant() -> HumanizeSettings {
        HumanizeSettings {
            min_delay_ms: 0,
            max_delay_ms: 0,
            typing_chars_per_second: 0.0,
        }
    }

    #[tokio::test]
    async fn test_enqueue_schedules_with_humanized_delay() {
        let queue = DispatchQueue::new(
            InMemoryOutboundStore::new(),
            HumanizeSettings::default(),
            ChannelLimits::default(),
        );
        let before = Utc::now();
        let msg = queue.enqueue("wa", "c1", &"a".repeat(100), None).await.unwrap();
        let delay = (msg.scheduled_at - before).num_milliseconds();
        assert!((9_600..=18_100).contains(&delay), "delay {}", delay);
        assert_eq!(msg.status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_when_cap_reached() {
        let queue = DispatchQueue::new(
            InMemoryOutboundStore::new(),
            instant(),
            ChannelLimits::new(5).with_override("wa-main", 2),
        );
        queue.enqueue("wa-main", "c1", "one", None).await.unwrap();
        queue.enqueue("wa-main", "c2", "two", None).await.unwrap();
        let err = queue.enqueue("wa-main", "c3", "three", None).await.unwrap_err();
        assert_eq!(
            err,
            DispatchError::CapacityExceeded {
                channel_id: "wa-main".into(),
                limit: 2
            }
        );

        let stats = queue.daily_stats("wa-main").await.unwrap();
        assert_eq!(stats.remaining_today, 0);
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.sent_today, 0);
    }

    #[tokio::test]
    async fn test_empty_message_is_invalid() {
        let queue = DispatchQueue::new(InMemoryOutboundStore::new(), instant(), ChannelLimits::default());
        let err = queue.enqueue("wa", "c1", "   ", None).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidMessage(_)));

        let media_only = queue
            .enqueue("wa", "c1", "", Some(MediaRef::new("https://cdn/x.png")))
            .await;
        assert!(media_only.is_ok());
    }

    #[test]
    fn test_limit_overrides_are_normalized() {
        let limits = ChannelLimits::new(100).with_override("WA_MAIN", 10);
        assert_eq!(limits.limit_for("wa-main"), 10);
        assert_eq!(limits.limit_for("instagram"), 100);
    }
}
