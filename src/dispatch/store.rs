use std::{
    collections::HashMap,
    fmt::Debug,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::{
    dispatch::{
        message::{Completion, MessageStatus, OutboundMessage},
        queue::ChannelLimits,
    },
    store::{SnapshotFile, StoreError},
};

pub type Outbox = Arc<dyn OutboundStore>;

/// Durable outbound queue rows. Every mutating call is atomic with respect
/// to the others, which is what makes the daily cap and claims safe with
/// several dispatchers running.
///
/// Channel ids are matched the way [`ChannelLimits`] matches them, so
/// `WA-Main` and `wa_main` share one budget.
#[async_trait]
pub trait OutboundStore: Send + Sync + Debug {
    /// Inserts `message` unless the channel already used `limit` sends since
    /// `day_start` (see [`OutboundStore::used_since`]). Returns whether it was inserted.
    async fn insert_within_cap(
        &self,
        message: OutboundMessage,
        day_start: DateTime<Utc>,
        limit: u32,
    ) -> Result<bool, StoreError>;

    /// Rows sent since `day_start` plus rows still pending or dispatching.
    async fn used_since(&self, channel_id: &str, day_start: DateTime<Utc>) -> Result<u32, StoreError>;

    async fn sent_since(&self, channel_id: &str, day_start: DateTime<Utc>) -> Result<u32, StoreError>;

    /// Moves up to `limit` due `pending` rows to `dispatching`, oldest
    /// schedule first, and returns them. Each returned row carries a fresh
    /// `claim_token`.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboundMessage>, StoreError>;

    /// Restarts the lease of a claim still held under `token`. Returns false
    /// if the claim expired or was taken over.
    async fn renew_claim(&self, id: Uuid, token: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Returns `dispatching` rows claimed before `claimed_before` to `pending`.
    async fn release_expired_claims(&self, claimed_before: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Applies the outcome of a send attempt to a row claimed under `token`.
    /// Returns false if the row is gone or the claim is no longer held.
    async fn complete(&self, id: Uuid, token: Uuid, completion: Completion) -> Result<bool, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<OutboundMessage>, StoreError>;

    /// Deletes the rows among `ids` that are still `pending`.
    async fn withdraw(&self, ids: &[Uuid]) -> Result<usize, StoreError>;

    /// Deletes `sent`/`failed` rows created before `older_than`.
    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn all(&self) -> Result<Vec<OutboundMessage>, StoreError>;
}

/// The row set both stores operate on.
#[derive(Debug, Clone, Default)]
struct Rows(HashMap<Uuid, OutboundMessage>);

impl Rows {
    fn usage(&self, channel_id: &str, day_start: DateTime<Utc>) -> u32 {
        let channel = ChannelLimits::normalize(channel_id);
        let n = self
            .0
            .values()
            .filter(|m| ChannelLimits::normalize(&m.channel_id) == channel)
            .filter(|m| match m.status {
                MessageStatus::Pending | MessageStatus::Dispatching => true,
                MessageStatus::Sent => m.sent_at.is_some_and(|at| at >= day_start),
                MessageStatus::Failed => false,
            })
            .count();
        u32::try_from(n).unwrap_or(u32::MAX)
    }

    fn sent_since(&self, channel_id: &str, day_start: DateTime<Utc>) -> u32 {
        let channel = ChannelLimits::normalize(channel_id);
        let n = self
            .0
            .values()
            .filter(|m| {
                m.status == MessageStatus::Sent
                    && m.sent_at.is_some_and(|at| at >= day_start)
                    && ChannelLimits::normalize(&m.channel_id) == channel
            })
            .count();
        u32::try_from(n).unwrap_or(u32::MAX)
    }

    fn insert_within_cap(&mut self, message: OutboundMessage, day_start: DateTime<Utc>, limit: u32) -> bool {
        if self.usage(&message.channel_id, day_start) >= limit {
            return false;
        }
        self.0.insert(message.id, message);
        true
    }

    fn claim_due(&mut self, now: DateTime<Utc>, limit: usize) -> Vec<OutboundMessage> {
        let mut due: Vec<(DateTime<Utc>, DateTime<Utc>, Uuid)> = self
            .0
            .values()
            .filter(|m| m.status == MessageStatus::Pending && m.scheduled_at <= now)
            .map(|m| (m.scheduled_at, m.created_at, m.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, _, id) in due {
            if let Some(row) = self.0.get_mut(&id) {
                row.status = MessageStatus::Dispatching;
                row.claimed_at = Some(now);
                row.claim_token = Some(Uuid::new_v4());
                claimed.push(row.clone());
            }
        }
        claimed
    }

    /// The row `id` if it is still claimed under `token`.
    fn held(&mut self, id: Uuid, token: Uuid) -> Option<&mut OutboundMessage> {
        let row = self.0.get_mut(&id)?;
        if row.status != MessageStatus::Dispatching || row.claim_token != Some(token) {
            debug!(message_id = %id, status = ?row.status, "claim no longer held");
            return None;
        }
        Some(row)
    }

    fn renew_claim(&mut self, id: Uuid, token: Uuid, now: DateTime<Utc>) -> bool {
        match self.held(id, token) {
            Some(row) => {
                row.claimed_at = Some(now);
                true
            }
            None => false,
        }
    }

    fn release_expired_claims(&mut self, claimed_before: DateTime<Utc>) -> usize {
        let mut released = 0;
        for row in self.0.values_mut() {
            if row.status == MessageStatus::Dispatching
                && row.claimed_at.is_none_or(|at| at < claimed_before)
            {
                row.status = MessageStatus::Pending;
                row.claimed_at = None;
                row.claim_token = None;
                released += 1;
            }
        }
        released
    }

    fn complete(&mut self, id: Uuid, token: Uuid, completion: Completion) -> bool {
        let Some(row) = self.held(id, token) else {
            return false;
        };
        row.claimed_at = None;
        row.claim_token = None;
        match completion {
            Completion::Sent { delivery_id, at } => {
                row.status = MessageStatus::Sent;
                row.sent_at = Some(at);
                row.delivery_id = Some(delivery_id);
            }
            Completion::Retry {
                error,
                next_attempt_at,
            } => {
                row.status = MessageStatus::Pending;
                row.retry_count += 1;
                row.scheduled_at = next_attempt_at;
                row.last_error = Some(error);
            }
            Completion::Failed { error } => {
                row.status = MessageStatus::Failed;
                row.retry_count += 1;
                row.last_error = Some(error);
            }
        }
        true
    }

    fn withdraw(&mut self, ids: &[Uuid]) -> usize {
        let before = self.0.len();
        self.0
            .retain(|id, m| !(m.status == MessageStatus::Pending && ids.contains(id)));
        before - self.0.len()
    }

    fn purge_terminal(&mut self, older_than: DateTime<Utc>) -> usize {
        let before = self.0.len();
        self.0
            .retain(|_, m| !(m.status.is_terminal() && m.created_at < older_than));
        before - self.0.len()
    }

    fn sorted(&self) -> Vec<OutboundMessage> {
        let mut rows: Vec<OutboundMessage> = self.0.values().cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rows
    }
}

#[derive(Debug, Default)]
pub struct InMemoryOutboundStore {
    rows: Mutex<Rows>,
}

impl InMemoryOutboundStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn from_rows(rows: Vec<OutboundMessage>) -> Self {
        Self {
            rows: Mutex::new(Rows(rows.into_iter().map(|m| (m.id, m)).collect())),
        }
    }

    fn rows(&self) -> Result<MutexGuard<'_, Rows>, StoreError> {
        self.rows.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl OutboundStore for InMemoryOutboundStore {
    async fn insert_within_cap(
        &self,
        message: OutboundMessage,
        day_start: DateTime<Utc>,
        limit: u32,
    ) -> Result<bool, StoreError> {
        Ok(self.rows()?.insert_within_cap(message, day_start, limit))
    }

    async fn used_since(&self, channel_id: &str, day_start: DateTime<Utc>) -> Result<u32, StoreError> {
        Ok(self.rows()?.usage(channel_id, day_start))
    }

    async fn sent_since(&self, channel_id: &str, day_start: DateTime<Utc>) -> Result<u32, StoreError> {
        Ok(self.rows()?.sent_since(channel_id, day_start))
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboundMessage>, StoreError> {
        Ok(self.rows()?.claim_due(now, limit))
    }

    async fn renew_claim(&self, id: Uuid, token: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self.rows()?.renew_claim(id, token, now))
    }

    async fn release_expired_claims(&self, claimed_before: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(self.rows()?.release_expired_claims(claimed_before))
    }

    async fn complete(&self, id: Uuid, token: Uuid, completion: Completion) -> Result<bool, StoreError> {
        Ok(self.rows()?.complete(id, token, completion))
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboundMessage>, StoreError> {
        Ok(self.rows()?.0.get(&id).cloned())
    }

    async fn withdraw(&self, ids: &[Uuid]) -> Result<usize, StoreError> {
        Ok(self.rows()?.withdraw(ids))
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(self.rows()?.purge_terminal(older_than))
    }

    async fn all(&self) -> Result<Vec<OutboundMessage>, StoreError> {
        Ok(self.rows()?.sorted())
    }
}

/// [`InMemoryOutboundStore`] mirrored to a JSON snapshot after every write.
///
/// Writes are applied to a copy of the rows; the copy replaces the live rows
/// only once the snapshot is on disk, so a failed save changes nothing.
#[derive(Debug)]
pub struct FileOutboundStore {
    inner: InMemoryOutboundStore,
    file: SnapshotFile,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileOutboundStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>, StoreError> {
        let file = SnapshotFile::new(path.as_ref());
        let rows: Vec<OutboundMessage> = file.load()?;
        debug!(path = %file.path().display(), rows = rows.len(), "loaded outbound queue");
        Ok(Arc::new(Self {
            inner: InMemoryOutboundStore::from_rows(rows),
            file,
            write_lock: tokio::sync::Mutex::new(()),
        }))
    }

    async fn write<T>(
        &self,
        apply: impl FnOnce(&mut Rows) -> T,
        changed: impl FnOnce(&T) -> bool,
    ) -> Result<T, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut next = self.inner.rows()?.clone();
        let out = apply(&mut next);
        if changed(&out) {
            self.file.save(&next.sorted())?;
            *self.inner.rows()? = next;
        }
        Ok(out)
    }
}

#[async_trait]
impl OutboundStore for FileOutboundStore {
    async fn insert_within_cap(
        &self,
        message: OutboundMessage,
        day_start: DateTime<Utc>,
        limit: u32,
    ) -> Result<bool, StoreError> {
        self.write(|rows| rows.insert_within_cap(message, day_start, limit), |inserted| *inserted)
            .await
    }

    async fn used_since(&self, channel_id: &str, day_start: DateTime<Utc>) -> Result<u32, StoreError> {
        self.inner.used_since(channel_id, day_start).await
    }

    async fn sent_since(&self, channel_id: &str, day_start: DateTime<Utc>) -> Result<u32, StoreError> {
        self.inner.sent_since(channel_id, day_start).await
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboundMessage>, StoreError> {
        self.write(|rows| rows.claim_due(now, limit), |claimed| !claimed.is_empty())
            .await
    }

    async fn renew_claim(&self, id: Uuid, token: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.write(|rows| rows.renew_claim(id, token, now), |renewed| *renewed)
            .await
    }

    async fn release_expired_claims(&self, claimed_before: DateTime<Utc>) -> Result<usize, StoreError> {
        self.write(|rows| rows.release_expired_claims(claimed_before), |n| *n > 0)
            .await
    }

    async fn complete(&self, id: Uuid, token: Uuid, completion: Completion) -> Result<bool, StoreError> {
        self.write(|rows| rows.complete(id, token, completion), |applied| *applied)
            .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboundMessage>, StoreError> {
        self.inner.get(id).await
    }

    async fn withdraw(&self, ids: &[Uuid]) -> Result<usize, StoreError> {
        self.write(|rows| rows.withdraw(ids), |n| *n > 0).await
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        self.write(|rows| rows.purge_terminal(older_than), |n| *n > 0).await
    }

    async fn all(&self) -> Result<Vec<OutboundMessage>, StoreError> {
        self.inner.all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn msg(channel: &str, scheduled_at: DateTime<Utc>) -> OutboundMessage {
        OutboundMessage::pending(channel, "c1", "hello", scheduled_at)
    }

    fn token(row: &OutboundMessage) -> Uuid {
        row.claim_token.unwrap()
    }

    #[tokio::test]
    async fn test_cap_counts_pending_and_sent_today() {
        let store = InMemoryOutboundStore::new();
        let day = Utc::now() - Duration::hours(1);
        assert!(store.insert_within_cap(msg("wa", Utc::now()), day, 2).await.unwrap());
        assert!(store.insert_within_cap(msg("wa", Utc::now()), day, 2).await.unwrap());
        assert!(!store.insert_within_cap(msg("wa", Utc::now()), day, 2).await.unwrap());
        // other channels have their own budget
        assert!(store.insert_within_cap(msg("ig", Utc::now()), day, 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_cap_is_shared_by_spellings_of_one_channel() {
        let store = InMemoryOutboundStore::new();
        let now = Utc::now();
        let day = now - Duration::hours(1);
        assert!(store.insert_within_cap(msg("WA-Main", now), day, 2).await.unwrap());
        assert!(store.insert_within_cap(msg("wa_main", now), day, 2).await.unwrap());
        assert!(!store.insert_within_cap(msg("wa-main", now), day, 2).await.unwrap());
        assert_eq!(store.used_since("Wa_Main", day).await.unwrap(), 2);

        let claimed = store.claim_due(now, 1).await.unwrap();
        let sent = Completion::Sent {
            delivery_id: "d1".into(),
            at: now,
        };
        store.complete(claimed[0].id, token(&claimed[0]), sent).await.unwrap();
        assert_eq!(store.sent_since("wa-MAIN", day).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_and_ordered() {
        let store = InMemoryOutboundStore::new();
        let now = Utc::now();
        let day = now - Duration::hours(1);
        let late = msg("wa", now - Duration::seconds(1));
        let early = msg("wa", now - Duration::seconds(10));
        let future = msg("wa", now + Duration::minutes(5));
        for m in [late.clone(), early.clone(), future] {
            store.insert_within_cap(m, day, 10).await.unwrap();
        }

        let first = store.claim_due(now, 10).await.unwrap();
        assert_eq!(first.iter().map(|m| m.id).collect::<Vec<_>>(), vec![early.id, late.id]);
        assert!(first.iter().all(|m| m.status == MessageStatus::Dispatching));
        assert_ne!(first[0].claim_token, first[1].claim_token);

        let second = store.claim_due(now, 10).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_retry_then_fail_counts_attempts() {
        let store = InMemoryOutboundStore::new();
        let now = Utc::now();
        let m = msg("wa", now);
        store.insert_within_cap(m.clone(), now - Duration::hours(1), 10).await.unwrap();

        let claim = store.claim_due(now, 1).await.unwrap().remove(0);
        let retry = Completion::Retry {
            error: "boom".into(),
            next_attempt_at: now,
        };
        assert!(store.complete(m.id, token(&claim), retry.clone()).await.unwrap());
        // a second completion without a claim is ignored
        assert!(!store.complete(m.id, token(&claim), retry).await.unwrap());

        let claim = store.claim_due(now, 1).await.unwrap().remove(0);
        store
            .complete(m.id, token(&claim), Completion::Failed { error: "boom".into() })
            .await
            .unwrap();
        let row = store.get(m.id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Failed);
        assert_eq!(row.retry_count, 2);
        assert_eq!(row.last_error.as_deref(), Some("boom"));
        assert_eq!(row.claim_token, None);
    }

    #[tokio::test]
    async fn test_expired_claims_return_to_pending() {
        let store = InMemoryOutboundStore::new();
        let now = Utc::now();
        let m = msg("wa", now);
        store.insert_within_cap(m.clone(), now - Duration::hours(1), 10).await.unwrap();
        store.claim_due(now, 1).await.unwrap();

        assert_eq!(store.release_expired_claims(now - Duration::minutes(1)).await.unwrap(), 0);
        assert_eq!(store.release_expired_claims(now + Duration::seconds(1)).await.unwrap(), 1);
        let row = store.get(m.id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Pending);
        assert_eq!(row.claim_token, None);
    }

    #[tokio::test]
    async fn test_stale_claim_cannot_complete_or_renew_a_new_claim() {
        let store = InMemoryOutboundStore::new();
        let now = Utc::now();
        let m = msg("wa", now);
        store.insert_within_cap(m.clone(), now - Duration::hours(1), 10).await.unwrap();

        let stale = store.claim_due(now, 1).await.unwrap().remove(0);
        store.release_expired_claims(now + Duration::seconds(1)).await.unwrap();
        let fresh = store.claim_due(now, 1).await.unwrap().remove(0);

        let sent = Completion::Sent {
            delivery_id: "late".into(),
            at: now,
        };
        assert!(!store.renew_claim(m.id, token(&stale), now).await.unwrap());
        assert!(!store.complete(m.id, token(&stale), sent.clone()).await.unwrap());
        assert_eq!(store.get(m.id).await.unwrap().unwrap().status, MessageStatus::Dispatching);

        assert!(store.renew_claim(m.id, token(&fresh), now + Duration::seconds(5)).await.unwrap());
        assert_eq!(store.release_expired_claims(now + Duration::seconds(2)).await.unwrap(), 0);
        assert!(store.complete(m.id, token(&fresh), sent).await.unwrap());
    }

    #[tokio::test]
    async fn test_withdraw_skips_claimed_rows() {
        let store = InMemoryOutboundStore::new();
        let now = Utc::now();
        let day = now - Duration::hours(1);
        let claimed = msg("wa", now - Duration::seconds(1));
        let waiting = msg("wa", now + Duration::hours(1));
        store.insert_within_cap(claimed.clone(), day, 2).await.unwrap();
        store.insert_within_cap(waiting.clone(), day, 2).await.unwrap();
        store.claim_due(now, 1).await.unwrap();

        assert_eq!(store.withdraw(&[claimed.id, waiting.id]).await.unwrap(), 1);
        assert!(store.get(waiting.id).await.unwrap().is_none());
        assert!(store.get(claimed.id).await.unwrap().is_some());
        // the withdrawn row no longer counts against the cap
        assert_eq!(store.used_since("wa", day).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_keeps_pending_rows() {
        let store = InMemoryOutboundStore::new();
        let now = Utc::now();
        let sent = msg("wa", now);
        let waiting = msg("wa", now + Duration::hours(1));
        store.insert_within_cap(sent.clone(), now - Duration::hours(1), 10).await.unwrap();
        store.insert_within_cap(waiting.clone(), now - Duration::hours(1), 10).await.unwrap();
        let claim = store.claim_due(now, 1).await.unwrap().remove(0);
        store
            .complete(
                sent.id,
                token(&claim),
                Completion::Sent {
                    delivery_id: "d1".into(),
                    at: now,
                },
            )
            .await
            .unwrap();

        let purged = store.purge_terminal(now + Duration::days(1)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.get(waiting.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_store_reloads_queue() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outbox.json");
        let m = msg("wa", Utc::now());
        {
            let store = FileOutboundStore::open(&path).unwrap();
            store
                .insert_within_cap(m.clone(), Utc::now() - Duration::hours(1), 10)
                .await
                .unwrap();
        }
        let reopened = FileOutboundStore::open(&path).unwrap();
        assert_eq!(reopened.get(m.id).await.unwrap().map(|r| r.content), Some("hello".into()));
    }

    #[tokio::test]
    async fn test_failed_save_leaves_queue_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outbox.json");
        let store = FileOutboundStore::open(&path).unwrap();
        let now = Utc::now();
        let day = now - Duration::hours(1);
        let queued = msg("wa", now);
        store.insert_within_cap(queued.clone(), day, 10).await.unwrap();

        // a directory in place of the snapshot makes every save fail
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let rejected = msg("wa", now);
        assert!(store.insert_within_cap(rejected.clone(), day, 10).await.is_err());
        assert!(store.get(rejected.id).await.unwrap().is_none());

        assert!(store.claim_due(now, 10).await.is_err());
        let row = store.get(queued.id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Pending);
        assert_eq!(row.claim_token, None);
        assert_eq!(store.used_since("wa", day).await.unwrap(), 1);
    }
}
