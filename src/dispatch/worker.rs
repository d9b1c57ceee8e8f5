use std::{sync::Arc, time::{Duration, Instant}};

use channel_plugin::{DeliveryReceipt, TransportError};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    channel::ChannelManager,
    collab::{ContactDirectory, MessageHistory},
    dispatch::{
        message::{Completion, OutboundMessage},
        metrics::DispatchMetrics,
        queue::DispatchError,
        store::Outbox,
    },
    util::to_delta,
};

#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherSettings {
    pub interval: Duration,
    pub batch_size: usize,
    /// Total send attempts per message, first one included.
    pub max_attempts: u32,
    /// Fixed wait before each retry.
    pub retry_backoff: Duration,
    /// Claims older than this are considered abandoned by a dead worker.
    /// Never shorter than twice `send_timeout`; see [`DispatcherSettings::lease`].
    pub claim_lease: Duration,
    pub send_timeout: Duration,
}

impl DispatcherSettings {
    /// The lease actually applied. A claim is renewed right before each
    /// send, so it only has to outlive one send attempt.
    pub fn lease(&self) -> Duration {
        self.claim_lease.max(self.send_timeout.saturating_mul(2))
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2_000),
            batch_size: 50,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(300),
            claim_lease: Duration::from_secs(120),
            send_timeout: Duration::from_secs(30),
        }
    }
}

/// What one dispatch pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub released: usize,
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    /// Claims taken over by another worker before this one could finish.
    pub lost: usize,
    /// Rows whose outcome could not be stored; they are retried once their
    /// claim expires.
    pub errors: usize,
}

/// Consumer side of the outbound queue.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    store: Outbox,
    channels: ChannelManager,
    contacts: Arc<dyn ContactDirectory>,
    history: Arc<dyn MessageHistory>,
    settings: DispatcherSettings,
    metrics: DispatchMetrics,
}

impl Dispatcher {
    pub fn new(
        store: Outbox,
        channels: ChannelManager,
        contacts: Arc<dyn ContactDirectory>,
        history: Arc<dyn MessageHistory>,
        settings: DispatcherSettings,
    ) -> Self {
        if settings.lease() > settings.claim_lease {
            warn!(
                claim_lease_ms = settings.claim_lease.as_millis() as u64,
                lease_ms = settings.lease().as_millis() as u64,
                "claim lease shorter than two send timeouts, raised"
            );
        }
        Self {
            store,
            channels,
            contacts,
            history,
            settings,
            metrics: DispatchMetrics::new(),
        }
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// Recover stale claims, then claim and send one batch of due messages.
    #[instrument(skip(self))]
    pub async fn dispatch_due(&self) -> Result<DispatchReport, DispatchError> {
        let now = Utc::now();
        let mut report = DispatchReport {
            released: self
                .store
                .release_expired_claims(now - to_delta(self.settings.lease()))
                .await?,
            ..Default::default()
        };
        if report.released > 0 {
            warn!(released = report.released, "reclaimed expired dispatch claims");
        }

        let batch = self.store.claim_due(now, self.settings.batch_size).await?;
        report.claimed = batch.len();

        for message in batch {
            let message_id = message.id;
            match self.deliver(message).await {
                Ok(Some(Completion::Sent { .. })) => report.sent += 1,
                Ok(Some(Completion::Retry { .. })) => report.retried += 1,
                Ok(Some(Completion::Failed { .. })) => report.failed += 1,
                Ok(None) => report.lost += 1,
                Err(e) => {
                    report.errors += 1;
                    error!(%message_id, error = %e, "could not record dispatch outcome");
                }
            }
        }
        if report.claimed > 0 {
            debug!(?report, "dispatch pass finished");
        }
        Ok(report)
    }

    /// Sends one claimed row and stores the outcome. `None` means the claim
    /// was no longer ours.
    async fn deliver(&self, message: OutboundMessage) -> Result<Option<Completion>, DispatchError> {
        let Some(token) = message.claim_token else {
            warn!(message_id = %message.id, "row handed out without a claim token");
            return Ok(None);
        };
        if !self.store.renew_claim(message.id, token, Utc::now()).await? {
            warn!(message_id = %message.id, "claim expired before send, skipped");
            return Ok(None);
        }

        // the whole attempt fits in the lease, address lookup included
        let started = Instant::now();
        let timeout = self.settings.send_timeout;
        let attempted = match tokio::time::timeout(timeout, self.attempt(&message)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
        };
        let completion = match attempted {
            Ok(receipt) => {
                self.metrics
                    .sent(&message.channel_id, started.elapsed().as_secs_f64() * 1_000.0);
                info!(
                    target: "dispatch",
                    message_id = %message.id,
                    channel_id = %message.channel_id,
                    delivery_id = %receipt.delivery_id,
                    attempt = message.retry_count + 1,
                    "message sent"
                );
                Completion::Sent {
                    delivery_id: receipt.delivery_id,
                    at: receipt.accepted_at,
                }
            }
            Err(err) => self.on_failure(&message, err),
        };

        if !self.store.complete(message.id, token, completion.clone()).await? {
            warn!(message_id = %message.id, "claim lost before completion was recorded");
            return Ok(None);
        }

        if matches!(completion, Completion::Sent { .. }) {
            self.record_history(&message).await;
        }
        Ok(Some(completion))
    }

    async fn record_history(&self, message: &OutboundMessage) {
        match self.store.get(message.id).await {
            Ok(Some(stored)) => {
                if let Err(e) = self.history.record_outbound(&stored).await {
                    warn!(message_id = %message.id, error = %e, "could not record message history");
                }
            }
            Ok(None) => debug!(message_id = %message.id, "sent row purged before history was recorded"),
            Err(e) => warn!(message_id = %message.id, error = %e, "could not load sent row for history"),
        }
    }

    async fn attempt(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, TransportError> {
        let transport = self
            .channels
            .transport(&message.channel_id)
            .ok_or_else(|| TransportError::NotConnected(message.channel_id.clone()))?;
        let to = self
            .contacts
            .address(&message.contact_id, &message.channel_id)
            .await
            .map_err(|e| TransportError::Failed(format!("no address for contact: {}", e)))?;

        transport.send(message.to_send_request(to)).await
    }

    fn on_failure(&self, message: &OutboundMessage, err: TransportError) -> Completion {
        let attempts = message.retry_count + 1;
        if attempts < self.settings.max_attempts {
            self.metrics.retried(&message.channel_id);
            warn!(
                target: "dispatch",
                message_id = %message.id,
                channel_id = %message.channel_id,
                attempt = attempts,
                error = %err,
                "send failed, will retry"
            );
            Completion::Retry {
                error: err.to_string(),
                next_attempt_at: Utc::now() + to_delta(self.settings.retry_backoff),
            }
        } else {
            self.metrics.failed(&message.channel_id);
            error!(
                target: "dispatch",
                message_id = %message.id,
                channel_id = %message.channel_id,
                attempts,
                error = %err,
                "send failed permanently"
            );
            Completion::Failed {
                error: err.to_string(),
            }
        }
    }

    /// Poll until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval_ms = self.settings.interval.as_millis() as u64, "dispatcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {
                    if let Err(e) = self.dispatch_due().await {
                        error!(error = %e, "dispatch pass failed");
                    }
                }
            }
        }
        info!("dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collab::{ContactIdAddress, MemoryCollaborators},
        dispatch::{
            humanize::HumanizeSettings,
            message::MessageStatus,
            queue::{ChannelLimits, DispatchQueue},
            store::{InMemoryOutboundStore, OutboundStore},
        },
        store::StoreError,
    };
    use async_trait::async_trait;
    use channel_plugin::{
        ChannelTransport, SendRequest,
        plugin_test_util::{FlakyTransport, RecordingTransport},
    };
    use chrono::DateTime;
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };
    use uuid::Uuid;

    /// Takes `delay` to accept each send.
    struct SlowTransport {
        delay: Duration,
        sends: AtomicUsize,
    }

    impl SlowTransport {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                sends: AtomicUsize::new(0),
            })
        }

        fn sends(&self) -> usize {
            self.sends.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChannelTransport for SlowTransport {
        fn name(&self) -> String {
            "slow".to_string()
        }

        async fn send(&self, request: SendRequest) -> Result<DeliveryReceipt, TransportError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(DeliveryReceipt::new(format!("dlv-{}", request.message_id)))
        }
    }

    /// Outbox whose `complete` fails for one row.
    #[derive(Debug)]
    struct BrokenCompletion {
        inner: Arc<InMemoryOutboundStore>,
        broken: Mutex<Option<Uuid>>,
    }

    #[async_trait]
    impl OutboundStore for BrokenCompletion {
        async fn insert_within_cap(
            &self,
            message: OutboundMessage,
            day_start: DateTime<Utc>,
            limit: u32,
        ) -> Result<bool, StoreError> {
            self.inner.insert_within_cap(message, day_start, limit).await
        }

        async fn used_since(&self, channel_id: &str, day_start: DateTime<Utc>) -> Result<u32, StoreError> {
            self.inner.used_since(channel_id, day_start).await
        }

        async fn sent_since(&self, channel_id: &str, day_start: DateTime<Utc>) -> Result<u32, StoreError> {
            self.inner.sent_since(channel_id, day_start).await
        }

        async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboundMessage>, StoreError> {
            self.inner.claim_due(now, limit).await
        }

        async fn renew_claim(&self, id: Uuid, token: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
            self.inner.renew_claim(id, token, now).await
        }

        async fn release_expired_claims(&self, claimed_before: DateTime<Utc>) -> Result<usize, StoreError> {
            self.inner.release_expired_claims(claimed_before).await
        }

        async fn complete(&self, id: Uuid, token: Uuid, completion: Completion) -> Result<bool, StoreError> {
            if *self.broken.lock().unwrap() == Some(id) {
                return Err(StoreError::Io("disk full".into()));
            }
            self.inner.complete(id, token, completion).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<OutboundMessage>, StoreError> {
            self.inner.get(id).await
        }

        async fn withdraw(&self, ids: &[Uuid]) -> Result<usize, StoreError> {
            self.inner.withdraw(ids).await
        }

        async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
            self.inner.purge_terminal(older_than).await
        }

        async fn all(&self) -> Result<Vec<OutboundMessage>, StoreError> {
            self.inner.all().await
        }
    }

    fn instant() -> HumanizeSettings {
        HumanizeSettings {
            min_delay_ms: 0,
            max_delay_ms: 0,
            typing_chars_per_second: 0.0,
        }
    }

    fn settings() -> DispatcherSettings {
        DispatcherSettings {
            retry_backoff: Duration::ZERO,
            ..Default::default()
        }
    }

    fn setup(
        limit: u32,
        channels: ChannelManager,
    ) -> (DispatchQueue, Dispatcher, Arc<MemoryCollaborators>) {
        let store: Outbox = InMemoryOutboundStore::new();
        let recorder = MemoryCollaborators::new();
        let queue = DispatchQueue::new(store.clone(), instant(), ChannelLimits::new(limit));
        let dispatcher = Dispatcher::new(
            store,
            channels,
            Arc::new(ContactIdAddress),
            recorder.clone(),
            settings(),
        );
        (queue, dispatcher, recorder)
    }

    #[tokio::test]
    async fn test_due_messages_are_sent_and_recorded() {
        let channels = ChannelManager::new();
        let transport = RecordingTransport::new();
        channels.register("wa", transport.clone());
        let (queue, dispatcher, recorder) = setup(10, channels);

        let msg = queue.enqueue("wa", "+15550100", "hello", None).await.unwrap();
        let report = dispatcher.dispatch_due().await.unwrap();
        assert_eq!(report.sent, 1);

        let row = queue.store().get(msg.id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Sent);
        assert_eq!(row.delivery_id, Some(format!("dlv-{}", msg.id)));
        assert_eq!(transport.sent()[0].to, "+15550100");
        assert_eq!(recorder.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_always_failing_transport_gets_exactly_three_attempts() {
        let channels = ChannelManager::new();
        let transport = FlakyTransport::always_failing();
        channels.register("wa", transport.clone());
        let (queue, dispatcher, _) = setup(10, channels);

        let msg = queue.enqueue("wa", "c1", "hello", None).await.unwrap();
        for _ in 0..5 {
            dispatcher.dispatch_due().await.unwrap();
        }

        assert_eq!(transport.attempts(), 3);
        let row = queue.store().get(msg.id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Failed);
        assert_eq!(row.retry_count, 3);
        assert!(row.last_error.is_some());
    }

    #[tokio::test]
    async fn test_flaky_transport_succeeds_on_retry() {
        let channels = ChannelManager::new();
        channels.register("wa", FlakyTransport::new(1));
        let (queue, dispatcher, _) = setup(10, channels);

        let msg = queue.enqueue("wa", "c1", "hello", None).await.unwrap();
        let first = dispatcher.dispatch_due().await.unwrap();
        assert_eq!(first.retried, 1);
        let second = dispatcher.dispatch_due().await.unwrap();
        assert_eq!(second.sent, 1);

        let row = queue.store().get(msg.id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Sent);
        assert_eq!(row.retry_count, 1);
    }

    #[tokio::test]
    async fn test_retry_waits_for_backoff() {
        let channels = ChannelManager::new();
        let transport = FlakyTransport::always_failing();
        channels.register("wa", transport.clone());
        let store: Outbox = InMemoryOutboundStore::new();
        let queue = DispatchQueue::new(store.clone(), instant(), ChannelLimits::new(10));
        let dispatcher = Dispatcher::new(
            store,
            channels,
            Arc::new(ContactIdAddress),
            MemoryCollaborators::new(),
            DispatcherSettings::default(),
        );

        queue.enqueue("wa", "c1", "hello", None).await.unwrap();
        dispatcher.dispatch_due().await.unwrap();
        dispatcher.dispatch_due().await.unwrap();
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test]
    async fn test_unknown_channel_counts_as_failed_attempt() {
        let (queue, dispatcher, _) = setup(10, ChannelManager::new());
        let msg = queue.enqueue("sms", "c1", "hello", None).await.unwrap();
        let report = dispatcher.dispatch_due().await.unwrap();
        assert_eq!(report.retried, 1);
        let row = queue.store().get(msg.id).await.unwrap().unwrap();
        assert!(row.last_error.unwrap_or_default().contains("sms"));
    }

    #[tokio::test]
    async fn test_daily_cap_after_successful_sends() {
        let channels = ChannelManager::new();
        channels.register("wa", RecordingTransport::new());
        let (queue, dispatcher, _) = setup(2, channels);

        queue.enqueue("wa", "c1", "one", None).await.unwrap();
        queue.enqueue("wa", "c1", "two", None).await.unwrap();
        assert_eq!(dispatcher.dispatch_due().await.unwrap().sent, 2);

        let stats = queue.daily_stats("wa").await.unwrap();
        assert_eq!(stats.sent_today, 2);
        assert_eq!(stats.remaining_today, 0);
        assert!(matches!(
            queue.enqueue("wa", "c1", "three", None).await,
            Err(DispatchError::CapacityExceeded { limit: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (_, dispatcher, _) = setup(10, ChannelManager::new());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(dispatcher).run(cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_two_dispatchers_send_a_slow_message_once() {
        let channels = ChannelManager::new();
        let transport = SlowTransport::new(Duration::from_millis(300));
        channels.register("wa", transport.clone());
        let store: Outbox = InMemoryOutboundStore::new();
        let queue = DispatchQueue::new(store.clone(), instant(), ChannelLimits::new(10));
        let short_lease = DispatcherSettings {
            claim_lease: Duration::from_millis(100),
            send_timeout: Duration::from_millis(500),
            ..settings()
        };
        assert_eq!(short_lease.lease(), Duration::from_secs(1));
        let worker = |store: Outbox| {
            Dispatcher::new(
                store,
                channels.clone(),
                Arc::new(ContactIdAddress),
                MemoryCollaborators::new(),
                short_lease.clone(),
            )
        };
        let a = worker(store.clone());
        let b = worker(store.clone());

        let msg = queue.enqueue("wa", "c1", "hello", None).await.unwrap();
        let first = tokio::spawn(async move { a.dispatch_due().await });
        tokio::time::sleep(Duration::from_millis(150)).await;
        let second = b.dispatch_due().await.unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(transport.sends(), 1);
        assert_eq!(first.sent, 1);
        assert_eq!(second.released, 0);
        assert_eq!(second.claimed, 0);
        assert_eq!(store.get(msg.id).await.unwrap().unwrap().status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_store_error_on_one_row_does_not_stop_the_batch() {
        let channels = ChannelManager::new();
        let transport = RecordingTransport::new();
        channels.register("wa", transport.clone());
        let broken = Arc::new(BrokenCompletion {
            inner: InMemoryOutboundStore::new(),
            broken: Mutex::new(None),
        });
        let store: Outbox = broken.clone();
        let queue = DispatchQueue::new(store.clone(), instant(), ChannelLimits::new(10));
        let dispatcher = Dispatcher::new(
            store.clone(),
            channels,
            Arc::new(ContactIdAddress),
            MemoryCollaborators::new(),
            settings(),
        );

        let first = queue.enqueue("wa", "c1", "one", None).await.unwrap();
        let second = queue.enqueue("wa", "c1", "two", None).await.unwrap();
        *broken.broken.lock().unwrap() = Some(first.id);

        let report = dispatcher.dispatch_due().await.unwrap();
        assert_eq!(report.claimed, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(transport.sent().len(), 2);
        assert_eq!(store.get(second.id).await.unwrap().unwrap().status, MessageStatus::Sent);
        assert_eq!(store.get(first.id).await.unwrap().unwrap().status, MessageStatus::Dispatching);
    }
}
