use std::{path::Path, sync::Arc, time::Duration};

use channel_plugin::{InboundEvent, InboundMessage};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::{
    channel::ChannelManager,
    collab::Collaborators,
    config::{ConfigManagerType, EngineConfig, EnvConfigManager},
    dispatch::{
        DailyStats, DispatchError, DispatchQueue, Dispatcher, FileOutboundStore, InMemoryOutboundStore, Outbox,
    },
    flow::{
        DelayTimer, FileFlowStateStore, FlowError, FlowExecutor, FlowManager, FlowMatch,
        InMemoryFlowStateStore, Resumed, ResumptionTrigger, StartContext, StateLocks, StateStore,
        TriggerMatcher,
    },
    store::StoreError,
    watcher::DirectoryWatcher,
};

/// File names used under `data_dir` by the file-backed stores.
pub const STATE_FILE: &str = "flow_states.json";
pub const OUTBOX_FILE: &str = "outbound_queue.json";

const FLOW_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// What an inbound message did.
#[derive(Debug, Clone)]
pub enum InboundOutcome {
    /// The reply was fed into flows that were waiting for it.
    Resumed(Vec<Resumed>),
    /// Nothing was waiting, so trigger matching ran; may be empty.
    Matched(Vec<FlowMatch>),
}

impl InboundOutcome {
    pub fn is_resumed(&self) -> bool {
        matches!(self, InboundOutcome::Resumed(_))
    }
}

/// Assembles an [`Engine`]. Anything not supplied falls back to the
/// configuration: file stores under `data_dir`, or in-memory ones.
#[derive(Debug)]
pub struct EngineBuilder {
    config: EngineConfig,
    states: Option<StateStore>,
    outbox: Option<Outbox>,
    channels: ChannelManager,
    collab: Collaborators,
    flows: Option<Arc<FlowManager>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            states: None,
            outbox: None,
            channels: ChannelManager::new(),
            collab: Collaborators::default(),
            flows: None,
        }
    }

    pub fn with_state_store(mut self, states: StateStore) -> Self {
        self.states = Some(states);
        self
    }

    pub fn with_outbox(mut self, outbox: Outbox) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn with_channels(mut self, channels: ChannelManager) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_collaborators(mut self, collab: Collaborators) -> Self {
        self.collab = collab;
        self
    }

    pub fn with_flows(mut self, flows: Arc<FlowManager>) -> Self {
        self.flows = Some(flows);
        self
    }

    pub fn build(self) -> Result<Engine, StoreError> {
        let data_dir = self.config.data_dir.as_deref();
        let states: StateStore = match (self.states, data_dir) {
            (Some(states), _) => states,
            (None, Some(dir)) => FileFlowStateStore::open(dir.join(STATE_FILE))?,
            (None, None) => InMemoryFlowStateStore::new(),
        };
        let outbox: Outbox = match (self.outbox, data_dir) {
            (Some(outbox), _) => outbox,
            (None, Some(dir)) => FileOutboundStore::open(dir.join(OUTBOX_FILE))?,
            (None, None) => InMemoryOutboundStore::new(),
        };

        let config = self.config;
        let flows = self.flows.unwrap_or_else(FlowManager::new);
        let locks = Arc::new(StateLocks::new());
        let queue = DispatchQueue::new(outbox.clone(), config.humanize, config.limits.clone());
        let executor = FlowExecutor::new(
            states.clone(),
            queue.clone(),
            self.collab.clone(),
            config.executor.clone(),
        );
        let dispatcher = Dispatcher::new(
            outbox,
            self.channels.clone(),
            self.collab.contacts.clone(),
            self.collab.history.clone(),
            config.dispatcher.clone(),
        );

        Ok(Engine {
            resumption: ResumptionTrigger::new(flows.clone(), executor.clone(), locks.clone()),
            matcher: TriggerMatcher::new(flows.clone(), executor.clone(), locks.clone()),
            timer: Arc::new(DelayTimer::new(
                flows.clone(),
                executor.clone(),
                locks.clone(),
                config.timer.clone(),
            )),
            dispatcher: Arc::new(dispatcher),
            channels: self.channels,
            config,
            flows,
            states,
            queue,
            executor,
            locks,
        })
    }
}

/// The whole conversational engine: flows, their states, and the outbound queue.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    flows: Arc<FlowManager>,
    states: StateStore,
    queue: DispatchQueue,
    channels: ChannelManager,
    executor: FlowExecutor,
    resumption: ResumptionTrigger,
    matcher: TriggerMatcher,
    timer: Arc<DelayTimer>,
    dispatcher: Arc<Dispatcher>,
    locks: Arc<StateLocks>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Read settings from `.env` and the environment, then build with
    /// default collaborators and load `flow_dir` when set.
    pub async fn from_env(env_file: impl AsRef<Path>) -> anyhow::Result<Engine> {
        let manager = EnvConfigManager::new(env_file.as_ref());
        Self::from_config_manager(&manager).await
    }

    pub async fn from_config_manager(manager: &dyn ConfigManagerType) -> anyhow::Result<Engine> {
        let config = EngineConfig::from_manager(manager).await;
        let engine = EngineBuilder::new(config).build()?;
        if let Some(dir) = engine.config.flow_dir.clone() {
            let loaded = engine.flows.load_dir(&dir)?;
            info!(dir = %dir.display(), loaded, "flows loaded");
        }
        Ok(engine)
    }

    /// Route a contact's message: resume whatever is waiting for a reply,
    /// and only when nothing was waiting, start flows whose keywords match.
    #[instrument(skip(self, message), fields(contact_id = %message.contact_id, channel_id = %message.channel_id))]
    pub async fn handle_inbound(&self, message: &InboundMessage) -> Result<InboundOutcome, FlowError> {
        if message.contact_id.trim().is_empty() {
            return Err(FlowError::InvalidMessage("contact id is empty".into()));
        }
        let resumed = self
            .resumption
            .resume(&message.contact_id, &message.text)
            .await?;
        if !resumed.is_empty() {
            return Ok(InboundOutcome::Resumed(resumed));
        }

        let ctx = StartContext {
            contact_id: &message.contact_id,
            organization_id: &message.organization_id,
            channel_id: &message.channel_id,
        };
        Ok(InboundOutcome::Matched(self.matcher.match_text(ctx, &message.text).await))
    }

    /// Start flows listening for an external event.
    #[instrument(skip(self, event), fields(contact_id = %event.contact_id, event = %event.event_type))]
    pub async fn handle_event(&self, event: &InboundEvent) -> Result<Vec<FlowMatch>, FlowError> {
        if event.contact_id.trim().is_empty() {
            return Err(FlowError::InvalidMessage("contact id is empty".into()));
        }
        let ctx = StartContext {
            contact_id: &event.contact_id,
            organization_id: &event.organization_id,
            channel_id: &event.channel_id,
        };
        Ok(self
            .matcher
            .match_event(ctx, &event.event_type, event.event_payload.as_ref())
            .await)
    }

    /// Spawn the dispatcher, the delay timer and the cleanup sweep. They all
    /// stop when `cancel` fires.
    pub fn start_workers(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let cleanup = {
            let queue = self.queue.clone();
            let locks = self.locks.clone();
            let interval = self.config.cleanup_interval;
            let retention_days = self.config.retention_days;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            if let Err(e) = queue.cleanup(retention_days).await {
                                error!(error = %e, "cleanup sweep failed");
                            }
                            locks.prune();
                        }
                    }
                }
            })
        };

        vec![
            tokio::spawn(self.dispatcher.clone().run(cancel.clone())),
            tokio::spawn(self.timer.clone().run(cancel)),
            cleanup,
        ]
    }

    /// Watch `flow_dir` for definition changes, if one is configured.
    pub async fn watch_flows(&self) -> anyhow::Result<Option<DirectoryWatcher>> {
        match self.config.flow_dir.clone() {
            Some(dir) => Ok(Some(
                self.flows.clone().watch_dir(dir, FLOW_POLL_INTERVAL).await?,
            )),
            None => Ok(None),
        }
    }

    pub async fn daily_stats(&self, channel_id: &str) -> Result<DailyStats, DispatchError> {
        self.queue.daily_stats(channel_id).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn flows(&self) -> &Arc<FlowManager> {
        &self.flows
    }

    pub fn states(&self) -> &StateStore {
        &self.states
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    pub fn executor(&self) -> &FlowExecutor {
        &self.executor
    }

    pub fn matcher(&self) -> &TriggerMatcher {
        &self.matcher
    }

    pub fn resumption(&self) -> &ResumptionTrigger {
        &self.resumption
    }

    pub fn timer(&self) -> &DelayTimer {
        &self.timer
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfigManager;

    #[tokio::test]
    async fn test_from_config_manager_loads_flow_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("ping.json"),
            r#"{
                "id": "ping",
                "organizationId": "org1",
                "triggers": { "keywords": ["ping"] },
                "nodes": [
                    { "id": "start", "type": "start" },
                    { "id": "pong", "type": "botResponse", "config": { "message": "pong" } }
                ],
                "edges": [ { "id": "e1", "sourceNodeId": "start", "targetNodeId": "pong" } ]
            }"#,
        )
        .unwrap();

        let manager = MapConfigManager::new()
            .with("CHATFLOW_FLOW_DIR", &dir.path().to_string_lossy())
            .with("CHATFLOW_DAILY_LIMIT", "7");
        let engine = Engine::from_config_manager(&manager).await.unwrap();
        assert_eq!(engine.flows().flow_ids(), vec!["ping".to_string()]);
        assert_eq!(engine.daily_stats("wa").await.unwrap().limit, 7);
    }

    #[tokio::test]
    async fn test_empty_contact_is_rejected() {
        let engine = EngineBuilder::new(EngineConfig::default()).build().unwrap();
        let err = engine
            .handle_inbound(&InboundMessage::new("org1", "wa", " ", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn test_workers_stop_on_cancel() {
        let engine = EngineBuilder::new(EngineConfig::default()).build().unwrap();
        let cancel = CancellationToken::new();
        let handles = engine.start_workers(cancel.clone());
        assert_eq!(handles.len(), 3);
        cancel.cancel();
        for handle in handles {
            tokio::time::timeout(std::time::Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
