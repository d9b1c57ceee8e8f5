// src/channel/manager.rs

use std::{collections::BTreeMap, sync::Arc};

use channel_plugin::ChannelTransport;
use dashmap::DashMap;
use tracing::info;

/// Registry of connected channel transports, keyed by channel id.
///
/// Owned by the engine and passed around by reference; nothing here is global.
#[derive(Clone, Default)]
pub struct ChannelManager {
    transports: Arc<DashMap<String, Arc<dyn ChannelTransport>>>,
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("channels", &self.channel_ids())
            .finish()
    }
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the transport for a channel.
    pub fn register(&self, channel_id: impl Into<String>, transport: Arc<dyn ChannelTransport>) {
        let channel_id = channel_id.into();
        info!(channel_id = %channel_id, transport = %transport.name(), "channel registered");
        self.transports.insert(channel_id, transport);
    }

    pub fn unregister(&self, channel_id: &str) -> Option<Arc<dyn ChannelTransport>> {
        self.transports.remove(channel_id).map(|(_, t)| {
            info!(channel_id, "channel unregistered");
            t
        })
    }

    pub fn transport(&self, channel_id: &str) -> Option<Arc<dyn ChannelTransport>> {
        self.transports.get(channel_id).map(|entry| entry.value().clone())
    }

    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.transports.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Channel id → transport name.
    pub fn diagnostics(&self) -> BTreeMap<String, String> {
        self.transports
            .iter()
            .map(|e| (e.key().clone(), e.value().name()))
            .collect()
    }
}
