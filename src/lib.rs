//! Conversational flow engine.
//!
//! Contacts move through [`flow::FlowDefinition`] graphs one node at a time;
//! every bot message goes through a humanized, rate-limited outbound queue
//! ([`dispatch`]) before a [`channel_plugin::ChannelTransport`] delivers it.

pub mod agent;
pub mod channel;
pub mod collab;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod flow;
pub mod integration;
pub mod logger;
pub mod node;
pub mod store;
pub mod util;
pub mod watcher;

pub use engine::{Engine, EngineBuilder, InboundOutcome};
