/*
   FlowExecutor ── enqueue ──▶ DispatchQueue ──(cap check, humanized delay)──▶ OutboundStore
                                                                                 │
                                         claim due rows (pending → dispatching)  │
                                                                                 ▼
   ChannelTransport ◀── send ── Dispatcher ── complete(sent | retry | failed) ──▶ OutboundStore
*/
pub mod humanize;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod store;
pub mod worker;

pub use humanize::HumanizeSettings;
pub use message::{Completion, MessageStatus, OutboundMessage};
pub use queue::{ChannelLimits, DailyStats, DispatchError, DispatchQueue};
pub use store::{FileOutboundStore, InMemoryOutboundStore, OutboundStore, Outbox};
pub use worker::{DispatchReport, Dispatcher, DispatcherSettings};
