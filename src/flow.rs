//! Flow definitions and their per-contact execution.
//!
//! A [`FlowDefinition`] is an immutable graph of nodes. Each contact inside a
//! flow has one [`FlowState`] row; the [`FlowExecutor`] walks the graph from
//! that row until a `userInput` or `delay` node suspends it. Replies come back
//! through the [`ResumptionTrigger`], elapsed delays through the
//! [`DelayTimer`], and new conversations through the [`TriggerMatcher`].

pub mod condition;
pub mod definition;
pub mod error;
pub mod executor;
pub mod lock;
pub mod manager;
pub mod resume;
pub mod state;
pub mod template;
pub mod timer;
pub mod trigger;

/// Variable holding the contact's most recent message.
pub const LAST_USER_MESSAGE: &str = "last_user_message";

pub use definition::{DefinitionError, Edge, FlowDefinition, FlowTriggers};
pub use error::{FlowError, GraphError};
pub use executor::{AdvanceOutcome, AdvanceReport, ExecutorSettings, FlowExecutor};
pub use lock::StateLocks;
pub use manager::FlowManager;
pub use resume::{Resumed, ResumptionTrigger};
pub use state::{
    FileFlowStateStore, FlowState, FlowStateStore, InMemoryFlowStateStore, PathAction, StateKey,
    StateStore,
};
pub use timer::{DelayTimer, TimerSettings};
pub use trigger::{FlowMatch, StartContext, StartOutcome, TriggerMatcher};
