use thiserror::Error;

use crate::{collab::CollaboratorError, dispatch::DispatchError, store::StoreError};

/// A malformed graph discovered while walking it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("node `{0}` does not exist")]
    MissingNode(String),
    #[error("node `{0}` has no outgoing edge")]
    NoOutgoingEdge(String),
    #[error("gave up after {0} steps in a single advance")]
    StepLimitExceeded(usize),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("flow `{flow_id}` stalled: {source}")]
    Graph {
        flow_id: String,
        #[source]
        source: GraphError,
    },
    #[error("channel `{channel_id}` reached its daily limit of {limit} messages")]
    CapacityExceeded { channel_id: String, limit: u32 },
    #[error("node `{node_id}` failed: {source}")]
    Collaborator {
        node_id: String,
        #[source]
        source: CollaboratorError,
    },
    #[error("state of contact `{contact_id}` in flow `{flow_id}` changed underneath us")]
    ConcurrencyConflict { contact_id: String, flow_id: String },
    #[error("flow `{0}` not found")]
    FlowNotFound(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FlowError {
    pub fn graph(flow_id: &str, source: GraphError) -> Self {
        FlowError::Graph {
            flow_id: flow_id.to_string(),
            source,
        }
    }

    /// Lost a race with another writer; callers treat this as a no-op.
    pub fn is_conflict(&self) -> bool {
        matches!(self, FlowError::ConcurrencyConflict { .. })
    }
}

impl From<DispatchError> for FlowError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::CapacityExceeded { channel_id, limit } => {
                FlowError::CapacityExceeded { channel_id, limit }
            }
            DispatchError::InvalidMessage(m) => FlowError::InvalidMessage(m),
            DispatchError::Store(s) => FlowError::Store(s),
        }
    }
}
