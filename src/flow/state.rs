use std::{
    collections::HashMap,
    fmt::Debug,
    path::Path,
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    flow::definition::FlowDefinition,
    store::{SnapshotFile, StoreError},
};

pub type StateStore = Arc<dyn FlowStateStore>;

/// Conversation turns kept per state for AI context.
pub const CONVERSATION_LIMIT: usize = 20;

pub const SCORE_MIN: i32 = 0;
pub const SCORE_MAX: i32 = 100;

/// Identity of a state row: one per contact and flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    pub contact_id: String,
    pub flow_id: String,
}

impl StateKey {
    pub fn new(contact_id: impl Into<String>, flow_id: impl Into<String>) -> Self {
        Self {
            contact_id: contact_id.into(),
            flow_id: flow_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathAction {
    Entered,
    Completed,
    DroppedOff,
    Awaiting,
    Delayed,
    Resumed,
    Restarted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathEntry {
    pub node_id: String,
    pub action: PathAction,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Bot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// The durable execution cursor of one flow for one contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowState {
    pub contact_id: String,
    pub flow_id: String,
    pub flow_version: u32,
    pub organization_id: String,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    pub current_node_id: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub awaiting_input: bool,
    /// Set while parked on a `delay` node; the timer worker polls it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub engagement_score: i32,
    #[serde(default)]
    pub path: Vec<PathEntry>,
    #[serde(default)]
    pub conversation: Vec<ConversationTurn>,
    /// Bumped by the store on every successful compare-and-swap.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowState {
    /// A fresh state positioned on the flow's start node.
    pub fn start(
        flow: &FlowDefinition,
        contact_id: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        FlowState {
            contact_id: contact_id.into(),
            flow_id: flow.id().to_string(),
            flow_version: flow.version(),
            organization_id: flow.organization_id().to_string(),
            channel_id: channel_id.into(),
            variant_id: flow.variant_id().map(str::to_string),
            current_node_id: flow.start_node_id().unwrap_or_default().to_string(),
            variables: HashMap::new(),
            awaiting_input: false,
            resume_at: None,
            completed: false,
            engagement_score: 0,
            path: Vec::new(),
            conversation: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> StateKey {
        StateKey::new(self.contact_id.clone(), self.flow_id.clone())
    }

    /// Started and not yet completed, whether or not it is suspended.
    pub fn is_running(&self) -> bool {
        !self.completed
    }

    pub fn var(&self, key: &str) -> Option<&str> {
        self.variables.get(key).map(String::as_str)
    }

    pub fn set_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(key.into(), value.into());
    }

    pub fn record(&mut self, node_id: &str, action: PathAction, detail: Option<String>) {
        self.path.push(PathEntry {
            node_id: node_id.to_string(),
            action,
            at: Utc::now(),
            detail,
        });
    }

    pub fn push_turn(&mut self, role: TurnRole, text: impl Into<String>) {
        self.conversation.push(ConversationTurn {
            role,
            text: text.into(),
            at: Utc::now(),
        });
        if self.conversation.len() > CONVERSATION_LIMIT {
            let excess = self.conversation.len() - CONVERSATION_LIMIT;
            self.conversation.drain(..excess);
        }
    }

    /// Applies a delta and returns the clamped score.
    pub fn adjust_score(&mut self, delta: i32) -> i32 {
        self.engagement_score = self
            .engagement_score
            .saturating_add(delta)
            .clamp(SCORE_MIN, SCORE_MAX);
        self.engagement_score
    }

    /// Rewind a completed state onto a (possibly newer) definition. The audit
    /// path and score survive; variables and the cursor do not.
    pub fn restart(&mut self, flow: &FlowDefinition, channel_id: &str) {
        let start = flow.start_node_id().unwrap_or_default().to_string();
        self.record(&start, PathAction::Restarted, Some(format!("v{}", flow.version())));
        self.flow_version = flow.version();
        self.variant_id = flow.variant_id().map(str::to_string);
        self.channel_id = channel_id.to_string();
        self.current_node_id = start;
        self.variables.clear();
        self.awaiting_input = false;
        self.resume_at = None;
        self.completed = false;
    }
}

/// Durable per-(contact, flow) execution state with atomic read-modify-write.
#[async_trait]
pub trait FlowStateStore: Send + Sync + Debug {
    async fn get(&self, key: &StateKey) -> Result<Option<FlowState>, StoreError>;

    /// Inserts the row only if none exists for its key. Returns whether it was inserted.
    async fn insert_if_absent(&self, state: FlowState) -> Result<bool, StoreError>;

    /// Replaces the stored row if its `version` still equals `state.version`.
    /// Returns the stored row (with the bumped version) or `None` when another
    /// writer got there first.
    async fn compare_and_swap(&self, state: FlowState) -> Result<Option<FlowState>, StoreError>;

    /// All rows of a contact currently waiting on a reply.
    async fn awaiting_input(&self, contact_id: &str) -> Result<Vec<FlowState>, StoreError>;

    /// Rows parked on a delay whose due time has passed, earliest first.
    async fn due_delays(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FlowState>, StoreError>;

    async fn for_contact(&self, contact_id: &str) -> Result<Vec<FlowState>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryFlowStateStore {
    rows: DashMap<StateKey, FlowState>,
}

impl InMemoryFlowStateStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn from_rows(rows: Vec<FlowState>) -> Self {
        let map = DashMap::with_capacity(rows.len());
        for row in rows {
            map.insert(row.key(), row);
        }
        Self { rows: map }
    }

    /// All rows with `row` written over its key, sorted by key.
    fn snapshot_with(&self, row: &FlowState) -> Vec<FlowState> {
        let key = row.key();
        let mut rows: Vec<FlowState> = self
            .rows
            .iter()
            .filter(|r| *r.key() != key)
            .map(|r| r.value().clone())
            .collect();
        rows.push(row.clone());
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl FlowStateStore for InMemoryFlowStateStore {
    async fn get(&self, key: &StateKey) -> Result<Option<FlowState>, StoreError> {
        Ok(self.rows.get(key).map(|r| r.value().clone()))
    }

    async fn insert_if_absent(&self, state: FlowState) -> Result<bool, StoreError> {
        match self.rows.entry(state.key()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(state);
                Ok(true)
            }
        }
    }

    async fn compare_and_swap(&self, state: FlowState) -> Result<Option<FlowState>, StoreError> {
        let Some(mut current) = self.rows.get_mut(&state.key()) else {
            return Ok(None);
        };
        let next = successor(&current, state);
        if let Some(next) = &next {
            *current = next.clone();
        }
        Ok(next)
    }

    async fn awaiting_input(&self, contact_id: &str) -> Result<Vec<FlowState>, StoreError> {
        let mut rows: Vec<FlowState> = self
            .rows
            .iter()
            .filter(|r| r.contact_id == contact_id && r.awaiting_input && !r.completed)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| a.flow_id.cmp(&b.flow_id));
        Ok(rows)
    }

    async fn due_delays(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FlowState>, StoreError> {
        let mut rows: Vec<FlowState> = self
            .rows
            .iter()
            .filter(|r| !r.completed && r.resume_at.is_some_and(|at| at <= now))
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|r| r.resume_at);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn for_contact(&self, contact_id: &str) -> Result<Vec<FlowState>, StoreError> {
        let mut rows: Vec<FlowState> = self
            .rows
            .iter()
            .filter(|r| r.contact_id == contact_id)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| a.flow_id.cmp(&b.flow_id));
        Ok(rows)
    }
}

/// The row a compare-and-swap of `state` over `current` stores, or `None`
/// when `current` has moved past the version `state` was read at.
fn successor(current: &FlowState, mut state: FlowState) -> Option<FlowState> {
    if current.version != state.version {
        debug!(
            contact_id = %state.contact_id,
            flow_id = %state.flow_id,
            expected = state.version,
            found = current.version,
            "state version moved on"
        );
        return None;
    }
    state.version += 1;
    state.updated_at = Utc::now();
    Some(state)
}

/// In-memory rows mirrored to a JSON snapshot after every write, so
/// suspended flows and pending delays survive a restart.
///
/// A write reaches the in-memory rows only after its snapshot is saved.
#[derive(Debug)]
pub struct FileFlowStateStore {
    inner: InMemoryFlowStateStore,
    file: SnapshotFile,
    write_lock: Mutex<()>,
}

impl FileFlowStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>, StoreError> {
        let file = SnapshotFile::new(path.as_ref());
        let rows: Vec<FlowState> = file.load()?;
        debug!(path = %file.path().display(), rows = rows.len(), "loaded flow states");
        Ok(Arc::new(Self {
            inner: InMemoryFlowStateStore::from_rows(rows),
            file,
            write_lock: Mutex::new(()),
        }))
    }

    fn commit(&self, row: FlowState) -> Result<(), StoreError> {
        self.file.save(&self.inner.snapshot_with(&row))?;
        self.inner.rows.insert(row.key(), row);
        Ok(())
    }
}

#[async_trait]
impl FlowStateStore for FileFlowStateStore {
    async fn get(&self, key: &StateKey) -> Result<Option<FlowState>, StoreError> {
        self.inner.get(key).await
    }

    async fn insert_if_absent(&self, state: FlowState) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        if self.inner.rows.contains_key(&state.key()) {
            return Ok(false);
        }
        self.commit(state)?;
        Ok(true)
    }

    async fn compare_and_swap(&self, state: FlowState) -> Result<Option<FlowState>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let Some(current) = self.inner.get(&state.key()).await? else {
            return Ok(None);
        };
        let Some(next) = successor(&current, state) else {
            return Ok(None);
        };
        self.commit(next.clone())?;
        Ok(Some(next))
    }

    async fn awaiting_input(&self, contact_id: &str) -> Result<Vec<FlowState>, StoreError> {
        self.inner.awaiting_input(contact_id).await
    }

    async fn due_delays(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FlowState>, StoreError> {
        self.inner.due_delays(now, limit).await
    }

    async fn for_contact(&self, contact_id: &str) -> Result<Vec<FlowState>, StoreError> {
        self.inner.for_contact(contact_id).await
    }
}
