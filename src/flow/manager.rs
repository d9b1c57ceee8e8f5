use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Error;
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::{
    flow::definition::{DefinitionError, FlowDefinition},
    watcher::{DirectoryWatcher, WatchedType},
};

/// File extensions definitions are loaded from.
pub const FLOW_EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];

/// Reloads definitions when files in the flow directory change.
struct FlowWatcher {
    manager: Arc<FlowManager>,
}

#[async_trait]
impl WatchedType for FlowWatcher {
    fn is_relevant(&self, path: &Path) -> bool {
        has_flow_extension(path)
    }

    async fn on_create_or_modify(&self, path: &Path) -> anyhow::Result<()> {
        let flow = FlowManager::load_flow_from_file(path)?;
        self.manager.publish(flow)?;
        Ok(())
    }

    async fn on_remove(&self, path: &Path) -> anyhow::Result<()> {
        // running states keep the versions they started on
        info!(?path, "flow file removed, published versions kept");
        Ok(())
    }
}

/// Published flow definitions, every version kept.
///
/// States pin the version they started on, so an edited flow never changes
/// the graph under a contact who is mid-way through it.
#[derive(Debug, Default)]
pub struct FlowManager {
    flows: DashMap<String, BTreeMap<u32, Arc<FlowDefinition>>>,
}

impl FlowManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Validate and store a definition under the next version number.
    /// Re-publishing a definition identical to the latest is a no-op.
    pub fn publish(&self, flow: FlowDefinition) -> Result<Arc<FlowDefinition>, DefinitionError> {
        let mut flow = if flow.is_built() { flow } else { flow.build()? };
        let mut versions = self.flows.entry(flow.id().to_string()).or_default();

        if let Some((&latest, current)) = versions.last_key_value() {
            flow.set_version(latest);
            if **current == flow {
                return Ok(current.clone());
            }
            flow.set_version(latest + 1);
        } else {
            flow.set_version(flow.version().max(1));
        }

        let flow = Arc::new(flow);
        versions.insert(flow.version(), flow.clone());
        info!(flow_id = %flow.id(), version = flow.version(), nodes = flow.nodes().len(), "flow published");
        Ok(flow)
    }

    /// Latest published version.
    pub fn get(&self, flow_id: &str) -> Option<Arc<FlowDefinition>> {
        self.flows
            .get(flow_id)
            .and_then(|v| v.last_key_value().map(|(_, f)| f.clone()))
    }

    pub fn get_version(&self, flow_id: &str, version: u32) -> Option<Arc<FlowDefinition>> {
        self.flows.get(flow_id).and_then(|v| v.get(&version).cloned())
    }

    /// The pinned version when it is still known, else the latest.
    pub fn resolve(&self, flow_id: &str, version: u32) -> Option<Arc<FlowDefinition>> {
        self.get_version(flow_id, version).or_else(|| {
            let latest = self.get(flow_id)?;
            warn!(flow_id, version, latest = latest.version(), "pinned flow version gone, using latest");
            Some(latest)
        })
    }

    /// Latest version of every active flow of an organization, ordered by id.
    pub fn active_for_organization(&self, organization_id: &str) -> Vec<Arc<FlowDefinition>> {
        let mut flows: Vec<Arc<FlowDefinition>> = self
            .flows
            .iter()
            .filter_map(|v| v.last_key_value().map(|(_, f)| f.clone()))
            .filter(|f| f.is_active() && f.organization_id() == organization_id)
            .collect();
        flows.sort_by(|a, b| a.id().cmp(b.id()));
        flows
    }

    pub fn flow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.flows.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn remove(&self, flow_id: &str) -> bool {
        let removed = self.flows.remove(flow_id).is_some();
        if removed {
            info!(flow_id, "flow removed");
        }
        removed
    }

    /// Parse a `.json`, `.yaml` or `.yml` definition and validate it.
    pub fn load_flow_from_file(path: impl AsRef<Path>) -> Result<FlowDefinition, DefinitionError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| DefinitionError::Io(format!("{}: {}", path.display(), e)))?;
        let ext = path
            .extension()
            .and_then(|os| os.to_str())
            .unwrap_or_default()
            .to_lowercase();

        let flow: FlowDefinition = match ext.as_str() {
            "json" => serde_json::from_str(&contents)
                .map_err(|e| DefinitionError::Parse(format!("JSON parse error: {}", e)))?,
            "yaml" | "yml" => serde_yaml_bw::from_str(&contents)
                .map_err(|e| DefinitionError::Parse(format!("YAML parse error: {}", e)))?,
            other => {
                return Err(DefinitionError::Parse(format!(
                    "unsupported extension `{}` (expected .json, .yaml or .yml)",
                    other
                )));
            }
        };

        flow.build()
    }

    pub fn save_flow_to_file(path: impl AsRef<Path>, flow: &FlowDefinition) -> Result<(), DefinitionError> {
        let path = path.as_ref();
        let contents = match path.extension().and_then(|os| os.to_str()) {
            Some("yaml" | "yml") => serde_yaml_bw::to_string(flow)
                .map_err(|e| DefinitionError::Parse(e.to_string()))?,
            _ => serde_json::to_string_pretty(flow)
                .map_err(|e| DefinitionError::Parse(e.to_string()))?,
        };
        fs::write(path, contents).map_err(|e| DefinitionError::Io(e.to_string()))
    }

    /// Publish every definition in `dir`. Invalid files are logged and
    /// skipped; returns how many were published.
    pub fn load_dir(&self, dir: &Path) -> anyhow::Result<usize> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| has_flow_extension(p))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            match Self::load_flow_from_file(&path).and_then(|f| self.publish(f)) {
                Ok(_) => loaded += 1,
                Err(e) => error!(?path, error = %e, "failed to load flow"),
            }
        }
        Ok(loaded)
    }

    /// Load `dir` and keep reloading files as they change.
    pub async fn watch_dir(
        self: Arc<Self>,
        dir: PathBuf,
        poll_interval: Duration,
    ) -> Result<DirectoryWatcher, Error> {
        let watcher = FlowWatcher { manager: self };
        DirectoryWatcher::new(dir, Arc::new(watcher), &FLOW_EXTENSIONS, true, false, poll_interval).await
    }

    /// JSON schema of a definition file.
    pub fn definition_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(FlowDefinition)).unwrap_or_default()
    }
}

fn has_flow_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| FLOW_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
}
