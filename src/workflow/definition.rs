use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::WorkflowError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub prompt: String,
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<String>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            depends_on: Vec::new(),
        }
    }

    pub fn after(mut self, dependencies: &[&str]) -> Self {
        self.depends_on = dependencies.iter().map(|d| d.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Defaults to the file stem when loaded from disk
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
}

/// Where and with what a run executes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub cwd: PathBuf,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// Filled in by the engine when a run starts
    #[serde(default)]
    pub workflow_id: Option<String>,
}

impl WorkflowContext {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }
}

/// Load every `*.json` definition in `dir`, keyed by id.
///
/// A missing directory yields nothing. Files that fail to parse, and later
/// files reusing an id, are skipped with a warning.
pub fn discover(dir: &Path) -> Result<BTreeMap<String, WorkflowDefinition>, WorkflowError> {
    let mut definitions = BTreeMap::new();
    if !dir.exists() {
        debug!("Workflow directory {} does not exist", dir.display());
        return Ok(definitions);
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    for path in paths {
        match load(&path) {
            Ok(definition) => {
                if definitions.contains_key(&definition.id) {
                    warn!(
                        "Skipping {}: workflow id '{}' already defined",
                        path.display(),
                        definition.id
                    );
                    continue;
                }
                definitions.insert(definition.id.clone(), definition);
            }
            Err(e) => warn!("Skipping workflow file {}: {}", path.display(), e),
        }
    }

    Ok(definitions)
}

fn load(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let json = fs::read_to_string(path)?;
    let mut definition: WorkflowDefinition = serde_json::from_str(&json)?;
    if definition.id.is_empty() {
        definition.id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    Ok(definition)
}
