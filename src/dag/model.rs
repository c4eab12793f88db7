//! Typed model of the DAG definition and its inline runtime state.
//!
//! The definition half (name, layers, features) is authored by the user and
//! immutable during a run; the runtime half (run, specs, staging) is mutated
//! by the engine and persisted back into the same YAML document.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Status of a single spec within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
}

impl fmt::Display for SpecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecStatus::Pending => write!(f, "pending"),
            SpecStatus::Running => write!(f, "running"),
            SpecStatus::Completed => write!(f, "completed"),
            SpecStatus::Failed => write!(f, "failed"),
            SpecStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Whether the agent's work in a spec's worktree ended up committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitStatus {
    #[default]
    Pending,
    Committed,
    Failed,
}

/// Status of the staging merge for one spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    #[default]
    Pending,
    Merged,
    MergeFailed,
    Skipped,
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStatus::Pending => write!(f, "pending"),
            MergeStatus::Merged => write!(f, "merged"),
            MergeStatus::MergeFailed => write!(f, "merge_failed"),
            MergeStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// How a staging merge conflict was (or was not) resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMethod {
    Agent,
    Manual,
    Skipped,
    #[default]
    None,
}

/// The `dag:` header block of a definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagMeta {
    pub name: String,
    /// Explicit id; when absent the effective id is a slug of the name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// One ordered group of features sharing dependency semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub features: Vec<Feature>,
}

/// A unit of work ("spec"): one agent invocation in one worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    /// Unique across the whole DAG; matches a folder name in the repo.
    pub id: String,
    pub description: String,
    /// Spec ids this feature depends on; cross-layer references permitted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Optional per-spec agent timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Run-level state persisted inline in the definition file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dag_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// Merge sub-state for one spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeState {
    #[serde(default)]
    pub status: MergeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<String>,
    /// Conflicted paths, relative to the repository root.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
    #[serde(default, skip_serializing_if = "is_resolution_none")]
    pub resolution_method: ResolutionMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn is_resolution_none(m: &ResolutionMethod) -> bool {
    *m == ResolutionMethod::None
}

/// Per-spec runtime state persisted inline in the definition file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecRuntime {
    #[serde(default)]
    pub status: SpecStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    /// Opaque, agent-defined progress marker (e.g. "plan", "implement").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_status: Option<CommitStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Canonical branch for this spec (includes any collision suffix).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub merged_to_staging: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeState>,
    /// Failed roots that caused this spec to be marked blocked.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
}

/// Per-layer staging branch state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerStaging {
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Spec ids merged into this staging branch, in merge order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub specs_merged: Vec<String>,
}

/// The authored half of a definition: metadata plus ordered layers.
#[derive(Debug, Clone)]
pub struct Dag {
    pub meta: DagMeta,
    pub layers: Vec<Layer>,
}

impl Dag {
    /// Effective dag id: explicit id, else a slug of the name, else the
    /// fallback supplied by the caller (slug of the file basename).
    pub fn dag_id_or(&self, fallback: &str) -> String {
        if let Some(id) = &self.meta.id {
            if !id.is_empty() {
                return id.clone();
            }
        }
        let slug = slugify(&self.meta.name);
        if !slug.is_empty() {
            return slug;
        }
        slugify(fallback)
    }

    /// All features in authoring order (layers in order, features in order).
    pub fn features(&self) -> impl Iterator<Item = &Feature> {
        self.layers.iter().flat_map(|l| l.features.iter())
    }

    /// Find a feature with its layer index.
    pub fn find_feature(&self, spec_id: &str) -> Option<(usize, &Layer, &Feature)> {
        for (idx, layer) in self.layers.iter().enumerate() {
            if let Some(f) = layer.features.iter().find(|f| f.id == spec_id) {
                return Some((idx, layer, f));
            }
        }
        None
    }

    /// The layer a spec belongs to.
    pub fn layer_of(&self, spec_id: &str) -> Option<&Layer> {
        self.find_feature(spec_id).map(|(_, l, _)| l)
    }
}

/// On-disk shape of the full document: definition plus optional state keys.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DagFile {
    pub schema_version: String,
    pub dag: DagMeta,
    #[serde(default)]
    pub layers: Vec<Layer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunState>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub specs: BTreeMap<String, SpecRuntime>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub staging: BTreeMap<String, LayerStaging>,
}

/// On-disk shape of a legacy sidecar state file (state keys only).
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct SidecarFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunState>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub specs: BTreeMap<String, SpecRuntime>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub staging: BTreeMap<String, LayerStaging>,
}

/// Lowercase alphanumeric runs joined by `-`.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut last_dash = true;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}
