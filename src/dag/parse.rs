//! Loading and saving of DAG definition files.
//!
//! One YAML document holds both the authored DAG and the runtime state.
//! Writers never partially update the file: every save materializes the full
//! document to a sibling temp path and renames it into place. Readers
//! tolerate absent state sections and ignore unknown keys.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::model::{Dag, DagFile, LayerStaging, RunState, SidecarFile, SpecRuntime};

/// A loaded definition file: the DAG, its inline state, and source locations
/// for validation messages.
#[derive(Debug, Clone)]
pub struct Document {
    /// Path the document was loaded from; saves go back to the same path.
    pub path: PathBuf,
    pub schema_version: String,
    pub dag: Dag,
    pub run: Option<RunState>,
    pub specs: BTreeMap<String, SpecRuntime>,
    pub staging: BTreeMap<String, LayerStaging>,
    /// 1-based line numbers of `id:` keys, by id value. Best effort; ids that
    /// appear more than once keep their first occurrence (validation reports
    /// the duplicate's line separately).
    pub id_lines: BTreeMap<String, usize>,
}

impl Document {
    /// Load a definition file, including any inline runtime state.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read DAG file: {}", path.display()))?;

        let file: DagFile = serde_yaml::from_str(&raw).map_err(|e| {
            let loc = e
                .location()
                .map(|l| format!("{}:{}:{}", path.display(), l.line(), l.column()))
                .unwrap_or_else(|| path.display().to_string());
            anyhow::anyhow!("Invalid DAG definition at {}: {}", loc, e)
        })?;

        Ok(Document {
            path: path.to_path_buf(),
            schema_version: file.schema_version,
            dag: Dag {
                meta: file.dag,
                layers: file.layers,
            },
            run: file.run,
            specs: file.specs,
            staging: file.staging,
            id_lines: index_id_lines(&raw),
        })
    }

    /// Effective dag id (explicit id > name slug > file basename slug).
    pub fn dag_id(&self) -> String {
        let basename = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("dag");
        self.dag.dag_id_or(basename)
    }

    pub fn spec_count(&self) -> usize {
        self.dag.features().count()
    }

    /// True when the document carries any inline runtime state.
    pub fn has_inline_state(&self) -> bool {
        self.run.is_some() || !self.specs.is_empty() || !self.staging.is_empty()
    }

    /// Source line for an id, for validation messages.
    pub fn line_of(&self, id: &str) -> Option<usize> {
        self.id_lines.get(id).copied()
    }

    /// Persist the document (definition + state) atomically.
    ///
    /// Empty state sections are omitted so a fresh DAG file stays minimal.
    pub fn save(&self) -> Result<()> {
        let file = DagFile {
            schema_version: self.schema_version.clone(),
            dag: self.dag.meta.clone(),
            layers: self.dag.layers.clone(),
            run: self.run.clone(),
            specs: self.specs.clone(),
            staging: self.staging.clone(),
        };
        let yaml = serde_yaml::to_string(&file).context("Failed to serialize DAG document")?;
        atomic_write(&self.path, yaml.as_bytes())
    }

    /// Erase all runtime state sections before a fresh run.
    pub fn clear_state(&mut self) {
        self.run = None;
        self.specs.clear();
        self.staging.clear();
    }

    /// Get-or-create the runtime record for a spec.
    pub fn spec_runtime_mut(&mut self, spec_id: &str) -> &mut SpecRuntime {
        self.specs.entry(spec_id.to_string()).or_default()
    }
}

/// Write `contents` to `path` via a sibling temp file + rename.
///
/// A crash at any instant leaves either the previous version or the new
/// version on disk, never a partial file.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Index the 1-based line number of every `id:` key in the raw YAML.
fn index_id_lines(raw: &str) -> BTreeMap<String, usize> {
    let mut lines = BTreeMap::new();
    for (i, line) in raw.lines().enumerate() {
        let trimmed = line.trim_start().trim_start_matches("- ").trim_start();
        if let Some(rest) = trimmed.strip_prefix("id:") {
            let value = rest.trim().trim_matches('"').trim_matches('\'');
            if !value.is_empty() {
                lines.entry(value.to_string()).or_insert(i + 1);
            }
        }
    }
    lines
}

/// Map a workflow definition path to its sidecar state filename.
///
/// Absolute paths keep only the basename; relative paths have separators
/// replaced by `-`. The result is suffixed with `.state`. Only used for the
/// legacy sidecar migration path.
pub fn normalize_workflow_path(path: &Path) -> String {
    let name = if path.is_absolute() {
        path.file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("workflow")
            .to_string()
    } else {
        path.to_string_lossy().replace(['/', '\\'], "-")
    };
    format!("{}.state", name)
}

/// Outcome of a legacy sidecar migration attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// No sidecar file present; nothing to do.
    NoSidecar,
    /// Sidecar converted to inline state and deleted.
    Migrated,
    /// Definition already has inline state; sidecar left untouched.
    InlineWins,
}

/// Migrate a legacy sidecar state file into the definition, if safe.
///
/// Inline state always wins: if the definition already carries state, the
/// sidecar is left on disk and the caller should warn the user.
pub fn migrate_legacy_state(doc: &mut Document, state_dir: &Path) -> Result<MigrationOutcome> {
    let sidecar_path = state_dir.join(normalize_workflow_path(&doc.path));
    if !sidecar_path.exists() {
        return Ok(MigrationOutcome::NoSidecar);
    }

    if doc.has_inline_state() {
        return Ok(MigrationOutcome::InlineWins);
    }

    let raw = fs::read_to_string(&sidecar_path)
        .with_context(|| format!("Failed to read sidecar state: {}", sidecar_path.display()))?;
    let sidecar: SidecarFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("Corrupt sidecar state: {}", sidecar_path.display()))?;

    doc.run = sidecar.run;
    doc.specs = sidecar.specs;
    doc.staging = sidecar.staging;
    doc.save()?;

    fs::remove_file(&sidecar_path)
        .with_context(|| format!("Failed to remove sidecar: {}", sidecar_path.display()))?;
    Ok(MigrationOutcome::Migrated)
}
