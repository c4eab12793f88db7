//! Runtime-state helpers layered over the document model.
//!
//! Run-id generation, effective dependency computation for scheduling, and
//! status aggregation for progress/summary output.

use std::collections::{BTreeMap, BTreeSet};

use super::model::{SpecStatus, RunState, RunStatus};
use super::parse::Document;

/// Generate a timestamped run id, e.g. `run-20260801-142251`.
pub fn generate_run_id() -> String {
    format!(
        "run-{}",
        chrono::Utc::now().format("%Y%m%d-%H%M%S")
    )
}

/// Start a fresh run record for a document.
pub fn new_run_state(doc: &Document) -> RunState {
    RunState {
        status: RunStatus::Running,
        run_id: generate_run_id(),
        dag_file: doc.path.display().to_string(),
        started_at: Some(crate::utc_now_iso()),
        completed_at: None,
    }
}

/// Effective scheduling dependencies of a spec: its explicit `depends_on`
/// plus every spec in each layer its layer depends on, plus (when layer
/// staging is enabled) every spec of the immediately preceding layer, since
/// this layer's worktrees branch from that layer's completed staging branch.
pub fn effective_deps(doc: &Document, spec_id: &str, staging_enabled: bool) -> BTreeSet<String> {
    let mut deps = BTreeSet::new();
    let Some((layer_idx, layer, feature)) = doc.dag.find_feature(spec_id) else {
        return deps;
    };

    for dep in &feature.depends_on {
        deps.insert(dep.clone());
    }

    for layer_dep in &layer.depends_on {
        if let Some(dep_layer) = doc.dag.layers.iter().find(|l| &l.id == layer_dep) {
            for f in &dep_layer.features {
                deps.insert(f.id.clone());
            }
        }
    }

    if staging_enabled && layer_idx > 0 {
        for f in &doc.dag.layers[layer_idx - 1].features {
            deps.insert(f.id.clone());
        }
    }

    deps.remove(spec_id);
    deps
}

/// Counts of specs per status for one document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
}

/// Aggregate spec statuses across the DAG; specs without a runtime record
/// count as pending.
pub fn status_counts(doc: &Document) -> StatusCounts {
    let mut counts = StatusCounts::default();
    for feature in doc.dag.features() {
        counts.total += 1;
        let status = doc
            .specs
            .get(&feature.id)
            .map(|r| r.status)
            .unwrap_or_default();
        match status {
            SpecStatus::Pending => counts.pending += 1,
            SpecStatus::Running => counts.running += 1,
            SpecStatus::Completed => counts.completed += 1,
            SpecStatus::Failed => counts.failed += 1,
            SpecStatus::Blocked => counts.blocked += 1,
        }
    }
    counts
}

/// Current status of each spec, keyed by id, for readiness computation.
pub fn status_map(doc: &Document) -> BTreeMap<String, SpecStatus> {
    doc.dag
        .features()
        .map(|f| {
            (
                f.id.clone(),
                doc.specs.get(&f.id).map(|r| r.status).unwrap_or_default(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn doc_with(yaml: &str) -> (TempDir, Document) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.dag.yaml");
        fs::write(&path, yaml).unwrap();
        let doc = Document::load(&path).unwrap();
        (dir, doc)
    }

    const TWO_LAYERS: &str = r#"schema_version: "1"
dag:
  name: deps
layers:
  - id: l0
    features:
      - id: a
        description: a
      - id: b
        description: b
  - id: l1
    depends_on: [l0]
    features:
      - id: c
        description: c
        depends_on: [a]
"#;

    #[test]
    fn test_run_id_shape() {
        let id = generate_run_id();
        assert!(id.starts_with("run-"));
        assert_eq!(id.len(), "run-20260801-142251".len());
    }

    #[test]
    fn test_effective_deps_explicit_only() {
        let (_dir, doc) = doc_with(TWO_LAYERS);
        let deps = effective_deps(&doc, "a", false);
        assert!(deps.is_empty());
    }

    #[test]
    fn test_effective_deps_layer_dependency() {
        let (_dir, doc) = doc_with(TWO_LAYERS);
        // Without staging: layer dependency pulls in all of l0
        let deps = effective_deps(&doc, "c", false);
        assert_eq!(
            deps,
            ["a", "b"].iter().map(|s| s.to_string()).collect()
        );
    }

    #[test]
    fn test_effective_deps_staging_adds_previous_layer() {
        let yaml = r#"schema_version: "1"
dag:
  name: deps2
layers:
  - id: l0
    features:
      - id: a
        description: a
  - id: l1
    features:
      - id: b
        description: b
"#;
        let (_dir, doc) = doc_with(yaml);
        // No explicit layer dep, but staging means l1 branches from stage-l0
        assert!(effective_deps(&doc, "b", false).is_empty());
        let deps = effective_deps(&doc, "b", true);
        assert_eq!(deps, ["a"].iter().map(|s| s.to_string()).collect());
    }

    #[test]
    fn test_status_counts_defaults_to_pending() {
        let (_dir, mut doc) = doc_with(TWO_LAYERS);
        doc.spec_runtime_mut("a").status = SpecStatus::Completed;

        let counts = status_counts(&doc);
        assert_eq!(counts.total, 3);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.pending, 2);
    }
}
