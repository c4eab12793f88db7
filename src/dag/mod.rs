//! DAG definition parsing, validation, and inline runtime state.

// Submodules
mod model;
mod parse;
mod state;
mod validate;

// Re-export types from submodules
pub use model::{
    CommitStatus, Dag, DagMeta, Feature, Layer, LayerStaging, MergeState, MergeStatus,
    ResolutionMethod, RunState, RunStatus, SpecRuntime, SpecStatus, slugify,
};
pub use parse::{
    atomic_write, migrate_legacy_state, normalize_workflow_path, Document, MigrationOutcome,
};
pub use state::{
    effective_deps, generate_run_id, new_run_state, status_counts, status_map, StatusCounts,
};
pub use validate::validate;
