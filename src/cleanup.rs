//! Post-run worktree cleanup.
//!
//! Classifies every spec's worktree: merged work is safe to remove, anything
//! else (unmerged, failed, uncommitted) is kept unless forced. Missing paths
//! are warnings, not errors, and per-spec failures never stop the sweep.

use std::collections::BTreeMap;
use std::path::Path;

use crate::dag::{Document, MergeStatus, RunStatus, SpecStatus};
use crate::git_ops;
use crate::worktree::{worktree_name, Worktrees};

/// Outcome of a cleanup sweep.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub cleaned: Vec<String>,
    pub kept: Vec<String>,
    pub errors: BTreeMap<String, String>,
    pub warnings: Vec<String>,
}

impl CleanupReport {
    fn merge(&mut self, other: CleanupReport) {
        self.cleaned.extend(other.cleaned);
        self.kept.extend(other.kept);
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Whether a spec's worktree may be removed without `force`.
fn is_safely_removable(doc: &Document, spec_id: &str) -> bool {
    let Some(rt) = doc.specs.get(spec_id) else {
        return false;
    };
    rt.status == SpecStatus::Completed
        && rt.merge.as_ref().map(|m| m.status) == Some(MergeStatus::Merged)
}

/// Clean up the worktrees of one run.
///
/// `force` removes unmerged/failed worktrees too, and deletes the spec
/// branches of removed worktrees.
pub fn cleanup_run(doc: &Document, worktrees: &Worktrees, force: bool) -> CleanupReport {
    let dag_id = doc.dag_id();
    let mut report = CleanupReport::default();

    for feature in doc.dag.features() {
        let spec_id = &feature.id;
        let Some(rt) = doc.specs.get(spec_id) else {
            continue;
        };
        let Some(path) = rt.worktree_path.as_deref() else {
            continue;
        };

        if !Path::new(path).exists() {
            report
                .warnings
                .push(format!("{}: worktree path {} is missing", spec_id, path));
            continue;
        }

        if !is_safely_removable(doc, spec_id) && !force {
            report.kept.push(spec_id.clone());
            continue;
        }

        let name = worktree_name(&dag_id, spec_id);
        match worktrees.remove(&name, force) {
            Ok(()) => {
                if force {
                    if let Some(branch) = rt.branch.as_deref() {
                        // Branch deletion is best effort; unmerged branches
                        // survive a plain cleanup
                        if let Err(e) = git_ops::delete_branch(worktrees.repo_root(), branch, true)
                        {
                            report
                                .warnings
                                .push(format!("{}: could not delete branch: {}", spec_id, e));
                        }
                    }
                }
                report.cleaned.push(spec_id.clone());
            }
            Err(e) => {
                report.errors.insert(spec_id.clone(), format!("{:#}", e));
            }
        }
    }

    report
}

/// Clean up every run that is not currently running.
pub fn cleanup_all(docs: &[Document], worktrees: &Worktrees, force: bool) -> CleanupReport {
    let mut report = CleanupReport::default();
    for doc in docs {
        let running = doc
            .run
            .as_ref()
            .map(|r| r.status == RunStatus::Running)
            .unwrap_or(false);
        if running {
            report.warnings.push(format!(
                "{}: run is still in progress, skipped",
                doc.path.display()
            ));
            continue;
        }
        report.merge(cleanup_run(doc, worktrees, force));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::MergeState;
    use std::fs;
    use std::process::Command;
    use tempfile::TempDir;

    fn git(repo: &Path, args: &[&str]) {
        let out = Command::new("git")
            .args(args)
            .current_dir(repo)
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    }

    fn setup(dir: &TempDir) -> (Worktrees, Document) {
        let repo = dir.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        git(&repo, &["init", "-b", "main"]);
        git(&repo, &["config", "user.email", "test@example.com"]);
        git(&repo, &["config", "user.name", "Test User"]);
        fs::write(repo.join("README.md"), "# Test\n").unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-m", "Initial commit"]);

        let worktrees = Worktrees::new(&repo, dir.path().join("worktrees"));

        let yaml = r#"schema_version: "1"
dag:
  name: clean
  id: clean
layers:
  - id: l0
    features:
      - id: a
        description: a
      - id: b
        description: b
"#;
        let path = dir.path().join("c.dag.yaml");
        fs::write(&path, yaml).unwrap();
        let doc = Document::load(&path).unwrap();
        (worktrees, doc)
    }

    fn provision(worktrees: &Worktrees, doc: &mut Document, spec_id: &str) {
        let name = worktree_name("clean", spec_id);
        let branch = format!("dag/clean/{}", spec_id);
        let info = worktrees.create(&name, &branch, "main", None).unwrap();
        let rt = doc.spec_runtime_mut(spec_id);
        rt.worktree_path = Some(info.path.display().to_string());
        rt.branch = Some(branch);
    }

    #[test]
    fn test_merged_worktree_removed() {
        let dir = TempDir::new().unwrap();
        let (worktrees, mut doc) = setup(&dir);
        provision(&worktrees, &mut doc, "a");
        {
            let rt = doc.spec_runtime_mut("a");
            rt.status = SpecStatus::Completed;
            rt.merge = Some(MergeState {
                status: MergeStatus::Merged,
                ..Default::default()
            });
        }

        let report = cleanup_run(&doc, &worktrees, false);
        assert_eq!(report.cleaned, vec!["a"]);
        assert!(report.errors.is_empty());
        assert!(worktrees.get(&worktree_name("clean", "a")).unwrap().is_none());
    }

    #[test]
    fn test_unmerged_worktree_kept_without_force() {
        let dir = TempDir::new().unwrap();
        let (worktrees, mut doc) = setup(&dir);
        provision(&worktrees, &mut doc, "a");
        doc.spec_runtime_mut("a").status = SpecStatus::Failed;

        let report = cleanup_run(&doc, &worktrees, false);
        assert_eq!(report.kept, vec!["a"]);
        assert!(report.cleaned.is_empty());
        assert!(worktrees.get(&worktree_name("clean", "a")).unwrap().is_some());
    }

    #[test]
    fn test_force_removes_everything() {
        let dir = TempDir::new().unwrap();
        let (worktrees, mut doc) = setup(&dir);
        provision(&worktrees, &mut doc, "a");
        provision(&worktrees, &mut doc, "b");
        doc.spec_runtime_mut("a").status = SpecStatus::Failed;
        {
            let rt = doc.spec_runtime_mut("b");
            rt.status = SpecStatus::Completed;
            rt.merge = Some(MergeState {
                status: MergeStatus::MergeFailed,
                ..Default::default()
            });
        }

        let report = cleanup_run(&doc, &worktrees, true);
        assert_eq!(report.cleaned.len(), 2);
        assert!(report.kept.is_empty());
        // Branches deleted too
        assert!(!git_ops::branch_exists(worktrees.repo_root(), "dag/clean/a").unwrap());
    }

    #[test]
    fn test_missing_path_is_warning() {
        let dir = TempDir::new().unwrap();
        let (worktrees, mut doc) = setup(&dir);
        {
            let rt = doc.spec_runtime_mut("a");
            rt.status = SpecStatus::Completed;
            rt.worktree_path = Some("/nonexistent/worktree/path".to_string());
            rt.merge = Some(MergeState {
                status: MergeStatus::Merged,
                ..Default::default()
            });
        }

        let report = cleanup_run(&doc, &worktrees, false);
        assert!(report.cleaned.is_empty());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("missing"));
    }

    #[test]
    fn test_cleanup_all_skips_running() {
        let dir = TempDir::new().unwrap();
        let (worktrees, mut doc) = setup(&dir);
        provision(&worktrees, &mut doc, "a");
        {
            let rt = doc.spec_runtime_mut("a");
            rt.status = SpecStatus::Completed;
            rt.merge = Some(MergeState {
                status: MergeStatus::Merged,
                ..Default::default()
            });
        }
        doc.run = Some(crate::dag::RunState {
            status: RunStatus::Running,
            run_id: "run-1".to_string(),
            ..Default::default()
        });

        let report = cleanup_all(&[doc], &worktrees, false);
        assert!(report.cleaned.is_empty());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("in progress"));
    }
}
