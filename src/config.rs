//! Engine configuration.
//!
//! Defaults are built into the binary; the `AUTOSPEC_DAG_*` /
//! `AUTOSPEC_WORKTREE_*` environment family overrides them, and CLI flags
//! override both. All parsing errors name the offending variable.

use anyhow::{Context, Result};
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::paths;

/// What to do when a staging merge conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictMode {
    /// Surface the conflict and stop; a human resolves it.
    #[default]
    Manual,
    /// Hand the conflicted working copy to a resolution agent session.
    Agent,
}

impl fmt::Display for ConflictMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictMode::Manual => write!(f, "manual"),
            ConflictMode::Agent => write!(f, "agent"),
        }
    }
}

pub const DEFAULT_MAX_PARALLEL: usize = 4;
pub const DEFAULT_MAX_LOG_SIZE: u64 = 50 * 1024 * 1024;
pub const DEFAULT_AUTOCOMMIT_RETRIES: u32 = 1;
/// Hard timeout for a user-supplied autocommit command.
pub const AUTOCOMMIT_CMD_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    /// Merge target and the branch L0 specs branch from.
    pub base_branch: String,
    pub on_conflict: ConflictMode,
    /// Worker pool bound; min 1.
    pub max_parallel: usize,
    pub fail_fast: bool,
    pub autocommit: bool,
    /// User-supplied commit command template; when absent, a commit-dedicated
    /// agent session is used instead.
    pub autocommit_cmd: Option<String>,
    /// Clamped to [0, 10].
    pub autocommit_retries: u32,
    pub automerge: bool,
    /// Reserved: parsed and validated but not yet consumed by any component.
    pub max_spec_retries: u32,
    /// Per-spec log file truncation threshold, bytes.
    pub max_log_size: u64,
    pub log_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub worktree_root: Option<PathBuf>,
    /// Agent executable invoked per spec.
    pub agent_cmd: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            on_conflict: ConflictMode::Manual,
            max_parallel: DEFAULT_MAX_PARALLEL,
            fail_fast: false,
            autocommit: true,
            autocommit_cmd: None,
            autocommit_retries: DEFAULT_AUTOCOMMIT_RETRIES,
            automerge: false,
            max_spec_retries: 0,
            max_log_size: DEFAULT_MAX_LOG_SIZE,
            log_dir: None,
            state_dir: None,
            worktree_root: None,
            agent_cmd: "autospec".to_string(),
        }
    }
}

impl Config {
    /// Defaults overlaid with the environment. Fails on malformed values and
    /// on inconsistent combinations (`automerge` without `autocommit`).
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        if let Some(v) = env_var("AUTOSPEC_DAG_BASE_BRANCH") {
            config.base_branch = v;
        }
        if let Some(v) = env_var("AUTOSPEC_DAG_ON_CONFLICT") {
            config.on_conflict = match v.to_lowercase().as_str() {
                "manual" => ConflictMode::Manual,
                "agent" => ConflictMode::Agent,
                other => anyhow::bail!(
                    "AUTOSPEC_DAG_ON_CONFLICT must be 'manual' or 'agent', got '{}'",
                    other
                ),
            };
        }
        if let Some(v) = env_var("AUTOSPEC_DAG_AUTOCOMMIT") {
            config.autocommit = parse_bool(&v).context("AUTOSPEC_DAG_AUTOCOMMIT")?;
        }
        if let Some(v) = env_var("AUTOSPEC_DAG_AUTOCOMMIT_CMD") {
            config.autocommit_cmd = Some(v);
        }
        if let Some(v) = env_var("AUTOSPEC_DAG_AUTOCOMMIT_RETRIES") {
            let n: i64 = v.parse().context("AUTOSPEC_DAG_AUTOCOMMIT_RETRIES")?;
            config.autocommit_retries = n.clamp(0, 10) as u32;
        }
        if let Some(v) = env_var("AUTOSPEC_DAG_AUTOMERGE") {
            config.automerge = parse_bool(&v).context("AUTOSPEC_DAG_AUTOMERGE")?;
        }
        if let Some(v) = env_var("AUTOSPEC_DAG_MAX_SPEC_RETRIES") {
            config.max_spec_retries = v.parse().context("AUTOSPEC_DAG_MAX_SPEC_RETRIES")?;
        }
        if let Some(v) = env_var("AUTOSPEC_DAG_MAX_LOG_SIZE") {
            config.max_log_size = parse_size(&v).context("AUTOSPEC_DAG_MAX_LOG_SIZE")?;
        }
        if let Some(v) = env_var("AUTOSPEC_DAG_LOG_DIR") {
            config.log_dir = Some(expand_path(&v));
        }
        if let Some(v) = env_var("AUTOSPEC_DAG_STATE_DIR") {
            config.state_dir = Some(expand_path(&v));
        }
        if let Some(v) = env_var("AUTOSPEC_WORKTREE_ROOT") {
            config.worktree_root = Some(expand_path(&v));
        }
        if let Some(v) = env_var("AUTOSPEC_AGENT_CMD") {
            config.agent_cmd = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.automerge && !self.autocommit {
            anyhow::bail!(
                "automerge requires autocommit: unset AUTOSPEC_DAG_AUTOMERGE or enable AUTOSPEC_DAG_AUTOCOMMIT"
            );
        }
        if self.max_parallel == 0 {
            anyhow::bail!("max_parallel must be at least 1");
        }
        Ok(())
    }

    /// Layer staging is active only when completed specs are merged into
    /// their layer's staging branch as they finish.
    pub fn staging_enabled(&self) -> bool {
        self.automerge
    }

    /// State directory for locks and migrated sidecar files.
    pub fn state_dir(&self, repo_root: &Path) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| repo_root.join(paths::STATE_DIR))
    }

    /// Root directory under which per-spec worktrees are created.
    pub fn worktree_root(&self, repo_root: &Path) -> PathBuf {
        self.worktree_root
            .clone()
            .unwrap_or_else(|| repo_root.join(paths::WORKTREES_DIR))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn expand_path(value: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(value).to_string())
}

/// Parse a boolean env value: true/false, 1/0, yes/no (case-insensitive).
pub fn parse_bool(value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => anyhow::bail!("expected a boolean, got '{}'", other),
    }
}

/// Parse a size string like `50MB`, `512kb`, `1 GB`, or a bare byte count.
pub fn parse_size(value: &str) -> Result<u64> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let n: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid size '{}'", value))?;

    let multiplier = match unit.trim().to_uppercase().as_str() {
        "" | "B" => 1,
        "KB" => 1024,
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        other => anyhow::bail!("invalid size unit '{}' in '{}'", other, value),
    };
    Ok(n * multiplier)
}

/// Template variables available to the autocommit command.
#[derive(Debug, Clone)]
pub struct TemplateVars {
    pub spec_id: String,
    pub worktree: String,
    pub branch: String,
    pub base_branch: String,
    pub dag_id: String,
}

/// Expand `{FieldName}` placeholders against the fixed allow-list
/// `{SpecID, Worktree, Branch, BaseBranch, DagID}`.
///
/// An unknown placeholder is a configuration error naming the placeholder.
pub fn expand_template(template: &str, vars: &TemplateVars) -> Result<String> {
    let re = Regex::new(r"\{([A-Za-z_]+)\}").expect("placeholder regex is valid");
    let mut result = String::with_capacity(template.len());
    let mut last = 0;

    for caps in re.captures_iter(template) {
        let whole = caps.get(0).expect("capture 0 always present");
        let key = &caps[1];
        result.push_str(&template[last..whole.start()]);
        let value = match key {
            "SpecID" => &vars.spec_id,
            "Worktree" => &vars.worktree,
            "Branch" => &vars.branch,
            "BaseBranch" => &vars.base_branch,
            "DagID" => &vars.dag_id,
            other => anyhow::bail!(
                "unknown placeholder '{{{}}}' in autocommit command (allowed: SpecID, Worktree, Branch, BaseBranch, DagID)",
                other
            ),
        };
        result.push_str(value);
        last = whole.end();
    }
    result.push_str(&template[last..]);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> TemplateVars {
        TemplateVars {
            spec_id: "auth-api".to_string(),
            worktree: "/wt/dag-x-auth-api".to_string(),
            branch: "dag/x/auth-api".to_string(),
            base_branch: "main".to_string(),
            dag_id: "x".to_string(),
        }
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true").unwrap());
        assert!(parse_bool("1").unwrap());
        assert!(parse_bool("YES").unwrap());
        assert!(!parse_bool("false").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("50MB").unwrap(), 50 * 1024 * 1024);
        assert_eq!(parse_size("512kb").unwrap(), 512 * 1024);
        assert_eq!(parse_size("1 GB").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("64B").unwrap(), 64);
        assert!(parse_size("10TB").is_err());
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn test_automerge_requires_autocommit() {
        let config = Config {
            automerge: true,
            autocommit: false,
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("automerge requires autocommit"));
    }

    #[test]
    fn test_expand_template_all_fields() {
        let expanded = expand_template(
            "git -C {Worktree} commit -am 'dag({DagID}): {SpecID} on {Branch} from {BaseBranch}'",
            &vars(),
        )
        .unwrap();
        assert_eq!(
            expanded,
            "git -C /wt/dag-x-auth-api commit -am 'dag(x): auth-api on dag/x/auth-api from main'"
        );
    }

    #[test]
    fn test_expand_template_unknown_placeholder() {
        let err = expand_template("commit {Nope}", &vars()).unwrap_err().to_string();
        assert!(err.contains("{Nope}"), "got: {}", err);
        assert!(err.contains("SpecID"), "got: {}", err);
    }

    #[test]
    fn test_expand_template_no_placeholders() {
        assert_eq!(
            expand_template("git commit -am wip", &vars()).unwrap(),
            "git commit -am wip"
        );
    }
}
