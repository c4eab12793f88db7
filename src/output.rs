//! Per-spec output fan-out.
//!
//! Agent output is split two ways: a terminal writer that prefixes every
//! line with `[<spec-id>] ` (line starts tracked across partial writes), and
//! a per-spec log file with `[HH:MM:SS]` stamps that truncates itself when
//! it grows past the configured size.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Writer that prepends a prefix at the start of every output line.
///
/// Tracks whether the last byte written ended a line, so a line split across
/// multiple `write` calls is prefixed exactly once.
pub struct PrefixWriter<W: Write> {
    inner: W,
    prefix: Vec<u8>,
    at_line_start: bool,
}

impl<W: Write> PrefixWriter<W> {
    pub fn new(inner: W, prefix: &str) -> Self {
        Self {
            inner,
            prefix: prefix.as_bytes().to_vec(),
            at_line_start: true,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for PrefixWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut out = Vec::with_capacity(buf.len() + self.prefix.len());
        for &byte in buf {
            if self.at_line_start {
                out.extend_from_slice(&self.prefix);
                self.at_line_start = false;
            }
            out.push(byte);
            if byte == b'\n' {
                self.at_line_start = true;
            }
        }
        self.inner.write_all(&out)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Rotating per-spec log file with per-line timestamps.
///
/// When the file exceeds `max_size` it is truncated and restarted with a
/// marker line, so a runaway agent cannot fill the disk.
pub struct SpecLogWriter {
    path: PathBuf,
    file: fs::File,
    size: u64,
    max_size: u64,
}

impl SpecLogWriter {
    /// Open (or append to) the log file for a spec, writing a run header.
    pub fn open(path: &Path, max_size: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log dir {}", parent.display()))?;
        }

        let existing = path.exists();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;

        if existing {
            writeln!(file)?;
            writeln!(file, "{}", "=".repeat(80))?;
        }
        writeln!(file, "# Run started: {}", crate::utc_now_iso())?;
        file.flush()?;

        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
            max_size,
        })
    }

    /// Append one timestamped line and flush for real-time tailing.
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        if self.size > self.max_size {
            self.truncate()?;
        }
        let stamped = format!("[{}] {}\n", chrono::Local::now().format("%H:%M:%S"), line);
        self.file.write_all(stamped.as_bytes())?;
        self.file.flush()?;
        self.size += stamped.len() as u64;
        Ok(())
    }

    fn truncate(&mut self) -> Result<()> {
        let mut file = fs::File::create(&self.path)
            .with_context(|| format!("Failed to truncate log {}", self.path.display()))?;
        writeln!(file, "# Log truncated at {} (size limit reached)", crate::utc_now_iso())?;
        file.flush()?;
        self.size = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.file = file;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Combined terminal + log file sink for one spec.
pub struct SpecOutput {
    spec_id: String,
    term: PrefixWriter<std::io::Stdout>,
    log: Option<SpecLogWriter>,
}

impl SpecOutput {
    /// Open the fan-out for a spec. A log file that cannot be created is a
    /// warning, not a failure: terminal output still flows.
    pub fn open(config: &Config, project: &str, dag_id: &str, spec_id: &str) -> Self {
        let path = spec_log_path(config, project, dag_id, spec_id);
        let log = match SpecLogWriter::open(&path, config.max_log_size) {
            Ok(writer) => Some(writer),
            Err(e) => {
                eprintln!("{} [{}] Failed to open log file: {}", "⚠".yellow(), spec_id, e);
                None
            }
        };
        let prefix = format!("{} ", format!("[{}]", spec_id).cyan());
        Self {
            spec_id: spec_id.to_string(),
            term: PrefixWriter::new(std::io::stdout(), &prefix),
            log,
        }
    }

    /// Fan one line out to the prefixed terminal stream and the log file.
    pub fn line(&mut self, line: &str) {
        if let Err(e) = writeln!(self.term, "{}", line) {
            eprintln!(
                "{} [{}] Failed to write to terminal: {}",
                "⚠".yellow(),
                self.spec_id,
                e
            );
        }
        if let Some(ref mut log) = self.log {
            if let Err(e) = log.write_line(line) {
                eprintln!(
                    "{} [{}] Failed to write to log: {}",
                    "⚠".yellow(),
                    self.spec_id,
                    e
                );
            }
        }
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log.as_ref().map(|l| l.path())
    }
}

/// Directory holding a DAG's per-spec logs:
/// `<cache>/autospec/dag-logs/<project>/<dag_id>/`.
pub fn dag_log_dir(config: &Config, project: &str, dag_id: &str) -> PathBuf {
    let base = config.log_dir.clone().unwrap_or_else(|| {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from(".cache"))
            .join("autospec")
            .join("dag-logs")
    });
    base.join(project).join(dag_id)
}

/// Log file path for one spec.
pub fn spec_log_path(config: &Config, project: &str, dag_id: &str, spec_id: &str) -> PathBuf {
    dag_log_dir(config, project, dag_id).join(format!("{}.log", spec_id))
}

/// Move legacy in-project logs (`.autospec/logs/<dag_id>/*.log`) into the
/// user cache directory. Called on first resume; best effort.
pub fn migrate_legacy_logs(
    repo_root: &Path,
    config: &Config,
    project: &str,
    dag_id: &str,
) -> Result<usize> {
    let legacy_dir = repo_root.join(crate::paths::LEGACY_LOGS_DIR).join(dag_id);
    if !legacy_dir.exists() {
        return Ok(0);
    }

    let dest_dir = dag_log_dir(config, project, dag_id);
    fs::create_dir_all(&dest_dir)
        .with_context(|| format!("Failed to create {}", dest_dir.display()))?;

    let mut moved = 0;
    for entry in fs::read_dir(&legacy_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let dest = dest_dir.join(entry.file_name());
        if dest.exists() {
            continue;
        }
        // rename fails across filesystems; fall back to copy + remove
        if fs::rename(&path, &dest).is_err() {
            fs::copy(&path, &dest)?;
            fs::remove_file(&path)?;
        }
        moved += 1;
    }
    let _ = fs::remove_dir(&legacy_dir);
    Ok(moved)
}
