//! External agent invocation.
//!
//! The agent is an opaque subprocess: it receives the worktree as its
//! working directory, runs the spec's workflow, and is expected to make
//! commits. The engine streams its stdout/stderr verbatim to the output
//! fan-out and never parses or interprets agent output.

use anyhow::{Context, Result};
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;

/// One agent invocation.
#[derive(Debug)]
pub struct AgentRequest<'a> {
    pub spec_id: &'a str,
    pub prompt: &'a str,
    pub work_dir: &'a Path,
    pub branch: Option<&'a str>,
    pub timeout: Option<Duration>,
}

/// Seam between the engine and the agent runtime. Implemented by the
/// subprocess-backed [`CommandAgent`] in production and by stubs in tests.
pub trait Agent: Send + Sync {
    /// Run the agent to completion, streaming each output line to `on_line`.
    ///
    /// Returns the agent's exit code. Cancellation and timeout kill the
    /// subprocess and surface as errors.
    fn execute(
        &self,
        req: &AgentRequest,
        cancel: &CancelToken,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<i32>;
}

/// Agent backed by an external CLI command.
///
/// The command is invoked as `<command> --autonomous <prompt>` with the
/// worktree as working directory and `AUTOSPEC_*` environment variables
/// identifying the spec.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: String,
    autonomous: bool,
}

impl CommandAgent {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            autonomous: true,
        }
    }
}

impl Agent for CommandAgent {
    fn execute(
        &self,
        req: &AgentRequest,
        cancel: &CancelToken,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<i32> {
        let mut cmd = Command::new(&self.command);
        if self.autonomous {
            cmd.arg("--autonomous");
        }
        cmd.arg(req.prompt)
            .current_dir(req.work_dir)
            .env("AUTOSPEC_SPEC_ID", req.spec_id)
            .env("AUTOSPEC_WORKTREE", req.work_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(branch) = req.branch {
            cmd.env("AUTOSPEC_BRANCH", branch);
        }

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "Failed to invoke agent '{}'. Is it installed and in PATH?",
                self.command
            )
        })?;

        // Reader threads forward both streams into one channel; the
        // supervisor loop below stays free to watch for cancellation.
        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(std::thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(tx);

        let started = Instant::now();
        let status = loop {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(line) => on_line(&line),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    std::thread::sleep(Duration::from_millis(20));
                }
            }

            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                for r in readers {
                    let _ = r.join();
                }
                anyhow::bail!("agent for '{}' cancelled", req.spec_id);
            }

            if let Some(timeout) = req.timeout {
                if started.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    for r in readers {
                        let _ = r.join();
                    }
                    anyhow::bail!(
                        "agent for '{}' timed out after {}s",
                        req.spec_id,
                        timeout.as_secs()
                    );
                }
            }

            if let Some(status) = child.try_wait()? {
                break status;
            }
        };

        for r in readers {
            let _ = r.join();
        }
        // Drain anything buffered after the process exited
        while let Ok(line) = rx.try_recv() {
            on_line(&line);
        }

        Ok(status.code().unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Write an executable fake-agent script and return an agent invoking it.
    fn script_agent(dir: &TempDir, body: &str) -> CommandAgent {
        let path = dir.path().join("fake-agent.sh");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        CommandAgent {
            command: path.display().to_string(),
            autonomous: false,
        }
    }

    fn request<'a>(dir: &'a TempDir, timeout: Option<Duration>) -> AgentRequest<'a> {
        AgentRequest {
            spec_id: "test-spec",
            prompt: "do the work",
            work_dir: dir.path(),
            branch: None,
            timeout,
        }
    }

    #[test]
    fn test_streams_stdout_and_stderr() {
        let dir = TempDir::new().unwrap();
        let agent = script_agent(&dir, "echo out-line\necho err-line >&2\nexit 0");

        let mut lines = Vec::new();
        let cancel = CancelToken::new();
        let code = agent
            .execute(&request(&dir, None), &cancel, &mut |l| {
                lines.push(l.to_string())
            })
            .unwrap();

        assert_eq!(code, 0);
        assert!(lines.contains(&"out-line".to_string()));
        assert!(lines.contains(&"err-line".to_string()));
    }

    #[test]
    fn test_nonzero_exit_code_is_returned() {
        let dir = TempDir::new().unwrap();
        let agent = script_agent(&dir, "exit 3");

        let cancel = CancelToken::new();
        let code = agent
            .execute(&request(&dir, None), &cancel, &mut |_| {})
            .unwrap();
        assert_eq!(code, 3);
    }

    #[test]
    fn test_timeout_kills_agent() {
        let dir = TempDir::new().unwrap();
        let agent = script_agent(&dir, "sleep 30");

        let cancel = CancelToken::new();
        let started = Instant::now();
        let err = agent
            .execute(
                &request(&dir, Some(Duration::from_millis(300))),
                &cancel,
                &mut |_| {},
            )
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(err.to_string().contains("timed out"), "got: {}", err);
    }

    #[test]
    fn test_cancellation_kills_agent() {
        let dir = TempDir::new().unwrap();
        let agent = script_agent(&dir, "sleep 30");

        let cancel = CancelToken::new();
        let cancel_clone = std::sync::Arc::clone(&cancel);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            cancel_clone.cancel(crate::cancel::CancelReason::FailFast);
        });

        let started = Instant::now();
        let err = agent
            .execute(&request(&dir, None), &cancel, &mut |_| {})
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(err.to_string().contains("cancelled"), "got: {}", err);
    }

    #[test]
    fn test_missing_command_names_it() {
        let dir = TempDir::new().unwrap();
        let agent = CommandAgent::new("definitely-not-a-real-agent-binary");

        let cancel = CancelToken::new();
        let err = agent
            .execute(&request(&dir, None), &cancel, &mut |_| {})
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("definitely-not-a-real-agent-binary"));
    }
}
