//! External process execution with combined output captured to a log file.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::unit::ExecInfo;

/// Logs at or above this many lines are excerpted.
pub const EXCERPT_THRESHOLD_LINES: usize = 1000;
pub const EXCERPT_HEAD_LINES: usize = 300;
pub const EXCERPT_TAIL_LINES: usize = 700;

/// A fully specified process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Command line as a single string, for logs and records.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.cwd)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    /// Nonzero exit code, or `-1` when killed by a signal.
    Failed(i32),
    /// Killed after exceeding its wall-clock ceiling.
    TimedOut(Duration),
}

impl ExitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitOutcome::Success)
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            ExitOutcome::Success => 0,
            ExitOutcome::Failed(code) => *code,
            ExitOutcome::TimedOut(_) => -1,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ExitOutcome::Success => "ok".to_string(),
            ExitOutcome::Failed(code) => format!("exit code {code}"),
            ExitOutcome::TimedOut(limit) => format!("timed out after {}s", limit.as_secs()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub info: ExecInfo,
    pub outcome: ExitOutcome,
}

/// Run `spec` with stdout and stderr both appended to `log`.
///
/// With a `timeout`, the process is killed once the ceiling passes and the
/// outcome is [`ExitOutcome::TimedOut`].
pub async fn execute_logged(
    spec: &CommandSpec,
    log: &Path,
    timeout: Option<Duration>,
) -> Result<Execution> {
    let command_line = spec.display();
    debug!(cwd = %spec.cwd.display(), log = %log.display(), "exec: {command_line}");

    let stdout = std::fs::File::create(log)?;
    let stderr = stdout.try_clone()?;

    let start = Instant::now();
    let mut child = spec
        .command()
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
        .map_err(|source| PipelineError::Spawn {
            command: command_line.clone(),
            source,
        })?;

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status_outcome(status?),
            Err(_) => {
                warn!(command = %command_line, "process exceeded {}s, killing", limit.as_secs());
                if let Err(e) = child.kill().await {
                    warn!(command = %command_line, error = %e, "failed to kill process");
                }
                ExitOutcome::TimedOut(limit)
            }
        },
        None => status_outcome(child.wait().await?),
    };

    Ok(Execution {
        info: ExecInfo {
            command: command_line,
            exit_code: outcome.exit_code(),
            cwd: spec.cwd.clone(),
            duration_ms: start.elapsed().as_millis() as u64,
        },
        outcome,
    })
}

/// Run `spec` to completion and capture stdout; stderr is kept for errors.
pub async fn capture_stdout(spec: &CommandSpec) -> Result<(ExitOutcome, String, String)> {
    let command_line = spec.display();
    debug!(cwd = %spec.cwd.display(), "exec: {command_line}");

    let output = spec
        .command()
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| PipelineError::Spawn {
            command: command_line,
            source,
        })?;

    Ok((
        status_outcome(output.status),
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    ))
}

fn status_outcome(status: std::process::ExitStatus) -> ExitOutcome {
    if status.success() {
        ExitOutcome::Success
    } else {
        ExitOutcome::Failed(status.code().unwrap_or(-1))
    }
}

/// Bounded head + tail excerpt of a long log.
pub fn excerpt(log: &str) -> String {
    let lines: Vec<&str> = log.lines().collect();
    if lines.len() < EXCERPT_THRESHOLD_LINES {
        return log.to_string();
    }

    let omitted = lines.len() - EXCERPT_HEAD_LINES - EXCERPT_TAIL_LINES;
    let mut out: Vec<String> = Vec::with_capacity(EXCERPT_HEAD_LINES + EXCERPT_TAIL_LINES + 1);
    out.extend(lines[..EXCERPT_HEAD_LINES].iter().map(|l| l.to_string()));
    out.push(format!("... {omitted} lines ..."));
    out.extend(lines[lines.len() - EXCERPT_TAIL_LINES..].iter().map(|l| l.to_string()));
    out.join("\n")
}

/// Read a log file (lossily) and excerpt it.
pub async fn read_excerpt(log: &Path) -> Result<String> {
    let bytes = tokio::fs::read(log).await?;
    Ok(excerpt(&String::from_utf8_lossy(&bytes)))
}

/// Delete an artifact left by an earlier run. A missing file is not an error.
pub fn remove_stale(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
