//! Platform-agnostic external command execution.
//!
//! The chain-of-trust feature shells out for exactly one privileged concern:
//! reading the signing-key file through the platform's native reader so the
//! OS enforces its own ACL semantics on the key path. Everything here is
//! written so that secret material can only ever travel over the captured
//! stdout pipe — the program path and argument list carry non-secret paths
//! only, and the [`Debug`] rendering of an invocation redacts environment
//! values so a traced invocation can never leak.
//!
//! # Timeouts
//!
//! Every run carries a deadline. A child that outlives it is killed and
//! reaped before control returns; a timed-out call never leaves a surviving
//! process behind. `kill_on_drop` is set as a backstop so that cancelling
//! the whole task finalization (worker shutdown) also terminates in-flight
//! children.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::redact::REDACTED;

/// Host platform, detected once at startup.
///
/// The variants differ only in how the native key-read helper is invoked;
/// the [`CommandRunner`] contract is identical across all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Linux hosts.
    Linux,
    /// macOS hosts.
    MacOs,
    /// Windows hosts.
    Windows,
}

impl Platform {
    /// Detects the platform this process is running on.
    #[must_use]
    pub const fn host() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Linux
        }
    }

    /// Builds the invocation that prints a file's bytes to stdout using the
    /// platform's native reader.
    ///
    /// Only the (non-secret) file path appears in the argument list; the
    /// file contents are captured solely from the child's stdout pipe and
    /// are never staged through an intermediate file.
    #[must_use]
    pub fn file_read_invocation(self, path: &Path) -> CommandInvocation {
        match self {
            Self::Windows => CommandInvocation::new(
                "cmd.exe",
                vec![
                    "/c".to_string(),
                    "type".to_string(),
                    path.display().to_string(),
                ],
            ),
            Self::Linux | Self::MacOs => {
                CommandInvocation::new("/bin/cat", vec![path.display().to_string()])
            },
        }
    }
}

/// A single external command execution request.
///
/// Ephemeral: owned by the caller for one [`CommandRunner::run`] call and
/// never retained afterwards.
#[derive(Clone)]
pub struct CommandInvocation {
    /// Program to execute.
    pub program: PathBuf,
    /// Argument list. Must never embed secret material: arguments are
    /// visible to every process on the host via the process table.
    pub args: Vec<String>,
    /// Working directory, or the worker's current directory when `None`.
    pub working_dir: Option<PathBuf>,
    /// Extra environment for the child. Values may be sensitive and are
    /// redacted from the `Debug` rendering.
    pub env: Vec<(String, String)>,
}

impl CommandInvocation {
    /// Creates an invocation with a program and arguments.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            env: Vec::new(),
        }
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable for the child process.
    #[must_use]
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }
}

impl fmt::Debug for CommandInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Environment values are redacted wholesale: this type is traced on
        // failure paths and must be safe to log without inspection.
        let env: Vec<(&str, &str)> = self
            .env
            .iter()
            .map(|(name, _)| (name.as_str(), REDACTED))
            .collect();
        f.debug_struct("CommandInvocation")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("working_dir", &self.working_dir)
            .field("env", &env)
            .finish()
    }
}

/// Captured output of a successfully exited command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Raw stdout bytes. May contain secret material (e.g. key bytes read
    /// via the native file reader); callers own its lifetime.
    pub stdout: Vec<u8>,
    /// Stderr, lossily decoded. Diagnostic only.
    pub stderr_text: String,
}

/// Errors from launching or supervising an external command.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutionError {
    /// The program could not be found on the host.
    #[error("executable not found: {program}")]
    NotFound {
        /// Program that was requested.
        program: PathBuf,
    },

    /// The process could not be spawned or supervised.
    #[error("failed to run {program}: {message}")]
    Spawn {
        /// Program that was requested.
        program: PathBuf,
        /// OS error text.
        message: String,
    },

    /// The process exited with a non-zero status.
    #[error("{program} exited with {code:?}: {stderr}")]
    NonZeroExit {
        /// Program that was run.
        program: PathBuf,
        /// Exit code, if one was reported.
        code: Option<i32>,
        /// Captured stderr text.
        stderr: String,
    },

    /// The process exceeded its deadline and was terminated.
    #[error("{program} timed out after {timeout:?} and was killed")]
    Timeout {
        /// Program that was run.
        program: PathBuf,
        /// The deadline that elapsed.
        timeout: Duration,
    },
}

/// Runs external commands with captured output and an enforced deadline.
///
/// Implemented by [`TokioCommandRunner`] in production; tests substitute
/// their own implementations to script helper behavior.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the invocation to completion.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::NotFound`] when the program does not
    /// exist, [`ExecutionError::NonZeroExit`] when it exits unsuccessfully,
    /// and [`ExecutionError::Timeout`] when the deadline elapses. In the
    /// timeout case the child has been killed and reaped before the error
    /// is returned.
    async fn run(
        &self,
        invocation: &CommandInvocation,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecutionError>;
}

/// Production command runner backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(
        &self,
        invocation: &CommandInvocation,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecutionError> {
        let program = invocation.program.clone();

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Backstop: if the task finalization is cancelled, dropping the
            // child must not orphan it.
            .kill_on_drop(true);

        if let Some(dir) = &invocation.working_dir {
            cmd.current_dir(dir);
        }
        for (name, value) in &invocation.env {
            cmd.env(name, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecutionError::NotFound {
                    program: program.clone(),
                }
            } else {
                ExecutionError::Spawn {
                    program: program.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        let mut stdout_pipe = child.stdout.take().ok_or_else(|| ExecutionError::Spawn {
            program: program.clone(),
            message: "stdout pipe unavailable".to_string(),
        })?;
        let mut stderr_pipe = child.stderr.take().ok_or_else(|| ExecutionError::Spawn {
            program: program.clone(),
            message: "stderr pipe unavailable".to_string(),
        })?;

        // Drain both pipes while waiting so a chatty child cannot deadlock
        // against a full pipe buffer.
        let supervised = tokio::time::timeout(timeout, async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let (out_res, err_res, status_res) = tokio::join!(
                stdout_pipe.read_to_end(&mut stdout),
                stderr_pipe.read_to_end(&mut stderr),
                child.wait(),
            );
            out_res?;
            err_res?;
            let status = status_res?;
            Ok::<_, std::io::Error>((stdout, stderr, status))
        })
        .await;

        match supervised {
            Ok(Ok((stdout, stderr, status))) => {
                let stderr_text = String::from_utf8_lossy(&stderr).into_owned();
                if status.success() {
                    Ok(CommandOutput {
                        stdout,
                        stderr_text,
                    })
                } else {
                    Err(ExecutionError::NonZeroExit {
                        program,
                        code: status.code(),
                        stderr: stderr_text,
                    })
                }
            },
            Ok(Err(e)) => Err(ExecutionError::Spawn {
                program,
                message: e.to_string(),
            }),
            Err(_elapsed) => {
                // Deadline elapsed: terminate forcibly and reap before
                // returning so no child survives the call.
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(ExecutionError::Timeout { program, timeout })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_file_read_uses_cmd_type() {
        let inv = Platform::Windows.file_read_invocation(Path::new("C:\\keys\\cot.key"));
        assert_eq!(inv.program, PathBuf::from("cmd.exe"));
        assert_eq!(inv.args, vec!["/c", "type", "C:\\keys\\cot.key"]);
    }

    #[test]
    fn posix_file_read_uses_cat() {
        for platform in [Platform::Linux, Platform::MacOs] {
            let inv = platform.file_read_invocation(Path::new("/etc/worker/cot.key"));
            assert_eq!(inv.program, PathBuf::from("/bin/cat"));
            assert_eq!(inv.args, vec!["/etc/worker/cot.key"]);
        }
    }

    #[test]
    fn invocation_debug_redacts_env_values() {
        let inv = CommandInvocation::new("/bin/cat", vec!["/tmp/file".to_string()])
            .with_env("HELPER_TOKEN", "super-secret-value");
        let rendered = format!("{inv:?}");

        assert!(rendered.contains("HELPER_TOKEN"));
        assert!(!rendered.contains("super-secret-value"));
        assert!(rendered.contains(REDACTED));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_captures_stdout() {
        let inv = CommandInvocation::new("/bin/echo", vec!["hello".to_string()]);
        let output = TokioCommandRunner
            .run(&inv, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.stdout, b"hello\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_reports_non_zero_exit_with_stderr() {
        let inv = CommandInvocation::new(
            "/bin/sh",
            vec!["-c".to_string(), "echo oops >&2; exit 3".to_string()],
        );
        let err = TokioCommandRunner
            .run(&inv, Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ExecutionError::NonZeroExit { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("oops"));
            },
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_reports_missing_program() {
        let inv = CommandInvocation::new("/nonexistent/program-xyz", vec![]);
        let err = TokioCommandRunner
            .run(&inv, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::NotFound { .. }));
    }
}
