//! External process execution used by the provider adapter, the validator,
//! the provisioner, and the release path.
//!
//! Every host command (the `aws` client, `blkid`, the fsck family, `mkfs`,
//! `mount`, `fuser`, `umount`) goes through [`CommandRunner`] so tests can
//! replay scripted outcomes instead of touching real disks.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use shell_escape::unix::escape;
use thiserror::Error;
use tokio::process::Command;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Renders the exit code for log and error messages.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Errors raised before a command produces an exit status.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// Raised when the process cannot be started at all.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that could not be started.
        program: String,
        /// Operating system error message.
        message: String,
    },
    /// Raised when the process outlives its timeout and is killed.
    #[error("{program} timed out after {after:?}")]
    TimedOut {
        /// Program that was killed.
        program: String,
        /// Timeout that elapsed.
        after: Duration,
    },
}

/// Future returned by [`CommandRunner::run`].
pub type CommandFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, CommandError>> + Send + 'a>>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// When `timeout` is set the process is killed once it elapses.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the command cannot be started and
    /// [`CommandError::TimedOut`] if it exceeds `timeout`.
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        timeout: Option<Duration>,
    ) -> CommandFuture<'a>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        timeout: Option<Duration>,
    ) -> CommandFuture<'a> {
        Box::pin(async move {
            tracing::debug!(command = %render_command(program, args), "running command");
            let child = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output();

            let output = match timeout {
                Some(limit) => tokio::time::timeout(limit, child).await.map_err(|_| {
                    CommandError::TimedOut {
                        program: program.to_owned(),
                        after: limit,
                    }
                })?,
                None => child.await,
            }
            .map_err(|err| CommandError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// Renders a command line with shell quoting for log output.
#[must_use]
pub fn render_command(program: &str, args: &[OsString]) -> String {
    let mut rendered = String::from(program);
    for arg in args {
        rendered.push(' ');
        let text = arg.to_string_lossy();
        rendered.push_str(escape(text).as_ref());
    }
    rendered
}

/// Builds an owned argument vector from string slices.
#[must_use]
pub fn args<I, S>(items: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    items.into_iter().map(Into::into).collect()
}
