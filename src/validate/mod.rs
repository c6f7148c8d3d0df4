//! Filesystem probing and read-only consistency checks.
//!
//! A volume is usable only when `blkid` reports a filesystem type and the
//! matching checker exits cleanly within [`CHECK_TIMEOUT`]. Anything else is
//! a [`Verdict::Unusable`] verdict, which callers answer by blacklisting the
//! volume. Only a failure to run the tools at all is an error.

use std::ffi::OsString;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::command::{CommandError, CommandOutput, CommandRunner, args};

/// Upper bound on a single filesystem check.
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of validating a device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// The device holds a consistent filesystem.
    Healthy {
        /// Filesystem type reported by `blkid`.
        fs_type: String,
    },
    /// The device cannot be used as-is.
    Unusable {
        /// Human-readable reason, recorded in the blacklist tag.
        reason: String,
    },
}

/// Runs the probe and checker commands through a [`CommandRunner`].
#[derive(Clone, Debug)]
pub struct Validator<R: CommandRunner> {
    runner: R,
    check_timeout: Duration,
}

impl<R: CommandRunner> Validator<R> {
    /// Creates a validator with the default check timeout.
    #[must_use]
    pub const fn new(runner: R) -> Self {
        Self {
            runner,
            check_timeout: CHECK_TIMEOUT,
        }
    }

    /// Overrides the check timeout.
    #[must_use]
    pub const fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Probes and checks `device`.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] when `blkid` or the checker cannot be
    /// started.
    pub async fn validate(&self, device: &str) -> Result<Verdict, CommandError> {
        let Some(fs_type) = self.probe(device).await? else {
            info!(device, "no filesystem detected");
            return Ok(Verdict::Unusable {
                reason: format!("no filesystem detected on {device}"),
            });
        };

        let (program, check_args) = checker_for(&fs_type, device);
        debug!(device, fs_type = %fs_type, program, "checking filesystem");
        match self
            .runner
            .run(program, &check_args, Some(self.check_timeout))
            .await
        {
            Ok(output) if output.is_success() => Ok(Verdict::Healthy { fs_type }),
            Ok(output) => {
                warn!(device, program, status = %output.status_text(), "filesystem check failed");
                let mut reason = format!(
                    "{program} exited with status {} on {fs_type} filesystem",
                    output.status_text()
                );
                let details = checker_output(&output);
                if !details.is_empty() {
                    reason.push_str(": ");
                    reason.push_str(&details);
                }
                Ok(Verdict::Unusable { reason })
            }
            Err(CommandError::TimedOut { after, .. }) => {
                warn!(device, program, "filesystem check timed out");
                Ok(Verdict::Unusable {
                    reason: format!("{program} timed out after {}s", after.as_secs()),
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn probe(&self, device: &str) -> Result<Option<String>, CommandError> {
        let probe_args = args(["-s", "TYPE", "-o", "value", device]);
        let output = self.runner.run("blkid", &probe_args, None).await?;
        if !output.is_success() {
            return Ok(None);
        }
        let fs_type = output.stdout.trim();
        Ok((!fs_type.is_empty()).then(|| fs_type.to_owned()))
    }
}

/// Trimmed stdout and stderr of a failed check, space separated.
fn checker_output(output: &CommandOutput) -> String {
    [output.stdout.trim(), output.stderr.trim()]
        .into_iter()
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Picks the read-only checker for `fs_type`.
fn checker_for(fs_type: &str, device: &str) -> (&'static str, Vec<OsString>) {
    match fs_type {
        "xfs" => ("xfs_repair", args(["-n", device])),
        "btrfs" => ("btrfs", args(["check", "--readonly", device])),
        _ => ("fsck", args(["-n", device])),
    }
}
