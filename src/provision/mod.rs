//! Formatting and mounting of attached volumes.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::info;

use crate::command::{CommandError, CommandRunner, render_command};
use crate::device::AllocationError;
use crate::hostfs::{self, HostFsError};
use crate::mountpoint::MountAllocator;

/// Permission bits applied to every mountpoint: world-writable and sticky.
pub const MOUNTPOINT_MODE: u32 = 0o1777;

/// Errors raised while formatting or mounting a device.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisionError {
    /// A command ran but exited unsuccessfully.
    #[error("`{command}` exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Rendered command line.
        command: String,
        /// Human readable exit status.
        status_text: String,
        /// Captured stderr.
        stderr: String,
    },
    /// The command could not be run.
    #[error(transparent)]
    Runner(#[from] CommandError),
    /// No mountpoint could be allocated.
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    /// The mountpoint or cache file could not be updated.
    #[error(transparent)]
    HostFs(#[from] HostFsError),
}

/// Filesystem creation settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FilesystemSpec {
    /// Filesystem type passed to `mkfs.<type>`.
    pub fs_type: String,
    /// Extra `mkfs` arguments, whitespace separated.
    pub args: String,
}

/// Formats fresh volumes and mounts volumes at allocated mountpoints.
#[derive(Clone, Debug)]
pub struct Provisioner<R: CommandRunner> {
    runner: R,
    allocator: MountAllocator,
    cache_file: Utf8PathBuf,
}

impl<R: CommandRunner> Provisioner<R> {
    /// Creates a provisioner that allocates through `allocator` and records
    /// mounted devices in `cache_file`.
    #[must_use]
    pub fn new(runner: R, allocator: MountAllocator, cache_file: impl Into<Utf8PathBuf>) -> Self {
        Self {
            runner,
            allocator,
            cache_file: cache_file.into(),
        }
    }

    /// Command runner shared with other components.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    async fn run_checked(&self, program: &str, args: &[OsString]) -> Result<(), ProvisionError> {
        let output = self.runner.run(program, args, None).await?;
        if output.is_success() {
            return Ok(());
        }
        Err(ProvisionError::CommandFailure {
            command: render_command(program, args),
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        })
    }

    /// Creates a filesystem on `device` with `mkfs.<type>`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when `mkfs` cannot run or fails.
    pub async fn format(&self, device: &str, spec: &FilesystemSpec) -> Result<(), ProvisionError> {
        let program = format!("mkfs.{}", spec.fs_type);
        let mut mkfs_args = spec
            .args
            .split_whitespace()
            .map(OsString::from)
            .collect::<Vec<_>>();
        mkfs_args.push(OsString::from(device));
        self.run_checked(&program, &mkfs_args).await?;
        info!(device, fs_type = %spec.fs_type, "formatted volume");
        Ok(())
    }

    /// Mounts `device` at the next free mountpoint, opens its permissions,
    /// and appends the device to the cache file.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when allocation, `mount`, or the follow-up
    /// filesystem updates fail.
    pub async fn mount(&self, device: &str, options: &str) -> Result<Utf8PathBuf, ProvisionError> {
        let mountpoint = self.allocator.allocate()?;
        let mut mount_args = Vec::with_capacity(4);
        if !options.trim().is_empty() {
            mount_args.push(OsString::from("-o"));
            mount_args.push(OsString::from(options.trim()));
        }
        mount_args.push(OsString::from(device));
        mount_args.push(OsString::from(mountpoint.as_str()));
        self.run_checked("mount", &mount_args).await?;

        hostfs::set_mode(&mountpoint, MOUNTPOINT_MODE)?;
        hostfs::append_line(&self.cache_file, device)?;
        info!(device, mountpoint = %mountpoint, "mounted volume");
        Ok(mountpoint)
    }

    /// Cache file that records mounted devices.
    #[must_use]
    pub fn cache_file(&self) -> &Utf8Path {
        &self.cache_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        root: Utf8PathBuf,
        runner: ScriptedRunner,
        provisioner: Provisioner<ScriptedRunner>,
    }

    #[fixture]
    fn harness() -> Harness {
        let dir = TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");
        let runner = ScriptedRunner::new();
        let provisioner = Provisioner::new(
            runner.clone(),
            MountAllocator::new(root.join("ebs")),
            root.join("cache"),
        );
        Harness {
            _dir: dir,
            root,
            runner,
            provisioner,
        }
    }

    fn ext4(args: &str) -> FilesystemSpec {
        FilesystemSpec {
            fs_type: String::from("ext4"),
            args: args.to_owned(),
        }
    }

    #[rstest]
    #[case("", "mkfs.ext4 /dev/xvdf")]
    #[case("-m 0  -L data", "mkfs.ext4 -m 0 -L data /dev/xvdf")]
    #[tokio::test]
    async fn format_invokes_mkfs(harness: Harness, #[case] args: &str, #[case] expected: &str) {
        harness.runner.push_success();

        harness
            .provisioner
            .format("/dev/xvdf", &ext4(args))
            .await
            .expect("format");

        assert_eq!(harness.runner.command_lines(), [expected]);
    }

    #[rstest]
    #[tokio::test]
    async fn failed_format_is_an_error(harness: Harness) {
        harness.runner.push_failure(1);

        let err = harness
            .provisioner
            .format("/dev/xvdf", &ext4(""))
            .await
            .expect_err("mkfs fails");

        assert!(
            matches!(err, ProvisionError::CommandFailure { ref command, .. } if command == "mkfs.ext4 /dev/xvdf"),
            "got {err:?}"
        );
    }

    #[rstest]
    #[tokio::test]
    async fn mount_allocates_records_and_opens_permissions(harness: Harness) {
        harness.runner.push_success();

        let mountpoint = harness
            .provisioner
            .mount("/dev/xvdf", "noatime")
            .await
            .expect("mount");

        assert_eq!(mountpoint, harness.root.join("ebs0"));
        assert_eq!(
            harness.runner.command_lines(),
            [format!("mount -o noatime /dev/xvdf {mountpoint}")]
        );
        let cache = std::fs::read_to_string(harness.root.join("cache")).expect("cache file");
        assert_eq!(cache, "/dev/xvdf\n");
        let mode = std::os::unix::fs::PermissionsExt::mode(
            &std::fs::metadata(&mountpoint).expect("metadata").permissions(),
        );
        assert_eq!(mode & 0o7777, MOUNTPOINT_MODE);
    }

    #[rstest]
    #[tokio::test]
    async fn mount_without_options_omits_flag(harness: Harness) {
        harness.runner.push_success();

        let mountpoint = harness
            .provisioner
            .mount("/dev/xvdg", "")
            .await
            .expect("mount");

        assert_eq!(
            harness.runner.command_lines(),
            [format!("mount /dev/xvdg {mountpoint}")]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn failed_mount_leaves_cache_untouched(harness: Harness) {
        harness.runner.push_failure(32);

        let err = harness
            .provisioner
            .mount("/dev/xvdf", "")
            .await
            .expect_err("mount fails");

        assert!(matches!(err, ProvisionError::CommandFailure { .. }));
        assert!(!harness.root.join("cache").exists());
    }
}
