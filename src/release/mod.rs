//! Teardown: unmount and detach this instance's pool volumes.
//!
//! Every input (provider client, mount table, instance id, pool name) is
//! passed in by the caller so a release run never consults global state.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::command::{CommandError, CommandRunner, args};
use crate::mounts::{MountTable, kernel_device_name};
use crate::pool::PoolClient;
use crate::provider::{ProviderError, Volume, VolumeApi, VolumeFilter, is_api_error};
use crate::retry::RetryPolicy;

/// Attachment devices that belong to the root volume and are never touched.
pub const ROOT_DEVICES: [&str; 2] = ["/dev/sda1", "/dev/xvda"];

/// Attempts made to list attached volumes.
pub const LIST_ATTEMPTS: u32 = 10;

/// Pause between listing attempts.
pub const LIST_INTERVAL: Duration = Duration::from_secs(5);

/// Errors that abort a release run.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ReleaseError {
    /// Listing or detaching failed.
    #[error("provider call failed{}: {source}", for_volume(.volume_id.as_deref()))]
    Provider {
        /// Volume being released, if any.
        volume_id: Option<String>,
        /// Underlying provider failure.
        source: ProviderError,
    },
    /// `fuser` or `umount` could not be run at all.
    #[error("failed to release {volume_id}: {source}")]
    Command {
        /// Volume being released.
        volume_id: String,
        /// Underlying command failure.
        source: CommandError,
    },
}

fn for_volume(volume_id: Option<&str>) -> String {
    volume_id.map_or_else(String::new, |id| format!(" for {id}"))
}

/// Result of a release run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReleaseSummary {
    /// Volumes detached from the instance.
    pub detached: Vec<String>,
    /// Attached volumes left alone (root device or not mounted).
    pub skipped: Vec<String>,
}

/// Unmounts and detaches pool volumes attached to one instance.
#[derive(Debug)]
pub struct Releaser<A: VolumeApi, R: CommandRunner> {
    pool: PoolClient<A>,
    runner: R,
    mounts: MountTable,
    instance_id: String,
    pool_name: String,
    list_policy: RetryPolicy<ProviderError>,
}

impl<A: VolumeApi, R: CommandRunner> Releaser<A, R> {
    /// Creates a releaser for `pool_name` volumes on `instance_id`.
    #[must_use]
    pub fn new(
        pool: PoolClient<A>,
        runner: R,
        mounts: MountTable,
        instance_id: impl Into<String>,
        pool_name: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            runner,
            mounts,
            instance_id: instance_id.into(),
            pool_name: pool_name.into(),
            list_policy: RetryPolicy::fixed(is_api_error, LIST_ATTEMPTS, LIST_INTERVAL),
        }
    }

    /// Overrides the retry policy used for the initial listing.
    #[must_use]
    pub const fn with_list_policy(mut self, policy: RetryPolicy<ProviderError>) -> Self {
        self.list_policy = policy;
        self
    }

    /// Releases every mounted pool volume attached to the instance.
    ///
    /// Processes that hold a mountpoint are killed first. A failed unmount
    /// is logged with diagnostics and the volume is detached regardless.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError`] when listing exhausts its attempts, a command
    /// cannot be spawned, or a detach fails.
    pub async fn release(&self) -> Result<ReleaseSummary, ReleaseError> {
        let attached = self.list_attached().await?;
        let mut summary = ReleaseSummary::default();

        for volume in attached {
            let Some(attachment) = volume.attachment.as_ref() else {
                continue;
            };
            if ROOT_DEVICES.contains(&attachment.device.as_str()) {
                debug!(volume_id = %volume.id, device = %attachment.device, "skipping root device");
                summary.skipped.push(volume.id.clone());
                continue;
            }
            let device = kernel_device_name(&attachment.device);
            let Some(mountpoint) = self.mounts.mountpoint(&device) else {
                debug!(volume_id = %volume.id, device = %device, "volume not mounted; skipping");
                summary.skipped.push(volume.id.clone());
                continue;
            };

            self.unmount(&volume.id, &device, mountpoint.as_str()).await?;
            self.pool
                .detach(&volume.id)
                .await
                .map_err(|source| ReleaseError::Provider {
                    volume_id: Some(volume.id.clone()),
                    source,
                })?;
            info!(volume_id = %volume.id, device = %device, "released volume");
            summary.detached.push(volume.id.clone());
        }
        Ok(summary)
    }

    async fn list_attached(&self) -> Result<Vec<Volume>, ReleaseError> {
        let filter = VolumeFilter::AttachedTo {
            instance_id: self.instance_id.clone(),
            pool: self.pool_name.clone(),
        };
        let volumes = self
            .list_policy
            .run(|| self.pool.api().describe_volumes(&filter))
            .await
            .map_err(|err| ReleaseError::Provider {
                volume_id: None,
                source: err.into(),
            })?;
        debug!(
            instance_id = %self.instance_id,
            pool = %self.pool_name,
            found = volumes.len(),
            "listed attached volumes"
        );
        Ok(volumes)
    }

    async fn unmount(
        &self,
        volume_id: &str,
        device: &str,
        mountpoint: &str,
    ) -> Result<(), ReleaseError> {
        let command_error = |source| ReleaseError::Command {
            volume_id: volume_id.to_owned(),
            source,
        };

        debug!(volume_id, mountpoint, "killing processes using mountpoint");
        let killed = self
            .runner
            .run("fuser", &args(["-v", "-k", "-m", mountpoint]), None)
            .await
            .map_err(command_error)?;
        if !matches!(killed.code, Some(0 | 1)) {
            error!(
                volume_id,
                mountpoint,
                status = %killed.status_text(),
                output = %killed.stderr.trim(),
                "failed to kill processes using mountpoint"
            );
        }

        let unmounted = self
            .runner
            .run("umount", &args([device]), None)
            .await
            .map_err(command_error)?;
        if unmounted.is_success() {
            info!(volume_id, device, "unmounted volume");
            return Ok(());
        }

        warn!(
            volume_id,
            device,
            status = %unmounted.status_text(),
            output = %unmounted.stderr.trim(),
            "failed to unmount volume"
        );
        let holders = self
            .runner
            .run("fuser", &args(["-v", "-m", mountpoint]), None)
            .await
            .map_err(command_error)?;
        debug!(
            volume_id,
            mountpoint,
            holders = %holders.stderr.trim(),
            "processes still using mountpoint"
        );
        Ok(())
    }
}
