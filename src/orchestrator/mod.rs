//! The acquisition loop.
//!
//! [`AcquireOrchestrator::execute`] first resumes volumes already attached
//! to this instance, then draws candidates from the pool until the target
//! count is owned. A volume is owned once it is attached, tagged, validated
//! or formatted, and mounted. Lost attach races and unusable volumes are
//! routine; everything else ends the run with an [`AcquireError`].

use std::collections::{BTreeSet, VecDeque};

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::blacklist::Blacklister;
use crate::command::{CommandError, CommandRunner};
use crate::context::Context;
use crate::device::{AllocationError, DeviceNamer};
use crate::mountpoint::MountAllocator;
use crate::mounts::{MountTable, kernel_device_name};
use crate::pool::PoolClient;
use crate::provider::{ProviderError, Volume, VolumeApi};
use crate::provision::{ProvisionError, Provisioner};
use crate::validate::{Validator, Verdict};

/// Fatal outcomes of an acquisition run.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AcquireError {
    /// A provider call failed or its retries ran out.
    #[error("provider call failed{}: {source}", for_volume(.volume_id.as_deref()))]
    Provider {
        /// Volume being handled, if any.
        volume_id: Option<String>,
        /// Underlying provider failure.
        source: ProviderError,
    },
    /// Strict or recovery mode ran out of candidates.
    #[error(
        "failed to attach volumes: owned {owned} of {wanted}{}",
        unclaimed(.missing)
    )]
    CandidatesExhausted {
        /// Volumes the run had to own.
        wanted: usize,
        /// Volumes owned when candidates ran out.
        owned: usize,
        /// Requested ids that were not reclaimed (recovery only).
        missing: Vec<String>,
    },
    /// A volume created for this run could not be attached.
    #[error("failed to attach newly created {volume_id} at {device}")]
    NewVolumeAttach {
        /// Freshly created volume.
        volume_id: String,
        /// Device path requested.
        device: String,
    },
    /// `mkfs` failed on a new volume.
    #[error("failed to format {volume_id}: {source}")]
    Format {
        /// Volume being formatted.
        volume_id: String,
        /// Underlying command failure.
        source: ProvisionError,
    },
    /// Mounting failed.
    #[error("failed to mount {volume_id}: {source}")]
    Mount {
        /// Volume being mounted.
        volume_id: String,
        /// Underlying failure.
        source: ProvisionError,
    },
    /// No device path was free.
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    /// The validation tools could not be run.
    #[error("failed to validate {volume_id}: {source}")]
    Validate {
        /// Volume being validated.
        volume_id: String,
        /// Underlying command failure.
        source: CommandError,
    },
    /// An unusable volume could not be blacklisted and detached.
    #[error("failed to blacklist {volume_id}: {source}")]
    Blacklist {
        /// Volume being blacklisted.
        volume_id: String,
        /// Underlying provider failure.
        source: ProviderError,
    },
}

fn for_volume(volume_id: Option<&str>) -> String {
    volume_id.map_or_else(String::new, |id| format!(" for {id}"))
}

fn unclaimed(missing: &[String]) -> String {
    if missing.is_empty() {
        String::new()
    } else {
        format!(" (unclaimed: {})", missing.join(", "))
    }
}

/// How an owned volume came to be owned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Origin {
    /// Already attached and mounted before the run.
    AlreadyMounted,
    /// Attached before the run but unmounted; validated and mounted now.
    Resumed,
    /// Claimed from the pool and validated.
    Claimed,
    /// Created for this run and formatted.
    Created,
}

/// A volume owned at the end of a run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OwnedVolume {
    /// Provider volume id.
    pub volume_id: String,
    /// Device path the volume is reachable at.
    pub device: String,
    /// Mountpoint directory.
    pub mountpoint: Utf8PathBuf,
    /// How the volume was obtained.
    pub origin: Origin,
}

/// Result of a successful run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AcquireSummary {
    /// Volumes owned by this instance.
    pub owned: Vec<OwnedVolume>,
    /// Volumes found unusable and returned to the pool tagged.
    pub blacklisted: Vec<String>,
    /// Candidates another instance attached first.
    pub lost_races: Vec<String>,
}

#[derive(Debug, Default)]
struct RunState {
    summary: AcquireSummary,
    attempted: BTreeSet<String>,
    candidates: VecDeque<Volume>,
}

/// What to do to an attached volume before mounting it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Preparation {
    Validate,
    Format,
}

/// Drives one acquisition run.
#[derive(Debug)]
pub struct AcquireOrchestrator<A: VolumeApi, R: CommandRunner> {
    context: Context,
    pool: PoolClient<A>,
    validator: Validator<R>,
    provisioner: Provisioner<R>,
}

impl<A: VolumeApi, R: CommandRunner + Clone> AcquireOrchestrator<A, R> {
    /// Wires the collaborators for `context`.
    #[must_use]
    pub fn new(context: Context, pool: PoolClient<A>, runner: R) -> Self {
        let provisioner = Provisioner::new(
            runner.clone(),
            MountAllocator::new(context.mount_base.clone()),
            context.cache_file.clone(),
        );
        Self {
            context,
            pool,
            validator: Validator::new(runner),
            provisioner,
        }
    }
}

impl<A: VolumeApi, R: CommandRunner> AcquireOrchestrator<A, R> {
    /// Replaces the validator (for example to shorten the check timeout).
    #[must_use]
    pub fn with_validator(mut self, validator: Validator<R>) -> Self {
        self.validator = validator;
        self
    }

    /// Context the run was built from.
    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.context
    }

    /// Runs acquisition until the target is owned. Mounts made during the
    /// run are recorded in `mounts`.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError`] on any fatal condition; volumes owned before
    /// the failure stay attached and mounted.
    pub async fn execute(&self, mounts: &mut MountTable) -> Result<AcquireSummary, AcquireError> {
        let target = self.context.target.size();
        let mut state = RunState::default();
        let mut devices = DeviceNamer::starting_at(&self.context.first_device)?;
        info!(
            pool = %self.context.pool,
            target,
            strict = self.context.strict,
            recovery = self.context.target.is_recovery(),
            "starting volume acquisition"
        );

        self.resume(mounts, &mut state, target).await?;

        while state.summary.owned.len() < target {
            let Some((volume, fresh)) = self.next_candidate(&mut state, target).await? else {
                continue;
            };
            let device = devices.current().to_string();
            let Some(owned) = self.claim(&volume, fresh, &device, &mut state).await? else {
                continue;
            };
            mounts.record(&owned.device, &owned.mountpoint);
            state.summary.owned.push(owned);
            if state.summary.owned.len() < target {
                devices.advance()?;
            }
        }

        info!(
            owned = state.summary.owned.len(),
            blacklisted = state.summary.blacklisted.len(),
            "volume acquisition complete"
        );
        Ok(state.summary)
    }

    /// Adopts volumes attached to this instance before the run.
    async fn resume(
        &self,
        mounts: &mut MountTable,
        state: &mut RunState,
        target: usize,
    ) -> Result<(), AcquireError> {
        let attached = self
            .pool
            .list_attached(&self.context.instance_id, &self.context.pool)
            .await
            .map_err(|source| AcquireError::Provider {
                volume_id: None,
                source,
            })?;
        let wanted = self.context.target.volume_ids();

        for volume in attached {
            let Some(attachment) = volume.attachment.as_ref() else {
                continue;
            };
            if !wanted.is_empty() && !wanted.contains(&volume.id) {
                continue;
            }
            state.attempted.insert(volume.id.clone());
            let device = kernel_device_name(&attachment.device);

            if let Some(mountpoint) = mounts.mountpoint(&device) {
                info!(
                    volume_id = %volume.id,
                    device = %device,
                    mountpoint = %mountpoint,
                    "volume already mounted"
                );
                state.summary.owned.push(OwnedVolume {
                    volume_id: volume.id.clone(),
                    device,
                    mountpoint: mountpoint.to_path_buf(),
                    origin: Origin::AlreadyMounted,
                });
                continue;
            }
            if state.summary.owned.len() >= target {
                debug!(volume_id = %volume.id, device = %device, "target met; leaving volume unmounted");
                continue;
            }

            info!(volume_id = %volume.id, device = %device, "resuming unmounted volume");
            if let Some(mountpoint) = self
                .prepare(&volume.id, &device, Preparation::Validate, state)
                .await?
            {
                mounts.record(&device, &mountpoint);
                state.summary.owned.push(OwnedVolume {
                    volume_id: volume.id.clone(),
                    device,
                    mountpoint,
                    origin: Origin::Resumed,
                });
            }
        }
        Ok(())
    }

    /// Returns the next candidate and whether it was created for this run.
    /// `None` means the candidate was skipped.
    async fn next_candidate(
        &self,
        state: &mut RunState,
        target: usize,
    ) -> Result<Option<(Volume, bool)>, AcquireError> {
        if state.candidates.is_empty() {
            state.candidates = self.query(&state.attempted).await?;
        }

        let (volume, fresh) = match state.candidates.pop_front() {
            Some(volume) => (volume, false),
            None if self.context.strict => {
                return Err(self.exhausted(state, target));
            }
            None => {
                let created = self
                    .pool
                    .create(&self.context.new_volume)
                    .await
                    .map_err(|source| AcquireError::Provider {
                        volume_id: None,
                        source,
                    })?;
                (created, true)
            }
        };

        state.attempted.insert(volume.id.clone());
        if !self.context.target.is_recovery() && volume.is_blacklisted() {
            debug!(volume_id = %volume.id, "skipping blacklisted volume");
            return Ok(None);
        }
        Ok(Some((volume, fresh)))
    }

    /// Queries candidates not yet attempted during this run.
    async fn query(&self, attempted: &BTreeSet<String>) -> Result<VecDeque<Volume>, AcquireError> {
        let listed = if self.context.target.is_recovery() {
            let remaining = self
                .context
                .target
                .volume_ids()
                .iter()
                .filter(|id| !attempted.contains(*id))
                .cloned()
                .collect::<Vec<_>>();
            if remaining.is_empty() {
                return Ok(VecDeque::new());
            }
            self.pool.list_by_ids(&remaining).await
        } else {
            self.pool
                .list_available(&self.context.pool, self.context.zone())
                .await
        };
        let volumes = listed.map_err(|source| AcquireError::Provider {
            volume_id: None,
            source,
        })?;
        Ok(volumes
            .into_iter()
            .filter(|volume| !attempted.contains(&volume.id))
            .collect())
    }

    fn exhausted(&self, state: &RunState, target: usize) -> AcquireError {
        let owned_ids = state
            .summary
            .owned
            .iter()
            .map(|owned| owned.volume_id.as_str())
            .collect::<BTreeSet<_>>();
        let missing = self
            .context
            .target
            .volume_ids()
            .iter()
            .filter(|id| !owned_ids.contains(id.as_str()))
            .cloned()
            .collect();
        warn!(owned = owned_ids.len(), target, "no candidates left");
        AcquireError::CandidatesExhausted {
            wanted: target,
            owned: owned_ids.len(),
            missing,
        }
    }

    /// Attaches `volume` at `device` and takes it through to a mount.
    /// `None` means the volume was lost to a race or blacklisted.
    async fn claim(
        &self,
        volume: &Volume,
        fresh: bool,
        device: &str,
        state: &mut RunState,
    ) -> Result<Option<OwnedVolume>, AcquireError> {
        let provider_error = |source| AcquireError::Provider {
            volume_id: Some(volume.id.clone()),
            source,
        };
        let attached = self
            .pool
            .attach(&volume.id, device, &self.context.instance_id)
            .await
            .map_err(provider_error)?;
        if !attached {
            if fresh {
                return Err(AcquireError::NewVolumeAttach {
                    volume_id: volume.id.clone(),
                    device: device.to_owned(),
                });
            }
            info!(volume_id = %volume.id, device, "attach refused; trying next candidate");
            state.summary.lost_races.push(volume.id.clone());
            return Ok(None);
        }

        info!(volume_id = %volume.id, device, "attached volume");
        self.pool
            .wait_for_state(&volume.id, "attached")
            .await
            .map_err(provider_error)?;

        let preparation = if fresh {
            Preparation::Format
        } else {
            Preparation::Validate
        };
        let origin = if fresh {
            Origin::Created
        } else {
            Origin::Claimed
        };
        let mountpoint = self.prepare(&volume.id, device, preparation, state).await?;
        Ok(mountpoint.map(|path| OwnedVolume {
            volume_id: volume.id.clone(),
            device: device.to_owned(),
            mountpoint: path,
            origin,
        }))
    }

    /// Tags, validates or formats, then mounts an attached volume. `None`
    /// means the volume was blacklisted instead.
    async fn prepare(
        &self,
        volume_id: &str,
        device: &str,
        preparation: Preparation,
        state: &mut RunState,
    ) -> Result<Option<Utf8PathBuf>, AcquireError> {
        self.pool
            .tag(volume_id, &self.context.tags)
            .await
            .map_err(|source| AcquireError::Provider {
                volume_id: Some(volume_id.to_owned()),
                source,
            })?;
        debug!(volume_id, "tagged volume");

        match preparation {
            Preparation::Format => self
                .provisioner
                .format(device, &self.context.filesystem)
                .await
                .map_err(|source| AcquireError::Format {
                    volume_id: volume_id.to_owned(),
                    source,
                })?,
            Preparation::Validate => {
                let verdict = self.validator.validate(device).await.map_err(|source| {
                    AcquireError::Validate {
                        volume_id: volume_id.to_owned(),
                        source,
                    }
                })?;
                if let Verdict::Unusable { reason } = verdict {
                    warn!(volume_id, device, reason = %reason, "volume failed validation");
                    Blacklister::new(&self.pool)
                        .blacklist(volume_id, &reason)
                        .await
                        .map_err(|source| AcquireError::Blacklist {
                            volume_id: volume_id.to_owned(),
                            source,
                        })?;
                    state.summary.blacklisted.push(volume_id.to_owned());
                    return Ok(None);
                }
            }
        }

        let mountpoint = self
            .provisioner
            .mount(device, &self.context.mount_options)
            .await
            .map_err(|source| AcquireError::Mount {
                volume_id: volume_id.to_owned(),
                source,
            })?;
        Ok(Some(mountpoint))
    }
}

#[cfg(test)]
mod tests;
