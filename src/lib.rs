//! Core library for the `ebspool` volume-pool provisioner.
//!
//! An instance claims `available` volumes tagged for a pool, attaches them,
//! validates or formats their filesystems, mounts them at numbered
//! mountpoints, and tags them as owned. Several instances race for the same
//! pool; the provider's atomic attach is the only arbitration.

pub mod blacklist;
pub mod command;
pub mod config;
pub mod context;
pub mod device;
pub mod hostfs;
pub mod logging;
pub mod metadata;
pub mod mountpoint;
pub mod mounts;
pub mod orchestrator;
pub mod pool;
pub mod provider;
pub mod provision;
pub mod release;
pub mod retry;
pub mod test_support;
pub mod validate;

pub use blacklist::Blacklister;
pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ConfigError, EbsConfig, PoolConfig, RuntimeConfig};
pub use context::{Context, Target};
pub use device::{AllocationError, DeviceNamer};
pub use hostfs::HostFsError;
pub use logging::LoggingError;
pub use metadata::{InstanceMetadata, MetadataClient, MetadataError};
pub use mountpoint::MountAllocator;
pub use mounts::MountTable;
pub use orchestrator::{AcquireError, AcquireOrchestrator, AcquireSummary, Origin, OwnedVolume};
pub use pool::{PoolClient, PoolPolicies};
pub use provider::{AwsCli, ProviderError, Volume, VolumeApi, VolumeFilter};
pub use provision::{FilesystemSpec, ProvisionError, Provisioner};
pub use release::{ReleaseError, ReleaseSummary, Releaser};
pub use retry::{RetryError, RetryPolicy};
pub use validate::{Validator, Verdict};
