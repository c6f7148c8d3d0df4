//! Read-only snapshot of everything one acquisition run needs.

use camino::Utf8PathBuf;

use crate::config::{ConfigError, PoolConfig};
use crate::metadata::InstanceMetadata;
use crate::provider::{INSTANCE_TAG, NewVolume, POOL_TAG, TagSet};
use crate::provision::FilesystemSpec;

/// First device path tried on every run.
pub const FIRST_DEVICE: &str = "/dev/xvdf";

/// How many volumes a run must own, and which.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Target {
    /// Any `n` volumes from the pool.
    Count(u32),
    /// Exactly these volumes, whatever their state or tags.
    Recover(Vec<String>),
}

impl Target {
    /// Number of volumes the run must own.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Count(count) => usize::try_from(*count).unwrap_or(usize::MAX),
            Self::Recover(ids) => ids.len(),
        }
    }

    /// Returns `true` when recovering an explicit id list.
    #[must_use]
    pub const fn is_recovery(&self) -> bool {
        matches!(self, Self::Recover(_))
    }

    /// Explicit volume ids (empty outside recovery).
    #[must_use]
    pub fn volume_ids(&self) -> &[String] {
        match self {
            Self::Count(_) => &[],
            Self::Recover(ids) => ids,
        }
    }
}

/// Run configuration built once from the pool configuration, the tag file,
/// and the instance identity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Context {
    /// Pool tag value.
    pub pool: String,
    /// Volumes to own.
    pub target: Target,
    /// Fail instead of creating volumes when candidates run out. Always set
    /// in recovery.
    pub strict: bool,
    /// Filesystem created on new volumes.
    pub filesystem: FilesystemSpec,
    /// Base path for numbered mountpoints.
    pub mount_base: Utf8PathBuf,
    /// Options passed to `mount -o`; empty for none.
    pub mount_options: String,
    /// Shape of volumes created when the pool runs dry.
    pub new_volume: NewVolume,
    /// Instance volumes are attached to.
    pub instance_id: String,
    /// Tags applied to every owned volume.
    pub tags: TagSet,
    /// Append-only record of mounted devices.
    pub cache_file: Utf8PathBuf,
    /// Device path allocation starts from.
    pub first_device: Utf8PathBuf,
}

impl Context {
    /// Builds the run context.
    ///
    /// Tags are layered as configuration tags, then tag-file tags, then the
    /// forced `pool` and `instance_id` tags; keys in `ignore_tags` are
    /// removed last.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when no pool name is configured.
    pub fn from_config(
        config: &PoolConfig,
        identity: &InstanceMetadata,
        tagfile_tags: TagSet,
    ) -> Result<Self, ConfigError> {
        let pool = config.require_pool_name()?.to_owned();
        let target = if config.ebs.volume_ids.is_empty() {
            Target::Count(config.ebs.count)
        } else {
            Target::Recover(config.ebs.volume_ids.clone())
        };

        let mut tags = config.tags.clone();
        tags.extend(tagfile_tags);
        tags.insert(POOL_TAG.to_owned(), pool.clone());
        tags.insert(INSTANCE_TAG.to_owned(), identity.instance_id.clone());
        for ignored in &config.ignore_tags {
            tags.remove(ignored);
        }

        Ok(Self {
            strict: config.ebs.strict || target.is_recovery(),
            target,
            filesystem: FilesystemSpec {
                fs_type: config.ebs.filesystem_type.clone(),
                args: config.ebs.filesystem_args.clone(),
            },
            mount_base: Utf8PathBuf::from(&config.ebs.mountpoint),
            mount_options: config.ebs.mount_args.clone(),
            new_volume: NewVolume {
                size_gib: config.ebs.size,
                volume_type: config.ebs.volume_type.clone(),
                zone: identity.availability_zone.clone(),
            },
            instance_id: identity.instance_id.clone(),
            tags,
            cache_file: Utf8PathBuf::from(&config.cachefile),
            first_device: Utf8PathBuf::from(FIRST_DEVICE),
            pool,
        })
    }

    /// Availability zone candidates are drawn from.
    #[must_use]
    pub fn zone(&self) -> &str {
        &self.new_volume.zone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EbsConfig;
    use rstest::{fixture, rstest};

    #[fixture]
    fn identity() -> InstanceMetadata {
        InstanceMetadata {
            instance_id: String::from("i-0abc"),
            availability_zone: String::from("us-east-1a"),
        }
    }

    fn config(ebs: EbsConfig) -> PoolConfig {
        PoolConfig {
            pool_name: Some(String::from("scratch")),
            ebs,
            ..PoolConfig::default()
        }
    }

    #[rstest]
    fn count_mode_keeps_configured_strictness(identity: InstanceMetadata) {
        let ebs = EbsConfig {
            count: 3,
            size: 100,
            volume_type: String::from("gp3"),
            mount_args: String::from("noatime"),
            ..EbsConfig::default()
        };
        let context = Context::from_config(&config(ebs), &identity, TagSet::new())
            .expect("context");

        assert_eq!(context.target, Target::Count(3));
        assert_eq!(context.target.size(), 3);
        assert!(!context.strict);
        assert_eq!(context.zone(), "us-east-1a");
        assert_eq!(context.new_volume.size_gib, 100);
        assert_eq!(context.new_volume.volume_type, "gp3");
        assert_eq!(context.mount_options, "noatime");
        assert_eq!(context.mount_base, "/ebs");
        assert_eq!(context.first_device, FIRST_DEVICE);
    }

    #[rstest]
    fn recovery_forces_strict(identity: InstanceMetadata) {
        let ebs = EbsConfig {
            count: 7,
            volume_ids: vec![String::from("vol-1"), String::from("vol-2")],
            ..EbsConfig::default()
        };
        let context = Context::from_config(&config(ebs), &identity, TagSet::new())
            .expect("context");

        assert!(context.strict);
        assert!(context.target.is_recovery());
        assert_eq!(context.target.size(), 2);
        assert_eq!(context.target.volume_ids(), ["vol-1", "vol-2"]);
    }

    #[rstest]
    fn tags_layer_then_drop_ignored_keys(identity: InstanceMetadata) {
        let pool_config = PoolConfig {
            tags: TagSet::from([
                (String::from("team"), String::from("data")),
                (String::from("pool"), String::from("spoofed")),
                (String::from("cost-centre"), String::from("42")),
            ]),
            ignore_tags: vec![String::from("cost-centre"), String::from("absent")],
            ..config(EbsConfig::default())
        };
        let tagfile = TagSet::from([(String::from("team"), String::from("storage"))]);

        let context = Context::from_config(&pool_config, &identity, tagfile).expect("context");

        assert_eq!(
            context.tags,
            TagSet::from([
                (String::from("instance_id"), String::from("i-0abc")),
                (String::from("pool"), String::from("scratch")),
                (String::from("team"), String::from("storage")),
            ])
        );
    }

    #[rstest]
    fn ignored_forced_tags_are_removed(identity: InstanceMetadata) {
        let pool_config = PoolConfig {
            ignore_tags: vec![String::from("instance_id")],
            ..config(EbsConfig::default())
        };
        let context = Context::from_config(&pool_config, &identity, TagSet::new())
            .expect("context");
        assert!(!context.tags.contains_key("instance_id"));
        assert_eq!(context.tags.get("pool").map(String::as_str), Some("scratch"));
    }

    #[rstest]
    fn missing_pool_name_is_rejected(identity: InstanceMetadata) {
        let err = Context::from_config(&PoolConfig::default(), &identity, TagSet::new())
            .expect_err("pool name required");
        assert!(matches!(err, ConfigError::MissingField(_)));
    }
}
