//! Configuration for a pool run.
//!
//! Pool settings live in a YAML document (`./context.yaml` or
//! `/etc/ebs/config.yaml`) layered over built-in defaults with
//! [`merge::deep_merge`]. Host-level knobs that rarely change (which `aws`
//! binary to run, where the metadata service lives) come from
//! [`RuntimeConfig`] via `ortho-config`.

pub mod merge;

use std::collections::BTreeMap;
use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::hostfs::{self, HostFsError};
use crate::provider::TagSet;

pub use merge::deep_merge;

/// Configuration files probed, in order, when no path is given.
pub const CONFIG_CANDIDATES: [&str; 2] = ["./context.yaml", "/etc/ebs/config.yaml"];

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Read(#[from] HostFsError),
    /// A configuration document or merged result is malformed.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

/// Volume settings under the `ebs` key.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct EbsConfig {
    /// Size of newly created volumes in GiB.
    pub size: u32,
    /// Provider volume type for new volumes.
    #[serde(rename = "type")]
    pub volume_type: String,
    /// Number of volumes to own when no ids are given.
    pub count: u32,
    /// Filesystem created on new volumes.
    pub filesystem_type: String,
    /// Extra `mkfs` arguments.
    pub filesystem_args: String,
    /// Base path for numbered mountpoints.
    pub mountpoint: String,
    /// Options passed to `mount -o`.
    pub mount_args: String,
    /// Fail instead of creating volumes when the pool runs dry.
    pub strict: bool,
    /// Explicit volumes to recover; switches the run into recovery mode.
    pub volume_ids: Vec<String>,
}

impl Default for EbsConfig {
    fn default() -> Self {
        Self {
            size: 500,
            volume_type: String::from("sc1"),
            count: 0,
            filesystem_type: String::from("ext4"),
            filesystem_args: String::new(),
            mountpoint: String::from("/ebs"),
            mount_args: String::new(),
            strict: false,
            volume_ids: Vec::new(),
        }
    }
}

/// Pool configuration after merging defaults with the configuration file.
///
/// Keys this crate does not understand are ignored so one document can
/// configure several boot-time helpers.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// YAML file whose `tags` mapping is applied to every owned volume.
    pub tagfile: String,
    /// Append-only record of mounted devices.
    pub cachefile: String,
    /// Tag keys removed from the final tag set.
    pub ignore_tags: Vec<String>,
    /// Tags applied to every owned volume.
    #[serde(deserialize_with = "stringified_tags")]
    pub tags: TagSet,
    /// Pool tag value; required.
    pub pool_name: Option<String>,
    /// Volume settings.
    pub ebs: EbsConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            tagfile: String::from("/etc/ebs/tagfile.yaml"),
            cachefile: String::from("/var/cache/ebs_volumes"),
            ignore_tags: Vec::new(),
            tags: TagSet::new(),
            pool_name: None,
            ebs: EbsConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Builds a configuration by deep-merging `layers` over the defaults.
    ///
    /// Null layers (empty YAML documents) are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merged document does not match
    /// the expected shape.
    pub fn from_layers<I>(layers: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = Value>,
    {
        let mut merged = serde_json::to_value(Self::default())
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        for layer in layers.into_iter().filter(|layer| !layer.is_null()) {
            deep_merge(&mut merged, layer);
        }
        serde_json::from_value(merged).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads the configuration file at `path` over the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let layer = read_yaml(path)?;
        Self::from_layers([layer])
    }

    /// Finds the configuration file: `explicit` when given, otherwise the
    /// first existing entry of [`CONFIG_CANDIDATES`]. `None` means there is
    /// nothing to do.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] when a candidate cannot be probed.
    pub fn discover(explicit: Option<&Utf8Path>) -> Result<Option<Utf8PathBuf>, ConfigError> {
        if let Some(path) = explicit {
            return Ok(Some(path.to_path_buf()));
        }
        for candidate in CONFIG_CANDIDATES {
            let path = Utf8Path::new(candidate);
            if hostfs::path_exists(path)? {
                return Ok(Some(path.to_path_buf()));
            }
        }
        Ok(None)
    }

    /// Returns the pool name, failing with guidance when it is unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when `pool_name` is absent or
    /// blank.
    pub fn require_pool_name(&self) -> Result<&str, ConfigError> {
        self.pool_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                ConfigError::MissingField(String::from(
                    "missing pool name: add pool_name to context.yaml or /etc/ebs/config.yaml",
                ))
            })
    }

    /// Reads the `tags` mapping from the tag file. A missing tag file yields
    /// no tags.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the tag file exists but is unreadable or
    /// malformed.
    pub fn load_tag_file(&self) -> Result<TagSet, ConfigError> {
        let path = Utf8Path::new(&self.tagfile);
        if !hostfs::path_exists(path)? {
            return Ok(TagSet::new());
        }
        let document: TagFile = serde_json::from_value(read_yaml(path)?)
            .map_err(|err| ConfigError::Parse(format!("{path}: {err}")))?;
        Ok(document.tags)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TagFile {
    #[serde(deserialize_with = "stringified_tags")]
    tags: TagSet,
}

fn read_yaml(path: &Utf8Path) -> Result<Value, ConfigError> {
    let contents = hostfs::read_to_string(path)?;
    let value = serde_yaml::from_str::<Value>(&contents)
        .map_err(|err| ConfigError::Parse(format!("{path}: {err}")))?;
    if value.is_null() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    Ok(value)
}

/// Accepts any scalar tag value and renders it as a string.
fn stringified_tags<'de, D>(deserializer: D) -> Result<TagSet, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(text) => text,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (key, rendered)
        })
        .collect())
}

/// Host-level settings layered via `ortho-config` (defaults, configuration
/// files, and `EBSPOOL_*` environment variables).
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "EBSPOOL")]
pub struct RuntimeConfig {
    /// Path to the `aws` CLI binary.
    #[ortho_config(default = "aws".to_owned())]
    pub aws_bin: String,
    /// Base URL of the instance metadata service.
    #[ortho_config(default = "http://169.254.169.254".to_owned())]
    pub metadata_url: String,
    /// Mount table consulted for restart resumption and release.
    #[ortho_config(default = "/proc/self/mounts".to_owned())]
    pub mount_table: String,
    /// Default log filter when `RUST_LOG` is unset.
    #[ortho_config(default = "info".to_owned())]
    pub log_level: String,
}

impl RuntimeConfig {
    /// Loads runtime settings without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("ebspool")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks that every setting is non-blank.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the environment variable
    /// to set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            (&self.aws_bin, "EBSPOOL_AWS_BIN"),
            (&self.metadata_url, "EBSPOOL_METADATA_URL"),
            (&self.mount_table, "EBSPOOL_MOUNT_TABLE"),
            (&self.log_level, "EBSPOOL_LOG_LEVEL"),
        ];
        for (value, env_var) in fields {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "{env_var} must not be blank"
                )));
            }
        }
        Ok(())
    }
}
