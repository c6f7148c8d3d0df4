//! Raw cloud volume API and the provider error taxonomy.
//!
//! [`VolumeApi`] is the narrow seam the pool client wraps with retry
//! policies. The production implementation lives in [`aws`] and shells out to
//! the `aws` command-line client; tests use the in-memory fake from
//! `test_support`.

pub mod aws;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::command::CommandError;
use crate::retry::RetryError;

pub use aws::AwsCli;

/// Tag key that assigns a volume to a pool.
pub const POOL_TAG: &str = "pool";

/// Tag key that marks a volume unusable.
pub const BLACKLIST_TAG: &str = "blacklist";

/// Tag key recording the instance that owns a volume.
pub const INSTANCE_TAG: &str = "instance_id";

/// Provider error codes that indicate rate limiting.
pub const THROTTLE_CODES: [&str; 3] =
    ["RequestLimitExceeded", "Throttling", "ServiceUnavailable"];

/// Provider error code raised when a volume already carries too many tags.
pub const TAG_LIMIT_CODE: &str = "TagLimitExceeded";

/// Key/value tags applied to a volume.
pub type TagSet = BTreeMap<String, String>;

/// Current attachment of a volume to an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attachment {
    /// Device path requested at attach time.
    pub device: String,
    /// Instance the volume is attached to.
    pub instance_id: String,
    /// Attachment state (for example `attaching` or `attached`).
    pub state: String,
}

/// Snapshot of a provider volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Volume {
    /// Provider identifier.
    pub id: String,
    /// Volume state (for example `available` or `in-use`).
    pub state: String,
    /// Availability zone holding the volume.
    pub zone: String,
    /// Attachment details when the volume is attached.
    pub attachment: Option<Attachment>,
    /// Tags currently on the volume.
    pub tags: TagSet,
}

impl Volume {
    /// Returns `true` when the volume carries the blacklist tag.
    #[must_use]
    pub fn is_blacklisted(&self) -> bool {
        self.tags.contains_key(BLACKLIST_TAG)
    }

    /// Returns `true` when either the volume or its attachment reports
    /// `state`.
    #[must_use]
    pub fn reports_state(&self, state: &str) -> bool {
        self.state == state
            || self
                .attachment
                .as_ref()
                .is_some_and(|attachment| attachment.state == state)
    }
}

/// Selects volumes from the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VolumeFilter {
    /// Available volumes tagged for `pool` in `zone`.
    Available {
        /// Pool tag value.
        pool: String,
        /// Availability zone.
        zone: String,
    },
    /// Exactly the named volumes, whatever their state.
    Ids(Vec<String>),
    /// Volumes attached to `instance_id` and tagged for `pool`.
    AttachedTo {
        /// Instance identifier.
        instance_id: String,
        /// Pool tag value.
        pool: String,
    },
}

/// Parameters for a freshly created volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewVolume {
    /// Size in GiB.
    pub size_gib: u32,
    /// Provider volume type (for example `sc1`).
    pub volume_type: String,
    /// Availability zone to create the volume in.
    pub zone: String,
}

/// Errors surfaced by provider calls.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// The provider rejected a call with an error code.
    #[error("{operation} failed with {code}: {message}")]
    Api {
        /// Operation that failed (for example `attach-volume`).
        operation: String,
        /// Provider error code.
        code: String,
        /// Provider error message.
        message: String,
    },
    /// The provider client could not be executed.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Provider output could not be parsed.
    #[error("failed to parse {operation} output: {message}")]
    Parse {
        /// Operation whose output was malformed.
        operation: String,
        /// Parser error message.
        message: String,
    },
    /// A polled volume has not reached the expected state yet.
    #[error("volume {volume_id} is {observed}, waiting for {expected}")]
    NotReady {
        /// Volume being polled.
        volume_id: String,
        /// State the caller waits for.
        expected: String,
        /// State most recently observed.
        observed: String,
    },
    /// A retry policy ran out of time or attempts.
    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        /// Attempts made before giving up.
        attempts: u32,
        /// Last failure observed.
        last: Box<Self>,
    },
}

impl ProviderError {
    /// Returns the provider error code when the failure came from the API.
    #[must_use]
    pub const fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }
}

impl From<RetryError<Self>> for ProviderError {
    fn from(value: RetryError<Self>) -> Self {
        match value {
            RetryError::Rejected(err) => err,
            RetryError::Exhausted { attempts, last } => Self::RetryExhausted {
                attempts,
                last: Box::new(last),
            },
        }
    }
}

/// Rate-limiting failures worth retrying.
#[must_use]
pub fn is_throttled(err: &ProviderError) -> bool {
    err.code().is_some_and(|code| THROTTLE_CODES.contains(&code))
}

/// Eventual-consistency failures raised while polling for a state.
#[must_use]
pub const fn is_not_ready(err: &ProviderError) -> bool {
    matches!(err, ProviderError::NotReady { .. })
}

/// Any failure reported by the provider API itself.
#[must_use]
pub const fn is_api_error(err: &ProviderError) -> bool {
    matches!(err, ProviderError::Api { .. })
}

/// The volume already carries the maximum number of tags.
#[must_use]
pub fn is_tag_limit(err: &ProviderError) -> bool {
    err.code() == Some(TAG_LIMIT_CODE)
}

/// Future returned by [`VolumeApi`] operations.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Minimal volume API implemented by cloud providers.
pub trait VolumeApi: Send + Sync {
    /// Lists volumes matching `filter`.
    fn describe_volumes<'a>(&'a self, filter: &'a VolumeFilter) -> ApiFuture<'a, Vec<Volume>>;

    /// Creates a volume and returns its initial snapshot.
    fn create_volume<'a>(&'a self, request: &'a NewVolume) -> ApiFuture<'a, Volume>;

    /// Requests attachment of `volume_id` to `instance_id` at `device`.
    fn attach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        device: &'a str,
        instance_id: &'a str,
    ) -> ApiFuture<'a, ()>;

    /// Requests detachment of `volume_id`.
    fn detach_volume<'a>(&'a self, volume_id: &'a str) -> ApiFuture<'a, ()>;

    /// Adds or overwrites tags on `volume_id`.
    fn create_tags<'a>(&'a self, volume_id: &'a str, tags: &'a TagSet) -> ApiFuture<'a, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn api_error(code: &str) -> ProviderError {
        ProviderError::Api {
            operation: String::from("attach-volume"),
            code: code.to_owned(),
            message: String::from("boom"),
        }
    }

    #[rstest]
    #[case("RequestLimitExceeded", true)]
    #[case("Throttling", true)]
    #[case("ServiceUnavailable", true)]
    #[case("VolumeInUse", false)]
    fn throttle_classifier_matches_rate_limit_codes(#[case] code: &str, #[case] expected: bool) {
        assert_eq!(is_throttled(&api_error(code)), expected);
    }

    #[rstest]
    fn not_ready_is_not_throttling() {
        let err = ProviderError::NotReady {
            volume_id: String::from("vol-1"),
            expected: String::from("attached"),
            observed: String::from("attaching"),
        };
        assert!(is_not_ready(&err));
        assert!(!is_throttled(&err));
        assert!(!is_api_error(&err));
    }

    #[rstest]
    fn tag_limit_is_recognised() {
        assert!(is_tag_limit(&api_error(TAG_LIMIT_CODE)));
        assert!(!is_tag_limit(&api_error("Throttling")));
    }

    #[rstest]
    fn attachment_state_counts_as_reported_state() {
        let volume = Volume {
            id: String::from("vol-1"),
            state: String::from("in-use"),
            zone: String::from("us-east-1a"),
            attachment: Some(Attachment {
                device: String::from("/dev/xvdf"),
                instance_id: String::from("i-1"),
                state: String::from("attached"),
            }),
            tags: TagSet::new(),
        };
        assert!(volume.reports_state("attached"));
        assert!(volume.reports_state("in-use"));
        assert!(!volume.reports_state("available"));
    }

    #[rstest]
    fn exhausted_retry_wraps_last_failure() {
        let err = ProviderError::from(RetryError::Exhausted {
            attempts: 4,
            last: api_error("Throttling"),
        });
        assert_eq!(
            err,
            ProviderError::RetryExhausted {
                attempts: 4,
                last: Box::new(api_error("Throttling")),
            }
        );
    }
}
