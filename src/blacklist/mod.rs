//! Marks unusable volumes and returns them to the pool detached.

use tracing::{info, warn};

use crate::pool::PoolClient;
use crate::provider::{BLACKLIST_TAG, ProviderError, TagSet, VolumeApi, is_tag_limit};

/// Longest tag value the provider accepts.
pub const MAX_TAG_VALUE_CHARS: usize = 255;

/// Tags, detaches, and waits for a rejected volume.
#[derive(Debug)]
pub struct Blacklister<'a, A: VolumeApi> {
    pool: &'a PoolClient<A>,
}

impl<'a, A: VolumeApi> Blacklister<'a, A> {
    /// Creates a blacklister over `pool`.
    #[must_use]
    pub const fn new(pool: &'a PoolClient<A>) -> Self {
        Self { pool }
    }

    /// Tags `volume_id` with `blacklist=<reason>`, detaches it, and waits
    /// until it is `available` again.
    ///
    /// A full tag set is logged and tolerated so the volume still leaves the
    /// instance.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when tagging fails for another reason, or
    /// when detaching or waiting fails.
    pub async fn blacklist(&self, volume_id: &str, reason: &str) -> Result<(), ProviderError> {
        let tags = TagSet::from([(BLACKLIST_TAG.to_owned(), truncate_reason(reason))]);
        match self.pool.tag(volume_id, &tags).await {
            Ok(()) => info!(volume_id, reason, "blacklisted volume"),
            Err(err) if is_tag_limit(&err) => {
                warn!(volume_id, error = %err, "volume has no room for a blacklist tag");
            }
            Err(err) => return Err(err),
        }

        self.pool.detach(volume_id).await?;
        self.pool.wait_for_state(volume_id, "available").await?;
        Ok(())
    }
}

/// Truncates `reason` to [`MAX_TAG_VALUE_CHARS`] characters.
#[must_use]
pub fn truncate_reason(reason: &str) -> String {
    reason.chars().take(MAX_TAG_VALUE_CHARS).collect()
}
