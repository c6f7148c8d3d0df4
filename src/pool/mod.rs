//! Pool-level view of the volume API.
//!
//! [`PoolClient`] wraps a raw [`VolumeApi`] with the retry policies every
//! caller needs: throttling is retried with exponential backoff, and status
//! waits nest an eventual-consistency poll inside a throttle guard.

use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::provider::{
    NewVolume, ProviderError, TagSet, Volume, VolumeApi, VolumeFilter, is_api_error,
    is_not_ready, is_throttled,
};
use crate::retry::{RetryError, RetryPolicy};

/// Deadline for throttle retries around ordinary calls.
pub const THROTTLE_DEADLINE: Duration = Duration::from_secs(60);

/// Deadline for status waits, both the throttle guard and the poll itself.
pub const STATE_WAIT_DEADLINE: Duration = Duration::from_secs(300);

/// Orders a freshly queried candidate list in place.
pub type CandidateOrder = fn(&mut [Volume]);

/// Shuffles candidates so racing instances spread across the pool.
pub fn shuffle(volumes: &mut [Volume]) {
    volumes.shuffle(&mut rand::thread_rng());
}

/// Leaves candidates in provider order.
pub const fn keep_order(_volumes: &mut [Volume]) {}

/// Retry policies applied by [`PoolClient`].
#[derive(Clone, Copy, Debug)]
pub struct PoolPolicies {
    /// Guards ordinary calls against rate limiting.
    pub throttle: RetryPolicy<ProviderError>,
    /// Guards status waits against rate limiting.
    pub state_throttle: RetryPolicy<ProviderError>,
    /// Polls until a volume reaches the expected state.
    pub not_ready: RetryPolicy<ProviderError>,
}

impl Default for PoolPolicies {
    fn default() -> Self {
        Self {
            throttle: RetryPolicy::exponential(is_throttled, THROTTLE_DEADLINE),
            state_throttle: RetryPolicy::exponential(is_throttled, STATE_WAIT_DEADLINE),
            not_ready: RetryPolicy::exponential(is_not_ready, STATE_WAIT_DEADLINE),
        }
    }
}

impl PoolPolicies {
    /// Overrides the first backoff interval of every policy.
    #[must_use]
    pub const fn with_initial_interval(self, interval: Duration) -> Self {
        Self {
            throttle: self.throttle.with_initial_interval(interval),
            state_throttle: self.state_throttle.with_initial_interval(interval),
            not_ready: self.not_ready.with_initial_interval(interval),
        }
    }

    /// Overrides the deadline of every policy.
    #[must_use]
    pub const fn with_deadline(self, deadline: Duration) -> Self {
        Self {
            throttle: self.throttle.with_deadline(deadline),
            state_throttle: self.state_throttle.with_deadline(deadline),
            not_ready: self.not_ready.with_deadline(deadline),
        }
    }
}

/// Volume API wrapped with retry policies and candidate ordering.
#[derive(Clone, Debug)]
pub struct PoolClient<A: VolumeApi> {
    api: A,
    policies: PoolPolicies,
    order: CandidateOrder,
}

impl<A: VolumeApi> PoolClient<A> {
    /// Creates a client with production policies and shuffled candidates.
    #[must_use]
    pub fn new(api: A) -> Self {
        Self {
            api,
            policies: PoolPolicies::default(),
            order: shuffle,
        }
    }

    /// Overrides the retry policies (useful for tests).
    #[must_use]
    pub const fn with_policies(mut self, policies: PoolPolicies) -> Self {
        self.policies = policies;
        self
    }

    /// Overrides how candidate lists are ordered.
    #[must_use]
    pub const fn with_order(mut self, order: CandidateOrder) -> Self {
        self.order = order;
        self
    }

    /// Underlying API without retry wrapping.
    #[must_use]
    pub const fn api(&self) -> &A {
        &self.api
    }

    async fn describe(&self, filter: &VolumeFilter) -> Result<Vec<Volume>, ProviderError> {
        self.policies
            .throttle
            .run(|| self.api.describe_volumes(filter))
            .await
            .map_err(ProviderError::from)
    }

    /// Lists available volumes tagged for `pool` in `zone`, in candidate
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when the listing fails or throttling outlasts
    /// the deadline.
    pub async fn list_available(
        &self,
        pool: &str,
        zone: &str,
    ) -> Result<Vec<Volume>, ProviderError> {
        let filter = VolumeFilter::Available {
            pool: pool.to_owned(),
            zone: zone.to_owned(),
        };
        let mut volumes = self.describe(&filter).await?;
        (self.order)(&mut volumes);
        debug!(pool, zone, found = volumes.len(), "listed available pool volumes");
        Ok(volumes)
    }

    /// Lists exactly the named volumes, whatever their state.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when the listing fails.
    pub async fn list_by_ids(&self, ids: &[String]) -> Result<Vec<Volume>, ProviderError> {
        self.describe(&VolumeFilter::Ids(ids.to_vec())).await
    }

    /// Lists volumes attached to `instance_id` and tagged for `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when the listing fails.
    pub async fn list_attached(
        &self,
        instance_id: &str,
        pool: &str,
    ) -> Result<Vec<Volume>, ProviderError> {
        let filter = VolumeFilter::AttachedTo {
            instance_id: instance_id.to_owned(),
            pool: pool.to_owned(),
        };
        self.describe(&filter).await
    }

    /// Creates a volume and waits until it is `available`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when creation fails or the volume never
    /// becomes available.
    pub async fn create(&self, request: &NewVolume) -> Result<Volume, ProviderError> {
        let created = self
            .policies
            .throttle
            .run(|| self.api.create_volume(request))
            .await?;
        info!(volume_id = %created.id, zone = %request.zone, "created volume");
        self.wait_for_state(&created.id, "available").await
    }

    /// Attempts to attach `volume_id` at `device`.
    ///
    /// Returns `Ok(false)` when the provider refuses the attachment, which
    /// usually means another instance claimed the volume first.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when throttling outlasts the deadline or the
    /// provider client itself fails.
    pub async fn attach(
        &self,
        volume_id: &str,
        device: &str,
        instance_id: &str,
    ) -> Result<bool, ProviderError> {
        let outcome = self
            .policies
            .throttle
            .run(|| self.api.attach_volume(volume_id, device, instance_id))
            .await;
        match outcome {
            Ok(()) => Ok(true),
            Err(RetryError::Rejected(err)) if is_api_error(&err) => {
                debug!(volume_id, device, error = %err, "attach refused");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Polls until the volume or its attachment reports `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::RetryExhausted`] when the state is not reached
    /// in time, or any non-retryable provider failure.
    pub async fn wait_for_state(
        &self,
        volume_id: &str,
        expected: &str,
    ) -> Result<Volume, ProviderError> {
        let volume = self
            .policies
            .state_throttle
            .run(|| async move {
                self.policies
                    .not_ready
                    .run(|| self.poll_state(volume_id, expected))
                    .await
                    .map_err(ProviderError::from)
            })
            .await?;
        debug!(volume_id, state = expected, "volume reached state");
        Ok(volume)
    }

    async fn poll_state(&self, volume_id: &str, expected: &str) -> Result<Volume, ProviderError> {
        let filter = VolumeFilter::Ids(vec![volume_id.to_owned()]);
        let volume = self.api.describe_volumes(&filter).await?.into_iter().next();
        match volume {
            Some(found) if found.reports_state(expected) => Ok(found),
            Some(found) => Err(ProviderError::NotReady {
                volume_id: volume_id.to_owned(),
                expected: expected.to_owned(),
                observed: found
                    .attachment
                    .map_or(found.state, |attachment| attachment.state),
            }),
            None => Err(ProviderError::NotReady {
                volume_id: volume_id.to_owned(),
                expected: expected.to_owned(),
                observed: String::from("missing"),
            }),
        }
    }

    /// Adds `tags` to `volume_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when tagging fails.
    pub async fn tag(&self, volume_id: &str, tags: &TagSet) -> Result<(), ProviderError> {
        self.policies
            .throttle
            .run(|| self.api.create_tags(volume_id, tags))
            .await?;
        debug!(volume_id, count = tags.len(), "tagged volume");
        Ok(())
    }

    /// Requests detachment of `volume_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when detachment fails.
    pub async fn detach(&self, volume_id: &str) -> Result<(), ProviderError> {
        self.policies
            .throttle
            .run(|| self.api.detach_volume(volume_id))
            .await?;
        info!(volume_id, "detach requested");
        Ok(())
    }
}
