//! Instance identity from the EC2 instance metadata service.

use std::time::Duration;

use reqwest::{Client, Method};
use thiserror::Error;
use tracing::debug;

/// Default metadata service endpoint.
pub const DEFAULT_METADATA_URL: &str = "http://169.254.169.254";

const TOKEN_PATH: &str = "/latest/api/token";
const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const TOKEN_TTL_SECONDS: &str = "300";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised while querying instance metadata.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MetadataError {
    /// The request could not be sent or its body read.
    #[error("metadata request to {url} failed: {message}")]
    Http {
        /// URL requested.
        url: String,
        /// Transport error message.
        message: String,
    },
    /// The service answered with a non-success status.
    #[error("metadata request to {url} returned HTTP {status}")]
    Status {
        /// URL requested.
        url: String,
        /// HTTP status code.
        status: u16,
    },
    /// The service returned an empty value.
    #[error("instance metadata field {field} is empty")]
    Empty {
        /// Metadata path that was empty.
        field: String,
    },
}

/// Identity of the instance this run executes on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceMetadata {
    /// Instance identifier (for example `i-0123456789abcdef0`).
    pub instance_id: String,
    /// Availability zone (for example `us-east-1a`).
    pub availability_zone: String,
}

impl InstanceMetadata {
    /// Region derived by dropping the zone's trailing letter.
    #[must_use]
    pub fn region(&self) -> &str {
        let mut chars = self.availability_zone.chars();
        chars.next_back();
        chars.as_str()
    }
}

/// IMDSv2 client.
#[derive(Clone, Debug)]
pub struct MetadataClient {
    base_url: String,
    client: Client,
}

impl MetadataClient {
    /// Creates a client for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Http`] when the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, MetadataError> {
        let base_url = endpoint.into().trim_end_matches('/').to_owned();
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| MetadataError::Http {
                url: base_url.clone(),
                message: err.to_string(),
            })?;
        Ok(Self { base_url, client })
    }

    /// Fetches the instance id and availability zone.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError`] when the token or either field cannot be
    /// fetched.
    pub async fn fetch(&self) -> Result<InstanceMetadata, MetadataError> {
        let token = self
            .request(Method::PUT, TOKEN_PATH, &[(TOKEN_TTL_HEADER, TOKEN_TTL_SECONDS)])
            .await?;
        let auth = [(TOKEN_HEADER, token.as_str())];
        let instance_id = self
            .request(Method::GET, "/latest/meta-data/instance-id", &auth)
            .await?;
        let availability_zone = self
            .request(
                Method::GET,
                "/latest/meta-data/placement/availability-zone",
                &auth,
            )
            .await?;
        debug!(instance_id = %instance_id, zone = %availability_zone, "fetched instance metadata");
        Ok(InstanceMetadata {
            instance_id,
            availability_zone,
        })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        headers: &[(&str, &str)],
    ) -> Result<String, MetadataError> {
        let url = format!("{}{path}", self.base_url);
        let http_error = |err: reqwest::Error| MetadataError::Http {
            url: url.clone(),
            message: err.to_string(),
        };
        let mut builder = self.client.request(method, &url);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let response = builder.send().await.map_err(http_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(MetadataError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let body = response.text().await.map_err(http_error)?;
        let value = body.trim();
        if value.is_empty() {
            return Err(MetadataError::Empty {
                field: path.to_owned(),
            });
        }
        Ok(value.to_owned())
    }
}
