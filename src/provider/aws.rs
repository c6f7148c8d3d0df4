//! `VolumeApi` implementation that shells out to the `aws` CLI.

use std::ffi::OsString;

use serde::{Deserialize, Serialize};

use crate::command::{CommandOutput, CommandRunner, ProcessCommandRunner};

use super::{
    ApiFuture, Attachment, NewVolume, ProviderError, TagSet, Volume, VolumeApi, VolumeFilter,
};

/// Default AWS CLI binary name.
pub const DEFAULT_AWS_BIN: &str = "aws";

const ERROR_PREFIX: &str = "An error occurred (";

/// EC2 volume API reached through `aws ec2 ... --output json`.
#[derive(Clone, Debug)]
pub struct AwsCli<R: CommandRunner> {
    aws_bin: String,
    region: String,
    runner: R,
}

impl AwsCli<ProcessCommandRunner> {
    /// Creates a client wired to the real process runner.
    #[must_use]
    pub fn with_process_runner(aws_bin: impl Into<String>, region: impl Into<String>) -> Self {
        Self::new(aws_bin, region, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> AwsCli<R> {
    /// Creates a client using the provided runner.
    #[must_use]
    pub fn new(aws_bin: impl Into<String>, region: impl Into<String>, runner: R) -> Self {
        Self {
            aws_bin: aws_bin.into(),
            region: region.into(),
            runner,
        }
    }

    /// Region every call is scoped to.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    fn ec2_args(&self, operation: &str, extra: Vec<OsString>) -> Vec<OsString> {
        let mut args = vec![OsString::from("ec2"), OsString::from(operation)];
        args.extend(extra);
        args.extend([
            OsString::from("--region"),
            OsString::from(&self.region),
            OsString::from("--output"),
            OsString::from("json"),
        ]);
        args
    }

    async fn call(&self, operation: &str, extra: Vec<OsString>) -> Result<String, ProviderError> {
        let args = self.ec2_args(operation, extra);
        let output = self.runner.run(&self.aws_bin, &args, None).await?;
        check_output(operation, output)
    }
}

fn check_output(operation: &str, output: CommandOutput) -> Result<String, ProviderError> {
    if output.is_success() {
        return Ok(output.stdout);
    }
    let (code, message) = parse_error(&output.stderr).unwrap_or_else(|| {
        (
            format!("exit status {}", output.status_text()),
            output.stderr.trim().to_owned(),
        )
    });
    Err(ProviderError::Api {
        operation: operation.to_owned(),
        code,
        message,
    })
}

/// Extracts the error code and message from CLI stderr such as
/// `An error occurred (Throttling) when calling the AttachVolume operation: Rate exceeded`.
fn parse_error(stderr: &str) -> Option<(String, String)> {
    let (_, after_prefix) = stderr.split_once(ERROR_PREFIX)?;
    let (code, rest) = after_prefix.split_once(')')?;
    let message = rest
        .split_once(": ")
        .map_or(rest, |(_, message)| message)
        .trim();
    Some((code.to_owned(), message.to_owned()))
}

fn filter_arg(name: &str, value: &str) -> OsString {
    OsString::from(format!("Name={name},Values={value}"))
}

fn describe_args(filter: &VolumeFilter) -> Vec<OsString> {
    match filter {
        VolumeFilter::Available { pool, zone } => vec![
            OsString::from("--filters"),
            filter_arg("status", "available"),
            filter_arg(&format!("tag:{}", super::POOL_TAG), pool),
            filter_arg("availability-zone", zone),
        ],
        VolumeFilter::Ids(ids) => {
            let mut args = vec![OsString::from("--volume-ids")];
            args.extend(ids.iter().map(OsString::from));
            args
        }
        VolumeFilter::AttachedTo { instance_id, pool } => vec![
            OsString::from("--filters"),
            filter_arg("attachment.instance-id", instance_id),
            filter_arg(&format!("tag:{}", super::POOL_TAG), pool),
        ],
    }
}

fn parse_json<'de, T: Deserialize<'de>>(
    operation: &str,
    stdout: &'de str,
) -> Result<T, ProviderError> {
    serde_json::from_str(stdout).map_err(|err| ProviderError::Parse {
        operation: operation.to_owned(),
        message: err.to_string(),
    })
}

impl<R: CommandRunner> VolumeApi for AwsCli<R> {
    fn describe_volumes<'a>(&'a self, filter: &'a VolumeFilter) -> ApiFuture<'a, Vec<Volume>> {
        Box::pin(async move {
            if matches!(filter, VolumeFilter::Ids(ids) if ids.is_empty()) {
                return Ok(Vec::new());
            }
            let stdout = self.call("describe-volumes", describe_args(filter)).await?;
            let listing: AwsVolumeList = parse_json("describe-volumes", &stdout)?;
            Ok(listing.volumes.into_iter().map(Volume::from).collect())
        })
    }

    fn create_volume<'a>(&'a self, request: &'a NewVolume) -> ApiFuture<'a, Volume> {
        Box::pin(async move {
            let extra = vec![
                OsString::from("--size"),
                OsString::from(request.size_gib.to_string()),
                OsString::from("--volume-type"),
                OsString::from(&request.volume_type),
                OsString::from("--availability-zone"),
                OsString::from(&request.zone),
            ];
            let stdout = self.call("create-volume", extra).await?;
            let created: AwsVolume = parse_json("create-volume", &stdout)?;
            Ok(Volume::from(created))
        })
    }

    fn attach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        device: &'a str,
        instance_id: &'a str,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let extra = vec![
                OsString::from("--volume-id"),
                OsString::from(volume_id),
                OsString::from("--device"),
                OsString::from(device),
                OsString::from("--instance-id"),
                OsString::from(instance_id),
            ];
            self.call("attach-volume", extra).await.map(drop)
        })
    }

    fn detach_volume<'a>(&'a self, volume_id: &'a str) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let extra = vec![OsString::from("--volume-id"), OsString::from(volume_id)];
            self.call("detach-volume", extra).await.map(drop)
        })
    }

    fn create_tags<'a>(&'a self, volume_id: &'a str, tags: &'a TagSet) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let entries = tags
                .iter()
                .map(|(key, value)| AwsTag {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect::<Vec<_>>();
            let encoded = serde_json::to_string(&entries).map_err(|err| ProviderError::Parse {
                operation: String::from("create-tags"),
                message: err.to_string(),
            })?;
            let extra = vec![
                OsString::from("--resources"),
                OsString::from(volume_id),
                OsString::from("--tags"),
                OsString::from(encoded),
            ];
            self.call("create-tags", extra).await.map(drop)
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsVolumeList {
    #[serde(default)]
    volumes: Vec<AwsVolume>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsVolume {
    volume_id: String,
    state: String,
    availability_zone: String,
    #[serde(default)]
    attachments: Vec<AwsAttachment>,
    #[serde(default)]
    tags: Vec<AwsTag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsAttachment {
    device: String,
    instance_id: String,
    state: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AwsTag {
    key: String,
    value: String,
}

impl From<AwsVolume> for Volume {
    fn from(value: AwsVolume) -> Self {
        Self {
            id: value.volume_id,
            state: value.state,
            zone: value.availability_zone,
            attachment: value.attachments.into_iter().next().map(|attachment| Attachment {
                device: attachment.device,
                instance_id: attachment.instance_id,
                state: attachment.state,
            }),
            tags: value
                .tags
                .into_iter()
                .map(|tag| (tag.key, tag.value))
                .collect(),
        }
    }
}
