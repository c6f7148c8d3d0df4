//! Command-line interface definitions for the `ebspool` binary.
//!
//! This module holds only clap parser structures so the build script can
//! reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `ebspool` binary.
#[derive(Debug, Parser)]
#[command(
    name = "ebspool",
    about = "Claim, validate, and mount block-storage volumes from a shared pool",
    version
)]
pub(crate) struct Cli {
    /// Pool configuration file. Defaults to `./context.yaml`, then
    /// `/etc/ebs/config.yaml`; when neither exists the run exits quietly.
    #[arg(long, value_name = "PATH", env = "EBSPOOL_CONFIG")]
    pub(crate) config: Option<String>,
    /// Instance to attach volumes to, instead of asking the metadata service.
    #[arg(long, value_name = "ID")]
    pub(crate) instance_id: Option<String>,
    /// Availability zone to draw volumes from, instead of asking the metadata
    /// service.
    #[arg(long, value_name = "AZ")]
    pub(crate) availability_zone: Option<String>,
    /// Emit logs as JSON lines.
    #[arg(long)]
    pub(crate) log_json: bool,
}
