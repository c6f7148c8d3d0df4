//! Binary entry point for `ebspool`.

use std::io::{self, Write};
use std::process;

use camino::Utf8Path;
use clap::Parser;
use thiserror::Error;
use tracing::info;

use ebspool::{
    AcquireError, AcquireOrchestrator, AwsCli, ConfigError, Context, HostFsError,
    InstanceMetadata, LoggingError, MetadataClient, MetadataError, MountTable, PoolClient,
    PoolConfig, ProcessCommandRunner, RuntimeConfig, logging,
};

mod cli;

use cli::Cli;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("logging error: {0}")]
    Logging(#[from] LoggingError),
    #[error("instance metadata error: {0}")]
    Metadata(#[from] MetadataError),
    #[error("failed to read mount table: {0}")]
    MountTable(#[from] HostFsError),
    #[error("volume acquisition failed: {0}")]
    Acquire(#[from] AcquireError),
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let runtime = RuntimeConfig::load_without_cli_args()?;
    runtime.validate()?;
    logging::init(&runtime.log_level, cli.log_json)?;

    let Some(config_path) = PoolConfig::discover(cli.config.as_deref().map(Utf8Path::new))?
    else {
        info!("no configuration found; nothing to do");
        return Ok(());
    };
    info!(config = %config_path, "loading pool configuration");
    let config = PoolConfig::load(&config_path)?;

    let identity = resolve_identity(&runtime, cli.instance_id, cli.availability_zone).await?;
    let tagfile_tags = config.load_tag_file()?;
    let context = Context::from_config(&config, &identity, tagfile_tags)?;
    let mut mounts = MountTable::load(Utf8Path::new(&runtime.mount_table))?;

    let api = AwsCli::with_process_runner(runtime.aws_bin.as_str(), identity.region());
    let orchestrator =
        AcquireOrchestrator::new(context, PoolClient::new(api), ProcessCommandRunner);
    let summary = orchestrator.execute(&mut mounts).await?;
    info!(
        owned = summary.owned.len(),
        blacklisted = summary.blacklisted.len(),
        lost_races = summary.lost_races.len(),
        "pool volumes ready"
    );
    Ok(())
}

/// Uses the command-line identity when both parts are given, otherwise asks
/// the metadata service and applies any single override on top.
async fn resolve_identity(
    runtime: &RuntimeConfig,
    instance_id: Option<String>,
    availability_zone: Option<String>,
) -> Result<InstanceMetadata, CliError> {
    if let (Some(id), Some(zone)) = (&instance_id, &availability_zone) {
        return Ok(InstanceMetadata {
            instance_id: id.clone(),
            availability_zone: zone.clone(),
        });
    }
    let fetched = MetadataClient::new(runtime.metadata_url.as_str())?
        .fetch()
        .await?;
    Ok(InstanceMetadata {
        instance_id: instance_id.unwrap_or(fetched.instance_id),
        availability_zone: availability_zone.unwrap_or(fetched.availability_zone),
    })
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
