//! Teardown companion for `ebspool`.
//!
//! Unmounts and detaches every pool volume attached to this instance so the
//! volumes return to the pool before the instance stops.

use camino::Utf8Path;
use clap::Parser;
use ebspool::{
    AwsCli, InstanceMetadata, MetadataClient, MountTable, PoolClient, PoolConfig,
    ProcessCommandRunner, Releaser, RuntimeConfig, logging,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "ebspool-release",
    about = "Unmount and detach this instance's pool volumes",
    version
)]
struct Cli {
    /// Pool configuration file, consulted for `pool_name` when `--pool` is
    /// absent.
    #[arg(long, value_name = "PATH", env = "EBSPOOL_CONFIG")]
    config: Option<String>,
    /// Pool whose volumes are released.
    #[arg(long, value_name = "NAME")]
    pool: Option<String>,
    /// Instance to release volumes from, instead of asking the metadata
    /// service.
    #[arg(long, value_name = "ID")]
    instance_id: Option<String>,
    /// Availability zone (selects the region), instead of asking the
    /// metadata service.
    #[arg(long, value_name = "AZ")]
    availability_zone: Option<String>,
    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), String> {
    let cli = Cli::parse();
    let runtime = RuntimeConfig::load_without_cli_args().map_err(|err| err.to_string())?;
    runtime.validate().map_err(|err| err.to_string())?;
    logging::init(&runtime.log_level, cli.log_json).map_err(|err| err.to_string())?;

    let Some(pool_name) = pool_name(&cli)? else {
        info!("no pool configured; nothing to release");
        return Ok(());
    };
    let identity = identity(&runtime, &cli).await?;
    let mounts =
        MountTable::load(Utf8Path::new(&runtime.mount_table)).map_err(|err| err.to_string())?;

    let api = AwsCli::with_process_runner(runtime.aws_bin.as_str(), identity.region());
    let releaser = Releaser::new(
        PoolClient::new(api),
        ProcessCommandRunner,
        mounts,
        identity.instance_id,
        pool_name,
    );
    let summary = releaser.release().await.map_err(|err| err.to_string())?;
    info!(
        detached = summary.detached.len(),
        skipped = summary.skipped.len(),
        "release complete"
    );
    Ok(())
}

fn pool_name(cli: &Cli) -> Result<Option<String>, String> {
    if let Some(pool) = cli.pool.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        return Ok(Some(pool.to_owned()));
    }
    let explicit = cli.config.as_deref().map(Utf8Path::new);
    let Some(path) = PoolConfig::discover(explicit).map_err(|err| err.to_string())? else {
        return Ok(None);
    };
    let config = PoolConfig::load(&path).map_err(|err| err.to_string())?;
    config
        .require_pool_name()
        .map(|name| Some(name.to_owned()))
        .map_err(|err| err.to_string())
}

async fn identity(runtime: &RuntimeConfig, cli: &Cli) -> Result<InstanceMetadata, String> {
    if let (Some(id), Some(zone)) = (&cli.instance_id, &cli.availability_zone) {
        return Ok(InstanceMetadata {
            instance_id: id.clone(),
            availability_zone: zone.clone(),
        });
    }
    let fetched = MetadataClient::new(runtime.metadata_url.as_str())
        .map_err(|err| err.to_string())?
        .fetch()
        .await
        .map_err(|err| err.to_string())?;
    Ok(InstanceMetadata {
        instance_id: cli.instance_id.clone().unwrap_or(fetched.instance_id),
        availability_zone: cli
            .availability_zone
            .clone()
            .unwrap_or(fetched.availability_zone),
    })
}
