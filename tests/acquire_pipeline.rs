//! End-to-end acquisition from a YAML configuration, driven by the
//! in-memory provider and scripted host commands.

use std::time::Duration;

use camino::Utf8PathBuf;
use ebspool::pool::keep_order;
use ebspool::test_support::{FakeVolumeApi, ScriptedRunner, pool_volume};
use ebspool::{
    AcquireOrchestrator, Context, InstanceMetadata, MountTable, Origin, PoolClient, PoolConfig,
    PoolPolicies, Releaser, RetryPolicy, provider::is_api_error,
};
use rstest::{fixture, rstest};
use tempfile::TempDir;

const ZONE: &str = "us-east-1a";

struct Workspace {
    _dir: TempDir,
    root: Utf8PathBuf,
}

impl Workspace {
    fn path(&self, name: &str) -> Utf8PathBuf {
        self.root.join(name)
    }

    fn write_config(&self, body: &str) -> PoolConfig {
        let config = format!(
            "pool_name: scratch\ncachefile: {cache}\ntagfile: {tagfile}\n\
             ignore_tags: [cost-centre]\ntags:\n  cost-centre: 12\n  team: data\n\
             ebs:\n  mountpoint: {mount}\n  filesystem_type: xfs\n  filesystem_args: -K\n{body}",
            cache = self.path("cache"),
            tagfile = self.path("tagfile.yaml"),
            mount = self.path("ebs"),
        );
        let path = self.path("context.yaml");
        std::fs::write(&path, config).expect("write config");
        std::fs::write(self.path("tagfile.yaml"), "tags:\n  build: 42\n").expect("write tagfile");
        PoolConfig::load(&path).expect("load config")
    }

    fn context(&self, config: &PoolConfig) -> Context {
        let identity = InstanceMetadata {
            instance_id: String::from("i-self"),
            availability_zone: String::from(ZONE),
        };
        let tags = config.load_tag_file().expect("tag file");
        let mut context = Context::from_config(config, &identity, tags).expect("context");
        context.first_device = self.path("xvdf");
        context
    }
}

#[fixture]
fn workspace() -> Workspace {
    let dir = TempDir::new().expect("temp dir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 temp dir");
    Workspace { _dir: dir, root }
}

fn pool(api: &FakeVolumeApi) -> PoolClient<FakeVolumeApi> {
    PoolClient::new(api.clone()).with_order(keep_order).with_policies(
        PoolPolicies::default()
            .with_initial_interval(Duration::from_millis(1))
            .with_deadline(Duration::from_millis(200)),
    )
}

#[rstest]
#[tokio::test]
async fn claims_existing_and_creates_the_shortfall(workspace: Workspace) {
    let config = workspace.write_config("  count: 2\n");
    let api = FakeVolumeApi::new().with_materialised_devices();
    api.insert(pool_volume("vol-a", "scratch", ZONE));
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "xfs\n", "");
    runner.push_success();
    runner.push_success();
    runner.push_success();
    runner.push_success();

    let orchestrator =
        AcquireOrchestrator::new(workspace.context(&config), pool(&api), runner.clone());
    let summary = orchestrator
        .execute(&mut MountTable::default())
        .await
        .expect("acquisition");

    let origins = summary
        .owned
        .iter()
        .map(|owned| (owned.volume_id.as_str(), owned.origin))
        .collect::<Vec<_>>();
    assert_eq!(
        origins,
        [("vol-a", Origin::Claimed), ("vol-new-1", Origin::Created)]
    );

    let xvdf = workspace.path("xvdf");
    let xvdg = workspace.path("xvdg");
    assert_eq!(
        runner.command_lines(),
        [
            format!("blkid -s TYPE -o value {xvdf}"),
            format!("xfs_repair -n {xvdf}"),
            format!("mount {xvdf} {}", workspace.path("ebs0")),
            format!("mkfs.xfs -K {xvdg}"),
            format!("mount {xvdg} {}", workspace.path("ebs1")),
        ]
    );

    let cache = std::fs::read_to_string(workspace.path("cache")).expect("cache file");
    assert_eq!(cache, format!("{xvdf}\n{xvdg}\n"));

    let link = std::fs::read_link(workspace.path("ebs")).expect("stable symlink");
    assert!(link.ends_with("ebs0"), "link points at {}", link.display());

    let tags = api.volume("vol-new-1").expect("created volume").tags;
    assert_eq!(tags.get("team").map(String::as_str), Some("data"));
    assert_eq!(tags.get("build").map(String::as_str), Some("42"));
    assert_eq!(tags.get("pool").map(String::as_str), Some("scratch"));
    assert!(!tags.contains_key("cost-centre"));
}

#[rstest]
#[tokio::test]
async fn acquired_volumes_can_be_released(workspace: Workspace) {
    let config = workspace.write_config("  count: 1\n");
    let api = FakeVolumeApi::new().with_materialised_devices();
    api.insert(pool_volume("vol-a", "scratch", ZONE));
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "ext4\n", "");
    runner.push_success();
    runner.push_success();

    let mut mounts = MountTable::default();
    AcquireOrchestrator::new(workspace.context(&config), pool(&api), runner.clone())
        .execute(&mut mounts)
        .await
        .expect("acquisition");

    runner.push_success();
    runner.push_success();
    let summary = Releaser::new(pool(&api), runner.clone(), mounts, "i-self", "scratch")
        .with_list_policy(RetryPolicy::fixed(is_api_error, 2, Duration::from_millis(1)))
        .release()
        .await
        .expect("release");

    assert_eq!(summary.detached, ["vol-a"]);
    let released = api.volume("vol-a").expect("vol-a");
    assert_eq!(released.state, "available");
    assert!(!workspace.path("xvdf").exists());
    let lines = runner.command_lines();
    assert_eq!(
        lines.get(3..).map(<[String]>::to_vec),
        Some(vec![
            format!("fuser -v -k -m {}", workspace.path("ebs0")),
            format!("umount {}", workspace.path("xvdf")),
        ])
    );
}
