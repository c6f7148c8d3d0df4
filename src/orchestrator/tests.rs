//! Acquisition scenarios driven by the in-memory provider and scripted
//! commands.

use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::context::Target;
use crate::pool::{PoolPolicies, keep_order};
use crate::provider::{Attachment, NewVolume, TagSet};
use crate::provision::FilesystemSpec;
use crate::test_support::{FakeVolumeApi, ScriptedRunner, pool_volume};

const POOL: &str = "scratch";
const ZONE: &str = "us-east-1a";
const INSTANCE: &str = "i-self";

struct Harness {
    _dir: TempDir,
    root: Utf8PathBuf,
    api: FakeVolumeApi,
    runner: ScriptedRunner,
}

impl Harness {
    fn device(&self, letter: char) -> String {
        format!("{}/xvd{letter}", self.root)
    }

    fn context(&self, target: Target, strict: bool) -> Context {
        Context {
            pool: String::from(POOL),
            strict: strict || target.is_recovery(),
            target,
            filesystem: FilesystemSpec {
                fs_type: String::from("ext4"),
                args: String::new(),
            },
            mount_base: self.root.join("ebs"),
            mount_options: String::new(),
            new_volume: NewVolume {
                size_gib: 10,
                volume_type: String::from("gp3"),
                zone: String::from(ZONE),
            },
            instance_id: String::from(INSTANCE),
            tags: TagSet::from([
                (String::from("pool"), String::from(POOL)),
                (String::from("instance_id"), String::from(INSTANCE)),
            ]),
            cache_file: self.root.join("cache"),
            first_device: Utf8PathBuf::from(self.device('f')),
        }
    }

    fn orchestrator(
        &self,
        target: Target,
        strict: bool,
    ) -> AcquireOrchestrator<FakeVolumeApi, ScriptedRunner> {
        let pool = PoolClient::new(self.api.clone())
            .with_order(keep_order)
            .with_policies(
                PoolPolicies::default()
                    .with_initial_interval(Duration::from_millis(1))
                    .with_deadline(Duration::from_millis(200)),
            );
        AcquireOrchestrator::new(self.context(target, strict), pool, self.runner.clone())
    }

    fn script_healthy(&self) {
        self.runner.push_output(Some(0), "ext4\n", "");
        self.runner.push_success();
        self.runner.push_success();
    }

    fn script_corrupt(&self) {
        self.runner.push_output(Some(0), "ext4\n", "");
        self.runner.push_output(Some(4), "", "errors found");
    }

    fn cache_lines(&self) -> Vec<String> {
        std::fs::read_to_string(self.root.join("cache"))
            .unwrap_or_default()
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

#[fixture]
fn harness() -> Harness {
    let dir = TempDir::new().expect("temp dir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 temp dir");
    Harness {
        _dir: dir,
        root,
        api: FakeVolumeApi::new().with_materialised_devices(),
        runner: ScriptedRunner::new(),
    }
}

fn ids(owned: &[OwnedVolume]) -> Vec<&str> {
    owned.iter().map(|volume| volume.volume_id.as_str()).collect()
}

#[rstest]
#[tokio::test]
async fn lost_race_moves_on_to_the_next_candidate(harness: Harness) {
    for id in ["vol-a", "vol-b", "vol-c"] {
        harness.api.insert(pool_volume(id, POOL, ZONE));
    }
    harness.api.contest("vol-b");
    harness.script_healthy();
    harness.script_healthy();

    let summary = harness
        .orchestrator(Target::Count(2), false)
        .execute(&mut MountTable::default())
        .await
        .expect("acquisition");

    assert_eq!(ids(&summary.owned), ["vol-a", "vol-c"]);
    assert_eq!(summary.lost_races, ["vol-b"]);
    let devices = summary
        .owned
        .iter()
        .map(|owned| owned.device.clone())
        .collect::<Vec<_>>();
    assert_eq!(devices, [harness.device('f'), harness.device('g')]);
    let mountpoints = summary
        .owned
        .iter()
        .map(|owned| owned.mountpoint.clone())
        .collect::<Vec<_>>();
    assert_eq!(
        mountpoints,
        [harness.root.join("ebs0"), harness.root.join("ebs1")]
    );
    assert_eq!(harness.cache_lines(), devices);
    let tagged = harness.api.volume("vol-a").expect("vol-a");
    assert_eq!(tagged.tags.get("instance_id").map(String::as_str), Some(INSTANCE));
    assert_eq!(harness.runner.remaining(), 0);
}

#[rstest]
#[tokio::test]
async fn corrupt_volume_is_blacklisted_and_device_reused(harness: Harness) {
    harness.api.insert(pool_volume("vol-a", POOL, ZONE));
    harness.api.insert(pool_volume("vol-b", POOL, ZONE));
    harness.script_corrupt();
    harness.script_healthy();

    let summary = harness
        .orchestrator(Target::Count(1), false)
        .execute(&mut MountTable::default())
        .await
        .expect("acquisition");

    assert_eq!(summary.blacklisted, ["vol-a"]);
    assert_eq!(ids(&summary.owned), ["vol-b"]);
    assert_eq!(
        summary.owned.first().map(|owned| owned.device.clone()),
        Some(harness.device('f'))
    );

    let rejected = harness.api.volume("vol-a").expect("vol-a");
    assert_eq!(rejected.state, "available");
    assert!(rejected.attachment.is_none());
    assert_eq!(
        rejected.tags.get("blacklist").map(String::as_str),
        Some("fsck exited with status 4 on ext4 filesystem: errors found")
    );
}

#[rstest]
#[tokio::test]
async fn recovery_fails_when_a_volume_cannot_be_reclaimed(harness: Harness) {
    harness.api.insert(pool_volume("vol-a", POOL, ZONE));
    harness.api.insert(pool_volume("vol-b", POOL, ZONE));
    harness.api.contest("vol-b");
    harness.script_healthy();

    let err = harness
        .orchestrator(
            Target::Recover(vec![String::from("vol-a"), String::from("vol-b")]),
            false,
        )
        .execute(&mut MountTable::default())
        .await
        .expect_err("vol-b is held elsewhere");

    assert_eq!(
        err,
        AcquireError::CandidatesExhausted {
            wanted: 2,
            owned: 1,
            missing: vec![String::from("vol-b")],
        }
    );
    assert_eq!(
        err.to_string(),
        "failed to attach volumes: owned 1 of 2 (unclaimed: vol-b)"
    );
    assert!(
        !harness
            .api
            .calls()
            .iter()
            .any(|call| call.starts_with("create")),
        "recovery must never create volumes"
    );
}

#[rstest]
#[tokio::test]
async fn recovery_fails_when_a_volume_is_corrupt(harness: Harness) {
    harness.api.insert(pool_volume("vol-a", POOL, ZONE));
    harness.api.insert(pool_volume("vol-b", POOL, ZONE));
    harness.script_healthy();
    harness.script_corrupt();

    let err = harness
        .orchestrator(
            Target::Recover(vec![String::from("vol-a"), String::from("vol-b")]),
            false,
        )
        .execute(&mut MountTable::default())
        .await
        .expect_err("vol-b fails its filesystem check");

    assert_eq!(
        err,
        AcquireError::CandidatesExhausted {
            wanted: 2,
            owned: 1,
            missing: vec![String::from("vol-b")],
        }
    );
    let rejected = harness.api.volume("vol-b").expect("vol-b");
    let reason = rejected.tags.get("blacklist").expect("blacklist tag");
    assert!(reason.starts_with("fsck exited with status 4"), "reason: {reason}");
    assert!(rejected.attachment.is_none());

    let calls = harness.api.calls();
    let attaches = calls
        .iter()
        .filter(|call| call.starts_with("attach vol-b"))
        .count();
    assert_eq!(attaches, 1, "vol-b is attempted once: {calls:?}");
    assert!(
        !calls.iter().any(|call| call.starts_with("create")),
        "recovery must never create volumes"
    );
    assert_eq!(harness.runner.remaining(), 0);
}

#[rstest]
#[tokio::test]
async fn recovery_reclaims_blacklisted_volumes(harness: Harness) {
    let mut volume = pool_volume("vol-a", POOL, ZONE);
    volume
        .tags
        .insert(String::from("blacklist"), String::from("old failure"));
    harness.api.insert(volume);
    harness.script_healthy();

    let summary = harness
        .orchestrator(Target::Recover(vec![String::from("vol-a")]), false)
        .execute(&mut MountTable::default())
        .await
        .expect("recovery");

    assert_eq!(ids(&summary.owned), ["vol-a"]);
}

#[rstest]
#[tokio::test]
async fn blacklisted_candidates_are_skipped_outside_recovery(harness: Harness) {
    let mut bad = pool_volume("vol-a", POOL, ZONE);
    bad.tags
        .insert(String::from("blacklist"), String::from("no filesystem"));
    harness.api.insert(bad);
    harness.api.insert(pool_volume("vol-b", POOL, ZONE));
    harness.script_healthy();

    let summary = harness
        .orchestrator(Target::Count(1), false)
        .execute(&mut MountTable::default())
        .await
        .expect("acquisition");

    assert_eq!(ids(&summary.owned), ["vol-b"]);
    assert!(
        !harness.api.calls().iter().any(|call| call.starts_with("attach vol-a")),
        "blacklisted volume must not be attached"
    );
}

#[rstest]
#[tokio::test]
async fn empty_pool_creates_and_formats_a_volume(harness: Harness) {
    harness.runner.push_success();
    harness.runner.push_success();

    let summary = harness
        .orchestrator(Target::Count(1), false)
        .execute(&mut MountTable::default())
        .await
        .expect("acquisition");

    let owned = summary.owned.first().expect("one volume");
    assert_eq!(owned.volume_id, "vol-new-1");
    assert_eq!(owned.origin, Origin::Created);
    let commands = harness.runner.command_lines();
    assert_eq!(
        commands,
        [
            format!("mkfs.ext4 {}", harness.device('f')),
            format!("mount {} {}", harness.device('f'), harness.root.join("ebs0")),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn strict_mode_does_not_create_volumes(harness: Harness) {
    let err = harness
        .orchestrator(Target::Count(1), true)
        .execute(&mut MountTable::default())
        .await
        .expect_err("nothing to claim");

    assert_eq!(
        err,
        AcquireError::CandidatesExhausted {
            wanted: 1,
            owned: 0,
            missing: Vec::new(),
        }
    );
}

#[rstest]
#[tokio::test]
async fn new_volume_attach_failure_is_fatal(harness: Harness) {
    harness.api.contest("vol-new-1");

    let err = harness
        .orchestrator(Target::Count(1), false)
        .execute(&mut MountTable::default())
        .await
        .expect_err("attach refused");

    assert_eq!(
        err,
        AcquireError::NewVolumeAttach {
            volume_id: String::from("vol-new-1"),
            device: harness.device('f'),
        }
    );
}

#[rstest]
#[tokio::test]
async fn mkfs_failure_is_fatal(harness: Harness) {
    harness.runner.push_failure(1);

    let err = harness
        .orchestrator(Target::Count(1), false)
        .execute(&mut MountTable::default())
        .await
        .expect_err("mkfs fails");

    assert!(
        matches!(&err, AcquireError::Format { volume_id, .. } if volume_id == "vol-new-1"),
        "got {err:?}"
    );
}

#[rstest]
#[tokio::test]
async fn missing_probe_tool_is_fatal(harness: Harness) {
    harness.api.insert(pool_volume("vol-a", POOL, ZONE));
    harness.runner.push_missing_program();

    let err = harness
        .orchestrator(Target::Count(1), false)
        .execute(&mut MountTable::default())
        .await
        .expect_err("blkid missing");

    assert!(
        matches!(&err, AcquireError::Validate { volume_id, .. } if volume_id == "vol-a"),
        "got {err:?}"
    );
}

fn attached_volume(id: &str, device: &str) -> Volume {
    Volume {
        state: String::from("in-use"),
        attachment: Some(Attachment {
            device: device.to_owned(),
            instance_id: String::from(INSTANCE),
            state: String::from("attached"),
        }),
        ..pool_volume(id, POOL, ZONE)
    }
}

#[rstest]
#[tokio::test]
async fn mounted_volumes_count_toward_the_target(harness: Harness) {
    let device = harness.device('f');
    harness.api.insert(attached_volume("vol-a", &device));
    harness.api.insert(pool_volume("vol-b", POOL, ZONE));
    let mut mounts = MountTable::parse(&format!("{device} /ebs0 ext4 rw 0 0\n"));

    let summary = harness
        .orchestrator(Target::Count(1), false)
        .execute(&mut mounts)
        .await
        .expect("nothing to do");

    assert_eq!(ids(&summary.owned), ["vol-a"]);
    assert_eq!(
        summary.owned.first().map(|owned| owned.origin),
        Some(Origin::AlreadyMounted)
    );
    assert!(harness.runner.invocations().is_empty());
    assert!(
        !harness.api.calls().iter().any(|call| call.starts_with("attach")),
        "no new attachment expected"
    );
}

#[rstest]
#[tokio::test]
async fn unmounted_attached_volume_is_validated_and_mounted(harness: Harness) {
    let device = harness.device('f');
    std::fs::write(&device, b"").expect("device file");
    harness.api.insert(attached_volume("vol-a", &device));
    harness.script_healthy();
    let mut mounts = MountTable::default();

    let summary = harness
        .orchestrator(Target::Count(1), false)
        .execute(&mut mounts)
        .await
        .expect("resumed");

    let owned = summary.owned.first().expect("one volume");
    assert_eq!(owned.origin, Origin::Resumed);
    assert_eq!(owned.device, device);
    assert_eq!(
        mounts.mountpoint(&device),
        Some(harness.root.join("ebs0").as_path())
    );
}

#[rstest]
#[tokio::test]
async fn throttled_attach_is_retried(harness: Harness) {
    harness.api.insert(pool_volume("vol-a", POOL, ZONE));
    harness.api.throttle("attach-volume", 2);
    harness.script_healthy();

    let summary = harness
        .orchestrator(Target::Count(1), false)
        .execute(&mut MountTable::default())
        .await
        .expect("acquisition");

    assert_eq!(ids(&summary.owned), ["vol-a"]);
    assert!(summary.lost_races.is_empty());
}

#[rstest]
fn errors_name_the_volume() {
    let err = AcquireError::Provider {
        volume_id: Some(String::from("vol-a")),
        source: ProviderError::Parse {
            operation: String::from("attach-volume"),
            message: String::from("bad json"),
        },
    };
    assert_eq!(
        err.to_string(),
        "provider call failed for vol-a: failed to parse attach-volume output: bad json"
    );
}
