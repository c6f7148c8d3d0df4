//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::command::{CommandError, CommandFuture, CommandOutput, CommandRunner};
use crate::provider::{
    ApiFuture, Attachment, NewVolume, POOL_TAG, ProviderError, TagSet, Volume, VolumeApi,
    VolumeFilter,
};

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Timeout requested by the caller.
    pub timeout: Option<Duration>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

#[derive(Debug)]
enum Scripted {
    Output(CommandOutput),
    TimedOut,
    Missing,
}

#[derive(Debug, Default)]
struct RunnerState {
    responses: VecDeque<Scripted>,
    invocations: Vec<CommandInvocation>,
}

/// Scripted command runner that returns pre-seeded outcomes in FIFO order.
///
/// Clones share the same script so a test can keep a handle for assertions
/// after moving the runner into the code under test.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<RunnerState>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, scripted: Scripted) {
        self.state().responses.push_back(scripted);
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.state().invocations.clone()
    }

    /// Returns the rendered command lines recorded so far.
    #[must_use]
    pub fn command_lines(&self) -> Vec<String> {
        self.state()
            .invocations
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.push(Scripted::Output(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }));
    }

    /// Makes the next invocation exceed its timeout.
    pub fn push_timeout(&self) {
        self.push(Scripted::TimedOut);
    }

    /// Makes the next invocation fail to spawn.
    pub fn push_missing_program(&self) {
        self.push(Scripted::Missing);
    }

    /// Number of scripted responses not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.state().responses.len()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        timeout: Option<Duration>,
    ) -> CommandFuture<'a> {
        let next = {
            let mut state = self.state();
            state.invocations.push(CommandInvocation {
                program: program.to_owned(),
                args: args.to_vec(),
                timeout,
            });
            state.responses.pop_front()
        };
        Box::pin(async move {
            match next {
                Some(Scripted::Output(output)) => Ok(output),
                Some(Scripted::TimedOut) => Err(CommandError::TimedOut {
                    program: program.to_owned(),
                    after: timeout.unwrap_or_default(),
                }),
                Some(Scripted::Missing) => Err(CommandError::Spawn {
                    program: program.to_owned(),
                    message: String::from("No such file or directory"),
                }),
                None => Err(CommandError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                }),
            }
        })
    }
}

/// Builds a pool volume in the `available` state.
#[must_use]
pub fn pool_volume(id: &str, pool: &str, zone: &str) -> Volume {
    Volume {
        id: id.to_owned(),
        state: String::from("available"),
        zone: zone.to_owned(),
        attachment: None,
        tags: TagSet::from([(POOL_TAG.to_owned(), pool.to_owned())]),
    }
}

fn api_error(operation: &str, code: &str, message: &str) -> ProviderError {
    ProviderError::Api {
        operation: operation.to_owned(),
        code: code.to_owned(),
        message: message.to_owned(),
    }
}

#[derive(Debug, Default)]
struct FakeState {
    volumes: BTreeMap<String, Volume>,
    contested: BTreeSet<String>,
    tag_limited: BTreeSet<String>,
    throttled: BTreeMap<&'static str, u32>,
    calls: Vec<String>,
    created: u32,
    materialise_devices: bool,
}

impl FakeState {
    fn take_throttle(&mut self, operation: &'static str) -> Result<(), ProviderError> {
        match self.throttled.get_mut(operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(api_error(operation, "RequestLimitExceeded", "Request limit exceeded."))
            }
            _ => Ok(()),
        }
    }

    fn volume_mut(&mut self, operation: &str, id: &str) -> Result<&mut Volume, ProviderError> {
        self.volumes.get_mut(id).ok_or_else(|| {
            api_error(
                operation,
                "InvalidVolume.NotFound",
                &format!("The volume '{id}' does not exist."),
            )
        })
    }
}

/// In-memory volume API with attach-race, throttling, and tag-limit knobs.
///
/// Attaching a volume touches its device path when device materialisation is
/// enabled, so the device namer observes the allocation exactly as it would
/// on a real host. Detaching removes the file again.
#[derive(Clone, Debug, Default)]
pub struct FakeVolumeApi {
    state: Arc<Mutex<FakeState>>,
}

impl FakeVolumeApi {
    /// Creates an empty fake provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates device files on attach and removes them on detach.
    #[must_use]
    pub fn with_materialised_devices(self) -> Self {
        self.state().materialise_devices = true;
        self
    }

    /// Adds or replaces a volume.
    pub fn insert(&self, volume: Volume) {
        self.state().volumes.insert(volume.id.clone(), volume);
    }

    /// Makes every attach of `id` fail as if another instance won the race.
    pub fn contest(&self, id: &str) {
        self.state().contested.insert(id.to_owned());
    }

    /// Makes tagging `id` fail with `TagLimitExceeded`.
    pub fn limit_tags(&self, id: &str) {
        self.state().tag_limited.insert(id.to_owned());
    }

    /// Makes the next `times` calls of `operation` fail with throttling.
    pub fn throttle(&self, operation: &'static str, times: u32) {
        self.state().throttled.insert(operation, times);
    }

    /// Returns the current snapshot of `id`.
    #[must_use]
    pub fn volume(&self, id: &str) -> Option<Volume> {
        self.state().volumes.get(id).cloned()
    }

    /// Returns recorded calls such as `attach vol-1 /dev/xvdf i-1`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }
}

impl VolumeApi for FakeVolumeApi {
    fn describe_volumes<'a>(&'a self, filter: &'a VolumeFilter) -> ApiFuture<'a, Vec<Volume>> {
        let result = {
            let mut state = self.state();
            state.calls.push(format!("describe {filter:?}"));
            state.take_throttle("describe-volumes").and_then(|()| match filter {
                VolumeFilter::Available { pool, zone } => Ok(state
                    .volumes
                    .values()
                    .filter(|volume| {
                        volume.state == "available"
                            && volume.zone == *zone
                            && volume.tags.get(POOL_TAG) == Some(pool)
                    })
                    .cloned()
                    .collect()),
                VolumeFilter::Ids(ids) => ids
                    .iter()
                    .map(|id| {
                        state
                            .volumes
                            .get(id)
                            .cloned()
                            .ok_or_else(|| {
                                api_error(
                                    "describe-volumes",
                                    "InvalidVolume.NotFound",
                                    &format!("The volume '{id}' does not exist."),
                                )
                            })
                    })
                    .collect(),
                VolumeFilter::AttachedTo { instance_id, pool } => Ok(state
                    .volumes
                    .values()
                    .filter(|volume| {
                        volume
                            .attachment
                            .as_ref()
                            .is_some_and(|att| att.instance_id == *instance_id)
                            && volume.tags.get(POOL_TAG) == Some(pool)
                    })
                    .cloned()
                    .collect()),
            })
        };
        Box::pin(async move { result })
    }

    fn create_volume<'a>(&'a self, request: &'a NewVolume) -> ApiFuture<'a, Volume> {
        let result = {
            let mut state = self.state();
            state.calls.push(format!("create {}", request.zone));
            state.take_throttle("create-volume").map(|()| {
                state.created += 1;
                let volume = Volume {
                    id: format!("vol-new-{}", state.created),
                    state: String::from("available"),
                    zone: request.zone.clone(),
                    attachment: None,
                    tags: TagSet::new(),
                };
                state.volumes.insert(volume.id.clone(), volume.clone());
                volume
            })
        };
        Box::pin(async move { result })
    }

    fn attach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        device: &'a str,
        instance_id: &'a str,
    ) -> ApiFuture<'a, ()> {
        let result = {
            let mut state = self.state();
            state
                .calls
                .push(format!("attach {volume_id} {device} {instance_id}"));
            let contested = state.contested.contains(volume_id);
            let materialise = state.materialise_devices;
            state.take_throttle("attach-volume").and_then(|()| {
                let volume = state.volume_mut("attach-volume", volume_id)?;
                if contested || volume.attachment.is_some() {
                    return Err(api_error(
                        "attach-volume",
                        "VolumeInUse",
                        &format!("{volume_id} is already attached to an instance"),
                    ));
                }
                volume.state = String::from("in-use");
                volume.attachment = Some(Attachment {
                    device: device.to_owned(),
                    instance_id: instance_id.to_owned(),
                    state: String::from("attached"),
                });
                if materialise {
                    std::fs::File::create(device).map_err(|err| {
                        api_error("attach-volume", "DeviceCreate", &err.to_string())
                    })?;
                }
                Ok(())
            })
        };
        Box::pin(async move { result })
    }

    fn detach_volume<'a>(&'a self, volume_id: &'a str) -> ApiFuture<'a, ()> {
        let result = {
            let mut state = self.state();
            state.calls.push(format!("detach {volume_id}"));
            let materialise = state.materialise_devices;
            state.take_throttle("detach-volume").and_then(|()| {
                let volume = state.volume_mut("detach-volume", volume_id)?;
                volume.state = String::from("available");
                if let Some(attachment) = volume.attachment.take()
                    && materialise
                {
                    std::fs::remove_file(&attachment.device).ok();
                }
                Ok(())
            })
        };
        Box::pin(async move { result })
    }

    fn create_tags<'a>(&'a self, volume_id: &'a str, tags: &'a TagSet) -> ApiFuture<'a, ()> {
        let result = {
            let mut state = self.state();
            let rendered = tags
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(",");
            state.calls.push(format!("tag {volume_id} {rendered}"));
            let limited = state.tag_limited.contains(volume_id);
            state.take_throttle("create-tags").and_then(|()| {
                let volume = state.volume_mut("create-tags", volume_id)?;
                if limited {
                    return Err(api_error(
                        "create-tags",
                        "TagLimitExceeded",
                        "The maximum number of tags has been reached.",
                    ));
                }
                volume.tags.extend(tags.clone());
                Ok(())
            })
        };
        Box::pin(async move { result })
    }
}
