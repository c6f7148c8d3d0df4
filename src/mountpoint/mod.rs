//! Numbered mountpoint directories (`/ebs0`, `/ebs1`, ...) and the stable
//! `/ebs -> ebs0` symlink.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::device::AllocationError;
use crate::hostfs::{HostFsError, open_parent};

/// Highest index probed before allocation gives up.
pub const MAX_MOUNTPOINTS: u32 = 256;

fn io_error(err: HostFsError) -> AllocationError {
    AllocationError::Io {
        path: err.path.into_string(),
        message: err.message,
    }
}

/// Allocates the lowest free `<base><index>` directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountAllocator {
    base: Utf8PathBuf,
    seed: u32,
}

impl MountAllocator {
    /// Creates an allocator for `base` starting at index 0.
    #[must_use]
    pub fn new(base: impl Into<Utf8PathBuf>) -> Self {
        Self {
            base: base.into(),
            seed: 0,
        }
    }

    /// Starts probing at `seed` instead of 0.
    #[must_use]
    pub const fn with_seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    /// Base path the numbered directories hang off.
    #[must_use]
    pub fn base(&self) -> &Utf8Path {
        &self.base
    }

    /// Creates and returns the first free numbered directory.
    ///
    /// Index 0 additionally gets the `<base>` symlink pointing at it; an
    /// existing link is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::Exhausted`] when every index up to
    /// [`MAX_MOUNTPOINTS`] is taken, or [`AllocationError::Io`] when the
    /// parent directory cannot be inspected or written.
    pub fn allocate(&self) -> Result<Utf8PathBuf, AllocationError> {
        let (dir, stem) = open_parent(&self.base).map_err(io_error)?;
        for index in self.seed..MAX_MOUNTPOINTS {
            let name = format!("{stem}{index}");
            let taken = dir.try_exists(&name).map_err(|err| AllocationError::Io {
                path: name.clone(),
                message: err.to_string(),
            })?;
            if taken {
                continue;
            }

            let path = self.base.with_file_name(&name);
            dir.create_dir(&name).map_err(|err| AllocationError::Io {
                path: path.to_string(),
                message: err.to_string(),
            })?;

            if index == 0 {
                match dir.symlink(&name, stem) {
                    Ok(()) => debug!(link = %self.base, target = %name, "created mountpoint link"),
                    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(err) => {
                        return Err(AllocationError::Io {
                            path: self.base.to_string(),
                            message: err.to_string(),
                        });
                    }
                }
            }

            debug!(mountpoint = %path, "allocated mountpoint");
            return Ok(path);
        }

        Err(AllocationError::Exhausted {
            kind: "mountpoint",
            start: format!("{}{}", self.base, self.seed),
        })
    }
}
