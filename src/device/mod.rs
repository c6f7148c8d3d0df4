//! Block-device path allocation.
//!
//! Device paths follow the `/dev/xvd<letter>` convention. Allocation walks
//! the trailing letter forwards and stops at `z`.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::hostfs::path_exists;

/// Errors raised while allocating device paths or mountpoints.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AllocationError {
    /// The path does not end in a lowercase letter.
    #[error("device path {path} does not end in a lowercase letter")]
    InvalidDevice {
        /// Offending path.
        path: String,
    },
    /// Every candidate after the starting point is already taken.
    #[error("no free {kind} after {start}")]
    Exhausted {
        /// What was being allocated (`device` or `mountpoint`).
        kind: &'static str,
        /// Path allocation started from.
        start: String,
    },
    /// Probing or creating a path failed.
    #[error("failed to prepare {path}: {message}")]
    Io {
        /// Path being probed or created.
        path: String,
        /// Operating system error message.
        message: String,
    },
}

/// Hands out device paths in strictly increasing order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceNamer {
    current: Utf8PathBuf,
}

impl DeviceNamer {
    /// Starts allocation at the first free path at or after `seed`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError`] when `seed` is malformed or every letter up
    /// to `z` is taken.
    pub fn starting_at(seed: &Utf8Path) -> Result<Self, AllocationError> {
        let (stem, letter) = split_device(seed)?;
        let current = first_free(stem, letter, seed)?;
        Ok(Self { current })
    }

    /// Device path to use for the next attach.
    #[must_use]
    pub fn current(&self) -> &Utf8Path {
        &self.current
    }

    /// Moves to the first free path strictly after the current one.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::Exhausted`] when the current path already
    /// ends in `z` or every later letter is taken.
    pub fn advance(&mut self) -> Result<&Utf8Path, AllocationError> {
        let (stem, letter) = split_device(&self.current)?;
        let exhausted = || AllocationError::Exhausted {
            kind: "device",
            start: self.current.to_string(),
        };
        let next_letter = char::from_u32(u32::from(letter) + 1)
            .filter(char::is_ascii_lowercase)
            .ok_or_else(exhausted)?;
        self.current = first_free(stem, next_letter, &self.current)?;
        Ok(&self.current)
    }
}

fn split_device(path: &Utf8Path) -> Result<(&str, char), AllocationError> {
    let text = path.as_str();
    text.chars()
        .last()
        .filter(char::is_ascii_lowercase)
        .and_then(|letter| text.strip_suffix(letter).map(|stem| (stem, letter)))
        .ok_or_else(|| AllocationError::InvalidDevice {
            path: text.to_owned(),
        })
}

fn first_free(stem: &str, from: char, start: &Utf8Path) -> Result<Utf8PathBuf, AllocationError> {
    for letter in from..='z' {
        let candidate = Utf8PathBuf::from(format!("{stem}{letter}"));
        let taken = path_exists(&candidate).map_err(|err| AllocationError::Io {
            path: candidate.to_string(),
            message: err.message,
        })?;
        if !taken {
            return Ok(candidate);
        }
    }
    Err(AllocationError::Exhausted {
        kind: "device",
        start: start.to_string(),
    })
}
