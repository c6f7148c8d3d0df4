//! Capability-scoped helpers for touching host paths.
//!
//! Every helper opens the parent directory with ambient authority and then
//! operates on the final path component relative to it.

use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs_utf8::{Dir, OpenOptions, Permissions};
use cap_std::ambient_authority;
use thiserror::Error;

/// Error raised when a host path cannot be read or written.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{path}: {message}")]
pub struct HostFsError {
    /// Path being accessed.
    pub path: Utf8PathBuf,
    /// Operating system error message.
    pub message: String,
    /// Error kind reported by the operating system.
    pub kind: io::ErrorKind,
}

impl HostFsError {
    fn new(path: &Utf8Path, err: &io::Error) -> Self {
        Self {
            path: path.to_path_buf(),
            message: err.to_string(),
            kind: err.kind(),
        }
    }
}

/// Splits `path` into its parent directory and final component.
fn split(path: &Utf8Path) -> Result<(&Utf8Path, &str), HostFsError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| HostFsError {
        path: path.to_path_buf(),
        message: String::from("path is missing a final component"),
        kind: io::ErrorKind::InvalidInput,
    })?;
    Ok((parent, file_name))
}

/// Opens the parent directory of `path`, returning it with the file name.
///
/// # Errors
///
/// Returns [`HostFsError`] when the parent cannot be opened.
pub fn open_parent(path: &Utf8Path) -> Result<(Dir, &str), HostFsError> {
    let (parent, file_name) = split(path)?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| HostFsError::new(parent, &err))?;
    Ok((dir, file_name))
}

/// Returns `true` when `path` exists. A missing parent counts as absent.
///
/// # Errors
///
/// Returns [`HostFsError`] when the parent exists but cannot be inspected.
pub fn path_exists(path: &Utf8Path) -> Result<bool, HostFsError> {
    match open_parent(path) {
        Ok((dir, file_name)) => dir
            .try_exists(file_name)
            .map_err(|err| HostFsError::new(path, &err)),
        Err(err) if err.kind == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Reads `path` to a string.
///
/// # Errors
///
/// Returns [`HostFsError`] when the file cannot be read.
pub fn read_to_string(path: &Utf8Path) -> Result<String, HostFsError> {
    let (dir, file_name) = open_parent(path)?;
    dir.read_to_string(file_name)
        .map_err(|err| HostFsError::new(path, &err))
}

/// Appends `line` and a newline to `path`, creating the file when absent.
///
/// # Errors
///
/// Returns [`HostFsError`] when the file cannot be opened or written.
pub fn append_line(path: &Utf8Path, line: &str) -> Result<(), HostFsError> {
    let (dir, file_name) = open_parent(path)?;
    let mut options = OpenOptions::new();
    options.append(true).create(true);
    let mut file = dir
        .open_with(file_name, &options)
        .map_err(|err| HostFsError::new(path, &err))?;
    writeln!(file, "{line}").map_err(|err| HostFsError::new(path, &err))
}

/// Sets the Unix permission bits of `path` to `mode`.
///
/// # Errors
///
/// Returns [`HostFsError`] when the permissions cannot be changed.
pub fn set_mode(path: &Utf8Path, mode: u32) -> Result<(), HostFsError> {
    let (dir, file_name) = open_parent(path)?;
    let permissions = Permissions::from_std(std::fs::Permissions::from_mode(mode));
    dir.set_permissions(file_name, permissions)
        .map_err(|err| HostFsError::new(path, &err))
}
