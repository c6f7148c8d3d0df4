//! Snapshot of the host mount table.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};

use crate::hostfs::{self, HostFsError};

/// Default location of the kernel mount table.
pub const DEFAULT_MOUNT_TABLE: &str = "/proc/self/mounts";

/// Device-to-mountpoint mapping read once at the start of a run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MountTable {
    entries: BTreeMap<String, Utf8PathBuf>,
}

impl MountTable {
    /// Reads and parses the mount table at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`HostFsError`] when the file cannot be read.
    pub fn load(path: &Utf8Path) -> Result<Self, HostFsError> {
        hostfs::read_to_string(path).map(|contents| Self::parse(&contents))
    }

    /// Parses `/proc/mounts`-formatted text. Malformed lines are skipped and
    /// the first mountpoint seen for a device wins.
    #[must_use]
    pub fn parse(contents: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            let (Some(device), Some(mountpoint)) = (fields.next(), fields.next()) else {
                continue;
            };
            entries
                .entry(unescape(device))
                .or_insert_with(|| Utf8PathBuf::from(unescape(mountpoint)));
        }
        Self { entries }
    }

    /// Mountpoint of `device`, if mounted.
    #[must_use]
    pub fn mountpoint(&self, device: &str) -> Option<&Utf8Path> {
        self.entries.get(device).map(Utf8PathBuf::as_path)
    }

    /// Returns `true` when `device` is mounted anywhere.
    #[must_use]
    pub fn is_mounted(&self, device: &str) -> bool {
        self.entries.contains_key(device)
    }

    /// Records a mount made during this run.
    pub fn record(&mut self, device: &str, mountpoint: &Utf8Path) {
        self.entries
            .insert(device.to_owned(), mountpoint.to_path_buf());
    }
}

/// Maps a provider device name to the name the kernel exposes
/// (`/dev/sdf` becomes `/dev/xvdf`).
#[must_use]
pub fn kernel_device_name(device: &str) -> String {
    device.strip_prefix("/dev/sd").map_or_else(
        || device.to_owned(),
        |suffix| format!("/dev/xvd{suffix}"),
    )
}

/// Decodes the octal escapes (`\040` and friends) the kernel uses for
/// whitespace in mount table fields.
fn unescape(field: &str) -> String {
    let mut decoded = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            decoded.push(ch);
            continue;
        }
        let digits = chars.clone().take(3).collect::<String>();
        match u8::from_str_radix(&digits, 8) {
            Ok(byte) if digits.len() == 3 => {
                decoded.push(char::from(byte));
                chars.nth(2);
            }
            _ => decoded.push(ch),
        }
    }
    decoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const TABLE: &str = "\
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/xvda1 / ext4 rw,relatime 0 0
/dev/xvdf /ebs0 ext4 rw,noatime 0 0
/dev/xvdg /mnt/with\\040space xfs rw 0 0
garbage
";

    #[rstest]
    fn parses_devices_and_mountpoints() {
        let table = MountTable::parse(TABLE);
        assert_eq!(table.mountpoint("/dev/xvdf"), Some(Utf8Path::new("/ebs0")));
        assert!(table.is_mounted("/dev/xvda1"));
        assert!(!table.is_mounted("/dev/xvdh"));
    }

    #[rstest]
    fn decodes_octal_escapes() {
        let table = MountTable::parse(TABLE);
        assert_eq!(
            table.mountpoint("/dev/xvdg"),
            Some(Utf8Path::new("/mnt/with space"))
        );
    }

    #[rstest]
    #[case("/dev/sdf", "/dev/xvdf")]
    #[case("/dev/xvdg", "/dev/xvdg")]
    #[case("/dev/nvme1n1", "/dev/nvme1n1")]
    fn maps_provider_names_to_kernel_names(#[case] device: &str, #[case] expected: &str) {
        assert_eq!(kernel_device_name(device), expected);
    }

    #[rstest]
    fn recorded_mounts_are_visible() {
        let mut table = MountTable::default();
        table.record("/dev/xvdh", Utf8Path::new("/ebs2"));
        assert_eq!(table.mountpoint("/dev/xvdh"), Some(Utf8Path::new("/ebs2")));
    }
}
