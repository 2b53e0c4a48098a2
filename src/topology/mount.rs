use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::DiskId;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountRole {
    Root,
    Boot,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsKind {
    #[serde(alias = "fat32")]
    Vfat,
    Ext4,
    Btrfs,
    Bcachefs,
}

impl FsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsKind::Vfat => "vfat",
            FsKind::Ext4 => "ext4",
            FsKind::Btrfs => "btrfs",
            FsKind::Bcachefs => "bcachefs",
        }
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FsKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vfat" | "fat32" => Ok(FsKind::Vfat),
            "ext4" => Ok(FsKind::Ext4),
            "btrfs" => Ok(FsKind::Btrfs),
            "bcachefs" => Ok(FsKind::Bcachefs),
            other => Err(Error::config(format!("unsupported filesystem \"{}\"", other))),
        }
    }
}

/// One mount point of the target system together with its storage stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub role: MountRole,
    /// Absolute mount path, `/` for the root mount.
    pub path: PathBuf,
    pub fs: FsKind,
    pub options: String,
    /// Filesystem UUID (not the partition UUID).
    pub device_uuid: String,
    /// Device node, when the mount was discovered from a live device.
    pub device_path: Option<PathBuf>,
    /// Top of the disk stack feeding this mount.
    pub disk: DiskId,
}

impl MountPoint {
    /// Mount target inside the initramfs, relative to its working directory.
    pub fn sysroot_target(&self) -> String {
        if self.path == PathBuf::from("/") {
            "./sysroot".to_string()
        } else {
            format!("./sysroot{}", self.path.display())
        }
    }
}
