//! Description of the host whose boot files are managed.
//!
//! Loaded from a TOML file:
//!
//! ```toml
//! arch = "native"
//! boot_mode = "efi"
//!
//! [[mount_points]]
//! role = "root"
//! path = "/"
//! fs = "btrfs"
//! device = "0a3c..."
//! [mount_points.disk]
//! type = "nvme"
//! uuid = "0a3c..."
//!
//! [[mount_points]]
//! role = "boot"
//! path = "/boot"
//! fs = "vfat"
//! options = "ro"
//! device = "/dev/nvme0n1p1"
//! [mount_points.disk]
//! type = "partition"
//! scheme = "gpt"
//! uuid = "5D1F-2A3B"
//!
//! [[aux_os]]
//! name = "Windows"
//! partition_uuid = "8E2C-11F0"
//! chainloader = 1
//! ```

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};
use crate::topology::{probe, DiskDescription, DiskTopology, FsKind, MountPoint, MountRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootMode {
    Efi,
    Bios,
}

impl BootMode {
    pub fn native(sysfs_root: &Path) -> Self {
        if probe::is_efi(sysfs_root) {
            BootMode::Efi
        } else {
            BootMode::Bios
        }
    }
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootMode::Efi => f.write_str("efi"),
            BootMode::Bios => f.write_str("bios"),
        }
    }
}

/// Another operating system chainloaded from the boot menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxOs {
    pub name: String,
    pub partition_uuid: String,
    #[serde(rename = "chainloader")]
    pub chainloader_number: u32,
}

#[derive(Debug, Clone)]
pub struct HostInfo {
    pub arch: String,
    pub boot_mode: BootMode,
    /// Root mount first, then boot (EFI), then the rest in mount order.
    pub mount_points: Vec<MountPoint>,
    pub topology: DiskTopology,
    pub aux_os: Vec<AuxOs>,
    pub aux_kernel_init_cmdline: String,
    /// Disk whose boot sector receives GRUB in BIOS mode.
    pub boot_disk: Option<PathBuf>,
}

impl HostInfo {
    /// Check the mount point invariants.
    pub fn validate(&self) -> Result<()> {
        let first = self
            .mount_points
            .first()
            .ok_or_else(|| Error::config("no mount points specified"))?;
        if first.role != MountRole::Root || first.path != Path::new("/") {
            return Err(Error::config("first mount point must be the root mount \"/\""));
        }

        let roots = self.mount_points.iter().filter(|m| m.role == MountRole::Root).count();
        if roots != 1 {
            return Err(Error::config(format!("{} root mount points specified", roots)));
        }

        let boots: Vec<_> = self
            .mount_points
            .iter()
            .filter(|m| m.role == MountRole::Boot)
            .collect();
        match self.boot_mode {
            BootMode::Efi => {
                if boots.len() != 1 {
                    return Err(Error::config("EFI boot mode requires exactly one boot mount point"));
                }
                if boots[0].path != Path::new("/boot") {
                    return Err(Error::config("boot mount point must be \"/boot\""));
                }
            }
            BootMode::Bios => {
                if !boots.is_empty() {
                    return Err(Error::config("BIOS boot mode does not allow a boot mount point"));
                }
            }
        }

        let mut seen = HashSet::new();
        for mp in &self.mount_points {
            if !mp.path.is_absolute() {
                return Err(Error::config(format!(
                    "mount point {} is not absolute",
                    mp.path.display()
                )));
            }
            if !seen.insert(&mp.path) {
                return Err(Error::config(format!(
                    "mount point {} specified twice",
                    mp.path.display()
                )));
            }
            if !self.topology.contains(mp.disk) {
                return Err(Error::config(format!(
                    "mount point {} refers to a disk outside the topology",
                    mp.path.display()
                )));
            }
        }
        Ok(())
    }

    pub fn mount_point(&self, role: MountRole) -> Option<&MountPoint> {
        self.mount_points.iter().find(|m| m.role == role)
    }

    pub fn root_mount(&self) -> Result<&MountPoint> {
        self.mount_point(MountRole::Root)
            .ok_or_else(|| Error::config("no root mount point"))
    }

    pub fn boot_mount(&self) -> Option<&MountPoint> {
        self.mount_point(MountRole::Boot)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading host description {}", path.display()))?;
        let desc: HostDescription = toml::from_str(&text)?;
        desc.into_host_info(Path::new("/sys"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostDescription {
    #[serde(default = "native")]
    pub arch: String,
    #[serde(default = "native")]
    pub boot_mode: String,
    #[serde(default)]
    pub boot_disk: Option<PathBuf>,
    #[serde(default)]
    pub aux_kernel_init_cmdline: String,
    pub mount_points: Vec<MountPointDescription>,
    #[serde(default)]
    pub aux_os: Vec<AuxOs>,
}

fn native() -> String {
    "native".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountPointDescription {
    pub role: MountRole,
    pub path: PathBuf,
    pub fs: FsKind,
    #[serde(default)]
    pub options: String,
    /// Filesystem UUID, or a `/dev/...` path resolved with blkid.
    pub device: String,
    pub disk: DiskDescription,
}

impl HostDescription {
    pub fn into_host_info(self, sysfs_root: &Path) -> Result<HostInfo> {
        let arch = if self.arch == "native" {
            probe::native_arch().to_string()
        } else {
            self.arch
        };
        let boot_mode = match self.boot_mode.as_str() {
            "native" => BootMode::native(sysfs_root),
            "efi" => BootMode::Efi,
            "bios" => BootMode::Bios,
            other => return Err(Error::config(format!("invalid boot mode \"{}\"", other))),
        };

        let mut topology = DiskTopology::new();
        let mut mount_points = Vec::with_capacity(self.mount_points.len());
        for mp in self.mount_points {
            let disk = mp.disk.insert_into(&mut topology)?;
            let (device_uuid, device_path) = if mp.device.starts_with("/dev/") {
                let path = PathBuf::from(&mp.device);
                (probe::blkid_uuid(&path)?, Some(path))
            } else {
                (mp.device, None)
            };
            mount_points.push(MountPoint {
                role: mp.role,
                path: mp.path,
                fs: mp.fs,
                options: mp.options,
                device_uuid,
                device_path,
                disk,
            });
        }

        let info = HostInfo {
            arch,
            boot_mode,
            mount_points,
            topology,
            aux_os: self.aux_os,
            aux_kernel_init_cmdline: self.aux_kernel_init_cmdline,
            boot_disk: self.boot_disk,
        };
        info.validate()?;
        Ok(info)
    }
}
