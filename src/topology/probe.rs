//! Discovery helpers that touch the live system.
//!
//! These are kept apart from the value types: they answer one question
//! each and the caller feeds the answers into [`super::DiskTopology`] and
//! [`super::MountPoint`].

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, IoResultExt, Result};
use crate::process::Cmd;

/// Whether the system was booted through UEFI firmware.
pub fn is_efi(sysfs_root: &Path) -> bool {
    sysfs_root.join("firmware/efi").exists()
}

/// Architecture name used in boot entry names (e.g. `x86_64`).
pub fn native_arch() -> &'static str {
    std::env::consts::ARCH
}

/// Filesystem UUID of a block device (`UUID=`, not `PARTUUID=`).
pub fn blkid_uuid(dev_path: &Path) -> Result<String> {
    let result = Cmd::new("blkid")
        .args(["-s", "UUID", "-o", "value"])
        .arg_path(dev_path)
        .error_msg("blkid failed. Install: util-linux")
        .run()?;
    let uuid = result.stdout.trim();
    if uuid.is_empty() {
        return Err(Error::config(format!(
            "block device {} has no filesystem UUID",
            dev_path.display()
        )));
    }
    Ok(uuid.to_string())
}

/// Driver name of the SCSI host controller a disk hangs off (e.g. `ahci`).
///
/// `/sys/block/sda` resolves to something like
/// `/sys/devices/pci0000:00/0000:00:17.0/ata3/host2/target2:0:0/2:0:0:0/block/sda`;
/// the nearest `hostN` ancestor names the controller in
/// `/sys/class/scsi_host/hostN/proc_name`.
pub fn scsi_host_controller_name(sysfs_root: &Path, dev_path: &Path) -> Result<String> {
    let dev_name = fs::canonicalize(dev_path)
        .with_context(|| format!("resolving {}", dev_path.display()))?
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::config(format!("invalid device path {}", dev_path.display())))?;

    let block = sysfs_root.join("block").join(&dev_name);
    let mut cursor: PathBuf = fs::canonicalize(&block)
        .with_context(|| format!("resolving {}", block.display()))?;

    loop {
        if let Some(host) = cursor
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| is_scsi_host_name(n))
        {
            let proc_name = sysfs_root
                .join("class/scsi_host")
                .join(&host)
                .join("proc_name");
            let name = fs::read_to_string(&proc_name)
                .with_context(|| format!("reading {}", proc_name.display()))?;
            return Ok(name.trim().to_string());
        }
        if !cursor.pop() {
            return Err(Error::config(format!(
                "{} is not attached to a SCSI host",
                dev_path.display()
            )));
        }
    }
}

fn is_scsi_host_name(name: &str) -> bool {
    name.strip_prefix("host")
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn efi_detection() {
        let temp = TempDir::new().unwrap();
        assert!(!is_efi(temp.path()));
        fs::create_dir_all(temp.path().join("firmware/efi")).unwrap();
        assert!(is_efi(temp.path()));
    }

    #[test]
    fn host_name_pattern() {
        assert!(is_scsi_host_name("host2"));
        assert!(!is_scsi_host_name("host"));
        assert!(!is_scsi_host_name("target2:0:0"));
    }

    #[test]
    fn controller_name_from_fake_sysfs() {
        let temp = TempDir::new().unwrap();
        let sys = temp.path().join("sys");
        let dev_dir = sys.join("devices/pci0000:00/ata3/host2/target2:0:0/2:0:0:0/block/sda");
        fs::create_dir_all(&dev_dir).unwrap();
        fs::create_dir_all(sys.join("block")).unwrap();
        symlink(&dev_dir, sys.join("block/sda")).unwrap();
        fs::create_dir_all(sys.join("class/scsi_host/host2")).unwrap();
        fs::write(sys.join("class/scsi_host/host2/proc_name"), "ahci\n").unwrap();

        let dev = temp.path().join("dev/sda");
        fs::create_dir_all(dev.parent().unwrap()).unwrap();
        fs::write(&dev, "").unwrap();

        assert_eq!(scsi_host_controller_name(&sys, &dev).unwrap(), "ahci");
    }
}
