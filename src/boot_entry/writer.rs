//! Scoped read-write access to the boot directory.
//!
//! Distributions often mount `/boot` read-only. Every mutation of the boot
//! directory runs inside a [`BootDirGuard`]; nested guards share a single
//! remount and the directory goes back to read-only when the outermost
//! guard drops, including on error paths.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{IoResultExt, Result};
use crate::process::Cmd;

/// Mount state queries and remounts for one mount point.
pub trait MountControl {
    /// `true` when `mount_point` is a mount point currently mounted `ro`.
    fn is_read_only(&self, mount_point: &Path) -> Result<bool>;

    fn remount(&self, mount_point: &Path, read_write: bool) -> Result<()>;
}

/// [`MountControl`] backed by `/proc/self/mounts` and `mount(8)`.
#[derive(Debug, Clone)]
pub struct SystemMount {
    mounts_file: PathBuf,
}

impl Default for SystemMount {
    fn default() -> Self {
        Self {
            mounts_file: PathBuf::from("/proc/self/mounts"),
        }
    }
}

impl SystemMount {
    pub fn with_mounts_file(mounts_file: impl Into<PathBuf>) -> Self {
        Self {
            mounts_file: mounts_file.into(),
        }
    }
}

/// Options of the last entry for `mount_point` in a mounts table.
fn mount_options<'a>(table: &'a str, mount_point: &Path) -> Option<&'a str> {
    let target = mount_point.to_string_lossy();
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _dev = fields.next()?;
            let dir = fields.next()?;
            let _fstype = fields.next()?;
            let opts = fields.next()?;
            (dir.replace("\\040", " ") == target).then_some(opts)
        })
        .last()
}

impl MountControl for SystemMount {
    fn is_read_only(&self, mount_point: &Path) -> Result<bool> {
        let table = fs::read_to_string(&self.mounts_file)
            .with_context(|| format!("reading {}", self.mounts_file.display()))?;
        Ok(mount_options(&table, mount_point)
            .map(|opts| opts.split(',').any(|o| o == "ro"))
            .unwrap_or(false))
    }

    fn remount(&self, mount_point: &Path, read_write: bool) -> Result<()> {
        let mode = if read_write { "rw,remount" } else { "ro,remount" };
        Cmd::new("mount")
            .args(["-o", mode])
            .arg_path(mount_point)
            .error_msg(format!("failed to remount {}", mount_point.display()))
            .run()?;
        Ok(())
    }
}

/// Reference-counted remount state for the boot directory.
pub struct BootDirWriter<M: MountControl = SystemMount> {
    boot_dir: PathBuf,
    enabled: bool,
    control: M,
    depth: Cell<usize>,
    remounted: Cell<bool>,
}

impl BootDirWriter<SystemMount> {
    pub fn new(boot_dir: impl Into<PathBuf>, remount_boot_rw: bool) -> Self {
        Self::with_control(boot_dir, remount_boot_rw, SystemMount::default())
    }
}

impl<M: MountControl> BootDirWriter<M> {
    pub fn with_control(boot_dir: impl Into<PathBuf>, remount_boot_rw: bool, control: M) -> Self {
        Self {
            boot_dir: boot_dir.into(),
            enabled: remount_boot_rw,
            control,
            depth: Cell::new(0),
            remounted: Cell::new(false),
        }
    }

    pub fn control(&self) -> &M {
        &self.control
    }

    /// Make the boot directory writable until the returned guard drops.
    pub fn acquire(&self) -> Result<BootDirGuard<'_, M>> {
        if self.depth.get() == 0
            && self.enabled
            && self.control.is_read_only(&self.boot_dir)?
        {
            tracing::info!("remounting {} read-write", self.boot_dir.display());
            self.control.remount(&self.boot_dir, true)?;
            self.remounted.set(true);
        }
        self.depth.set(self.depth.get() + 1);
        Ok(BootDirGuard { writer: self })
    }

    /// Number of live guards.
    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    fn release(&self) {
        let depth = self.depth.get().saturating_sub(1);
        self.depth.set(depth);
        if depth == 0 && self.remounted.replace(false) {
            tracing::info!("remounting {} read-only", self.boot_dir.display());
            if let Err(e) = self.control.remount(&self.boot_dir, false) {
                tracing::error!("{}", e);
            }
        }
    }
}

#[must_use = "the boot directory is only writable while the guard is alive"]
pub struct BootDirGuard<'a, M: MountControl = SystemMount> {
    writer: &'a BootDirWriter<M>,
}

impl<M: MountControl> Drop for BootDirGuard<'_, M> {
    fn drop(&mut self) {
        self.writer.release();
    }
}
