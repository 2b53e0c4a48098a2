//! Boot entries: one (architecture, kernel version) pair and its files.
//!
//! A boot entry is never persisted; the boot directory is the source of
//! truth and entries are re-derived from file names on every enumeration.
//! All paths are pure functions of (arch, verstr, location).

mod writer;

pub use writer::{BootDirGuard, BootDirWriter, MountControl, SystemMount};

use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::PathBuf;

use crate::error::{Error, IoResultExt, Result};
use crate::layout::FsLayout;
use crate::version::KernelVersion;

const KERNEL_PREFIX: &str = "kernel-";

/// Which boot directory an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootLocation {
    Primary,
    History,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BootEntry {
    arch: String,
    verstr: String,
    location: BootLocation,
    layout: FsLayout,
}

impl BootEntry {
    pub fn new(
        layout: &FsLayout,
        arch: impl Into<String>,
        verstr: impl Into<String>,
        location: BootLocation,
    ) -> Self {
        Self {
            arch: arch.into(),
            verstr: verstr.into(),
            location,
            layout: layout.clone(),
        }
    }

    /// Parse `x86_64-3.9.11-gentoo-r1` into arch `x86_64` and verstr `3.9.11-gentoo-r1`.
    pub fn from_postfix(layout: &FsLayout, postfix: &str, location: BootLocation) -> Result<Self> {
        match postfix.split_once('-') {
            Some((arch, verstr)) if !arch.is_empty() && !verstr.is_empty() => {
                Ok(Self::new(layout, arch, verstr, location))
            }
            _ => Err(Error::config(format!(
                "invalid boot entry name \"{}\"",
                postfix
            ))),
        }
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    /// e.g. `3.9.11-gentoo-r1`
    pub fn verstr(&self) -> &str {
        &self.verstr
    }

    /// e.g. `3.9.11`
    pub fn ver(&self) -> &str {
        self.verstr
            .split_once('-')
            .map(|(v, _)| v)
            .unwrap_or(&self.verstr)
    }

    pub fn version(&self) -> Option<KernelVersion> {
        self.verstr.parse().ok()
    }

    pub fn location(&self) -> BootLocation {
        self.location
    }

    pub fn is_historical(&self) -> bool {
        self.location == BootLocation::History
    }

    pub fn layout(&self) -> &FsLayout {
        &self.layout
    }

    /// e.g. `x86_64-3.9.11-gentoo-r1`
    pub fn postfix(&self) -> String {
        format!("{}-{}", self.arch, self.verstr)
    }

    pub fn boot_dir(&self) -> PathBuf {
        match self.location {
            BootLocation::Primary => self.layout.boot_dir(),
            BootLocation::History => self.layout.boot_history_dir(),
        }
    }

    pub fn kernel_filename(&self) -> String {
        format!("kernel-{}", self.postfix())
    }

    pub fn kernel_filepath(&self) -> PathBuf {
        self.boot_dir().join(self.kernel_filename())
    }

    pub fn kernel_config_filename(&self) -> String {
        format!("config-{}", self.postfix())
    }

    pub fn kernel_config_filepath(&self) -> PathBuf {
        self.boot_dir().join(self.kernel_config_filename())
    }

    pub fn kernel_config_rules_filename(&self) -> String {
        format!("config-{}.rules", self.postfix())
    }

    pub fn kernel_config_rules_filepath(&self) -> PathBuf {
        self.boot_dir().join(self.kernel_config_rules_filename())
    }

    pub fn kernel_modules_dirpath(&self) -> PathBuf {
        self.layout.kernel_modules_dir(&self.verstr)
    }

    pub fn firmware_dirpath(&self) -> PathBuf {
        self.layout.firmware_dir()
    }

    pub fn initrd_filename(&self) -> String {
        format!("initramfs-{}", self.postfix())
    }

    pub fn initrd_filepath(&self) -> PathBuf {
        self.boot_dir().join(self.initrd_filename())
    }

    pub fn initrd_tar_filename(&self) -> String {
        format!("initramfs-files-{}.tar.bz2", self.postfix())
    }

    pub fn initrd_tar_filepath(&self) -> PathBuf {
        self.boot_dir().join(self.initrd_tar_filename())
    }

    /// Files in the boot directory that belong to this entry.
    pub fn boot_filepaths(&self) -> Vec<PathBuf> {
        vec![
            self.kernel_filepath(),
            self.kernel_config_filepath(),
            self.kernel_config_rules_filepath(),
            self.initrd_filepath(),
            self.initrd_tar_filepath(),
        ]
    }

    /// Kernel image, config, config rules, module directory and the shared
    /// firmware directory all exist.
    pub fn has_kernel_files(&self) -> bool {
        self.kernel_filepath().exists()
            && self.kernel_config_filepath().exists()
            && self.kernel_config_rules_filepath().exists()
            && self.kernel_modules_dirpath().exists()
            && self.firmware_dirpath().exists()
    }

    pub fn has_initrd_files(&self) -> bool {
        self.initrd_filepath().exists() && self.initrd_tar_filepath().exists()
    }

    pub fn is_complete(&self) -> bool {
        self.has_kernel_files() && self.has_initrd_files()
    }
}

impl fmt::Display for BootEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.postfix())?;
        if self.is_historical() {
            f.write_str(" (history)")?;
        }
        Ok(())
    }
}

/// Newest first: version-aware on the kernel version, falling back to plain
/// string comparison for names that do not parse.
fn compare_newest_first(a: &BootEntry, b: &BootEntry) -> Ordering {
    match (a.version(), b.version()) {
        (Some(va), Some(vb)) => vb
            .cmp(&va)
            .then_with(|| b.verstr.cmp(&a.verstr))
            .then_with(|| b.arch.cmp(&a.arch)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.postfix().cmp(&a.postfix()),
    }
}

/// Every `kernel-*` file of a boot directory as a boot entry, newest first.
///
/// History entries are only returned when complete for both kernel and
/// initramfs, since they are never repaired in place.
pub fn enumerate(layout: &FsLayout, location: BootLocation) -> Result<Vec<BootEntry>> {
    let dir = match location {
        BootLocation::Primary => layout.boot_dir(),
        BootLocation::History => layout.boot_history_dir(),
    };
    if location == BootLocation::History && !dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for item in fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
        let item = item.with_context(|| format!("reading {}", dir.display()))?;
        let name = item.file_name();
        let name = name.to_string_lossy();
        let Some(postfix) = name.strip_prefix(KERNEL_PREFIX) else {
            continue;
        };
        let entry = match BootEntry::from_postfix(layout, postfix, location) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("skipping {}: {}", name, e);
                continue;
            }
        };
        if location == BootLocation::History && !entry.is_complete() {
            continue;
        }
        entries.push(entry);
    }

    entries.sort_by(compare_newest_first);
    Ok(entries)
}

pub fn newest(layout: &FsLayout) -> Result<Option<BootEntry>> {
    Ok(enumerate(layout, BootLocation::Primary)?.into_iter().next())
}

/// Kernel version directories under the module root.
pub fn installed_module_versions(layout: &FsLayout) -> Result<Vec<String>> {
    let root = layout.kernel_modules_root();
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for item in fs::read_dir(&root).with_context(|| format!("reading {}", root.display()))? {
        let item = item?;
        out.push(item.file_name().to_string_lossy().into_owned());
    }
    out.sort();
    Ok(out)
}
