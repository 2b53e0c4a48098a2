//! Consistency checks and cleanup of stale boot files.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::artifact::filesystem::remove_path;
use crate::boot_entry::{installed_module_versions, BootEntry};
use crate::bootloader::BootloaderState;
use crate::error::{IoResultExt, Result};
use crate::layout::FsLayout;
use crate::modules::{FirmwareSource, STANDARD_FIRMWARE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckIssue {
    BootloaderNotInstalled,
    BootloaderInvalid,
    NoPendingEntry,
    /// The installed menu boots something other than the pending entry.
    RebootRequired {
        current: Option<String>,
        pending: String,
    },
}

impl fmt::Display for CheckIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckIssue::BootloaderNotInstalled => f.write_str("Boot-loader is not installed."),
            CheckIssue::BootloaderInvalid => f.write_str("Boot-loader is invalid."),
            CheckIssue::NoPendingEntry => f.write_str("No pending boot entry."),
            CheckIssue::RebootRequired { current, pending } => write!(
                f,
                "Current boot entry ({}) and pending boot entry ({}) are different, reboot needed.",
                current.as_deref().unwrap_or("none"),
                pending
            ),
        }
    }
}

/// Problems with the bootloader and boot entries. Nothing is fixed.
pub fn check(
    state: BootloaderState,
    pending: Option<&BootEntry>,
    current: Option<&BootEntry>,
) -> Vec<CheckIssue> {
    let mut issues = Vec::new();
    match state {
        BootloaderState::Normal => {}
        BootloaderState::NotInstalled => issues.push(CheckIssue::BootloaderNotInstalled),
        BootloaderState::Invalid => issues.push(CheckIssue::BootloaderInvalid),
    }
    match pending {
        None => issues.push(CheckIssue::NoPendingEntry),
        Some(pending) if state == BootloaderState::Normal && current != Some(pending) => {
            issues.push(CheckIssue::RebootRequired {
                current: current.map(BootEntry::postfix),
                pending: pending.postfix(),
            });
        }
        Some(_) => {}
    }
    issues
}

/// Files a cleanup would delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupPlan {
    pub boot_files: Vec<PathBuf>,
    pub module_dirs: Vec<PathBuf>,
    pub firmware_files: Vec<PathBuf>,
}

impl CleanupPlan {
    pub fn is_empty(&self) -> bool {
        self.boot_files.is_empty() && self.module_dirs.is_empty() && self.firmware_files.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.boot_files
            .iter()
            .chain(&self.module_dirs)
            .chain(&self.firmware_files)
    }

    /// Delete everything in the plan; with `pretend` only log it.
    pub fn apply(&self, pretend: bool) -> Result<()> {
        for path in self.paths() {
            if pretend {
                tracing::info!("would remove {}", path.display());
            } else {
                tracing::info!("removing {}", path.display());
                remove_path(path)?;
            }
        }
        Ok(())
    }
}

/// Work out what is stale.
///
/// `retained` are the entries to keep (every primary entry plus the
/// complete history entries) and `bootloader_paths` the files the
/// bootloader owns. The rescue and history directories are always kept.
pub fn plan_cleanup(
    layout: &FsLayout,
    retained: &[BootEntry],
    bootloader_paths: &[PathBuf],
    firmware: &dyn FirmwareSource,
) -> Result<CleanupPlan> {
    Ok(CleanupPlan {
        boot_files: stale_boot_files(layout, retained, bootloader_paths)?,
        module_dirs: stale_module_dirs(layout, retained)?,
        firmware_files: stale_firmware(layout, retained, firmware)?,
    })
}

fn stale_boot_files(
    layout: &FsLayout,
    retained: &[BootEntry],
    bootloader_paths: &[PathBuf],
) -> Result<Vec<PathBuf>> {
    let boot_dir = layout.boot_dir();
    let mut keep: HashSet<PathBuf> = bootloader_paths.iter().cloned().collect();
    keep.insert(layout.boot_rescue_os_dir());
    keep.insert(layout.boot_history_dir());
    for entry in retained {
        keep.extend(entry.boot_filepaths());
    }

    let mut stale = Vec::new();
    for item in fs::read_dir(&boot_dir).with_context(|| format!("reading {}", boot_dir.display()))? {
        let path = item
            .with_context(|| format!("reading {}", boot_dir.display()))?
            .path();
        if !keep.contains(&path) {
            stale.push(path);
        }
    }
    stale.sort();
    Ok(stale)
}

fn stale_module_dirs(layout: &FsLayout, retained: &[BootEntry]) -> Result<Vec<PathBuf>> {
    let keep: HashSet<&str> = retained.iter().map(BootEntry::verstr).collect();
    let installed = installed_module_versions(layout)?;
    let mut stale: Vec<PathBuf> = installed
        .iter()
        .filter(|v| !keep.contains(v.as_str()))
        .map(|v| layout.kernel_modules_dir(v))
        .collect();
    if !installed.is_empty() && stale.len() == installed.len() {
        stale.push(layout.kernel_modules_root());
    }
    Ok(stale)
}

fn is_module_file(path: &Path) -> bool {
    path.file_name()
        .map(|n| {
            let n = n.to_string_lossy();
            n.ends_with(".ko") || n.contains(".ko.")
        })
        .unwrap_or(false)
}

fn stale_firmware(
    layout: &FsLayout,
    retained: &[BootEntry],
    source: &dyn FirmwareSource,
) -> Result<Vec<PathBuf>> {
    let firmware_dir = layout.firmware_dir();
    if !firmware_dir.is_dir() {
        return Ok(Vec::new());
    }

    let module_dirs: Vec<PathBuf> = retained
        .iter()
        .map(BootEntry::kernel_modules_dirpath)
        .filter(|d| d.is_dir())
        .collect();
    if module_dirs.is_empty() {
        tracing::warn!("no installed kernel modules, firmware left untouched");
        return Ok(Vec::new());
    }

    let mut referenced: HashSet<PathBuf> =
        STANDARD_FIRMWARE.iter().map(PathBuf::from).collect();
    for dir in &module_dirs {
        for item in WalkDir::new(dir) {
            let item = item?;
            if item.file_type().is_file() && is_module_file(item.path()) {
                for name in source.firmware_of(item.path())? {
                    referenced.insert(PathBuf::from(name));
                }
            }
        }
    }

    // keep what referenced symlinks point at
    let canonical_dir = firmware_dir
        .canonicalize()
        .unwrap_or_else(|_| firmware_dir.clone());
    let links: Vec<PathBuf> = referenced.iter().cloned().collect();
    for name in links {
        let path = firmware_dir.join(&name);
        if path.is_symlink() {
            if let Ok(target) = path.canonicalize() {
                if let Ok(rel) = target.strip_prefix(&canonical_dir) {
                    referenced.insert(rel.to_path_buf());
                }
            }
        }
    }

    let mut stale = Vec::new();
    for item in WalkDir::new(&firmware_dir).min_depth(1) {
        let item = item?;
        if item.file_type().is_dir() {
            continue;
        }
        let rel = item
            .path()
            .strip_prefix(&firmware_dir)
            .unwrap_or(item.path())
            .to_path_buf();
        if !referenced.contains(&rel) {
            stale.push(item.path().to_path_buf());
        }
    }
    stale.sort();
    Ok(stale)
}
