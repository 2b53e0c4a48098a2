//! Host filesystem layout.
//!
//! Fixed naming contract shared with other tooling:
//!
//! ```text
//! <root>/boot/kernel-{arch}-{verstr}
//! <root>/boot/history/...            retired entries
//! <root>/boot/rescue/                rescue OS, never touched
//! <root>/boot/grub/, <root>/boot/EFI/
//! <root>/lib/modules/{verstr}
//! <root>/lib/firmware
//! ```
//!
//! `root` is `/` on a live system; tests and image builds point it at a
//! staged tree.

use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FsLayout {
    root: PathBuf,
}

impl Default for FsLayout {
    fn default() -> Self {
        Self::new("/")
    }
}

impl FsLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn boot_dir(&self) -> PathBuf {
        self.root.join("boot")
    }

    pub fn boot_history_dir(&self) -> PathBuf {
        self.boot_dir().join("history")
    }

    pub fn boot_rescue_os_dir(&self) -> PathBuf {
        self.boot_dir().join("rescue")
    }

    pub fn grub_dir(&self) -> PathBuf {
        self.boot_dir().join("grub")
    }

    pub fn efi_dir(&self) -> PathBuf {
        self.boot_dir().join("EFI")
    }

    pub fn kernel_modules_root(&self) -> PathBuf {
        self.root.join("lib/modules")
    }

    pub fn kernel_modules_dir(&self, verstr: &str) -> PathBuf {
        self.kernel_modules_root().join(verstr)
    }

    pub fn firmware_dir(&self) -> PathBuf {
        self.root.join("lib/firmware")
    }

    /// Map an absolute path as seen by the booted system onto this layout.
    ///
    /// `/lib/modules/5.10.0` becomes `<root>/lib/modules/5.10.0`.
    pub fn host_path(&self, logical: &Path) -> PathBuf {
        self.root.join(relative_to_root(logical))
    }

    /// Inverse of [`FsLayout::host_path`].
    pub fn logical_path(&self, host: &Path) -> PathBuf {
        match host.strip_prefix(&self.root) {
            Ok(rel) => Path::new("/").join(rel),
            Err(_) => host.to_path_buf(),
        }
    }
}

/// Strip the leading `/` (and any `.`) so the path can be joined.
pub fn relative_to_root(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::RootDir | Component::CurDir | Component::Prefix(_)))
        .collect()
}
