//! Preflight checks run before anything is modified.
//!
//! A missing tool or directory is a [`Error::RunningEnvironment`] raised
//! up front, so no operation fails half way through for lack of one.
//!
//! # Example
//!
//! ```rust,ignore
//! use boot_builder::preflight::{check_host, Operation};
//!
//! check_host(&layout, Operation::Initramfs)?;
//! ```

use crate::error::{Error, Result};
use crate::layout::FsLayout;

/// Check if a command exists in PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools needed to build an initramfs. Each tuple is (command, package).
pub const INITRAMFS_TOOLS: &[(&str, &str)] = &[("ldd", "glibc"), ("modinfo", "kmod")];

/// Tools needed to install GRUB.
pub const BOOTLOADER_TOOLS: &[(&str, &str)] = &[("grub-install", "grub")];

/// Operation families with different tool requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Listing, checking and cleaning; needs nothing external.
    Inspect,
    Initramfs,
    Bootloader,
}

impl Operation {
    pub fn required_tools(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Operation::Inspect => &[],
            Operation::Initramfs => INITRAMFS_TOOLS,
            Operation::Bootloader => BOOTLOADER_TOOLS,
        }
    }
}

/// Check that specific tools are available.
///
/// Returns an error listing every missing tool and its package.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        return Err(Error::environment(format!(
            "Missing required host tools:\n{}",
            msg
        )));
    }
    Ok(())
}

/// Check the boot directory and the tools `op` needs.
pub fn check_host(layout: &FsLayout, op: Operation) -> Result<()> {
    let boot_dir = layout.boot_dir();
    if !boot_dir.is_dir() {
        return Err(Error::environment(format!(
            "directory \"{}\" does not exist",
            boot_dir.display()
        )));
    }
    check_required_tools(op.required_tools())
}

/// Mutating a live system (`/`) needs root.
pub fn check_privileges(layout: &FsLayout) -> Result<()> {
    if layout.root() == std::path::Path::new("/") && unsafe { libc::geteuid() } != 0 {
        return Err(Error::environment("this operation must be run as root"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools() {
        assert!(check_required_tools(&[("sh", "bash")]).is_ok());
        let err = check_required_tools(&[("nonexistent_command_xyz", "fake-package")])
            .unwrap_err();
        assert!(matches!(err, Error::RunningEnvironment(_)));
        assert!(err.to_string().contains("fake-package"));
    }

    #[test]
    fn test_check_host_needs_boot_dir() {
        let temp = TempDir::new().unwrap();
        let layout = FsLayout::new(temp.path());
        assert!(matches!(
            check_host(&layout, Operation::Inspect),
            Err(Error::RunningEnvironment(_))
        ));
        std::fs::create_dir_all(layout.boot_dir()).unwrap();
        check_host(&layout, Operation::Inspect).unwrap();
    }

    #[test]
    fn staged_roots_skip_privilege_check() {
        let temp = TempDir::new().unwrap();
        check_privileges(&FsLayout::new(temp.path())).unwrap();
    }
}
