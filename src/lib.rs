//! Kernel, initramfs and bootloader lifecycle management for Linux hosts.
//!
//! The crate tracks installed kernels as boot entries, builds the
//! initramfs each entry needs from the host's storage stack, and keeps a
//! GRUB menu in step with what is installed:
//!
//! - **Disk topology** - arena of disk nodes feeding each mount point
//! - **Module closure** - kernel modules and firmware the storage stack needs
//! - **Initramfs builder** - image tree, startup script, cpio + tar artifacts
//! - **Boot entries** - naming contract of the boot directory
//! - **Bootloader** - GRUB state machine, menu generation, stable flag
//! - **Checker** - pending vs. current entry, stale file cleanup
//!
//! # Architecture
//!
//! ```text
//! HostInfo (mount points + DiskTopology)
//!     │
//!     ├── modules: resolve_modules / resolve_firmware / block_ops
//!     │
//!     ├── initramfs: InitramfsBuilder ──► initramfs-{arch}-{verstr}
//!     │                                   initramfs-files-{arch}-{verstr}.tar.bz2
//!     │
//!     └── bootloader: GrubBootloader ──► grub/grub.cfg, grub/grubenv
//!
//! BootManager ties them together with a Config and the boot directory.
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use boot_builder::{BootManager, FsLayout, HostInfo, TomlConfig};
//!
//! let config = TomlConfig::load("/etc/boot-builder".as_ref())?;
//! let host = HostInfo::load("/etc/boot-builder/host.toml".as_ref())?;
//! let manager = BootManager::new(FsLayout::default(), &config, Some(host));
//!
//! for issue in manager.check()? {
//!     println!("{}", issue);
//! }
//! ```

pub mod artifact;
pub mod boot_entry;
pub mod bootloader;
pub mod check;
pub mod config;
pub mod error;
pub mod host;
pub mod initramfs;
pub mod kconfig;
pub mod layout;
pub mod manager;
pub mod modules;
pub mod preflight;
pub mod process;
pub mod repo;
pub mod topology;
pub mod version;

pub use boot_entry::{BootEntry, BootLocation};
pub use bootloader::{BootloaderState, GrubBootloader};
pub use check::{CheckIssue, CleanupPlan};
pub use config::{Config, TomlConfig};
pub use error::{Error, Result};
pub use host::{BootMode, HostInfo};
pub use initramfs::{InitramfsBuilder, InitramfsOptions};
pub use layout::FsLayout;
pub use manager::BootManager;
pub use topology::DiskTopology;
pub use version::KernelVersion;
