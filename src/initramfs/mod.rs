//! Initramfs builder.
//!
//! The image is assembled in a scratch directory that is emptied on every
//! run, then packed into the boot directory as
//!
//! - `initramfs-{arch}-{verstr}`: LZMA compressed `newc` cpio, the image
//!   the kernel unpacks
//! - `initramfs-files-{arch}-{verstr}.tar.bz2`: the same tree, for
//!   inspection
//!
//! Both are written to temporary names and renamed into place only once
//! complete, so a failed build never leaves a half written image next to
//! the kernel.
//!
//! # Example
//!
//! ```rust,ignore
//! use boot_builder::initramfs::{InitramfsBuilder, InitramfsInputs, InitramfsOptions, Ldd};
//!
//! let builder = InitramfsBuilder::new(&layout, "/var/tmp/boot-builder/initramfs", &Ldd);
//! builder.build(&entry, &inputs)?;
//! ```

mod binaries;
mod debug;
mod script;
mod skeleton;

pub use binaries::{
    copy_to_initrd, find_binary, install_bin, normalize_logical, parse_ldd, resolve_in_root, Ldd,
    LibraryDeps,
};
pub use debug::bashrc;
pub use script::startup_rc;
pub use skeleton::{GROUP, PASSWD};

use std::fs;
use std::path::{Path, PathBuf};

use crate::artifact::cpio::build_cpio_lzma;
use crate::artifact::filesystem::{atomic_move, make_empty_dir, temp_sibling};
use crate::artifact::snapshot::create_tar_bz2;
use crate::boot_entry::BootEntry;
use crate::error::{Error, IoResultExt, Result};
use crate::kconfig::{KernelConfig, REQUIRED_INITRAMFS_SYMBOLS};
use crate::layout::FsLayout;
use crate::modules::{BlockOp, ModuleClosure};
use crate::process::Cmd;
use crate::topology::{DiskTopology, MountPoint};

const LVM_CONF: &str = "global {
    locking_type = 4
    use_lvmetad = 0
}
devices {
    write_cache_state = 0
}
backup {
    backup = 0
    archive = 0
}
";

const LVM_TMPFILES_CONF: &str = "/usr/lib/tmpfiles.d/lvm2.conf";

/// Build options.
#[derive(Debug, Clone)]
pub struct InitramfsOptions {
    /// Boot into bash with a toolset instead of the init program.
    pub debug: bool,

    /// LZMA preset (0-9) of the boot image.
    ///
    /// Default: 6
    pub lzma_preset: u32,
}

impl Default for InitramfsOptions {
    fn default() -> Self {
        Self {
            debug: false,
            lzma_preset: 6,
        }
    }
}

/// Everything the image is generated from, computed by the caller.
#[derive(Debug, Clone, Copy)]
pub struct InitramfsInputs<'a> {
    pub mount_points: &'a [MountPoint],
    pub topology: &'a DiskTopology,
    pub modules: &'a ModuleClosure,
    /// Logical paths under `/lib/firmware`.
    pub firmware: &'a [PathBuf],
    pub block_ops: &'a [BlockOp],
    pub init_binary: &'a Path,
    /// Command `switchroot` hands over to; empty for the kernel default.
    pub init_cmd: &'a str,
}

pub struct InitramfsBuilder<'a> {
    layout: &'a FsLayout,
    scratch_dir: PathBuf,
    deps: &'a dyn LibraryDeps,
    options: InitramfsOptions,
}

impl<'a> InitramfsBuilder<'a> {
    pub fn new(
        layout: &'a FsLayout,
        scratch_dir: impl Into<PathBuf>,
        deps: &'a dyn LibraryDeps,
    ) -> Self {
        Self {
            layout,
            scratch_dir: scratch_dir.into(),
            deps,
            options: InitramfsOptions::default(),
        }
    }

    pub fn with_options(mut self, options: InitramfsOptions) -> Self {
        self.options = options;
        self
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Check everything a build needs without touching anything.
    pub fn check_preconditions(&self, entry: &BootEntry, inputs: &InitramfsInputs) -> Result<()> {
        let modules_dir = entry.kernel_modules_dirpath();
        if !modules_dir.is_dir() {
            return Err(Error::initramfs(format!(
                "\"{}\" does not exist",
                modules_dir.display()
            )));
        }
        let firmware_dir = entry.firmware_dirpath();
        if !firmware_dir.is_dir() {
            return Err(Error::initramfs(format!(
                "\"{}\" does not exist",
                firmware_dir.display()
            )));
        }
        let config_path = entry.kernel_config_filepath();
        if !config_path.is_file() {
            return Err(Error::initramfs(format!(
                "kernel config \"{}\" does not exist",
                config_path.display()
            )));
        }
        KernelConfig::load(&config_path)?.require(REQUIRED_INITRAMFS_SYMBOLS)?;
        if !inputs.init_binary.is_file() {
            return Err(Error::initramfs(format!(
                "init program \"{}\" does not exist",
                inputs.init_binary.display()
            )));
        }
        Ok(())
    }

    /// Check, assemble and publish the image of `entry`.
    pub fn build(&self, entry: &BootEntry, inputs: &InitramfsInputs) -> Result<()> {
        self.check_preconditions(entry, inputs)?;
        self.assemble(entry, inputs)?;
        self.publish(entry)
    }

    /// Build the image tree in the scratch directory.
    pub fn assemble(&self, entry: &BootEntry, inputs: &InitramfsInputs) -> Result<()> {
        let root = self.scratch_dir.as_path();
        tracing::info!("Assembling initramfs for {} in {}", entry, root.display());

        make_empty_dir(root)?;
        skeleton::create_skeleton(self.layout, root, entry.verstr())?;

        for module in inputs.modules.iter() {
            copy_to_initrd(self.layout, module, root)?;
        }
        for firmware in inputs.firmware {
            copy_to_initrd(self.layout, firmware, root)?;
        }
        tracing::debug!(
            "copied {} modules and {} firmware files",
            inputs.modules.len(),
            inputs.firmware.len()
        );

        let needs_lvm = inputs
            .block_ops
            .iter()
            .any(|op| matches!(op, BlockOp::LvmActivate { .. }));
        if needs_lvm {
            self.install_lvm(root)?;
        }

        binaries::install_external_bin(
            inputs.init_binary,
            Path::new("/init"),
            self.layout,
            root,
            self.deps,
        )?;

        let rc = startup_rc(
            inputs.mount_points,
            inputs.topology,
            inputs.modules,
            inputs.block_ops,
            inputs.init_cmd,
        );
        let rc_path = root.join("startup.rc");
        fs::write(&rc_path, rc).with_context(|| format!("Failed to write {}", rc_path.display()))?;

        if self.options.debug {
            debug::install_debug_tools(self.layout, root, entry.verstr(), self.deps)?;
        }
        Ok(())
    }

    fn install_lvm(&self, root: &Path) -> Result<()> {
        let lvm = find_binary(self.layout, "lvm")
            .ok_or_else(|| Error::initramfs("lvm is required for logical volumes but not found"))?;
        install_bin(self.layout, &lvm, root, self.deps)?;

        let tmpfiles = self.layout.host_path(Path::new(LVM_TMPFILES_CONF));
        if tmpfiles.exists() {
            Cmd::new("systemd-tmpfiles")
                .arg("--create")
                .arg(format!("--root={}", root.display()))
                .arg_path(&tmpfiles)
                .error_msg("Failed to create lvm runtime directories")
                .run()?;
        } else {
            tracing::debug!("{} not found, no lvm tmpfiles created", tmpfiles.display());
        }

        let conf_dir = root.join("etc/lvm");
        fs::create_dir_all(&conf_dir)
            .with_context(|| format!("Failed to create {}", conf_dir.display()))?;
        fs::write(conf_dir.join("lvm.conf"), LVM_CONF)
            .with_context(|| format!("Failed to write {}", conf_dir.join("lvm.conf").display()))?;
        Ok(())
    }

    /// Pack the scratch tree into the boot directory of `entry`.
    pub fn publish(&self, entry: &BootEntry) -> Result<()> {
        let root = self.scratch_dir.as_path();
        let initrd = entry.initrd_filepath();
        let tar = entry.initrd_tar_filepath();
        let initrd_tmp = temp_sibling(&initrd);
        let tar_tmp = temp_sibling(&tar);

        let written = build_cpio_lzma(root, &initrd_tmp, self.options.lzma_preset)
            .and_then(|()| create_tar_bz2(root, &tar_tmp));
        if let Err(e) = written {
            let _ = fs::remove_file(&initrd_tmp);
            let _ = fs::remove_file(&tar_tmp);
            return Err(e);
        }

        atomic_move(&initrd_tmp, &initrd)?;
        atomic_move(&tar_tmp, &tar)?;
        tracing::info!("Installed {}", initrd.display());
        Ok(())
    }
}
