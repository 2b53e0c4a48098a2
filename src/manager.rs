//! High level operations on one host.
//!
//! [`BootManager`] combines the configuration, the host description, the
//! boot directory and the bootloader. Every mutating operation holds a
//! [`BootDirGuard`](crate::boot_entry::BootDirGuard) so a read-only `/boot`
//! is remounted once per call chain.

use std::path::{Path, PathBuf};

use crate::artifact::filesystem::{make_empty_dir, remove_path, truncate_dir};
use crate::boot_entry::{self, BootDirWriter, BootEntry, BootLocation, MountControl, SystemMount};
use crate::bootloader::{BootloaderState, GrubBootloader, GrubInstall, GrubInstaller, MenuSettings};
use crate::check::{self, CheckIssue, CleanupPlan};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::host::HostInfo;
use crate::initramfs::{InitramfsBuilder, InitramfsInputs, InitramfsOptions, Ldd, LibraryDeps};
use crate::kconfig::KernelConfig;
use crate::layout::FsLayout;
use crate::modules::{
    block_ops, resolve_firmware, resolve_modules, FirmwareSource, ModinfoFirmware, ModuleClosure,
    ModuleDatabase,
};
use crate::repo::{select_atom, Atom, AtomExecutor, AtomKind, Repository};

const WORK_DIR: &str = "work";
const INITRAMFS_DIR: &str = "initramfs";

pub struct BootManager<'a, I: GrubInstaller = GrubInstall, M: MountControl = SystemMount> {
    layout: FsLayout,
    config: &'a dyn Config,
    host: Option<HostInfo>,
    writer: BootDirWriter<M>,
    bootloader: GrubBootloader<I>,
    deps: Box<dyn LibraryDeps>,
    firmware: Box<dyn FirmwareSource>,
}

impl<'a> BootManager<'a> {
    pub fn new(layout: FsLayout, config: &'a dyn Config, host: Option<HostInfo>) -> Self {
        let writer = BootDirWriter::new(layout.boot_dir(), config.remount_boot_rw());
        let bootloader = GrubBootloader::new(&layout);
        Self::with_parts(layout, config, host, writer, bootloader)
    }
}

impl<'a, I: GrubInstaller, M: MountControl> BootManager<'a, I, M> {
    pub fn with_parts(
        layout: FsLayout,
        config: &'a dyn Config,
        host: Option<HostInfo>,
        writer: BootDirWriter<M>,
        bootloader: GrubBootloader<I>,
    ) -> Self {
        Self {
            layout,
            config,
            host,
            writer,
            bootloader,
            deps: Box::new(Ldd),
            firmware: Box::new(ModinfoFirmware),
        }
    }

    /// Replace the shared-library and firmware queries.
    pub fn with_tools(
        mut self,
        deps: Box<dyn LibraryDeps>,
        firmware: Box<dyn FirmwareSource>,
    ) -> Self {
        self.deps = deps;
        self.firmware = firmware;
        self
    }

    pub fn layout(&self) -> &FsLayout {
        &self.layout
    }

    pub fn bootloader(&self) -> &GrubBootloader<I> {
        &self.bootloader
    }

    fn host(&self) -> Result<&HostInfo> {
        let host = self
            .host
            .as_ref()
            .ok_or_else(|| Error::config("no host description given"))?;
        host.validate()?;
        Ok(host)
    }

    pub fn boot_entries(&self) -> Result<Vec<BootEntry>> {
        boot_entry::enumerate(&self.layout, BootLocation::Primary)
    }

    pub fn history_entries(&self) -> Result<Vec<BootEntry>> {
        boot_entry::enumerate(&self.layout, BootLocation::History)
    }

    pub fn newest_entry(&self) -> Result<Option<BootEntry>> {
        boot_entry::newest(&self.layout)
    }

    /// Newest primary entry that has both kernel and initramfs files.
    pub fn pending_entry(&self) -> Result<Option<BootEntry>> {
        Ok(self.boot_entries()?.into_iter().find(BootEntry::is_complete))
    }

    /// Entry the installed bootloader boots by default.
    pub fn current_entry(&self) -> Result<Option<BootEntry>> {
        self.bootloader.main_entry()
    }

    pub fn bootloader_state(&self) -> BootloaderState {
        self.bootloader.state()
    }

    pub fn kernel_atom(&self, repo: &dyn Repository) -> Result<Option<Atom>> {
        select_atom(repo, self.config, AtomKind::Kernel, self.config.kernel_name()?)
    }

    /// One atom per configured addon. A missing addon is an error.
    pub fn kernel_addon_atoms(&self, repo: &dyn Repository) -> Result<Vec<Atom>> {
        self.config
            .kernel_addon_names()
            .iter()
            .map(|name| {
                select_atom(repo, self.config, AtomKind::KernelAddon, name)?.ok_or_else(|| {
                    Error::config(format!("kernel addon \"{}\" is not available", name))
                })
            })
            .collect()
    }

    pub fn initramfs_atom(&self, repo: &dyn Repository) -> Result<Option<Atom>> {
        select_atom(
            repo,
            self.config,
            AtomKind::Initramfs,
            self.config.initramfs_name(),
        )
    }

    /// Boot entry a kernel atom installs to.
    pub fn entry_for(&self, kernel: &Atom) -> Result<BootEntry> {
        Ok(BootEntry::new(
            &self.layout,
            &self.host()?.arch,
            &kernel.verstr,
            BootLocation::Primary,
        ))
    }

    /// Fetch and install a kernel with its addons.
    pub fn install_kernel(
        &self,
        executor: &dyn AtomExecutor,
        kernel: &Atom,
        addons: &[Atom],
    ) -> Result<BootEntry> {
        let entry = self.entry_for(kernel)?;
        executor.fetch(kernel)?;
        for addon in addons {
            executor.fetch(addon)?;
        }
        let _guard = self.writer.acquire()?;
        tracing::info!("Installing kernel {} as {}", kernel, entry);
        executor.install_kernel(kernel, addons, &entry)?;
        Ok(entry)
    }

    fn menu_settings(&self) -> Result<MenuSettings> {
        Ok(MenuSettings {
            extra_wait_time: self.config.bootloader_extra_time(),
            init_cmd: self.config.system_init(self.layout.root())?.command(),
            kernel_cmdline: self.config.kernel_extra_init_cmdline().to_string(),
        })
    }

    /// Build and publish the initramfs of `entry` from the `init` program
    /// that `atom` unpacks.
    pub fn install_initramfs(
        &self,
        executor: &dyn AtomExecutor,
        atom: &Atom,
        entry: &BootEntry,
        options: InitramfsOptions,
    ) -> Result<()> {
        let work_dir = self.config.tmp_dir().join(WORK_DIR);
        let result = self.build_initramfs(executor, atom, entry, options, &work_dir);
        if let Err(e) = remove_path(&work_dir) {
            tracing::warn!("failed to remove {}: {}", work_dir.display(), e);
        }
        result
    }

    fn build_initramfs(
        &self,
        executor: &dyn AtomExecutor,
        atom: &Atom,
        entry: &BootEntry,
        options: InitramfsOptions,
        work_dir: &Path,
    ) -> Result<()> {
        let host = self.host()?;
        let init_cmd = self.config.system_init(self.layout.root())?.command();
        let builder = InitramfsBuilder::new(
            &self.layout,
            self.config.tmp_dir().join(INITRAMFS_DIR),
            self.deps.as_ref(),
        )
        .with_options(options);

        executor.fetch(atom)?;
        make_empty_dir(work_dir)?;
        executor.unpack(atom, work_dir)?;
        let init_binary = work_dir.join("init");

        let empty = ModuleClosure::new();
        builder.check_preconditions(
            entry,
            &InitramfsInputs {
                mount_points: &host.mount_points,
                topology: &host.topology,
                modules: &empty,
                firmware: &[],
                block_ops: &[],
                init_binary: &init_binary,
                init_cmd: &init_cmd,
            },
        )?;

        let kernel_config = KernelConfig::load(&entry.kernel_config_filepath())?;
        let db = ModuleDatabase::load(&self.layout, entry.verstr())?;
        let modules = resolve_modules(&host.mount_points, &host.topology, &kernel_config, &db)?;
        let firmware = resolve_firmware(&self.layout, &modules, self.firmware.as_ref())?;
        let ops = block_ops(&host.mount_points, &host.topology)?;

        let inputs = InitramfsInputs {
            mount_points: &host.mount_points,
            topology: &host.topology,
            modules: &modules,
            firmware: &firmware,
            block_ops: &ops,
            init_binary: &init_binary,
            init_cmd: &init_cmd,
        };
        builder.assemble(entry, &inputs)?;

        let _guard = self.writer.acquire()?;
        builder.publish(entry)
    }

    /// Install GRUB with the pending entry as main entry.
    pub fn install_bootloader(&self) -> Result<()> {
        let host = self.host()?;
        let main = self
            .pending_entry()?
            .ok_or_else(|| Error::environment("no complete boot entry to boot"))?;
        let menu = self.menu_settings()?;
        let _guard = self.writer.acquire()?;
        self.bootloader.install(
            host,
            &main,
            &host.aux_os,
            &host.aux_kernel_init_cmdline,
            &menu,
        )
    }

    /// Regenerate the menu, switching to the pending entry if there is one.
    pub fn update_bootloader(&self) -> Result<()> {
        let host = self.host()?;
        let pending = self.pending_entry()?;
        let menu = self.menu_settings()?;
        let _guard = self.writer.acquire()?;
        self.bootloader.update(
            host,
            pending.as_ref(),
            Some(&host.aux_os),
            Some(&host.aux_kernel_init_cmdline),
            &menu,
        )
    }

    pub fn remove_bootloader(&self, force: bool) -> Result<()> {
        let _guard = self.writer.acquire()?;
        self.bootloader.remove(force)
    }

    pub fn stable_flag(&self) -> Result<bool> {
        self.bootloader.stable_flag()
    }

    pub fn set_stable_flag(&self, value: bool) -> Result<()> {
        let _guard = self.writer.acquire()?;
        self.bootloader.set_stable_flag(value)
    }

    pub fn check(&self) -> Result<Vec<CheckIssue>> {
        let pending = self.pending_entry()?;
        let current = self.current_entry()?;
        Ok(check::check(
            self.bootloader.state(),
            pending.as_ref(),
            current.as_ref(),
        ))
    }

    /// Stale files; primary and history entries are retained.
    pub fn cleanup_plan(&self) -> Result<CleanupPlan> {
        let mut retained = self.boot_entries()?;
        retained.extend(self.history_entries()?);
        let owned: Vec<PathBuf> = self.bootloader.owned_paths();
        check::plan_cleanup(&self.layout, &retained, &owned, self.firmware.as_ref())
    }

    pub fn clean(&self, pretend: bool) -> Result<CleanupPlan> {
        let plan = self.cleanup_plan()?;
        if pretend {
            plan.apply(true)?;
        } else if !plan.is_empty() {
            let _guard = self.writer.acquire()?;
            plan.apply(false)?;
        }
        Ok(plan)
    }

    /// Remove the bootloader, every boot file, all modules and firmware.
    pub fn remove_all(&self) -> Result<()> {
        let _guard = self.writer.acquire()?;
        self.bootloader.remove(true)?;
        tracing::info!("Removing all boot files");
        truncate_dir(&self.layout.boot_dir())?;
        remove_path(&self.layout.firmware_dir())?;
        remove_path(&self.layout.kernel_modules_root())
    }
}
