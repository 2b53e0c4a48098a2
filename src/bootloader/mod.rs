//! GRUB bootloader management.
//!
//! State is derived from what is on disk:
//!
//! - `NotInstalled`: neither `boot/grub` nor `boot/EFI` exists
//! - `Normal`: `grub.cfg` names a main entry and the settings file parses
//! - `Invalid`: anything in between
//!
//! Only [`GrubBootloader::install`] runs `grub-install`; updates rewrite
//! `grub.cfg` and nothing else. Inputs that cannot be derived from the boot
//! entries (auxiliary OS list, extra command line) are kept in
//! `grub/boot-builder.json` so an update can reuse them.

mod env;
mod menu;

pub use env::{GrubEnv, ENV_BLOCK_SIZE};
pub use menu::{parse_main_entry, render, MenuInputs};

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::artifact::filesystem::{atomic_move, atomic_write, remove_path, temp_sibling};
use crate::boot_entry::{self, BootEntry, BootLocation};
use crate::error::{Error, IoResultExt, Result};
use crate::host::{AuxOs, BootMode, HostInfo};
use crate::layout::FsLayout;
use crate::process::Cmd;
use crate::topology::{DiskKind, MountRole};

const GRUB_CFG: &str = "grub.cfg";
const GRUB_ENV: &str = "grubenv";
const SETTINGS_FILE: &str = "boot-builder.json";
const STABLE_VAR: &str = "stable";
const MBR_BOOTSTRAP_SIZE: usize = 440;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloaderState {
    NotInstalled,
    Invalid,
    Normal,
}

/// The parts of a GRUB install that run external tools.
pub trait GrubInstaller {
    /// Install EFI binaries into the removable media path of the ESP
    /// mounted at `boot_dir`.
    fn install_efi(&self, boot_dir: &Path) -> Result<()>;

    /// Install into the boot sector of `disk` with modules in `boot_dir/grub`.
    fn install_bios(&self, boot_dir: &Path, disk: &Path) -> Result<()>;

    /// Syntax check a generated config.
    fn check_script(&self, cfg: &Path) -> Result<()>;
}

/// [`GrubInstaller`] running `grub-install` and `grub-script-check`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GrubInstall;

impl GrubInstaller for GrubInstall {
    fn install_efi(&self, boot_dir: &Path) -> Result<()> {
        // no firmware variables are touched, the disk stays portable
        Cmd::new("grub-install")
            .args(["--removable", "--target=x86_64-efi"])
            .arg(format!("--efi-directory={}", boot_dir.display()))
            .arg(format!("--boot-directory={}", boot_dir.display()))
            .arg("--no-nvram")
            .error_msg("grub-install failed")
            .run()?;
        Ok(())
    }

    fn install_bios(&self, boot_dir: &Path, disk: &Path) -> Result<()> {
        Cmd::new("grub-install")
            .arg("--target=i386-pc")
            .arg(format!("--boot-directory={}", boot_dir.display()))
            .arg_path(disk)
            .error_msg("grub-install failed")
            .run()?;
        Ok(())
    }

    fn check_script(&self, cfg: &Path) -> Result<()> {
        if which::which("grub-script-check").is_err() {
            tracing::debug!("grub-script-check not available, {} not checked", cfg.display());
            return Ok(());
        }
        Cmd::new("grub-script-check")
            .arg_path(cfg)
            .error_msg("generated grub.cfg is invalid")
            .run()?;
        Ok(())
    }
}

/// Non-derivable install parameters kept next to `grub.cfg`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrubSettings {
    pub boot_mode: BootMode,
    #[serde(default)]
    pub boot_disk: Option<PathBuf>,
    #[serde(default)]
    pub aux_os: Vec<AuxOs>,
    #[serde(default)]
    pub extra_cmdline: String,
}

/// Values from the configuration that shape the menu.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MenuSettings {
    pub extra_wait_time: u32,
    pub init_cmd: String,
    pub kernel_cmdline: String,
}

pub struct GrubBootloader<I: GrubInstaller = GrubInstall> {
    layout: FsLayout,
    installer: I,
}

impl GrubBootloader<GrubInstall> {
    pub fn new(layout: &FsLayout) -> Self {
        Self::with_installer(layout, GrubInstall)
    }
}

impl<I: GrubInstaller> GrubBootloader<I> {
    pub fn with_installer(layout: &FsLayout, installer: I) -> Self {
        Self {
            layout: layout.clone(),
            installer,
        }
    }

    pub fn grub_cfg_path(&self) -> PathBuf {
        self.layout.grub_dir().join(GRUB_CFG)
    }

    pub fn grubenv_path(&self) -> PathBuf {
        self.layout.grub_dir().join(GRUB_ENV)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.layout.grub_dir().join(SETTINGS_FILE)
    }

    /// Bootloader files in the boot directory that exist.
    pub fn owned_paths(&self) -> Vec<PathBuf> {
        [self.layout.grub_dir(), self.layout.efi_dir()]
            .into_iter()
            .filter(|p| p.symlink_metadata().is_ok())
            .collect()
    }

    pub fn state(&self) -> BootloaderState {
        if self.owned_paths().is_empty() {
            return BootloaderState::NotInstalled;
        }
        match (self.read_main_postfix(), self.read_settings()) {
            (Ok(Some(_)), Ok(Some(settings))) => {
                if settings.boot_mode == BootMode::Efi && !self.layout.efi_dir().exists() {
                    BootloaderState::Invalid
                } else {
                    BootloaderState::Normal
                }
            }
            _ => BootloaderState::Invalid,
        }
    }

    fn read_main_postfix(&self) -> Result<Option<String>> {
        let path = self.grub_cfg_path();
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(parse_main_entry(&text))
    }

    pub fn read_settings(&self) -> Result<Option<GrubSettings>> {
        let path = self.settings_path();
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn require_normal(&self) -> Result<()> {
        match self.state() {
            BootloaderState::Normal => Ok(()),
            BootloaderState::NotInstalled => {
                Err(Error::environment("bootloader is not installed"))
            }
            BootloaderState::Invalid => Err(Error::environment("bootloader is invalid")),
        }
    }

    /// Entry the installed menu boots by default, `None` unless `Normal`.
    pub fn main_entry(&self) -> Result<Option<BootEntry>> {
        if self.state() != BootloaderState::Normal {
            return Ok(None);
        }
        match self.read_main_postfix()? {
            Some(postfix) => Ok(Some(BootEntry::from_postfix(
                &self.layout,
                &postfix,
                BootLocation::Primary,
            )?)),
            None => Ok(None),
        }
    }

    pub fn boot_mode(&self) -> Result<Option<BootMode>> {
        if self.state() != BootloaderState::Normal {
            return Ok(None);
        }
        Ok(self.read_settings()?.map(|s| s.boot_mode))
    }

    /// Install GRUB and write its menu. Only valid when nothing is installed.
    pub fn install(
        &self,
        host: &HostInfo,
        main_entry: &BootEntry,
        aux_os: &[AuxOs],
        extra_cmdline: &str,
        menu: &MenuSettings,
    ) -> Result<()> {
        if self.state() != BootloaderState::NotInstalled {
            return Err(Error::environment(
                "bootloader is already installed, remove it first",
            ));
        }
        let boot_dir = self.layout.boot_dir();
        tracing::info!("Installing GRUB ({}) into {}", host.boot_mode, boot_dir.display());

        match host.boot_mode {
            BootMode::Efi => {
                remove_path(&self.layout.efi_dir())?;
                remove_path(&self.layout.grub_dir())?;
                self.installer.install_efi(&boot_dir)?;
            }
            BootMode::Bios => {
                let disk = host
                    .boot_disk
                    .as_deref()
                    .ok_or_else(|| Error::config("BIOS boot mode requires a boot disk"))?;
                remove_path(&self.layout.grub_dir())?;
                self.installer.install_bios(&boot_dir, disk)?;
            }
        }
        fs::create_dir_all(self.layout.grub_dir()).with_context(|| {
            format!("Failed to create {}", self.layout.grub_dir().display())
        })?;

        let settings = GrubSettings {
            boot_mode: host.boot_mode,
            boot_disk: host.boot_disk.clone(),
            aux_os: aux_os.to_vec(),
            extra_cmdline: extra_cmdline.to_string(),
        };
        self.write_config(host, main_entry, &settings, menu)?;
        if !self.grubenv_path().exists() {
            GrubEnv::default().save(&self.grubenv_path())?;
        }
        Ok(())
    }

    /// Rewrite the menu. Omitted arguments keep their installed values.
    pub fn update(
        &self,
        host: &HostInfo,
        main_entry: Option<&BootEntry>,
        aux_os: Option<&[AuxOs]>,
        extra_cmdline: Option<&str>,
        menu: &MenuSettings,
    ) -> Result<()> {
        self.require_normal()?;
        let mut settings = self
            .read_settings()?
            .ok_or_else(|| Error::environment("bootloader settings are missing"))?;
        if let Some(aux) = aux_os {
            settings.aux_os = aux.to_vec();
        }
        if let Some(cmdline) = extra_cmdline {
            settings.extra_cmdline = cmdline.to_string();
        }
        let installed;
        let main_entry = match main_entry {
            Some(entry) => entry,
            None => {
                installed = self
                    .main_entry()?
                    .ok_or_else(|| Error::environment("bootloader has no main entry"))?;
                &installed
            }
        };
        tracing::info!("Updating GRUB menu, main entry {}", main_entry);
        self.write_config(host, main_entry, &settings, menu)
    }

    fn write_config(
        &self,
        host: &HostInfo,
        main_entry: &BootEntry,
        settings: &GrubSettings,
        menu: &MenuSettings,
    ) -> Result<()> {
        if main_entry.is_historical() {
            return Err(Error::config(format!(
                "{} is a history entry and cannot be the main entry",
                main_entry
            )));
        }
        let grub_root = grub_root(host)?;
        let history = boot_entry::enumerate(&self.layout, BootLocation::History)?;
        let cmdline = [menu.kernel_cmdline.trim(), settings.extra_cmdline.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        let text = render(&MenuInputs {
            boot_mode: settings.boot_mode,
            grub_root: &grub_root,
            main_entry,
            history: &history,
            aux_os: &settings.aux_os,
            extra_wait_time: menu.extra_wait_time,
            init_cmd: &menu.init_cmd,
            kernel_cmdline: &cmdline,
        });

        let cfg = self.grub_cfg_path();
        let tmp = temp_sibling(&cfg);
        fs::write(&tmp, &text).with_context(|| format!("Failed to write {}", tmp.display()))?;
        if let Err(e) = self
            .installer
            .check_script(&tmp)
            .and_then(|()| atomic_move(&tmp, &cfg))
        {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }

        let json = serde_json::to_string_pretty(settings)?;
        atomic_write(&self.settings_path(), json.as_bytes())
    }

    /// Remove GRUB from any state. With `force` leftovers are swept even
    /// when nothing looks installed.
    pub fn remove(&self, force: bool) -> Result<()> {
        if !force && self.state() == BootloaderState::NotInstalled {
            return Ok(());
        }
        tracing::info!("Removing GRUB");

        let settings = self.read_settings().unwrap_or_else(|e| {
            tracing::warn!("ignoring unreadable bootloader settings: {}", e);
            None
        });
        if let Some(GrubSettings {
            boot_mode: BootMode::Bios,
            boot_disk: Some(disk),
            ..
        }) = &settings
        {
            clear_boot_sector(disk)?;
        }
        remove_path(&self.layout.efi_dir())?;
        remove_path(&self.layout.grub_dir())
    }

    pub fn stable_flag(&self) -> Result<bool> {
        if self.state() != BootloaderState::Normal {
            return Ok(false);
        }
        Ok(GrubEnv::load(&self.grubenv_path())?.get(STABLE_VAR).is_some())
    }

    /// Record whether the main entry boots fine. Setting it needs a
    /// `Normal` bootloader, clearing it never fails for lack of one.
    pub fn set_stable_flag(&self, value: bool) -> Result<()> {
        if self.state() != BootloaderState::Normal {
            if value {
                return Err(Error::environment("bootloader is not properly installed"));
            }
            return Ok(());
        }
        let path = self.grubenv_path();
        let mut env = GrubEnv::load(&path)?;
        if value {
            env.set(STABLE_VAR, "1");
        } else if !env.unset(STABLE_VAR) {
            return Ok(());
        }
        env.save(&path)
    }
}

/// Device GRUB reads the kernel from: the ESP in EFI mode, the root
/// filesystem otherwise.
fn grub_root(host: &HostInfo) -> Result<String> {
    let mp = match host.boot_mode {
        BootMode::Efi => host
            .boot_mount()
            .ok_or_else(|| Error::config("EFI boot mode requires a boot mount point"))?,
        BootMode::Bios => host.root_mount()?,
    };
    if mp.role == MountRole::Root {
        if let DiskKind::LogicalVolume { group, name } = &host.topology.node(mp.disk).kind {
            return Ok(format!("lvm/{}-{}", group, name));
        }
    }
    Ok(mp.device_uuid.clone())
}

fn clear_boot_sector(disk: &Path) -> Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .open(disk)
        .with_context(|| format!("Failed to open {}", disk.display()))?;
    f.write_all(&[0u8; MBR_BOOTSTRAP_SIZE])
        .with_context(|| format!("Failed to clear boot sector of {}", disk.display()))?;
    f.flush()
        .with_context(|| format!("Failed to flush {}", disk.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{DiskBus, DiskTopology, FsKind, MountPoint};
    use std::cell::RefCell;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeGrub {
        calls: RefCell<Vec<String>>,
    }

    impl GrubInstaller for FakeGrub {
        fn install_efi(&self, boot_dir: &Path) -> Result<()> {
            fs::create_dir_all(boot_dir.join("EFI/BOOT")).unwrap();
            fs::create_dir_all(boot_dir.join("grub/x86_64-efi")).unwrap();
            self.calls.borrow_mut().push("efi".to_string());
            Ok(())
        }

        fn install_bios(&self, boot_dir: &Path, disk: &Path) -> Result<()> {
            fs::create_dir_all(boot_dir.join("grub/i386-pc")).unwrap();
            self.calls.borrow_mut().push(format!("bios {}", disk.display()));
            Ok(())
        }

        fn check_script(&self, _cfg: &Path) -> Result<()> {
            self.calls.borrow_mut().push("check".to_string());
            Ok(())
        }
    }

    fn efi_host() -> HostInfo {
        let mut topology = DiskTopology::new();
        let root = topology.add_root("root-disk", DiskKind::RawDisk { bus: DiskBus::Nvme });
        let esp = topology.add_root("esp-disk", DiskKind::RawDisk { bus: DiskBus::Nvme });
        HostInfo {
            arch: "x86_64".to_string(),
            boot_mode: BootMode::Efi,
            mount_points: vec![
                MountPoint {
                    role: MountRole::Root,
                    path: PathBuf::from("/"),
                    fs: FsKind::Btrfs,
                    options: "rw".to_string(),
                    device_uuid: "root-fs".to_string(),
                    device_path: None,
                    disk: root,
                },
                MountPoint {
                    role: MountRole::Boot,
                    path: PathBuf::from("/boot"),
                    fs: FsKind::Vfat,
                    options: "ro".to_string(),
                    device_uuid: "ESP-UUID".to_string(),
                    device_path: None,
                    disk: esp,
                },
            ],
            topology,
            aux_os: Vec::new(),
            aux_kernel_init_cmdline: String::new(),
            boot_disk: None,
        }
    }

    fn setup() -> (TempDir, FsLayout, BootEntry) {
        let temp = TempDir::new().unwrap();
        let layout = FsLayout::new(temp.path());
        fs::create_dir_all(layout.boot_dir()).unwrap();
        let entry = BootEntry::new(&layout, "x86_64", "6.1.0", BootLocation::Primary);
        (temp, layout, entry)
    }

    #[test]
    fn install_update_remove() {
        let (_temp, layout, entry) = setup();
        let grub = GrubBootloader::with_installer(&layout, FakeGrub::default());
        let host = efi_host();
        let menu = MenuSettings::default();
        assert_eq!(grub.state(), BootloaderState::NotInstalled);

        let aux = [AuxOs {
            name: "Windows".to_string(),
            partition_uuid: "WIN".to_string(),
            chainloader_number: 1,
        }];
        grub.install(&host, &entry, &aux, "", &menu).unwrap();
        assert_eq!(grub.state(), BootloaderState::Normal);
        assert_eq!(grub.main_entry().unwrap(), Some(entry.clone()));
        assert_eq!(grub.boot_mode().unwrap(), Some(BootMode::Efi));
        assert!(grub.install(&host, &entry, &[], "", &menu).is_err());

        let cfg = fs::read_to_string(grub.grub_cfg_path()).unwrap();
        assert!(cfg.contains("--set ESP-UUID"));
        assert!(cfg.contains("Auxillary: Windows"));

        // Update with nothing changed keeps the text and the aux list.
        grub.update(&host, None, None, None, &menu).unwrap();
        assert_eq!(fs::read_to_string(grub.grub_cfg_path()).unwrap(), cfg);

        let newer = BootEntry::new(&layout, "x86_64", "6.2.0", BootLocation::Primary);
        grub.update(&host, Some(&newer), None, Some("nomodeset"), &menu).unwrap();
        let cfg = fs::read_to_string(grub.grub_cfg_path()).unwrap();
        assert!(cfg.contains("Stable: Linux-x86_64-6.2.0"));
        assert!(cfg.contains("Auxillary: Windows"));
        assert!(cfg.contains("console=ttynull nomodeset"));
        assert_eq!(
            grub.installer.calls.borrow().iter().filter(|c| *c == "efi").count(),
            1
        );

        grub.remove(false).unwrap();
        assert_eq!(grub.state(), BootloaderState::NotInstalled);
        assert!(!layout.efi_dir().exists());
    }

    #[test]
    fn invalid_install_is_removable() {
        let (_temp, layout, _entry) = setup();
        let write_garbage = || {
            fs::create_dir_all(layout.grub_dir()).unwrap();
            fs::write(layout.grub_dir().join("grub.cfg"), "garbage").unwrap();
        };
        let grub = GrubBootloader::with_installer(&layout, FakeGrub::default());

        write_garbage();
        assert_eq!(grub.state(), BootloaderState::Invalid);
        assert_eq!(grub.main_entry().unwrap(), None);
        grub.remove(false).unwrap();
        assert_eq!(grub.state(), BootloaderState::NotInstalled);
        assert!(!layout.grub_dir().exists());

        write_garbage();
        grub.remove(true).unwrap();
        assert_eq!(grub.state(), BootloaderState::NotInstalled);
    }

    #[test]
    fn stable_flag_requires_normal_state() {
        let (_temp, layout, entry) = setup();
        let grub = GrubBootloader::with_installer(&layout, FakeGrub::default());

        let err = grub.set_stable_flag(true).unwrap_err();
        assert!(matches!(err, Error::RunningEnvironment(_)));
        grub.set_stable_flag(false).unwrap();
        assert!(!grub.stable_flag().unwrap());

        grub.install(&efi_host(), &entry, &[], "", &MenuSettings::default())
            .unwrap();
        assert!(!grub.stable_flag().unwrap());
        grub.set_stable_flag(true).unwrap();
        assert!(grub.stable_flag().unwrap());
        assert_eq!(
            fs::metadata(grub.grubenv_path()).unwrap().len(),
            ENV_BLOCK_SIZE as u64
        );
        grub.set_stable_flag(false).unwrap();
        assert!(!grub.stable_flag().unwrap());
    }

    #[test]
    fn bios_install_and_sector_clear() {
        let (temp, layout, entry) = setup();
        let disk = temp.path().join("disk.img");
        fs::write(&disk, vec![0xAAu8; 1024]).unwrap();

        let mut host = efi_host();
        host.boot_mode = BootMode::Bios;
        host.mount_points.truncate(1);
        host.boot_disk = Some(disk.clone());

        let grub = GrubBootloader::with_installer(&layout, FakeGrub::default());
        grub.install(&host, &entry, &[], "", &MenuSettings::default())
            .unwrap();
        assert_eq!(grub.state(), BootloaderState::Normal);
        let cfg = fs::read_to_string(grub.grub_cfg_path()).unwrap();
        assert!(cfg.contains("linux /boot/kernel-x86_64-6.1.0"));
        assert!(cfg.contains("--set root-fs"));

        grub.remove(false).unwrap();
        let data = fs::read(&disk).unwrap();
        assert_eq!(data.len(), 1024);
        assert!(data[..MBR_BOOTSTRAP_SIZE].iter().all(|b| *b == 0));
        assert!(data[MBR_BOOTSTRAP_SIZE..].iter().all(|b| *b == 0xAA));
    }
}
