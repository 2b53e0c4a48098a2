//! Configuration provider.
//!
//! [`Config`] is the interface the engine consumes. [`TomlConfig`] reads it
//! from a config directory:
//!
//! ```text
//! /etc/boot-builder/
//!   profile/options.toml   distribution defaults, read first
//!   profile/mask/*         distribution version masks
//!   options.toml           local overrides, field by field
//!   mask/*                 local version masks
//! ```
//!
//! ```toml
//! [kernel]
//! type = "linux"
//! name = "vanilla"
//! addons = ["wireless-regdb"]
//! init-cmdline = "rd.debug"
//!
//! [bootloader]
//! wait-time = 5
//!
//! [system]
//! init = "auto-detect"
//! remount-boot-rw = true
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{Error, IoResultExt, Result};
use crate::version::{natural_cmp, KernelVersion};

pub const DEFAULT_CONFIG_DIR: &str = "/etc/boot-builder";
pub const DEFAULT_TMP_DIR: &str = "/var/tmp/boot-builder";
pub const DEFAULT_INITRAMFS_NAME: &str = "minitrd";
pub const MAX_BOOTLOADER_WAIT_TIME: u32 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelType {
    Linux,
}

impl KernelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelType::Linux => "linux",
        }
    }
}

impl fmt::Display for KernelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KernelType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linux" => Ok(KernelType::Linux),
            other => Err(Error::config(format!(
                "invalid kernel type \"{}\" specified",
                other
            ))),
        }
    }
}

/// The init program the initramfs hands control to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemInit {
    /// `/sbin/init`, picked by `switch_root` itself.
    Sysvinit,
    Openrc,
    Systemd,
    Custom(PathBuf),
}

impl SystemInit {
    pub const OPENRC_INIT: &'static str = "/sbin/openrc-init";
    pub const SYSTEMD_INIT: &'static str = "/usr/lib/systemd/systemd";

    /// Command passed to `switchroot`; empty for sysvinit.
    pub fn command(&self) -> String {
        match self {
            SystemInit::Sysvinit => String::new(),
            SystemInit::Openrc => Self::OPENRC_INIT.to_string(),
            SystemInit::Systemd => Self::SYSTEMD_INIT.to_string(),
            SystemInit::Custom(path) => path.display().to_string(),
        }
    }

    /// Resolve an `init` option value against the host root.
    pub fn resolve(value: &str, root: &Path) -> Result<Self> {
        match value {
            "auto-detect" => {
                if root.join("sbin/openrc-init").exists() {
                    Ok(SystemInit::Openrc)
                } else if root.join("usr/lib/systemd/systemd").exists() {
                    Ok(SystemInit::Systemd)
                } else {
                    Err(Error::config("auto detect system init failed"))
                }
            }
            "sysvinit" => Ok(SystemInit::Sysvinit),
            "openrc" => Ok(SystemInit::Openrc),
            "systemd" => Ok(SystemInit::Systemd),
            path if path.starts_with('/') => Ok(SystemInit::Custom(PathBuf::from(path))),
            _ => Err(Error::config("invalid value of option system/init")),
        }
    }
}

/// Options and policies the engine reads from its environment.
pub trait Config {
    fn kernel_type(&self) -> KernelType;

    fn kernel_name(&self) -> Result<&str>;

    fn kernel_addon_names(&self) -> &[String];

    fn initramfs_name(&self) -> &str;

    /// Resolved against `root`, the host root the init lives in.
    fn system_init(&self, root: &Path) -> Result<SystemInit>;

    /// Extra seconds the boot menu waits; `0..=3600`.
    fn bootloader_extra_time(&self) -> u32;

    fn kernel_extra_init_cmdline(&self) -> &str;

    fn remount_boot_rw(&self) -> bool;

    /// `false` when `verstr` of atom `fullname` is masked.
    fn test_version_mask(&self, fullname: &str, verstr: &str) -> bool;

    fn tmp_dir(&self) -> &Path;
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OptionsFile {
    #[serde(default)]
    kernel: KernelSection,
    #[serde(default)]
    bootloader: BootloaderSection,
    #[serde(default)]
    system: SystemSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct KernelSection {
    #[serde(rename = "type")]
    kernel_type: Option<String>,
    name: Option<String>,
    addons: Option<Vec<String>>,
    initramfs: Option<String>,
    init_cmdline: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct BootloaderSection {
    wait_time: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct SystemSection {
    init: Option<String>,
    remount_boot_rw: Option<bool>,
    tmp_dir: Option<PathBuf>,
}

/// [`Config`] loaded from a configuration directory.
#[derive(Debug, Clone)]
pub struct TomlConfig {
    kernel_type: KernelType,
    kernel_name: Option<String>,
    kernel_addons: Vec<String>,
    initramfs_name: String,
    init_cmdline: String,
    wait_time: u32,
    system_init: String,
    remount_boot_rw: bool,
    tmp_dir: PathBuf,
    masks: Vec<String>,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            kernel_type: KernelType::Linux,
            kernel_name: None,
            kernel_addons: Vec::new(),
            initramfs_name: DEFAULT_INITRAMFS_NAME.to_string(),
            init_cmdline: String::new(),
            wait_time: 0,
            system_init: "auto-detect".to_string(),
            remount_boot_rw: true,
            tmp_dir: PathBuf::from(DEFAULT_TMP_DIR),
            masks: Vec::new(),
        }
    }
}

impl TomlConfig {
    pub fn load(config_dir: &Path) -> Result<Self> {
        let mut config = Self::default();
        for dir in [config_dir.join("profile"), config_dir.to_path_buf()] {
            let options = dir.join("options.toml");
            if options.exists() {
                let text = fs::read_to_string(&options)
                    .with_context(|| format!("reading {}", options.display()))?;
                config.apply_str(&text)?;
            }
            config.load_masks(&dir.join("mask"))?;
        }
        tracing::debug!("loaded configuration from {}", config_dir.display());
        Ok(config)
    }

    /// Overlay one options file onto the current values.
    pub fn apply_str(&mut self, text: &str) -> Result<()> {
        let file: OptionsFile = toml::from_str(text)?;

        if let Some(t) = file.kernel.kernel_type {
            self.kernel_type = t.parse()?;
        }
        if let Some(name) = file.kernel.name {
            self.kernel_name = Some(name);
        }
        if let Some(addons) = file.kernel.addons {
            let mut addons = addons;
            addons.sort();
            addons.dedup();
            self.kernel_addons = addons;
        }
        if let Some(name) = file.kernel.initramfs {
            self.initramfs_name = name;
        }
        if let Some(cmdline) = file.kernel.init_cmdline {
            self.init_cmdline = cmdline;
        }
        if let Some(wait) = file.bootloader.wait_time {
            self.wait_time = u32::try_from(wait)
                .ok()
                .filter(|w| *w <= MAX_BOOTLOADER_WAIT_TIME)
                .ok_or_else(|| Error::config("invalid value of option bootloader/wait-time"))?;
        }
        if let Some(init) = file.system.init {
            let valid = matches!(init.as_str(), "auto-detect" | "sysvinit" | "openrc" | "systemd")
                || init.starts_with('/');
            if !valid {
                return Err(Error::config("invalid value of option system/init"));
            }
            self.system_init = init;
        }
        if let Some(remount) = file.system.remount_boot_rw {
            self.remount_boot_rw = remount;
        }
        if let Some(tmp) = file.system.tmp_dir {
            self.tmp_dir = tmp;
        }
        Ok(())
    }

    /// Add the contents of a mask file.
    pub fn add_mask(&mut self, text: impl Into<String>) {
        self.masks.push(text.into());
    }

    fn load_masks(&mut self, dir: &Path) -> Result<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("reading {}", dir.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        for file in files {
            let text = fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            self.add_mask(text);
        }
        Ok(())
    }
}

/// `Greater` when `a` is a newer version string than `b`.
pub(crate) fn compare_verstr(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<KernelVersion>(), b.parse::<KernelVersion>()) {
        (Ok(va), Ok(vb)) => va.cmp(&vb),
        _ => natural_cmp(a, b),
    }
}

impl Config for TomlConfig {
    fn kernel_type(&self) -> KernelType {
        self.kernel_type
    }

    fn kernel_name(&self) -> Result<&str> {
        self.kernel_name
            .as_deref()
            .ok_or_else(|| Error::config("no kernel type and kernel name specified"))
    }

    fn kernel_addon_names(&self) -> &[String] {
        &self.kernel_addons
    }

    fn initramfs_name(&self) -> &str {
        &self.initramfs_name
    }

    fn system_init(&self, root: &Path) -> Result<SystemInit> {
        SystemInit::resolve(&self.system_init, root)
    }

    fn bootloader_extra_time(&self) -> u32 {
        self.wait_time
    }

    fn kernel_extra_init_cmdline(&self) -> &str {
        &self.init_cmdline
    }

    fn remount_boot_rw(&self) -> bool {
        self.remount_boot_rw
    }

    fn test_version_mask(&self, fullname: &str, verstr: &str) -> bool {
        let prefix = format!(">{}-", fullname);
        for buf in &self.masks {
            for line in buf.lines() {
                if let Some(masked_above) = line.trim().strip_prefix(&prefix) {
                    if compare_verstr(verstr, masked_above).is_gt() {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults() {
        let cfg = TomlConfig::default();
        assert_eq!(cfg.bootloader_extra_time(), 0);
        assert!(cfg.remount_boot_rw());
        assert_eq!(cfg.initramfs_name(), "minitrd");
        assert!(matches!(cfg.kernel_name(), Err(Error::Configuration(_))));
    }

    #[test]
    fn local_options_override_profile() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("profile")).unwrap();
        fs::write(
            temp.path().join("profile/options.toml"),
            "[kernel]\nname = \"vanilla\"\n[bootloader]\nwait-time = 3\n",
        )
        .unwrap();
        fs::write(
            temp.path().join("options.toml"),
            "[bootloader]\nwait-time = 10\n[system]\nremount-boot-rw = false\n",
        )
        .unwrap();

        let cfg = TomlConfig::load(temp.path()).unwrap();
        assert_eq!(cfg.kernel_name().unwrap(), "vanilla");
        assert_eq!(cfg.bootloader_extra_time(), 10);
        assert!(!cfg.remount_boot_rw());
    }

    #[test]
    fn rejects_out_of_range_wait_time() {
        let mut cfg = TomlConfig::default();
        assert!(cfg.apply_str("[bootloader]\nwait-time = 3601\n").is_err());
        assert!(cfg.apply_str("[bootloader]\nwait-time = -1\n").is_err());
        cfg.apply_str("[bootloader]\nwait-time = 3600\n").unwrap();
        assert_eq!(cfg.bootloader_extra_time(), 3600);
    }

    #[test]
    fn rejects_bad_init() {
        let mut cfg = TomlConfig::default();
        assert!(cfg.apply_str("[system]\ninit = \"upstart\"\n").is_err());
        cfg.apply_str("[system]\ninit = \"/bin/myinit\"\n").unwrap();
        assert_eq!(
            cfg.system_init(Path::new("/")).unwrap(),
            SystemInit::Custom(PathBuf::from("/bin/myinit"))
        );
    }

    #[test]
    fn auto_detect_init() {
        let temp = TempDir::new().unwrap();
        let cfg = TomlConfig::default();
        assert!(cfg.system_init(temp.path()).is_err());

        fs::create_dir_all(temp.path().join("usr/lib/systemd")).unwrap();
        fs::write(temp.path().join("usr/lib/systemd/systemd"), "").unwrap();
        assert_eq!(cfg.system_init(temp.path()).unwrap(), SystemInit::Systemd);

        fs::create_dir_all(temp.path().join("sbin")).unwrap();
        fs::write(temp.path().join("sbin/openrc-init"), "").unwrap();
        let init = cfg.system_init(temp.path()).unwrap();
        assert_eq!(init, SystemInit::Openrc);
        assert_eq!(init.command(), "/sbin/openrc-init");
        assert_eq!(SystemInit::Sysvinit.command(), "");
    }

    #[test]
    fn version_mask() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("mask")).unwrap();
        fs::write(temp.path().join("mask/kernel"), ">linux/vanilla-5.10.0\n").unwrap();

        let cfg = TomlConfig::load(temp.path()).unwrap();
        assert!(cfg.test_version_mask("linux/vanilla", "5.10.0"));
        assert!(cfg.test_version_mask("linux/vanilla", "5.9.12"));
        assert!(!cfg.test_version_mask("linux/vanilla", "5.10.1"));
        assert!(!cfg.test_version_mask("linux/vanilla", "5.11.0"));
        assert!(cfg.test_version_mask("linux/other", "6.0.0"));
    }

    #[test]
    fn unknown_option_is_an_error() {
        let mut cfg = TomlConfig::default();
        assert!(cfg.apply_str("[system]\nbogus = 1\n").is_err());
    }
}
