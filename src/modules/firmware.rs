//! Firmware closure of a module set.
//!
//! `modinfo -F firmware` only prints the last entry when a module declares
//! several, so the full `modinfo` output is parsed instead. The parsing
//! lives behind [`FirmwareSource`] so another metadata source can replace
//! it without touching the resolver.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::ModuleClosure;
use crate::error::Result;
use crate::layout::FsLayout;
use crate::process::Cmd;

/// Wireless regulatory database, needed by every wireless driver that
/// loads early and not declared by any module.
pub const STANDARD_FIRMWARE: &[&str] = &["regulatory.db", "regulatory.db.p7s"];

/// Firmware file names declared by a module.
pub trait FirmwareSource {
    /// `module` is the host path of the module file.
    fn firmware_of(&self, module: &Path) -> Result<Vec<String>>;
}

/// [`FirmwareSource`] backed by `modinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModinfoFirmware;

impl ModinfoFirmware {
    /// Extract `firmware:` fields from full `modinfo` output.
    pub fn parse(output: &str) -> Vec<String> {
        output
            .lines()
            .filter_map(|line| line.strip_prefix("firmware:"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect()
    }
}

impl FirmwareSource for ModinfoFirmware {
    fn firmware_of(&self, module: &Path) -> Result<Vec<String>> {
        let result = Cmd::new("modinfo")
            .arg_path(module)
            .error_msg("modinfo failed. Install: kmod")
            .run()?;
        Ok(Self::parse(&result.stdout))
    }
}

/// Firmware files needed by `closure`, in module order, followed by
/// [`STANDARD_FIRMWARE`].
///
/// Returns logical paths under the firmware directory. Declared firmware
/// that is not installed is skipped with a warning; many drivers list
/// firmware for hardware variants the host does not have.
pub fn resolve_firmware(
    layout: &FsLayout,
    closure: &ModuleClosure,
    source: &dyn FirmwareSource,
) -> Result<Vec<PathBuf>> {
    let firmware_dir = layout.firmware_dir();
    let logical_dir = layout.logical_path(&firmware_dir);
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    let mut add = |name: &str, module: Option<&Path>| {
        if !seen.insert(name.to_string()) {
            return;
        }
        if firmware_dir.join(name).exists() {
            out.push(logical_dir.join(name));
        } else {
            match module {
                Some(m) => tracing::warn!(
                    "firmware {} of {} is not installed, skipped",
                    name,
                    m.display()
                ),
                None => tracing::warn!("firmware {} is not installed, skipped", name),
            }
        }
    };

    for module in closure.iter() {
        let host = layout.host_path(module);
        for name in source.firmware_of(&host)? {
            add(&name, Some(module));
        }
    }
    for name in STANDARD_FIRMWARE {
        add(name, None);
    }
    Ok(out)
}
