//! Kernel `.config` inspection.
//!
//! Only the `CONFIG_FOO=value` lines matter; `# CONFIG_FOO is not set`
//! comments and blank lines are skipped.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, IoResultExt, Result};

/// Symbols an initramfs built by this crate depends on.
///
/// The image is LZMA compressed; `RD_XZ` alone is not enough on some
/// kernels, so `RD_LZMA` is required as well.
pub const REQUIRED_INITRAMFS_SYMBOLS: &[(&str, &str)] = &[
    ("RD_XZ", "y"),
    ("RD_LZMA", "y"),
    ("BCACHE", "m"),
    ("BLK_DEV_SD", "m"),
    ("BLK_DEV_DM", "m"),
    ("EXT4_FS", "m"),
    ("VFAT_FS", "m"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelConfig {
    symbols: BTreeMap<String, String>,
}

impl KernelConfig {
    pub fn parse(text: &str) -> Self {
        let mut symbols = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                if let Some(name) = key.strip_prefix("CONFIG_") {
                    symbols.insert(name.to_string(), value.to_string());
                }
            }
        }
        Self { symbols }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read kernel config at {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    /// Raw value of `CONFIG_{name}`, quotes included.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.symbols.get(name).map(String::as_str)
    }

    /// Value of a string symbol with the surrounding quotes removed.
    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get(name).map(|v| {
            v.strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(v)
        })
    }

    /// Fail on the first symbol that is missing or set to another value.
    pub fn require(&self, required: &[(&str, &str)]) -> Result<()> {
        for (name, value) in required {
            if self.get(name) != Some(*value) {
                return Err(Error::initramfs(format!(
                    "config symbol CONFIG_{} must be selected as \"{}\"",
                    name, value
                )));
            }
        }
        Ok(())
    }

    /// Module aliases of the default codepage and I/O charset of FAT.
    ///
    /// Both symbols must be present; a FAT mount without them cannot be
    /// mounted from the initramfs.
    pub fn fat_nls_aliases(&self) -> Result<[String; 2]> {
        let codepage = self
            .get("FAT_DEFAULT_CODEPAGE")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::config("CONFIG_FAT_DEFAULT_CODEPAGE is missing in kernel config")
            })?;
        let iocharset = self
            .get_string("FAT_DEFAULT_IOCHARSET")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::config("CONFIG_FAT_DEFAULT_IOCHARSET is missing in kernel config")
            })?;
        Ok([format!("nls_cp{}", codepage), format!("nls_{}", iocharset)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
#
# Automatically generated file; DO NOT EDIT.
#
CONFIG_RD_XZ=y
CONFIG_RD_LZMA=y
CONFIG_BCACHE=m
CONFIG_BLK_DEV_SD=m
CONFIG_BLK_DEV_DM=m
CONFIG_EXT4_FS=m
CONFIG_VFAT_FS=m
CONFIG_FAT_DEFAULT_CODEPAGE=437
CONFIG_FAT_DEFAULT_IOCHARSET=\"utf8\"
# CONFIG_XFS_FS is not set
";

    #[test]
    fn parses_symbols() {
        let cfg = KernelConfig::parse(SAMPLE);
        assert_eq!(cfg.get("RD_XZ"), Some("y"));
        assert_eq!(cfg.get("XFS_FS"), None);
        assert_eq!(cfg.get_string("FAT_DEFAULT_IOCHARSET"), Some("utf8"));
    }

    #[test]
    fn required_symbols() {
        let cfg = KernelConfig::parse(SAMPLE);
        cfg.require(REQUIRED_INITRAMFS_SYMBOLS).unwrap();

        let cfg = KernelConfig::parse(&SAMPLE.replace("CONFIG_BCACHE=m", "CONFIG_BCACHE=y"));
        let err = cfg.require(REQUIRED_INITRAMFS_SYMBOLS).unwrap_err();
        assert!(matches!(err, Error::InitramfsInstall(_)));
        assert!(err.to_string().contains("CONFIG_BCACHE"));
    }

    #[test]
    fn fat_aliases() {
        let cfg = KernelConfig::parse(SAMPLE);
        assert_eq!(cfg.fat_nls_aliases().unwrap(), ["nls_cp437", "nls_utf8"]);
    }

    #[test]
    fn missing_codepage_names_the_symbol() {
        let cfg = KernelConfig::parse(&SAMPLE.replace("CONFIG_FAT_DEFAULT_CODEPAGE=437\n", ""));
        let err = cfg.fat_nls_aliases().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("CONFIG_FAT_DEFAULT_CODEPAGE"));
    }

    #[test]
    fn missing_iocharset_names_the_symbol() {
        let cfg = KernelConfig::parse(&SAMPLE.replace("CONFIG_FAT_DEFAULT_IOCHARSET=\"utf8\"\n", ""));
        let err = cfg.fat_nls_aliases().unwrap_err();
        assert!(err.to_string().contains("CONFIG_FAT_DEFAULT_IOCHARSET"));
    }
}
