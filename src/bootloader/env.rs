//! GRUB environment block (`grub/grubenv`).
//!
//! A fixed 1024 byte file: a header line, `key=value` lines, and `#`
//! padding. GRUB rewrites it in place with `save_env`, so the size must
//! never change.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::artifact::filesystem::atomic_write;
use crate::error::{Error, IoResultExt, Result};

pub const ENV_BLOCK_SIZE: usize = 1024;
const HEADER: &str = "# GRUB Environment Block\n";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrubEnv {
    vars: BTreeMap<String, String>,
}

impl GrubEnv {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::config("grub environment block is not valid UTF-8"))?;
        let body = text
            .strip_prefix(HEADER)
            .ok_or_else(|| Error::config("invalid grub environment block header"))?;

        let mut vars = BTreeMap::new();
        for line in body.lines() {
            if line.starts_with('#') || line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::config(format!("invalid grub environment line \"{}\"", line)))?;
            vars.insert(key.to_string(), value.to_string());
        }
        Ok(Self { vars })
    }

    /// Read `path`; a missing file is an empty block.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&data)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn unset(&mut self, key: &str) -> bool {
        self.vars.remove(key).is_some()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = String::from(HEADER);
        for (key, value) in &self.vars {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        if out.len() > ENV_BLOCK_SIZE {
            return Err(Error::config("grub environment block overflow"));
        }
        let mut bytes = out.into_bytes();
        bytes.resize(ENV_BLOCK_SIZE, b'#');
        Ok(bytes)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write(path, &self.to_bytes()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn block_is_padded() {
        let mut env = GrubEnv::default();
        env.set("stable", "1");
        let bytes = env.to_bytes().unwrap();
        assert_eq!(bytes.len(), ENV_BLOCK_SIZE);
        assert!(bytes.starts_with(b"# GRUB Environment Block\nstable=1\n#"));
        assert_eq!(*bytes.last().unwrap(), b'#');
    }

    #[test]
    fn save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("grubenv");
        assert_eq!(GrubEnv::load(&path).unwrap(), GrubEnv::default());

        let mut env = GrubEnv::default();
        env.set("stable", "1");
        env.set("recordfail", "1");
        env.save(&path).unwrap();

        let mut loaded = GrubEnv::load(&path).unwrap();
        assert_eq!(loaded.get("stable"), Some("1"));
        assert!(loaded.unset("recordfail"));
        assert!(!loaded.unset("recordfail"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(GrubEnv::parse(b"hello").is_err());
        assert!(GrubEnv::parse(b"# GRUB Environment Block\nnoequals\n").is_err());
    }

    #[test]
    fn overflow_is_an_error() {
        let mut env = GrubEnv::default();
        env.set("big", "x".repeat(ENV_BLOCK_SIZE));
        assert!(env.to_bytes().is_err());
    }
}
