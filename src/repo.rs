//! Interfaces to the package repository and the atom executor.
//!
//! Repository layout, distfile fetching and kernel builds are not part of
//! this crate; callers plug them in through [`Repository`] and
//! [`AtomExecutor`].

use std::fmt;
use std::path::Path;

use crate::boot_entry::BootEntry;
use crate::config::{compare_verstr, Config, KernelType};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomKind {
    Kernel,
    KernelAddon,
    Initramfs,
}

impl AtomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AtomKind::Kernel => "kernel",
            AtomKind::KernelAddon => "kernel-addon",
            AtomKind::Initramfs => "initramfs",
        }
    }
}

/// One versioned artifact of the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atom {
    pub kernel_type: KernelType,
    pub kind: AtomKind,
    pub name: String,
    pub verstr: String,
}

impl Atom {
    /// `{kind}/{name}`, the name version masks refer to.
    pub fn fullname(&self) -> String {
        format!("{}/{}", self.kind.as_str(), self.name)
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.fullname(), self.verstr)
    }
}

pub trait Repository {
    /// Every available version of the named atom, in any order.
    fn atoms(&self, kernel_type: KernelType, kind: AtomKind, name: &str) -> Result<Vec<Atom>>;
}

pub trait AtomExecutor {
    fn fetch(&self, atom: &Atom) -> Result<()>;

    /// Unpack the sources of `atom` into `work_dir`.
    fn unpack(&self, atom: &Atom, work_dir: &Path) -> Result<()>;

    /// Build and install a kernel with its addons as `entry`.
    fn install_kernel(&self, kernel: &Atom, addons: &[Atom], entry: &BootEntry) -> Result<()>;
}

/// Newest version of `name` that is not masked.
pub fn select_atom(
    repo: &dyn Repository,
    config: &dyn Config,
    kind: AtomKind,
    name: &str,
) -> Result<Option<Atom>> {
    let mut atoms: Vec<Atom> = repo
        .atoms(config.kernel_type(), kind, name)?
        .into_iter()
        .filter(|a| config.test_version_mask(&a.fullname(), &a.verstr))
        .collect();
    atoms.sort_by(|a, b| compare_verstr(&a.verstr, &b.verstr));
    Ok(atoms.pop())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TomlConfig;

    struct MemoryRepo(Vec<Atom>);

    impl Repository for MemoryRepo {
        fn atoms(&self, kernel_type: KernelType, kind: AtomKind, name: &str) -> Result<Vec<Atom>> {
            Ok(self
                .0
                .iter()
                .filter(|a| a.kernel_type == kernel_type && a.kind == kind && a.name == name)
                .cloned()
                .collect())
        }
    }

    fn atom(kind: AtomKind, name: &str, verstr: &str) -> Atom {
        Atom {
            kernel_type: KernelType::Linux,
            kind,
            name: name.to_string(),
            verstr: verstr.to_string(),
        }
    }

    #[test]
    fn latest_unmasked_wins() {
        let repo = MemoryRepo(vec![
            atom(AtomKind::Kernel, "vanilla", "6.10.1"),
            atom(AtomKind::Kernel, "vanilla", "6.9.3"),
            atom(AtomKind::Kernel, "vanilla", "6.11.0"),
            atom(AtomKind::Initramfs, "minitrd", "1.0"),
        ]);
        let mut config = TomlConfig::default();

        let picked = select_atom(&repo, &config, AtomKind::Kernel, "vanilla").unwrap();
        assert_eq!(picked.unwrap().verstr, "6.11.0");

        config.add_mask(">kernel/vanilla-6.10.1\n");
        let picked = select_atom(&repo, &config, AtomKind::Kernel, "vanilla").unwrap();
        assert_eq!(picked.unwrap().verstr, "6.10.1");

        assert!(select_atom(&repo, &config, AtomKind::KernelAddon, "vanilla")
            .unwrap()
            .is_none());
    }

    #[test]
    fn display_names() {
        let a = atom(AtomKind::KernelAddon, "wireless-regdb", "2024.01");
        assert_eq!(a.fullname(), "kernel-addon/wireless-regdb");
        assert_eq!(a.to_string(), "kernel-addon/wireless-regdb-2024.01");
    }
}
