//! Kernel module and firmware closure resolution.
//!
//! The modules an initramfs needs follow from the host's storage: every
//! disk node and every mounted filesystem maps to a few module aliases.
//! Each alias is then expanded through `modules.dep` so that dependencies
//! always precede the modules using them, which is the order `insmod`
//! needs at boot.

mod blockops;
mod firmware;

pub use blockops::{block_ops, BlockOp};
pub use firmware::{resolve_firmware, FirmwareSource, ModinfoFirmware, STANDARD_FIRMWARE};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, IoResultExt, Result};
use crate::kconfig::KernelConfig;
use crate::layout::FsLayout;
use crate::topology::{DiskBus, DiskKind, DiskTopology, FsKind, MountPoint};

/// Insertion ordered, duplicate free list of modules.
///
/// Paths are absolute as seen from the booted system
/// (`/lib/modules/{verstr}/kernel/...`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleClosure {
    paths: Vec<PathBuf>,
    seen: HashSet<PathBuf>,
}

impl ModuleClosure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `path` unless already present. Returns whether it was added.
    pub fn push(&mut self, path: PathBuf) -> bool {
        if self.seen.contains(&path) {
            return false;
        }
        self.seen.insert(path.clone());
        self.paths.push(path);
        true
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.seen.contains(path)
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathBuf> {
        self.paths.iter()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// A loadable module of the installed kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Normalized name (`-` replaced by `_`).
    pub name: String,
    /// Path relative to the module directory.
    pub path: PathBuf,
    /// Dependencies as paths relative to the module directory.
    pub deps: Vec<PathBuf>,
}

fn normalize(name: &str) -> String {
    name.replace('-', "_")
}

/// Module name from `kernel/fs/btrfs/btrfs.ko.zst`.
fn module_name(path: &Path) -> Option<String> {
    let file = path.file_name()?.to_str()?;
    let (stem, _) = file.split_once(".ko")?;
    Some(normalize(stem))
}

/// Shell style pattern match supporting `*`, `?` and `[...]` classes,
/// the subset used by `modules.alias`.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    star = Some((p, t));
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                b'[' => {
                    if let Some((matched, next)) = match_class(&pattern[p..], text[t]) {
                        if matched {
                            p += next;
                            t += 1;
                            continue;
                        }
                    }
                }
                c if c == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((sp, st)) => {
                p = sp + 1;
                t = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|c| *c == b'*')
}

/// Match one `[...]` class. Returns (matched, length of the class).
fn match_class(pattern: &[u8], c: u8) -> Option<(bool, usize)> {
    let end = pattern.iter().skip(1).position(|b| *b == b']')? + 1;
    let body = &pattern[1..end];
    let (negate, body) = match body.first() {
        Some(b'!') | Some(b'^') => (true, &body[1..]),
        _ => (false, body),
    };
    let mut matched = false;
    let mut i = 0;
    while i < body.len() {
        if i + 2 < body.len() && body[i + 1] == b'-' {
            if body[i] <= c && c <= body[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if body[i] == c {
                matched = true;
            }
            i += 1;
        }
    }
    Some((matched != negate, end + 1))
}

/// Index over `modules.dep`, `modules.alias` and `modules.builtin` of one
/// kernel's module directory.
#[derive(Debug, Clone, Default)]
pub struct ModuleDatabase {
    /// Logical module directory, e.g. `/lib/modules/5.10.0`.
    module_dir: PathBuf,
    by_name: HashMap<String, ModuleInfo>,
    aliases: Vec<(String, String)>,
    builtin: HashSet<String>,
}

impl ModuleDatabase {
    /// Load the index files of kernel `verstr`.
    pub fn load(layout: &FsLayout, verstr: &str) -> Result<Self> {
        let host_dir = layout.kernel_modules_dir(verstr);
        let read = |name: &str| -> Result<String> {
            let path = host_dir.join(name);
            if !path.exists() {
                return Ok(String::new());
            }
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
        };

        let dep = fs::read_to_string(host_dir.join("modules.dep"))
            .with_context(|| format!("reading {}/modules.dep", host_dir.display()))?;
        let db = Self::from_index(
            layout.logical_path(&host_dir),
            &dep,
            &read("modules.alias")?,
            &read("modules.builtin")?,
        );
        tracing::debug!(
            "module database {}: {} modules, {} aliases",
            db.module_dir.display(),
            db.by_name.len(),
            db.aliases.len()
        );
        Ok(db)
    }

    /// Build from the text of the index files.
    pub fn from_index(module_dir: PathBuf, dep: &str, alias: &str, builtin: &str) -> Self {
        let mut by_name = HashMap::new();
        for line in dep.lines() {
            let Some((path, deps)) = line.split_once(':') else {
                continue;
            };
            let path = PathBuf::from(path.trim());
            let Some(name) = module_name(&path) else {
                continue;
            };
            let deps = deps.split_whitespace().map(PathBuf::from).collect();
            by_name.insert(name.clone(), ModuleInfo { name, path, deps });
        }

        let aliases = alias
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                if fields.next()? != "alias" {
                    return None;
                }
                let pattern = fields.next()?;
                let module = fields.next()?;
                Some((normalize(pattern), normalize(module)))
            })
            .collect();

        let builtin = builtin
            .lines()
            .filter_map(|line| module_name(Path::new(line.trim())))
            .collect();

        Self {
            module_dir,
            by_name,
            aliases,
            builtin,
        }
    }

    pub fn module_dir(&self) -> &Path {
        &self.module_dir
    }

    /// Look up the single module providing `alias`.
    ///
    /// `Ok(None)` when nothing provides it or it is built into the kernel;
    /// those features need no module. Several distinct modules matching
    /// the same alias is a configuration error.
    pub fn lookup(&self, alias: &str) -> Result<Option<&ModuleInfo>> {
        let alias = normalize(alias);
        if let Some(module) = self.by_name.get(&alias) {
            return Ok(Some(module));
        }
        if self.builtin.contains(&alias) {
            return Ok(None);
        }

        let candidates: BTreeSet<&str> = self
            .aliases
            .iter()
            .filter(|(pattern, _)| glob_match(pattern.as_bytes(), alias.as_bytes()))
            .map(|(_, module)| module.as_str())
            .collect();

        let mut found = Vec::new();
        for name in candidates {
            if let Some(module) = self.by_name.get(name) {
                found.push(module);
            } else if !self.builtin.contains(name) {
                tracing::warn!("alias {} points at unknown module {}", alias, name);
            }
        }
        match found.len() {
            0 => Ok(None),
            1 => Ok(Some(found[0])),
            _ => Err(Error::config(format!(
                "kernel module alias \"{}\" is ambiguous: {}",
                alias,
                found
                    .iter()
                    .map(|m| m.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    /// Expand `alias` into `closure`, dependencies first.
    pub fn resolve_into(&self, alias: &str, closure: &mut ModuleClosure) -> Result<()> {
        let Some(module) = self.lookup(alias)? else {
            tracing::debug!("module alias {} resolves to nothing", alias);
            return Ok(());
        };
        let mut visiting = HashSet::new();
        self.expand(module, closure, &mut visiting);
        Ok(())
    }

    fn expand<'a>(
        &'a self,
        module: &'a ModuleInfo,
        closure: &mut ModuleClosure,
        visiting: &mut HashSet<&'a str>,
    ) {
        let path = self.module_dir.join(&module.path);
        if closure.contains(&path) || !visiting.insert(module.name.as_str()) {
            return;
        }
        for dep in &module.deps {
            match module_name(dep).and_then(|name| self.by_name.get(&name)) {
                Some(dep_module) => self.expand(dep_module, closure, visiting),
                None => tracing::warn!(
                    "{} depends on {}, which is not in modules.dep",
                    module.name,
                    dep.display()
                ),
            }
        }
        closure.push(path);
    }
}

/// Module aliases needed to drive one disk node.
fn disk_aliases(kind: &DiskKind) -> Vec<String> {
    match kind {
        DiskKind::RawDisk { bus } => match bus {
            DiskBus::Scsi { host_controller } => {
                vec![host_controller.clone(), "sd_mod".to_string()]
            }
            DiskBus::Nvme => vec!["nvme".to_string()],
            DiskBus::Xen => vec!["xen-blkfront".to_string()],
            DiskBus::Virtio => vec!["virtio_pci".to_string(), "virtio_blk".to_string()],
        },
        DiskKind::Partition { scheme } => {
            scheme.module_alias().map(str::to_string).into_iter().collect()
        }
        DiskKind::LogicalVolume { .. } => vec!["dm_mod".to_string()],
        DiskKind::CacheVolume => vec!["bcache".to_string()],
        DiskKind::RaidAggregate { .. } => Vec::new(),
    }
}

/// Ordered, deduplicated module aliases for the storage and filesystems of
/// `mount_points`.
///
/// Disks come first, lower devices before the volumes built on them, then
/// one filesystem alias per mount point. FAT additionally needs its
/// default codepage and charset modules, read from the kernel config.
pub fn collect_aliases(
    mount_points: &[MountPoint],
    topology: &DiskTopology,
    kernel_config: &KernelConfig,
) -> Result<Vec<String>> {
    let mut aliases = Vec::new();
    let mut seen = HashSet::new();
    let mut add = |alias: String, aliases: &mut Vec<String>| {
        if seen.insert(alias.clone()) {
            aliases.push(alias);
        }
    };

    let mut seen_disks = HashSet::new();
    for mp in mount_points {
        for id in topology.post_order(mp.disk) {
            if seen_disks.insert(id) {
                for alias in disk_aliases(&topology.node(id).kind) {
                    add(alias, &mut aliases);
                }
            }
        }
    }

    for mp in mount_points {
        match mp.fs {
            FsKind::Vfat => {
                add("vfat".to_string(), &mut aliases);
                for alias in kernel_config.fat_nls_aliases()? {
                    add(alias, &mut aliases);
                }
            }
            FsKind::Ext4 | FsKind::Btrfs | FsKind::Bcachefs => {
                add(mp.fs.as_str().to_string(), &mut aliases);
            }
        }
    }
    Ok(aliases)
}

/// Module closure for the storage stack of `mount_points`.
pub fn resolve_modules(
    mount_points: &[MountPoint],
    topology: &DiskTopology,
    kernel_config: &KernelConfig,
    db: &ModuleDatabase,
) -> Result<ModuleClosure> {
    let mut closure = ModuleClosure::new();
    for alias in collect_aliases(mount_points, topology, kernel_config)? {
        db.resolve_into(&alias, &mut closure)?;
    }
    tracing::info!("resolved {} kernel modules", closure.len());
    Ok(closure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{DiskRole, MountRole, PartitionScheme};
    use proptest::prelude::*;

    const DEP: &str = "\
kernel/fs/btrfs/btrfs.ko.xz: kernel/lib/raid6/raid6_pq.ko.xz kernel/lib/libcrc32c.ko.xz
kernel/lib/raid6/raid6_pq.ko.xz:
kernel/lib/libcrc32c.ko.xz:
kernel/drivers/ata/ahci.ko.xz: kernel/drivers/ata/libahci.ko.xz
kernel/drivers/ata/libahci.ko.xz:
kernel/drivers/scsi/sd_mod.ko.xz:
kernel/fs/fat/vfat.ko.xz: kernel/fs/fat/fat.ko.xz
kernel/fs/fat/fat.ko.xz:
kernel/fs/nls/nls_cp437.ko.xz:
kernel/drivers/md/dm-mod.ko.xz:
kernel/drivers/net/e1000e.ko.xz:
kernel/drivers/net/igb.ko.xz:
";

    const ALIAS: &str = "\
alias fs-btrfs btrfs
alias pci:v00008086d*sv*sd*bc01sc06i01* ahci
alias net-pf-99 e1000e
alias net-pf-99 igb
alias devname:mapper/control dm_mod
";

    const BUILTIN: &str = "kernel/drivers/nvme/host/nvme.ko\nkernel/fs/nls/nls_utf8.ko\n";

    const KCONFIG: &str = "CONFIG_FAT_DEFAULT_CODEPAGE=437\nCONFIG_FAT_DEFAULT_IOCHARSET=\"utf8\"\n";

    fn db() -> ModuleDatabase {
        ModuleDatabase::from_index(PathBuf::from("/lib/modules/5.10.0"), DEP, ALIAS, BUILTIN)
    }

    fn names(closure: &ModuleClosure) -> Vec<String> {
        closure
            .iter()
            .map(|p| module_name(p).unwrap())
            .collect()
    }

    fn scsi_root(fs: FsKind) -> (Vec<MountPoint>, DiskTopology) {
        let mut topo = DiskTopology::new();
        let disk = topo.add_root(
            "uuid-A",
            DiskKind::RawDisk {
                bus: DiskBus::Scsi {
                    host_controller: "ahci".into(),
                },
            },
        );
        let mp = MountPoint {
            role: MountRole::Root,
            path: PathBuf::from("/"),
            fs,
            options: String::new(),
            device_uuid: "uuid-A".into(),
            device_path: None,
            disk,
        };
        (vec![mp], topo)
    }

    #[test]
    fn btrfs_on_raw_disk_has_no_nls_aliases() {
        let (mps, topo) = scsi_root(FsKind::Btrfs);
        let aliases = collect_aliases(&mps, &topo, &KernelConfig::parse("")).unwrap();
        assert_eq!(aliases, ["ahci", "sd_mod", "btrfs"]);
    }

    #[test]
    fn fat_without_codepage_is_a_config_error() {
        let (mut mps, topo) = scsi_root(FsKind::Btrfs);
        let mut boot = mps[0].clone();
        boot.role = MountRole::Boot;
        boot.path = PathBuf::from("/boot");
        boot.fs = FsKind::Vfat;
        mps.push(boot);

        let cfg = KernelConfig::parse("CONFIG_FAT_DEFAULT_IOCHARSET=\"utf8\"\n");
        let err = collect_aliases(&mps, &topo, &cfg).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("CONFIG_FAT_DEFAULT_CODEPAGE"));

        let aliases = collect_aliases(&mps, &topo, &KernelConfig::parse(KCONFIG)).unwrap();
        assert_eq!(aliases, ["ahci", "sd_mod", "btrfs", "vfat", "nls_cp437", "nls_utf8"]);
    }

    #[test]
    fn lvm_on_partition_on_disk() {
        let mut topo = DiskTopology::new();
        let lv = topo.add_root(
            "lv",
            DiskKind::LogicalVolume {
                group: "vg".into(),
                name: "root".into(),
            },
        );
        let part = topo
            .add_child(
                lv,
                DiskRole::Member,
                "p",
                DiskKind::Partition {
                    scheme: PartitionScheme::Gpt,
                },
            )
            .unwrap();
        topo.add_child(part, DiskRole::Member, "d", DiskKind::RawDisk { bus: DiskBus::Virtio })
            .unwrap();
        let mp = MountPoint {
            role: MountRole::Root,
            path: PathBuf::from("/"),
            fs: FsKind::Ext4,
            options: String::new(),
            device_uuid: "lv".into(),
            device_path: None,
            disk: lv,
        };
        let aliases = collect_aliases(&[mp], &topo, &KernelConfig::default()).unwrap();
        assert_eq!(aliases, ["virtio_pci", "virtio_blk", "dm_mod", "ext4"]);
    }

    #[test]
    fn dependencies_precede_dependents() {
        let (mps, topo) = scsi_root(FsKind::Btrfs);
        let closure = resolve_modules(&mps, &topo, &KernelConfig::default(), &db()).unwrap();
        assert_eq!(
            names(&closure),
            ["libahci", "ahci", "sd_mod", "raid6_pq", "libcrc32c", "btrfs"]
        );
        assert_eq!(
            closure.paths()[1],
            PathBuf::from("/lib/modules/5.10.0/kernel/drivers/ata/ahci.ko.xz")
        );
    }

    #[test]
    fn lookup_rules() {
        let db = db();
        assert_eq!(db.lookup("dm-mod").unwrap().unwrap().name, "dm_mod");
        assert_eq!(db.lookup("fs-btrfs").unwrap().unwrap().name, "btrfs");
        assert_eq!(
            db.lookup("pci:v00008086d00001234sv0sd0bc01sc06i01").unwrap().unwrap().name,
            "ahci"
        );
        assert!(db.lookup("nvme").unwrap().is_none());
        assert!(db.lookup("no_such_thing").unwrap().is_none());
        assert!(matches!(db.lookup("net-pf-99"), Err(Error::Configuration(_))));
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match(b"fs-*", b"fs-btrfs"));
        assert!(glob_match(b"a?c", b"abc"));
        assert!(glob_match(b"v[0-9]x", b"v7x"));
        assert!(!glob_match(b"v[!0-9]x", b"v7x"));
        assert!(!glob_match(b"fs-*", b"btrfs"));
    }

    #[test]
    fn dependency_cycle_terminates() {
        let dep = "a.ko: b.ko\nb.ko: a.ko\n";
        let db = ModuleDatabase::from_index(PathBuf::from("/m"), dep, "", "");
        let mut closure = ModuleClosure::new();
        db.resolve_into("a", &mut closure).unwrap();
        assert_eq!(names(&closure), ["b", "a"]);
    }

    proptest! {
        #[test]
        fn resolution_is_stable(order in Just(vec!["btrfs", "ahci", "vfat", "sd_mod", "nls_cp437"]).prop_shuffle()) {
            let db = db();
            let mut first = ModuleClosure::new();
            let mut second = ModuleClosure::new();
            for alias in &order {
                db.resolve_into(alias, &mut first).unwrap();
            }
            for alias in &order {
                db.resolve_into(alias, &mut second).unwrap();
            }
            prop_assert_eq!(first.paths(), second.paths());

            let pos = |n: &str| first.iter().position(|p| module_name(p).unwrap() == n).unwrap();
            prop_assert!(pos("raid6_pq") < pos("btrfs"));
            prop_assert!(pos("libahci") < pos("ahci"));
            prop_assert!(pos("fat") < pos("vfat"));
        }
    }
}
