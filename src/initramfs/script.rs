//! `startup.rc`, the script the init program runs.

use std::fmt::Write as _;

use crate::modules::{BlockOp, ModuleClosure};
use crate::topology::{DiskKind, DiskTopology, FsKind, MountPoint, RaidKind};

/// Device UUIDs a multi device filesystem is assembled from.
fn member_uuids(mp: &MountPoint, topology: &DiskTopology, raid: RaidKind) -> Vec<String> {
    let node = topology.node(mp.disk);
    match &node.kind {
        DiskKind::RaidAggregate { kind } if *kind == raid => topology
            .children(mp.disk)
            .into_iter()
            .map(|id| topology.node(id).uuid.clone())
            .collect(),
        _ => vec![node.uuid.clone()],
    }
}

/// Render the startup script.
///
/// The output only depends on the arguments, so building twice from the
/// same inputs gives the same bytes.
pub fn startup_rc(
    mount_points: &[MountPoint],
    topology: &DiskTopology,
    modules: &ModuleClosure,
    block_ops: &[BlockOp],
    init_cmd: &str,
) -> String {
    let mut buf = String::new();

    for mp in mount_points {
        let _ = writeln!(buf, "# {}: {}", mp.path.display(), mp.device_uuid);
    }
    buf.push('\n');

    if !modules.is_empty() {
        for path in modules.iter() {
            let _ = writeln!(buf, "insmod \"{}\"", path.display());
        }
        buf.push('\n');
    }

    if !block_ops.is_empty() {
        for op in block_ops {
            let _ = writeln!(buf, "{}", op);
        }
        buf.push('\n');
    }

    for mp in mount_points {
        let target = mp.sysroot_target();
        match mp.fs {
            FsKind::Btrfs => {
                let uuids = member_uuids(mp, topology, RaidKind::Btrfs).join(" ");
                let _ = writeln!(buf, "mount-btrfs {} \"{}\" {}", target, mp.options, uuids);
            }
            FsKind::Bcachefs => {
                let uuids = member_uuids(mp, topology, RaidKind::Bcachefs).join(" ");
                let _ = writeln!(buf, "mount-bcachefs {} \"{}\" {}", target, mp.options, uuids);
            }
            FsKind::Vfat | FsKind::Ext4 => {
                let _ = writeln!(
                    buf,
                    "mount -t {} -o \"{}\" \"{}\" \"{}\"",
                    mp.fs, mp.options, mp.device_uuid, target
                );
            }
        }
        buf.push('\n');
    }

    let switchroot = format!("switchroot \"./sysroot\" {}", init_cmd);
    buf.push_str(switchroot.trim_end());
    buf.push('\n');
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{DiskBus, DiskRole, MountRole, PartitionScheme};
    use std::path::PathBuf;

    fn mount(
        role: MountRole,
        path: &str,
        fs: FsKind,
        uuid: &str,
        disk: crate::topology::DiskId,
    ) -> MountPoint {
        MountPoint {
            role,
            path: PathBuf::from(path),
            fs,
            options: "rw".to_string(),
            device_uuid: uuid.to_string(),
            device_path: None,
            disk,
        }
    }

    #[test]
    fn single_btrfs_root() {
        let mut topology = DiskTopology::new();
        let part = topology.add_root(
            "part-1",
            DiskKind::Partition {
                scheme: PartitionScheme::Gpt,
            },
        );
        topology
            .add_child(part, DiskRole::Member, "sda", DiskKind::RawDisk { bus: DiskBus::Nvme })
            .unwrap();
        let mps = [mount(MountRole::Root, "/", FsKind::Btrfs, "fs-A", part)];

        let mut modules = ModuleClosure::new();
        modules.push(PathBuf::from("/lib/modules/6.1.0/kernel/fs/btrfs/btrfs.ko"));

        let text = startup_rc(&mps, &topology, &modules, &[], "/sbin/openrc-init");
        assert_eq!(
            text,
            "# /: fs-A\n\
             \n\
             insmod \"/lib/modules/6.1.0/kernel/fs/btrfs/btrfs.ko\"\n\
             \n\
             mount-btrfs ./sysroot \"rw\" part-1\n\
             \n\
             switchroot \"./sysroot\" /sbin/openrc-init\n"
        );
    }

    #[test]
    fn raid_lists_members_and_sysvinit_is_trimmed() {
        let mut topology = DiskTopology::new();
        let raid = topology.add_root(
            "raid",
            DiskKind::RaidAggregate {
                kind: RaidKind::Btrfs,
            },
        );
        for uuid in ["m1", "m2"] {
            topology
                .add_child(raid, DiskRole::Member, uuid, DiskKind::RawDisk { bus: DiskBus::Virtio })
                .unwrap();
        }
        let boot = topology.add_root("efi", DiskKind::RawDisk { bus: DiskBus::Virtio });
        let mps = [
            mount(MountRole::Root, "/", FsKind::Btrfs, "fs-A", raid),
            mount(MountRole::Boot, "/boot", FsKind::Vfat, "ABCD-1234", boot),
        ];
        let ops = [BlockOp::LvmActivate {
            uuid: "lv".to_string(),
            group: "vg".to_string(),
            name: "root".to_string(),
        }];

        let text = startup_rc(&mps, &topology, &ModuleClosure::new(), &ops, "");
        assert!(text.contains("mount-btrfs ./sysroot \"rw\" m1 m2\n"));
        assert!(text.contains("mount -t vfat -o \"rw\" \"ABCD-1234\" \"./sysroot/boot\"\n"));
        assert!(text.contains("lvm-lv-activate lv vg root\n\n"));
        assert!(!text.contains("insmod"));
        assert!(text.ends_with("switchroot \"./sysroot\"\n"));
        assert_eq!(text, startup_rc(&mps, &topology, &ModuleClosure::new(), &ops, ""));
    }
}
