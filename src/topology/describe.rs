//! Serialized form of a disk stack, as written in a host description file.
//!
//! ```toml
//! [mount_points.disk]
//! type = "lvm"
//! uuid = "..."
//! group = "hdd"
//! name = "root"
//!
//! [[mount_points.disk.children]]
//! type = "partition"
//! uuid = "..."
//! scheme = "gpt"
//! ```

use serde::{Deserialize, Serialize};

use super::{DiskBus, DiskId, DiskKind, DiskRole, DiskTopology, PartitionScheme, RaidKind};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleDescription {
    Member,
    Cache,
    Backing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiskKindDescription {
    Scsi { host_controller: String },
    Nvme,
    Xen,
    Virtio,
    Partition { scheme: SchemeDescription },
    Lvm { group: String, name: String },
    Bcache,
    BtrfsRaid,
    BcachefsRaid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemeDescription {
    Mbr,
    Gpt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescription {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<RoleDescription>,
    #[serde(flatten)]
    pub kind: DiskKindDescription,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DiskDescription>,
}

impl DiskKindDescription {
    fn to_kind(&self) -> DiskKind {
        match self {
            DiskKindDescription::Scsi { host_controller } => DiskKind::RawDisk {
                bus: DiskBus::Scsi {
                    host_controller: host_controller.clone(),
                },
            },
            DiskKindDescription::Nvme => DiskKind::RawDisk { bus: DiskBus::Nvme },
            DiskKindDescription::Xen => DiskKind::RawDisk { bus: DiskBus::Xen },
            DiskKindDescription::Virtio => DiskKind::RawDisk {
                bus: DiskBus::Virtio,
            },
            DiskKindDescription::Partition { scheme } => DiskKind::Partition {
                scheme: match scheme {
                    SchemeDescription::Mbr => PartitionScheme::Mbr,
                    SchemeDescription::Gpt => PartitionScheme::Gpt,
                },
            },
            DiskKindDescription::Lvm { group, name } => DiskKind::LogicalVolume {
                group: group.clone(),
                name: name.clone(),
            },
            DiskKindDescription::Bcache => DiskKind::CacheVolume,
            DiskKindDescription::BtrfsRaid => DiskKind::RaidAggregate {
                kind: RaidKind::Btrfs,
            },
            DiskKindDescription::BcachefsRaid => DiskKind::RaidAggregate {
                kind: RaidKind::Bcachefs,
            },
        }
    }
}

impl DiskDescription {
    /// Append this stack to `topology`, returning the id of its top node.
    pub fn insert_into(&self, topology: &mut DiskTopology) -> Result<DiskId> {
        let root = topology.add_root(self.uuid.clone(), self.kind.to_kind());
        self.insert_children(topology, root)?;
        Ok(root)
    }

    fn insert_children(&self, topology: &mut DiskTopology, id: DiskId) -> Result<()> {
        for child in &self.children {
            let role = match child.role {
                None | Some(RoleDescription::Member) => DiskRole::Member,
                Some(RoleDescription::Cache) => DiskRole::Cache,
                Some(RoleDescription::Backing) => DiskRole::Backing,
            };
            let child_id =
                topology.add_child(id, role, child.uuid.clone(), child.kind.to_kind())?;
            child.insert_children(topology, child_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_tree_becomes_arena() {
        let text = r#"
            type = "bcache"
            uuid = "bc"

            [[children]]
            type = "nvme"
            uuid = "ssd"
            role = "cache"

            [[children]]
            type = "partition"
            uuid = "hdd1"
            role = "backing"
            scheme = "gpt"

            [[children.children]]
            type = "scsi"
            uuid = "hdd"
            host_controller = "ahci"
        "#;
        let desc: DiskDescription = toml::from_str(text).unwrap();
        let mut topo = DiskTopology::new();
        let root = desc.insert_into(&mut topo).unwrap();

        assert_eq!(topo.len(), 4);
        assert_eq!(topo.node(root).kind, DiskKind::CacheVolume);
        let backing = topo.backing_member(root).unwrap();
        assert_eq!(topo.node(backing).uuid, "hdd1");
        assert_eq!(topo.cache_members(root).len(), 1);
    }
}
