use std::collections::HashSet;
use std::fmt;

use crate::error::{Error, Result};
use crate::topology::{DiskKind, DiskTopology, MountPoint};

/// Block device activation step run by the initramfs before mounting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlockOp {
    LvmActivate {
        uuid: String,
        group: String,
        name: String,
    },
    BcacheCacheActivate {
        uuid: String,
    },
    BcacheBackingActivate {
        uuid: String,
        backing_uuid: String,
    },
}

impl fmt::Display for BlockOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockOp::LvmActivate { uuid, group, name } => {
                write!(f, "lvm-lv-activate {} {} {}", uuid, group, name)
            }
            BlockOp::BcacheCacheActivate { uuid } => {
                write!(f, "bcache-cache-device-activate {}", uuid)
            }
            BlockOp::BcacheBackingActivate { uuid, backing_uuid } => {
                write!(f, "bcache-backing-device-activate {} {}", uuid, backing_uuid)
            }
        }
    }
}

/// Activation steps for every disk under `mount_points`, lower devices
/// first, each at most once.
pub fn block_ops(mount_points: &[MountPoint], topology: &DiskTopology) -> Result<Vec<BlockOp>> {
    let mut ops = Vec::new();
    let mut seen_disks = HashSet::new();
    let mut seen_ops = HashSet::new();

    for mp in mount_points {
        for id in topology.post_order(mp.disk) {
            if !seen_disks.insert(id) {
                continue;
            }
            let node = topology.node(id);
            let node_ops = match &node.kind {
                DiskKind::LogicalVolume { group, name } => vec![BlockOp::LvmActivate {
                    uuid: node.uuid.clone(),
                    group: group.clone(),
                    name: name.clone(),
                }],
                DiskKind::CacheVolume => {
                    let mut v: Vec<BlockOp> = topology
                        .cache_members(id)
                        .into_iter()
                        .map(|c| BlockOp::BcacheCacheActivate {
                            uuid: topology.node(c).uuid.clone(),
                        })
                        .collect();
                    let backing = topology.backing_member(id).ok_or_else(|| {
                        Error::config(format!("cache volume {} has no backing device", node.uuid))
                    })?;
                    v.push(BlockOp::BcacheBackingActivate {
                        uuid: node.uuid.clone(),
                        backing_uuid: topology.node(backing).uuid.clone(),
                    });
                    v
                }
                DiskKind::RawDisk { .. }
                | DiskKind::Partition { .. }
                | DiskKind::RaidAggregate { .. } => Vec::new(),
            };
            for op in node_ops {
                if seen_ops.insert(op.clone()) {
                    ops.push(op);
                }
            }
        }
    }
    Ok(ops)
}
