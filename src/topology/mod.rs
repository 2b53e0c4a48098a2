//! Disk topology model.
//!
//! The storage stack under every mount point is kept in an arena: each node
//! stores its kind, its filesystem/volume UUID, the index of the node it
//! feeds (its parent) and the role it plays for that parent. A cache volume
//! therefore has one `Backing` child and any number of `Cache` children.
//!
//! ```text
//! LogicalVolume (root mount)
//!   └── Partition (GPT)          role: Member
//!         └── RawDisk (scsi/ahci) role: Member
//! ```
//!
//! Nodes are only ever appended, a child is always added after its parent,
//! and a UUID may not repeat along one composition path, so the structure
//! is acyclic by construction. Nothing is mutated after discovery.

mod describe;
mod mount;
pub mod probe;

pub use describe::{DiskDescription, DiskKindDescription};
pub use mount::{FsKind, MountPoint, MountRole};

use crate::error::{Error, Result};

/// Index of a node inside a [`DiskTopology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiskId(usize);

/// How a child device contributes to the node it feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskRole {
    /// Plain stacking (partition on disk, PV under LV, RAID member).
    Member,
    /// Cache device of a cache volume.
    Cache,
    /// Backing device of a cache volume.
    Backing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionScheme {
    Mbr,
    Gpt,
}

impl PartitionScheme {
    /// Module needed to parse the partition table.
    ///
    /// Both msdos and EFI partition table parsing are built into the block
    /// layer of every kernel this tool supports.
    pub fn module_alias(&self) -> Option<&'static str> {
        match self {
            PartitionScheme::Mbr => None,
            PartitionScheme::Gpt => None,
        }
    }
}

/// Bus family of a whole disk; decides its controller and block driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DiskBus {
    /// SCSI/SATA disk behind the named host controller driver (e.g. `ahci`).
    Scsi { host_controller: String },
    Nvme,
    Xen,
    Virtio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RaidKind {
    Btrfs,
    Bcachefs,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DiskKind {
    RawDisk { bus: DiskBus },
    Partition { scheme: PartitionScheme },
    LogicalVolume { group: String, name: String },
    CacheVolume,
    RaidAggregate { kind: RaidKind },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskNode {
    pub uuid: String,
    pub kind: DiskKind,
    parent: Option<DiskId>,
    role: DiskRole,
}

impl DiskNode {
    pub fn parent(&self) -> Option<DiskId> {
        self.parent
    }

    pub fn role(&self) -> DiskRole {
        self.role
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskTopology {
    nodes: Vec<DiskNode>,
}

impl DiskTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the top node of a stack (the device a filesystem sits on).
    pub fn add_root(&mut self, uuid: impl Into<String>, kind: DiskKind) -> DiskId {
        self.nodes.push(DiskNode {
            uuid: uuid.into(),
            kind,
            parent: None,
            role: DiskRole::Member,
        });
        DiskId(self.nodes.len() - 1)
    }

    /// Add a device feeding `parent`.
    pub fn add_child(
        &mut self,
        parent: DiskId,
        role: DiskRole,
        uuid: impl Into<String>,
        kind: DiskKind,
    ) -> Result<DiskId> {
        let uuid = uuid.into();
        let parent_node = self
            .nodes
            .get(parent.0)
            .ok_or_else(|| Error::config(format!("disk node {:?} does not exist", parent)))?;

        match (&parent_node.kind, role) {
            (DiskKind::CacheVolume, DiskRole::Cache) => {}
            (DiskKind::CacheVolume, DiskRole::Backing) => {
                if self.backing_member(parent).is_some() {
                    return Err(Error::config(format!(
                        "cache volume {} already has a backing device",
                        parent_node.uuid
                    )));
                }
            }
            (DiskKind::CacheVolume, DiskRole::Member) => {
                return Err(Error::config(format!(
                    "child {} of cache volume {} must be a cache or backing device",
                    uuid, parent_node.uuid
                )));
            }
            (_, DiskRole::Member) => {}
            (_, _) => {
                return Err(Error::config(format!(
                    "disk {} is not a cache volume, {} cannot be its cache/backing device",
                    parent_node.uuid, uuid
                )));
            }
        }

        if self.ancestors(parent).any(|id| self.nodes[id.0].uuid == uuid) {
            return Err(Error::config(format!(
                "disk {} appears twice in the same composition path",
                uuid
            )));
        }

        self.nodes.push(DiskNode {
            uuid,
            kind,
            parent: Some(parent),
            role,
        });
        Ok(DiskId(self.nodes.len() - 1))
    }

    /// Panics if `id` belongs to another topology; [`contains`](Self::contains)
    /// checks first.
    pub fn node(&self, id: DiskId) -> &DiskNode {
        &self.nodes[id.0]
    }

    pub fn contains(&self, id: DiskId) -> bool {
        id.0 < self.nodes.len()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// `id` followed by every node above it.
    fn ancestors(&self, id: DiskId) -> impl Iterator<Item = DiskId> + '_ {
        std::iter::successors(Some(id), move |cur| self.nodes[cur.0].parent)
    }

    /// Direct children in insertion order.
    pub fn children(&self, id: DiskId) -> Vec<DiskId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.parent == Some(id))
            .map(|(i, _)| DiskId(i))
            .collect()
    }

    pub fn cache_members(&self, id: DiskId) -> Vec<DiskId> {
        self.children(id)
            .into_iter()
            .filter(|c| self.nodes[c.0].role == DiskRole::Cache)
            .collect()
    }

    pub fn backing_member(&self, id: DiskId) -> Option<DiskId> {
        self.children(id)
            .into_iter()
            .find(|c| self.nodes[c.0].role == DiskRole::Backing)
    }

    /// Post-order walk of the stack rooted at `root`: lower devices first.
    pub fn post_order(&self, root: DiskId) -> Vec<DiskId> {
        let mut out = Vec::new();
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                out.push(id);
                continue;
            }
            stack.push((id, true));
            for child in self.children(id).into_iter().rev() {
                stack.push((child, false));
            }
        }
        out
    }
}
