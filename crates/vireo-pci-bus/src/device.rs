//! The device tree built during enumeration.
//!
//! Devices live in an arena and reference each other by index, so the ephemeral resource trees
//! can hold weak references to their owning devices without any shared-ownership machinery.

use bitflags::bitflags;

use vireo_pci::config::{BarKind, ClassCode};
use vireo_pci::Bdf;

use crate::enumerator::PaddingRequest;

bitflags! {
    /// Resource kinds a bridge can independently decode.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct BridgeDecode: u8 {
        const IO16 = 1 << 0;
        const IO32 = 1 << 1;
        const MEM32 = 1 << 2;
        const MEM64 = 1 << 3;
        const PMEM32 = 1 << 4;
        const PMEM64 = 1 << 5;
        /// Prefetchable and non-prefetchable memory share one physical aperture.
        const COMBINE_MEM_PMEM = 1 << 6;
    }
}

/// One discovered BAR: what the function asked for and, eventually, what it was given.
#[derive(Debug, Clone, Copy)]
pub struct PciBar {
    /// Config-space offset of the (low) BAR register.
    pub offset: u16,
    pub kind: BarKind,
    pub length: u64,
    /// Alignment mask (length − 1).
    pub alignment: u64,
    /// Assigned base address, written by the programmer.
    pub base: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeviceKind {
    /// The top of one PCI hierarchy; synthesized, not discovered.
    RootBridge,
    Endpoint,
    PciPciBridge,
    CardBusBridge,
}

impl DeviceKind {
    pub const fn is_bridge(self) -> bool {
        !matches!(self, Self::Endpoint)
    }
}

#[derive(Debug)]
pub struct PciDevice {
    pub bdf: Bdf,
    pub kind: DeviceKind,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: ClassCode,
    pub bars: Vec<PciBar>,
    /// For bridges: which resource kinds this bridge can decode downstream.
    pub decode: BridgeDecode,
    pub secondary_bus: u8,
    pub subordinate_bus: u8,
    pub rom_size: u64,
    /// All address-space requirements of this function are met (possibly vacuously).
    pub allocated: bool,
    /// Survived a full enumeration pass and is usable by drivers.
    pub registered: bool,
    pub padding: Vec<PaddingRequest>,
    parent: Option<DeviceId>,
    children: Vec<DeviceId>,
}

impl PciDevice {
    pub fn new(bdf: Bdf, kind: DeviceKind, vendor_id: u16, device_id: u16, class: ClassCode) -> Self {
        Self {
            bdf,
            kind,
            vendor_id,
            device_id,
            class,
            bars: Vec::new(),
            decode: BridgeDecode::empty(),
            secondary_bus: 0,
            subordinate_bus: 0,
            rom_size: 0,
            allocated: false,
            registered: false,
            padding: Vec::new(),
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn parent(&self) -> Option<DeviceId> {
        self.parent
    }

    pub fn children(&self) -> &[DeviceId] {
        &self.children
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct DeviceId(usize);

/// Arena of device nodes. Removal leaves a tombstone so outstanding `DeviceId`s (e.g. in a
/// resource tree built before an eviction) resolve to `None` instead of a recycled device.
#[derive(Debug, Default)]
pub struct DeviceArena {
    nodes: Vec<Option<PciDevice>>,
}

impl DeviceArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a root node (no parent).
    pub fn insert_root(&mut self, device: PciDevice) -> DeviceId {
        debug_assert!(device.parent.is_none());
        self.nodes.push(Some(device));
        DeviceId(self.nodes.len() - 1)
    }

    /// Inserts a node under `parent`, keeping discovery order.
    pub fn insert_child(&mut self, parent: DeviceId, mut device: PciDevice) -> DeviceId {
        device.parent = Some(parent);
        self.nodes.push(Some(device));
        let id = DeviceId(self.nodes.len() - 1);
        self.node_mut(parent).children.push(id);
        id
    }

    pub fn get(&self, id: DeviceId) -> Option<&PciDevice> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut PciDevice> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Panicking accessor for ids the caller knows are live.
    pub fn node(&self, id: DeviceId) -> &PciDevice {
        self.get(id).expect("stale device id")
    }

    pub fn node_mut(&mut self, id: DeviceId) -> &mut PciDevice {
        self.get_mut(id).expect("stale device id")
    }

    pub fn children(&self, id: DeviceId) -> Vec<DeviceId> {
        self.node(id).children.clone()
    }

    /// Removes a device and its whole subtree, unlinking it from its parent.
    pub fn remove_subtree(&mut self, id: DeviceId) {
        let Some(node) = self.nodes.get_mut(id.0).and_then(Option::take) else {
            return;
        };
        if let Some(parent) = node.parent {
            if let Some(parent) = self.get_mut(parent) {
                parent.children.retain(|&child| child != id);
            }
        }
        for child in node.children {
            self.remove_descendants(child);
        }
    }

    fn remove_descendants(&mut self, id: DeviceId) {
        let Some(node) = self.nodes.get_mut(id.0).and_then(Option::take) else {
            return;
        };
        for child in node.children {
            self.remove_descendants(child);
        }
    }

    /// Depth-first walk of a subtree, root included, in discovery order.
    pub fn walk(&self, root: DeviceId) -> Vec<DeviceId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if self.get(id).is_none() {
                continue;
            }
            out.push(id);
            let node = self.node(id);
            for &child in node.children.iter().rev() {
                stack.push(child);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::{DeviceArena, DeviceKind, PciDevice};
    use vireo_pci::config::ClassCode;
    use vireo_pci::Bdf;

    fn dev(bus: u8, device: u8) -> PciDevice {
        PciDevice::new(
            Bdf::new(bus, device, 0),
            DeviceKind::Endpoint,
            0x1234,
            0x5678,
            ClassCode::from_register(0),
        )
    }

    fn bridge(bus: u8, device: u8) -> PciDevice {
        PciDevice::new(
            Bdf::new(bus, device, 0),
            DeviceKind::PciPciBridge,
            0x8086,
            0x2448,
            ClassCode::from_register(0x0604_0000),
        )
    }

    #[test]
    fn subtree_removal_tombstones_every_descendant() {
        let mut arena = DeviceArena::new();
        let root = arena.insert_root(bridge(0, 0));
        let b = arena.insert_child(root, bridge(0, 1));
        let leaf = arena.insert_child(b, dev(1, 0));
        let sibling = arena.insert_child(root, dev(0, 2));

        arena.remove_subtree(b);

        assert!(arena.get(b).is_none());
        assert!(arena.get(leaf).is_none());
        assert!(arena.get(sibling).is_some());
        assert_eq!(arena.children(root), vec![sibling]);
    }

    #[test]
    fn walk_visits_in_discovery_order() {
        let mut arena = DeviceArena::new();
        let root = arena.insert_root(bridge(0, 0));
        let a = arena.insert_child(root, dev(0, 1));
        let b = arena.insert_child(root, bridge(0, 2));
        let ba = arena.insert_child(b, dev(1, 0));
        let c = arena.insert_child(root, dev(0, 3));

        assert_eq!(arena.walk(root), vec![root, a, b, ba, c]);
    }
}
