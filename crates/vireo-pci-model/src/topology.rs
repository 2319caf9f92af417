//! Physical PCI topologies and config-cycle routing.
//!
//! Devices are placed by physical position (slot/function under the root bus or under a bridge),
//! not by bus number: bus numbers only exist once an enumerator programs them. Config cycles for
//! a non-root bus reach a device only by routing through a bridge whose secondary/subordinate
//! window covers that bus, which is exactly how the transitional subordinate=0xFF trick works on
//! real hardware.

use std::collections::{BTreeMap, BTreeSet};

use vireo_pci::config::HeaderKind;
use vireo_pci::{AccessError, AccessWidth, Bdf, ConfigAccess};

use crate::ModelConfigSpace;

/// One physical device (a single function) plus, for bridges, the slots behind it.
#[derive(Debug, Clone)]
pub struct ModelDevice {
    pub config: ModelConfigSpace,
    children: BTreeMap<(u8, u8), ModelDevice>,
}

impl ModelDevice {
    pub fn new(config: ModelConfigSpace) -> Self {
        Self {
            config,
            children: BTreeMap::new(),
        }
    }

    /// Places a device at (slot, function) on this bridge's secondary side.
    pub fn add_child(&mut self, slot: u8, function: u8, device: ModelDevice) -> &mut ModelDevice {
        assert_ne!(
            self.config.header_kind(),
            HeaderKind::Endpoint,
            "only bridges have a secondary side"
        );
        assert!(slot < 32 && function < 8);
        let prev = self.children.insert((slot, function), device);
        assert!(prev.is_none(), "slot {slot}.{function} already populated");
        self.children.get_mut(&(slot, function)).expect("just inserted")
    }

    fn is_routing_bridge(&self) -> bool {
        self.config.header_kind() != HeaderKind::Endpoint
    }
}

/// A host-bridge-worth of physical topology implementing [`ConfigAccess`].
#[derive(Debug, Clone, Default)]
pub struct ModelTopology {
    root_bus: u8,
    slots: BTreeMap<(u8, u8), ModelDevice>,
    faults: BTreeSet<Bdf>,
}

impl ModelTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root_bus(root_bus: u8) -> Self {
        Self {
            root_bus,
            ..Self::default()
        }
    }

    pub fn root_bus(&self) -> u8 {
        self.root_bus
    }

    /// Places a device at (slot, function) directly on the root bus.
    pub fn add_root_device(&mut self, slot: u8, function: u8, device: ModelDevice) -> &mut ModelDevice {
        assert!(slot < 32 && function < 8);
        let prev = self.slots.insert((slot, function), device);
        assert!(prev.is_none(), "slot {slot}.{function} already populated");
        self.slots.get_mut(&(slot, function)).expect("just inserted")
    }

    /// Makes every config access to `bdf` fail with a transport fault.
    pub fn inject_fault(&mut self, bdf: Bdf) {
        self.faults.insert(bdf);
    }

    /// Looks a device up by physical path: each element is the (slot, function) to take at that
    /// level, starting from the root bus.
    pub fn device(&self, path: &[(u8, u8)]) -> &ModelDevice {
        let (first, rest) = path.split_first().expect("empty device path");
        let mut node = self.slots.get(first).expect("no device at path root");
        for step in rest {
            node = node.children.get(step).expect("no device at path step");
        }
        node
    }

    fn route_mut(&mut self, bdf: Bdf) -> Option<&mut ModelDevice> {
        if bdf.bus == self.root_bus {
            return self.slots.get_mut(&(bdf.device, bdf.function));
        }
        Self::descend(&mut self.slots, bdf)
    }

    fn descend(
        slots: &mut BTreeMap<(u8, u8), ModelDevice>,
        bdf: Bdf,
    ) -> Option<&mut ModelDevice> {
        for node in slots.values_mut() {
            if !node.is_routing_bridge() {
                continue;
            }
            let secondary = node.config.secondary_bus();
            let subordinate = node.config.subordinate_bus();
            if secondary == 0 || bdf.bus < secondary || bdf.bus > subordinate {
                continue;
            }
            if bdf.bus == secondary {
                return node.children.get_mut(&(bdf.device, bdf.function));
            }
            return Self::descend(&mut node.children, bdf);
        }
        None
    }
}

impl ConfigAccess for ModelTopology {
    fn read(&mut self, bdf: Bdf, offset: u16, width: AccessWidth) -> Result<u32, AccessError> {
        if self.faults.contains(&bdf) {
            return Err(AccessError::Fault);
        }
        match self.route_mut(bdf) {
            Some(node) => Ok(node.config.read(offset, width)),
            None => Err(AccessError::NoDevice),
        }
    }

    fn write(
        &mut self,
        bdf: Bdf,
        offset: u16,
        width: AccessWidth,
        value: u32,
    ) -> Result<(), AccessError> {
        if self.faults.contains(&bdf) {
            return Err(AccessError::Fault);
        }
        match self.route_mut(bdf) {
            Some(node) => {
                node.config.write(offset, width, value);
                Ok(())
            }
            None => Err(AccessError::NoDevice),
        }
    }
}
