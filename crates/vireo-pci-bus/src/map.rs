//! Resource map construction: aggregating device BAR requirements into per-bridge trees.
//!
//! Maps are computed bottom-up: as the recursion unwinds at each bridge level, the bridge's five
//! pools are degraded against its decode capabilities and aperture-calculated before being
//! inserted into the parent's pools.

use vireo_pci::config::ResourceKind;

use crate::aperture::calculate_aperture;
use crate::degrade::degrade_resources;
use crate::device::{DeviceArena, DeviceId, DeviceKind, PciDevice};
use crate::enumerator::EnumerationPolicy;
use crate::resource::ResourceNode;

/// Minimum aperture granularity a PCI-to-PCI bridge can forward.
pub const PPB_IO_ALIGNMENT: u64 = 0xFFF;
pub const PPB_MEM_ALIGNMENT: u64 = 0xF_FFFF;

/// Every CardBus controller exposes two generic memory windows and two generic I/O windows;
/// space is reserved for them regardless of what is plugged in.
const CARDBUS_MEM_WINDOW: u64 = 0x200_0000;
const CARDBUS_IO_WINDOW: u64 = 0x100;

/// Builds the five fully-degraded, aperture-calculated pools for one root bridge.
pub fn build_root_map(
    arena: &DeviceArena,
    policy: &EnumerationPolicy,
    root: DeviceId,
) -> [ResourceNode; 5] {
    let mut io = ResourceNode::bridge_aggregate(root, ResourceKind::Io, PPB_IO_ALIGNMENT);
    let mut mem32 = ResourceNode::bridge_aggregate(root, ResourceKind::Mem32, PPB_MEM_ALIGNMENT);
    let mut pmem32 = ResourceNode::bridge_aggregate(root, ResourceKind::PMem32, PPB_MEM_ALIGNMENT);
    let mut mem64 = ResourceNode::bridge_aggregate(root, ResourceKind::Mem64, PPB_MEM_ALIGNMENT);
    let mut pmem64 = ResourceNode::bridge_aggregate(root, ResourceKind::PMem64, PPB_MEM_ALIGNMENT);

    create_resource_map(
        arena, policy, root, &mut io, &mut mem32, &mut pmem32, &mut mem64, &mut pmem64,
    );

    let decode = arena.node(root).decode;
    degrade_resources(decode, &mut mem32, &mut pmem32, &mut mem64, &mut pmem64);

    for pool in [&mut io, &mut mem32, &mut pmem32, &mut mem64, &mut pmem64] {
        calculate_aperture(pool, policy);
    }

    [io, mem32, pmem32, mem64, pmem64]
}

/// Populates the five pools of `bridge` from its direct children, recursing into child bridges.
#[allow(clippy::too_many_arguments)]
pub fn create_resource_map(
    arena: &DeviceArena,
    policy: &EnumerationPolicy,
    bridge: DeviceId,
    io: &mut ResourceNode,
    mem32: &mut ResourceNode,
    pmem32: &mut ResourceNode,
    mem64: &mut ResourceNode,
    pmem64: &mut ResourceNode,
) {
    for child_id in arena.children(bridge) {
        let dev = arena.node(child_id);

        // The child's own BARs always land in this bridge's pools, bridges included.
        insert_bar_requests(dev, child_id, io, mem32, pmem32, mem64, pmem64);

        match dev.kind {
            DeviceKind::PciPciBridge => {
                let mut cio =
                    ResourceNode::bridge_aggregate(child_id, ResourceKind::Io, PPB_IO_ALIGNMENT);
                let mut cmem32 = ResourceNode::bridge_aggregate(
                    child_id,
                    ResourceKind::Mem32,
                    PPB_MEM_ALIGNMENT,
                );
                let mut cpmem32 = ResourceNode::bridge_aggregate(
                    child_id,
                    ResourceKind::PMem32,
                    PPB_MEM_ALIGNMENT,
                );
                let mut cmem64 = ResourceNode::bridge_aggregate(
                    child_id,
                    ResourceKind::Mem64,
                    PPB_MEM_ALIGNMENT,
                );
                let mut cpmem64 = ResourceNode::bridge_aggregate(
                    child_id,
                    ResourceKind::PMem64,
                    PPB_MEM_ALIGNMENT,
                );

                create_resource_map(
                    arena, policy, child_id, &mut cio, &mut cmem32, &mut cpmem32, &mut cmem64,
                    &mut cpmem64,
                );

                degrade_resources(dev.decode, &mut cmem32, &mut cpmem32, &mut cmem64, &mut cpmem64);

                for aggregate in [&mut cio, &mut cmem32, &mut cpmem32, &mut cmem64, &mut cpmem64] {
                    calculate_aperture(aggregate, policy);
                }

                // Only windows that actually carry requests propagate upstream.
                for (pool, aggregate) in [
                    (&mut *io, cio),
                    (&mut *mem32, cmem32),
                    (&mut *pmem32, cpmem32),
                    (&mut *mem64, cmem64),
                    (&mut *pmem64, cpmem64),
                ] {
                    if !aggregate.is_empty_aggregate() {
                        pool.insert(aggregate);
                    }
                }
            }
            DeviceKind::CardBusBridge => {
                mem32.insert(ResourceNode::padding(
                    child_id,
                    Some(0),
                    ResourceKind::Mem32,
                    CARDBUS_MEM_WINDOW,
                    CARDBUS_MEM_WINDOW - 1,
                ));
                pmem32.insert(ResourceNode::padding(
                    child_id,
                    Some(1),
                    ResourceKind::PMem32,
                    CARDBUS_MEM_WINDOW,
                    CARDBUS_MEM_WINDOW - 1,
                ));
                io.insert(ResourceNode::padding(
                    child_id,
                    Some(2),
                    ResourceKind::Io,
                    CARDBUS_IO_WINDOW,
                    CARDBUS_IO_WINDOW - 1,
                ));
                io.insert(ResourceNode::padding(
                    child_id,
                    Some(3),
                    ResourceKind::Io,
                    CARDBUS_IO_WINDOW,
                    CARDBUS_IO_WINDOW - 1,
                ));
            }
            DeviceKind::Endpoint | DeviceKind::RootBridge => {}
        }

        // Platform-requested headroom reserves space without backing hardware.
        for pad in &dev.padding {
            let pool = match pad.kind {
                ResourceKind::Io => &mut *io,
                ResourceKind::Mem32 => &mut *mem32,
                ResourceKind::PMem32 => &mut *pmem32,
                ResourceKind::Mem64 => &mut *mem64,
                ResourceKind::PMem64 => &mut *pmem64,
            };
            pool.insert(ResourceNode::padding(
                child_id,
                None,
                pad.kind,
                pad.length,
                pad.alignment,
            ));
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn insert_bar_requests(
    dev: &PciDevice,
    id: DeviceId,
    io: &mut ResourceNode,
    mem32: &mut ResourceNode,
    pmem32: &mut ResourceNode,
    mem64: &mut ResourceNode,
    pmem64: &mut ResourceNode,
) {
    for (index, bar) in dev.bars.iter().enumerate() {
        if bar.length == 0 {
            continue;
        }
        let kind = bar.kind.resource_kind();
        let pool = match kind {
            ResourceKind::Io => &mut *io,
            ResourceKind::Mem32 => &mut *mem32,
            ResourceKind::PMem32 => &mut *pmem32,
            ResourceKind::Mem64 => &mut *mem64,
            ResourceKind::PMem64 => &mut *pmem64,
        };
        pool.insert(ResourceNode::bar_leaf(id, index, kind, bar.length, bar.alignment));
    }
}

#[cfg(test)]
mod tests {
    use super::build_root_map;
    use crate::device::{BridgeDecode, DeviceArena, DeviceId, DeviceKind, PciBar, PciDevice};
    use crate::enumerator::EnumerationPolicy;
    use crate::resource::ResourceUsage;
    use vireo_pci::config::{BarKind, ClassCode, ResourceKind};
    use vireo_pci::Bdf;

    fn root_with_decode(arena: &mut DeviceArena, decode: BridgeDecode) -> DeviceId {
        let mut dev = PciDevice::new(
            Bdf::new(0, 0, 0),
            DeviceKind::RootBridge,
            0,
            0,
            ClassCode::from_register(0x0600_0000),
        );
        dev.decode = decode;
        arena.insert_root(dev)
    }

    fn endpoint(arena: &mut DeviceArena, parent: DeviceId, bdf: Bdf, bars: Vec<PciBar>) -> DeviceId {
        let mut dev = PciDevice::new(bdf, DeviceKind::Endpoint, 0x1234, 0x5678, ClassCode::from_register(0));
        dev.bars = bars;
        arena.insert_child(parent, dev)
    }

    fn bar(offset: u16, kind: BarKind, length: u64) -> PciBar {
        PciBar {
            offset,
            kind,
            length,
            alignment: length - 1,
            base: 0,
        }
    }

    #[test]
    fn root_map_length_covers_the_sum_of_requests_and_is_self_aligned() {
        let mut arena = DeviceArena::new();
        let root = root_with_decode(
            &mut arena,
            BridgeDecode::IO16 | BridgeDecode::MEM32 | BridgeDecode::PMEM32,
        );
        endpoint(
            &mut arena,
            root,
            Bdf::new(0, 1, 0),
            vec![
                bar(0x10, BarKind::Mem32, 0x1000),
                bar(0x14, BarKind::Mem64, 0x4000), // degrades into Mem32
            ],
        );
        endpoint(
            &mut arena,
            root,
            Bdf::new(0, 2, 0),
            vec![bar(0x10, BarKind::Mem32, 0x800)],
        );

        let [_, mem32, pmem32, mem64, pmem64] =
            build_root_map(&arena, &EnumerationPolicy::default(), root);

        assert!(pmem32.is_empty_aggregate());
        assert!(mem64.is_empty_aggregate());
        assert!(pmem64.is_empty_aggregate());
        assert!(mem32.length >= 0x1000 + 0x4000 + 0x800);
        assert_eq!(mem32.length & mem32.alignment, 0);
    }

    #[test]
    fn bridge_aggregate_propagates_only_nonempty_pools() {
        let mut arena = DeviceArena::new();
        let root = root_with_decode(
            &mut arena,
            BridgeDecode::IO16 | BridgeDecode::MEM32 | BridgeDecode::PMEM32,
        );
        let mut bridge = PciDevice::new(
            Bdf::new(0, 3, 0),
            DeviceKind::PciPciBridge,
            0x8086,
            0x2448,
            ClassCode::from_register(0x0604_0000),
        );
        bridge.decode = BridgeDecode::MEM32 | BridgeDecode::IO16;
        let bridge = arena.insert_child(root, bridge);
        endpoint(
            &mut arena,
            bridge,
            Bdf::new(1, 0, 0),
            vec![bar(0x10, BarKind::Mem32, 0x2000)],
        );

        let [io, mem32, pmem32, _, _] =
            build_root_map(&arena, &EnumerationPolicy::default(), root);

        assert!(io.is_empty_aggregate());
        assert!(pmem32.is_empty_aggregate());
        assert_eq!(mem32.children.len(), 1);
        let aggregate = &mem32.children[0];
        assert_eq!(aggregate.owner, Some(bridge));
        // The bridge window is 1MiB-granular even though the request is 8KiB.
        assert_eq!(aggregate.length, 0x10_0000);
        assert_eq!(aggregate.alignment, 0xF_FFFF);
        assert_eq!(aggregate.children.len(), 1);
    }

    #[test]
    fn cardbus_reserves_its_four_windows_unconditionally() {
        let mut arena = DeviceArena::new();
        let root = root_with_decode(
            &mut arena,
            BridgeDecode::IO16 | BridgeDecode::MEM32 | BridgeDecode::PMEM32,
        );
        let mut cardbus = PciDevice::new(
            Bdf::new(0, 4, 0),
            DeviceKind::CardBusBridge,
            0x104C,
            0xAC56,
            ClassCode::from_register(0x0607_0000),
        );
        cardbus.decode = BridgeDecode::IO16 | BridgeDecode::MEM32 | BridgeDecode::PMEM32;
        cardbus.bars = vec![bar(0x10, BarKind::Mem32, 0x1000)];
        arena.insert_child(root, cardbus);

        let [io, mem32, pmem32, _, _] =
            build_root_map(&arena, &EnumerationPolicy::default(), root);

        // One 32MiB window per memory pool plus the socket-register BAR in Mem32.
        assert_eq!(mem32.children.len(), 2);
        assert_eq!(pmem32.children.len(), 1);
        assert!(mem32.length >= 0x200_0000 + 0x1000);
        assert_eq!(pmem32.children[0].usage, ResourceUsage::Padding);
        // Two 256-byte I/O windows.
        assert_eq!(io.children.len(), 2);
        assert_eq!(io.children[0].length, 0x100);
    }

    #[test]
    fn platform_padding_reserves_headroom() {
        let mut arena = DeviceArena::new();
        let root = root_with_decode(
            &mut arena,
            BridgeDecode::IO16 | BridgeDecode::MEM32 | BridgeDecode::PMEM32,
        );
        let dev = endpoint(
            &mut arena,
            root,
            Bdf::new(0, 5, 0),
            vec![bar(0x10, BarKind::Mem32, 0x1000)],
        );
        arena.node_mut(dev).padding.push(crate::enumerator::PaddingRequest {
            kind: ResourceKind::Mem32,
            length: 0x10_0000,
            alignment: 0xF_FFFF,
        });

        let [_, mem32, _, _, _] = build_root_map(&arena, &EnumerationPolicy::default(), root);
        assert_eq!(mem32.children.len(), 2);
        assert!(mem32.length >= 0x11_0000);
        assert!(mem32
            .children
            .iter()
            .any(|n| n.usage == ResourceUsage::Padding && n.length == 0x10_0000));
    }
}
