//! Property tests for the map builder / degrader / aperture calculator stack.

use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

use vireo_pci::config::{BarKind, ClassCode, ResourceKind};
use vireo_pci::Bdf;
use vireo_pci_bus::device::{BridgeDecode, DeviceArena, DeviceId, PciBar, PciDevice};
use vireo_pci_bus::map::{build_root_map, PPB_IO_ALIGNMENT, PPB_MEM_ALIGNMENT};
use vireo_pci_bus::{DeviceKind, EnumerationPolicy, ResourceNode};

fn bar_kind(index: usize) -> BarKind {
    match index {
        0 => BarKind::Io16,
        1 => BarKind::Mem32,
        2 => BarKind::PMem32,
        3 => BarKind::Mem64,
        _ => BarKind::PMem64,
    }
}

fn make_root(arena: &mut DeviceArena, decode: BridgeDecode) -> DeviceId {
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

fn add_leaf(arena: &mut DeviceArena, parent: DeviceId, bdf: Bdf, bars: &[(usize, u32)]) {
    let mut dev = PciDevice::new(bdf, DeviceKind::Endpoint, 0x1234, 0x5678, ClassCode::from_register(0));
    dev.bars = bars
        .iter()
        .enumerate()
        .map(|(index, &(kind, exp))| {
            let length = 1u64 << exp;
            PciBar {
                offset: 0x10 + 4 * index as u16,
                kind: bar_kind(kind),
                length,
                alignment: length - 1,
                base: 0,
            }
        })
        .collect();
    arena.insert_child(parent, dev);
}

/// Alignment and non-overlap invariants, checked over the whole tree.
fn check_node(node: &ResourceNode) -> Result<(), TestCaseError> {
    let mut children: Vec<&ResourceNode> = node.children.iter().collect();
    children.sort_by_key(|child| child.offset);

    let mut previous_end = 0u64;
    let mut total = 0u64;
    for child in children {
        prop_assert_eq!(
            child.offset & child.alignment,
            0,
            "offset {:#x} violates alignment mask {:#x}",
            child.offset,
            child.alignment
        );
        prop_assert!(
            child.offset >= previous_end,
            "[{:#x}, {:#x}) overlaps the previous sibling ending at {:#x}",
            child.offset,
            child.offset + child.length,
            previous_end
        );
        previous_end = child.offset + child.length;
        total += child.length;
        check_node(child)?;
    }

    if !node.children.is_empty() {
        prop_assert!(previous_end <= node.length);
        prop_assert!(total <= node.length);
    }
    Ok(())
}

proptest! {
    #[test]
    fn packed_pools_are_aligned_and_disjoint(
        root_bars in prop::collection::vec((0usize..5, 4u32..24), 1..10),
        bridge_bars in prop::collection::vec((0usize..5, 4u32..20), 0..8),
        decode_bits in 0u8..0x80,
    ) {
        let mut arena = DeviceArena::new();
        // Whatever else the root claims to decode, Mem32 and I/O are always there.
        let decode = BridgeDecode::from_bits_truncate(decode_bits)
            | BridgeDecode::MEM32
            | BridgeDecode::IO16;
        let root = make_root(&mut arena, decode);

        for (slot, bar) in root_bars.iter().enumerate() {
            add_leaf(&mut arena, root, Bdf::new(0, 1 + slot as u8, 0), &[*bar]);
        }

        if !bridge_bars.is_empty() {
            let mut bridge = PciDevice::new(
                Bdf::new(0, 20, 0),
                DeviceKind::PciPciBridge,
                0x8086,
                0x2448,
                ClassCode::from_register(0x0604_0000),
            );
            bridge.decode = BridgeDecode::MEM32 | BridgeDecode::IO16 | BridgeDecode::PMEM32;
            bridge.secondary_bus = 1;
            let bridge = arena.insert_child(root, bridge);
            for (slot, bar) in bridge_bars.iter().enumerate() {
                add_leaf(&mut arena, bridge, Bdf::new(1, slot as u8, 0), &[*bar]);
            }
        }

        let pools = build_root_map(&arena, &EnumerationPolicy::default(), root);
        for pool in &pools {
            check_node(pool)?;
            // Pools are granular at the bridge minimum even after alignment adoption.
            let granule = if pool.kind == ResourceKind::Io {
                PPB_IO_ALIGNMENT
            } else {
                PPB_MEM_ALIGNMENT
            };
            prop_assert_eq!(pool.length & granule, 0);
        }
    }

    #[test]
    fn degraded_trees_never_lose_requests(
        root_bars in prop::collection::vec((0usize..5, 4u32..24), 1..10),
        decode_bits in 0u8..0x80,
    ) {
        let mut arena = DeviceArena::new();
        let decode = BridgeDecode::from_bits_truncate(decode_bits)
            | BridgeDecode::MEM32
            | BridgeDecode::IO16;
        let root = make_root(&mut arena, decode);
        for (slot, bar) in root_bars.iter().enumerate() {
            add_leaf(&mut arena, root, Bdf::new(0, 1 + slot as u8, 0), &[*bar]);
        }

        let pools = build_root_map(&arena, &EnumerationPolicy::default(), root);
        let leaves: usize = pools.iter().map(count_leaves).sum();
        prop_assert_eq!(leaves, root_bars.len());
    }
}

fn count_leaves(node: &ResourceNode) -> usize {
    if node.children.is_empty() {
        usize::from(node.bar_index.is_some())
    } else {
        node.children.iter().map(count_leaves).sum()
    }
}

/// The round-trip bound of a crafted request set: the Mem32 pool covers the sum of every
/// Mem32-compatible request and stays aligned to the computed pool alignment.
#[test]
fn mem32_round_trip_bound() {
    let mut arena = DeviceArena::new();
    let root = make_root(&mut arena, BridgeDecode::MEM32 | BridgeDecode::IO16);
    // Mem32, PMem32, Mem64 and PMem64 requests: with a Mem32-only root they all degrade into
    // the Mem32 pool.
    add_leaf(&mut arena, root, Bdf::new(0, 1, 0), &[(1, 12)]);
    add_leaf(&mut arena, root, Bdf::new(0, 2, 0), &[(2, 16)]);
    add_leaf(&mut arena, root, Bdf::new(0, 3, 0), &[(3, 14)]);
    add_leaf(&mut arena, root, Bdf::new(0, 4, 0), &[(4, 20)]);

    let [_, mem32, pmem32, mem64, pmem64] =
        build_root_map(&arena, &EnumerationPolicy::default(), root);

    assert!(pmem32.is_empty_aggregate());
    assert!(mem64.is_empty_aggregate());
    assert!(pmem64.is_empty_aggregate());

    let total: u64 = (1 << 12) + (1 << 16) + (1 << 14) + (1 << 20);
    assert!(mem32.length >= total);
    assert_eq!(mem32.length & mem32.alignment, 0);
}
