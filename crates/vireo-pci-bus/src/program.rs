//! Programming: writing finalized base addresses into device BARs and bridge aperture registers.
//!
//! Walks a post-allocation resource tree top-down; every node's absolute address is the parent
//! base plus the offset assigned by the aperture calculator. CardBus bridges use their own
//! window register layout and are handled separately.

use vireo_pci::config::{self, ResourceKind};
use vireo_pci::{AccessError, ConfigAccess};

use crate::device::{DeviceArena, DeviceId, DeviceKind, PciDevice};
use crate::resource::{ResourceNode, ResourceUsage};

/// Programs everything under one root-bridge pool, rooted at `base`.
pub fn program_resources(
    access: &mut dyn ConfigAccess,
    arena: &mut DeviceArena,
    base: u64,
    pool: &ResourceNode,
) -> Result<(), AccessError> {
    for child in &pool.children {
        let Some(owner) = child.owner else { continue };
        // Owners evicted by a late adjustment round leave stale nodes behind; nothing to program.
        let Some(owner_kind) = arena.get(owner).map(|dev| dev.kind) else {
            continue;
        };
        let address = base + child.offset;

        match owner_kind {
            DeviceKind::PciPciBridge if child.bar_index.is_none() => {
                program_resources(access, arena, address, child)?;
                program_ppb_window(access, arena.node(owner), child.kind, address, child.length)?;
            }
            DeviceKind::CardBusBridge if child.usage == ResourceUsage::Padding => {
                program_p2c_window(access, arena.node(owner), child, address)?;
            }
            _ => {
                if child.usage == ResourceUsage::Padding {
                    // Reserved space only; never written to hardware.
                    continue;
                }
                if let Some(bar_index) = child.bar_index {
                    program_bar(access, arena, owner, bar_index, address)?;
                }
            }
        }
    }
    Ok(())
}

/// Closes every aperture window of every bridge under `root` so that windows which end up with
/// no resources do not decode stale ranges; programmed windows are reopened right after.
pub fn close_bridge_windows(
    access: &mut dyn ConfigAccess,
    arena: &DeviceArena,
    root: DeviceId,
) -> Result<(), AccessError> {
    for id in arena.walk(root) {
        let dev = arena.node(id);
        match dev.kind {
            DeviceKind::PciPciBridge => {
                // Base above limit disables a window.
                access.write_u8(dev.bdf, config::IO_BASE, 0xF0)?;
                access.write_u8(dev.bdf, config::IO_LIMIT, 0x00)?;
                access.write_u16(dev.bdf, config::IO_BASE_UPPER16, 0xFFFF)?;
                access.write_u16(dev.bdf, config::IO_LIMIT_UPPER16, 0x0000)?;
                access.write_u16(dev.bdf, config::MEM_BASE, 0xFFF0)?;
                access.write_u16(dev.bdf, config::MEM_LIMIT, 0x0000)?;
                access.write_u16(dev.bdf, config::PREF_MEM_BASE, 0xFFF0)?;
                access.write_u16(dev.bdf, config::PREF_MEM_LIMIT, 0x0000)?;
                access.write_u32(dev.bdf, config::PREF_BASE_UPPER32, 0xFFFF_FFFF)?;
                access.write_u32(dev.bdf, config::PREF_LIMIT_UPPER32, 0x0000_0000)?;
            }
            DeviceKind::CardBusBridge => {
                for (base_reg, limit_reg) in [
                    (config::CARDBUS_MEM_BASE_0, config::CARDBUS_MEM_LIMIT_0),
                    (config::CARDBUS_MEM_BASE_1, config::CARDBUS_MEM_LIMIT_1),
                    (config::CARDBUS_IO_BASE_0, config::CARDBUS_IO_LIMIT_0),
                    (config::CARDBUS_IO_BASE_1, config::CARDBUS_IO_LIMIT_1),
                ] {
                    access.write_u32(dev.bdf, base_reg, 0xFFFF_F000)?;
                    access.write_u32(dev.bdf, limit_reg, 0x0000_0000)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn program_bar(
    access: &mut dyn ConfigAccess,
    arena: &mut DeviceArena,
    owner: DeviceId,
    bar_index: usize,
    address: u64,
) -> Result<(), AccessError> {
    let dev = arena.node_mut(owner);
    let bar = &mut dev.bars[bar_index];
    bar.base = address;
    let bdf = dev.bdf;
    let offset = bar.offset;
    let is_64bit = bar.kind.is_64bit();
    tracing::debug!(%bdf, bar = bar_index, address = format_args!("{address:#x}"), "programming BAR");
    access.write_u32(bdf, offset, address as u32)?;
    if is_64bit {
        access.write_u32(bdf, offset + 4, (address >> 32) as u32)?;
    }
    Ok(())
}

fn program_ppb_window(
    access: &mut dyn ConfigAccess,
    dev: &PciDevice,
    kind: ResourceKind,
    base: u64,
    length: u64,
) -> Result<(), AccessError> {
    if length == 0 {
        return Ok(());
    }
    let bdf = dev.bdf;
    let limit = base + length - 1;
    tracing::debug!(
        %bdf,
        %kind,
        base = format_args!("{base:#x}"),
        limit = format_args!("{limit:#x}"),
        "programming bridge aperture"
    );
    match kind {
        ResourceKind::Io => {
            access.write_u8(bdf, config::IO_BASE, ((base >> 8) & 0xF0) as u8)?;
            access.write_u8(bdf, config::IO_LIMIT, ((limit >> 8) & 0xF0) as u8)?;
            access.write_u16(bdf, config::IO_BASE_UPPER16, (base >> 16) as u16)?;
            access.write_u16(bdf, config::IO_LIMIT_UPPER16, (limit >> 16) as u16)?;
        }
        ResourceKind::Mem32 => {
            access.write_u16(bdf, config::MEM_BASE, ((base >> 16) & 0xFFF0) as u16)?;
            access.write_u16(bdf, config::MEM_LIMIT, ((limit >> 16) & 0xFFF0) as u16)?;
        }
        ResourceKind::PMem32 | ResourceKind::PMem64 | ResourceKind::Mem64 => {
            access.write_u16(bdf, config::PREF_MEM_BASE, ((base >> 16) & 0xFFF0) as u16)?;
            access.write_u16(bdf, config::PREF_MEM_LIMIT, ((limit >> 16) & 0xFFF0) as u16)?;
            access.write_u32(bdf, config::PREF_BASE_UPPER32, (base >> 32) as u32)?;
            access.write_u32(bdf, config::PREF_LIMIT_UPPER32, (limit >> 32) as u32)?;
        }
    }
    Ok(())
}

/// CardBus window programming: direct 32-bit base/limit registers per window, with a Bridge
/// Control bit marking each memory window prefetchable or not.
fn program_p2c_window(
    access: &mut dyn ConfigAccess,
    dev: &PciDevice,
    node: &ResourceNode,
    address: u64,
) -> Result<(), AccessError> {
    let window = node.bar_index.expect("CardBus window nodes carry a window index");
    let bdf = dev.bdf;
    let limit = address + node.length - 1;
    let (base_reg, limit_reg) = match window {
        0 => (config::CARDBUS_MEM_BASE_0, config::CARDBUS_MEM_LIMIT_0),
        1 => (config::CARDBUS_MEM_BASE_1, config::CARDBUS_MEM_LIMIT_1),
        2 => (config::CARDBUS_IO_BASE_0, config::CARDBUS_IO_LIMIT_0),
        3 => (config::CARDBUS_IO_BASE_1, config::CARDBUS_IO_LIMIT_1),
        other => panic!("CardBus bridges have four windows, got index {other}"),
    };
    access.write_u32(bdf, base_reg, address as u32)?;
    access.write_u32(bdf, limit_reg, limit as u32)?;

    if window < 2 {
        let prefetch_bit = if window == 0 {
            config::CARDBUS_CTRL_PREFETCH_0
        } else {
            config::CARDBUS_CTRL_PREFETCH_1
        };
        let mut control = access.read_u16(bdf, config::BRIDGE_CONTROL)?;
        if node.kind.is_prefetchable() {
            control |= prefetch_bit;
        } else {
            control &= !prefetch_bit;
        }
        access.write_u16(bdf, config::BRIDGE_CONTROL, control)?;
    }
    Ok(())
}
