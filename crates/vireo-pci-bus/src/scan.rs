//! Bus scanning: device discovery, BAR probing, and bridge bus-number assignment.
//!
//! One depth-first pass does both jobs. Bridges are given their secondary bus number the moment
//! they are found, with the subordinate register held at 0xFF so config cycles route downstream
//! while the true extent of the subtree is still unknown; the real subordinate is written back
//! once the recursion returns.

use vireo_pci::config::{self, decode_bar, decode_rom_mask, ClassCode, HeaderKind};
use vireo_pci::{AccessError, Bdf, ConfigAccess};

use crate::device::{BridgeDecode, DeviceArena, DeviceId, DeviceKind, PciBar, PciDevice};
use crate::enumerator::PlatformPolicy;
use crate::error::{EnumerationError, Result};

/// Scans the buses below a root bridge, populating the arena and assigning bus numbers.
///
/// Returns the subordinate (highest consumed) bus number of the whole hierarchy.
pub fn scan_root(
    access: &mut dyn ConfigAccess,
    arena: &mut DeviceArena,
    platform: &dyn PlatformPolicy,
    root: DeviceId,
    start_bus: u8,
) -> Result<u8> {
    arena.node_mut(root).secondary_bus = start_bus;
    let mut next_free_bus = start_bus;
    let subordinate = scan_bridge(access, arena, platform, root, start_bus, &mut next_free_bus)?;
    arena.node_mut(root).subordinate_bus = subordinate;
    Ok(subordinate)
}

fn scan_bridge(
    access: &mut dyn ConfigAccess,
    arena: &mut DeviceArena,
    platform: &dyn PlatformPolicy,
    parent: DeviceId,
    bus: u8,
    next_free_bus: &mut u8,
) -> Result<u8> {
    let mut subordinate = bus;

    for device in 0..32u8 {
        let mut multifunction = false;
        for function in 0..8u8 {
            if function > 0 && !multifunction {
                break;
            }
            let bdf = Bdf::new(bus, device, function);

            let collected = match collect_function(access, platform, bdf) {
                Ok(Some(collected)) => collected,
                // An empty slot; nothing at the remaining functions of this slot either unless
                // function 0 said multi-function.
                Ok(None) => {
                    if function == 0 {
                        break;
                    }
                    continue;
                }
                // A transport fault is fatal to this function only; siblings continue.
                Err(err) => {
                    tracing::warn!(%bdf, %err, "config fault while collecting device info");
                    if function == 0 {
                        break;
                    }
                    continue;
                }
            };

            if function == 0 {
                multifunction = collected.multifunction;
            }
            let kind = collected.device.kind;
            tracing::debug!(
                %bdf,
                vendor = format_args!("{:04x}", collected.device.vendor_id),
                device = format_args!("{:04x}", collected.device.device_id),
                ?kind,
                "found function"
            );
            let id = arena.insert_child(parent, collected.device);

            if matches!(kind, DeviceKind::PciPciBridge | DeviceKind::CardBusBridge) {
                let secondary = next_free_bus
                    .checked_add(1)
                    .ok_or(EnumerationError::BusNumbersExhausted)?;
                *next_free_bus = secondary;

                // Bus-number writes failing is fatal to the whole host bridge: a bridge left with
                // stale routing cannot be scanned around.
                access.write_u8(bdf, config::PRIMARY_BUS, bus)?;
                access.write_u8(bdf, config::SECONDARY_BUS, secondary)?;
                access.write_u8(bdf, config::SUBORDINATE_BUS, 0xFF)?;
                arena.node_mut(id).secondary_bus = secondary;

                let sub = scan_bridge(access, arena, platform, id, secondary, next_free_bus)?;
                access.write_u8(bdf, config::SUBORDINATE_BUS, sub)?;
                arena.node_mut(id).subordinate_bus = sub;
                tracing::debug!(%bdf, secondary, subordinate = sub, "bridge buses assigned");
                subordinate = subordinate.max(sub);
            }
        }
    }

    Ok(subordinate)
}

struct CollectedFunction {
    device: PciDevice,
    multifunction: bool,
}

/// Probes one function. `Ok(None)` means nothing responded at this address.
fn collect_function(
    access: &mut dyn ConfigAccess,
    platform: &dyn PlatformPolicy,
    bdf: Bdf,
) -> std::result::Result<Option<CollectedFunction>, AccessError> {
    let vendor_id = match access.read_u16(bdf, config::VENDOR_ID) {
        Ok(0xFFFF) | Err(AccessError::NoDevice) => return Ok(None),
        Ok(v) => v,
        Err(err) => return Err(err),
    };
    let device_id = access.read_u16(bdf, config::DEVICE_ID)?;
    let class = ClassCode::from_register(access.read_u32(bdf, config::CLASS_REVISION)?);
    let header_type = access.read_u8(bdf, config::HEADER_TYPE)?;
    // Unknown header shapes are treated as plain endpoints.
    let header = HeaderKind::from_header_type(header_type).unwrap_or(HeaderKind::Endpoint);
    let kind = match header {
        HeaderKind::Endpoint => DeviceKind::Endpoint,
        HeaderKind::PciPciBridge => DeviceKind::PciPciBridge,
        HeaderKind::CardBusBridge => DeviceKind::CardBusBridge,
    };

    let mut device = PciDevice::new(bdf, kind, vendor_id, device_id, class);
    device.bars = probe_bars(access, bdf, header)?;
    if let Some(rom_offset) = header.rom_bar_offset() {
        device.rom_size = probe_rom(access, bdf, rom_offset)?;
    }
    device.decode = match kind {
        DeviceKind::PciPciBridge => gather_ppb_decode(access, bdf)?,
        DeviceKind::CardBusBridge => {
            BridgeDecode::IO16 | BridgeDecode::MEM32 | BridgeDecode::PMEM32
        }
        _ => BridgeDecode::empty(),
    };
    device.padding = platform.resource_padding(bdf, class);

    // Nothing to place: the function is trivially allocated.
    if kind == DeviceKind::Endpoint && device.bars.is_empty() {
        device.allocated = true;
    }

    Ok(Some(CollectedFunction {
        device,
        multifunction: header_type & config::HEADER_TYPE_MULTIFUNCTION != 0,
    }))
}

/// Size-probes every BAR of a function, restoring original contents afterwards.
fn probe_bars(
    access: &mut dyn ConfigAccess,
    bdf: Bdf,
    header: HeaderKind,
) -> std::result::Result<Vec<PciBar>, AccessError> {
    let count = header.bar_count();
    let mut bars = Vec::new();
    let mut index = 0;
    while index < count {
        let offset = config::bar_offset(index);
        let original = access.read_u32(bdf, offset)?;
        access.write_u32(bdf, offset, 0xFFFF_FFFF)?;
        let mask = access.read_u32(bdf, offset)?;

        // A 64-bit memory BAR consumes the next slot as the high half of its size mask; both
        // halves must be probed before either can be decoded.
        let is_mem64 = mask & 0x1 == 0 && (mask >> 1) & 0x3 == 0x2;
        let decoded = if is_mem64 && index + 1 < count {
            let high_offset = config::bar_offset(index + 1);
            let original_high = access.read_u32(bdf, high_offset)?;
            access.write_u32(bdf, high_offset, 0xFFFF_FFFF)?;
            let mask_high = access.read_u32(bdf, high_offset)?;
            access.write_u32(bdf, offset, original)?;
            access.write_u32(bdf, high_offset, original_high)?;
            decode_bar(mask, Some(mask_high))
        } else {
            access.write_u32(bdf, offset, original)?;
            decode_bar(mask, None)
        };

        if let Some(decoded) = decoded {
            bars.push(PciBar {
                offset,
                kind: decoded.kind,
                length: decoded.length,
                alignment: decoded.alignment,
                base: 0,
            });
            if decoded.kind.is_64bit() {
                index += 2;
                continue;
            }
        }
        index += 1;
    }
    Ok(bars)
}

fn probe_rom(
    access: &mut dyn ConfigAccess,
    bdf: Bdf,
    offset: u16,
) -> std::result::Result<u64, AccessError> {
    let original = access.read_u32(bdf, offset)?;
    access.write_u32(bdf, offset, 0xFFFF_FFFE)?;
    let mask = access.read_u32(bdf, offset)?;
    access.write_u32(bdf, offset, original)?;
    Ok(decode_rom_mask(mask))
}

/// Determines which downstream windows a PCI-to-PCI bridge implements by probing the aperture
/// base registers with all-ones and reading the capability bits back.
fn gather_ppb_decode(
    access: &mut dyn ConfigAccess,
    bdf: Bdf,
) -> std::result::Result<BridgeDecode, AccessError> {
    // The 32-bit non-prefetchable window is mandatory for Type 1 headers.
    let mut decode = BridgeDecode::MEM32;

    access.write_u8(bdf, config::IO_BASE, 0xFF)?;
    let io = access.read_u8(bdf, config::IO_BASE)?;
    if io != 0 {
        decode |= if io & 0x1 != 0 {
            BridgeDecode::IO32
        } else {
            BridgeDecode::IO16
        };
    }
    access.write_u8(bdf, config::IO_BASE, 0x00)?;

    access.write_u32(bdf, config::PREF_MEM_BASE, 0xFFFF_FFFF)?;
    let pref = access.read_u32(bdf, config::PREF_MEM_BASE)?;
    if pref != 0 {
        decode |= BridgeDecode::PMEM32;
        if pref & 0x1 != 0 {
            decode |= BridgeDecode::PMEM64;
        }
    }
    access.write_u32(bdf, config::PREF_MEM_BASE, 0)?;

    Ok(decode)
}
