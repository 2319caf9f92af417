//! Aperture calculation: a greedy bump allocator over a presorted child list.
//!
//! Correct packing depends entirely on children being sorted by descending alignment at
//! insertion time (see [`crate::resource`]). I/O apertures take a dedicated path that keeps
//! device windows out of the legacy ISA and VGA alias ranges, which are decoded from the low
//! 10 address bits only.

use vireo_pci::config::ResourceKind;

use crate::enumerator::EnumerationPolicy;
use crate::resource::{ResourceNode, ResourceUsage};

/// ISA legacy decode aliases every 1KiB page at 0x100..=0x3FF.
const ISA_ALIAS: (u64, u64) = (0x100, 0x3FF);
/// VGA legacy decode aliases every 1KiB page at 0x3B0..=0x3DF.
const VGA_ALIAS: (u64, u64) = (0x3B0, 0x3DF);

/// Assigns offsets to every child of `node` and computes the node's own length and alignment.
pub fn calculate_aperture(node: &mut ResourceNode, policy: &EnumerationPolicy) {
    if node.kind == ResourceKind::Io {
        calculate_aperture_io(node, policy);
    } else {
        calculate_aperture_plain(node);
    }
}

fn calculate_aperture_plain(node: &mut ResourceNode) {
    let mut aperture = 0u64;
    for child in &mut node.children {
        aperture = align_up(aperture, child.alignment);
        child.offset = aperture;
        aperture += child.length;
    }
    finish(node, aperture);
}

fn calculate_aperture_io(node: &mut ResourceNode, policy: &EnumerationPolicy) {
    // The ISA range contains the VGA range, so when both reservations are on the ISA window
    // subsumes the VGA one.
    let excluded = if policy.reserve_isa_aliases {
        Some(ISA_ALIAS)
    } else if policy.reserve_vga_aliases {
        Some(VGA_ALIAS)
    } else {
        None
    };

    let mut aperture = 0u64;
    for child in &mut node.children {
        aperture = align_up(aperture, child.alignment);
        if let Some((lo, hi)) = excluded {
            // Alias avoidance applies to device windows only; bridge apertures and padding
            // reservations forward whole ranges and have nothing to alias.
            if child.bar_index.is_some() && child.usage == ResourceUsage::Typical {
                aperture = skip_alias_window(aperture, child.length, child.alignment, lo, hi);
            }
        }
        child.offset = aperture;
        aperture += child.length;
    }
    finish(node, aperture);
}

fn finish(node: &mut ResourceNode, aperture: u64) {
    let total = align_up(aperture, node.alignment);
    // A padded aggregate never shrinks below its reservation.
    if node.length < total {
        node.length = total;
    }
    // The largest child alignment (the first, by the sort invariant) bubbles up as the node's
    // own requirement.
    if let Some(first) = node.children.first() {
        if first.alignment > node.alignment {
            node.alignment = first.alignment;
        }
    }
}

fn align_up(value: u64, alignment_mask: u64) -> u64 {
    let rest = value & alignment_mask;
    if rest != 0 {
        value + alignment_mask + 1 - rest
    } else {
        value
    }
}

/// Advances `offset` until [offset, offset+length) stays clear of the excluded low-10-bit range
/// in every 1KiB page it touches.
fn skip_alias_window(mut offset: u64, length: u64, alignment_mask: u64, lo: u64, hi: u64) -> u64 {
    // A window this large cannot dodge the alias range at all.
    if length == 0 || length > lo {
        return offset;
    }
    loop {
        let start = offset & 0x3FF;
        let end = start + length - 1;
        let overlaps_page = end.min(0x3FF) >= lo && start <= hi;
        // The tail may spill into the next page's low range.
        let overlaps_spill = end > 0x3FF && end - 0x400 >= lo;
        if !overlaps_page && !overlaps_spill {
            return offset;
        }
        offset = align_up((offset & !0x3FF) + 0x400, alignment_mask);
    }
}
