//! Resource degradation: folding resource kinds an upstream bridge cannot independently decode
//! into kinds it can.
//!
//! The four rules run in a fixed order; PMem64 must be resolved before Mem64 because its
//! fallback is PMem32, not Mem64. Rules 1-3 retag the moved requests; rule 4 (combined Mem/PMem
//! decode) moves prefetchable requests into the shared aperture while keeping their kind, so the
//! programmer can still tell prefetchable windows apart.

use crate::device::BridgeDecode;
use crate::resource::ResourceNode;

pub fn degrade_resources(
    decode: BridgeDecode,
    mem32: &mut ResourceNode,
    pmem32: &mut ResourceNode,
    mem64: &mut ResourceNode,
    pmem64: &mut ResourceNode,
) {
    // (1) PMem64 falls back to PMem32 when the bridge cannot decode it; it is also folded down
    // whenever PMem32 requests exist at all, so a bridge never carries two prefetchable
    // apertures at once.
    if !decode.contains(BridgeDecode::PMEM64) || !pmem32.children.is_empty() {
        fold(pmem64, pmem32, true);
    }

    // (2) Mem64 falls back to Mem32.
    if !decode.contains(BridgeDecode::MEM64) {
        fold(mem64, mem32, true);
    }

    // (3) PMem32 falls back to Mem32 when there is no independent prefetchable window.
    if !decode.contains(BridgeDecode::PMEM32) {
        fold(pmem32, mem32, true);
    }

    // (4) Combined decode: prefetchable requests share the plain memory aperture but keep their
    // kind for BAR-specific programming.
    if decode.contains(BridgeDecode::COMBINE_MEM_PMEM) {
        fold(pmem32, mem32, false);
        fold(pmem64, mem64, false);
    }
}

fn fold(source: &mut ResourceNode, dest: &mut ResourceNode, retag: bool) {
    if source.children.is_empty() {
        return;
    }
    tracing::debug!(
        from = %source.kind,
        to = %dest.kind,
        retag,
        moved = source.children.len(),
        "degrading resource requests"
    );
    source.merge_into(dest, retag);
}
