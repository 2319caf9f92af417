//! Allocation adjustment: when the host bridge cannot satisfy a pool, evict the single largest
//! non-essential consumer and let the orchestrator retry.

use vireo_pci::config::ResourceKind;

use crate::device::{DeviceArena, DeviceId, DeviceKind};
use crate::enumerator::{PlatformPolicy, ResourceStatus};
use crate::error::{EnumerationError, Result};
use crate::resource::ResourceNode;

/// One adjustment round over the host-level pools.
///
/// Returns `Ok(())` when at least one device was rejected (the caller rebuilds the maps and
/// retries), or [`EnumerationError::ResourcesUnsatisfiable`] when nothing more can be given up:
/// no rejectable device remains, or a pool with outstanding requests is flagged nonexistent on
/// this platform.
pub fn adjust_allocation(
    arena: &mut DeviceArena,
    platform: &mut dyn PlatformPolicy,
    pools: &[ResourceNode; 5],
    statuses: &[(ResourceKind, ResourceStatus); 5],
) -> Result<()> {
    let mut rejected: Vec<DeviceId> = Vec::new();

    for (pool, &(kind, status)) in pools.iter().zip(statuses) {
        debug_assert_eq!(pool.kind, kind);
        match status {
            ResourceStatus::Satisfied => continue,
            ResourceStatus::Nonexistent => {
                if pool.total_request() != 0 {
                    tracing::warn!(%kind, "requests against a nonexistent resource pool");
                    return Err(EnumerationError::ResourcesUnsatisfiable);
                }
            }
            ResourceStatus::Unsatisfied => {
                let Some((victim, length)) = largest_rejectable(arena, pool, &rejected) else {
                    continue;
                };
                let bdf = arena.node(victim).bdf;
                tracing::warn!(%bdf, %kind, length, "rejecting device to relieve pool pressure");
                platform.report_rejected(bdf);
                arena.remove_subtree(victim);
                rejected.push(victim);
            }
        }
    }

    if rejected.is_empty() {
        Err(EnumerationError::ResourcesUnsatisfiable)
    } else {
        Ok(())
    }
}

/// Finds the rejectable device owning the largest single request in `pool`.
fn largest_rejectable(
    arena: &DeviceArena,
    pool: &ResourceNode,
    already_rejected: &[DeviceId],
) -> Option<(DeviceId, u64)> {
    let mut best: Option<(DeviceId, u64)> = None;
    visit(arena, pool, already_rejected, &mut best);
    best
}

fn visit(
    arena: &DeviceArena,
    node: &ResourceNode,
    already_rejected: &[DeviceId],
    best: &mut Option<(DeviceId, u64)>,
) {
    for child in &node.children {
        if let Some(owner) = child.owner {
            if is_rejectable(arena, owner, already_rejected)
                && best.map_or(true, |(_, len)| child.length > len)
            {
                *best = Some((owner, child.length));
            }
        }
        visit(arena, child, already_rejected, best);
    }
}

/// A device may be rejected unless it is structural (a bridge), lives on bus 0, or is the
/// active VGA display device.
fn is_rejectable(arena: &DeviceArena, id: DeviceId, already_rejected: &[DeviceId]) -> bool {
    if already_rejected.contains(&id) {
        return false;
    }
    let Some(dev) = arena.get(id) else {
        return false;
    };
    if matches!(dev.kind, DeviceKind::RootBridge | DeviceKind::PciPciBridge) {
        return false;
    }
    if dev.bdf.bus == 0 {
        return false;
    }
    if dev.class.is_display_vga() {
        return false;
    }
    true
}
