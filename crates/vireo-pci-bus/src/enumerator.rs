//! Host-bridge orchestration: the full enumerate → allocate → program sequence.
//!
//! One call to [`PciSubsystem::enumerate_host_bridge`] drives a single host bridge through the
//! phase protocol: bus allocation (scanning and bridge numbering per root bridge), resource
//! allocation (map build, degradation, aperture calculation, submission, and the adjust/retry
//! loop when the host bridge cannot satisfy a pool), and finally programming. A failing host
//! bridge leaves its devices unregistered and does not poison the subsystem; the caller simply
//! moves on to the next host bridge.

use bitflags::bitflags;
use thiserror::Error;

use vireo_pci::config::{ClassCode, ResourceKind};
use vireo_pci::descriptor::{
    encode_descriptor_list, parse_descriptor_list, AddressSpaceDescriptor, STATUS_NONEXISTENT,
    STATUS_SATISFIED,
};
use vireo_pci::{Bdf, ConfigAccess};

use crate::adjust::adjust_allocation;
use crate::device::{BridgeDecode, DeviceArena, DeviceId, DeviceKind, PciDevice};
use crate::error::Result;
use crate::map::build_root_map;
use crate::program::{close_bridge_windows, program_resources};
use crate::resource::ResourceNode;
use crate::scan::scan_root;

bitflags! {
    /// Allocation attributes a host bridge reports for one of its root bridges.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct AllocAttributes: u8 {
        /// The root bridge decodes 64-bit memory apertures.
        const MEM64_DECODE = 1 << 0;
        /// Prefetchable and non-prefetchable memory share one aperture.
        const COMBINE_MEM_PMEM = 1 << 1;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NotifyPhase {
    BeginBusAllocation,
    EndBusAllocation,
    BeginResourceAllocation,
    EndResourceAllocation,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResourceStatus {
    Satisfied,
    Unsatisfied,
    Nonexistent,
}

impl ResourceStatus {
    /// Decodes the status channel of a proposal record.
    pub fn from_translation(value: u64) -> Self {
        match value {
            STATUS_SATISFIED => Self::Satisfied,
            STATUS_NONEXISTENT => Self::Nonexistent,
            _ => Self::Unsatisfied,
        }
    }
}

/// One proposal record, decoded.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ProposedResource {
    pub kind: ResourceKind,
    pub base: u64,
    pub length: u64,
    pub status: ResourceStatus,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct HostBridgeError(pub String);

/// The host-bridge resource-allocation collaborator.
///
/// Root bridges are addressed by index, `0..root_bridge_count()`. Resource lists cross this
/// boundary in the address-space-descriptor wire format (see [`vireo_pci::descriptor`]).
pub trait HostBridgeResourceAllocator {
    fn notify_phase(&mut self, phase: NotifyPhase) -> std::result::Result<(), HostBridgeError>;
    fn root_bridge_count(&self) -> usize;
    /// Returns the bus number this root bridge's hierarchy starts at.
    fn start_bus_enumeration(&mut self, root: usize) -> std::result::Result<u8, HostBridgeError>;
    fn set_bus_numbers(
        &mut self,
        root: usize,
        start: u8,
        subordinate: u8,
    ) -> std::result::Result<(), HostBridgeError>;
    fn allocation_attributes(&self, root: usize) -> AllocAttributes;
    fn submit_resources(
        &mut self,
        root: usize,
        descriptors: &[u8],
    ) -> std::result::Result<(), HostBridgeError>;
    fn proposed_resources(&mut self, root: usize) -> std::result::Result<Vec<u8>, HostBridgeError>;
}

/// Per-device headroom reservation supplied by the platform.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PaddingRequest {
    pub kind: ResourceKind,
    pub length: u64,
    /// Alignment mask (power of two minus one).
    pub alignment: u64,
}

/// Optional platform collaborator: padding policy and rejection reporting.
pub trait PlatformPolicy {
    fn resource_padding(&self, _bdf: Bdf, _class: ClassCode) -> Vec<PaddingRequest> {
        Vec::new()
    }

    fn report_rejected(&mut self, _bdf: Bdf) {}
}

/// No padding, no reporting.
pub struct DefaultPolicy;

impl PlatformPolicy for DefaultPolicy {}

/// Platform-wide enumeration knobs.
#[derive(Debug, Clone, Default)]
pub struct EnumerationPolicy {
    /// Keep I/O windows clear of the ISA alias range (0x100..=0x3FF in every 1KiB page).
    pub reserve_isa_aliases: bool,
    /// Keep I/O windows clear of the VGA alias range (0x3B0..=0x3DF in every 1KiB page).
    pub reserve_vga_aliases: bool,
}

/// A root bridge that completed enumeration.
#[derive(Debug, Copy, Clone)]
pub struct RootRecord {
    pub device: DeviceId,
    pub root_index: usize,
    pub attributes: AllocAttributes,
}

/// The engine's context object: owns the device forest and the per-host-bridge state.
#[derive(Debug)]
pub struct PciSubsystem {
    arena: DeviceArena,
    roots: Vec<RootRecord>,
    policy: EnumerationPolicy,
}

impl PciSubsystem {
    pub fn new(policy: EnumerationPolicy) -> Self {
        Self {
            arena: DeviceArena::new(),
            roots: Vec::new(),
            policy,
        }
    }

    pub fn arena(&self) -> &DeviceArena {
        &self.arena
    }

    /// Root bridges that completed enumeration, across all host bridges seen so far.
    pub fn roots(&self) -> &[RootRecord] {
        &self.roots
    }

    /// Looks up a registered device by its final bus address.
    pub fn find_device(&self, bdf: Bdf) -> Option<&PciDevice> {
        self.roots.iter().find_map(|rec| {
            self.arena
                .walk(rec.device)
                .into_iter()
                .map(|id| self.arena.node(id))
                .find(|dev| dev.bdf == bdf && dev.kind != DeviceKind::RootBridge)
        })
    }

    /// Runs the whole sequence for one host bridge.
    ///
    /// On failure the host bridge's partial device tree is torn down and the error returned; the
    /// subsystem stays consistent and other host bridges can still be enumerated.
    pub fn enumerate_host_bridge(
        &mut self,
        host: &mut dyn HostBridgeResourceAllocator,
        access: &mut dyn ConfigAccess,
        platform: &mut dyn PlatformPolicy,
    ) -> Result<()> {
        let mut records = Vec::new();
        match self.enumerate_inner(host, access, platform, &mut records) {
            Ok(()) => {
                self.roots.extend(records);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(%err, "host bridge enumeration failed; its devices stay unregistered");
                for rec in records {
                    self.arena.remove_subtree(rec.device);
                }
                Err(err)
            }
        }
    }

    fn enumerate_inner(
        &mut self,
        host: &mut dyn HostBridgeResourceAllocator,
        access: &mut dyn ConfigAccess,
        platform: &mut dyn PlatformPolicy,
        records: &mut Vec<RootRecord>,
    ) -> Result<()> {
        host.notify_phase(NotifyPhase::BeginBusAllocation)?;
        for root_index in 0..host.root_bridge_count() {
            let start_bus = host.start_bus_enumeration(root_index)?;
            let attributes = host.allocation_attributes(root_index);
            let mut device = PciDevice::new(
                Bdf::new(start_bus, 0, 0),
                DeviceKind::RootBridge,
                0,
                0,
                ClassCode::from_register(0x0600_0000),
            );
            device.decode = root_decode(attributes);
            let id = self.arena.insert_root(device);
            records.push(RootRecord {
                device: id,
                root_index,
                attributes,
            });
            let subordinate = scan_root(access, &mut self.arena, platform, id, start_bus)?;
            host.set_bus_numbers(root_index, start_bus, subordinate)?;
        }
        host.notify_phase(NotifyPhase::EndBusAllocation)?;

        host.notify_phase(NotifyPhase::BeginResourceAllocation)?;
        let (maps, proposals) = loop {
            let maps: Vec<[ResourceNode; 5]> = records
                .iter()
                .map(|rec| build_root_map(&self.arena, &self.policy, rec.device))
                .collect();

            for (rec, pools) in records.iter().zip(&maps) {
                let requests: Vec<AddressSpaceDescriptor> = pools
                    .iter()
                    .filter(|pool| !pool.is_empty_aggregate())
                    .map(|pool| {
                        AddressSpaceDescriptor::request(pool.kind, pool.length, pool.alignment)
                    })
                    .collect();
                host.submit_resources(rec.root_index, &encode_descriptor_list(&requests))?;
            }

            let mut proposals: Vec<Vec<ProposedResource>> = Vec::new();
            for rec in records.iter() {
                let bytes = host.proposed_resources(rec.root_index)?;
                let mut decoded = Vec::new();
                for desc in parse_descriptor_list(&bytes)? {
                    let Some(kind) = ResourceKind::ALL
                        .iter()
                        .copied()
                        .find(|&kind| desc.matches_kind(kind))
                    else {
                        tracing::warn!("ignoring proposal record of unknown shape");
                        continue;
                    };
                    decoded.push(ProposedResource {
                        kind,
                        base: desc.range_min,
                        length: desc.length,
                        status: ResourceStatus::from_translation(desc.translation),
                    });
                }
                proposals.push(decoded);
            }

            // Fold per-root outcomes into one status per resource kind.
            let mut statuses = ResourceKind::ALL.map(|kind| (kind, ResourceStatus::Satisfied));
            let mut satisfied = true;
            for (pools, decoded) in maps.iter().zip(&proposals) {
                for (slot, pool) in statuses.iter_mut().zip(pools.iter()) {
                    if pool.is_empty_aggregate() {
                        continue;
                    }
                    let status = decoded
                        .iter()
                        .find(|proposal| proposal.kind == pool.kind)
                        .map(|proposal| proposal.status)
                        .unwrap_or(ResourceStatus::Unsatisfied);
                    if status != ResourceStatus::Satisfied {
                        satisfied = false;
                        slot.1 = worst(slot.1, status);
                    }
                }
            }
            if satisfied {
                break (maps, proposals);
            }

            // Pull the per-root aggregates into host-level pools so the adjuster sees every
            // candidate at once, evict, and retry with rebuilt maps.
            let mut host_pools = [
                ResourceNode::pool(ResourceKind::Io),
                ResourceNode::pool(ResourceKind::Mem32),
                ResourceNode::pool(ResourceKind::PMem32),
                ResourceNode::pool(ResourceKind::Mem64),
                ResourceNode::pool(ResourceKind::PMem64),
            ];
            for pools in maps {
                for (host_pool, pool) in host_pools.iter_mut().zip(pools) {
                    if !pool.is_empty_aggregate() {
                        host_pool.insert(pool);
                    }
                }
            }
            adjust_allocation(&mut self.arena, platform, &host_pools, &statuses)?;
        };

        for rec in records.iter() {
            close_bridge_windows(access, &self.arena, rec.device)?;
        }
        for ((rec, pools), decoded) in records.iter().zip(&maps).zip(&proposals) {
            for pool in pools {
                if pool.is_empty_aggregate() {
                    continue;
                }
                let base = decoded
                    .iter()
                    .find(|proposal| proposal.kind == pool.kind)
                    .map(|proposal| proposal.base)
                    .ok_or_else(|| {
                        HostBridgeError("satisfied pool missing from proposal list".into())
                    })?;
                program_resources(access, &mut self.arena, base, pool)?;
            }
            for id in self.arena.walk(rec.device) {
                let dev = self.arena.node_mut(id);
                dev.allocated = true;
                dev.registered = true;
            }
            tracing::debug!(root = rec.root_index, "root bridge programmed");
        }
        host.notify_phase(NotifyPhase::EndResourceAllocation)?;
        Ok(())
    }
}

fn root_decode(attributes: AllocAttributes) -> BridgeDecode {
    let mut decode =
        BridgeDecode::IO16 | BridgeDecode::IO32 | BridgeDecode::MEM32 | BridgeDecode::PMEM32;
    if attributes.contains(AllocAttributes::MEM64_DECODE) {
        decode |= BridgeDecode::MEM64 | BridgeDecode::PMEM64;
    }
    if attributes.contains(AllocAttributes::COMBINE_MEM_PMEM) {
        decode |= BridgeDecode::COMBINE_MEM_PMEM;
    }
    decode
}

fn worst(a: ResourceStatus, b: ResourceStatus) -> ResourceStatus {
    if a == ResourceStatus::Nonexistent || b == ResourceStatus::Nonexistent {
        ResourceStatus::Nonexistent
    } else {
        ResourceStatus::Unsatisfied
    }
}
