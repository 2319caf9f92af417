//! PCI bus enumeration and resource allocation.
//!
//! Given a configuration-space accessor and a host-bridge resource-allocation collaborator, the
//! engine discovers every function in a hierarchy of PCI buses, assigns bus numbers to bridges,
//! aggregates per-device BAR requirements into per-bridge resource trees, degrades resource kinds
//! an upstream bridge cannot decode, computes minimal aligned apertures, negotiates base
//! addresses with the host bridge (evicting devices when a pool cannot be satisfied), and
//! programs the results into device BARs and bridge aperture registers.
//!
//! The crate is a library: it owns no hardware and installs no logging subscriber. All platform
//! contact goes through the traits in [`vireo_pci::access`] and [`enumerator`].

pub mod adjust;
pub mod aperture;
pub mod degrade;
pub mod device;
pub mod enumerator;
pub mod error;
pub mod io;
pub mod map;
pub mod program;
pub mod resource;
pub mod scan;

pub use device::{BridgeDecode, DeviceArena, DeviceId, DeviceKind, PciBar, PciDevice};
pub use enumerator::{
    AllocAttributes, DefaultPolicy, EnumerationPolicy, HostBridgeError,
    HostBridgeResourceAllocator, NotifyPhase, PaddingRequest, PciSubsystem, PlatformPolicy,
    ProposedResource, ResourceStatus, RootRecord,
};
pub use error::EnumerationError;
pub use io::{BarAccess, BarAccessError};
pub use resource::{ResourceNode, ResourceUsage};
