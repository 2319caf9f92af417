//! Core PCI vocabulary shared by the enumeration engine and its test bench.

pub mod access;
pub mod config;
pub mod descriptor;

pub use access::{AccessError, AccessWidth, ConfigAccess, IoAccess};
pub use config::{decode_bar, decode_rom_mask, BarKind, ClassCode, DecodedBar, HeaderKind, ResourceKind};
pub use descriptor::{
    encode_descriptor_list, parse_descriptor_list, AddressSpaceDescriptor, DescriptorError,
    ResourceType, STATUS_NONEXISTENT, STATUS_SATISFIED, STATUS_UNSATISFIED,
};

/// PCI bus/device/function identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Bdf {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl Bdf {
    /// Creates a new BDF.
    ///
    /// The caller is responsible for ensuring the values are within the PCI ranges:
    /// bus < 256, device < 32, function < 8.
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }

    /// Packs this BDF into a compact `u16` key using the standard PCI config-address bit layout.
    ///
    /// Layout (LSB..MSB):
    /// - bits 0..=2: function (0-7)
    /// - bits 3..=7: device (0-31)
    /// - bits 8..=15: bus (0-255)
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `device >= 32` or `function >= 8`.
    pub const fn pack_u16(self) -> u16 {
        debug_assert!(self.device < 32);
        debug_assert!(self.function < 8);
        ((self.bus as u16) << 8) | ((self.device as u16) << 3) | (self.function as u16)
    }

    /// Unpacks a `u16` produced by [`Bdf::pack_u16`] back into a [`Bdf`].
    pub const fn unpack_u16(v: u16) -> Self {
        let bus = (v >> 8) as u8;
        let device = ((v >> 3) & 0x1f) as u8;
        let function = (v & 0x7) as u8;

        Self {
            bus,
            device,
            function,
        }
    }
}

impl From<Bdf> for u16 {
    fn from(value: Bdf) -> Self {
        value.pack_u16()
    }
}

impl From<u16> for Bdf {
    fn from(value: u16) -> Self {
        Self::unpack_u16(value)
    }
}

impl core::fmt::Display for Bdf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

impl core::cmp::Ord for Bdf {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.bus, self.device, self.function).cmp(&(other.bus, other.device, other.function))
    }
}

impl core::cmp::PartialOrd for Bdf {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
