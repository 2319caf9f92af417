//! Address-space-descriptor wire format.
//!
//! Resource requests and proposals cross the host-bridge boundary as a flat byte list of
//! fixed-size QWORD address-space descriptor records terminated by an end-tag record. On
//! submission the `range_max` field carries the alignment mask; on proposals the `translation`
//! field carries the per-record allocation status (see the `STATUS_*` constants).

use thiserror::Error;

use crate::config::ResourceKind;

pub const QWORD_DESCRIPTOR_TAG: u8 = 0x8A;
pub const END_TAG: u8 = 0x79;

/// Payload length of a QWORD descriptor record (everything after the 3-byte header).
const QWORD_PAYLOAD_LEN: u16 = 0x2B;
/// Full QWORD record size: tag byte + u16 length + payload.
const QWORD_RECORD_LEN: usize = 3 + QWORD_PAYLOAD_LEN as usize;

/// Allocation status values carried in `translation` on proposal records.
pub const STATUS_SATISFIED: u64 = 0;
pub const STATUS_UNSATISFIED: u64 = u64::MAX;
pub const STATUS_NONEXISTENT: u64 = u64::MAX - 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResourceType {
    Memory,
    Io,
}

impl ResourceType {
    const fn to_wire(self) -> u8 {
        match self {
            Self::Memory => 0,
            Self::Io => 1,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AddressSpaceDescriptor {
    pub resource_type: ResourceType,
    /// Type-specific flags; bit 2 marks memory ranges prefetchable.
    pub prefetchable: bool,
    /// Address-space granularity in bits (32 or 64).
    pub granularity: u8,
    pub range_min: u64,
    /// Alignment mask on submission records, range max on proposals.
    pub range_max: u64,
    pub translation: u64,
    pub length: u64,
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum DescriptorError {
    #[error("truncated descriptor list")]
    Truncated,
    #[error("unknown descriptor tag {0:#04x}")]
    UnknownTag(u8),
    #[error("descriptor payload length {0:#06x} does not match the QWORD record shape")]
    BadLength(u16),
    #[error("unknown resource type {0}")]
    UnknownResourceType(u8),
    #[error("missing end tag")]
    MissingEndTag,
}

impl AddressSpaceDescriptor {
    /// Builds a submission record for one resource pool.
    pub fn request(kind: ResourceKind, length: u64, alignment: u64) -> Self {
        Self {
            resource_type: if kind.is_memory() {
                ResourceType::Memory
            } else {
                ResourceType::Io
            },
            prefetchable: kind.is_prefetchable(),
            granularity: kind.granularity(),
            range_min: 0,
            range_max: alignment,
            translation: 0,
            length,
        }
    }

    /// Matches this record against a resource kind, using the same
    /// (type, prefetchable, granularity) triple the request encoding uses.
    pub fn matches_kind(&self, kind: ResourceKind) -> bool {
        let is_memory = matches!(self.resource_type, ResourceType::Memory);
        is_memory == kind.is_memory()
            && (!is_memory
                || (self.prefetchable == kind.is_prefetchable()
                    && self.granularity == kind.granularity()))
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(QWORD_DESCRIPTOR_TAG);
        out.extend_from_slice(&QWORD_PAYLOAD_LEN.to_le_bytes());
        out.push(self.resource_type.to_wire());
        out.push(0); // general flags
        out.push(if self.prefetchable { 1 << 2 } else { 0 });
        out.extend_from_slice(&u64::from(self.granularity).to_le_bytes());
        out.extend_from_slice(&self.range_min.to_le_bytes());
        out.extend_from_slice(&self.range_max.to_le_bytes());
        out.extend_from_slice(&self.translation.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
    }

    fn parse(bytes: &[u8]) -> Result<Self, DescriptorError> {
        debug_assert_eq!(bytes.len(), QWORD_RECORD_LEN);
        let resource_type = match bytes[3] {
            0 => ResourceType::Memory,
            1 => ResourceType::Io,
            other => return Err(DescriptorError::UnknownResourceType(other)),
        };
        let u64_at =
            |off: usize| u64::from_le_bytes(bytes[off..off + 8].try_into().expect("8-byte field"));
        Ok(Self {
            resource_type,
            prefetchable: bytes[5] & (1 << 2) != 0,
            granularity: u64_at(6) as u8,
            range_min: u64_at(14),
            range_max: u64_at(22),
            translation: u64_at(30),
            length: u64_at(38),
        })
    }
}

/// Encodes a descriptor list, appending the end-tag record with a zero checksum byte.
pub fn encode_descriptor_list(descriptors: &[AddressSpaceDescriptor]) -> Vec<u8> {
    let mut out = Vec::with_capacity(descriptors.len() * QWORD_RECORD_LEN + 2);
    for desc in descriptors {
        desc.encode_into(&mut out);
    }
    out.push(END_TAG);
    out.push(0); // checksum, unused by consumers
    out
}

/// Parses a descriptor list up to (and requiring) the end tag. The checksum byte is ignored.
pub fn parse_descriptor_list(mut bytes: &[u8]) -> Result<Vec<AddressSpaceDescriptor>, DescriptorError> {
    let mut out = Vec::new();
    loop {
        let Some(&tag) = bytes.first() else {
            return Err(DescriptorError::MissingEndTag);
        };
        match tag {
            END_TAG => {
                if bytes.len() < 2 {
                    return Err(DescriptorError::Truncated);
                }
                return Ok(out);
            }
            QWORD_DESCRIPTOR_TAG => {
                if bytes.len() < QWORD_RECORD_LEN {
                    return Err(DescriptorError::Truncated);
                }
                let len = u16::from_le_bytes([bytes[1], bytes[2]]);
                if len != QWORD_PAYLOAD_LEN {
                    return Err(DescriptorError::BadLength(len));
                }
                out.push(AddressSpaceDescriptor::parse(&bytes[..QWORD_RECORD_LEN])?);
                bytes = &bytes[QWORD_RECORD_LEN..];
            }
            other => return Err(DescriptorError::UnknownTag(other)),
        }
    }
}
