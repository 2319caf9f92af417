use thiserror::Error;

use vireo_pci::{AccessError, DescriptorError};

use crate::enumerator::HostBridgeError;

pub type Result<T> = std::result::Result<T, EnumerationError>;

#[derive(Debug, Error)]
pub enum EnumerationError {
    #[error("configuration access failed: {0}")]
    Access(#[from] AccessError),

    #[error("host bridge collaborator failed: {0}")]
    HostBridge(#[from] HostBridgeError),

    #[error("malformed proposed-resource descriptor list: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("bus numbers exhausted while scanning downstream bridges")]
    BusNumbersExhausted,

    #[error("resource requests cannot be satisfied by the host bridge")]
    ResourcesUnsatisfiable,
}
