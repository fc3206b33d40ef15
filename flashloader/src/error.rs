use crate::config::RegistryError;
use crate::memory::{InvalidDataLengthError, MemoryNotAlignedError};
use crate::probe::DebugProbeError;
use thiserror::Error;

/// Errors raised by the target access layer.
///
/// None of these are retried: they are fatal for the flashing session that hits them.
#[derive(Error, Debug)]
pub enum Error {
    #[error("An error with the usage of the probe occurred")]
    Probe(#[from] DebugProbeError),
    #[error("Unable to load specification for chip")]
    ChipNotFound(#[from] RegistryError),
    #[error(transparent)]
    MemoryNotAligned(#[from] MemoryNotAlignedError),
    #[error(transparent)]
    InvalidDataLength(#[from] InvalidDataLengthError),
    #[error("The target rejected the access to address {address:#010x}")]
    AccessDenied { address: u64 },
    #[error("The core has to be halted for this operation")]
    CoreNotHalted,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
