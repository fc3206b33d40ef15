#![allow(missing_docs)]

use std::ops::Range;
use std::time::Duration;

use flashloader_target::{DescriptorError, TargetDescriptionSource};
use thiserror::Error;

use crate::core::CoreStatus;
use crate::error;

/// The flash contents did not match the image.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Verification failed at address {address:#010x} (offset {offset:#x}): expected {expected:#04x}, read {actual:#04x}.")]
pub struct MismatchError {
    /// Address of the first differing byte.
    pub address: u64,
    /// Offset of the first differing byte, relative to the first byte of the image.
    pub offset: u64,
    pub expected: u8,
    pub actual: u8,
}

/// Describes any error that happened during the or in preparation for the flashing procedure.
///
/// Errors are grouped in three classes: geometry errors are detected before the target
/// is touched, transport errors come from the debug link, and algorithm errors are
/// reported by (or observed on) the flash algorithm running on the target.
#[derive(Error, Debug)]
pub enum FlashError {
    #[error(
        "No flash memory contains the entire requested memory range {start:#010x}..{end:#010x}."
    )]
    NoSuitableNvm {
        start: u64,
        end: u64,
        description_source: TargetDescriptionSource,
    },

    #[error("The data at {range:#010x?} does not fit into the {flash:#010x?} flash covered by flash algorithm '{name}'.")]
    ImageExceedsFlash {
        name: String,
        range: Range<u64>,
        flash: Range<u64>,
    },

    #[error("No sector of the flash algorithm covers address {0:#010x}.")]
    InvalidFlashAddress(u64),

    #[error("{address:#010x} is not contained in {range:#010x?}")]
    AddressNotInRegion { address: u64, range: Range<u64> },

    #[error("Adding data at address {0:#010x} overlaps previously added data.")]
    DataOverlap(u64),

    #[error("The chip descriptor is invalid.")]
    InvalidDescriptor(#[from] DescriptorError),

    #[error("Trying to write flash region {range:#010x?}, but no suitable flash loader algorithm is linked to it.")]
    NoFlashLoaderAlgorithmAttached { range: Range<u64> },

    #[error("The {what} of the flash algorithm at {range:#010x?} is not inside a RAM region.")]
    AlgorithmNotInRam { what: &'static str, range: Range<u64> },

    #[error("The {first} and the {second} of the flash algorithm overlap.")]
    AlgorithmRegionsOverlap {
        first: &'static str,
        second: &'static str,
    },

    #[error("The value {0:#x} does not fit into a 32 bit register.")]
    RegisterValueNotSupported(u64),

    #[error("Something during memory interaction went wrong")]
    Memory(#[source] error::Error),

    #[error("Something during the interaction with the core went wrong")]
    Core(#[source] error::Error),

    #[error("The RAM contents at {address:#010x} did not match the expected contents after loading the flash algorithm.")]
    FlashAlgorithmNotLoaded { address: u64 },

    #[error("The initialization of the flash algorithm failed with code {error_code}.")]
    Init { error_code: u32 },

    #[error("The execution of '{name}'{} failed with code {error_code}.", display_address(*.address))]
    RoutineCallFailed {
        name: &'static str,
        address: Option<u64>,
        error_code: u32,
    },

    #[error("The execution of '{name}'{} did not finish within {timeout:?}.", display_address(*.address))]
    Timeout {
        name: &'static str,
        address: Option<u64>,
        timeout: Duration,
    },

    #[error("The core halted at {pc:#010x} instead of returning from '{name}'.")]
    UnexpectedHalt { name: &'static str, pc: u32 },

    #[error("The core entered an unexpected status: {status:?}.")]
    UnexpectedCoreStatus { status: CoreStatus },

    #[error("Failed to erase flash sector at address {sector_address:#010x}.")]
    EraseFailed {
        sector_address: u64,
        #[source]
        source: Box<FlashError>,
    },

    #[error("Failed to erase the whole chip.")]
    ChipEraseFailed {
        #[source]
        source: Box<FlashError>,
    },

    #[error("The page write of the page at address {page_address:#010x} failed.")]
    PageWrite {
        page_address: u64,
        #[source]
        source: Box<FlashError>,
    },

    #[error("The flash algorithm does not support erasing the whole chip.")]
    ChipEraseNotSupported,

    #[error(transparent)]
    Verify(#[from] MismatchError),
}

fn display_address(address: Option<u64>) -> String {
    address
        .map(|address| format!(" at {address:#010x}"))
        .unwrap_or_default()
}

impl FlashError {
    /// The error a wrapping variant was caused by, if any.
    fn inner(&self) -> Option<&FlashError> {
        match self {
            FlashError::EraseFailed { source, .. }
            | FlashError::ChipEraseFailed { source }
            | FlashError::PageWrite { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }

    /// The raw return code of the flash algorithm, if a routine reported failure.
    pub fn error_code(&self) -> Option<u32> {
        match self {
            FlashError::Init { error_code } | FlashError::RoutineCallFailed { error_code, .. } => {
                Some(*error_code)
            }
            other => other.inner().and_then(FlashError::error_code),
        }
    }

    /// The flash address of the operation that failed, if it targeted one.
    pub fn address(&self) -> Option<u64> {
        match self {
            FlashError::EraseFailed { sector_address, .. } => Some(*sector_address),
            FlashError::PageWrite { page_address, .. } => Some(*page_address),
            FlashError::RoutineCallFailed { address, .. } | FlashError::Timeout { address, .. } => {
                *address
            }
            FlashError::Verify(mismatch) => Some(mismatch.address),
            FlashError::InvalidFlashAddress(address) | FlashError::DataOverlap(address) => {
                Some(*address)
            }
            _ => None,
        }
    }

    /// Returns `true` if a routine did not finish in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, FlashError::Timeout { .. }) || self.inner().is_some_and(Self::is_timeout)
    }

    /// Returns `true` if the error was detected before the target was touched.
    pub fn is_geometry_error(&self) -> bool {
        matches!(
            self,
            FlashError::NoSuitableNvm { .. }
                | FlashError::ImageExceedsFlash { .. }
                | FlashError::InvalidFlashAddress(_)
                | FlashError::AddressNotInRegion { .. }
                | FlashError::DataOverlap(_)
                | FlashError::InvalidDescriptor(_)
                | FlashError::NoFlashLoaderAlgorithmAttached { .. }
                | FlashError::AlgorithmNotInRam { .. }
                | FlashError::AlgorithmRegionsOverlap { .. }
        )
    }
}
