#![allow(missing_docs)]

use std::ops::Range;

use thiserror::Error;

/// A chip descriptor violates one of the invariants the flashing engine relies on.
///
/// These are caught when a descriptor is loaded, before any hardware is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("Memory region {range:#010x?} is empty.")]
    EmptyRegion { range: Range<u64> },

    #[error("Memory regions {first:#010x?} and {second:#010x?} overlap.")]
    OverlappingRegions {
        first: Range<u64>,
        second: Range<u64>,
    },

    #[error("The sector table of flash algorithm '{name}' is invalid: {reason}")]
    InvalidSectorTable { name: String, reason: &'static str },

    #[error("Flash algorithm '{name}' has a page size of {page_size:#x}, which is not a non-zero multiple of 4.")]
    InvalidPageSize { name: String, page_size: u32 },

    #[error("Flash algorithm '{name}' has a minimum program length of {min_program_length:#x}, which does not evenly divide the page size {page_size:#x}.")]
    InvalidMinProgramLength {
        name: String,
        min_program_length: u32,
        page_size: u32,
    },

    #[error("Flash algorithm '{name}' has no instructions.")]
    EmptyInstructions { name: String },

    #[error("The '{routine}' entry point of flash algorithm '{name}' at offset {offset:#x} lies outside of its {image_size:#x} byte image.")]
    EntryPointOutOfRange {
        name: String,
        routine: &'static str,
        offset: u64,
        image_size: u64,
    },

    #[error("Flash algorithm '{name}' has an empty or inverted stack ({begin_stack:#010x} must be above {end_stack:#010x}).")]
    InvalidStack {
        name: String,
        begin_stack: u64,
        end_stack: u64,
    },

    #[error("Chip '{chip}' references the unknown flash algorithm '{algorithm}'.")]
    UnknownAlgorithm { chip: String, algorithm: String },
}
