//! Chip descriptor schema
//!
//! Programming the flash of a chip, called *target* in flashloader, requires some
//! chip specific configuration: the memory map of the chip, a flash algorithm
//! (a small position independent program that runs on the target and knows how
//! to erase and program its flash) and a list of registers to write right after
//! connecting, for example to freeze peripheral clocks while the core is halted.
//!
//! This crate contains the schema structs for the YAML chip description files.
//! It is pure data: the engine that interprets it lives in the `flashloader` crate.
#![warn(missing_docs)]

mod chip;
mod chip_family;
mod error;
mod flash_algorithm;
mod memory;
pub(crate) mod serialize;

pub use chip::{Chip, InstructionSet, RegisterWrite};
pub use chip_family::{ChipFamily, TargetDescriptionSource};
pub use error::DescriptorError;
pub use flash_algorithm::{DataSections, RawFlashAlgorithm};
pub use memory::{
    MemoryMap, MemoryRange, MemoryRegion, NvmRegion, PageInfo, RamRegion, SectorDescription,
    SectorInfo,
};
