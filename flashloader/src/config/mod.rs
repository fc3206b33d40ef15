//! Chip descriptors and the registry of known chips.
//!
//! The descriptor schema lives in the `flashloader-target` crate and is re-exported here.

mod registry;
mod target;

pub use flashloader_target::{
    Chip, ChipFamily, DataSections, DescriptorError, InstructionSet, MemoryMap, MemoryRange,
    MemoryRegion, NvmRegion, PageInfo, RamRegion, RawFlashAlgorithm, RegisterWrite,
    SectorDescription, SectorInfo, TargetDescriptionSource,
};
pub use registry::{Registry, RegistryError};
pub use target::Target;
