use crate::serialize::{hex_option, hex_range};
use crate::DescriptorError;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Represents a region in non-volatile memory (e.g. flash or EEPROM).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NvmRegion {
    /// A name to describe the region
    pub name: Option<String>,
    /// Address range of the region
    #[serde(serialize_with = "hex_range")]
    pub range: Range<u64>,
    /// Erase granularity advertised for the region.
    ///
    /// The authoritative sector geometry is the sector table of the flash algorithm,
    /// this value is informational.
    #[serde(default, serialize_with = "hex_option")]
    pub sector_size: Option<u64>,
    /// Program granularity advertised for the region.
    #[serde(default, serialize_with = "hex_option")]
    pub page_size: Option<u32>,
    /// True if the chip boots from this memory.
    #[serde(default)]
    pub is_boot_memory: bool,
    /// Name of the flash algorithm used to program this region.
    #[serde(default)]
    pub algorithm: Option<String>,
}

impl NvmRegion {
    /// Returns whether the region is boot memory.
    pub fn is_boot_memory(&self) -> bool {
        self.is_boot_memory
    }

    /// Number of bytes covered by the region.
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }
}

/// Represents a region in RAM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RamRegion {
    /// A name to describe the region
    pub name: Option<String>,
    /// Address range of the region
    #[serde(serialize_with = "hex_range")]
    pub range: Range<u64>,
    /// True if the chip boots from this memory.
    #[serde(default)]
    pub is_boot_memory: bool,
}

/// Holds information about a specific, individual flash
/// sector.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SectorInfo {
    /// Base address of the flash sector
    pub base_address: u64,
    /// Size of the flash sector
    pub size: u64,
}

impl SectorInfo {
    /// Returns the address range of the sector.
    pub fn address_range(&self) -> Range<u64> {
        self.base_address..self.base_address + self.size
    }
}

/// One row of a sector table.
///
/// Starting at `offset` (relative to the start of the flash), all following sectors
/// have a size of `size`. This is valid until either the end of the flash, or until
/// the next `SectorDescription` changes the sector size.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectorDescription {
    /// Start of the group of flash sectors, relative to the start address of the flash.
    #[serde(serialize_with = "crate::serialize::hex_u_int")]
    pub offset: u64,
    /// Size of each individual flash sector
    #[serde(serialize_with = "crate::serialize::hex_u_int")]
    pub size: u64,
}

/// Holds information about a page in flash.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageInfo {
    /// Base address of the page in flash.
    pub base_address: u64,
    /// Size of the page
    pub size: u32,
}

impl PageInfo {
    /// Returns the address range of the page.
    pub fn address_range(&self) -> Range<u64> {
        self.base_address..self.base_address + self.size as u64
    }
}

/// Enables the user to do range intersection testing.
pub trait MemoryRange {
    /// Returns true if `self` contains `range` fully.
    fn contains_range(&self, range: &Range<u64>) -> bool;

    /// Returns true if `self` intersects `range` partially.
    fn intersects_range(&self, range: &Range<u64>) -> bool;

    /// Ensure memory reads using this memory range, will be aligned to 32 bits.
    /// This may result in slightly more memory being read than requested.
    fn align_to_32_bits(&mut self);
}

impl MemoryRange for Range<u64> {
    fn contains_range(&self, range: &Range<u64>) -> bool {
        if range.is_empty() {
            false
        } else {
            self.start <= range.start && range.end <= self.end
        }
    }

    fn intersects_range(&self, range: &Range<u64>) -> bool {
        !self.is_empty() && !range.is_empty() && self.start < range.end && range.start < self.end
    }

    fn align_to_32_bits(&mut self) {
        self.start -= self.start % 4;
        if self.end % 4 != 0 {
            // Try to align the end to 32 bits, but don't overflow.
            if let Some(new_end) = self.end.checked_add(4 - self.end % 4) {
                self.end = new_end;
            }
        }
    }
}

/// Declares the type of a memory region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryRegion {
    /// Memory region describing RAM.
    Ram(RamRegion),
    /// Memory region describing flash, EEPROM or other non-volatile memory.
    #[serde(alias = "Flash")]
    Nvm(NvmRegion),
}

impl MemoryRegion {
    /// Returns the RAM region if this is a RAM region, otherwise None.
    pub fn as_ram_region(&self) -> Option<&RamRegion> {
        match self {
            MemoryRegion::Ram(region) => Some(region),
            _ => None,
        }
    }

    /// Returns the NVM region if this is a NVM region, otherwise None.
    pub fn as_nvm_region(&self) -> Option<&NvmRegion> {
        match self {
            MemoryRegion::Nvm(region) => Some(region),
            _ => None,
        }
    }

    /// Returns the address range of the memory region.
    pub fn address_range(&self) -> Range<u64> {
        match self {
            MemoryRegion::Ram(rr) => rr.range.clone(),
            MemoryRegion::Nvm(nr) => nr.range.clone(),
        }
    }

    /// Returns whether the memory region contains the given address.
    pub fn contains(&self, address: u64) -> bool {
        self.address_range().contains(&address)
    }

    /// Returns the name of the region, if it has one.
    pub fn name(&self) -> Option<&str> {
        match self {
            MemoryRegion::Ram(region) => region.name.as_deref(),
            MemoryRegion::Nvm(region) => region.name.as_deref(),
        }
    }

    /// Returns `true` if the memory region is [`Ram`].
    ///
    /// [`Ram`]: MemoryRegion::Ram
    #[must_use]
    pub fn is_ram(&self) -> bool {
        matches!(self, Self::Ram(..))
    }

    /// Returns `true` if the memory region is [`Nvm`].
    ///
    /// [`Nvm`]: MemoryRegion::Nvm
    #[must_use]
    pub fn is_nvm(&self) -> bool {
        matches!(self, Self::Nvm(..))
    }
}

/// The memory layout of a chip.
///
/// Regions are kept sorted by their start address and never overlap, so every
/// address resolves to at most one region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<MemoryRegion>", into = "Vec<MemoryRegion>")]
pub struct MemoryMap {
    regions: Vec<MemoryRegion>,
}

impl MemoryMap {
    /// Builds a memory map, sorting the regions by address.
    ///
    /// Fails if a region is empty or two regions overlap.
    pub fn new(mut regions: Vec<MemoryRegion>) -> Result<Self, DescriptorError> {
        regions.sort_by_key(|region| region.address_range().start);

        if let Some(empty) = regions.iter().find(|r| r.address_range().is_empty()) {
            return Err(DescriptorError::EmptyRegion {
                range: empty.address_range(),
            });
        }

        for pair in regions.windows(2) {
            let first = pair[0].address_range();
            let second = pair[1].address_range();
            if first.intersects_range(&second) {
                return Err(DescriptorError::OverlappingRegions { first, second });
            }
        }

        Ok(Self { regions })
    }

    /// All regions, in ascending address order.
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Iterate over all regions, in ascending address order.
    pub fn iter(&self) -> std::slice::Iter<'_, MemoryRegion> {
        self.regions.iter()
    }

    /// Returns the single region containing `address`, or `None` if the address is unmapped.
    pub fn region_for_address(&self, address: u64) -> Option<&MemoryRegion> {
        let index = self
            .regions
            .partition_point(|region| region.address_range().start <= address);

        index
            .checked_sub(1)
            .map(|index| &self.regions[index])
            .filter(|region| region.contains(address))
    }

    /// Iterate over the non-volatile regions.
    pub fn nvm_regions(&self) -> impl Iterator<Item = &NvmRegion> {
        self.regions.iter().filter_map(MemoryRegion::as_nvm_region)
    }

    /// Iterate over the RAM regions.
    pub fn ram_regions(&self) -> impl Iterator<Item = &RamRegion> {
        self.regions.iter().filter_map(MemoryRegion::as_ram_region)
    }

    /// The flash region the chip boots from, if any.
    pub fn boot_memory(&self) -> Option<&NvmRegion> {
        self.nvm_regions().find(|region| region.is_boot_memory())
    }
}

impl TryFrom<Vec<MemoryRegion>> for MemoryMap {
    type Error = DescriptorError;

    fn try_from(regions: Vec<MemoryRegion>) -> Result<Self, Self::Error> {
        Self::new(regions)
    }
}

impl From<MemoryMap> for Vec<MemoryRegion> {
    fn from(map: MemoryMap) -> Self {
        map.regions
    }
}

impl<'a> IntoIterator for &'a MemoryMap {
    type Item = &'a MemoryRegion;
    type IntoIter = std::slice::Iter<'a, MemoryRegion>;

    fn into_iter(self) -> Self::IntoIter {
        self.regions.iter()
    }
}
