use super::FlashError;
use flashloader_target::{
    InstructionSet, MemoryMap, MemoryRange, PageInfo, RawFlashAlgorithm, SectorDescription,
    SectorInfo,
};
use std::ops::Range;

/// The properties of the flash programmed by an algorithm.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlashProperties {
    /// The range of the device flash.
    pub address_range: Range<u64>,
    /// The page size of the device flash.
    pub page_size: u32,
    /// The number of bytes written by a single call of the program routine.
    ///
    /// Always divides `page_size`.
    pub program_chunk_size: u32,
    /// The value of a byte in flash that was just erased.
    pub erased_byte_value: u8,
    /// List of sectors, as offsets from the start of the flash.
    pub sectors: Vec<SectorDescription>,
}

/// A flash algorithm, which has been assembled for a specific
/// chip.
///
/// All addresses are absolute. To create a [FlashAlgorithm], call the [`assemble_from_raw`] function.
///
/// [`assemble_from_raw`]: FlashAlgorithm::assemble_from_raw
#[derive(Debug, Default, Clone)]
pub struct FlashAlgorithm {
    /// The name of the flash algorithm.
    pub name: String,
    /// Whether this flash algorithm is the default one or not.
    pub default: bool,
    /// Memory address where the flash algo instructions will be loaded to.
    pub load_address: u64,
    /// List of 32-bit words containing the position-independent code for the algo.
    pub instructions: Vec<u32>,
    /// Address of the `Init()` entry point. Optional.
    pub pc_init: Option<u64>,
    /// Address of the `UnInit()` entry point. Optional.
    pub pc_uninit: Option<u64>,
    /// Address of the `ProgramPage()` entry point.
    pub pc_program_page: u64,
    /// Address of the `EraseSector()` entry point.
    pub pc_erase_sector: u64,
    /// Address of the `EraseAll()` entry point. Optional.
    pub pc_erase_all: Option<u64>,
    /// Initial value of the static base register for calling flash algo entry points, which
    /// determines where the position-independent data resides.
    pub static_base: u64,
    /// Initial value of the stack pointer when calling any flash algo API.
    pub begin_stack: u64,
    /// Lowest address of the stack.
    pub end_stack: u64,
    /// A list of base addresses for page buffers. The buffers are
    /// at least `page_size` bytes large. If at least 2 buffers are included in
    /// the list, then double buffered programming is possible.
    pub page_buffers: Vec<u64>,
    /// The zero-initialised data of the algorithm, cleared when loading it.
    pub zero_init: Range<u64>,
    /// The address routines return to. Carries the Thumb bit where needed.
    pub return_address: u64,
    /// The properties of the flash on the device.
    pub flash_properties: FlashProperties,
}

impl FlashAlgorithm {
    /// Try to retrieve the information about the flash sector
    /// which contains `address`.
    ///
    /// If the `address` is not part of the flash, None will
    /// be returned.
    pub fn sector_info(&self, address: u64) -> Option<SectorInfo> {
        if !self.flash_properties.address_range.contains(&address) {
            tracing::trace!("Address {:08x} not contained in this flash device", address);
            return None;
        }

        let offset_address = address - self.flash_properties.address_range.start;

        let containing_sector = self
            .flash_properties
            .sectors
            .iter()
            .rfind(|s| s.offset <= offset_address)?;

        let sector_index = (offset_address - containing_sector.offset) / containing_sector.size;

        let sector_address = self.flash_properties.address_range.start
            + containing_sector.offset
            + sector_index * containing_sector.size;

        Some(SectorInfo {
            base_address: sector_address,
            size: containing_sector.size,
        })
    }

    /// Returns the necessary information about the page which `address` resides in
    /// if the address is inside the flash region.
    pub fn page_info(&self, address: u64) -> Option<PageInfo> {
        let range = &self.flash_properties.address_range;
        if !range.contains(&address) {
            return None;
        }

        let page_size = self.flash_properties.page_size as u64;
        let offset = address - range.start;

        Some(PageInfo {
            base_address: range.start + offset - offset % page_size,
            size: self.flash_properties.page_size,
        })
    }

    /// Returns the window programmed by a single program call that contains `address`.
    pub fn chunk_info(&self, address: u64) -> Option<PageInfo> {
        let range = &self.flash_properties.address_range;
        if !range.contains(&address) {
            return None;
        }

        let chunk_size = self.flash_properties.program_chunk_size as u64;
        let offset = address - range.start;

        Some(PageInfo {
            base_address: range.start + offset - offset % chunk_size,
            size: self.flash_properties.program_chunk_size,
        })
    }

    /// Iterate over all the sectors of the flash.
    pub fn iter_sectors(&self) -> impl Iterator<Item = SectorInfo> + '_ {
        let props = &self.flash_properties;

        let mut addr = props.address_range.start;
        let mut desc_idx = 0;
        std::iter::from_fn(move || {
            if addr >= props.address_range.end {
                return None;
            }

            // Advance desc_idx if needed
            if let Some(next_desc) = props.sectors.get(desc_idx + 1) {
                if props.address_range.start + next_desc.offset <= addr {
                    desc_idx += 1;
                }
            }

            let size = props.sectors.get(desc_idx)?.size;
            let sector = SectorInfo {
                base_address: addr,
                size,
            };
            addr += size;

            Some(sector)
        })
    }

    /// Iterate over all the pages of the flash.
    pub fn iter_pages(&self) -> impl Iterator<Item = PageInfo> + '_ {
        let props = &self.flash_properties;

        let mut addr = props.address_range.start;
        std::iter::from_fn(move || {
            if addr >= props.address_range.end {
                return None;
            }

            let page = PageInfo {
                base_address: addr,
                size: props.page_size,
            };
            addr += props.page_size as u64;

            Some(page)
        })
    }

    /// Returns true if the entire contents of the argument array equal the erased byte value.
    pub fn is_erased(&self, data: &[u8]) -> bool {
        data.iter()
            .all(|b| *b == self.flash_properties.erased_byte_value)
    }

    /// Whether more than one page buffer is available.
    pub fn double_buffering_supported(&self) -> bool {
        self.page_buffers.len() > 1
    }

    /// The range the instruction image occupies once loaded.
    pub fn image_range(&self) -> Range<u64> {
        self.load_address..self.load_address + self.instructions.len() as u64 * 4
    }

    /// Validates a raw flash algorithm against the memory map of a chip and resolves
    /// its entry points to absolute addresses.
    ///
    /// Everything the algorithm uses at runtime (the instruction image, the stack and
    /// the page buffers) must be inside RAM, and none of these may overlap.
    pub fn assemble_from_raw(
        raw: &RawFlashAlgorithm,
        memory_map: &MemoryMap,
        instruction_set: InstructionSet,
    ) -> Result<Self, FlashError> {
        raw.validate()?;

        let in_ram = |what: &'static str, range: Range<u64>| {
            if memory_map
                .ram_regions()
                .any(|ram| ram.range.contains_range(&range))
            {
                Ok(range)
            } else {
                Err(FlashError::AlgorithmNotInRam { what, range })
            }
        };

        let image = in_ram(
            "instruction image",
            raw.load_address..raw.load_address + raw.image_size(),
        )?;
        let stack = in_ram("stack", raw.end_stack..raw.begin_stack)?;

        let page_buffers = if raw.page_buffers.is_empty() {
            vec![raw.begin_data]
        } else {
            raw.page_buffers.clone()
        };

        let buffer_size = raw.page_size as u64;
        let mut buffers = Vec::with_capacity(page_buffers.len());
        for &buffer in &page_buffers {
            buffers.push(in_ram("page buffer", buffer..buffer + buffer_size)?);
        }

        let mut areas = vec![("instruction image", image), ("stack", stack)];
        areas.extend(buffers.into_iter().map(|range| ("page buffer", range)));
        for (index, (first, first_range)) in areas.iter().enumerate() {
            for (second, second_range) in &areas[index + 1..] {
                if first_range.intersects_range(second_range) {
                    return Err(FlashError::AlgorithmRegionsOverlap {
                        first: *first,
                        second: *second,
                    });
                }
            }
        }

        let zero_init = raw.load_address + raw.sections.zi_start
            ..raw.load_address + raw.sections.zi_start + raw.sections.zi_size;
        if !zero_init.is_empty() {
            in_ram("zero-initialised data", zero_init.clone())?;
        }

        let entry = |offset: u64| raw.load_address + offset;
        let return_address = match instruction_set {
            // For ARM Cortex-M cores, we have to add 1 to the return address,
            // to ensure that we stay in Thumb mode.
            InstructionSet::Thumb2 => raw.load_address | 1,
            InstructionSet::A32 | InstructionSet::RV32 => raw.load_address,
        };

        tracing::debug!(
            "Assembled flash algorithm '{}' at {:#010x}, page buffers: {:#010x?}",
            raw.name,
            raw.load_address,
            page_buffers
        );

        Ok(FlashAlgorithm {
            name: raw.name.clone(),
            default: raw.default,
            load_address: raw.load_address,
            instructions: raw.instructions.clone(),
            pc_init: raw.pc_init.map(entry),
            pc_uninit: raw.pc_uninit.map(entry),
            pc_program_page: entry(raw.pc_program_page),
            pc_erase_sector: entry(raw.pc_erase_sector),
            pc_erase_all: raw.pc_erase_all.map(entry),
            static_base: raw.static_base,
            begin_stack: raw.begin_stack,
            end_stack: raw.end_stack,
            page_buffers,
            zero_init,
            return_address,
            flash_properties: FlashProperties {
                address_range: raw.flash_range(),
                page_size: raw.page_size,
                program_chunk_size: raw.program_chunk_size(),
                erased_byte_value: raw.erased_byte_value,
                sectors: raw.sector_sizes.clone(),
            },
        })
    }
}
