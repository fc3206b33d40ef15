use std::fmt::{Debug, Formatter};
use std::ops::Range;

use flashloader_target::{MemoryRange, PageInfo, SectorInfo};

use super::{FlashAlgorithm, FlashError};

/// The description of a page in flash.
///
/// A page is the window written by a single call of the program routine. Bytes not
/// covered by image data hold the erased byte value.
#[derive(Clone, PartialEq, Eq)]
pub struct FlashPage {
    address: u64,
    data: Vec<u8>,
    written: Vec<Range<u32>>,
}

impl Debug for FlashPage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "FlashPage {{")?;
        writeln!(f, "    address: {:#010X}", self.address())?;
        writeln!(f, "    size: {:#010X}", self.size())?;
        writeln!(f, "    written: {:#x?}", self.written)?;
        write!(f, "}}")
    }
}

impl FlashPage {
    /// Creates a new erased flash page from a `PageInfo`.
    fn new(page_info: &PageInfo, erased_byte_value: u8) -> Self {
        Self {
            address: page_info.base_address,
            data: vec![erased_byte_value; page_info.size as usize],
            written: Vec::new(),
        }
    }

    /// Returns the start address of the page.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Returns the size of the page in bytes.
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Returns the data slice of the page.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);

        let range = offset as u32..(offset + bytes.len()) as u32;
        match self.written.last_mut() {
            Some(last) if last.end == range.start => last.end = range.end,
            _ => self.written.push(range),
        }
    }

    /// The image data of the page, with the address of its first byte.
    pub(super) fn image_data(&self) -> impl Iterator<Item = (u64, &[u8])> + '_ {
        self.written.iter().map(|range| {
            (
                self.address + range.start as u64,
                &self.data[range.start as usize..range.end as usize],
            )
        })
    }

    /// Ranges inside the page (as offsets) that are not covered by image data.
    fn gaps(&self) -> impl Iterator<Item = Range<u32>> + '_ {
        let mut cursor = 0;
        self.written
            .iter()
            .map(|range| range.start..range.end)
            .chain(std::iter::once(self.size()..self.size()))
            .filter_map(move |written| {
                let gap = cursor..written.start;
                cursor = written.end;
                (!gap.is_empty()).then_some(gap)
            })
    }
}

/// The description of a sector in flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashSector {
    address: u64,
    size: u64,
}

impl FlashSector {
    /// Creates a new empty flash sector form a `SectorInfo`.
    fn new(sector_info: &SectorInfo) -> Self {
        Self {
            address: sector_info.base_address,
            size: sector_info.size,
        }
    }

    /// Returns the start address of the sector.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Returns the size of the sector in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the address range of the sector.
    pub fn address_range(&self) -> Range<u64> {
        self.address..self.address + self.size
    }
}

impl From<SectorInfo> for FlashSector {
    fn from(sector_info: SectorInfo) -> Self {
        Self::new(&sector_info)
    }
}

/// A part of a page that holds no image data and is programmed with the erased byte value.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FlashFill {
    address: u64,
    size: u32,
    page_index: usize,
}

impl Debug for FlashFill {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "FlashFill {{")?;
        writeln!(f, "    address: {:#010X}", self.address())?;
        writeln!(f, "    size: {:#010X}", self.size())?;
        writeln!(f, "    page_index: {:?}", self.page_index)?;
        write!(f, "}}")
    }
}

impl FlashFill {
    /// Returns the start address of the fill.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Returns the size of the fill in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Returns the corresponding page index of the fill.
    pub fn page_index(&self) -> usize {
        self.page_index
    }
}

/// The built layout of the data in flash.
///
/// Sectors and pages are sorted by address and contain no duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashLayout {
    sectors: Vec<FlashSector>,
    pages: Vec<FlashPage>,
    fills: Vec<FlashFill>,
    data_size: u64,
}

impl FlashLayout {
    /// Get the sectors of the flash layout.
    pub fn sectors(&self) -> &[FlashSector] {
        &self.sectors
    }

    /// Get the pages of the flash layout.
    pub fn pages(&self) -> &[FlashPage] {
        &self.pages
    }

    /// Get the fills of the flash layout.
    pub fn fills(&self) -> &[FlashFill] {
        &self.fills
    }

    /// Number of image bytes in the layout, without fills.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Returns `true` if nothing is to be programmed.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Address of the first image byte, which is not necessarily the start of a page.
    pub fn image_start(&self) -> Option<u64> {
        self.pages
            .first()
            .and_then(|page| page.image_data().next())
            .map(|(address, _)| address)
    }

    /// Contiguous runs of image data, fills left out.
    pub(super) fn image_spans(&self) -> Vec<(u64, Vec<u8>)> {
        let mut spans: Vec<(u64, Vec<u8>)> = Vec::new();
        for (address, data) in self.pages.iter().flat_map(FlashPage::image_data) {
            match spans.last_mut() {
                Some((start, bytes)) if *start + bytes.len() as u64 == address => {
                    bytes.extend_from_slice(data)
                }
                _ => spans.push((address, data.to_vec())),
            }
        }
        spans
    }
}

/// A block of data that is to be written to flash.
#[derive(Clone, PartialEq, Eq)]
pub(super) struct FlashDataBlock {
    address: u64,
    data: Vec<u8>,
}

impl Debug for FlashDataBlock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FlashDataBlock {{ address: {:#010X}, size: {:#X} }}",
            self.address,
            self.data.len()
        )
    }
}

impl FlashDataBlock {
    /// Get the start address of the block.
    pub(super) fn address(&self) -> u64 {
        self.address
    }

    /// Returns the size of the block in bytes.
    pub(super) fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Returns the contents of the block.
    pub(super) fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the address range of the block.
    pub(super) fn address_range(&self) -> Range<u64> {
        self.address..self.address + self.size()
    }
}

/// A helper structure to build a flash layout from a set of data blocks.
#[derive(Debug, Default, Clone)]
pub(super) struct FlashBuilder {
    data_blocks: Vec<FlashDataBlock>,
}

impl FlashBuilder {
    /// Creates a new `FlashBuilder` with empty data.
    pub(super) fn new() -> Self {
        Self {
            data_blocks: vec![],
        }
    }

    /// The data blocks added so far, sorted by address.
    pub(super) fn data_blocks(&self) -> &[FlashDataBlock] {
        &self.data_blocks
    }

    /// Returns `true` if no data was added.
    pub(super) fn is_empty(&self) -> bool {
        self.data_blocks.is_empty()
    }

    /// Add a block of data to be programmed.
    ///
    /// Programming does not start until the `program` method is called.
    pub(super) fn add_data(&mut self, address: u64, data: Vec<u8>) -> Result<(), FlashError> {
        if data.is_empty() {
            return Ok(());
        }

        let new_range = address..address + data.len() as u64;

        // Add the operation to the sorted data list.
        match self
            .data_blocks
            .binary_search_by_key(&address, |block| block.address)
        {
            // If it already is present in the list, return an error.
            Ok(_) => return Err(FlashError::DataOverlap(address)),
            Err(position) => {
                // The block before and the block after the insertion point are the only
                // candidates for an overlap.
                let before = position.checked_sub(1).and_then(|p| self.data_blocks.get(p));
                let after = self.data_blocks.get(position);

                if [before, after]
                    .into_iter()
                    .flatten()
                    .any(|block| block.address_range().intersects_range(&new_range))
                {
                    return Err(FlashError::DataOverlap(address));
                }

                self.data_blocks
                    .insert(position, FlashDataBlock { address, data })
            }
        }

        Ok(())
    }

    /// Layouts the data for the given flash algorithm.
    ///
    /// Every data block must be inside the flash of the algorithm. Pages are aligned
    /// to the program chunk size of the algorithm and padded with the erased byte value.
    pub(super) fn build_sectors_and_pages(
        &self,
        flash_algorithm: &FlashAlgorithm,
    ) -> Result<FlashLayout, FlashError> {
        let properties = &flash_algorithm.flash_properties;
        let mut sectors: Vec<FlashSector> = Vec::new();
        let mut pages: Vec<FlashPage> = Vec::new();
        let mut data_size = 0;

        for block in &self.data_blocks {
            if !properties
                .address_range
                .contains_range(&block.address_range())
            {
                return Err(FlashError::ImageExceedsFlash {
                    name: flash_algorithm.name.clone(),
                    range: block.address_range(),
                    flash: properties.address_range.clone(),
                });
            }

            data_size += block.size();

            let mut pos = 0;
            while pos < block.data.len() {
                let flash_address = block.address + pos as u64;

                let needs_page = pages
                    .last()
                    .map_or(true, |page| flash_address >= page.address + page.size() as u64);

                if needs_page {
                    let chunk = flash_algorithm
                        .chunk_info(flash_address)
                        .ok_or(FlashError::InvalidFlashAddress(flash_address))?;
                    add_sectors(flash_algorithm, &mut sectors, chunk.address_range())?;

                    tracing::trace!(
                        "Added Page ({:#010x}..{:#010x})",
                        chunk.base_address,
                        chunk.base_address + chunk.size as u64
                    );
                    pages.push(FlashPage::new(&chunk, properties.erased_byte_value));
                }

                let page = pages
                    .last_mut()
                    .ok_or(FlashError::InvalidFlashAddress(flash_address))?;

                let offset = (flash_address - page.address) as usize;
                let amount = usize::min(page.data.len() - offset, block.data.len() - pos);
                page.write(offset, &block.data[pos..pos + amount]);
                pos += amount;
            }
        }

        let fills = pages
            .iter()
            .enumerate()
            .flat_map(|(page_index, page)| {
                page.gaps().map(move |gap| FlashFill {
                    address: page.address + gap.start as u64,
                    size: gap.end - gap.start,
                    page_index,
                })
            })
            .collect();

        Ok(FlashLayout {
            sectors,
            pages,
            fills,
            data_size,
        })
    }
}

/// Adds every sector touched by `range` that is not in `sectors` yet.
fn add_sectors(
    flash_algorithm: &FlashAlgorithm,
    sectors: &mut Vec<FlashSector>,
    range: Range<u64>,
) -> Result<(), FlashError> {
    let mut address = range.start;
    while address < range.end {
        match sectors.last() {
            Some(sector) if address < sector.address + sector.size => {
                address = sector.address + sector.size;
            }
            _ => {
                let sector_info = flash_algorithm
                    .sector_info(address)
                    .ok_or(FlashError::InvalidFlashAddress(address))?;
                tracing::trace!(
                    "Added Sector ({:#010x}..{:#010x})",
                    sector_info.base_address,
                    sector_info.base_address + sector_info.size
                );
                sectors.push(FlashSector::new(&sector_info));
                address = sector_info.base_address + sector_info.size;
            }
        }
    }
    Ok(())
}
