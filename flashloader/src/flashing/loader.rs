use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::time::Instant;

use flashloader_target::{MemoryMap, MemoryRange, NvmRegion, TargetDescriptionSource};
use ihex::Record;

use super::builder::FlashBuilder;
use super::flasher::{Flasher, ProgramOptions};
use super::{
    BinOptions, DownloadOptions, FileDownloadError, FlashAlgorithm, FlashError, FlashLayout,
    MismatchError, ProgramResult,
};
use crate::session::Session;

/// `FlashLoader` is a struct which manages the flashing of any chunks of data onto any sections of flash.
///
/// Use [add_data()](FlashLoader::add_data) to add a chunk of data.
/// Once you are done adding all your data, use `commit()` to flash the data.
/// The flash loader will make sure to select the appropriate flash region for the right data chunks.
/// Region crossing data chunks are allowed as long as the regions are contiguous.
pub struct FlashLoader {
    memory_map: MemoryMap,
    builder: FlashBuilder,
    /// Source of the flash description,
    /// used for diagnostics.
    source: TargetDescriptionSource,
}

impl FlashLoader {
    /// Create a new flash loader.
    pub fn new(memory_map: MemoryMap, source: TargetDescriptionSource) -> Self {
        Self {
            memory_map,
            builder: FlashBuilder::new(),
            source,
        }
    }

    /// Check the given address range is completely covered by the memory map,
    /// possibly by multiple memory regions.
    fn check_data_in_memory_map(&self, range: Range<u64>) -> Result<(), FlashError> {
        let mut address = range.start;
        while address < range.end {
            match self.memory_map.region_for_address(address) {
                Some(region) => address = region.address_range().end,
                None => {
                    return Err(FlashError::NoSuitableNvm {
                        start: range.start,
                        end: range.end,
                        description_source: self.source.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Stages a chunk of data to be programmed.
    ///
    /// The chunk can cross flash boundaries as long as one flash region connects to another flash region.
    pub fn add_data(&mut self, address: u64, data: &[u8]) -> Result<(), FlashError> {
        tracing::trace!(
            "Adding data at address {:#010x} with size {} bytes",
            address,
            data.len()
        );

        let end = address + data.len() as u64;
        self.check_data_in_memory_map(address..end)?;

        // Every staged block belongs to exactly one region.
        let mut start = address;
        while start < end {
            let region_end = self
                .memory_map
                .region_for_address(start)
                .map(|region| region.address_range().end.min(end))
                .ok_or(FlashError::AddressNotInRegion {
                    address: start,
                    range: address..end,
                })?;

            let offset = (start - address) as usize;
            let length = (region_end - start) as usize;
            self.builder
                .add_data(start, data[offset..offset + length].to_vec())?;

            start = region_end;
        }

        Ok(())
    }

    /// The data staged so far, as (address, bytes) pairs sorted by address.
    pub fn data(&self) -> impl Iterator<Item = (u64, &[u8])> + '_ {
        self.builder
            .data_blocks()
            .iter()
            .map(|block| (block.address(), block.data()))
    }

    /// Returns `true` if no data was staged.
    pub fn is_empty(&self) -> bool {
        self.builder.is_empty()
    }

    /// Reads the data from the binary file and adds it to the loader without splitting it into flash instructions yet.
    pub fn load_bin_data<T: Read + Seek>(
        &mut self,
        file: &mut T,
        options: BinOptions,
    ) -> Result<(), FileDownloadError> {
        // Skip the specified bytes.
        file.seek(SeekFrom::Start(u64::from(options.skip)))?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let address = match options.base_address {
            Some(address) => address,
            // If no base address is specified use the start of the boot memory.
            None => self
                .memory_map
                .boot_memory()
                .map(|region| region.range.start)
                .unwrap_or_default(),
        };

        self.add_data(address, &buf)?;

        Ok(())
    }

    /// Reads the HEX data segments and adds them as loadable data blocks to the loader.
    /// This does not create any flash loader instructions yet.
    pub fn load_hex_data<T: Read>(&mut self, file: &mut T) -> Result<(), FileDownloadError> {
        let mut base_address = 0;

        let mut data = String::new();
        file.read_to_string(&mut data)?;

        for record in ihex::Reader::new(&data) {
            let record = record?;
            match record {
                Record::Data { offset, value } => {
                    let offset = base_address + offset as u64;
                    self.add_data(offset, &value)?;
                }
                Record::EndOfFile => (),
                Record::ExtendedSegmentAddress(address) => {
                    base_address = (address as u64) * 16;
                }
                Record::StartSegmentAddress { .. } => (),
                Record::ExtendedLinearAddress(address) => {
                    base_address = (address as u64) << 16;
                }
                Record::StartLinearAddress(_) => (),
            };
        }
        Ok(())
    }

    /// The staged data inside `range`.
    fn builder_for_range(&self, range: &Range<u64>) -> Result<FlashBuilder, FlashError> {
        let mut builder = FlashBuilder::new();
        for block in self
            .builder
            .data_blocks()
            .iter()
            .filter(|block| range.contains_range(&block.address_range()))
        {
            builder.add_data(block.address(), block.data().to_vec())?;
        }
        Ok(builder)
    }

    /// Resolves the flash algorithm of every flash region with staged data and lays
    /// out the data for it.
    ///
    /// Nothing on the target is touched here, so geometry errors surface before any
    /// sector is erased.
    fn plan(
        &self,
        session: &Session,
    ) -> Result<Vec<(NvmRegion, FlashAlgorithm, FlashLayout)>, FlashError> {
        let target = session.target();
        let mut plans = Vec::new();

        for region in self.memory_map.nvm_regions() {
            let builder = self.builder_for_range(&region.range)?;
            if builder.is_empty() {
                continue;
            }

            let raw = target.flash_algorithm_for_region(region)?;
            tracing::debug!(
                "Using algorithm '{}' for region {:#010x?}",
                raw.name,
                region.range
            );

            let algorithm = FlashAlgorithm::assemble_from_raw(
                raw,
                &target.memory_map,
                target.instruction_set,
            )?;
            let layout = builder.build_sectors_and_pages(&algorithm)?;

            plans.push((region.clone(), algorithm, layout));
        }

        Ok(plans)
    }

    /// Writes all the stored data chunks to flash.
    ///
    /// Requires a session with an attached target that has a known flash algorithm.
    /// Flash regions are programmed first, one after the other, then the data for RAM
    /// is written. The first error stops the commit.
    pub fn commit(
        &self,
        session: &mut Session,
        options: DownloadOptions,
    ) -> Result<ProgramResult, FlashError> {
        tracing::debug!("Committing flash loader data");
        for (address, data) in self.data() {
            tracing::debug!(
                "    region: {:08x}-{:08x} ({} bytes)",
                address,
                address + data.len() as u64,
                data.len()
            );
        }

        if self.memory_map != session.target().memory_map {
            tracing::warn!("Memory map of flash loader does not match memory map of target!");
        }

        let start = Instant::now();
        let plans = self.plan(session)?;

        let progress = options.progress.clone().unwrap_or_default();
        let program_options = ProgramOptions {
            full_erase: options.full_erase,
            double_buffering: !options.disable_double_buffering,
            skip_erased_sectors: options.skip_erased_sectors,
            verify: options.verify,
        };

        // Mismatch offsets count from the first flash byte of the whole image.
        let image_start = plans
            .iter()
            .filter_map(|(_, _, layout)| layout.image_start())
            .min();

        let mut bytes_written = 0;
        let mut sectors_erased = 0;
        let mut verify_result: Option<Result<(), MismatchError>> = None;

        for (region, algorithm, layout) in plans {
            tracing::debug!(
                "Programming region {:?} ({:#010x?})",
                region.name,
                region.range
            );

            let mut flasher = Flasher::new(
                session.access(),
                algorithm,
                options.timeouts,
                progress.clone(),
            );
            let report = flasher.run_program(&layout, &program_options)?;

            bytes_written += report.bytes_written;
            sectors_erased += report.sectors_erased;
            let region_result = report.verify_result.map(|result| {
                result.map_err(|mismatch| MismatchError {
                    offset: mismatch.address - image_start.unwrap_or(mismatch.address),
                    ..mismatch
                })
            });
            verify_result = match (verify_result, region_result) {
                // Keep the first mismatch.
                (Some(Err(mismatch)), _) => Some(Err(mismatch)),
                (_, Some(result)) => Some(result),
                (previous, None) => previous,
            };
        }

        // Commit RAM last, because NVM flashing overwrites RAM
        for region in self.memory_map.ram_regions() {
            for block in self
                .builder
                .data_blocks()
                .iter()
                .filter(|block| region.range.contains_range(&block.address_range()))
            {
                tracing::info!(
                    "Ram write program data @ {:X} {} bytes",
                    block.address(),
                    block.size()
                );
                session
                    .access()
                    .write_8(block.address(), block.data())
                    .map_err(FlashError::Memory)?;
                bytes_written += block.size();
            }
        }

        let result = ProgramResult {
            bytes_written,
            sectors_erased,
            duration: start.elapsed(),
            verify_result,
        };
        tracing::info!(
            "Programmed {} bytes, erased {} sectors in {:?}",
            result.bytes_written,
            result.sectors_erased,
            result.duration
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use flashloader_target::{MemoryRegion, NvmRegion, RamRegion};
    use pretty_assertions::assert_eq;

    use super::*;

    fn memory_map() -> MemoryMap {
        MemoryMap::new(vec![
            MemoryRegion::Nvm(NvmRegion {
                name: Some("bank1".into()),
                range: 0x0800_0000..0x0800_4000,
                sector_size: Some(0x800),
                page_size: Some(0x400),
                is_boot_memory: true,
                algorithm: None,
            }),
            MemoryRegion::Nvm(NvmRegion {
                name: Some("bank2".into()),
                range: 0x0800_4000..0x0800_8000,
                sector_size: Some(0x800),
                page_size: Some(0x400),
                is_boot_memory: false,
                algorithm: None,
            }),
            MemoryRegion::Ram(RamRegion {
                name: Some("sram1".into()),
                range: 0x2000_0000..0x2001_0000,
                is_boot_memory: false,
            }),
        ])
        .unwrap()
    }

    fn loader() -> FlashLoader {
        FlashLoader::new(memory_map(), TargetDescriptionSource::BuiltIn)
    }

    #[test]
    fn data_outside_of_memory_is_rejected() {
        let mut loader = loader();

        let error = loader.add_data(0x0800_7ff0, &[0; 0x20]).unwrap_err();

        assert!(matches!(
            error,
            FlashError::NoSuitableNvm {
                start: 0x0800_7ff0,
                end: 0x0800_8010,
                ..
            }
        ));
        assert!(error.is_geometry_error());
        assert!(loader.is_empty());
    }

    #[test]
    fn data_is_split_at_region_boundaries() {
        let mut loader = loader();
        let data: Vec<u8> = (0..0x20).collect();

        loader.add_data(0x0800_3ff0, &data).unwrap();

        let blocks: Vec<(u64, Vec<u8>)> = loader
            .data()
            .map(|(address, data)| (address, data.to_vec()))
            .collect();
        assert_eq!(
            blocks,
            vec![
                (0x0800_3ff0, data[..0x10].to_vec()),
                (0x0800_4000, data[0x10..].to_vec()),
            ]
        );
    }

    #[test]
    fn overlapping_data_is_rejected() {
        let mut loader = loader();
        loader.add_data(0x0800_0000, &[1; 0x10]).unwrap();

        let error = loader.add_data(0x0800_0008, &[2; 0x10]).unwrap_err();

        assert!(matches!(error, FlashError::DataOverlap(0x0800_0008)));
    }

    #[test]
    fn bin_data_defaults_to_boot_memory() {
        let mut loader = loader();
        let mut file = Cursor::new(vec![0xaa, 0xbb, 0x01, 0x02, 0x03]);

        loader
            .load_bin_data(
                &mut file,
                BinOptions {
                    base_address: None,
                    skip: 2,
                },
            )
            .unwrap();

        let blocks: Vec<(u64, &[u8])> = loader.data().collect();
        assert_eq!(blocks, vec![(0x0800_0000, &[0x01, 0x02, 0x03][..])]);
    }

    #[test]
    fn hex_data_uses_extended_linear_address() {
        let mut loader = loader();
        let hex = ":020000040800F2\n\
                   :0400100001020304E2\n\
                   :020000042000DA\n\
                   :02000000AABB99\n\
                   :00000001FF\n";

        loader.load_hex_data(&mut Cursor::new(hex)).unwrap();

        let blocks: Vec<(u64, &[u8])> = loader.data().collect();
        assert_eq!(
            blocks,
            vec![
                (0x0800_0010, &[0x01, 0x02, 0x03, 0x04][..]),
                (0x2000_0000, &[0xaa, 0xbb][..]),
            ]
        );
    }

    #[test]
    fn corrupt_hex_is_an_ihex_error() {
        let mut loader = loader();

        let error = loader
            .load_hex_data(&mut Cursor::new(":0400100001020304FF\n"))
            .unwrap_err();

        assert!(matches!(error, FileDownloadError::IhexRead(_)));
    }
}
