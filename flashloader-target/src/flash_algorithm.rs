use crate::memory::SectorDescription;
use crate::serialize::{hex_option, hex_u_int, words_from_base64, words_to_base64};
use crate::DescriptorError;

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Offsets and sizes of the sections inside the instruction image, relative to `load_address`.
///
/// The read-only and read-write sections are part of the instruction image.
/// The zero-initialised section has to be cleared before the algorithm runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSections {
    /// Start of the read-only section.
    #[serde(serialize_with = "hex_u_int")]
    pub ro_start: u64,
    /// Size of the read-only section.
    #[serde(serialize_with = "hex_u_int")]
    pub ro_size: u64,
    /// Start of the initialised read-write section.
    #[serde(serialize_with = "hex_u_int")]
    pub rw_start: u64,
    /// Size of the initialised read-write section.
    #[serde(serialize_with = "hex_u_int")]
    pub rw_size: u64,
    /// Start of the zero-initialised section.
    #[serde(serialize_with = "hex_u_int")]
    pub zi_start: u64,
    /// Size of the zero-initialised section.
    #[serde(serialize_with = "hex_u_int")]
    pub zi_size: u64,
}

/// The raw flash algorithm is the description of a flash algorithm,
/// as supplied by a chip descriptor.
///
/// Entry points are byte offsets relative to `load_address`. All other addresses
/// (`static_base`, stack bounds, `begin_data`, `page_buffers`, `flash_start`) are absolute.
///
/// Before it can be used for flashing, it has to be assembled against a memory map,
/// which validates it and resolves the entry points to absolute addresses.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFlashAlgorithm {
    /// The name of the flash algorithm.
    pub name: String,
    /// The description of the algorithm.
    #[serde(default)]
    pub description: String,
    /// Whether this flash algorithm is the default one or not.
    #[serde(default)]
    pub default: bool,
    /// Memory address where the instruction image is loaded to.
    ///
    /// The first word of the image is the breakpoint trampoline the routines return to.
    #[serde(serialize_with = "hex_u_int")]
    pub load_address: u64,
    /// The position-independent code of the algorithm, as 32-bit words.
    #[serde(
        deserialize_with = "words_from_base64",
        serialize_with = "words_to_base64"
    )]
    pub instructions: Vec<u32>,
    /// Offset of the `Init()` entry point. Optional.
    #[serde(default, serialize_with = "hex_option")]
    pub pc_init: Option<u64>,
    /// Offset of the `UnInit()` entry point. Optional.
    #[serde(default, serialize_with = "hex_option")]
    pub pc_uninit: Option<u64>,
    /// Offset of the `ProgramPage()` entry point.
    #[serde(serialize_with = "hex_u_int")]
    pub pc_program_page: u64,
    /// Offset of the `EraseSector()` entry point.
    #[serde(serialize_with = "hex_u_int")]
    pub pc_erase_sector: u64,
    /// Offset of the `EraseAll()` entry point. Optional.
    #[serde(default, serialize_with = "hex_option")]
    pub pc_erase_all: Option<u64>,
    /// Value of the static base register (R9 on ARM) while a routine runs.
    #[serde(serialize_with = "hex_u_int")]
    pub static_base: u64,
    /// Initial stack pointer. The stack grows down towards `end_stack`.
    #[serde(serialize_with = "hex_u_int")]
    pub begin_stack: u64,
    /// Lowest address the stack may reach.
    #[serde(serialize_with = "hex_u_int")]
    pub end_stack: u64,
    /// Start of the RAM data area. Used as the single page buffer if `page_buffers` is empty.
    #[serde(serialize_with = "hex_u_int")]
    pub begin_data: u64,
    /// The page size of the flash, in bytes.
    #[serde(serialize_with = "hex_u_int")]
    pub page_size: u32,
    /// The smallest number of bytes the program routine accepts. Zero means one page.
    #[serde(default, serialize_with = "hex_u_int")]
    pub min_program_length: u32,
    /// Page buffer addresses. Two or more enable double buffered programming.
    #[serde(default)]
    pub page_buffers: Vec<u64>,
    /// Whether the CRC analyzer blob is supported.
    #[serde(default)]
    pub analyzer_supported: bool,
    /// Address the CRC analyzer blob would be loaded to.
    #[serde(default, serialize_with = "hex_u_int")]
    pub analyzer_address: u64,
    /// Layout of the data sections inside the image.
    #[serde(default)]
    pub sections: DataSections,
    /// Start address of the flash this algorithm programs.
    #[serde(serialize_with = "hex_u_int")]
    pub flash_start: u64,
    /// Size of the flash this algorithm programs, in bytes.
    #[serde(serialize_with = "hex_u_int")]
    pub flash_size: u64,
    /// The value of a byte in flash that was just erased.
    #[serde(
        default = "default_erased_byte_value",
        serialize_with = "hex_u_int"
    )]
    pub erased_byte_value: u8,
    /// The sector table, sorted ascending by offset, starting at offset 0.
    pub sector_sizes: Vec<SectorDescription>,
}

fn default_erased_byte_value() -> u8 {
    0xff
}

impl RawFlashAlgorithm {
    /// The address range of the flash programmed by this algorithm.
    pub fn flash_range(&self) -> Range<u64> {
        self.flash_start..self.flash_start + self.flash_size
    }

    /// Size of the instruction image in bytes.
    pub fn image_size(&self) -> u64 {
        self.instructions.len() as u64 * 4
    }

    /// The largest number of bytes a single program call writes.
    pub fn program_chunk_size(&self) -> u32 {
        if self.min_program_length == 0 {
            self.page_size
        } else {
            self.min_program_length
        }
    }

    /// Returns the size of the sector covering the flash `offset`.
    ///
    /// Uses the last sector table entry whose offset is not above `offset`.
    /// Offsets outside of `[0, flash_size)` have no sector.
    pub fn sector_size_at(&self, offset: u64) -> Option<u64> {
        if offset >= self.flash_size {
            return None;
        }

        self.sector_sizes
            .iter()
            .rfind(|sector| sector.offset <= offset)
            .map(|sector| sector.size)
    }

    /// Check the invariants the flashing engine relies on.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        let name = || self.name.clone();

        if self.instructions.is_empty() {
            return Err(DescriptorError::EmptyInstructions { name: name() });
        }

        if self.page_size == 0 || self.page_size % 4 != 0 {
            return Err(DescriptorError::InvalidPageSize {
                name: name(),
                page_size: self.page_size,
            });
        }

        let chunk = self.program_chunk_size();
        if chunk > self.page_size || self.page_size % chunk != 0 {
            return Err(DescriptorError::InvalidMinProgramLength {
                name: name(),
                min_program_length: self.min_program_length,
                page_size: self.page_size,
            });
        }

        if self.begin_stack <= self.end_stack {
            return Err(DescriptorError::InvalidStack {
                name: name(),
                begin_stack: self.begin_stack,
                end_stack: self.end_stack,
            });
        }

        let image_size = self.image_size();
        let entry_points = [
            ("init", self.pc_init),
            ("uninit", self.pc_uninit),
            ("program_page", Some(self.pc_program_page)),
            ("erase_sector", Some(self.pc_erase_sector)),
            ("erase_all", self.pc_erase_all),
        ];
        for (routine, offset) in entry_points {
            if let Some(offset) = offset {
                // Thumb entry points carry the low bit.
                if (offset & !1) >= image_size {
                    return Err(DescriptorError::EntryPointOutOfRange {
                        name: name(),
                        routine,
                        offset,
                        image_size,
                    });
                }
            }
        }

        self.validate_sector_table()
    }

    fn validate_sector_table(&self) -> Result<(), DescriptorError> {
        let invalid = |reason| DescriptorError::InvalidSectorTable {
            name: self.name.clone(),
            reason,
        };

        if self.flash_size == 0 {
            return Err(invalid("the flash size is zero"));
        }

        let Some(first) = self.sector_sizes.first() else {
            return Err(invalid("the table is empty"));
        };
        if first.offset != 0 {
            return Err(invalid("the first entry does not start at offset 0"));
        }

        for (index, sector) in self.sector_sizes.iter().enumerate() {
            if sector.size == 0 {
                return Err(invalid("a sector size is zero"));
            }

            let end = match self.sector_sizes.get(index + 1) {
                Some(next) if next.offset <= sector.offset => {
                    return Err(invalid("offsets are not strictly ascending"));
                }
                Some(next) => next.offset,
                None => self.flash_size,
            };

            if end > self.flash_size {
                return Err(invalid("an entry starts beyond the end of the flash"));
            }
            if (end - sector.offset) % sector.size != 0 {
                return Err(invalid(
                    "an entry does not cover a whole number of sectors up to the next entry",
                ));
            }
        }

        log::trace!(
            "Sector table of '{}' covers {:#x} bytes in {} groups",
            self.name,
            self.flash_size,
            self.sector_sizes.len()
        );

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn algorithm(sector_sizes: Vec<SectorDescription>, flash_size: u64) -> RawFlashAlgorithm {
        RawFlashAlgorithm {
            name: "test".into(),
            load_address: 0x2000_0000,
            instructions: vec![0xe7fd_be00; 0x20],
            pc_init: Some(0x11),
            pc_uninit: Some(0x21),
            pc_program_page: 0x31,
            pc_erase_sector: 0x41,
            pc_erase_all: Some(0x51),
            static_base: 0x2000_0080,
            begin_stack: 0x2000_1000,
            end_stack: 0x2000_0800,
            begin_data: 0x2000_1000,
            page_size: 0x400,
            min_program_length: 0x400,
            flash_start: 0x0800_0000,
            flash_size,
            erased_byte_value: 0xff,
            sector_sizes,
            ..Default::default()
        }
    }

    fn sector(offset: u64, size: u64) -> SectorDescription {
        SectorDescription { offset, size }
    }

    #[test]
    fn uniform_sector_lookup() {
        let algo = algorithm(vec![sector(0, 0x800)], 0x10_0000);
        algo.validate().unwrap();

        assert_eq!(algo.sector_size_at(0), Some(0x800));
        assert_eq!(algo.sector_size_at(0xf_ffff), Some(0x800));
        assert_eq!(algo.sector_size_at(0x10_0000), None);
    }

    #[test]
    fn mixed_sector_lookup() {
        let algo = algorithm(
            vec![sector(0, 0x4000), sector(0x1_0000, 0x1_0000), sector(0x2_0000, 0x2_0000)],
            0x10_0000,
        );
        algo.validate().unwrap();

        assert_eq!(algo.sector_size_at(0x0), Some(0x4000));
        assert_eq!(algo.sector_size_at(0xffff), Some(0x4000));
        assert_eq!(algo.sector_size_at(0x1_0000), Some(0x1_0000));
        assert_eq!(algo.sector_size_at(0x1_ffff), Some(0x1_0000));
        assert_eq!(algo.sector_size_at(0x2_0000), Some(0x2_0000));
        assert_eq!(algo.sector_size_at(0xf_ffff), Some(0x2_0000));
    }

    #[test]
    fn sector_table_partitions_flash() {
        let algo = algorithm(
            vec![sector(0, 0x100), sector(0x400, 0x200), sector(0x800, 0x800)],
            0x2000,
        );
        algo.validate().unwrap();

        // Walk the flash sector by sector and check that every offset inside a sector
        // resolves to that sector's size.
        let mut offset = 0;
        let mut covered = 0;
        while offset < algo.flash_size {
            let size = algo.sector_size_at(offset).unwrap();
            for inner in offset..offset + size {
                assert_eq!(algo.sector_size_at(inner), Some(size));
            }
            covered += size;
            offset += size;
        }
        assert_eq!(offset, algo.flash_size);
        assert_eq!(covered, algo.flash_size);
    }

    #[test]
    fn table_must_start_at_zero() {
        let algo = algorithm(vec![sector(0x100, 0x100)], 0x1000);
        assert!(matches!(
            algo.validate(),
            Err(DescriptorError::InvalidSectorTable { .. })
        ));
    }

    #[test]
    fn table_must_be_ascending() {
        let algo = algorithm(vec![sector(0, 0x100), sector(0x800, 0x200), sector(0x400, 0x100)], 0x1000);
        assert!(matches!(
            algo.validate(),
            Err(DescriptorError::InvalidSectorTable { .. })
        ));
    }

    #[test]
    fn table_must_not_leave_partial_sectors() {
        // 0x300 bytes cannot be split into 0x200 byte sectors.
        let algo = algorithm(vec![sector(0, 0x200), sector(0x300, 0x100)], 0x1000);
        assert!(matches!(
            algo.validate(),
            Err(DescriptorError::InvalidSectorTable { .. })
        ));

        let algo = algorithm(vec![sector(0, 0x300)], 0x1000);
        assert!(matches!(
            algo.validate(),
            Err(DescriptorError::InvalidSectorTable { .. })
        ));
    }

    #[test]
    fn entry_points_must_be_inside_the_image() {
        let mut algo = algorithm(vec![sector(0, 0x800)], 0x10_0000);
        algo.pc_erase_all = Some(0x1000);

        assert_eq!(
            algo.validate(),
            Err(DescriptorError::EntryPointOutOfRange {
                name: "test".into(),
                routine: "erase_all",
                offset: 0x1000,
                image_size: 0x80,
            })
        );
    }

    #[test]
    fn min_program_length_must_divide_page_size() {
        let mut algo = algorithm(vec![sector(0, 0x800)], 0x10_0000);
        algo.min_program_length = 0x300;
        assert!(matches!(
            algo.validate(),
            Err(DescriptorError::InvalidMinProgramLength { .. })
        ));

        algo.min_program_length = 0;
        assert_eq!(algo.program_chunk_size(), 0x400);
        algo.validate().unwrap();
    }

    #[test]
    fn stack_grows_down() {
        let mut algo = algorithm(vec![sector(0, 0x800)], 0x10_0000);
        algo.end_stack = algo.begin_stack;
        assert!(matches!(
            algo.validate(),
            Err(DescriptorError::InvalidStack { .. })
        ));
    }

    #[test]
    fn algorithm_from_yaml() {
        let descriptor = r#"
name: demo
load_address: 0x20000000
instructions: AL7957/zT48=
pc_init: 0x5
pc_program_page: 0x5
pc_erase_sector: 0x5
static_base: 0x20000224
begin_stack: 0x20001a30
end_stack: 0x20000a30
begin_data: 0x20001000
page_size: 0x400
flash_start: 0x8000000
flash_size: 0x100000
sector_sizes:
  - offset: 0x0
    size: 0x800
"#;
        let parsed: RawFlashAlgorithm = serde_yaml::from_str(descriptor).unwrap();
        assert_eq!(parsed.instructions, vec![0xe7fd_be00, 0x8f4f_f3bf]);
        assert_eq!(parsed.erased_byte_value, 0xff);
        assert_eq!(parsed.pc_uninit, None);
        assert!(parsed.page_buffers.is_empty());
        parsed.validate().unwrap();
    }
}
