use flashloader_target::{
    Chip, ChipFamily, InstructionSet, MemoryMap, MemoryRange, NvmRegion, RawFlashAlgorithm,
    RegisterWrite, TargetDescriptionSource,
};

use super::RegistryError;
use crate::flashing::{FlashError, FlashLoader};

/// This describes a complete target with a fixed chip model and variant.
#[derive(Clone, Debug)]
pub struct Target {
    /// The name of the target.
    pub name: String,
    /// File name of the SVD register description of the target.
    pub svd: Option<String>,
    /// Instruction set of the core running the flash algorithms.
    pub instruction_set: InstructionSet,
    /// The memory map of the target.
    pub memory_map: MemoryMap,
    /// The flash algorithms available for the target.
    pub flash_algorithms: Vec<RawFlashAlgorithm>,
    /// Register writes applied when attaching to the target.
    pub debug_freeze: Vec<RegisterWrite>,
    /// Source of the target description. Used for diagnostics.
    pub source: TargetDescriptionSource,
}

impl Target {
    /// Create a new target for the given details.
    ///
    /// The flash algorithms are resolved from the algorithm list of the chip
    /// and from the algorithms attached to its flash regions.
    pub fn new(family: &ChipFamily, chip: &Chip) -> Result<Target, RegistryError> {
        let region_algorithms = chip
            .memory_map
            .nvm_regions()
            .filter_map(|region| region.algorithm.as_ref());

        let mut flash_algorithms: Vec<RawFlashAlgorithm> = Vec::new();
        for algo_name in chip.flash_algorithms.iter().chain(region_algorithms) {
            if flash_algorithms.iter().any(|algo| &algo.name == algo_name) {
                continue;
            }

            let algo = family
                .get_algorithm(algo_name)
                .ok_or_else(|| RegistryError::AlgorithmNotFound(algo_name.clone()))?;

            flash_algorithms.push(algo.clone());
        }

        Ok(Target {
            name: chip.name.clone(),
            svd: chip.svd.clone(),
            instruction_set: chip.instruction_set,
            memory_map: chip.memory_map.clone(),
            flash_algorithms,
            debug_freeze: chip.debug_freeze.clone(),
            source: family.source.clone(),
        })
    }

    /// Gets the flash algorithm with the given name.
    pub fn flash_algorithm_by_name(&self, name: &str) -> Option<&RawFlashAlgorithm> {
        self.flash_algorithms.iter().find(|a| a.name == name)
    }

    /// Selects the flash algorithm that programs `region`.
    ///
    /// An algorithm named by the region wins. Otherwise an algorithm whose flash covers
    /// the whole region is used, preferring the one marked as default.
    pub fn flash_algorithm_for_region(
        &self,
        region: &NvmRegion,
    ) -> Result<&RawFlashAlgorithm, FlashError> {
        let not_attached = || FlashError::NoFlashLoaderAlgorithmAttached {
            range: region.range.clone(),
        };

        if let Some(name) = &region.algorithm {
            return self.flash_algorithm_by_name(name).ok_or_else(not_attached);
        }

        let algorithms: Vec<&RawFlashAlgorithm> = self
            .flash_algorithms
            .iter()
            .filter(|algo| algo.flash_range().contains_range(&region.range))
            .collect();

        tracing::debug!(
            "Algorithms for region {:#010x?}: {:?}",
            region.range,
            algorithms.iter().map(|a| &a.name).collect::<Vec<_>>()
        );

        match algorithms.len() {
            0 => Err(not_attached()),
            1 => Ok(algorithms[0]),
            _ => algorithms
                .iter()
                .copied()
                .find(|algo| algo.default)
                .or_else(|| {
                    tracing::warn!(
                        "Several flash algorithms cover {:#010x?} and none is marked as default, using '{}'.",
                        region.range,
                        algorithms[0].name
                    );
                    algorithms.first().copied()
                })
                .ok_or_else(not_attached),
        }
    }

    /// Creates a [`FlashLoader`] for this target, which can be used
    /// to program its non-volatile memory.
    pub fn flash_loader(&self) -> FlashLoader {
        FlashLoader::new(self.memory_map.clone(), self.source.clone())
    }
}

#[cfg(test)]
mod tests {
    use flashloader_target::{MemoryRegion, RamRegion, SectorDescription};
    use pretty_assertions::assert_eq;

    use super::*;

    fn algorithm(name: &str, flash: std::ops::Range<u64>, default: bool) -> RawFlashAlgorithm {
        RawFlashAlgorithm {
            name: name.into(),
            description: String::new(),
            default,
            load_address: 0x2000_0000,
            instructions: vec![0xe7fd_be00; 0x10],
            pc_init: None,
            pc_uninit: None,
            pc_program_page: 0x1,
            pc_erase_sector: 0x5,
            pc_erase_all: None,
            static_base: 0x2000_0040,
            begin_stack: 0x2000_1000,
            end_stack: 0x2000_0800,
            begin_data: 0x2000_1000,
            page_size: 0x100,
            min_program_length: 0,
            page_buffers: vec![],
            analyzer_supported: false,
            analyzer_address: 0,
            sections: Default::default(),
            flash_start: flash.start,
            flash_size: flash.end - flash.start,
            erased_byte_value: 0xff,
            sector_sizes: vec![SectorDescription {
                offset: 0,
                size: 0x1000,
            }],
        }
    }

    fn flash(range: std::ops::Range<u64>, algorithm: Option<&str>) -> NvmRegion {
        NvmRegion {
            name: None,
            range,
            sector_size: None,
            page_size: None,
            is_boot_memory: false,
            algorithm: algorithm.map(Into::into),
        }
    }

    fn target(flash_algorithms: Vec<RawFlashAlgorithm>) -> Target {
        Target {
            name: "test".into(),
            svd: None,
            instruction_set: InstructionSet::Thumb2,
            memory_map: MemoryMap::new(vec![MemoryRegion::Ram(RamRegion {
                name: None,
                range: 0x2000_0000..0x2001_0000,
                is_boot_memory: false,
            })])
            .unwrap(),
            flash_algorithms,
            debug_freeze: vec![],
            source: TargetDescriptionSource::BuiltIn,
        }
    }

    #[test]
    fn algorithm_named_by_region_wins() {
        let target = target(vec![
            algorithm("main", 0x0..0x10000, true),
            algorithm("alt", 0x0..0x10000, false),
        ]);

        let algo = target
            .flash_algorithm_for_region(&flash(0x0..0x10000, Some("alt")))
            .unwrap();
        assert_eq!(algo.name, "alt");
    }

    #[test]
    fn algorithm_is_found_by_containment() {
        let target = target(vec![
            algorithm("low", 0x0..0x10000, false),
            algorithm("high", 0x10000..0x20000, false),
        ]);

        let algo = target
            .flash_algorithm_for_region(&flash(0x10000..0x18000, None))
            .unwrap();
        assert_eq!(algo.name, "high");
    }

    #[test]
    fn default_algorithm_is_preferred() {
        let target = target(vec![
            algorithm("first", 0x0..0x10000, false),
            algorithm("preferred", 0x0..0x10000, true),
        ]);

        let algo = target
            .flash_algorithm_for_region(&flash(0x0..0x10000, None))
            .unwrap();
        assert_eq!(algo.name, "preferred");
    }

    #[test]
    fn region_without_algorithm() {
        let target = target(vec![algorithm("small", 0x0..0x8000, true)]);

        let error = target
            .flash_algorithm_for_region(&flash(0x0..0x10000, None))
            .unwrap_err();
        assert!(matches!(
            error,
            FlashError::NoFlashLoaderAlgorithmAttached { range } if range == (0x0..0x10000)
        ));

        let error = target
            .flash_algorithm_for_region(&flash(0x0..0x8000, Some("missing")))
            .unwrap_err();
        assert!(matches!(
            error,
            FlashError::NoFlashLoaderAlgorithmAttached { .. }
        ));
    }

    #[test]
    fn target_collects_region_algorithms() {
        let mut chip_flash = flash(0x0..0x10000, Some("region_algo"));
        chip_flash.is_boot_memory = true;

        let family = ChipFamily {
            name: "family".into(),
            manufacturer: None,
            variants: vec![],
            flash_algorithms: vec![
                algorithm("chip_algo", 0x0..0x10000, true),
                algorithm("region_algo", 0x0..0x10000, false),
                algorithm("unused", 0x0..0x10000, false),
            ],
            source: TargetDescriptionSource::External,
        };
        let chip = Chip {
            name: "chip".into(),
            svd: None,
            instruction_set: InstructionSet::Thumb2,
            memory_map: MemoryMap::new(vec![MemoryRegion::Nvm(chip_flash)]).unwrap(),
            flash_algorithms: vec!["chip_algo".into(), "region_algo".into()],
            debug_freeze: vec![],
        };

        let target = Target::new(&family, &chip).unwrap();

        let names: Vec<&str> = target
            .flash_algorithms
            .iter()
            .map(|a| a.name.as_str())
            .collect();
        assert_eq!(names, ["chip_algo", "region_algo"]);
        assert_eq!(target.source, TargetDescriptionSource::External);
    }

    #[test]
    fn target_with_unknown_algorithm() {
        let family = ChipFamily {
            name: "family".into(),
            manufacturer: None,
            variants: vec![],
            flash_algorithms: vec![],
            source: TargetDescriptionSource::BuiltIn,
        };
        let chip = Chip {
            name: "chip".into(),
            svd: None,
            instruction_set: InstructionSet::Thumb2,
            memory_map: MemoryMap::new(vec![]).unwrap(),
            flash_algorithms: vec!["missing".into()],
            debug_freeze: vec![],
        };

        let error = Target::new(&family, &chip).unwrap_err();
        assert!(matches!(error, RegistryError::AlgorithmNotFound(name) if name == "missing"));
    }
}
