use super::chip::Chip;
use super::flash_algorithm::RawFlashAlgorithm;
use crate::DescriptorError;

use serde::{Deserialize, Serialize};

/// Source of a target description.
///
/// This is used for diagnostics, when
/// an error related to a target description occurs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TargetDescriptionSource {
    /// The target description was included at compile time.
    #[default]
    BuiltIn,
    /// The target description was loaded from an external source at runtime.
    External,
}

/// This describes a chip family with all its variants.
///
/// The flash algorithms are shared between the variants and referenced by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChipFamily {
    /// This is the name of the chip family in base form.
    /// E.g. `STM32L4 Series`.
    pub name: String,
    /// The manufacturer of the chips in this family.
    #[serde(default)]
    pub manufacturer: Option<String>,
    /// This vector holds all the variants of the family.
    pub variants: Vec<Chip>,
    /// This vector holds all available algorithms.
    #[serde(default)]
    pub flash_algorithms: Vec<RawFlashAlgorithm>,

    #[serde(skip, default)]
    /// Source of the target description, used for diagnostics
    pub source: TargetDescriptionSource,
}

impl ChipFamily {
    /// Validates the family: every algorithm must be sound and every
    /// algorithm referenced by a variant or a flash region must exist.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        for algorithm in &self.flash_algorithms {
            algorithm.validate()?;
        }

        for chip in &self.variants {
            let region_algorithms = chip
                .memory_map
                .nvm_regions()
                .filter_map(|region| region.algorithm.as_ref());

            for name in chip.flash_algorithms.iter().chain(region_algorithms) {
                if self.get_algorithm(name).is_none() {
                    return Err(DescriptorError::UnknownAlgorithm {
                        chip: chip.name.clone(),
                        algorithm: name.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Get the different [Chip]s which are part of this
    /// family.
    pub fn variants(&self) -> &[Chip] {
        &self.variants
    }

    /// Get all flash algorithms for this family of chips.
    pub fn algorithms(&self) -> &[RawFlashAlgorithm] {
        &self.flash_algorithms
    }

    /// Try to find a [RawFlashAlgorithm] with a given name.
    pub fn get_algorithm(&self, name: impl AsRef<str>) -> Option<&RawFlashAlgorithm> {
        let name = name.as_ref();
        self.flash_algorithms.iter().find(|elem| elem.name == name)
    }
}
