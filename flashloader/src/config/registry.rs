//! Target description registry

use std::io::Read;

use flashloader_target::{ChipFamily, DescriptorError, TargetDescriptionSource};
use once_cell::sync::Lazy;

use super::Target;

/// The families embedded in the crate, parsed on first use.
static BUILTIN_TARGETS: Lazy<Vec<ChipFamily>> = Lazy::new(|| {
    builtin_descriptors()
        .iter()
        .filter_map(|(file, yaml)| match parse_family(yaml.as_bytes()) {
            Ok(family) => Some(family),
            Err(error) => {
                tracing::error!("Builtin target description {} is invalid: {}", file, error);
                None
            }
        })
        .collect()
});

#[cfg(feature = "builtin-targets")]
fn builtin_descriptors() -> &'static [(&'static str, &'static str)] {
    &[(
        "STM32L4_Series.yaml",
        include_str!("../../targets/STM32L4_Series.yaml"),
    )]
}

#[cfg(not(feature = "builtin-targets"))]
fn builtin_descriptors() -> &'static [(&'static str, &'static str)] {
    &[]
}

fn parse_family(yaml_reader: impl Read) -> Result<ChipFamily, RegistryError> {
    let family: ChipFamily = serde_yaml::from_reader(yaml_reader)?;
    family.validate()?;
    Ok(family)
}

/// Error type for all errors which occur when working
/// with the internal registry of targets.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum RegistryError {
    /// The requested chip '{0}' was not found in the list of known targets.
    ChipNotFound(String),
    /// Failed to find flash algorithm '{0}'.
    AlgorithmNotFound(String),
    /// An IO error was encountered
    Io(#[from] std::io::Error),
    /// Deserializing the yaml encountered an error
    Yaml(#[from] serde_yaml::Error),
    /// The target description is invalid
    InvalidDescriptor(#[from] DescriptorError),
}

/// Registry of all available targets.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    /// All the available chips.
    families: Vec<ChipFamily>,
}

impl Registry {
    /// Creates a registry without any targets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the targets embedded in the crate.
    pub fn from_builtin_families() -> Self {
        Self {
            families: BUILTIN_TARGETS.to_vec(),
        }
    }

    /// All known chip families.
    pub fn families(&self) -> &[ChipFamily] {
        &self.families
    }

    /// Resolves the target with the given chip name.
    ///
    /// The name is compared case-insensitively. If no chip has exactly this name, the
    /// first chip whose name starts with it is used.
    pub fn get_target_by_name(&self, name: impl AsRef<str>) -> Result<Target, RegistryError> {
        let name = name.as_ref();
        tracing::debug!("Searching registry for chip with name {}", name);

        let wanted = name.to_ascii_lowercase();
        let variants = || {
            self.families.iter().flat_map(|family| {
                family
                    .variants()
                    .iter()
                    .map(move |variant| (family, variant))
            })
        };

        let exact = variants().find(|(_, variant)| variant.name.to_ascii_lowercase() == wanted);

        let (family, chip) = match exact {
            Some(found) => found,
            None => {
                let (family, chip) = variants()
                    .find(|(_, variant)| variant.name.to_ascii_lowercase().starts_with(&wanted))
                    .ok_or_else(|| RegistryError::ChipNotFound(name.to_string()))?;

                tracing::warn!(
                    "Found chip {} which matches given partial name {}. Consider specifying its full name.",
                    chip.name,
                    name,
                );

                (family, chip)
            }
        };

        Target::new(family, chip)
    }

    /// Adds a chip family, replacing a known family with the same name.
    ///
    /// Returns the name of the family.
    pub fn add_target_family(&mut self, family: ChipFamily) -> Result<String, RegistryError> {
        family.validate()?;

        let family_name = family.name.clone();
        if let Some(index) = self
            .families
            .iter()
            .position(|old_family| old_family.name == family_name)
        {
            tracing::debug!("Replacing chip family {}", family_name);
            self.families.remove(index);
        }
        self.families.push(family);

        Ok(family_name)
    }

    /// Parses a chip family description in YAML format and adds it to the registry.
    ///
    /// Returns the name of the family.
    pub fn add_target_from_yaml<R: Read>(&mut self, yaml_reader: R) -> Result<String, RegistryError> {
        let mut family = parse_family(yaml_reader)?;
        family.source = TargetDescriptionSource::External;

        self.add_target_family(family)
    }
}
