use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{FlashError, FlashLoader, FlashProgress, MismatchError};
use crate::session::Session;

/// Extended options for flashing a binary file.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinOptions {
    /// The address in memory where the binary will be put at.
    ///
    /// Defaults to the start of the boot memory of the target.
    pub base_address: Option<u64>,
    /// The number of bytes to skip at the start of the binary file.
    pub skip: u32,
}

/// A finite list of all the available binary formats.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Format {
    /// Marks a file in binary format. This means that the file contains the contents of the flash 1:1.
    /// [BinOptions] can be used to define the location in flash where the file contents should be put at.
    /// Additionally using the same config struct, you can skip the first N bytes of the binary file to have them not put into the flash.
    Bin(BinOptions),
    /// Marks a file in [Intel HEX](https://en.wikipedia.org/wiki/Intel_HEX) format.
    Hex,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &s.to_lowercase()[..] {
            "bin" | "binary" => Ok(Format::Bin(BinOptions::default())),
            "hex" | "ihex" | "intelhex" => Ok(Format::Hex),
            _ => Err(format!("Format '{s}' is unknown.")),
        }
    }
}

/// A finite list of all the errors that can occur when flashing a given file.
///
/// This includes corrupt file issues,
/// OS permission issues as well as chip connectivity and memory boundary issues.
#[derive(Debug, Error)]
pub enum FileDownloadError {
    /// An error with the actual flashing procedure has occured.
    #[error("Error while flashing")]
    Flash(#[from] FlashError),
    /// Reading and decoding the IHEX file has failed due to the given error.
    #[error("Could not read ihex format")]
    IhexRead(#[from] ihex::ReaderError),
    /// An IO error has occured while reading the firmware file.
    #[error("I/O error")]
    IO(#[from] std::io::Error),
}

/// The time each routine of a flash algorithm may take before it is considered hung.
///
/// Durations are given in milliseconds when (de)serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashTimeouts {
    /// Timeout of the init routine.
    #[serde(with = "millis")]
    pub init: Duration,
    /// Timeout of the uninit routine.
    #[serde(with = "millis")]
    pub uninit: Duration,
    /// Timeout of a single sector erase.
    #[serde(with = "millis")]
    pub erase_sector: Duration,
    /// Timeout of the erase all routine.
    #[serde(with = "millis")]
    pub erase_all: Duration,
    /// Timeout of programming a single page.
    #[serde(with = "millis")]
    pub program_page: Duration,
}

impl Default for FlashTimeouts {
    fn default() -> Self {
        Self {
            init: Duration::from_secs(2),
            uninit: Duration::from_secs(2),
            erase_sector: Duration::from_secs(2),
            erase_all: Duration::from_secs(30),
            program_page: Duration::from_secs(2),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Options for downloading data onto a target chip.
#[derive(Debug, Default, Clone)]
pub struct DownloadOptions {
    /// An optional progress reporter which is used if this argument is set to `Some(...)`.
    pub progress: Option<FlashProgress>,
    /// Read back the programmed flash and compare it to the image.
    ///
    /// A mismatch is reported in [`ProgramResult::verify_result`].
    pub verify: bool,
    /// Erase the entire flash, using the erase all routine of the flash algorithm if it has one.
    /// This is often faster than erasing a lot of single sectors.
    /// So if you do not need the old contents of the flash, this is a good option.
    pub full_erase: bool,
    /// Program one page after the other, even when the flash algorithm has several page buffers.
    pub disable_double_buffering: bool,
    /// Do not erase sectors which already contain only the erased byte value.
    pub skip_erased_sectors: bool,
    /// Timeouts of the flash algorithm routines.
    pub timeouts: FlashTimeouts,
}

/// The outcome of a successful programming run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramResult {
    /// Number of image bytes written to flash, without padding.
    pub bytes_written: u64,
    /// Number of sectors erased.
    pub sectors_erased: usize,
    /// Time the whole run took.
    pub duration: Duration,
    /// The result of the verification, if it was requested.
    pub verify_result: Option<Result<(), MismatchError>>,
}

impl ProgramResult {
    /// Returns `true` if the flash was verified and matched the image.
    pub fn is_verified(&self) -> bool {
        matches!(self.verify_result, Some(Ok(())))
    }
}

/// Programs `data` at `address` into the memory of the target.
///
/// The data may span several flash regions and RAM. Each flash region is programmed
/// with its own flash algorithm.
pub fn program(
    session: &mut Session,
    address: u64,
    data: &[u8],
    options: DownloadOptions,
) -> Result<ProgramResult, FlashError> {
    let mut loader = session.target().flash_loader();
    loader.add_data(address, data)?;
    loader.commit(session, options)
}

/// Downloads a file of given `format` at `path` to the flash of the target given in `session`.
///
/// This will ensure that memory bounderies are honored and does erasing and programming of the flash for you.
///
/// If you are looking for more options, have a look at [download_file_with_options].
pub fn download_file(
    session: &mut Session,
    path: &Path,
    format: Format,
) -> Result<ProgramResult, FileDownloadError> {
    download_file_with_options(session, path, format, DownloadOptions::default())
}

/// Downloads a file of given `format` at `path` to the flash of the target given in `session`.
///
/// This will ensure that memory bounderies are honored and does erasing and programming of the flash for you.
///
/// If you are looking for a simple version without many options, have a look at [download_file].
pub fn download_file_with_options(
    session: &mut Session,
    path: &Path,
    format: Format,
    options: DownloadOptions,
) -> Result<ProgramResult, FileDownloadError> {
    let mut file = File::open(path)?;

    let mut loader: FlashLoader = session.target().flash_loader();

    match format {
        Format::Bin(options) => loader.load_bin_data(&mut file, options),
        Format::Hex => loader.load_hex_data(&mut file),
    }?;

    loader
        .commit(session, options)
        .map_err(FileDownloadError::Flash)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::{BinOptions, FlashTimeouts, Format};

    #[test]
    fn parse_format() {
        assert_eq!(Format::from_str("hex"), Ok(Format::Hex));
        assert_eq!(Format::from_str("Hex"), Ok(Format::Hex));
        assert_eq!(Format::from_str("Ihex"), Ok(Format::Hex));
        assert_eq!(Format::from_str("IntelHex"), Ok(Format::Hex));
        assert_eq!(Format::from_str("intelhex"), Ok(Format::Hex));
        assert_eq!(
            Format::from_str("bin"),
            Ok(Format::Bin(BinOptions {
                base_address: None,
                skip: 0
            }))
        );
        assert_eq!(
            Format::from_str("Binary"),
            Ok(Format::Bin(BinOptions {
                base_address: None,
                skip: 0
            }))
        );
        assert_eq!(
            Format::from_str("elf"),
            Err("Format 'elf' is unknown.".to_string())
        );
        assert_eq!(
            Format::from_str(""),
            Err("Format '' is unknown.".to_string())
        );
    }

    #[test]
    fn timeouts_from_yaml() {
        let timeouts: FlashTimeouts =
            serde_yaml::from_str("erase_all: 60000\nprogram_page: 500\n").unwrap();

        assert_eq!(
            timeouts,
            FlashTimeouts {
                erase_all: Duration::from_secs(60),
                program_page: Duration::from_millis(500),
                ..Default::default()
            }
        );
    }

    #[test]
    fn timeouts_are_written_as_milliseconds() {
        let yaml = serde_yaml::to_string(&FlashTimeouts::default()).unwrap();

        assert!(yaml.contains("erase_all: 30000"));
        assert!(yaml.contains("init: 2000"));
    }
}
