//! # Flash programming for microcontrollers
//!
//! `flashloader` erases, programs and verifies the flash of a microcontroller by running
//! a flash algorithm on the chip itself. A flash algorithm is a small position-dependent
//! program supplied by the chip vendor. It is loaded into RAM and its routines
//! (init, erase sector, program page, ...) are invoked one after the other by setting up
//! the core registers and resuming the core.
//!
//! # Examples
//!
//! ## Programming an image
//!
//! ```no_run
//! use flashloader::flashing::{self, DownloadOptions};
//! use flashloader::{Registry, Session};
//!
//! # fn run(access: impl flashloader::TargetAccess + 'static) -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Registry::from_builtin_families();
//! let mut session = Session::attach(access, "STM32L496xx", &registry)?;
//!
//! let image = std::fs::read("firmware.bin")?;
//! let result = flashing::program(&mut session, 0x0800_0000, &image, DownloadOptions {
//!     verify: true,
//!     ..Default::default()
//! })?;
//!
//! println!("Wrote {} bytes in {:?}", result.bytes_written, result.duration);
//! # Ok(())
//! # }
//! ```
//!
//! flashloader is built around the [Target] description of a chip, the [Session] that
//! owns the access to it and the [`flashing::FlashLoader`] that plans and runs the
//! flash operations.

pub mod config;

#[warn(missing_docs)]
mod core;
mod error;
#[warn(missing_docs)]
pub mod flashing;
#[warn(missing_docs)]
mod memory;
pub mod probe;
#[warn(missing_docs)]
mod session;

pub use crate::config::{Registry, RegistryError, Target};
pub use crate::core::{
    CoreInformation, CoreInterface, CoreRegisters, CoreStatus, HaltReason, RegisterDescription,
    RegisterId, TargetAccess, CORTEX_M_CORE_REGISTERS,
};
pub use crate::error::Error;
pub use crate::memory::{InvalidDataLengthError, MemoryInterface, MemoryNotAlignedError};
pub use crate::session::Session;
