//! Flash programming operations.
//!
//! This modules provides a means to do flash erasing, programming and verification
//! by running a flash algorithm on the target.
//!
//! It provides a convenient high level interface that can flash an IHEX or BIN file
//! as well as a lower level block based interface.
//!
//! ## Examples
//!
//! ### Flashing a binary
//!
//! The easiest way to flash a binary is using the [`download_file`] function,
//! and looks like this:
//!
//! ```no_run
//! use flashloader::{flashing, Session};
//! use std::path::Path;
//!
//! # fn run(session: &mut Session) -> Result<(), flashing::FileDownloadError> {
//! flashing::download_file(session, Path::new("binary.hex"), flashing::Format::Hex)?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Adding data manually
//!
//! ```no_run
//! use flashloader::{flashing::{DownloadOptions, FlashError}, Session};
//!
//! # fn run(session: &mut Session) -> Result<(), FlashError> {
//! let mut loader = session.target().flash_loader();
//!
//! loader.add_data(0x0800_0000, &[0x1, 0x2, 0x3])?;
//!
//! // Finally, the data can be programmed:
//! let result = loader.commit(session, DownloadOptions {
//!     verify: true,
//!     ..Default::default()
//! })?;
//! assert!(result.is_verified());
//! # Ok(())
//! # }
//! ```

mod builder;
mod download;
mod erase;
mod error;
mod flash_algorithm;
mod flasher;
mod loader;
mod progress;
mod state;
mod verify;

pub use builder::{FlashFill, FlashLayout, FlashPage, FlashSector};
pub use download::*;
pub use erase::*;
pub use error::*;
pub use flash_algorithm::*;
pub use loader::*;
pub use progress::*;
pub use state::FlashState;
pub use verify::verify;
