//! Control over the core that runs the flash algorithm.

pub mod registers;

pub use registers::{CoreRegisters, RegisterDescription, RegisterId, CORTEX_M_CORE_REGISTERS};

use crate::error::Error;
use crate::memory::MemoryInterface;
use std::time::Duration;

/// The reason a core halted.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum HaltReason {
    /// The core hit a breakpoint instruction.
    Breakpoint,
    /// The debugger requested the halt.
    Request,
    /// The reason for the halt is unknown.
    Unknown,
}

/// The status of the core.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum CoreStatus {
    /// The core is currently running.
    Running,
    /// The core is currently halted. This also specifies the reason as a payload.
    Halted(HaltReason),
    /// The core is locked up after an unrecoverable fault.
    LockedUp,
    /// The core state is currently unknown.
    Unknown,
}

impl CoreStatus {
    /// Returns `true` if the core is currently halted.
    pub fn is_halted(&self) -> bool {
        matches!(self, CoreStatus::Halted(_))
    }

    /// Returns `true` if the core is currently running.
    pub fn is_running(&self) -> bool {
        self == &Self::Running
    }
}

/// Information about the core, read when it halts.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CoreInformation {
    /// The current Program Counter.
    pub pc: u64,
}

/// A generic interface to control a single core.
pub trait CoreInterface {
    /// Halts the core and waits at most `timeout` for it to report being halted.
    fn halt(&mut self, timeout: Duration) -> Result<CoreInformation, Error>;

    /// Resumes execution of the core at the current program counter.
    fn run(&mut self) -> Result<(), Error>;

    /// Returns the current status of the core.
    fn status(&mut self) -> Result<CoreStatus, Error>;

    /// Check if the core is halted.
    fn core_halted(&mut self) -> Result<bool, Error> {
        Ok(self.status()?.is_halted())
    }

    /// Read a core register. The core has to be halted.
    fn read_core_reg(&mut self, address: RegisterId) -> Result<u32, Error>;

    /// Write a core register. The core has to be halted.
    fn write_core_reg(&mut self, address: RegisterId, value: u32) -> Result<(), Error>;

    /// The register layout of this core.
    fn registers(&self) -> &'static CoreRegisters;
}

/// Everything the flashing engine needs from a target: memory access and control
/// over the core running the flash algorithm.
pub trait TargetAccess: MemoryInterface + CoreInterface {}

impl<T: MemoryInterface + CoreInterface + ?Sized> TargetAccess for T {}
