use super::memory::MemoryMap;
use crate::serialize::hex_u_int;
use serde::{Deserialize, Serialize};

/// Instruction set used by the core that runs the flash algorithm.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstructionSet {
    /// ARM Thumb 2 instruction set. Return addresses carry the Thumb bit.
    #[default]
    Thumb2,
    /// ARM A32 (often just called ARM) instruction set
    A32,
    /// RISC-V 32-bit instruction set
    RV32,
}

/// A single 32-bit register write applied right after connecting to a chip.
///
/// Used for example to freeze peripheral clocks and watchdogs while the core is halted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegisterWrite {
    /// Address of the register.
    #[serde(serialize_with = "hex_u_int")]
    pub address: u64,
    /// Value written to the register.
    #[serde(serialize_with = "hex_u_int")]
    pub value: u32,
}

/// A single chip variant.
///
/// This describes an exact chip variant, including its memory map, the flash algorithms
/// used to program it and the registers written once a debug connection is established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chip {
    /// This is the name of the chip in base form.
    /// E.g. `STM32L496xx`.
    pub name: String,
    /// File name of the SVD register description. Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub svd: Option<String>,
    /// Instruction set of the core running the flash algorithms.
    #[serde(default)]
    pub instruction_set: InstructionSet,
    /// The memory regions available on the chip.
    pub memory_map: MemoryMap,
    /// Names of all flash algorithms available for this chip.
    ///
    /// This can be used to look up the flash algorithm in the
    /// [`ChipFamily::flash_algorithms`] field.
    ///
    /// [`ChipFamily::flash_algorithms`]: crate::ChipFamily::flash_algorithms
    #[serde(default)]
    pub flash_algorithms: Vec<String>,
    /// Register writes applied after connecting, in order.
    #[serde(default)]
    pub debug_freeze: Vec<RegisterWrite>,
}
