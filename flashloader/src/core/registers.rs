//! Core registers used to invoke flash algorithm routines.

/// The location of a CPU register. This is not an actual memory address, but a core specific
/// location that represents a specific core register.
#[derive(Debug, Copy, Clone, PartialEq, PartialOrd, Ord, Eq, Hash)]
pub struct RegisterId(pub u16);

impl From<RegisterId> for u32 {
    fn from(value: RegisterId) -> Self {
        u32::from(value.0)
    }
}

impl From<u16> for RegisterId {
    fn from(value: u16) -> Self {
        RegisterId(value)
    }
}

/// Describes a register with its properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDescription {
    pub(crate) name: &'static str,
    pub(crate) id: RegisterId,
}

impl RegisterDescription {
    /// Get the display name of this register
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the id of this register
    pub fn id(&self) -> RegisterId {
        self.id
    }
}

impl From<&RegisterDescription> for RegisterId {
    fn from(description: &RegisterDescription) -> RegisterId {
        description.id
    }
}

/// The registers of a core that matter for the calling convention of flash algorithms.
#[derive(Debug, PartialEq, Eq)]
pub struct CoreRegisters {
    pub(crate) program_counter: &'static RegisterDescription,
    pub(crate) stack_pointer: &'static RegisterDescription,
    pub(crate) return_address: &'static RegisterDescription,
    pub(crate) static_base: &'static RegisterDescription,
    pub(crate) argument_registers: &'static [RegisterDescription],
    pub(crate) result_registers: &'static [RegisterDescription],
}

impl CoreRegisters {
    /// The program counter.
    pub fn program_counter(&self) -> &RegisterDescription {
        self.program_counter
    }

    /// The stack pointer.
    pub fn stack_pointer(&self) -> &RegisterDescription {
        self.stack_pointer
    }

    /// The link register.
    pub fn return_address(&self) -> &RegisterDescription {
        self.return_address
    }

    /// The register holding the static base of position independent code.
    pub fn static_base(&self) -> &RegisterDescription {
        self.static_base
    }

    /// Returns the nth argument register.
    ///
    /// # Panics
    ///
    /// Panics if the register at given index does not exist.
    pub fn argument_register(&self, index: usize) -> &RegisterDescription {
        &self.argument_registers[index]
    }

    /// Returns the nth result register.
    ///
    /// # Panics
    ///
    /// Panics if the register at given index does not exist.
    pub fn result_register(&self, index: usize) -> &RegisterDescription {
        &self.result_registers[index]
    }
}

const fn register(name: &'static str, id: u16) -> RegisterDescription {
    RegisterDescription {
        name,
        id: RegisterId(id),
    }
}

static CORTEX_M_ARGUMENTS: [RegisterDescription; 4] = [
    register("R0", 0),
    register("R1", 1),
    register("R2", 2),
    register("R3", 3),
];

static CORTEX_M_RESULTS: [RegisterDescription; 1] = [register("R0", 0)];

static CORTEX_M_SB: RegisterDescription = register("R9", 9);
static CORTEX_M_SP: RegisterDescription = register("SP", 13);
static CORTEX_M_LR: RegisterDescription = register("LR", 14);
static CORTEX_M_PC: RegisterDescription = register("PC", 15);

/// Register layout of ARM Cortex-M cores, following the AAPCS.
pub static CORTEX_M_CORE_REGISTERS: CoreRegisters = CoreRegisters {
    program_counter: &CORTEX_M_PC,
    stack_pointer: &CORTEX_M_SP,
    return_address: &CORTEX_M_LR,
    static_base: &CORTEX_M_SB,
    argument_registers: &CORTEX_M_ARGUMENTS,
    result_registers: &CORTEX_M_RESULTS,
};
