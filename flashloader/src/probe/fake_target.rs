#![allow(missing_docs)] // Don't require docs for test code

//! A simulated chip that executes flash algorithm routines in memory.
//!
//! The core is "running" after [`CoreInterface::run`] until the configured number of
//! status polls has passed. The effect of the routine (erase, program) is applied when
//! the halt is observed, using the RAM contents at that moment.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use flashloader_target::{MemoryRange, RawFlashAlgorithm};

use crate::core::{
    CoreInformation, CoreInterface, CoreRegisters, CoreStatus, HaltReason, RegisterId,
    CORTEX_M_CORE_REGISTERS,
};
use crate::memory::MemoryInterface;
use crate::probe::DebugProbeError;
use crate::Error;

const PERIPHERALS: Range<u64> = 0xe000_0000..0x1_0000_0000;

const PC: usize = 15;
const LR: usize = 14;

/// A routine of a simulated flash algorithm.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Routine {
    Init,
    UnInit,
    EraseSector,
    EraseAll,
    ProgramPage,
}

/// A routine invocation observed by the simulated core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutineCall {
    pub routine: Routine,
    /// R0 to R3 at the time the core was resumed.
    pub arguments: [u32; 4],
    /// The value returned in R0, `None` while running or if the call never completed.
    pub result: Option<u32>,
}

#[derive(Debug, Copy, Clone)]
enum Fault {
    Fail(u32),
    Hang,
    LockUp,
}

#[derive(Debug)]
enum Execution {
    Halted(HaltReason),
    Running {
        routine: Option<Routine>,
        call: usize,
        polls_left: u32,
        fault: Option<Fault>,
    },
    LockedUp,
}

struct FlashBank {
    range: Range<u64>,
    contents: Vec<u8>,
}

struct State {
    ram: Vec<Range<u64>>,
    memory: HashMap<u64, u8>,
    banks: Vec<FlashBank>,
    peripheral_writes: Vec<(u64, u32)>,
    registers: [u32; 16],
    execution: Execution,
    algorithms: Vec<RawFlashAlgorithm>,
    latency: u32,
    faults: HashMap<(Routine, usize), Fault>,
    call_counts: HashMap<Routine, usize>,
    calls: Vec<RoutineCall>,
    buffer_hazards: usize,
    erase_counts: BTreeMap<u64, usize>,
    stuck_bytes: BTreeMap<u64, u8>,
    write_counts: HashMap<u64, usize>,
    lost_writes: HashSet<(u64, usize)>,
    status_reads: usize,
    lost_status_reads: HashSet<usize>,
}

/// A fake target with RAM, flash banks and a core that runs flash algorithms.
///
/// Clones share the same state, so a test can keep a handle for inspection after
/// handing the target to a session.
#[derive(Clone)]
pub struct FakeTarget {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for FakeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeTarget").finish_non_exhaustive()
    }
}

impl FakeTarget {
    /// Creates a running target with the given RAM regions and no flash.
    pub fn new(ram: Vec<Range<u64>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                ram,
                memory: HashMap::new(),
                banks: Vec::new(),
                peripheral_writes: Vec::new(),
                registers: [0; 16],
                execution: Execution::Running {
                    routine: None,
                    call: 0,
                    polls_left: u32::MAX,
                    fault: Some(Fault::Hang),
                },
                algorithms: Vec::new(),
                latency: 1,
                faults: HashMap::new(),
                call_counts: HashMap::new(),
                calls: Vec::new(),
                buffer_hazards: 0,
                erase_counts: BTreeMap::new(),
                stuck_bytes: BTreeMap::new(),
                write_counts: HashMap::new(),
                lost_writes: HashSet::new(),
                status_reads: 0,
                lost_status_reads: HashSet::new(),
            })),
        }
    }

    /// Adds a flash bank, filled with `fill`.
    pub fn with_flash(self, range: Range<u64>, fill: u8) -> Self {
        {
            let mut state = self.state();
            let size = (range.end - range.start) as usize;
            state.banks.push(FlashBank {
                range,
                contents: vec![fill; size],
            });
        }
        self
    }

    /// Makes the routines of `algorithm` executable.
    ///
    /// A routine is recognized by its entry point, as long as the algorithm image is
    /// present in RAM at its load address.
    pub fn with_algorithm(self, algorithm: &RawFlashAlgorithm) -> Self {
        self.state().algorithms.push(algorithm.clone());
        self
    }

    /// Number of status polls a routine takes to complete.
    pub fn with_latency(self, polls: u32) -> Self {
        self.state().latency = polls.max(1);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// The `nth` call (1-based) of `routine` returns `code`.
    pub fn fail_routine(&self, routine: Routine, nth: usize, code: u32) {
        self.state().faults.insert((routine, nth), Fault::Fail(code));
    }

    /// The `nth` call (1-based) of `routine` never halts.
    pub fn hang_routine(&self, routine: Routine, nth: usize) {
        self.state().faults.insert((routine, nth), Fault::Hang);
    }

    /// The `nth` call (1-based) of `routine` locks up the core.
    pub fn lock_up_routine(&self, routine: Routine, nth: usize) {
        self.state().faults.insert((routine, nth), Fault::LockUp);
    }

    /// The flash byte at `address` reads as `value` after every program operation.
    pub fn stick_byte(&self, address: u64, value: u8) {
        self.state().stuck_bytes.insert(address, value);
    }

    /// The `nth` memory write (1-based) starting at `address` times out in the probe.
    ///
    /// Nothing is written. Later writes succeed again.
    pub fn lose_write(&self, address: u64, nth: usize) {
        self.state().lost_writes.insert((address, nth));
    }

    /// The answer to the `nth` core status read (1-based) is lost on the way back.
    ///
    /// The core itself keeps executing.
    pub fn lose_status_read(&self, nth: usize) {
        self.state().lost_status_reads.insert(nth);
    }

    /// All routine calls, in order.
    pub fn calls(&self) -> Vec<RoutineCall> {
        self.state().calls.clone()
    }

    /// All calls of `routine`, in order.
    pub fn calls_to(&self, routine: Routine) -> Vec<RoutineCall> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.routine == routine)
            .cloned()
            .collect()
    }

    /// How often a page buffer was written while a program routine was reading it.
    pub fn buffer_hazards(&self) -> usize {
        self.state().buffer_hazards
    }

    /// How often the sector at `address` was erased.
    pub fn sector_erase_count(&self, address: u64) -> usize {
        self.state().erase_counts.get(&address).copied().unwrap_or(0)
    }

    /// Writes that landed in the peripheral space, in order.
    pub fn peripheral_writes(&self) -> Vec<(u64, u32)> {
        self.state().peripheral_writes.clone()
    }

    /// Contents of the flash in `range`.
    pub fn flash(&self, range: Range<u64>) -> Vec<u8> {
        let state = self.state();
        range
            .map(|address| state.flash_byte(address).unwrap_or(0))
            .collect()
    }

    /// Replaces flash contents, bypassing the algorithm.
    pub fn set_flash(&self, address: u64, data: &[u8]) {
        let mut state = self.state();
        for (offset, byte) in data.iter().enumerate() {
            if let Some(slot) = state.flash_byte_mut(address + offset as u64) {
                *slot = *byte;
            }
        }
    }

    /// Contents of the RAM in `range`.
    pub fn ram(&self, range: Range<u64>) -> Vec<u8> {
        let state = self.state();
        range
            .map(|address| state.memory.get(&address).copied().unwrap_or(0))
            .collect()
    }

    /// Current value of a core register, regardless of the core state.
    pub fn register(&self, index: usize) -> u32 {
        self.state().registers[index]
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.state().execution, Execution::Halted(_))
    }
}

impl State {
    fn in_ram(&self, range: &Range<u64>) -> bool {
        self.ram.iter().any(|ram| ram.contains_range(range))
    }

    fn flash_byte(&self, address: u64) -> Option<u8> {
        self.banks
            .iter()
            .find(|bank| bank.range.contains(&address))
            .map(|bank| bank.contents[(address - bank.range.start) as usize])
    }

    fn flash_byte_mut(&mut self, address: u64) -> Option<&mut u8> {
        self.banks
            .iter_mut()
            .find(|bank| bank.range.contains(&address))
            .map(|bank| &mut bank.contents[(address - bank.range.start) as usize])
    }

    fn read(&self, address: u64, data: &mut [u8]) -> Result<(), Error> {
        let range = address..address + data.len() as u64;

        if self.in_ram(&range) {
            for (offset, byte) in data.iter_mut().enumerate() {
                *byte = self
                    .memory
                    .get(&(address + offset as u64))
                    .copied()
                    .unwrap_or(0);
            }
            return Ok(());
        }

        if self.banks.iter().any(|bank| bank.range.contains_range(&range)) {
            for (offset, byte) in data.iter_mut().enumerate() {
                *byte = self.flash_byte(address + offset as u64).unwrap_or(0);
            }
            return Ok(());
        }

        if PERIPHERALS.contains_range(&range) {
            data.fill(0);
            return Ok(());
        }

        Err(Error::AccessDenied { address })
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        let count = self.write_counts.entry(address).or_default();
        *count += 1;
        if self.lost_writes.contains(&(address, *count)) {
            return Err(Error::Probe(DebugProbeError::Timeout));
        }

        let range = address..address + data.len() as u64;

        if self.in_ram(&range) {
            if let Some(buffer) = self.buffer_in_use() {
                if buffer.intersects_range(&range) {
                    self.buffer_hazards += 1;
                }
            }
            for (offset, byte) in data.iter().enumerate() {
                self.memory.insert(address + offset as u64, *byte);
            }
            return Ok(());
        }

        if PERIPHERALS.contains_range(&range) && data.len() == 4 {
            let value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            self.peripheral_writes.push((address, value));
            return Ok(());
        }

        // Flash can only be changed by the algorithm.
        Err(Error::AccessDenied { address })
    }

    /// The RAM a running program routine reads its data from.
    fn buffer_in_use(&self) -> Option<Range<u64>> {
        match self.execution {
            Execution::Running {
                routine: Some(Routine::ProgramPage),
                call,
                ..
            } => {
                let arguments = self.calls[call].arguments;
                let buffer = arguments[2] as u64;
                Some(buffer..buffer + arguments[1] as u64)
            }
            _ => None,
        }
    }

    fn loaded_algorithm(&self, pc: u64) -> Option<(usize, Routine)> {
        self.algorithms
            .iter()
            .enumerate()
            .filter(|(_, algorithm)| self.image_present(algorithm))
            .find_map(|(index, algorithm)| {
                let entry = |offset: u64| algorithm.load_address + (offset & !1);
                let routines = [
                    (algorithm.pc_init.map(entry), Routine::Init),
                    (algorithm.pc_uninit.map(entry), Routine::UnInit),
                    (Some(entry(algorithm.pc_program_page)), Routine::ProgramPage),
                    (Some(entry(algorithm.pc_erase_sector)), Routine::EraseSector),
                    (algorithm.pc_erase_all.map(entry), Routine::EraseAll),
                ];
                routines
                    .into_iter()
                    .find(|(address, _)| *address == Some(pc))
                    .map(|(_, routine)| (index, routine))
            })
    }

    fn image_present(&self, algorithm: &RawFlashAlgorithm) -> bool {
        algorithm
            .instructions
            .iter()
            .enumerate()
            .all(|(index, word)| {
                let address = algorithm.load_address + index as u64 * 4;
                let bytes = word.to_le_bytes();
                (0..4).all(|i| self.memory.get(&(address + i)).copied() == Some(bytes[i as usize]))
            })
    }

    fn start(&mut self) {
        let pc = (self.registers[PC] & !1) as u64;
        let routine = self.loaded_algorithm(pc).map(|(_, routine)| routine);

        let fault = routine.and_then(|routine| {
            let count = self.call_counts.entry(routine).or_default();
            *count += 1;
            self.faults.get(&(routine, *count)).copied()
        });

        let call = self.calls.len();
        if let Some(routine) = routine {
            self.calls.push(RoutineCall {
                routine,
                arguments: [
                    self.registers[0],
                    self.registers[1],
                    self.registers[2],
                    self.registers[3],
                ],
                result: None,
            });
        }

        self.execution = Execution::Running {
            routine,
            call,
            polls_left: self.latency,
            fault,
        };
    }

    fn poll(&mut self) {
        let (routine, call, fault, done) = match &mut self.execution {
            Execution::Running {
                routine,
                call,
                polls_left,
                fault,
            } => {
                *polls_left = polls_left.saturating_sub(1);
                (*routine, *call, *fault, *polls_left == 0)
            }
            _ => return,
        };

        match fault {
            Some(Fault::Hang) => return,
            Some(Fault::LockUp) => {
                self.execution = Execution::LockedUp;
                return;
            }
            _ => {}
        }

        if !done {
            return;
        }

        let Some(routine) = routine else {
            // Jumped somewhere that is not an entry point: stop right there.
            self.execution = Execution::Halted(HaltReason::Unknown);
            return;
        };

        let pc = (self.registers[PC] & !1) as u64;
        let algorithm = self
            .loaded_algorithm(pc)
            .map(|(index, _)| self.algorithms[index].clone());

        let result = match (fault, algorithm) {
            (Some(Fault::Fail(code)), _) => code,
            (_, Some(algorithm)) => self.execute(routine, &algorithm),
            (_, None) => 1,
        };

        self.calls[call].result = Some(result);
        self.registers[0] = result;
        self.registers[PC] = self.registers[LR] & !1;
        self.execution = Execution::Halted(HaltReason::Breakpoint);
    }

    fn execute(&mut self, routine: Routine, algorithm: &RawFlashAlgorithm) -> u32 {
        let [r0, r1, r2, _] = [
            self.registers[0],
            self.registers[1],
            self.registers[2],
            self.registers[3],
        ];

        match routine {
            Routine::Init | Routine::UnInit => 0,
            Routine::EraseAll => {
                let flash = algorithm.flash_range();
                for address in flash.clone() {
                    if let Some(byte) = self.flash_byte_mut(address) {
                        *byte = algorithm.erased_byte_value;
                    }
                }
                let mut address = flash.start;
                while let Some(size) = algorithm.sector_size_at(address - flash.start) {
                    *self.erase_counts.entry(address).or_default() += 1;
                    address += size;
                }
                0
            }
            Routine::EraseSector => {
                let address = r0 as u64;
                let Some(offset) = address.checked_sub(algorithm.flash_start) else {
                    return 1;
                };
                let Some(size) = algorithm.sector_size_at(offset) else {
                    return 1;
                };
                if !sector_start(algorithm, offset) {
                    return 1;
                }
                for address in address..address + size {
                    match self.flash_byte_mut(address) {
                        Some(byte) => *byte = algorithm.erased_byte_value,
                        None => return 1,
                    }
                }
                *self.erase_counts.entry(address).or_default() += 1;
                0
            }
            Routine::ProgramPage => {
                let address = r0 as u64;
                let length = r1 as u64;
                let buffer = r2 as u64;
                if !algorithm
                    .flash_range()
                    .contains_range(&(address..address + length))
                {
                    return 1;
                }
                for offset in 0..length {
                    let data = self.memory.get(&(buffer + offset)).copied().unwrap_or(0);
                    let target = address + offset;
                    let stuck = self.stuck_bytes.get(&target).copied();
                    match self.flash_byte_mut(target) {
                        // NOR flash can only clear bits.
                        Some(byte) => *byte = stuck.unwrap_or(*byte & data),
                        None => return 1,
                    }
                }
                0
            }
        }
    }
}

fn sector_start(algorithm: &RawFlashAlgorithm, offset: u64) -> bool {
    let mut current = 0;
    while let Some(size) = algorithm.sector_size_at(current) {
        if current == offset {
            return true;
        }
        if current > offset {
            return false;
        }
        current += size;
    }
    false
}

impl MemoryInterface for FakeTarget {
    fn read_32(&mut self, address: u64, data: &mut [u32]) -> Result<(), Error> {
        let mut bytes = vec![0u8; data.len() * 4];
        self.state().read(address, &mut bytes)?;
        for (word, chunk) in data.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(())
    }

    fn read_8(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error> {
        self.state().read(address, data)
    }

    fn write_32(&mut self, address: u64, data: &[u32]) -> Result<(), Error> {
        let mut state = self.state();
        if PERIPHERALS.contains(&address) {
            for (index, word) in data.iter().enumerate() {
                state.write(address + index as u64 * 4, &word.to_le_bytes())?;
            }
            return Ok(());
        }
        let bytes: Vec<u8> = data.iter().flat_map(|word| word.to_le_bytes()).collect();
        state.write(address, &bytes)
    }

    fn write_8(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        self.state().write(address, data)
    }
}

impl CoreInterface for FakeTarget {
    fn halt(&mut self, _timeout: Duration) -> Result<CoreInformation, Error> {
        let mut state = self.state();
        if !matches!(state.execution, Execution::Halted(_)) {
            state.execution = Execution::Halted(HaltReason::Request);
        }
        Ok(CoreInformation {
            pc: state.registers[PC] as u64,
        })
    }

    fn run(&mut self) -> Result<(), Error> {
        let mut state = self.state();
        if let Execution::Halted(_) = state.execution {
            state.start();
        }
        Ok(())
    }

    fn status(&mut self) -> Result<CoreStatus, Error> {
        let mut state = self.state();
        state.poll();

        state.status_reads += 1;
        if state.lost_status_reads.contains(&state.status_reads) {
            return Err(Error::Probe(DebugProbeError::Disconnected));
        }

        Ok(match state.execution {
            Execution::Halted(reason) => CoreStatus::Halted(reason),
            Execution::Running { .. } => CoreStatus::Running,
            Execution::LockedUp => CoreStatus::LockedUp,
        })
    }

    fn read_core_reg(&mut self, address: RegisterId) -> Result<u32, Error> {
        let state = self.state();
        if !matches!(state.execution, Execution::Halted(_)) {
            return Err(Error::CoreNotHalted);
        }
        Ok(state.registers[address.0 as usize])
    }

    fn write_core_reg(&mut self, address: RegisterId, value: u32) -> Result<(), Error> {
        let mut state = self.state();
        if !matches!(state.execution, Execution::Halted(_)) {
            return Err(Error::CoreNotHalted);
        }
        state.registers[address.0 as usize] = value;
        Ok(())
    }

    fn registers(&self) -> &'static CoreRegisters {
        &CORTEX_M_CORE_REGISTERS
    }
}
