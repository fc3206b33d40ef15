use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::time::{Duration, Instant};

use tracing::Level;

use super::verify::verify_layout;
use super::{
    FlashAlgorithm, FlashError, FlashLayout, FlashPage, FlashProgress, FlashSector, FlashState,
    FlashTimeouts, MismatchError,
};
use crate::core::{CoreStatus, TargetAccess};

/// Interval between two polls of the core status while a routine runs.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// How long a halt request may take.
const HALT_TIMEOUT: Duration = Duration::from_millis(100);

/// The operation the flash algorithm is initialized for.
///
/// The code is passed to the init and uninit routines.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) enum Operation {
    Erase,
    Program,
}

impl Operation {
    fn code(self) -> u32 {
        match self {
            Operation::Erase => 1,
            Operation::Program => 2,
        }
    }
}

/// How the sectors of a region are erased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum ErasePlan {
    /// A single call of the erase all routine.
    Chip,
    /// One call of the erase sector routine per sector.
    Sectors(Vec<FlashSector>),
}

/// Knobs of a single programming run.
#[derive(Debug, Default, Copy, Clone)]
pub(super) struct ProgramOptions {
    pub full_erase: bool,
    pub double_buffering: bool,
    pub skip_erased_sectors: bool,
    pub verify: bool,
}

/// What a programming run did to a region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct RegionReport {
    pub bytes_written: u64,
    pub sectors_erased: usize,
    pub verify_result: Option<Result<(), MismatchError>>,
}

/// A routine that was started on the target.
#[derive(Debug, Copy, Clone)]
struct Call {
    name: &'static str,
    address: Option<u64>,
    timeout: Duration,
}

/// Drives a flash algorithm on the target.
///
/// A `Flasher` programs or erases one flash region. It loads the algorithm into RAM,
/// initializes it, calls its routines and always tries to deinitialize it again,
/// also when one of the steps failed.
pub(super) struct Flasher<'target> {
    target: &'target mut dyn TargetAccess,
    flash_algorithm: FlashAlgorithm,
    timeouts: FlashTimeouts,
    progress: FlashProgress,
    state: FlashState,
    /// Sectors known to be erased in this session.
    erased_sectors: BTreeSet<u64>,
    /// The routine the core is executing, if it was not waited for yet.
    in_flight: Option<Call>,
    current_buffer: usize,
    /// The operation passed to a successful init call.
    operation: Option<Operation>,
}

impl<'target> Flasher<'target> {
    pub(super) fn new(
        target: &'target mut dyn TargetAccess,
        flash_algorithm: FlashAlgorithm,
        timeouts: FlashTimeouts,
        progress: FlashProgress,
    ) -> Self {
        Self {
            target,
            flash_algorithm,
            timeouts,
            progress,
            state: FlashState::Idle,
            erased_sectors: BTreeSet::new(),
            in_flight: None,
            current_buffer: 0,
            operation: None,
        }
    }

    #[cfg(test)]
    fn state(&self) -> FlashState {
        self.state
    }

    fn transition(&mut self, next: FlashState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal flash state transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::trace!("Flash state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Erases, programs and optionally verifies `layout`.
    pub(super) fn run_program(
        &mut self,
        layout: &FlashLayout,
        options: &ProgramOptions,
    ) -> Result<RegionReport, FlashError> {
        let result = self.program_session(layout, options);
        self.finish(result)
    }

    /// Erases the sectors of `plan`. Returns the number of sectors erased.
    pub(super) fn run_erase(
        &mut self,
        plan: &ErasePlan,
        skip_erased: bool,
    ) -> Result<usize, FlashError> {
        let result = self.erase_session(plan, skip_erased);
        self.finish(result)
    }

    fn program_session(
        &mut self,
        layout: &FlashLayout,
        options: &ProgramOptions,
    ) -> Result<RegionReport, FlashError> {
        self.progress.initialized(layout.clone());

        self.load()?;
        self.init(Operation::Program)?;

        let plan = self.erase_plan(layout, options.full_erase);
        let sectors_erased = self.erase(&plan, options.skip_erased_sectors)?;

        self.program(layout, options.double_buffering)?;

        let verify_result = if options.verify {
            Some(self.verify(layout)?)
        } else {
            None
        };

        Ok(RegionReport {
            bytes_written: layout.data_size(),
            sectors_erased,
            verify_result,
        })
    }

    fn erase_session(&mut self, plan: &ErasePlan, skip_erased: bool) -> Result<usize, FlashError> {
        self.load()?;
        self.init(Operation::Erase)?;
        self.erase(plan, skip_erased)
    }

    /// Moves to a terminal state and releases the algorithm.
    ///
    /// A routine still running is waited for first. A failing uninit is only logged,
    /// `result` is returned as is.
    fn finish<T>(&mut self, result: Result<T, FlashError>) -> Result<T, FlashError> {
        if let Some(call) = self.in_flight {
            tracing::debug!("Waiting for '{}' before releasing the target.", call.name);
            if let Err(error) = self.wait_for_completion(call) {
                tracing::warn!("'{}' did not complete: {}", call.name, error);
            }
        }

        if let Err(error) = &result {
            tracing::debug!("Aborting flash session: {}", error);
        }

        if let Err(error) = self.uninit() {
            tracing::warn!("Failed to deinitialize the flash algorithm: {}", error);
        }

        let next = if result.is_ok() {
            FlashState::Finalized
        } else {
            FlashState::Aborted
        };
        self.transition(next);

        result
    }

    /// Installs the algorithm in RAM and prepares the core to run it.
    fn load(&mut self) -> Result<(), FlashError> {
        tracing::debug!("Loading flash algorithm '{}'.", self.flash_algorithm.name);

        let cpu_info = self.target.halt(HALT_TIMEOUT).map_err(FlashError::Core)?;
        tracing::debug!("PC = 0x{:08x}", cpu_info.pc);

        let algo = &self.flash_algorithm;

        let span = tracing::debug_span!("Loading algorithm into RAM", address = algo.load_address)
            .entered();
        self.target
            .write_32(algo.load_address, &algo.instructions)
            .map_err(FlashError::Memory)?;
        drop(span);

        let mut data = vec![0; algo.instructions.len()];
        self.target
            .read_32(algo.load_address, &mut data)
            .map_err(FlashError::Memory)?;

        for (offset, (original, read_back)) in algo.instructions.iter().zip(data.iter()).enumerate()
        {
            if original != read_back {
                let address = algo.load_address + (4 * offset) as u64;
                tracing::error!(
                    "Failed to verify flash algorithm. Data mismatch at address {:#010x}",
                    address
                );
                tracing::error!("Original instruction: {:#010x}", original);
                tracing::error!("Readback instruction: {:#010x}", read_back);

                return Err(FlashError::FlashAlgorithmNotLoaded { address });
            }
        }

        tracing::debug!("RAM contents match flashing algo blob.");

        if !algo.zero_init.is_empty() {
            let zeros = vec![0; (algo.zero_init.end - algo.zero_init.start) as usize];
            self.target
                .write(algo.zero_init.start, &zeros)
                .map_err(FlashError::Memory)?;
        }

        let regs = self.target.registers();
        for (description, value) in [
            (regs.stack_pointer(), algo.begin_stack),
            (regs.static_base(), algo.static_base),
        ] {
            self.target
                .write_core_reg(description.id(), into_reg(value)?)
                .map_err(FlashError::Core)?;
        }

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn init(&mut self, operation: Operation) -> Result<(), FlashError> {
        if let Some(pc_init) = self.flash_algorithm.pc_init {
            let address = self.flash_algorithm.flash_properties.address_range.start;
            let registers = Registers {
                pc: into_reg(pc_init)?,
                r0: Some(into_reg(address)?),
                // Clock frequency, unknown.
                r1: Some(0),
                r2: Some(operation.code()),
                r3: None,
            };

            let result = self.call_function_and_wait(
                &registers,
                Call {
                    name: "init",
                    address: None,
                    timeout: self.timeouts.init,
                },
            )?;

            if result != 0 {
                return Err(FlashError::Init { error_code: result });
            }
        }

        self.operation = Some(operation);
        self.transition(FlashState::Initialized);

        Ok(())
    }

    fn uninit(&mut self) -> Result<(), FlashError> {
        let Some(operation) = self.operation.take() else {
            return Ok(());
        };
        let Some(pc_uninit) = self.flash_algorithm.pc_uninit else {
            return Ok(());
        };

        tracing::debug!("Running uninit routine.");
        let registers = Registers {
            pc: into_reg(pc_uninit)?,
            r0: Some(operation.code()),
            r1: None,
            r2: None,
            r3: None,
        };

        let result = self.call_function_and_wait(
            &registers,
            Call {
                name: "uninit",
                address: None,
                timeout: self.timeouts.uninit,
            },
        )?;

        if result != 0 {
            return Err(FlashError::RoutineCallFailed {
                name: "uninit",
                address: None,
                error_code: result,
            });
        }

        Ok(())
    }

    fn call_function_and_wait(
        &mut self,
        registers: &Registers,
        call: Call,
    ) -> Result<u32, FlashError> {
        self.call_function(registers, call)?;
        self.wait_for_completion(call)
    }

    fn call_function(&mut self, registers: &Registers, call: Call) -> Result<(), FlashError> {
        tracing::debug!("Calling routine {:?}", registers);

        let regs = self.target.registers();
        let return_address = into_reg(self.flash_algorithm.return_address)?;

        let writes = [
            (regs.program_counter(), Some(registers.pc)),
            (regs.argument_register(0), registers.r0),
            (regs.argument_register(1), registers.r1),
            (regs.argument_register(2), registers.r2),
            (regs.argument_register(3), registers.r3),
            (regs.return_address(), Some(return_address)),
        ];

        for (description, value) in writes {
            let Some(value) = value else {
                continue;
            };

            self.target
                .write_core_reg(description.id(), value)
                .map_err(FlashError::Core)?;

            if tracing::enabled!(Level::DEBUG) {
                let read_back = self
                    .target
                    .read_core_reg(description.id())
                    .map_err(FlashError::Core)?;

                tracing::debug!(
                    "content of {} {:#x}: 0x{:08x} should be: 0x{:08x}",
                    description.name(),
                    description.id().0,
                    read_back,
                    value
                );
            }
        }

        self.target.run().map_err(FlashError::Core)?;
        self.in_flight = Some(call);

        Ok(())
    }

    /// Polls the core until the routine of `call` returns and reads its result.
    ///
    /// On a timeout or a locked up core the core is halted before the error is returned.
    #[tracing::instrument(skip(self))]
    fn wait_for_completion(&mut self, call: Call) -> Result<u32, FlashError> {
        tracing::debug!("Waiting for routine call completion.");
        self.in_flight = None;

        let start = Instant::now();
        loop {
            match self.target.status().map_err(FlashError::Core)? {
                CoreStatus::Halted(_) => break,
                CoreStatus::LockedUp => {
                    self.halt_after_failure();
                    return Err(FlashError::UnexpectedCoreStatus {
                        status: CoreStatus::LockedUp,
                    });
                }
                // All other statuses are okay: we'll just keep polling.
                _ => {}
            }

            if start.elapsed() >= call.timeout {
                self.halt_after_failure();
                return Err(FlashError::Timeout {
                    name: call.name,
                    address: call.address,
                    timeout: call.timeout,
                });
            }

            std::thread::sleep(POLL_INTERVAL);
        }

        let regs = self.target.registers();

        let pc = self
            .target
            .read_core_reg(regs.program_counter().id())
            .map_err(FlashError::Core)?;
        if pc != into_reg(self.flash_algorithm.return_address & !1)? {
            return Err(FlashError::UnexpectedHalt {
                name: call.name,
                pc,
            });
        }

        self.target
            .read_core_reg(regs.result_register(0).id())
            .map_err(FlashError::Core)
    }

    fn halt_after_failure(&mut self) {
        if let Err(error) = self.target.halt(HALT_TIMEOUT) {
            tracing::warn!("Failed to halt the core: {}", error);
        }
    }

    /// Decides how the sectors of `layout` are erased.
    ///
    /// The erase all routine is used when the layout touches every sector or when a full
    /// erase is requested. Without that routine a full erase erases every sector.
    fn erase_plan(&self, layout: &FlashLayout, full_erase: bool) -> ErasePlan {
        let covers_flash = layout.sectors().len() == self.flash_algorithm.iter_sectors().count();

        if (full_erase || covers_flash) && self.flash_algorithm.pc_erase_all.is_some() {
            ErasePlan::Chip
        } else if full_erase {
            ErasePlan::Sectors(
                self.flash_algorithm
                    .iter_sectors()
                    .map(FlashSector::from)
                    .collect(),
            )
        } else {
            ErasePlan::Sectors(layout.sectors().to_vec())
        }
    }

    fn erase(&mut self, plan: &ErasePlan, skip_erased: bool) -> Result<usize, FlashError> {
        self.transition(FlashState::Erasing);
        self.progress.started_erasing();

        let result = match plan {
            ErasePlan::Chip => self.erase_all(),
            ErasePlan::Sectors(sectors) => self.erase_sectors(sectors, skip_erased),
        };

        match &result {
            Ok(_) => self.progress.finished_erasing(),
            Err(_) => self.progress.failed_erasing(),
        }

        result
    }

    fn erase_sectors(
        &mut self,
        sectors: &[FlashSector],
        skip_erased: bool,
    ) -> Result<usize, FlashError> {
        let mut erased = 0;

        for sector in sectors {
            if skip_erased
                && !self.erased_sectors.contains(&sector.address())
                && self.is_blank(sector)?
            {
                tracing::debug!("Sector at {:#010x} is blank, skipping.", sector.address());
                self.erased_sectors.insert(sector.address());
                continue;
            }

            if self.erase_sector(sector)? {
                erased += 1;
            }
        }

        Ok(erased)
    }

    fn is_blank(&mut self, sector: &FlashSector) -> Result<bool, FlashError> {
        let mut data = vec![0; sector.size() as usize];
        self.target
            .read(sector.address(), &mut data)
            .map_err(FlashError::Memory)?;

        Ok(self.flash_algorithm.is_erased(&data))
    }

    /// Erases a single sector. Returns `false` if it was erased before in this session.
    fn erase_sector(&mut self, sector: &FlashSector) -> Result<bool, FlashError> {
        let address = sector.address();
        if self.erased_sectors.contains(&address) {
            tracing::debug!("Sector at {:#010x} is already erased.", address);
            return Ok(false);
        }

        tracing::info!("Erasing sector at address 0x{:08x}", address);
        let t1 = Instant::now();

        let registers = Registers {
            pc: into_reg(self.flash_algorithm.pc_erase_sector)?,
            r0: Some(into_reg(address)?),
            r1: None,
            r2: None,
            r3: None,
        };
        let call = Call {
            name: "erase_sector",
            address: Some(address),
            timeout: self.timeouts.erase_sector,
        };

        self.call_function_and_wait(&registers, call)
            .and_then(|result| check_result(call, result))
            .map_err(|error| FlashError::EraseFailed {
                sector_address: address,
                source: Box::new(error),
            })?;

        tracing::info!("Done erasing sector. This took {:?}", t1.elapsed());

        self.erased_sectors.insert(address);
        self.progress.sector_erased(sector.size(), t1.elapsed());

        Ok(true)
    }

    /// Erases the whole flash of the algorithm. Returns the number of sectors erased.
    fn erase_all(&mut self) -> Result<usize, FlashError> {
        let Some(pc_erase_all) = self.flash_algorithm.pc_erase_all else {
            return Err(FlashError::ChipEraseNotSupported);
        };

        tracing::info!("Erasing the whole flash of '{}'", self.flash_algorithm.name);
        let t1 = Instant::now();

        let registers = Registers {
            pc: into_reg(pc_erase_all)?,
            r0: None,
            r1: None,
            r2: None,
            r3: None,
        };
        let call = Call {
            name: "erase_all",
            address: None,
            timeout: self.timeouts.erase_all,
        };

        self.call_function_and_wait(&registers, call)
            .and_then(|result| check_result(call, result))
            .map_err(|error| FlashError::ChipEraseFailed {
                source: Box::new(error),
            })?;

        tracing::info!("Done erasing the flash. This took {:?}", t1.elapsed());

        let mut count = 0;
        let mut size = 0;
        for sector in self.flash_algorithm.iter_sectors() {
            self.erased_sectors.insert(sector.base_address);
            count += 1;
            size += sector.size;
        }
        self.progress.sector_erased(size, t1.elapsed());

        Ok(count)
    }

    fn program(&mut self, layout: &FlashLayout, double_buffering: bool) -> Result<(), FlashError> {
        self.transition(FlashState::Programming);

        let length = layout.pages().iter().map(|page| page.size() as u64).sum();
        self.progress.started_programming(length);

        let result = if double_buffering && self.flash_algorithm.double_buffering_supported() {
            tracing::debug!(
                "Programming with {} page buffers.",
                self.flash_algorithm.page_buffers.len()
            );
            self.program_double_buffer(layout)
        } else {
            self.program_simple(layout)
        };

        match &result {
            Ok(()) => self.progress.finished_programming(),
            Err(_) => self.progress.failed_programming(),
        }

        result
    }

    fn program_simple(&mut self, layout: &FlashLayout) -> Result<(), FlashError> {
        for page in layout.pages() {
            let t = Instant::now();
            self.program_page(page)?;
            self.progress.page_programmed(page.size(), t.elapsed());
        }

        Ok(())
    }

    /// Programs the pages while the next page is copied into a free buffer.
    ///
    /// A buffer is only refilled after the program call that read it returned: at most
    /// one call is in flight, and it never uses the buffer being loaded.
    fn program_double_buffer(&mut self, layout: &FlashLayout) -> Result<(), FlashError> {
        let mut pending: Option<(&FlashPage, Call, Instant)> = None;

        for page in layout.pages() {
            let buffer = self.current_buffer;

            // At the start of each loop cycle load the next page buffer into RAM.
            self.load_page_buffer(page.data(), buffer)?;

            // Then wait for the active RAM -> Flash copy process to finish.
            if let Some((previous, call, started)) = pending.take() {
                self.wait_for_page(previous.address(), call)?;
                self.progress
                    .page_programmed(previous.size(), started.elapsed());
            }

            // Start the next copy process.
            let call = self.start_program_page_with_buffer(page.address(), page.size(), buffer)?;
            pending = Some((page, call, Instant::now()));

            self.current_buffer = (buffer + 1) % self.flash_algorithm.page_buffers.len();
        }

        if let Some((previous, call, started)) = pending {
            self.wait_for_page(previous.address(), call)?;
            self.progress
                .page_programmed(previous.size(), started.elapsed());
        }

        Ok(())
    }

    fn program_page(&mut self, page: &FlashPage) -> Result<(), FlashError> {
        tracing::info!("Flashing page at address {:#010x}", page.address());

        self.load_page_buffer(page.data(), 0)?;
        let call = self.start_program_page_with_buffer(page.address(), page.size(), 0)?;
        self.wait_for_page(page.address(), call)
    }

    fn load_page_buffer(&mut self, data: &[u8], buffer_index: usize) -> Result<(), FlashError> {
        let buffer = self.flash_algorithm.page_buffers[buffer_index];
        tracing::debug!(
            "Loading {} bytes into page buffer {} at {:#010x}",
            data.len(),
            buffer_index,
            buffer
        );

        self.target.write(buffer, data).map_err(FlashError::Memory)
    }

    fn start_program_page_with_buffer(
        &mut self,
        address: u64,
        size: u32,
        buffer_index: usize,
    ) -> Result<Call, FlashError> {
        let buffer = self.flash_algorithm.page_buffers[buffer_index];

        let registers = Registers {
            pc: into_reg(self.flash_algorithm.pc_program_page)?,
            r0: Some(into_reg(address)?),
            r1: Some(size),
            r2: Some(into_reg(buffer)?),
            r3: None,
        };
        let call = Call {
            name: "program_page",
            address: Some(address),
            timeout: self.timeouts.program_page,
        };

        self.call_function(&registers, call)?;

        Ok(call)
    }

    fn wait_for_page(&mut self, address: u64, call: Call) -> Result<(), FlashError> {
        self.wait_for_completion(call)
            .and_then(|result| check_result(call, result))
            .map_err(|error| FlashError::PageWrite {
                page_address: address,
                source: Box::new(error),
            })
    }

    fn verify(&mut self, layout: &FlashLayout) -> Result<Result<(), MismatchError>, FlashError> {
        self.transition(FlashState::Verifying);
        self.progress.started_verifying();

        match verify_layout(&mut *self.target, layout) {
            Ok(None) => {
                self.progress.finished_verifying();
                Ok(Ok(()))
            }
            Ok(Some(mismatch)) => {
                self.progress.failed_verifying();
                Ok(Err(mismatch))
            }
            Err(error) => {
                self.progress.failed_verifying();
                Err(error)
            }
        }
    }
}

fn check_result(call: Call, result: u32) -> Result<(), FlashError> {
    if result != 0 {
        Err(FlashError::RoutineCallFailed {
            name: call.name,
            address: call.address,
            error_code: result,
        })
    } else {
        Ok(())
    }
}

struct Registers {
    pc: u32,
    r0: Option<u32>,
    r1: Option<u32>,
    r2: Option<u32>,
    r3: Option<u32>,
}

impl Debug for Registers {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08x} ({:?}, {:?}, {:?}, {:?})",
            self.pc, self.r0, self.r1, self.r2, self.r3
        )
    }
}

fn into_reg(val: u64) -> Result<u32, FlashError> {
    let reg_value: u32 = val
        .try_into()
        .map_err(|_| FlashError::RegisterValueNotSupported(val))?;

    Ok(reg_value)
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use flashloader_target::{
        InstructionSet, MemoryMap, MemoryRegion, RamRegion, RawFlashAlgorithm, SectorDescription,
    };
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;
    use crate::flashing::builder::FlashBuilder;
    use crate::probe::fake_target::{FakeTarget, Routine};
    use crate::probe::DebugProbeError;

    const FLASH: std::ops::Range<u64> = 0x0800_0000..0x0800_4000;
    const BUFFERS: [u64; 2] = [0x2000_0230, 0x2000_0630];

    fn raw() -> RawFlashAlgorithm {
        RawFlashAlgorithm {
            name: "test".into(),
            load_address: 0x2000_0000,
            instructions: (0..138).map(|i| 0xe7fd_be00 ^ i).collect(),
            pc_init: Some(0x77),
            pc_uninit: Some(0xa1),
            pc_program_page: 0x127,
            pc_erase_sector: 0xdb,
            pc_erase_all: Some(0xb1),
            static_base: 0x2000_0224,
            begin_stack: 0x2000_1a30,
            end_stack: 0x2000_0a30,
            begin_data: 0x2000_1000,
            page_size: 0x400,
            min_program_length: 0x400,
            page_buffers: BUFFERS.to_vec(),
            flash_start: FLASH.start,
            flash_size: FLASH.end - FLASH.start,
            erased_byte_value: 0xff,
            sector_sizes: vec![SectorDescription {
                offset: 0,
                size: 0x800,
            }],
            ..Default::default()
        }
    }

    fn assemble(raw: &RawFlashAlgorithm) -> FlashAlgorithm {
        let memory_map = MemoryMap::new(vec![MemoryRegion::Ram(RamRegion {
            name: Some("sram1".into()),
            range: 0x2000_0000..0x2004_0000,
            is_boot_memory: false,
        })])
        .unwrap();

        FlashAlgorithm::assemble_from_raw(raw, &memory_map, InstructionSet::Thumb2).unwrap()
    }

    fn target(raw: &RawFlashAlgorithm) -> FakeTarget {
        FakeTarget::new(vec![0x2000_0000..0x2004_0000])
            .with_flash(FLASH, 0x00)
            .with_algorithm(raw)
    }

    fn layout(algorithm: &FlashAlgorithm, address: u64, data: &[u8]) -> FlashLayout {
        let mut builder = FlashBuilder::new();
        builder.add_data(address, data.to_vec()).unwrap();
        builder.build_sectors_and_pages(algorithm).unwrap()
    }

    fn image(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i * 7 + 3) as u8).collect()
    }

    fn options() -> ProgramOptions {
        ProgramOptions {
            double_buffering: true,
            ..Default::default()
        }
    }

    #[test]
    fn program_image_in_chunks() {
        let raw = raw();
        let algorithm = assemble(&raw);
        let target = target(&raw);
        let data = image(0x1000);
        let layout = layout(&algorithm, FLASH.start, &data);

        let mut access = target.clone();
        let mut flasher = Flasher::new(
            &mut access,
            algorithm,
            FlashTimeouts::default(),
            FlashProgress::empty(),
        );
        let report = flasher
            .run_program(
                &layout,
                &ProgramOptions {
                    verify: true,
                    ..options()
                },
            )
            .unwrap();
        assert_eq!(flasher.state(), FlashState::Finalized);

        assert_eq!(
            report,
            RegionReport {
                bytes_written: 0x1000,
                sectors_erased: 2,
                verify_result: Some(Ok(())),
            }
        );

        let routines: Vec<Routine> = target.calls().iter().map(|call| call.routine).collect();
        assert_eq!(
            routines,
            vec![
                Routine::Init,
                Routine::EraseSector,
                Routine::EraseSector,
                Routine::ProgramPage,
                Routine::ProgramPage,
                Routine::ProgramPage,
                Routine::ProgramPage,
                Routine::UnInit,
            ]
        );

        let calls = target.calls();
        assert_eq!(calls[0].arguments[0], 0x0800_0000);
        assert_eq!(calls[0].arguments[2], 2);
        assert_eq!(calls[1].arguments[0], 0x0800_0000);
        assert_eq!(calls[2].arguments[0], 0x0800_0800);
        assert_eq!(calls[7].arguments[0], 2);

        let programmed: Vec<u32> = target
            .calls_to(Routine::ProgramPage)
            .iter()
            .map(|call| call.arguments[0])
            .collect();
        assert_eq!(
            programmed,
            vec![0x0800_0000, 0x0800_0400, 0x0800_0800, 0x0800_0c00]
        );

        assert_eq!(target.flash(FLASH.start..FLASH.start + 0x1000), data);
        // Untouched sectors keep their contents.
        assert_eq!(
            target.flash(0x0800_1000..0x0800_1010),
            vec![0x00; 0x10]
        );
    }

    #[test]
    fn loader_sets_up_stack_and_static_base() {
        let raw = raw();
        let algorithm = assemble(&raw);
        let target = target(&raw);
        let layout = layout(&algorithm, FLASH.start, &image(0x10));

        let mut access = target.clone();
        Flasher::new(
            &mut access,
            algorithm,
            FlashTimeouts::default(),
            FlashProgress::empty(),
        )
        .run_program(&layout, &options())
        .unwrap();

        assert_eq!(target.register(13), 0x2000_1a30);
        assert_eq!(target.register(9), 0x2000_0224);
        // The return address keeps the Thumb bit.
        assert_eq!(target.register(14), 0x2000_0001);
    }

    #[test_case(false; "single buffer")]
    #[test_case(true; "double buffered")]
    fn failing_page_aborts_the_session(double_buffering: bool) {
        let raw = raw();
        let algorithm = assemble(&raw);
        let target = target(&raw);
        target.fail_routine(Routine::ProgramPage, 3, 0x55);
        let layout = layout(&algorithm, FLASH.start, &image(0x1400));

        let mut access = target.clone();
        let mut flasher = Flasher::new(
            &mut access,
            algorithm,
            FlashTimeouts::default(),
            FlashProgress::empty(),
        );
        let error = flasher
            .run_program(
                &layout,
                &ProgramOptions {
                    double_buffering,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(flasher.state(), FlashState::Aborted);

        assert!(matches!(error, FlashError::PageWrite { .. }));
        assert_eq!(error.address(), Some(0x0800_0800));
        assert_eq!(error.error_code(), Some(0x55));

        assert_eq!(target.calls_to(Routine::ProgramPage).len(), 3);
        let calls = target.calls();
        let last = calls.last().unwrap();
        assert_eq!(last.routine, Routine::UnInit);
        assert_eq!(last.result, Some(0));
    }

    #[test]
    fn timeout_aborts_and_halts() {
        let raw = raw();
        let algorithm = assemble(&raw);
        let target = target(&raw);
        target.hang_routine(Routine::EraseSector, 1);
        let layout = layout(&algorithm, FLASH.start, &image(0x100));

        let timeouts = FlashTimeouts {
            erase_sector: Duration::from_millis(20),
            ..Default::default()
        };

        let mut access = target.clone();
        let mut flasher = Flasher::new(&mut access, algorithm, timeouts, FlashProgress::empty());
        let error = flasher.run_program(&layout, &options()).unwrap_err();
        assert_eq!(flasher.state(), FlashState::Aborted);

        assert!(error.is_timeout());
        assert_eq!(error.address(), Some(0x0800_0000));
        assert!(target.is_halted());
        assert!(target.calls_to(Routine::ProgramPage).is_empty());
        assert_eq!(target.calls().last().unwrap().routine, Routine::UnInit);
    }

    #[test]
    fn double_buffering_never_refills_a_busy_buffer() {
        let raw = raw();
        let algorithm = assemble(&raw);
        let target = target(&raw).with_latency(3);
        let data = image(0x1000);
        let layout = layout(&algorithm, FLASH.start, &data);

        let mut access = target.clone();
        Flasher::new(
            &mut access,
            algorithm,
            FlashTimeouts::default(),
            FlashProgress::empty(),
        )
        .run_program(&layout, &options())
        .unwrap();

        assert_eq!(target.buffer_hazards(), 0);

        let buffers: Vec<u64> = target
            .calls_to(Routine::ProgramPage)
            .iter()
            .map(|call| call.arguments[2] as u64)
            .collect();
        assert_eq!(buffers, vec![BUFFERS[0], BUFFERS[1], BUFFERS[0], BUFFERS[1]]);

        assert_eq!(target.flash(FLASH.start..FLASH.start + 0x1000), data);
    }

    #[test]
    fn single_buffer_uses_the_first_buffer() {
        let raw = raw();
        let algorithm = assemble(&raw);
        let target = target(&raw).with_latency(3);
        let layout = layout(&algorithm, FLASH.start, &image(0x800));

        let mut access = target.clone();
        Flasher::new(
            &mut access,
            algorithm,
            FlashTimeouts::default(),
            FlashProgress::empty(),
        )
        .run_program(&layout, &ProgramOptions::default())
        .unwrap();

        assert_eq!(target.buffer_hazards(), 0);
        assert!(target
            .calls_to(Routine::ProgramPage)
            .iter()
            .all(|call| call.arguments[2] as u64 == BUFFERS[0]));
    }

    #[test]
    fn erasing_a_sector_twice_erases_it_once() {
        let raw = raw();
        let algorithm = assemble(&raw);
        let target = target(&raw);
        let sector = FlashSector::from(algorithm.sector_info(0x0800_0800).unwrap());

        let mut access = target.clone();
        let erased = Flasher::new(
            &mut access,
            algorithm,
            FlashTimeouts::default(),
            FlashProgress::empty(),
        )
        .run_erase(&ErasePlan::Sectors(vec![sector, sector]), false)
        .unwrap();

        assert_eq!(erased, 1);
        assert_eq!(target.sector_erase_count(0x0800_0800), 1);
        assert_eq!(target.flash(0x0800_0800..0x0800_1000), vec![0xff; 0x800]);

        let init = &target.calls_to(Routine::Init)[0];
        assert_eq!(init.arguments[2], 1);
    }

    #[test]
    fn init_failure_is_reported() {
        let raw = raw();
        let algorithm = assemble(&raw);
        let target = target(&raw);
        target.fail_routine(Routine::Init, 1, 7);
        let layout = layout(&algorithm, FLASH.start, &image(0x100));

        let mut access = target.clone();
        let mut flasher = Flasher::new(
            &mut access,
            algorithm,
            FlashTimeouts::default(),
            FlashProgress::empty(),
        );
        let error = flasher.run_program(&layout, &options()).unwrap_err();

        assert!(matches!(error, FlashError::Init { error_code: 7 }));
        assert_eq!(flasher.state(), FlashState::Aborted);
        assert_eq!(target.calls().len(), 1);
    }

    #[test]
    fn halt_outside_of_the_trampoline_is_detected() {
        let raw = raw();
        let mut moved = raw.clone();
        moved.pc_erase_sector = 0xe1;
        let algorithm = assemble(&moved);
        let target = target(&raw);
        let layout = layout(&algorithm, FLASH.start, &image(0x100));

        let mut access = target.clone();
        let error = Flasher::new(
            &mut access,
            algorithm,
            FlashTimeouts::default(),
            FlashProgress::empty(),
        )
        .run_program(&layout, &options())
        .unwrap_err();

        match error {
            FlashError::EraseFailed { source, .. } => assert!(matches!(
                *source,
                FlashError::UnexpectedHalt {
                    name: "erase_sector",
                    pc: 0x2000_00e1,
                }
            )),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(target.calls().last().unwrap().routine, Routine::UnInit);
    }

    #[test]
    fn locked_up_core_aborts() {
        let raw = raw();
        let algorithm = assemble(&raw);
        let target = target(&raw);
        target.lock_up_routine(Routine::EraseSector, 2);
        let layout = layout(&algorithm, FLASH.start, &image(0x1000));

        let mut access = target.clone();
        let error = Flasher::new(
            &mut access,
            algorithm,
            FlashTimeouts::default(),
            FlashProgress::empty(),
        )
        .run_program(&layout, &options())
        .unwrap_err();

        match error {
            FlashError::EraseFailed {
                sector_address,
                source,
            } => {
                assert_eq!(sector_address, 0x0800_0800);
                assert!(matches!(
                    *source,
                    FlashError::UnexpectedCoreStatus {
                        status: CoreStatus::LockedUp
                    }
                ));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(target.is_halted());
    }

    #[test_case(true, 1, 0; "with erase all routine")]
    #[test_case(false, 0, 8; "sector by sector")]
    fn full_erase(erase_all: bool, chip_erases: usize, sector_erases: usize) {
        let mut raw = raw();
        if !erase_all {
            raw.pc_erase_all = None;
        }
        let algorithm = assemble(&raw);
        let target = target(&raw);
        let layout = layout(&algorithm, FLASH.start, &image(0x100));

        let mut access = target.clone();
        let report = Flasher::new(
            &mut access,
            algorithm,
            FlashTimeouts::default(),
            FlashProgress::empty(),
        )
        .run_program(
            &layout,
            &ProgramOptions {
                full_erase: true,
                ..options()
            },
        )
        .unwrap();

        assert_eq!(report.sectors_erased, 8);
        assert_eq!(target.calls_to(Routine::EraseAll).len(), chip_erases);
        assert_eq!(target.calls_to(Routine::EraseSector).len(), sector_erases);
        assert_eq!(target.flash(0x0800_3ff0..0x0800_4000), vec![0xff; 0x10]);
    }

    #[test]
    fn image_covering_the_flash_uses_erase_all() {
        let raw = raw();
        let algorithm = assemble(&raw);
        let target = target(&raw);
        let data = image(0x4000);
        let layout = layout(&algorithm, FLASH.start, &data);

        let mut access = target.clone();
        Flasher::new(
            &mut access,
            algorithm,
            FlashTimeouts::default(),
            FlashProgress::empty(),
        )
        .run_program(&layout, &options())
        .unwrap();

        assert_eq!(target.calls_to(Routine::EraseAll).len(), 1);
        assert!(target.calls_to(Routine::EraseSector).is_empty());
        assert_eq!(target.flash(FLASH), data);
    }

    #[test]
    fn blank_sectors_are_skipped() {
        let raw = raw();
        let algorithm = assemble(&raw);
        let target = FakeTarget::new(vec![0x2000_0000..0x2004_0000])
            .with_flash(FLASH, 0xff)
            .with_algorithm(&raw);
        target.set_flash(0x0800_0900, &[0x12, 0x34]);
        let data = image(0x1000);
        let layout = layout(&algorithm, FLASH.start, &data);

        let mut access = target.clone();
        let report = Flasher::new(
            &mut access,
            algorithm,
            FlashTimeouts::default(),
            FlashProgress::empty(),
        )
        .run_program(
            &layout,
            &ProgramOptions {
                skip_erased_sectors: true,
                ..options()
            },
        )
        .unwrap();

        assert_eq!(report.sectors_erased, 1);
        let erases = target.calls_to(Routine::EraseSector);
        assert_eq!(erases.len(), 1);
        assert_eq!(erases[0].arguments[0], 0x0800_0800);
        assert_eq!(target.flash(FLASH.start..FLASH.start + 0x1000), data);
    }

    #[test]
    fn verify_mismatch_is_reported_but_not_fatal() {
        let raw = raw();
        let algorithm = assemble(&raw);
        let target = target(&raw);
        target.stick_byte(0x0800_0123, 0x00);
        let data = vec![0xa5; 0x400];
        let layout = layout(&algorithm, FLASH.start, &data);

        let mut access = target.clone();
        let mut flasher = Flasher::new(
            &mut access,
            algorithm,
            FlashTimeouts::default(),
            FlashProgress::empty(),
        );
        let report = flasher
            .run_program(
                &layout,
                &ProgramOptions {
                    verify: true,
                    ..options()
                },
            )
            .unwrap();

        assert_eq!(flasher.state(), FlashState::Finalized);
        assert_eq!(
            report.verify_result,
            Some(Err(MismatchError {
                address: 0x0800_0123,
                offset: 0x123,
                expected: 0xa5,
                actual: 0x00,
            }))
        );
    }

    #[test]
    fn verification_ignores_fills_and_counts_from_the_image_start() {
        let raw = raw();
        let algorithm = assemble(&raw);
        let data = vec![0xa5; 0x100];
        let layout = layout(&algorithm, FLASH.start + 0x10, &data);

        let run = |stuck_at: u64| {
            let target = target(&raw);
            target.stick_byte(stuck_at, 0x00);

            let mut access = target.clone();
            let mut flasher = Flasher::new(
                &mut access,
                algorithm.clone(),
                FlashTimeouts::default(),
                FlashProgress::empty(),
            );
            let report = flasher
                .run_program(
                    &layout,
                    &ProgramOptions {
                        verify: true,
                        ..options()
                    },
                )
                .unwrap();
            (target, report.verify_result)
        };

        // A fill byte that does not read back as written is not part of the image.
        let (target, result) = run(FLASH.start + 0x5);
        assert_eq!(target.flash(FLASH.start + 0x10..FLASH.start + 0x110), data);
        assert_eq!(result, Some(Ok(())));

        let (_, result) = run(FLASH.start + 0x20);
        assert_eq!(
            result,
            Some(Err(MismatchError {
                address: FLASH.start + 0x20,
                offset: 0x10,
                expected: 0xa5,
                actual: 0x00,
            }))
        );
    }

    #[test_case(true; "double buffered")]
    #[test_case(false; "single buffer")]
    fn lost_status_read_during_page_write_aborts(double_buffering: bool) {
        let raw = raw();
        let algorithm = assemble(&raw);
        let target = target(&raw);
        // Init, erase sector, program page.
        target.lose_status_read(3);
        let layout = layout(&algorithm, FLASH.start, &image(0x400));

        let mut access = target.clone();
        let mut flasher = Flasher::new(
            &mut access,
            algorithm,
            FlashTimeouts::default(),
            FlashProgress::empty(),
        );
        let error = flasher
            .run_program(
                &layout,
                &ProgramOptions {
                    double_buffering,
                    ..options()
                },
            )
            .unwrap_err();

        match error {
            FlashError::PageWrite {
                page_address,
                source,
            } => {
                assert_eq!(page_address, FLASH.start);
                assert!(matches!(
                    *source,
                    FlashError::Core(crate::Error::Probe(DebugProbeError::Disconnected))
                ));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(flasher.state(), FlashState::Aborted);
        assert_eq!(
            target.calls().iter().map(|call| call.routine).collect::<Vec<_>>(),
            [
                Routine::Init,
                Routine::EraseSector,
                Routine::ProgramPage,
                Routine::UnInit
            ]
        );
    }

    #[test]
    fn unwritable_ram_is_a_transport_error() {
        let raw = raw();
        let algorithm = assemble(&raw);
        let target = FakeTarget::new(vec![0x2001_0000..0x2002_0000]).with_flash(FLASH, 0xff);
        let layout = layout(&algorithm, FLASH.start, &image(0x10));

        let mut access = target.clone();
        let mut flasher = Flasher::new(
            &mut access,
            algorithm,
            FlashTimeouts::default(),
            FlashProgress::empty(),
        );
        let error = flasher.run_program(&layout, &options()).unwrap_err();

        assert!(matches!(error, FlashError::Memory(_)));
        assert_eq!(flasher.state(), FlashState::Aborted);
        assert!(target.calls().is_empty());
    }
}
