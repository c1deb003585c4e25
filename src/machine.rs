//! Top-level machine: owns physical memory, the MMIO bus, every device, and every
//! hart, and drives the fetch/decode/execute/retire loop.
//!
//! Control flow per tick: each hart steps once (`fetch → decode → execute → retire`
//! happens inside [`crate::core::hart::Hart::step`]); then the bus ticks every
//! device (advancing CLINT's `mtime`, re-evaluating PLIC claims); then each hart's
//! `mip` is resynchronized against the CLINT/PLIC lines that target it.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::MachineError;
use crate::config::Config;
use crate::core::Hart;
use crate::core::hart::trap;
use crate::soc::devices::{Clint, Plic, SysCon, Uart, VirtioBlock};
use crate::soc::interconnect::Bus;
use crate::soc::memory::Memory;
use crate::soc::memory::buffer::DramBuffer;
use crate::stats::SimStats;

/// Lifecycle state of a [`Machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// Not yet started, or has completed a poweroff.
    PoweredOff,
    /// Actively ticking harts.
    Running,
    /// Externally paused (e.g. a debugger attached); harts do not step.
    Halted,
    /// A device or the host requested shutdown; the run loop exits on the next tick.
    PoweringOff,
}

/// Owns every hart, the MMIO bus, and physical memory; the entry point for driving
/// a RISC-V guest.
pub struct Machine {
    /// All harts, indexed by hart id.
    pub harts: Vec<Hart>,
    /// System interconnect: RAM plus every MMIO device.
    pub bus: Bus,
    /// Run-level counters.
    pub stats: SimStats,
    state: MachineState,
    exit_request: Arc<AtomicU64>,
    ram_base: u64,
    kernel_offset: u64,
    dtb_offset: u64,
}

impl Machine {
    /// Builds a machine from `config`: RAM, UART, CLINT, PLIC, VirtIO disk, and
    /// system controller on the bus, and `config.general.n_harts` harts reset to
    /// `config.general.start_pc` with `a0`=hart id and `a1`=DTB physical address.
    #[tracing::instrument(skip(config))]
    pub fn new(config: &Config) -> Result<Self, MachineError> {
        let sys = &config.system;
        let n_harts = config.general.n_harts.max(1);

        let mut bus = Bus::new(8, 0);

        let ram_buffer = Arc::new(DramBuffer::new(sys.ram_size));
        let mem = Memory::new(ram_buffer.clone(), sys.ram_base);
        bus.add_device(Box::new(mem));

        let uart = Uart::new(sys.uart_base, sys.uart_to_stderr);
        bus.add_device(Box::new(uart));

        let disk = VirtioBlock::new(sys.disk_base, sys.ram_base, ram_buffer);
        bus.add_device(Box::new(disk));

        let clint = Clint::new(sys.clint_base, n_harts, sys.clint_divider);
        bus.add_device(Box::new(clint));

        let plic = Plic::new(sys.plic_base, n_harts);
        bus.add_device(Box::new(plic));

        let exit_request = Arc::new(AtomicU64::new(u64::MAX));
        let syscon = SysCon::new(sys.syscon_base, exit_request.clone());
        bus.add_device(Box::new(syscon));

        let dtb_addr = sys.ram_base + sys.dtb_offset;
        let harts = (0..n_harts)
            .map(|id| {
                let mut hart = Hart::new(id as u64, config.general.start_pc, sys.tlb_size);
                hart.regs.write(10, id as u64);
                hart.regs.write(11, dtb_addr);
                hart
            })
            .collect();

        tracing::debug!(n_harts, start_pc = config.general.start_pc, "machine constructed");

        Ok(Self {
            harts,
            bus,
            stats: SimStats::default(),
            state: MachineState::Running,
            exit_request,
            ram_base: sys.ram_base,
            kernel_offset: sys.kernel_offset,
            dtb_offset: sys.dtb_offset,
        })
    }

    /// Writes raw bytes into physical memory at `addr`.
    pub fn load_binary_at(&mut self, data: &[u8], addr: u64) {
        self.bus.load_binary_at(data, addr);
    }

    /// Loads a kernel image at `ram_base + kernel_offset`.
    pub fn load_kernel(&mut self, data: &[u8]) {
        self.load_binary_at(data, self.ram_base + self.kernel_offset);
    }

    /// Loads a pre-built device tree blob at `ram_base + dtb_offset`. Auto-generating
    /// an FDT from the machine's configured shape is not implemented; callers supply
    /// a prebuilt blob (e.g. from `--dtb` on an external CLI).
    pub fn load_dtb(&mut self, data: &[u8]) {
        self.load_binary_at(data, self.ram_base + self.dtb_offset);
    }

    /// Reads a disk image from `path` and loads it into the VirtIO backing store.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::Io`] if `path` cannot be read.
    pub fn load_disk_image(&mut self, path: &str) -> Result<(), MachineError> {
        let data = fs::read(path)?;
        if let Some(disk) = self.find_virtio_mut() {
            disk.load(data);
        }
        Ok(())
    }

    fn find_virtio_mut(&mut self) -> Option<&mut VirtioBlock> {
        self.bus.as_virtio_mut()
    }

    /// Advances every hart by one instruction and ticks every device once, then
    /// resynchronizes each hart's `mip` against the CLINT/PLIC lines targeting it.
    pub fn tick(&mut self) {
        for hart in &mut self.harts {
            hart.step(&mut self.bus);
            self.stats.instructions_retired = hart.instructions_retired;
            if let Some(cause) = hart.last_trap_cause.take() {
                self.stats.record_trap(cause);
            }
        }

        let plic_states = self.bus.tick();
        let mtime = self.bus.mtime();
        for (id, hart) in self.harts.iter_mut().enumerate() {
            let timer_irq = self.bus.hart_timer_pending(id);
            let software_irq = self.bus.hart_software_pending(id);
            let (meip, seip) = plic_states.get(id).copied().unwrap_or((false, false));
            trap::sync_external_interrupts(hart, mtime, timer_irq, software_irq, meip, seip);
        }

        self.stats.cycles += 1;

        if self.bus.check_kernel_panic() {
            tracing::warn!("kernel panic detected on UART output, powering off");
            self.request_poweroff();
        }
        if let Some(code) = self.check_exit() {
            tracing::debug!(code, "syscon exit requested, powering off");
            self.request_poweroff();
        }
    }

    /// Runs ticks until the machine reaches [`MachineState::PoweredOff`]; returns the
    /// total number of ticks executed.
    #[tracing::instrument(skip(self))]
    pub fn run_until_halt(&mut self) -> u64 {
        let mut ticks = 0u64;
        loop {
            match self.state {
                MachineState::PoweredOff => break,
                MachineState::PoweringOff => {
                    self.state = MachineState::PoweredOff;
                    break;
                }
                MachineState::Halted => break,
                MachineState::Running => {
                    self.tick();
                    ticks += 1;
                }
            }
        }
        ticks
    }

    /// Cooperative shutdown request: the run loop exits on its next iteration.
    pub fn request_poweroff(&mut self) {
        self.state = MachineState::PoweringOff;
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> MachineState {
        self.state
    }

    /// The exit code requested via the system controller, if any.
    #[must_use]
    pub fn check_exit(&self) -> Option<u64> {
        let val = self.exit_request.load(Ordering::Relaxed);
        if val == u64::MAX { None } else { Some(val) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds_a_single_hart_machine() {
        let config = Config::default();
        let machine = Machine::new(&config).unwrap();
        assert_eq!(machine.harts.len(), 1);
        assert_eq!(machine.state(), MachineState::Running);
    }

    #[test]
    fn boot_registers_seed_hart_id_and_dtb_address() {
        let mut config = Config::default();
        config.general.n_harts = 2;
        let machine = Machine::new(&config).unwrap();
        let dtb_addr = config.system.ram_base + config.system.dtb_offset;
        for (id, hart) in machine.harts.iter().enumerate() {
            assert_eq!(hart.regs.read(10), id as u64);
            assert_eq!(hart.regs.read(11), dtb_addr);
        }
    }

    #[test]
    fn tick_advances_cycles_and_retires_at_least_one_instruction_per_hart() {
        let config = Config::default();
        let mut machine = Machine::new(&config).unwrap();
        // ADDI x1, x0, 1 at reset_pc.
        machine.load_binary_at(&0x0010_0093u32.to_le_bytes(), config.general.start_pc);
        machine.tick();
        assert_eq!(machine.stats.cycles, 1);
        assert_eq!(machine.harts[0].regs.read(1), 1);
    }

    #[test]
    fn poweroff_request_is_observed_on_the_next_run_until_halt_iteration() {
        let config = Config::default();
        let mut machine = Machine::new(&config).unwrap();
        machine.request_poweroff();
        let ticks = machine.run_until_halt();
        assert_eq!(ticks, 0);
        assert_eq!(machine.state(), MachineState::PoweredOff);
    }

    #[test]
    fn load_disk_image_reads_the_file_and_exposes_its_sector_count() {
        use std::io::Write;

        let config = Config::default();
        let mut machine = Machine::new(&config).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 1536]).unwrap();
        machine.load_disk_image(file.path().to_str().unwrap()).unwrap();

        // capacity register, in 512-byte sectors, at the VirtIO config space base.
        let capacity = machine.bus.read_u32(config.system.disk_base + 0x100).unwrap();
        assert_eq!(capacity, 3);
    }

    #[test]
    fn load_disk_image_propagates_io_errors_for_a_missing_file() {
        let config = Config::default();
        let mut machine = Machine::new(&config).unwrap();
        assert!(machine.load_disk_image("/no/such/disk-image.img").is_err());
    }
}
