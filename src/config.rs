//! Configuration for the RISC-V machine.
//!
//! A layered, `serde`-deserializable tree mirroring the [`crate::machine::Machine`]'s
//! static shape (hart count, ISA string, memory map) — never its runtime state. Every
//! field has a default resolving to the memory map below, so `Config::default()` and
//! `serde_json::from_str("{}")` both produce a bootable single-hart machine.

use serde::Deserialize;

/// Default configuration constants for the machine.
mod defaults {
    /// Base address of main system RAM.
    pub const RAM_BASE: u64 = 0x8000_0000;
    /// Total size of main system RAM (128 MiB).
    pub const RAM_SIZE: usize = 128 * 1024 * 1024;
    /// Offset from RAM base where kernel images are loaded (2 MiB).
    pub const KERNEL_OFFSET: u64 = 0x0020_0000;
    /// Offset from RAM base where an auto-generated or supplied DTB is placed.
    pub const DTB_OFFSET: u64 = 0x0010_0000;
    /// Base address of the UART 16550-compatible serial port.
    pub const UART_BASE: u64 = 0x1000_0000;
    /// Base address of the VirtIO block device.
    pub const DISK_BASE: u64 = 0x9000_0000;
    /// Base address of the CLINT (Core Local Interruptor).
    pub const CLINT_BASE: u64 = 0x0200_0000;
    /// Base address of the PLIC (Platform-Level Interrupt Controller).
    pub const PLIC_BASE: u64 = 0x0c00_0000;
    /// Base address of the system controller (power/reset).
    pub const SYSCON_BASE: u64 = 0x0010_0000;
    /// CLINT timer divider: `mtime` advances once every N machine ticks.
    pub const CLINT_DIVIDER: u64 = 10;
    /// Per-hart TLB entry count.
    pub const TLB_SIZE: usize = 32;
    /// Default hart count.
    pub const N_HARTS: usize = 1;
    /// Default `misa` extension string.
    pub const ISA: &str = "imafdc_zicsr_zifencei";
}

/// Root configuration structure for a machine instance.
///
/// # Examples
///
/// ```
/// use rv64_core::config::Config;
///
/// let config = Config::default();
/// assert_eq!(config.general.n_harts, 1);
/// assert_eq!(config.system.ram_base, 0x8000_0000);
/// ```
///
/// Deserializing from JSON with overrides:
///
/// ```
/// use rv64_core::config::Config;
///
/// let json = r#"{
///     "general": { "n_harts": 2, "start_pc": 2147483648 },
///     "system": { "ram_size": 67108864 }
/// }"#;
/// let config: Config = serde_json::from_str(json).unwrap();
/// assert_eq!(config.general.n_harts, 2);
/// assert_eq!(config.system.ram_size, 67108864);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General machine-shape settings (hart count, ISA string, reset pc).
    pub general: GeneralConfig,
    /// Memory map and per-device MMIO base addresses.
    pub system: SystemConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            system: SystemConfig::default(),
        }
    }
}

/// General machine-shape settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Number of harts to construct.
    pub n_harts: usize,
    /// Initial program counter for every hart (defaults to RAM base).
    pub start_pc: u64,
    /// `misa`-equivalent extension string (e.g. `"imafdc_zicsr_zifencei"`).
    pub isa: String,
    /// Emit `tracing::trace!` for every retired instruction. Off by default: this is
    /// the single hottest path in the machine and the cost is paid even when no
    /// subscriber is installed unless disabled here.
    pub trace_instructions: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            n_harts: defaults::N_HARTS,
            start_pc: defaults::RAM_BASE,
            isa: defaults::ISA.to_string(),
            trace_instructions: false,
        }
    }
}

/// Memory map: MMIO base addresses and RAM geometry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Main RAM base address.
    pub ram_base: u64,
    /// Main RAM size in bytes.
    pub ram_size: usize,
    /// Kernel load offset from `ram_base`.
    pub kernel_offset: u64,
    /// DTB load offset from `ram_base`.
    pub dtb_offset: u64,
    /// UART MMIO base address.
    pub uart_base: u64,
    /// CLINT MMIO base address.
    pub clint_base: u64,
    /// PLIC MMIO base address.
    pub plic_base: u64,
    /// VirtIO disk MMIO base address.
    pub disk_base: u64,
    /// System controller (power/reset) MMIO base address.
    pub syscon_base: u64,
    /// CLINT timer divider (`mtime` increments every N machine ticks).
    pub clint_divider: u64,
    /// Per-hart TLB entry count.
    pub tlb_size: usize,
    /// Route UART output to stderr instead of stdout.
    pub uart_to_stderr: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            ram_base: defaults::RAM_BASE,
            ram_size: defaults::RAM_SIZE,
            kernel_offset: defaults::KERNEL_OFFSET,
            dtb_offset: defaults::DTB_OFFSET,
            uart_base: defaults::UART_BASE,
            clint_base: defaults::CLINT_BASE,
            plic_base: defaults::PLIC_BASE,
            disk_base: defaults::DISK_BASE,
            syscon_base: defaults::SYSCON_BASE,
            clint_divider: defaults::CLINT_DIVIDER,
            tlb_size: defaults::TLB_SIZE,
            uart_to_stderr: false,
        }
    }
}
