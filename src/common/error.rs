//! Trap representation.
//!
//! Architectural traps (exceptions and interrupts) are delivered exclusively through
//! the trap machine (`core::trap`) and never bubble past a hart's `step`. This module
//! defines the sum type callers of load/store/translate/CSR helpers return on failure.

use super::addr::PhysAddr;

/// RISC-V trap: a synchronous exception or an asynchronous interrupt.
///
/// Each variant carries the `tval` payload required to populate `mtval`/`stval`.
/// Software/timer/external interrupts carry the destination privilege level
/// (0=U, 1=S, 3=M) so `exception_code` can reconstruct the cause number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Trap {
    /// Instruction address misaligned; payload is the faulting address.
    #[error("instruction address misaligned: {0:#x}")]
    InstructionAddressMisaligned(u64),
    /// Instruction access fault (PMP denial or unmapped fetch); payload is the address.
    #[error("instruction access fault: {0:#x}")]
    InstructionAccessFault(u64),
    /// Illegal instruction; payload is the raw encoding.
    #[error("illegal instruction: {0:#010x}")]
    IllegalInstruction(u32),
    /// Breakpoint (EBREAK); payload is the instruction's pc.
    #[error("breakpoint at {0:#x}")]
    Breakpoint(u64),
    /// Load address misaligned; payload is the faulting address.
    #[error("load address misaligned: {0:#x}")]
    LoadAddressMisaligned(u64),
    /// Load access fault; payload is the faulting address.
    #[error("load access fault: {0:#x}")]
    LoadAccessFault(u64),
    /// Store/AMO address misaligned; payload is the faulting address.
    #[error("store address misaligned: {0:#x}")]
    StoreAddressMisaligned(u64),
    /// Store/AMO access fault; payload is the faulting address.
    #[error("store access fault: {0:#x}")]
    StoreAccessFault(u64),
    /// ECALL from U-mode.
    #[error("environment call from U-mode")]
    EnvironmentCallFromUMode,
    /// ECALL from S-mode.
    #[error("environment call from S-mode")]
    EnvironmentCallFromSMode,
    /// ECALL from M-mode.
    #[error("environment call from M-mode")]
    EnvironmentCallFromMMode,
    /// Instruction page fault; payload is the faulting virtual address.
    #[error("instruction page fault: {0:#x}")]
    InstructionPageFault(u64),
    /// Load page fault; payload is the faulting virtual address.
    #[error("load page fault: {0:#x}")]
    LoadPageFault(u64),
    /// Store/AMO page fault; payload is the faulting virtual address.
    #[error("store page fault: {0:#x}")]
    StorePageFault(u64),
    /// Software interrupt, tagged by destination mode (0=U,1=S,3=M).
    #[error("software interrupt (mode {0})")]
    SoftwareInterrupt(u8),
    /// Timer interrupt, tagged by destination mode.
    #[error("timer interrupt (mode {0})")]
    TimerInterrupt(u8),
    /// External interrupt, tagged by destination mode.
    #[error("external interrupt (mode {0})")]
    ExternalInterrupt(u8),
}

impl Trap {
    /// The RISC-V privileged-spec cause code, without the interrupt bit.
    #[must_use]
    pub fn exception_code(self) -> u64 {
        match self {
            Self::InstructionAddressMisaligned(_) => 0,
            Self::InstructionAccessFault(_) => 1,
            Self::IllegalInstruction(_) => 2,
            Self::Breakpoint(_) => 3,
            Self::LoadAddressMisaligned(_) => 4,
            Self::LoadAccessFault(_) => 5,
            Self::StoreAddressMisaligned(_) => 6,
            Self::StoreAccessFault(_) => 7,
            Self::EnvironmentCallFromUMode => 8,
            Self::EnvironmentCallFromSMode => 9,
            Self::EnvironmentCallFromMMode => 11,
            Self::InstructionPageFault(_) => 12,
            Self::LoadPageFault(_) => 13,
            Self::StorePageFault(_) => 15,
            Self::SoftwareInterrupt(m) => u64::from(m),
            Self::TimerInterrupt(m) => 4 + u64::from(m),
            Self::ExternalInterrupt(m) => 8 + u64::from(m),
        }
    }

    /// Whether this trap is an asynchronous interrupt rather than a synchronous exception.
    #[must_use]
    pub fn is_interrupt(self) -> bool {
        matches!(
            self,
            Self::SoftwareInterrupt(_) | Self::TimerInterrupt(_) | Self::ExternalInterrupt(_)
        )
    }

    /// The value to store in `mtval`/`stval` for this trap; 0 where the privileged
    /// architecture defines none.
    #[must_use]
    pub fn tval(self) -> u64 {
        match self {
            Self::InstructionAddressMisaligned(a)
            | Self::InstructionAccessFault(a)
            | Self::Breakpoint(a)
            | Self::LoadAddressMisaligned(a)
            | Self::LoadAccessFault(a)
            | Self::StoreAddressMisaligned(a)
            | Self::StoreAccessFault(a)
            | Self::InstructionPageFault(a)
            | Self::LoadPageFault(a)
            | Self::StorePageFault(a) => a,
            Self::IllegalInstruction(raw) => u64::from(raw),
            _ => 0,
        }
    }
}

/// Host-level failure: something the machine itself cannot recover from, as
/// distinct from a guest-visible [`Trap`]. Never propagated as a guest trap.
#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    /// I/O failure loading a binary, disk image, or DTB blob.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A newly registered device's address range overlaps an existing one.
    #[error("device region overlaps an existing device: base={base:#x} size={size:#x}")]
    RegionOverlap {
        /// Base address of the overlapping region.
        base: u64,
        /// Size in bytes of the overlapping region.
        size: u64,
    },
    /// A downcast to a required device type failed (e.g. no CLINT attached).
    #[error("required device not found: {0}")]
    UnknownDevice(String),
}

/// Outcome of a virtual-to-physical address translation.
pub enum TranslationResult {
    /// Translation succeeded; the physical address follows.
    Ok(PhysAddr),
    /// Translation failed with the given trap.
    Fault(Trap),
}
