//! Hart: a single RISC-V hardware thread.
//!
//! A [`Hart`] owns everything architectural state needs to fetch, decode, and execute
//! instructions: the integer and floating-point register files, the CSR file, the
//! current privilege mode, a per-hart MMU (TLBs), a decode cache, and the LR/SC
//! reservation. It does not own memory or devices directly; those live on the
//! [`crate::soc::interconnect::Bus`] passed into [`Hart::step`].

mod execute;
/// Trap delivery, trap return, and interrupt-pending evaluation.
pub mod trap;

use crate::common::constants::DECODE_CACHE_SIZE;
use crate::common::RegisterFile;
use crate::core::arch::csr::{CsrFile, CYCLE, INSTRET, MHARTID, MSTATUS_TVM, SATP, TIME};
use crate::core::arch::mode::PrivilegeMode;
use crate::core::mmu::Mmu;
use crate::isa::instruction::Decoded;

/// A cached `(pc, decoded instruction, encoding length in bytes)` entry.
///
/// Keyed by `pc` so a stale slot (different `pc` hashing to the same index) is
/// detected and re-decoded rather than silently misused.
#[derive(Clone)]
struct DecodeCacheEntry {
    pc: u64,
    decoded: Decoded,
    len: u64,
}

/// A single RISC-V hardware thread: registers, CSRs, privilege mode, and per-hart
/// translation state.
pub struct Hart {
    /// Hardware thread ID, returned by the `mhartid` CSR.
    pub hart_id: u64,
    /// Integer and floating-point register files.
    pub regs: RegisterFile,
    /// Program counter.
    pub pc: u64,
    /// Control and status registers.
    pub csrs: CsrFile,
    /// Current privilege mode.
    pub privilege: PrivilegeMode,
    /// Per-hart memory management unit (instruction and data TLBs).
    pub mmu: Mmu,
    /// Physical address reserved by the most recent `LR`, cleared by a matching `SC`,
    /// any trap, or any store this hart observes to the reserved line.
    pub reservation: Option<u64>,
    /// Set by `WFI`; cleared once a locally-enabled interrupt becomes pending.
    pub waiting_for_interrupt: bool,
    /// Retired-instruction count (`minstret` mirrors this; kept separately so stats
    /// can read it without borrowing the CSR file mutably).
    pub instructions_retired: u64,
    /// `mcause`/`scause`-style cause code (interrupt bit included) of the most
    /// recent trap taken by this hart, for [`crate::stats::SimStats`] to poll after
    /// each [`Hart::step`]. Not consulted by architectural semantics.
    pub last_trap_cause: Option<u64>,
    decode_cache: Vec<Option<DecodeCacheEntry>>,
}

impl Hart {
    /// Creates a new hart at the given hardware thread ID, reset to the architectural
    /// reset state (M-mode, pc at `reset_pc`, all CSRs zeroed except `misa`).
    #[must_use]
    pub fn new(hart_id: u64, reset_pc: u64, tlb_size: usize) -> Self {
        Self {
            hart_id,
            regs: RegisterFile::new(),
            pc: reset_pc,
            csrs: CsrFile::default(),
            privilege: PrivilegeMode::Machine,
            mmu: Mmu::new(tlb_size),
            reservation: None,
            waiting_for_interrupt: false,
            instructions_retired: 0,
            last_trap_cause: None,
            decode_cache: vec![None; DECODE_CACHE_SIZE],
        }
    }

    /// Reads a CSR by address, filling in hart-specific values the CSR file itself
    /// cannot know (`mhartid`). Returns `None` for an inaccessible or unimplemented
    /// address; the caller raises `IllegalInstruction`.
    #[must_use]
    pub fn read_csr(&self, addr: u32) -> Option<u64> {
        if addr == MHARTID {
            return Some(self.hart_id);
        }
        if !CsrFile::accessible(addr, self.privilege) {
            return None;
        }
        if self.privilege == PrivilegeMode::User && !self.counter_enabled_for_user(addr) {
            return None;
        }
        self.csrs.read(addr)
    }

    /// Whether `MCOUNTEREN` permits U-mode access to the `CYCLE`/`TIME`/`INSTRET` CSR at
    /// `addr`; always `true` for any other address.
    fn counter_enabled_for_user(&self, addr: u32) -> bool {
        use crate::core::arch::csr::{MCOUNTEREN_CY, MCOUNTEREN_IR, MCOUNTEREN_TM};
        let bit = match addr {
            CYCLE => MCOUNTEREN_CY,
            TIME => MCOUNTEREN_TM,
            INSTRET => MCOUNTEREN_IR,
            _ => return true,
        };
        self.csrs.mcounteren & bit != 0
    }

    /// Writes a CSR by address, respecting read-only and privilege-level encoding.
    /// Returns `false` if the write should trap as `IllegalInstruction`.
    #[must_use]
    pub fn write_csr(&mut self, addr: u32, val: u64) -> bool {
        if CsrFile::is_read_only(addr) || !CsrFile::accessible(addr, self.privilege) {
            return false;
        }
        if addr == SATP && self.privilege == PrivilegeMode::Supervisor && self.csrs.mstatus & MSTATUS_TVM != 0 {
            return false;
        }
        let changes_translation = addr == SATP;
        let wrote = self.csrs.write(addr, val);
        if wrote && changes_translation {
            self.mmu.flush_all();
        }
        wrote
    }

    /// Looks up `pc` in the decode cache, decoding and inserting on a miss.
    /// Returns the decoded instruction and its length in bytes (2 for compressed, 4
    /// otherwise). Never consults the cache across a `pc` whose raw encoding could
    /// have changed (self-modifying code is out of scope; see crate docs).
    fn decode_at(&mut self, raw: u32, pc: u64) -> (Decoded, u64) {
        let is_compressed = (raw as u16) & 0b11 != 0b11;
        let len = if is_compressed { 2 } else { 4 };
        let index = ((pc >> 1) as usize) & (DECODE_CACHE_SIZE - 1);
        if let Some(entry) = &self.decode_cache[index] {
            if entry.pc == pc {
                return (entry.decoded.clone(), entry.len);
            }
        }
        let word = if is_compressed {
            crate::isa::rvc::expand::expand(raw as u16)
        } else {
            raw
        };
        let decoded = crate::isa::decode::decode(word);
        self.decode_cache[index] = Some(DecodeCacheEntry { pc, decoded: decoded.clone(), len });
        (decoded, len)
    }

    /// Invalidates the decode cache. Required whenever code memory may have been
    /// overwritten (e.g. a `FENCE.I`), since cached entries are never checked against
    /// the underlying bytes.
    pub fn flush_decode_cache(&mut self) {
        for slot in &mut self.decode_cache {
            *slot = None;
        }
    }

    /// Runs one fetch/decode/execute/retire cycle. Traps are handled internally
    /// (the hart's pc and privilege are redirected to the trap handler) rather than
    /// propagated to the caller; traps are delivered exclusively through
    /// [`trap::deliver`], never surfaced as an `Err` here.
    pub fn step(&mut self, bus: &mut crate::soc::interconnect::Bus) {
        crate::core::hart::execute::step(self, bus);
    }
}
