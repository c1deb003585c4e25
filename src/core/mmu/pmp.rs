//! Physical Memory Protection (PMP).
//!
//! Restricts physical memory access based on the current privilege mode and the
//! `pmpcfg`/`pmpaddr` CSRs (spec §3.7 of the RISC-V privileged ISA). Entries live in
//! [`crate::core::arch::csr::CsrFile`]; this module is a stateless checker over that
//! storage so there is one copy of PMP state, not two.
//!
//! PMP supports three address-matching modes:
//! - **TOR** (Top of Range): region is `[pmpaddr[i-1], pmpaddr[i])`.
//! - **NA4**: naturally aligned 4-byte region.
//! - **NAPOT**: naturally aligned power-of-two region.
//!
//! A locked (`L=1`) TOR entry also locks the *base* of the entry above it: writing
//! `pmpaddr[i+1]` while `pmpcfg[i]` is locked-TOR is rejected by [`CsrFile::write`], so
//! that a locked region's lower bound cannot be moved out from under it.

use crate::common::constants::PMP_COUNT;

const A_SHIFT: u8 = 3;
const A_MASK: u8 = 0x3;
const PMP_R: u8 = 1 << 0;
const PMP_W: u8 = 1 << 1;
const PMP_X: u8 = 1 << 2;
const PMP_L: u8 = 1 << 7;

/// Address matching mode extracted from a `pmpcfg` byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmpAddrMatch {
    /// Entry disabled.
    Off,
    /// Top of Range: region is `[pmpaddr[i-1], pmpaddr[i])`.
    Tor,
    /// Naturally aligned 4-byte region.
    Na4,
    /// Naturally aligned power-of-two region.
    Napot,
}

impl PmpAddrMatch {
    /// Decodes the mode from the 2-bit A field of a `pmpcfg` byte.
    #[must_use]
    pub fn from_cfg(cfg: u8) -> Self {
        match (cfg >> A_SHIFT) & A_MASK {
            0 => Self::Off,
            1 => Self::Tor,
            2 => Self::Na4,
            _ => Self::Napot,
        }
    }
}

/// Outcome of a PMP permission check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmpResult {
    /// Access is permitted.
    Allow,
    /// Access is denied; caller raises the appropriate access-fault trap.
    Deny,
}

/// Computes the `[lo, hi)` byte range for a NAPOT entry.
///
/// Region size is `2^(trailing_ones_in_pmpaddr + 3)` bytes; the base is the shifted
/// address with those trailing one-bits (and the terminating zero) cleared.
fn napot_range(pmpaddr: u64) -> (u64, u64) {
    let trailing = (!pmpaddr).trailing_zeros().min(53) as u64;
    let size = 1u64 << (trailing + 3);
    let base = (pmpaddr << 2) & !(size - 1);
    (base, base + size)
}

/// Computes the `[lo, hi)` byte range for an NA4 entry (exactly 4 bytes).
fn na4_range(pmpaddr: u64) -> (u64, u64) {
    let base = pmpaddr << 2;
    (base, base + 4)
}

/// Checks whether an access to `[byte_addr, byte_addr + size)` is permitted.
///
/// Entries are scanned in order; the first matching entry decides the access (lower
/// indices take priority, per the RISC-V privileged architecture). If no entry matches: M-mode is
/// always allowed (PMP has no effect absent any configured region), any other mode
/// is denied once at least one PMP entry is configured at all, and allowed if the PMP
/// is entirely unconfigured (all entries `Off`).
#[must_use]
pub fn check(
    pmpcfg: &[u8; PMP_COUNT],
    pmpaddr: &[u64; PMP_COUNT],
    byte_addr: u64,
    size: u64,
    is_read: bool,
    is_write: bool,
    is_exec: bool,
    is_machine_mode: bool,
) -> PmpResult {
    let access_end = byte_addr + size;
    let mut any_configured = false;

    for i in 0..PMP_COUNT {
        let cfg = pmpcfg[i];
        let mode = PmpAddrMatch::from_cfg(cfg);
        if mode == PmpAddrMatch::Off {
            continue;
        }
        any_configured = true;

        let (lo, hi) = match mode {
            PmpAddrMatch::Tor => {
                let hi = pmpaddr[i] << 2;
                let lo = if i == 0 { 0 } else { pmpaddr[i - 1] << 2 };
                (lo, hi)
            }
            PmpAddrMatch::Na4 => na4_range(pmpaddr[i]),
            PmpAddrMatch::Napot => napot_range(pmpaddr[i]),
            PmpAddrMatch::Off => unreachable!(),
        };

        if byte_addr >= lo && access_end <= hi {
            let locked = cfg & PMP_L != 0;
            if is_machine_mode && !locked {
                return PmpResult::Allow;
            }
            let permitted = (!is_read || cfg & PMP_R != 0)
                && (!is_write || cfg & PMP_W != 0)
                && (!is_exec || cfg & PMP_X != 0);
            return if permitted { PmpResult::Allow } else { PmpResult::Deny };
        }
    }

    if is_machine_mode || !any_configured {
        PmpResult::Allow
    } else {
        PmpResult::Deny
    }
}
