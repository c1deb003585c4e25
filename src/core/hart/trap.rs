//! Trap delivery, trap return (`MRET`/`SRET`), and interrupt-pending evaluation.
//!
//! Traps are delivered to M-mode unless the privileged spec's delegation rules route
//! them to S-mode: an exception can be delegated via `medeleg`, an interrupt via
//! `mideleg`, and delegation is only honored when the current privilege is at or
//! below the delegated target (M-mode traps are never delegated away from M-mode).

use crate::common::error::Trap;
use crate::core::arch::csr::{
    MIE_MTIE, MIE_STIE, MIP_MEIP, MIP_MSIP, MIP_MTIP, MIP_SEIP, MIP_SSIP, MIP_STIP, MSTATUS_MIE, MSTATUS_MPIE,
    MSTATUS_MPP, MSTATUS_MPP_SHIFT, MSTATUS_SIE, MSTATUS_SPIE, MSTATUS_SPP, MSTATUS_TSR,
};
use crate::core::arch::mode::PrivilegeMode;
use crate::core::hart::Hart;
use crate::isa::privileged::opcodes::{MRET, SRET};

/// Delivers `trap` to the hart: picks the target privilege level (M or S, per
/// delegation), saves the interrupted context, and redirects `pc` to the target
/// trap vector.
pub fn deliver(hart: &mut Hart, trap: Trap) {
    let cause = trap.exception_code() | if trap.is_interrupt() { crate::common::constants::CAUSE_INTERRUPT_BIT } else { 0 };
    let to_supervisor = delegated_to_supervisor(hart, trap);

    hart.reservation = None;
    hart.last_trap_cause = Some(cause);

    if to_supervisor {
        hart.csrs.sepc = hart.pc;
        hart.csrs.scause = cause;
        hart.csrs.stval = trap.tval();
        let sie = hart.csrs.mstatus & MSTATUS_SIE != 0;
        hart.csrs.mstatus = (hart.csrs.mstatus & !MSTATUS_SPIE) | (u64::from(sie) << 5);
        hart.csrs.mstatus &= !MSTATUS_SIE;
        let spp = u64::from(hart.privilege == PrivilegeMode::Supervisor);
        hart.csrs.mstatus = (hart.csrs.mstatus & !MSTATUS_SPP) | (spp << 8);
        hart.privilege = PrivilegeMode::Supervisor;
        hart.pc = trap_target(hart.csrs.stvec, cause, trap.is_interrupt());
    } else {
        hart.csrs.mepc = hart.pc;
        hart.csrs.mcause = cause;
        hart.csrs.mtval = trap.tval();
        let mie = hart.csrs.mstatus & MSTATUS_MIE != 0;
        hart.csrs.mstatus = (hart.csrs.mstatus & !MSTATUS_MPIE) | (u64::from(mie) << 7);
        hart.csrs.mstatus &= !MSTATUS_MIE;
        let mpp = u64::from(hart.privilege.to_u8());
        hart.csrs.mstatus = (hart.csrs.mstatus & !MSTATUS_MPP) | (mpp << MSTATUS_MPP_SHIFT);
        hart.privilege = PrivilegeMode::Machine;
        hart.pc = trap_target(hart.csrs.mtvec, cause, trap.is_interrupt());
    }
}

/// Whether `trap` is delegated to S-mode: only possible if current privilege is
/// S or U (M-mode traps are never delegated) and the corresponding delegation bit
/// is set.
fn delegated_to_supervisor(hart: &Hart, trap: Trap) -> bool {
    if hart.privilege == PrivilegeMode::Machine {
        return false;
    }
    let bit = trap.exception_code();
    if trap.is_interrupt() {
        hart.csrs.mideleg & (1 << bit) != 0
    } else {
        hart.csrs.medeleg & (1 << bit) != 0
    }
}

/// Computes the trap vector target: `base` for direct mode, `base + 4*cause` for
/// vectored mode and interrupts only (exceptions always use `base` even when
/// vectored).
fn trap_target(tvec: u64, cause: u64, is_interrupt: bool) -> u64 {
    let base = tvec & !0b11;
    let vectored = tvec & 0b1 == 1;
    if vectored && is_interrupt {
        base + 4 * (cause & !crate::common::constants::CAUSE_INTERRUPT_BIT)
    } else {
        base
    }
}

/// Executes `MRET`/`SRET`: restores the privilege mode and interrupt-enable state
/// saved by the matching trap entry, and redirects `pc` to the saved exception
/// program counter. Returns `IllegalInstruction` if the current privilege is below
/// the one the instruction returns from.
pub fn xret(hart: &mut Hart, from_machine: bool) -> Result<(), Trap> {
    hart.reservation = None;
    if from_machine {
        if hart.privilege != PrivilegeMode::Machine {
            return Err(Trap::IllegalInstruction(MRET));
        }
        let mpie = hart.csrs.mstatus & MSTATUS_MPIE != 0;
        hart.csrs.mstatus = (hart.csrs.mstatus & !MSTATUS_MIE) | (u64::from(mpie) << 3);
        hart.csrs.mstatus |= MSTATUS_MPIE;
        let mpp = (hart.csrs.mstatus & MSTATUS_MPP) >> MSTATUS_MPP_SHIFT;
        hart.privilege = PrivilegeMode::from_u8(mpp as u8);
        hart.csrs.mstatus = (hart.csrs.mstatus & !MSTATUS_MPP) | (u64::from(PrivilegeMode::User.to_u8()) << MSTATUS_MPP_SHIFT);
        if hart.privilege != PrivilegeMode::Machine {
            hart.csrs.mstatus &= !crate::core::arch::csr::MSTATUS_MPRV;
        }
        hart.pc = hart.csrs.mepc;
    } else {
        if (hart.privilege as u8) < PrivilegeMode::Supervisor.to_u8() {
            return Err(Trap::IllegalInstruction(SRET));
        }
        if hart.privilege == PrivilegeMode::Supervisor && hart.csrs.mstatus & MSTATUS_TSR != 0 {
            return Err(Trap::IllegalInstruction(SRET));
        }
        let spie = hart.csrs.mstatus & MSTATUS_SPIE != 0;
        hart.csrs.mstatus = (hart.csrs.mstatus & !MSTATUS_SIE) | (u64::from(spie) << 1);
        hart.csrs.mstatus |= MSTATUS_SPIE;
        let spp = (hart.csrs.mstatus & MSTATUS_SPP) >> 8;
        hart.privilege = PrivilegeMode::from_u8(spp as u8);
        hart.csrs.mstatus &= !MSTATUS_SPP;
        if hart.privilege != PrivilegeMode::Machine {
            hart.csrs.mstatus &= !crate::core::arch::csr::MSTATUS_MPRV;
        }
        hart.pc = hart.csrs.sepc;
    }
    Ok(())
}

/// Returns the highest-priority pending-and-enabled interrupt, or `None` if the hart
/// should keep executing. Global enables (`mstatus.MIE`/`SIE`) only gate interrupts
/// taken at their *own* privilege level or below; an interrupt delegated to S-mode
/// is still taken in M-mode regardless of `mstatus.MIE` (the M-mode global enable
/// only matters when the target level *is* M).
///
/// Priority order, highest first: MEI, MSI, MTI, SEI, SSI, STI (RISC-V privileged
/// spec order).
#[must_use]
pub fn pending_interrupt(hart: &Hart) -> Option<Trap> {
    let mip = hart.csrs.mip;
    let mie = hart.csrs.mie;
    let pending_enabled = mip & mie;
    if pending_enabled == 0 {
        return None;
    }

    let m_enabled = hart.privilege != PrivilegeMode::Machine || hart.csrs.mstatus & MSTATUS_MIE != 0;
    let s_enabled = hart.privilege == PrivilegeMode::User
        || (hart.privilege == PrivilegeMode::Supervisor && hart.csrs.mstatus & MSTATUS_SIE != 0);

    // M-level bits are never delegated away from M-mode; S-level bits go to S-mode
    // only when their `mideleg` bit is set, otherwise they default to M-mode.
    const M_ONLY: [u64; 3] = [MIP_MEIP, MIP_MSIP, MIP_MTIP];
    const DELEGABLE: [u64; 3] = [MIP_SEIP, MIP_SSIP, MIP_STIP];
    let priority = [MIP_MEIP, MIP_MSIP, MIP_MTIP, MIP_SEIP, MIP_SSIP, MIP_STIP];

    for bit in priority {
        if pending_enabled & bit == 0 {
            continue;
        }
        let delegated = DELEGABLE.contains(&bit) && hart.csrs.mideleg & bit != 0;
        if M_ONLY.contains(&bit) || !delegated {
            if m_enabled {
                return Some(bit_to_trap(bit, 3));
            }
        } else if s_enabled {
            return Some(bit_to_trap(bit, 1));
        }
    }
    None
}

fn bit_to_trap(bit: u64, mode: u8) -> Trap {
    match bit {
        MIP_MSIP | MIP_SSIP => Trap::SoftwareInterrupt(mode),
        MIP_MTIP | MIP_STIP => Trap::TimerInterrupt(mode),
        MIP_MEIP | MIP_SEIP => Trap::ExternalInterrupt(mode),
        _ => unreachable!("bit_to_trap called with a bit outside ORDER"),
    }
}

/// Wires CLINT and PLIC lines into `mip`: `timer_irq`/`software_irq` set/clear
/// `MTIP`/`MSIP` from the CLINT's per-hart `mtimecmp`/`msip`, `meip`/`seip` set/clear
/// the PLIC-sourced external pending bits, and `STIP` is set from this hart's own
/// `stimecmp` CSR (Sstc) against the shared `mtime`. `SSIP` is set only by CSR writes
/// (there is no supervisor-level CLINT register) and so is left alone.
pub fn sync_external_interrupts(hart: &mut Hart, mtime: u64, timer_irq: bool, software_irq: bool, meip: bool, seip: bool) {
    hart.csrs.mip = set_bit(hart.csrs.mip, MIP_MTIP, timer_irq);
    hart.csrs.mip = set_bit(hart.csrs.mip, MIP_MSIP, software_irq);
    hart.csrs.mip = set_bit(hart.csrs.mip, MIP_STIP, mtime >= hart.csrs.stimecmp);
    hart.csrs.mip = set_bit(hart.csrs.mip, MIP_MEIP, meip);
    hart.csrs.mip = set_bit(hart.csrs.mip, MIP_SEIP, seip);
    if pending_interrupt(hart).is_some() {
        hart.waiting_for_interrupt = false;
    }
}

fn set_bit(val: u64, bit: u64, set: bool) -> u64 {
    if set {
        val | bit
    } else {
        val & !bit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hart() -> Hart {
        Hart::new(0, 0x8000_0000, 32)
    }

    #[test]
    fn machine_timer_interrupt_taken_when_enabled() {
        let mut h = hart();
        h.csrs.mstatus |= MSTATUS_MIE;
        h.csrs.mie |= MIE_MTIE;
        h.csrs.mip |= MIP_MTIP;
        assert_eq!(pending_interrupt(&h), Some(Trap::TimerInterrupt(3)));
    }

    #[test]
    fn machine_interrupt_masked_when_mie_clear() {
        let mut h = hart();
        h.csrs.mie |= MIE_MTIE;
        h.csrs.mip |= MIP_MTIP;
        assert_eq!(pending_interrupt(&h), None);
    }

    #[test]
    fn delegated_supervisor_interrupt_taken_from_user_mode() {
        let mut h = hart();
        h.privilege = PrivilegeMode::User;
        h.csrs.mideleg |= MIP_STIP;
        h.csrs.mie |= MIE_STIE;
        h.csrs.mip |= MIP_STIP;
        assert_eq!(pending_interrupt(&h), Some(Trap::TimerInterrupt(1)));
    }

    #[test]
    fn mret_restores_privilege_and_pc() {
        let mut h = hart();
        h.csrs.mepc = 0x8000_1000;
        h.csrs.mstatus = (h.csrs.mstatus & !MSTATUS_MPP) | (u64::from(PrivilegeMode::Supervisor.to_u8()) << MSTATUS_MPP_SHIFT);
        h.csrs.mstatus |= MSTATUS_MPIE;
        xret(&mut h, true).unwrap();
        assert_eq!(h.pc, 0x8000_1000);
        assert_eq!(h.privilege, PrivilegeMode::Supervisor);
    }

    #[test]
    fn sret_from_user_mode_is_illegal() {
        let mut h = hart();
        h.privilege = PrivilegeMode::User;
        assert!(xret(&mut h, false).is_err());
    }

    #[test]
    fn sync_external_interrupts_sets_msip_independently_of_mtip() {
        let mut h = hart();
        sync_external_interrupts(&mut h, 0, false, true, false, false);
        assert_ne!(h.csrs.mip & MIP_MSIP, 0);
        assert_eq!(h.csrs.mip & MIP_MTIP, 0);
        assert_eq!(h.csrs.mip & MIP_MEIP, 0);
        assert_eq!(h.csrs.mip & MIP_SEIP, 0);
    }

    #[test]
    fn sync_external_interrupts_clears_lines_that_go_low() {
        let mut h = hart();
        sync_external_interrupts(&mut h, 0, true, true, true, true);
        assert_eq!(h.csrs.mip & (MIP_MTIP | MIP_MSIP | MIP_MEIP | MIP_SEIP), MIP_MTIP | MIP_MSIP | MIP_MEIP | MIP_SEIP);
        sync_external_interrupts(&mut h, 0, false, false, false, false);
        assert_eq!(h.csrs.mip & (MIP_MTIP | MIP_MSIP | MIP_MEIP | MIP_SEIP), 0);
    }

    #[test]
    fn sync_external_interrupts_wakes_a_waiting_hart() {
        let mut h = hart();
        h.waiting_for_interrupt = true;
        h.csrs.mstatus |= MSTATUS_MIE;
        h.csrs.mie |= crate::core::arch::csr::MIE_MSIE;
        sync_external_interrupts(&mut h, 0, false, true, false, false);
        assert!(!h.waiting_for_interrupt);
    }
}
