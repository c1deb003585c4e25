//! Hardware Page Table Walker (PTW) for RISC-V SV39.
//!
//! Traverses the three-level page table structure defined by the SV39 virtual memory
//! scheme to translate virtual addresses to physical addresses. Unlike some simulators,
//! this walker does **not** silently set the accessed/dirty bits on the guest's behalf:
//! a PTE with `A=0`, or a store/AMO to a PTE with `D=0`, is a page fault that must be
//! handled (and the bits set) by the supervisor, per the RISC-V privileged spec §4.3.2.

use crate::common::{AccessType, PAGE_SHIFT, PhysAddr, TranslationResult, Trap, VirtAddr};
use crate::core::arch::csr::{CsrFile, SATP_PPN_MASK};
use crate::core::arch::mode::PrivilegeMode;
use crate::core::mmu::Mmu;
use crate::soc::interconnect::Bus;

const PTE_VALID_BIT: u64 = 1;
const PTE_READ_BIT: u64 = 1 << 1;
const PTE_WRITE_BIT: u64 = 1 << 2;
const PTE_EXEC_BIT: u64 = 1 << 3;
const PTE_USER_BIT: u64 = 1 << 4;
const PTE_ACCESSED_BIT: u64 = 1 << 6;
const PTE_DIRTY_BIT: u64 = 1 << 7;
const PTE_PPN_SHIFT: u64 = 10;

const SV39_LEVELS: u64 = 3;
const VPN_BITS_PER_LEVEL: u64 = 9;
const VPN_ENTRY_MASK: u64 = 0x1FF;
const PTE_SIZE: u64 = 8;

/// Extracts the address-space ID from `satp` (bits 59:44).
fn asid_of(satp: u64) -> u16 {
    ((satp >> 44) & 0xFFFF) as u16
}

/// Performs a hardware page table walk for SV39, inserting the resolved leaf into the
/// appropriate TLB on success.
pub fn page_table_walk(
    mmu: &mut Mmu,
    vaddr: VirtAddr,
    access: AccessType,
    privilege: PrivilegeMode,
    csrs: &CsrFile,
    bus: &mut Bus,
) -> TranslationResult {
    let mut ppn = csrs.satp & SATP_PPN_MASK;

    for level in (0..SV39_LEVELS).rev() {
        let vpn_shift = PAGE_SHIFT + level * VPN_BITS_PER_LEVEL;
        let vpn_i = (vaddr.val() >> vpn_shift) & VPN_ENTRY_MASK;
        let pte_addr = (ppn << PAGE_SHIFT) + (vpn_i * PTE_SIZE);

        if !bus.is_valid_address(pte_addr) {
            return TranslationResult::Fault(page_fault(vaddr.val(), access));
        }
        let pte = bus.read_u64(pte_addr);

        if pte & PTE_VALID_BIT == 0 || (pte & (PTE_READ_BIT | PTE_WRITE_BIT) == PTE_WRITE_BIT) {
            return TranslationResult::Fault(page_fault(vaddr.val(), access));
        }

        let is_pointer = pte & (PTE_READ_BIT | PTE_WRITE_BIT | PTE_EXEC_BIT) == 0;
        if is_pointer {
            if level == 0 {
                return TranslationResult::Fault(page_fault(vaddr.val(), access));
            }
            ppn = (pte >> PTE_PPN_SHIFT) & SATP_PPN_MASK;
            continue;
        }

        // Misaligned superpage: low-level PPN bits must be zero.
        let leaf_ppn = (pte >> PTE_PPN_SHIFT) & SATP_PPN_MASK;
        if level > 0 {
            let low_bits_mask = (1u64 << (level * VPN_BITS_PER_LEVEL)) - 1;
            if leaf_ppn & low_bits_mask != 0 {
                return TranslationResult::Fault(page_fault(vaddr.val(), access));
            }
        }

        if let Err(trap) = check_permissions(pte, access, privilege, csrs, vaddr.val()) {
            return TranslationResult::Fault(trap);
        }

        if pte & PTE_ACCESSED_BIT == 0 || (access == AccessType::Write && pte & PTE_DIRTY_BIT == 0) {
            return TranslationResult::Fault(page_fault(vaddr.val(), access));
        }

        // Compose the full 4KB-granule PPN: high bits from the leaf, low (superpage)
        // bits passed straight through from the virtual address.
        let va_low_mask = (1u64 << (level * VPN_BITS_PER_LEVEL + PAGE_SHIFT)) - 1;
        let final_paddr = (leaf_ppn << PAGE_SHIFT) | (vaddr.val() & va_low_mask);
        let final_ppn_4k = final_paddr >> PAGE_SHIFT;

        let vpn_full = vaddr.val() >> PAGE_SHIFT;
        let asid = asid_of(csrs.satp);
        if access == AccessType::Fetch {
            mmu.itlb.insert(vpn_full, final_ppn_4k, pte, level as u8, asid);
        } else {
            mmu.dtlb.insert(vpn_full, final_ppn_4k, pte, level as u8, asid);
        }

        return TranslationResult::Ok(PhysAddr::new(final_paddr));
    }

    TranslationResult::Fault(page_fault(vaddr.val(), access))
}

/// Validates access permissions for a leaf PTE (R/W/X, `U`, `MXR`, `SUM`).
fn check_permissions(
    pte: u64,
    access: AccessType,
    privilege: PrivilegeMode,
    csrs: &CsrFile,
    vaddr: u64,
) -> Result<(), Trap> {
    let can_read = pte & PTE_READ_BIT != 0;
    let can_write = pte & PTE_WRITE_BIT != 0;
    let can_exec = pte & PTE_EXEC_BIT != 0;
    let is_user = pte & PTE_USER_BIT != 0;

    if access == AccessType::Write && !can_write {
        return Err(page_fault(vaddr, access));
    }
    if access == AccessType::Fetch && !can_exec {
        return Err(page_fault(vaddr, access));
    }

    let mxr = csrs.mstatus & crate::core::arch::csr::MSTATUS_MXR != 0;
    if access == AccessType::Read && !(can_read || (can_exec && mxr)) {
        return Err(page_fault(vaddr, access));
    }

    if privilege == PrivilegeMode::User && !is_user {
        return Err(page_fault(vaddr, access));
    }
    if privilege == PrivilegeMode::Supervisor && is_user {
        let sum = csrs.mstatus & crate::core::arch::csr::MSTATUS_SUM != 0;
        if !sum || access == AccessType::Fetch {
            return Err(page_fault(vaddr, access));
        }
    }

    Ok(())
}

/// Constructs the trap for a failed page access.
fn page_fault(addr: u64, access: AccessType) -> Trap {
    match access {
        AccessType::Fetch => Trap::InstructionPageFault(addr),
        AccessType::Read => Trap::LoadPageFault(addr),
        AccessType::Write => Trap::StorePageFault(addr),
    }
}
