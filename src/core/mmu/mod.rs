//! Memory Management Unit (MMU).
//!
//! Responsible for virtual-to-physical address translation. Implements RISC-V SV39
//! paging with separate instruction/data TLBs, a page table walker, and Physical
//! Memory Protection (PMP), which is checked on every access regardless of whether
//! paging is enabled.

/// Physical Memory Protection (PMP).
pub mod pmp;
/// Page table walker implementation for SV39 virtual memory.
pub mod ptw;
/// Translation Lookaside Buffer (TLB) for caching virtual-to-physical address translations.
pub mod tlb;

use crate::common::{AccessType, PhysAddr, TranslationResult, Trap, VirtAddr};
use crate::core::arch::csr::{CsrFile, SATP_MODE_BARE, SATP_MODE_MASK, SATP_MODE_SHIFT, SATP_MODE_SV39};
use crate::core::arch::mode::PrivilegeMode;
use crate::soc::interconnect::Bus;

use self::tlb::Tlb;

/// Memory Management Unit: SV39 paging plus PMP, shared by both instruction fetch
/// and load/store paths.
pub struct Mmu {
    /// Data TLB for load/store address translation.
    pub dtlb: Tlb,
    /// Instruction TLB for fetch address translation.
    pub itlb: Tlb,
}

impl Mmu {
    /// Creates a new MMU with the given per-TLB entry count.
    #[must_use]
    pub fn new(tlb_size: usize) -> Self {
        Self {
            dtlb: Tlb::new(tlb_size),
            itlb: Tlb::new(tlb_size),
        }
    }

    /// Flushes both TLBs entirely (`SFENCE.VMA` with no operands, or any `satp` write
    /// that changes the root page table).
    pub fn flush_all(&mut self) {
        self.dtlb.flush();
        self.itlb.flush();
    }

    /// Translates a virtual address to a physical address, checking SV39 paging (if
    /// enabled) and PMP (always). Machine mode with paging off still goes through PMP.
    pub fn translate(
        &mut self,
        vaddr: VirtAddr,
        access: AccessType,
        effective_privilege: PrivilegeMode,
        csrs: &CsrFile,
        bus: &mut Bus,
    ) -> TranslationResult {
        let satp = csrs.satp;
        let mode = (satp >> SATP_MODE_SHIFT) & SATP_MODE_MASK;
        let paging_enabled = effective_privilege != PrivilegeMode::Machine && mode == SATP_MODE_SV39;

        let paddr = if !paging_enabled {
            if effective_privilege != PrivilegeMode::Machine && mode != SATP_MODE_BARE {
                return TranslationResult::Fault(page_fault(vaddr.val(), access));
            }
            vaddr.val()
        } else {
            let va = vaddr.val();
            let bit_38 = (va >> 38) & 1;
            let top_bits = va >> 39;
            let expected_top = if bit_38 == 1 { 0x1FF_FFFF } else { 0 };
            if top_bits != expected_top {
                return TranslationResult::Fault(page_fault(va, access));
            }

            let vpn = va >> crate::common::constants::PAGE_SHIFT;
            let asid = ((satp >> 44) & 0xFFFF) as u16;
            let hit = if access == AccessType::Fetch {
                self.itlb.lookup(vpn, asid)
            } else {
                self.dtlb.lookup(vpn, asid)
            };

            if let Some(hit) = hit {
                if access == AccessType::Write && !hit.w {
                    return TranslationResult::Fault(Trap::StorePageFault(va));
                }
                if access == AccessType::Fetch && !hit.x {
                    return TranslationResult::Fault(Trap::InstructionPageFault(va));
                }
                if access == AccessType::Read {
                    let mxr = csrs.mstatus & crate::core::arch::csr::MSTATUS_MXR != 0;
                    if !(hit.r || (hit.x && mxr)) {
                        return TranslationResult::Fault(Trap::LoadPageFault(va));
                    }
                }
                if effective_privilege == PrivilegeMode::User && !hit.u {
                    return TranslationResult::Fault(page_fault(va, access));
                }
                if effective_privilege == PrivilegeMode::Supervisor && hit.u {
                    let sum = csrs.mstatus & crate::core::arch::csr::MSTATUS_SUM != 0;
                    if !sum || access == AccessType::Fetch {
                        return TranslationResult::Fault(page_fault(va, access));
                    }
                }
                (hit.ppn << crate::common::constants::PAGE_SHIFT) | vaddr.page_offset()
            } else {
                match ptw::page_table_walk(self, vaddr, access, effective_privilege, csrs, bus) {
                    TranslationResult::Ok(p) => p.val(),
                    fault => return fault,
                }
            }
        };

        // PMP applies to every access, in every mode (M-mode included), after translation.
        let size = match access {
            AccessType::Fetch => 4,
            _ => 8, // conservative upper bound; callers re-check exact width faults separately
        };
        match pmp::check(
            &csrs.pmpcfg,
            &csrs.pmpaddr,
            paddr,
            size,
            access == AccessType::Read,
            access == AccessType::Write,
            access == AccessType::Fetch,
            effective_privilege == PrivilegeMode::Machine,
        ) {
            pmp::PmpResult::Allow => TranslationResult::Ok(PhysAddr::new(paddr)),
            pmp::PmpResult::Deny => TranslationResult::Fault(match access {
                AccessType::Fetch => Trap::InstructionAccessFault(vaddr.val()),
                AccessType::Read => Trap::LoadAccessFault(vaddr.val()),
                AccessType::Write => Trap::StoreAccessFault(vaddr.val()),
            }),
        }
    }
}

/// Constructs the page-fault trap variant for the given access type.
fn page_fault(addr: u64, access: AccessType) -> Trap {
    match access {
        AccessType::Fetch => Trap::InstructionPageFault(addr),
        AccessType::Read => Trap::LoadPageFault(addr),
        AccessType::Write => Trap::StorePageFault(addr),
    }
}
