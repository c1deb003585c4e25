//! Translation Lookaside Buffer (TLB).
//!
//! A fully associative software cache for page table entries, storing the mapping
//! between Virtual Page Numbers (VPN) and Physical Page Numbers (PPN) along with
//! permission bits (R/W/X/U) and the superpage level and address-space ID a leaf
//! was resolved at. `level` lets a single cached entry answer lookups for any
//! virtual address within its (possibly 2MB or 1GB) superpage; `asid` prevents a
//! stale translation belonging to one address space from being served to another.

/// A single entry in the TLB.
#[derive(Clone, Copy, Default)]
struct TlbEntry {
    /// Virtual Page Number tag, already masked to the entry's superpage level.
    vpn: u64,
    /// Physical Page Number for the mapped page (4KB granule).
    ppn: u64,
    /// Entry validity flag.
    valid: bool,
    /// Superpage level the leaf PTE was found at (0 = 4KB, 1 = 2MB, 2 = 1GB).
    level: u8,
    /// Address-space ID (`satp.ASID`) this translation belongs to.
    asid: u16,
    /// Read permission.
    r: bool,
    /// Write permission.
    w: bool,
    /// Execute permission.
    x: bool,
    /// User mode accessible.
    u: bool,
}

/// A resolved TLB hit: physical page number and the permission/level metadata needed
/// to finish composing the physical address and checking access rights.
#[derive(Clone, Copy, Debug)]
pub struct TlbHit {
    /// Physical page number of the mapped (4KB-granule) page.
    pub ppn: u64,
    /// Read permission.
    pub r: bool,
    /// Write permission.
    pub w: bool,
    /// Execute permission.
    pub x: bool,
    /// User-mode accessible.
    pub u: bool,
}

/// Translation Lookaside Buffer.
pub struct Tlb {
    entries: Vec<TlbEntry>,
    mask: usize,
}

/// Bits per SV39 page-table level.
const VPN_BITS_PER_LEVEL: u32 = 9;
/// Page offset width.
const PAGE_SHIFT: u32 = 12;

impl Tlb {
    /// Creates a new TLB with the given number of entries (rounded up to a power of two).
    #[must_use]
    pub fn new(size: usize) -> Self {
        let safe_size = size.next_power_of_two().max(1);
        Self {
            entries: vec![TlbEntry::default(); safe_size],
            mask: safe_size - 1,
        }
    }

    /// Index used to place/find a translation for `vpn`, independent of level, so a
    /// superpage entry and a 4KB entry covering the same address can collide (and the
    /// more recent insert wins, same as real hardware set-associative eviction).
    fn index(&self, vpn: u64) -> usize {
        (vpn as usize) & self.mask
    }

    /// Looks up a full virtual page number, matching superpage entries by their
    /// level-truncated tag and the current ASID.
    #[must_use]
    pub fn lookup(&self, vpn: u64, asid: u16) -> Option<TlbHit> {
        let idx = self.index(vpn);
        let entry = self.entries[idx];
        if !entry.valid || entry.asid != asid {
            return None;
        }
        let level_shift = u64::from(entry.level) * u64::from(VPN_BITS_PER_LEVEL);
        let tag_mask = !0u64 << level_shift;
        if (vpn & tag_mask) != (entry.vpn & tag_mask) {
            return None;
        }
        Some(TlbHit {
            ppn: entry.ppn,
            r: entry.r,
            w: entry.w,
            x: entry.x,
            u: entry.u,
        })
    }

    /// Inserts a mapping. `level` is the SV39 page-table level the leaf PTE was found
    /// at (0 = 4KB page, 1 = 2MB megapage, 2 = 1GB gigapage); `ppn` is the full,
    /// already-composed 4KB-granule physical page number (superpage low bits included).
    pub fn insert(&mut self, vpn: u64, ppn: u64, pte: u64, level: u8, asid: u16) {
        let r = (pte >> 1) & 1 != 0;
        let w = (pte >> 2) & 1 != 0;
        let x = (pte >> 3) & 1 != 0;
        let u = (pte >> 4) & 1 != 0;
        let idx = self.index(vpn);
        self.entries[idx] = TlbEntry {
            vpn,
            ppn,
            valid: true,
            level,
            asid,
            r,
            w,
            x,
            u,
        };
    }

    /// Invalidates all entries. Called on `SFENCE.VMA` with no operands.
    pub fn flush(&mut self) {
        for e in &mut self.entries {
            e.valid = false;
        }
    }

    /// Invalidates entries matching the given ASID. Called on `SFENCE.VMA rs1=x0, rs2`.
    pub fn flush_asid(&mut self, asid: u16) {
        for e in &mut self.entries {
            if e.asid == asid {
                e.valid = false;
            }
        }
    }

    /// Invalidates the entry covering `vaddr`, if any. Called on `SFENCE.VMA rs1, x0`.
    pub fn flush_addr(&mut self, vaddr: u64) {
        let vpn = vaddr >> PAGE_SHIFT;
        let idx = self.index(vpn);
        if self.entries[idx].valid {
            let level_shift = u64::from(self.entries[idx].level) * u64::from(VPN_BITS_PER_LEVEL);
            let tag_mask = !0u64 << level_shift;
            if (vpn & tag_mask) == (self.entries[idx].vpn & tag_mask) {
                self.entries[idx].valid = false;
            }
        }
    }
}
