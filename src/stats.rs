//! Machine-run statistics.
//!
//! Aggregate counters accumulated by the [`crate::machine::Machine`] and its harts
//! for diagnostics — instructions retired, cycles elapsed, traps by cause, and PLIC
//! claims. Never consulted by architectural semantics; purely observational.

use std::collections::BTreeMap;
use std::time::Instant;

/// Run-level statistics structure.
#[derive(Clone)]
pub struct SimStats {
    start_time: Instant,
    /// Total machine ticks elapsed.
    pub cycles: u64,
    /// Instructions retired across all harts.
    pub instructions_retired: u64,
    /// Traps taken, keyed by `mcause`/`scause` exception or interrupt code
    /// (the interrupt bit, bit 63, is preserved in the key).
    pub traps_by_cause: BTreeMap<u64, u64>,
    /// Interrupts successfully claimed from the PLIC.
    pub plic_claims: u64,
}

impl Default for SimStats {
    fn default() -> Self {
        Self {
            start_time: Instant::now(),
            cycles: 0,
            instructions_retired: 0,
            traps_by_cause: BTreeMap::new(),
            plic_claims: 0,
        }
    }
}

impl SimStats {
    /// Records a trap of the given cause (with the interrupt bit already folded in).
    pub fn record_trap(&mut self, cause: u64) {
        *self.traps_by_cause.entry(cause).or_insert(0) += 1;
    }

    /// Prints a summary to stdout: wall time, cycles, instructions, IPC/MIPS, and a
    /// breakdown of traps taken by cause.
    pub fn print(&self) {
        let seconds = self.start_time.elapsed().as_secs_f64();
        let cyc = self.cycles.max(1) as f64;
        let instr = self.instructions_retired;
        let ipc = instr as f64 / cyc;
        let mips = if seconds > 0.0 {
            (instr as f64 / seconds) / 1_000_000.0
        } else {
            0.0
        };

        println!("==========================================================");
        println!("MACHINE RUN STATISTICS");
        println!("==========================================================");
        println!("host_seconds             {seconds:.4} s");
        println!("cycles                   {}", self.cycles);
        println!("instructions_retired     {instr}");
        println!("ipc                      {ipc:.4}");
        println!("mips                     {mips:.2}");
        println!("plic_claims              {}", self.plic_claims);
        if !self.traps_by_cause.is_empty() {
            println!("----------------------------------------------------------");
            println!("TRAPS BY CAUSE");
            for (cause, count) in &self.traps_by_cause {
                let is_interrupt = cause & (1 << 63) != 0;
                let code = cause & !(1 << 63);
                let kind = if is_interrupt { "interrupt" } else { "exception" };
                println!("  {kind:<10} cause={code:<3} count={count}");
            }
        }
        println!("==========================================================");
    }
}
