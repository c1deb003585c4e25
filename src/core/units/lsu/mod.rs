//! Load/Store Unit (LSU).
//!
//! Provides the atomic-operation ALU for the RISC-V A extension and alignment
//! checking for loads/stores. This core never splits a misaligned access into
//! multiple bus transactions: RV64GC loads/stores and AMOs must be naturally
//! aligned and trap otherwise.

/// Atomic memory operation ALU (RISC-V A extension).
pub mod atomic;
/// Alignment checking utilities and misaligned-access traps.
pub mod unaligned;

pub use atomic::{AtomicOp, MemWidth, atomic_alu};
