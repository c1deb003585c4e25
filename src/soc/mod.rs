//! System-on-Chip (SoC) Components.
//!
//! This module organizes the components that make up the simulated system: the
//! MMIO bus, device implementations, and physical RAM. Assembly into a runnable
//! machine (device wiring, hart construction, the run loop) lives at
//! [`crate::machine::Machine`], which owns a [`interconnect::Bus`] built from these
//! pieces.

/// Memory-mapped I/O device implementations.
pub mod devices;

/// System bus interconnect and routing.
pub mod interconnect;

/// Physical RAM.
pub mod memory;

/// Device trait definitions for MMIO access.
pub mod traits;
