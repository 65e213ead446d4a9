//! Hardware backends for the [`crate::hal`] seams.
//!
//! `emu` is a deterministic software model of the PMU and the host counter
//! arbiter; it backs every test. `msr` is the real system-register backend
//! for AArch64 Windows hosts.

pub mod emu;

#[cfg(all(target_arch = "aarch64", target_os = "windows"))]
pub mod msr;
