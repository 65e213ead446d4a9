//! Seams between the engine and the machine it runs on.
//!
//! [`RegisterIo`] is the per-core PMU system-register surface; on hardware
//! it compiles down to `mrs`/`msr` pairs, in tests it is backed by the
//! software model in [`crate::driver::emu`]. [`HostApi`] is the host
//! kernel's side of the bargain: counter arbitration, thread-profiling
//! publication and the profile-interrupt hook.

use std::sync::Arc;

use crate::regs::{Evtype, Pmcr};
use crate::Result;

/// Raw identification registers captured once at init.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuId {
    pub dfr0: u64,
    pub midr: u64,
    pub aa64dfr0: u64,
    pub pmbidr: u64,
    pub pmsidr: u64,
}

/// PMU system-register access for the core the caller is running on.
///
/// Reads are side-effect-free with one documented exception:
/// [`RegisterIo::take_overflow_flags`] models the write-to-clear semantics
/// of PMOVSCLR as an atomic take-and-clear.
pub trait RegisterIo: Send + Sync {
    fn read_pmcr(&self) -> Pmcr;
    fn write_pmcr(&self, pmcr: Pmcr);

    /// PMCNTENSET: enable the counters named in `mask`.
    fn counter_enable_set(&self, mask: u32);
    /// PMCNTENCLR: disable the counters named in `mask`.
    fn counter_enable_clear(&self, mask: u32);

    /// Read PMOVSCLR and clear every flag that was set, returning them.
    fn take_overflow_flags(&self) -> u32;

    /// PMINTENSET: unmask overflow interrupts for the counters in `mask`.
    fn intr_enable_set(&self, mask: u32);
    /// PMINTENCLR: mask overflow interrupts for the counters in `mask`.
    fn intr_enable_clear(&self, mask: u32);

    /// Program the event type for `slot`. Slot 31 targets PMCCFILTR and
    /// ignores the event field.
    fn write_evtype(&self, slot: u8, evtype: Evtype);

    /// Read the counter in `slot`; slot 31 is the 64-bit cycle counter.
    fn read_counter(&self, slot: u8) -> u64;
    fn write_counter(&self, slot: u8, value: u64);

    fn read_id(&self) -> CpuId;

    /// Instruction synchronisation barrier.
    fn isb(&self);
}

/// Register state captured by the host when a PMI is delivered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub pc: u64,
    pub lr: u64,
}

/// Installed via [`HostApi::set_pmi_handler`]; runs at interrupt level on
/// the core whose counter overflowed.
pub trait PmiHandler: Send + Sync {
    fn handle(&self, core: usize, frame: &TrapFrame);
}

/// Opaque token for a hardware-counter reservation held with the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HostHandle(pub u64);

/// Host-kernel collaboration surface.
pub trait HostApi: Send + Sync {
    fn num_cores(&self) -> usize;

    /// Reserve the given physical counter slots with the host's arbiter.
    /// Fails with `InsufficientResources` when any slot is already held by
    /// another kernel client.
    fn allocate_counters(&self, slots: &[u8]) -> Result<HostHandle>;

    /// Release a reservation. Safe to call with a stale handle.
    fn free_counters(&self, handle: HostHandle);

    /// Publish the reserved slots to the host's per-thread counter API.
    /// Implementations tolerate the already-enabled case and report it as
    /// success.
    fn configure_thread_profiling(&self, slots: &[u8]) -> Result<()>;

    /// Install (`Some`) or uninstall (`None`) the profile-interrupt hook.
    fn set_pmi_handler(&self, handler: Option<Arc<dyn PmiHandler>>) -> Result<()>;
}
