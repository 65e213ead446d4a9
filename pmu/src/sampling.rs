//! Overflow-driven sampling: interval programming, the PMI interrupt path
//! and drop accounting.
//!
//! The ISR runs at interrupt level on the overflowing core. It touches only
//! the [`SampleShared`] block: atomic counters, and the ring under a
//! spinlock taken with `try_lock`. A contended or full ring drops the
//! sample; it never blocks.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;

use crate::exec::{CoreOp, DpcSender};
use crate::hal::{PmiHandler, RegisterIo, TrapFrame};
use crate::regs::{counter_bit, Evtype};
use crate::state::{CoreState, Sample, SampleShared, SampleSlot};
use crate::CYCLE_COUNTER_IDX;

/// Reload value that makes a 32-bit counter overflow after `interval` more
/// events. The cycle counter takes the same value in its low word; the
/// overflow fires when the low 32 bits wrap.
fn reload_value(interval: u32) -> u64 {
    (0xFFFF_FFFFu32 - interval) as u64
}

/// Publish the sampling sources to this core. Event types and intervals are
/// written while the machine is quiesced; nothing is enabled yet.
pub fn program(state: &mut CoreState, regio: &dyn RegisterIo, slots: Vec<SampleSlot>) {
    let mut ov_mask = 0u32;
    for s in &slots {
        ov_mask |= counter_bit(s.slot);
        state.shared.intervals[s.slot as usize].store(s.interval, Ordering::Relaxed);
        if s.slot == CYCLE_COUNTER_IDX {
            regio.write_evtype(s.slot, Evtype::new(0, s.filter));
        } else {
            regio.write_evtype(s.slot, Evtype::new(s.event, s.filter));
        }
    }
    regio.isb();

    state.shared.ov_mask.store(ov_mask, Ordering::Relaxed);
    state.shared.enable_mask.store(ov_mask, Ordering::Relaxed);
    state.sample_slots = slots;
}

/// Arm the programmed sources and open the ring.
pub fn start(state: &mut CoreState, regio: &dyn RegisterIo) {
    if state.sample_slots.is_empty() {
        return;
    }

    state.shared.ring.lock().idx = 0;
    state.shared.generated.store(0, Ordering::Relaxed);
    state.shared.dropped.store(0, Ordering::Relaxed);
    let _ = regio.take_overflow_flags();

    for s in &state.sample_slots {
        regio.write_counter(s.slot, reload_value(s.interval));
    }

    let mask = state.shared.enable_mask.load(Ordering::Relaxed);
    regio.intr_enable_set(mask);

    let mut pmcr = regio.read_pmcr();
    pmcr.set_enable(true);
    regio.write_pmcr(pmcr);
    regio.isb();

    regio.counter_enable_set(mask);
    regio.isb();

    // the ISR only captures once this is visible
    state.shared.active.store(true, Ordering::Release);
}

pub fn stop(state: &mut CoreState, regio: &dyn RegisterIo) {
    state.shared.active.store(false, Ordering::Release);

    let mask = state.shared.enable_mask.load(Ordering::Relaxed);
    regio.counter_enable_clear(mask);
    regio.intr_enable_clear(mask);
    regio.isb();
}

/// The installed performance-monitor interrupt handler.
///
/// Shared by every core; `core` selects the per-core block. Work that may
/// not run at interrupt level (the counting-mode overflow extension) is
/// queued to the core's deferred context instead.
pub struct PmuIsr {
    regio: Arc<dyn RegisterIo>,
    cores: Vec<IsrCore>,
}

struct IsrCore {
    shared: Arc<SampleShared>,
    dpc: DpcSender,
}

impl PmuIsr {
    pub fn new(
        regio: Arc<dyn RegisterIo>,
        shared: &[Arc<SampleShared>],
        dpcs: Vec<DpcSender>,
    ) -> Arc<Self> {
        debug_assert_eq!(shared.len(), dpcs.len());
        let cores = shared
            .iter()
            .cloned()
            .zip(dpcs)
            .map(|(shared, dpc)| IsrCore { shared, dpc })
            .collect();
        Arc::new(PmuIsr { regio, cores })
    }
}

impl PmiHandler for PmuIsr {
    fn handle(&self, core: usize, frame: &TrapFrame) {
        // take-and-clear; flags for counters we do not own vanish here,
        // exactly as the write-to-clear hardware register behaves
        let flags = self.regio.take_overflow_flags();

        let Some(c) = self.cores.get(core) else {
            return;
        };

        if !c.shared.active.load(Ordering::Acquire) {
            let ext = flags & c.shared.ovext_mask.load(Ordering::Relaxed);
            if ext != 0 {
                c.dpc.queue(CoreOp::OverflowExtend { flags: ext });
            }
            return;
        }

        let ov = flags & c.shared.ov_mask.load(Ordering::Relaxed);
        if ov == 0 {
            // spurious for us
            return;
        }

        c.shared.generated.fetch_add(1, Ordering::Relaxed);

        let Some(mut ring) = c.shared.ring.try_lock() else {
            c.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if ring.is_full() {
            drop(ring);
            c.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mask = c.shared.enable_mask.load(Ordering::Relaxed);
        self.regio.counter_enable_clear(mask);

        let idx = ring.idx;
        ring.samples[idx] = Sample {
            pc: frame.pc,
            lr: frame.lr,
            ov_flags: ov as u64,
        };
        ring.idx = idx + 1;

        // slot indexes here are raw physical indexes, no mapping needed
        for slot in 0..32u8 {
            if ov & counter_bit(slot) == 0 {
                continue;
            }
            let interval = c.shared.intervals[slot as usize].load(Ordering::Relaxed);
            self.regio.write_counter(slot, reload_value(interval));
        }

        drop(ring);
        self.regio.counter_enable_set(mask);
    }
}

/// Log a one-line summary of a sampling session; called on stop.
pub fn log_session(core: usize, shared: &SampleShared) {
    let (generated, dropped) = shared.stats();
    debug!(
        "core {}: sampling stopped, {} interrupts, {} dropped",
        core, generated, dropped
    );
}
