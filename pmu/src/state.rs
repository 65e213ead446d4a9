//! Per-core bookkeeping: the event program, multiplex accumulators and the
//! sample ring shared with the interrupt path.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::regs::FilterFlags;
use crate::SAMPLE_CHAIN_BUFFER_SIZE;

/// One event bound to a logical counter slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssignedEvent {
    pub id: u16,
    pub filter: FilterFlags,
}

/// The full per-core counter program computed at assignment time.
///
/// `groups` holds indices into `events`; when it has more than one entry the
/// groups are rotated in time by the multiplex timer. `counter_map` is the
/// permutation from logical slots onto the physical counters the host
/// granted us.
#[derive(Clone, Debug, Default)]
pub struct CoreProgram {
    pub cycle: Option<AssignedEvent>,
    pub events: Vec<AssignedEvent>,
    pub groups: Vec<Vec<usize>>,
    pub counter_map: Vec<u8>,
    pub long_counters: bool,
}

impl CoreProgram {
    pub fn multiplexed(&self) -> bool {
        self.groups.len() > 1
    }
}

/// A sampling source resolved onto a physical counter slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleSlot {
    pub slot: u8,
    pub event: u16,
    pub interval: u32,
    pub filter: FilterFlags,
}

/// State owned by one core's deferred context. Only that core's worker
/// mutates it; the broker reads results back over a reply channel.
pub struct CoreState {
    pub idx: usize,
    pub program: CoreProgram,
    /// 64-bit accumulated count per general event, carrying multiplex
    /// rounds and the 32-bit overflow extension.
    pub accum: Vec<u64>,
    pub cycle_accum: u64,
    /// How many multiplex rounds each group has been scheduled for.
    pub group_rounds: Vec<u64>,
    pub timer_round: u64,
    pub current_group: usize,
    pub counting: bool,
    pub sample_slots: Vec<SampleSlot>,
    pub shared: std::sync::Arc<SampleShared>,
}

impl CoreState {
    pub fn new(idx: usize, shared: std::sync::Arc<SampleShared>) -> Self {
        CoreState {
            idx,
            program: CoreProgram::default(),
            accum: Vec::new(),
            cycle_accum: 0,
            group_rounds: Vec::new(),
            timer_round: 0,
            current_group: 0,
            counting: false,
            sample_slots: Vec::new(),
            shared,
        }
    }
}

/// One captured sample. Produced in the ISR, drained by the broker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sample {
    pub pc: u64,
    pub lr: u64,
    pub ov_flags: u64,
}

/// Bounded sample storage. `idx` never exceeds the capacity.
pub struct SampleRing {
    pub samples: Vec<Sample>,
    pub idx: usize,
}

impl SampleRing {
    fn new() -> Self {
        SampleRing {
            samples: vec![Sample::default(); SAMPLE_CHAIN_BUFFER_SIZE],
            idx: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.idx == SAMPLE_CHAIN_BUFFER_SIZE
    }
}

/// The slice of per-core state the PMI handler is allowed to touch.
///
/// The ring is guarded by a spinlock taken with `try_lock` in the interrupt
/// path; everything else is atomic. The interval table and masks are only
/// written while the core is quiesced.
pub struct SampleShared {
    pub active: AtomicBool,
    /// Physical counters whose overflow should produce a sample.
    pub ov_mask: AtomicU32,
    /// Counters to stop and restart around a capture.
    pub enable_mask: AtomicU32,
    /// Counters whose overflow extends the 64-bit accumulator while
    /// counting without sampling.
    pub ovext_mask: AtomicU32,
    pub intervals: [AtomicU32; 32],
    pub ring: Mutex<SampleRing>,
    pub generated: AtomicU64,
    pub dropped: AtomicU64,
}

impl SampleShared {
    pub fn new() -> Self {
        SampleShared {
            active: AtomicBool::new(false),
            ov_mask: AtomicU32::new(0),
            enable_mask: AtomicU32::new(0),
            ovext_mask: AtomicU32::new(0),
            intervals: std::array::from_fn(|_| AtomicU32::new(0)),
            ring: Mutex::new(SampleRing::new()),
            generated: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Copy out everything captured so far and rewind the ring.
    pub fn drain(&self) -> Vec<Sample> {
        let mut ring = self.ring.lock();
        let taken = ring.samples[..ring.idx].to_vec();
        ring.idx = 0;
        taken
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.generated.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }
}

impl Default for SampleShared {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_capacity_is_bounded() {
        let shared = SampleShared::new();
        {
            let mut ring = shared.ring.lock();
            assert_eq!(ring.samples.len(), SAMPLE_CHAIN_BUFFER_SIZE);
            ring.idx = SAMPLE_CHAIN_BUFFER_SIZE;
            assert!(ring.is_full());
        }

        let drained = shared.drain();
        assert_eq!(drained.len(), SAMPLE_CHAIN_BUFFER_SIZE);
        assert_eq!(shared.ring.lock().idx, 0);
    }

    #[test]
    fn drain_returns_only_captured_entries() {
        let shared = SampleShared::new();
        {
            let mut ring = shared.ring.lock();
            ring.samples[0] = Sample {
                pc: 0x1000,
                lr: 0x2000,
                ov_flags: 1,
            };
            ring.idx = 1;
        }

        let drained = shared.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].pc, 0x1000);
        assert!(shared.drain().is_empty());
    }
}
