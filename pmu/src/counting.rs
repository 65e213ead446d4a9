//! Timed counting on one core: reset/start/stop, accumulation across
//! multiplex rounds and the 32-bit overflow extension.
//!
//! Everything here runs in the core's deferred context, so the state is
//! mutated without further locking.

use std::sync::atomic::Ordering;

use pmu_protocol::CounterValue;

use crate::hal::RegisterIo;
use crate::regs::GP_COUNTER_MASK;
use crate::sched;
use crate::state::{CoreProgram, CoreState};
use crate::CYCLE_COUNTER_IDX;

/// Install a new program on this core. Counters are left disabled; the
/// event-type registers for the first group are written so a following
/// start only has to enable.
pub fn assign(state: &mut CoreState, regio: &dyn RegisterIo, program: CoreProgram) {
    stop(state, regio);

    state.accum = vec![0; program.events.len()];
    state.cycle_accum = 0;
    state.group_rounds = vec![0; program.groups.len()];
    state.timer_round = 0;
    state.current_group = 0;
    state.program = program;

    let mut pmcr = regio.read_pmcr();
    pmcr.set_long_events(state.program.long_counters);
    regio.write_pmcr(pmcr);
    regio.isb();

    sched::program_group(state, regio);
}

/// Zero the accumulators, the hardware counters, the overflow flags and the
/// multiplex round, returning to the first group.
pub fn reset(state: &mut CoreState, regio: &dyn RegisterIo) {
    let mut pmcr = regio.read_pmcr();
    pmcr.set_event_counter_reset();
    pmcr.set_cycle_counter_reset();
    regio.write_pmcr(pmcr);
    regio.isb();
    let _ = regio.take_overflow_flags();

    for a in &mut state.accum {
        *a = 0;
    }
    state.cycle_accum = 0;
    for r in &mut state.group_rounds {
        *r = 0;
    }
    state.timer_round = 0;
    state.current_group = 0;

    sched::program_group(state, regio);
}

pub fn start(state: &mut CoreState, regio: &dyn RegisterIo) {
    if state.counting {
        return;
    }

    let mask = sched::enable_mask(state);

    // 32-bit counters still overflow while counting; route those interrupts
    // to the extension work-item unless the CPU gives us 64-bit counters.
    if !state.program.long_counters && mask & GP_COUNTER_MASK != 0 {
        let ext = mask & GP_COUNTER_MASK;
        state.shared.ovext_mask.store(ext, Ordering::Relaxed);
        regio.intr_enable_set(ext);
    }

    let mut pmcr = regio.read_pmcr();
    pmcr.set_enable(true);
    regio.write_pmcr(pmcr);
    regio.isb();
    regio.counter_enable_set(mask);
    regio.isb();

    state.counting = true;
    if let Some(r) = state.group_rounds.get_mut(state.current_group) {
        *r += 1;
    }
    state.timer_round += 1;
}

/// Disable the configured counters and fold the scheduled group into the
/// accumulators. A stop while already stopped is a no-op.
pub fn stop(state: &mut CoreState, regio: &dyn RegisterIo) {
    if !state.counting {
        return;
    }

    let mask = sched::enable_mask(state);
    regio.counter_enable_clear(mask);
    regio.isb();
    regio.intr_enable_clear(mask & GP_COUNTER_MASK);
    state.shared.ovext_mask.store(0, Ordering::Relaxed);

    drain_scheduled(state, regio);
    state.counting = false;
}

/// One multiplex tick: fold the outgoing group into the accumulators,
/// rotate to the next group, reprogram and restart. The cycle counter sits
/// alone in its dedicated slot and keeps running across rotations.
pub fn multiplex_tick(state: &mut CoreState, regio: &dyn RegisterIo) {
    if !state.counting || !state.program.multiplexed() {
        return;
    }

    let outgoing = sched::enable_mask(state) & GP_COUNTER_MASK;
    regio.counter_enable_clear(outgoing);
    regio.isb();

    for (ev, slot) in sched::scheduled_slots(state) {
        state.accum[ev] = state.accum[ev].wrapping_add(regio.read_counter(slot));
        regio.write_counter(slot, 0);
    }

    state.current_group = (state.current_group + 1) % state.program.groups.len();
    sched::program_group(state, regio);

    for (_, slot) in sched::scheduled_slots(state) {
        regio.write_counter(slot, 0);
    }

    if let Some(r) = state.group_rounds.get_mut(state.current_group) {
        *r += 1;
    }
    state.timer_round += 1;

    let incoming = sched::enable_mask(state) & GP_COUNTER_MASK;
    if !state.program.long_counters {
        state.shared.ovext_mask.store(incoming, Ordering::Relaxed);
    }
    regio.counter_enable_set(incoming);
    regio.isb();
}

/// A 32-bit counter wrapped while counting: extend the 64-bit accumulator.
pub fn overflow_extend(state: &mut CoreState, flags: u32) {
    for (ev, slot) in sched::scheduled_slots(state) {
        if flags & (1 << slot) != 0 {
            state.accum[ev] = state.accum[ev].wrapping_add(1 << 32);
        }
    }
}

/// Per-slot 64-bit totals plus the scheduling ratio consumers scale by.
pub fn read(state: &CoreState, regio: &dyn RegisterIo) -> Vec<CounterValue> {
    let total = state.timer_round.max(1);
    let scheduled_now = sched::scheduled_slots(state);
    let mut out = Vec::with_capacity(state.program.events.len() + 1);

    if state.program.cycle.is_some() {
        let live = if state.counting {
            regio.read_counter(CYCLE_COUNTER_IDX)
        } else {
            0
        };
        out.push(CounterValue {
            event_id: pmu_data::CYCLE_EVENT_IDX,
            value: state.cycle_accum.wrapping_add(live),
            scheduled_ticks: total,
            total_ticks: total,
        });
    }

    for (ev, evt) in state.program.events.iter().enumerate() {
        let live = scheduled_now
            .iter()
            .find(|(idx, _)| *idx == ev)
            .map(|&(_, slot)| if state.counting { regio.read_counter(slot) } else { 0 })
            .unwrap_or(0);
        out.push(CounterValue {
            event_id: evt.id,
            value: state.accum[ev].wrapping_add(live),
            scheduled_ticks: state.group_rounds[sched::group_of(state, ev)],
            total_ticks: total,
        });
    }

    out
}

fn drain_scheduled(state: &mut CoreState, regio: &dyn RegisterIo) {
    for (ev, slot) in sched::scheduled_slots(state) {
        state.accum[ev] = state.accum[ev].wrapping_add(regio.read_counter(slot));
        regio.write_counter(slot, 0);
    }
    if state.program.cycle.is_some() {
        state.cycle_accum = state
            .cycle_accum
            .wrapping_add(regio.read_counter(CYCLE_COUNTER_IDX));
        regio.write_counter(CYCLE_COUNTER_IDX, 0);
    }
}
