//! Event-to-counter assignment and time-multiplex grouping.
//!
//! Given the events a client asked for and the physical counters the host
//! granted, this module decides which event occupies which slot. When the
//! request exceeds the free counters, the general events are partitioned in
//! input order into groups that the multiplex timer rotates through.

use smallvec::SmallVec;

use crate::hal::RegisterIo;
use crate::regs::{counter_bit, Evtype, CYCLE_COUNTER_BIT};
use crate::state::{AssignedEvent, CoreProgram, CoreState};
use crate::{Error, Result, CYCLE_COUNTER_IDX};

/// Build the per-core program for `events`.
///
/// The cycle event is split off and pinned to the dedicated counter; the
/// remaining events keep their input order, chunked into groups no larger
/// than the number of granted counters. The last group may simply be
/// smaller.
pub fn build_program(
    events: &[AssignedEvent],
    counter_map: &[u8],
    long_counters: bool,
) -> Result<CoreProgram> {
    let mut cycle = None;
    let mut general = Vec::new();

    for evt in events {
        if evt.id == pmu_data::CYCLE_EVENT_IDX {
            if cycle.is_some() {
                return Err(Error::InvalidParameter("cycle event assigned twice"));
            }
            cycle = Some(*evt);
        } else {
            general.push(*evt);
        }
    }

    if !general.is_empty() && counter_map.is_empty() {
        return Err(Error::InsufficientResources);
    }

    let groups = if general.is_empty() {
        vec![Vec::new()]
    } else {
        (0..general.len())
            .collect::<Vec<_>>()
            .chunks(counter_map.len())
            .map(|c| c.to_vec())
            .collect()
    };

    Ok(CoreProgram {
        cycle,
        events: general,
        groups,
        counter_map: counter_map.to_vec(),
        long_counters,
    })
}

/// `(event index, physical slot)` pairs of the group scheduled right now.
pub fn scheduled_slots(state: &CoreState) -> SmallVec<[(usize, u8); 8]> {
    let program = &state.program;
    match program.groups.get(state.current_group) {
        Some(group) => group
            .iter()
            .enumerate()
            .map(|(pos, &ev)| (ev, program.counter_map[pos]))
            .collect(),
        None => SmallVec::new(),
    }
}

/// Enable-register bitmap of the scheduled group, including the cycle
/// counter when one is assigned.
pub fn enable_mask(state: &CoreState) -> u32 {
    let mut mask = 0;
    for (_, slot) in scheduled_slots(state) {
        mask |= counter_bit(slot);
    }
    if state.program.cycle.is_some() {
        mask |= CYCLE_COUNTER_BIT;
    }
    mask
}

/// Write the event-type registers for the scheduled group and the cycle
/// filter. Filters land before any counter is enabled; the caller issues
/// the enable afterwards.
pub fn program_group(state: &CoreState, regio: &dyn RegisterIo) {
    for (ev, slot) in scheduled_slots(state) {
        let evt = state.program.events[ev];
        regio.write_evtype(slot, Evtype::new(evt.id, evt.filter));
    }
    if let Some(cycle) = state.program.cycle {
        regio.write_evtype(CYCLE_COUNTER_IDX, Evtype::new(0, cycle.filter));
    }
    regio.isb();
}

/// Which group the general event at `ev_idx` belongs to.
pub fn group_of(state: &CoreState, ev_idx: usize) -> usize {
    state
        .program
        .groups
        .iter()
        .position(|g| g.contains(&ev_idx))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::FilterFlags;
    use crate::state::SampleShared;
    use std::sync::Arc;

    fn evt(id: u16) -> AssignedEvent {
        AssignedEvent {
            id,
            filter: FilterFlags::EXCLUDE_EL1,
        }
    }

    #[test]
    fn small_assignment_is_a_single_group() {
        let map = [2u8, 3, 5];
        let program = build_program(&[evt(0x11), evt(0x08), evt(0x23)], &map, false).unwrap();

        assert!(program.cycle.is_some());
        assert_eq!(program.events.len(), 2);
        assert_eq!(program.groups, vec![vec![0, 1]]);
        assert!(!program.multiplexed());
    }

    #[test]
    fn oversubscription_partitions_in_input_order() {
        let ids: Vec<_> = (0..10u16).map(|i| evt(0x20 + i)).collect();
        let map = [0u8, 1, 2, 3];
        let program = build_program(&ids, &map, false).unwrap();

        assert_eq!(program.groups.len(), 3);
        assert_eq!(program.groups[0], vec![0, 1, 2, 3]);
        assert_eq!(program.groups[1], vec![4, 5, 6, 7]);
        // the last group is simply smaller
        assert_eq!(program.groups[2], vec![8, 9]);
        assert!(program.multiplexed());
    }

    #[test]
    fn duplicate_cycle_event_is_rejected() {
        let map = [0u8, 1];
        let err = build_program(&[evt(0x11), evt(0x11)], &map, false).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn general_events_without_counters_fail() {
        let err = build_program(&[evt(0x08)], &[], false).unwrap_err();
        assert!(matches!(err, Error::InsufficientResources));
    }

    #[test]
    fn scheduled_slots_follow_the_counter_map() {
        let map = [4u8, 6];
        let program = build_program(&[evt(0x11), evt(0x08), evt(0x23), evt(0x24)], &map, false)
            .unwrap();
        let mut state = CoreState::new(0, Arc::new(SampleShared::new()));
        state.program = program;

        assert_eq!(&scheduled_slots(&state)[..], &[(0, 4), (1, 6)][..]);
        assert_eq!(
            enable_mask(&state),
            (1 << 4) | (1 << 6) | CYCLE_COUNTER_BIT
        );
        assert_eq!(group_of(&state, 0), 0);
        assert_eq!(group_of(&state, 2), 1);

        state.current_group = 1;
        assert_eq!(&scheduled_slots(&state)[..], &[(2, 4)][..]);
    }
}
