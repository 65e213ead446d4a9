//! Hardware-counter arbitration with the host.
//!
//! The host decides who owns each physical counter. We probe slot by slot
//! to learn which ones are free, bulk-reserve the set we were offered, and
//! hold the reservation for the driver's whole lifetime. Release happens on
//! drop, on every exit path.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::hal::{HostApi, HostHandle, RegisterIo};
use crate::{Error, Result, CYCLE_COUNTER_IDX};

/// Outcome of probing the host's counter arbiter.
#[derive(Clone, Debug)]
pub struct ProbeResult {
    /// Counters the PMU implements, from PMCR.N.
    pub num_gpc: u8,
    /// Physical slots the host is willing to grant us.
    pub free_slots: Vec<u8>,
}

/// Ask the host for each slot in turn, releasing immediately; what we could
/// briefly hold is what a bulk reservation can get.
pub fn probe(host: &dyn HostApi, regio: &dyn RegisterIo) -> Result<ProbeResult> {
    let num_gpc = regio.read_pmcr().n();
    info!("{} general purpose hardware counters detected", num_gpc);

    let mut free_slots = Vec::new();
    for slot in 0..num_gpc {
        match host.allocate_counters(&[slot]) {
            Ok(handle) => {
                host.free_counters(handle);
                free_slots.push(slot);
            }
            Err(_) => {
                debug!("counter {} held by another kernel module", slot);
            }
        }
    }

    if free_slots.is_empty() {
        warn!("all hardware counters allocated by other kernel modules");
        return Err(Error::InsufficientResources);
    }
    info!(
        "{} free general purpose hardware counters detected",
        free_slots.len()
    );

    Ok(ProbeResult {
        num_gpc,
        free_slots,
    })
}

/// A held bulk reservation. The set of slots the engine ever programs is a
/// subset of `counter_map`; the cycle counter is granted implicitly.
pub struct CounterReservation {
    host: Arc<dyn HostApi>,
    handle: Option<HostHandle>,
    num_gpc: u8,
    counter_map: Vec<u8>,
}

impl CounterReservation {
    pub fn reserve(host: Arc<dyn HostApi>, probe: ProbeResult) -> Result<Self> {
        let handle = host.allocate_counters(&probe.free_slots)?;
        info!("reserved {} hardware counters", probe.free_slots.len());

        for (logical, physical) in probe.free_slots.iter().enumerate() {
            debug!("counter_idx_map[{}] => {}", logical, physical);
        }

        Ok(CounterReservation {
            host,
            handle: Some(handle),
            num_gpc: probe.num_gpc,
            counter_map: probe.free_slots,
        })
    }

    /// Publish the reserved slots to the host's per-thread counter API.
    pub fn configure_thread_profiling(&self) -> Result<()> {
        self.host.configure_thread_profiling(&self.counter_map)
    }

    pub fn num_gpc(&self) -> u8 {
        self.num_gpc
    }

    pub fn free_gpc(&self) -> usize {
        self.counter_map.len()
    }

    /// Permutation from logical indices onto physical slots.
    pub fn counter_map(&self) -> &[u8] {
        &self.counter_map
    }

    /// The map as reported over the command surface, with the cycle counter
    /// appended mapping onto itself.
    pub fn counter_map_with_cycle(&self) -> Vec<u8> {
        let mut map = self.counter_map.clone();
        map.push(CYCLE_COUNTER_IDX);
        map
    }

    /// Return the counters to the host. Idempotent.
    pub fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.host.free_counters(handle);
            info!("hardware counters released");
        }
    }
}

impl Drop for CounterReservation {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::emu::EmuHw;

    #[test]
    fn probe_skips_foreign_slots() {
        let hw = EmuHw::new(1, 6);
        hw.mark_foreign(2);
        hw.mark_foreign(4);

        let result = probe(hw.host().as_ref(), hw.regio().as_ref()).unwrap();
        assert_eq!(result.num_gpc, 6);
        assert_eq!(result.free_slots, vec![0, 1, 3, 5]);
    }

    #[test]
    fn probe_with_no_free_slots_fails() {
        let hw = EmuHw::new(1, 2);
        hw.mark_foreign(0);
        hw.mark_foreign(1);

        let err = probe(hw.host().as_ref(), hw.regio().as_ref()).unwrap_err();
        assert!(matches!(err, Error::InsufficientResources));
    }

    #[test]
    fn release_is_idempotent_and_runs_on_drop() {
        let hw = EmuHw::new(1, 4);
        let result = probe(hw.host().as_ref(), hw.regio().as_ref()).unwrap();

        let mut reservation = CounterReservation::reserve(hw.host(), result.clone()).unwrap();
        assert_eq!(reservation.free_gpc(), 4);
        assert_eq!(reservation.counter_map_with_cycle().last(), Some(&31));

        // while held, nobody else can take the slots
        assert!(hw.host().allocate_counters(&[0]).is_err());

        reservation.release();
        reservation.release();
        let probe_handle = hw.host().allocate_counters(&[0]).unwrap();
        hw.host().free_counters(probe_handle);

        let reservation = CounterReservation::reserve(hw.host(), result).unwrap();
        drop(reservation);
        let probe_handle = hw.host().allocate_counters(&[1]).unwrap();
        hw.host().free_counters(probe_handle);
    }
}
