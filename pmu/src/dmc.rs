//! DRAM memory-controller counters.
//!
//! Each DMC channel is a memory-mapped register block the host maps for us
//! at init and unmaps at teardown. Events split into the clk and clkdiv2
//! domains; the register map details stay behind [`DmcIo`].

use parking_lot::Mutex;
use pmu_protocol::{CounterValue, DmcCounts, DmcHwCfg, EventSpec};
use std::sync::Arc;

use crate::{Error, Result};

/// One mapped channel, as described by the host's resource tables.
#[derive(Clone, Copy, Debug)]
pub struct DmcChannel {
    pub iomem_start: u64,
    pub iomem_len: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmcDomain {
    Clk,
    Clkdiv2,
}

/// Channel register access. One implementation per controller generation.
pub trait DmcIo: Send + Sync {
    fn channels(&self) -> Vec<DmcChannel>;
    fn program(&self, channel: u8, domain: DmcDomain, slot: u8, event: u16);
    fn set_enabled(&self, channel: u8, on: bool);
    fn read_counter(&self, channel: u8, domain: DmcDomain, slot: u8) -> u64;
    fn reset(&self, channel: u8);
}

/// Counters per domain on one channel.
const DMC_SLOTS_PER_DOMAIN: usize = 8;

#[derive(Default, Clone)]
struct ChannelAssignment {
    clk: Vec<u16>,
    clkdiv2: Vec<u16>,
}

pub struct DmcUnit {
    io: Arc<dyn DmcIo>,
    channels: Vec<DmcChannel>,
    assigned: Mutex<Vec<ChannelAssignment>>,
}

impl DmcUnit {
    pub fn new(io: Arc<dyn DmcIo>) -> Self {
        let channels = io.channels();
        let assigned = vec![ChannelAssignment::default(); channels.len()];
        DmcUnit {
            io,
            channels,
            assigned: Mutex::new(assigned),
        }
    }

    pub fn hw_cfg(&self) -> DmcHwCfg {
        DmcHwCfg {
            num_channels: self.channels.len() as u8,
        }
    }

    pub fn assign(
        &self,
        channel: u8,
        clk_events: &[EventSpec],
        clkdiv2_events: &[EventSpec],
    ) -> Result<()> {
        if channel as usize >= self.channels.len() {
            return Err(Error::InvalidParameter("DMC channel out of range"));
        }
        if clk_events.is_empty() && clkdiv2_events.is_empty() {
            return Err(Error::InvalidParameter("no DMC events given"));
        }
        if clk_events.len() > DMC_SLOTS_PER_DOMAIN || clkdiv2_events.len() > DMC_SLOTS_PER_DOMAIN {
            return Err(Error::InvalidParameter("more DMC events than counters"));
        }

        for (slot, evt) in clk_events.iter().enumerate() {
            self.io.program(channel, DmcDomain::Clk, slot as u8, evt.id);
        }
        for (slot, evt) in clkdiv2_events.iter().enumerate() {
            self.io
                .program(channel, DmcDomain::Clkdiv2, slot as u8, evt.id);
        }

        let mut assigned = self.assigned.lock();
        assigned[channel as usize] = ChannelAssignment {
            clk: clk_events.iter().map(|e| e.id).collect(),
            clkdiv2: clkdiv2_events.iter().map(|e| e.id).collect(),
        };
        Ok(())
    }

    pub fn reset(&self) {
        let assigned = self.assigned.lock();
        for (channel, a) in assigned.iter().enumerate() {
            if !a.clk.is_empty() || !a.clkdiv2.is_empty() {
                self.io.reset(channel as u8);
            }
        }
    }

    pub fn set_running(&self, on: bool) {
        let assigned = self.assigned.lock();
        for (channel, a) in assigned.iter().enumerate() {
            if !a.clk.is_empty() || !a.clkdiv2.is_empty() {
                self.io.set_enabled(channel as u8, on);
            }
        }
    }

    pub fn read(&self) -> Vec<DmcCounts> {
        let assigned = self.assigned.lock();
        let mut out = Vec::new();
        for (channel, a) in assigned.iter().enumerate() {
            if a.clk.is_empty() && a.clkdiv2.is_empty() {
                continue;
            }
            let read_domain = |domain, ids: &[u16]| -> Vec<CounterValue> {
                ids.iter()
                    .enumerate()
                    .map(|(slot, &event_id)| CounterValue {
                        event_id,
                        value: self.io.read_counter(channel as u8, domain, slot as u8),
                        scheduled_ticks: 1,
                        total_ticks: 1,
                    })
                    .collect()
            };
            out.push(DmcCounts {
                channel: channel as u8,
                clk: read_domain(DmcDomain::Clk, &a.clk),
                clkdiv2: read_domain(DmcDomain::Clkdiv2, &a.clkdiv2),
            });
        }
        out
    }
}
