//! DynamIQ Shared Unit counters, exposed over the same command surface as
//! the core PMU.
//!
//! The DSU has one PMU-like block per cluster and no multiplexing; an
//! assignment must fit the cluster's counters. Register access sits behind
//! [`DsuIo`] so the engine logic stays host-neutral.

use parking_lot::Mutex;
use pmu_protocol::{CoreCounts, CounterValue, DsuHwCfg, EventSpec};
use std::sync::Arc;

use crate::regs::FilterFlags;
use crate::state::AssignedEvent;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug)]
pub struct DsuTopology {
    pub num_clusters: u16,
    pub cluster_size: u16,
    pub num_gpc: u8,
}

/// Cluster-PMU access. One implementation per host platform.
pub trait DsuIo: Send + Sync {
    fn topology(&self) -> DsuTopology;
    fn program(&self, cluster: u16, slot: u8, event: u16);
    fn set_enabled(&self, cluster: u16, mask: u32, on: bool);
    fn read_counter(&self, cluster: u16, slot: u8) -> u64;
    fn reset(&self, cluster: u16);
}

pub struct DsuUnit {
    io: Arc<dyn DsuIo>,
    topology: DsuTopology,
    assigned: Mutex<Vec<Vec<AssignedEvent>>>,
}

impl DsuUnit {
    pub fn new(io: Arc<dyn DsuIo>) -> Self {
        let topology = io.topology();
        let assigned = (0..topology.num_clusters).map(|_| Vec::new()).collect();
        DsuUnit {
            io,
            topology,
            assigned: Mutex::new(assigned),
        }
    }

    pub fn hw_cfg(&self) -> DsuHwCfg {
        DsuHwCfg {
            num_clusters: self.topology.num_clusters,
            cluster_size: self.topology.cluster_size,
            num_gpc: self.topology.num_gpc,
        }
    }

    pub fn assign(&self, cluster_bitmap: u64, events: &[EventSpec]) -> Result<()> {
        if events.is_empty() {
            return Err(Error::InvalidParameter("no DSU events given"));
        }
        if events.len() > self.topology.num_gpc as usize {
            return Err(Error::InvalidParameter("more DSU events than counters"));
        }
        let clusters = self.clusters_of(cluster_bitmap)?;

        let assignment: Vec<AssignedEvent> = events
            .iter()
            .map(|e| AssignedEvent {
                id: e.id,
                filter: FilterFlags::from_bits_truncate(e.filter),
            })
            .collect();

        let mut assigned = self.assigned.lock();
        for cluster in clusters {
            for (slot, evt) in assignment.iter().enumerate() {
                self.io.program(cluster, slot as u8, evt.id);
            }
            assigned[cluster as usize] = assignment.clone();
        }
        Ok(())
    }

    pub fn reset(&self) {
        let assigned = self.assigned.lock();
        for cluster in 0..self.topology.num_clusters {
            if !assigned[cluster as usize].is_empty() {
                self.io.reset(cluster);
            }
        }
    }

    pub fn set_running(&self, on: bool) {
        let assigned = self.assigned.lock();
        for cluster in 0..self.topology.num_clusters {
            let n = assigned[cluster as usize].len();
            if n > 0 {
                self.io.set_enabled(cluster, (1u32 << n) - 1, on);
            }
        }
    }

    pub fn read(&self) -> Vec<CoreCounts> {
        let assigned = self.assigned.lock();
        let mut out = Vec::new();
        for cluster in 0..self.topology.num_clusters {
            let events = &assigned[cluster as usize];
            if events.is_empty() {
                continue;
            }
            let counts = events
                .iter()
                .enumerate()
                .map(|(slot, evt)| CounterValue {
                    event_id: evt.id,
                    value: self.io.read_counter(cluster, slot as u8),
                    scheduled_ticks: 1,
                    total_ticks: 1,
                })
                .collect();
            out.push(CoreCounts {
                core: cluster as u32,
                counts,
            });
        }
        out
    }

    fn clusters_of(&self, bitmap: u64) -> Result<Vec<u16>> {
        if bitmap == 0 {
            return Err(Error::InvalidParameter("empty cluster bitmap"));
        }
        let mut clusters = Vec::new();
        for cluster in 0..64u16 {
            if bitmap & (1 << cluster) == 0 {
                continue;
            }
            if cluster >= self.topology.num_clusters {
                return Err(Error::InvalidParameter("cluster index out of range"));
            }
            clusters.push(cluster);
        }
        Ok(clusters)
    }
}
