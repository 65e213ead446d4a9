//! Software model of the PMU hardware and the host's counter arbiter.
//!
//! The model keeps one register file per core. Counters advance on an
//! explicit [`EmuHw::tick`] stimulus; wraps raise overflow flags and, when
//! the interrupt is unmasked, deliver the installed PMI handler on the
//! ticked core exactly as hardware would. Register reads issued outside any
//! core context observe core 0.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dmc::{DmcChannel, DmcDomain, DmcIo};
use crate::dsu::{DsuIo, DsuTopology};
use crate::exec;
use crate::hal::{CpuId, HostApi, HostHandle, PmiHandler, RegisterIo, TrapFrame};
use crate::regs::{counter_bit, Evtype, Pmcr};
use crate::spe::SpeIo;
use crate::{Error, Result, CYCLE_COUNTER_IDX};

const PMCR_E: u64 = 1 << 0;
const PMCR_P: u64 = 1 << 1;
const PMCR_C: u64 = 1 << 2;
const PMCR_LC: u64 = 1 << 6;
const PMCR_LP: u64 = 1 << 7;

struct EmuCore {
    pmcr: u64,
    cnten: u32,
    inten: u32,
    ovsr: u32,
    evtypes: [u32; 31],
    counters: [u64; 31],
    ccntr: u64,
    ccfiltr: u32,
}

impl EmuCore {
    fn new(num_gpc: u8) -> Self {
        EmuCore {
            pmcr: (num_gpc as u64) << 11,
            cnten: 0,
            inten: 0,
            ovsr: 0,
            evtypes: [0; 31],
            counters: [0; 31],
            ccntr: 0,
            ccfiltr: 0,
        }
    }

    fn long_events(&self) -> bool {
        self.pmcr & PMCR_LP != 0
    }
}

#[derive(Default)]
struct Reservations {
    next: u64,
    held: HashMap<u64, Vec<u8>>,
    foreign: HashSet<u8>,
}

/// The emulated machine: implements both [`RegisterIo`] and [`HostApi`].
pub struct EmuHw {
    num_gpc: u8,
    cpuid: CpuId,
    cores: Vec<Mutex<EmuCore>>,
    handler: Mutex<Option<Arc<dyn PmiHandler>>>,
    reservations: Mutex<Reservations>,
    thread_profiling: Mutex<HashSet<u8>>,
}

impl EmuHw {
    /// A PMUv3 machine with 32-bit event counters and no SPE.
    pub fn new(num_cores: usize, num_gpc: u8) -> Arc<Self> {
        Self::new_with(num_cores, num_gpc, 0b0001, 0)
    }

    /// A PMUv3p5 machine: 64-bit event counters.
    pub fn new_v3p5(num_cores: usize, num_gpc: u8) -> Arc<Self> {
        Self::new_with(num_cores, num_gpc, 0b0110, 0)
    }

    pub fn new_with(
        num_cores: usize,
        num_gpc: u8,
        pmu_ver_field: u8,
        pms_ver_field: u8,
    ) -> Arc<Self> {
        assert!(num_gpc as usize <= 31);
        let spe = pms_ver_field != 0;
        let cpuid = CpuId {
            dfr0: (pmu_ver_field as u64) << 8,
            midr: 0x414F_D0C1, // Neoverse N1
            aa64dfr0: ((pmu_ver_field as u64) << 8) | ((pms_ver_field as u64) << 32),
            pmbidr: if spe { 0x7 } else { 0 },
            pmsidr: if spe { 0x8_00 } else { 0 },
        };
        Arc::new(EmuHw {
            num_gpc,
            cpuid,
            cores: (0..num_cores).map(|_| Mutex::new(EmuCore::new(num_gpc))).collect(),
            handler: Mutex::new(None),
            reservations: Mutex::new(Reservations::default()),
            thread_profiling: Mutex::new(HashSet::new()),
        })
    }

    pub fn host(self: &Arc<Self>) -> Arc<dyn HostApi> {
        self.clone()
    }

    pub fn regio(self: &Arc<Self>) -> Arc<dyn RegisterIo> {
        self.clone()
    }

    /// Pretend another kernel module owns this physical slot.
    pub fn mark_foreign(&self, slot: u8) {
        self.reservations.lock().foreign.insert(slot);
    }

    /// Advance every enabled counter programmed with `event` on `core`,
    /// delivering the PMI when an unmasked counter wraps.
    pub fn tick(&self, core: usize, event: u16, count: u64) {
        self.tick_with_frame(
            core,
            event,
            count,
            TrapFrame {
                pc: 0x0040_0000 + ((core as u64) << 16),
                lr: 0x0040_8000 + ((core as u64) << 16),
            },
        );
    }

    pub fn tick_cycles(&self, core: usize, count: u64) {
        self.tick(core, pmu_data::CPU_CYCLES, count);
    }

    pub fn tick_with_frame(&self, core: usize, event: u16, count: u64, frame: TrapFrame) {
        let fire = {
            let mut c = self.cores[core].lock();
            if c.pmcr & PMCR_E == 0 {
                return;
            }

            for slot in 0..self.num_gpc as usize {
                if c.cnten & counter_bit(slot as u8) == 0 {
                    continue;
                }
                if Evtype::from_bits(c.evtypes[slot]).event() != event {
                    continue;
                }
                let old = c.counters[slot];
                if c.long_events() {
                    c.counters[slot] = old.wrapping_add(count);
                    if old.checked_add(count).is_none() {
                        c.ovsr |= counter_bit(slot as u8);
                    }
                } else {
                    let new = old + count;
                    if new >> 32 != 0 {
                        c.ovsr |= counter_bit(slot as u8);
                    }
                    c.counters[slot] = new & 0xFFFF_FFFF;
                }
            }

            if event == pmu_data::CPU_CYCLES && c.cnten & counter_bit(CYCLE_COUNTER_IDX) != 0 {
                let old_low = c.ccntr & 0xFFFF_FFFF;
                c.ccntr = c.ccntr.wrapping_add(count);
                // overflow tracks the low word unless PMCR.LC is set
                if c.pmcr & PMCR_LC == 0 && old_low + count >= 1 << 32 {
                    c.ovsr |= counter_bit(CYCLE_COUNTER_IDX);
                }
            }

            c.ovsr & c.inten != 0
        };

        if fire {
            let handler = self.handler.lock().clone();
            if let Some(handler) = handler {
                let _scope = exec::enter_core(core);
                handler.handle(core, &frame);
            }
        }
    }

    fn core(&self) -> &Mutex<EmuCore> {
        let idx = exec::current_core();
        let idx = if idx == usize::MAX { 0 } else { idx };
        &self.cores[idx]
    }

    // test inspection

    pub fn evtype(&self, core: usize, slot: u8) -> u32 {
        let c = self.cores[core].lock();
        if slot == CYCLE_COUNTER_IDX {
            c.ccfiltr
        } else {
            c.evtypes[slot as usize]
        }
    }

    pub fn counter(&self, core: usize, slot: u8) -> u64 {
        let c = self.cores[core].lock();
        if slot == CYCLE_COUNTER_IDX {
            c.ccntr
        } else {
            c.counters[slot as usize]
        }
    }

    pub fn enabled_mask(&self, core: usize) -> u32 {
        self.cores[core].lock().cnten
    }

    pub fn inten_mask(&self, core: usize) -> u32 {
        self.cores[core].lock().inten
    }
}

impl RegisterIo for EmuHw {
    fn read_pmcr(&self) -> Pmcr {
        Pmcr::from_bits(self.core().lock().pmcr)
    }

    fn write_pmcr(&self, pmcr: Pmcr) {
        let mut c = self.core().lock();
        let bits = pmcr.bits();
        if bits & PMCR_P != 0 {
            c.counters = [0; 31];
        }
        if bits & PMCR_C != 0 {
            c.ccntr = 0;
        }
        let writable = PMCR_E | PMCR_LC | PMCR_LP;
        let n = c.pmcr & (0x1f << 11);
        c.pmcr = (bits & writable) | n;
    }

    fn counter_enable_set(&self, mask: u32) {
        self.core().lock().cnten |= mask;
    }

    fn counter_enable_clear(&self, mask: u32) {
        self.core().lock().cnten &= !mask;
    }

    fn take_overflow_flags(&self) -> u32 {
        let mut c = self.core().lock();
        std::mem::take(&mut c.ovsr)
    }

    fn intr_enable_set(&self, mask: u32) {
        self.core().lock().inten |= mask;
    }

    fn intr_enable_clear(&self, mask: u32) {
        self.core().lock().inten &= !mask;
    }

    fn write_evtype(&self, slot: u8, evtype: Evtype) {
        let mut c = self.core().lock();
        if slot == CYCLE_COUNTER_IDX {
            c.ccfiltr = evtype.filter().bits();
        } else {
            c.evtypes[slot as usize] = evtype.bits();
        }
    }

    fn read_counter(&self, slot: u8) -> u64 {
        let c = self.core().lock();
        if slot == CYCLE_COUNTER_IDX {
            c.ccntr
        } else {
            c.counters[slot as usize]
        }
    }

    fn write_counter(&self, slot: u8, value: u64) {
        let mut c = self.core().lock();
        if slot == CYCLE_COUNTER_IDX {
            c.ccntr = value;
        } else if c.long_events() {
            c.counters[slot as usize] = value;
        } else {
            c.counters[slot as usize] = value & 0xFFFF_FFFF;
        }
    }

    fn read_id(&self) -> CpuId {
        self.cpuid
    }

    fn isb(&self) {}
}

impl HostApi for EmuHw {
    fn num_cores(&self) -> usize {
        self.cores.len()
    }

    fn allocate_counters(&self, slots: &[u8]) -> Result<HostHandle> {
        let mut table = self.reservations.lock();
        for slot in slots {
            if table.foreign.contains(slot) || table.held.values().any(|held| held.contains(slot)) {
                return Err(Error::InsufficientResources);
            }
        }
        table.next += 1;
        let handle = table.next;
        table.held.insert(handle, slots.to_vec());
        Ok(HostHandle(handle))
    }

    fn free_counters(&self, handle: HostHandle) {
        self.reservations.lock().held.remove(&handle.0);
    }

    fn configure_thread_profiling(&self, slots: &[u8]) -> Result<()> {
        let mut configured = self.thread_profiling.lock();
        for slot in slots {
            // re-configuring an already-enabled slot is tolerated
            configured.insert(*slot);
        }
        Ok(())
    }

    fn set_pmi_handler(&self, handler: Option<Arc<dyn PmiHandler>>) -> Result<()> {
        *self.handler.lock() = handler;
        Ok(())
    }
}

/// Emulated DSU: per-cluster counter blocks.
pub struct EmuDsu {
    topology: DsuTopology,
    clusters: Vec<Mutex<EmuCluster>>,
}

struct EmuCluster {
    events: Vec<u16>,
    counters: Vec<u64>,
    enabled: u32,
}

impl EmuDsu {
    pub fn new(num_clusters: u16, cluster_size: u16, num_gpc: u8) -> Arc<Self> {
        Arc::new(EmuDsu {
            topology: DsuTopology {
                num_clusters,
                cluster_size,
                num_gpc,
            },
            clusters: (0..num_clusters)
                .map(|_| {
                    Mutex::new(EmuCluster {
                        events: vec![0; num_gpc as usize],
                        counters: vec![0; num_gpc as usize],
                        enabled: 0,
                    })
                })
                .collect(),
        })
    }

    pub fn tick(&self, cluster: u16, event: u16, count: u64) {
        let mut c = self.clusters[cluster as usize].lock();
        for slot in 0..c.events.len() {
            if c.enabled & (1 << slot) != 0 && c.events[slot] == event {
                c.counters[slot] += count;
            }
        }
    }
}

impl DsuIo for EmuDsu {
    fn topology(&self) -> DsuTopology {
        self.topology
    }

    fn program(&self, cluster: u16, slot: u8, event: u16) {
        self.clusters[cluster as usize].lock().events[slot as usize] = event;
    }

    fn set_enabled(&self, cluster: u16, mask: u32, on: bool) {
        let mut c = self.clusters[cluster as usize].lock();
        if on {
            c.enabled |= mask;
        } else {
            c.enabled &= !mask;
        }
    }

    fn read_counter(&self, cluster: u16, slot: u8) -> u64 {
        self.clusters[cluster as usize].lock().counters[slot as usize]
    }

    fn reset(&self, cluster: u16) {
        let mut c = self.clusters[cluster as usize].lock();
        for counter in &mut c.counters {
            *counter = 0;
        }
    }
}

/// Emulated DMC with one clk and one clkdiv2 domain per channel.
pub struct EmuDmc {
    channels: Vec<DmcChannel>,
    state: Vec<Mutex<EmuDmcChannel>>,
}

#[derive(Default)]
struct EmuDmcChannel {
    clk_events: [u16; 8],
    clkdiv2_events: [u16; 8],
    clk: [u64; 8],
    clkdiv2: [u64; 8],
    enabled: bool,
}

impl EmuDmc {
    pub fn new(num_channels: u8) -> Arc<Self> {
        Arc::new(EmuDmc {
            channels: (0..num_channels)
                .map(|i| DmcChannel {
                    iomem_start: 0x5000_0000 + (i as u64) * 0x1_0000,
                    iomem_len: 0x1_0000,
                })
                .collect(),
            state: (0..num_channels)
                .map(|_| Mutex::new(EmuDmcChannel::default()))
                .collect(),
        })
    }

    pub fn tick(&self, channel: u8, domain: DmcDomain, event: u16, count: u64) {
        let mut guard = self.state[channel as usize].lock();
        let c = &mut *guard;
        if !c.enabled {
            return;
        }
        let (events, counters) = match domain {
            DmcDomain::Clk => (&c.clk_events, &mut c.clk),
            DmcDomain::Clkdiv2 => (&c.clkdiv2_events, &mut c.clkdiv2),
        };
        for slot in 0..8 {
            if events[slot] == event {
                counters[slot] += count;
            }
        }
    }
}

impl DmcIo for EmuDmc {
    fn channels(&self) -> Vec<DmcChannel> {
        self.channels.clone()
    }

    fn program(&self, channel: u8, domain: DmcDomain, slot: u8, event: u16) {
        let mut c = self.state[channel as usize].lock();
        match domain {
            DmcDomain::Clk => c.clk_events[slot as usize] = event,
            DmcDomain::Clkdiv2 => c.clkdiv2_events[slot as usize] = event,
        }
    }

    fn set_enabled(&self, channel: u8, on: bool) {
        self.state[channel as usize].lock().enabled = on;
    }

    fn read_counter(&self, channel: u8, domain: DmcDomain, slot: u8) -> u64 {
        let c = self.state[channel as usize].lock();
        match domain {
            DmcDomain::Clk => c.clk[slot as usize],
            DmcDomain::Clkdiv2 => c.clkdiv2[slot as usize],
        }
    }

    fn reset(&self, channel: u8) {
        let mut c = self.state[channel as usize].lock();
        c.clk = [0; 8];
        c.clkdiv2 = [0; 8];
    }
}

/// Emulated SPE profiling buffer, one-shot drain semantics.
pub struct EmuSpe {
    cores: Vec<Mutex<EmuSpeCore>>,
}

#[derive(Default)]
struct EmuSpeCore {
    enabled: bool,
    buffer: Vec<u8>,
}

impl EmuSpe {
    pub fn new(num_cores: usize) -> Arc<Self> {
        Arc::new(EmuSpe {
            cores: (0..num_cores)
                .map(|_| Mutex::new(EmuSpeCore::default()))
                .collect(),
        })
    }

    /// Append a raw profiling record; ignored while the unit is disabled.
    pub fn push_record(&self, core: usize, record: &[u8]) {
        let mut c = self.cores[core].lock();
        if c.enabled {
            c.buffer.extend_from_slice(record);
        }
    }
}

impl SpeIo for EmuSpe {
    fn enable(&self, core: usize) {
        self.cores[core].lock().enabled = true;
    }

    fn disable(&self, core: usize) {
        self.cores[core].lock().enabled = false;
    }

    fn drain(&self, core: usize) -> Vec<u8> {
        std::mem::take(&mut self.cores[core].lock().buffer)
    }
}
