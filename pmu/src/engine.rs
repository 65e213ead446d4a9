//! The owned engine object: init, teardown and every per-core operation.
//!
//! One `Engine` exists per loaded driver instance. It owns the counter
//! reservation, the per-core deferred contexts, the installed PMI handler
//! and the peripheral units; the command broker calls into it after
//! validating the state machine. Init failures roll back everything done so
//! far in reverse order; teardown never fails.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};
use pmu_protocol::{
    CoreCounts, EventSpec, HwCfg, SampleRecord, SampleSource, CTL_FLAG_CORE, CTL_FLAG_DMC,
    CTL_FLAG_DSU,
};

use crate::dmc::DmcUnit;
use crate::dsu::DsuUnit;
use crate::exec::{CoreExecutor, CoreOp, DpcSender};
use crate::hal::{CpuId, HostApi, RegisterIo};
use crate::pool::{self, CounterReservation};
use crate::regs::{FilterFlags, IdAa64Dfr0, Midr};
use crate::sampling::PmuIsr;
use crate::sched;
use crate::spe::SpeUnit;
use crate::state::{AssignedEvent, CoreProgram, SampleShared, SampleSlot};
use crate::{Error, Result, CYCLE_COUNTER_IDX};

/// Hard ceiling on one assignment; far above what multiplexing can service
/// with useful scheduling ratios.
pub const MAX_ASSIGNED_EVENTS: usize = 96;

/// Tunables fixed at init, plus the peripheral-unit backends the host
/// platform provides.
#[derive(Clone, Default)]
pub struct EngineConfig {
    /// Multiplex time-slice; `None` selects the 10 ms default.
    pub multiplex_interval: Option<Duration>,
    /// How many general events of the default set to program when the
    /// client has not assigned any; `None` means as many as there are free
    /// counters.
    pub default_event_cutoff: Option<usize>,
    pub dsu: Option<Arc<dyn crate::dsu::DsuIo>>,
    pub dmc: Option<Arc<dyn crate::dmc::DmcIo>>,
    pub spe: Option<Arc<dyn crate::spe::SpeIo>>,
}

const DEFAULT_MULTIPLEX_INTERVAL: Duration = Duration::from_millis(10);

/// Events programmed at load time, in slot order: the cycle counter first,
/// then the general set truncated to the free counters.
const DEFAULT_EVENTS: &[u16] = &[
    pmu_data::CPU_CYCLES,
    pmu_data::INST_RETIRED,
    pmu_data::STALL_FRONTEND,
    pmu_data::STALL_BACKEND,
    pmu_data::L1I_CACHE_REFILL,
    pmu_data::L1I_CACHE,
    pmu_data::L1D_CACHE_REFILL,
    pmu_data::L1D_CACHE,
    pmu_data::BR_RETIRED,
    pmu_data::BR_MIS_PRED_RETIRED,
    pmu_data::INST_SPEC,
    pmu_data::ASE_SPEC,
    pmu_data::VFP_SPEC,
    pmu_data::BUS_ACCESS,
    pmu_data::BUS_CYCLES,
    pmu_data::LDST_SPEC,
    pmu_data::DP_SPEC,
    pmu_data::CRYPTO_SPEC,
    pmu_data::STREX_FAIL_SPEC,
    pmu_data::BR_IMMED_SPEC,
    pmu_data::BR_RETURN_SPEC,
    pmu_data::BR_INDIRECT_SPEC,
    pmu_data::L2I_CACHE,
    pmu_data::L2I_CACHE_REFILL,
    pmu_data::L2D_CACHE,
    pmu_data::L2D_CACHE_REFILL,
    pmu_data::L1I_TLB,
    pmu_data::L1I_TLB_REFILL,
    pmu_data::L1D_TLB,
    pmu_data::L1D_TLB_REFILL,
    pmu_data::L2I_TLB,
    pmu_data::L2I_TLB_REFILL,
];

struct MuxStop {
    stopped: Mutex<bool>,
    cv: Condvar,
}

struct MuxTimer {
    stop: Arc<MuxStop>,
    join: Option<JoinHandle<()>>,
}

pub struct Engine {
    host: Arc<dyn HostApi>,
    regio: Arc<dyn RegisterIo>,
    cpuid: CpuId,
    num_cores: usize,
    num_gpc: u8,
    counter_map: Vec<u8>,
    long_counters: bool,
    multiplex_interval: Duration,
    reservation: Mutex<Option<CounterReservation>>,
    executor: CoreExecutor,
    shared: Vec<Arc<SampleShared>>,
    /// Last program applied per core; the rollback source when a later
    /// core's assignment fails mid-call.
    programs: Mutex<Vec<CoreProgram>>,
    mux: Mutex<Option<MuxTimer>>,
    running: AtomicBool,
    clients: AtomicUsize,
    teardown: Mutex<()>,
    teardown_cv: Condvar,
    dsu: Option<DsuUnit>,
    dmc: Option<DmcUnit>,
    spe: Option<SpeUnit>,
}

impl Engine {
    pub fn new(
        host: Arc<dyn HostApi>,
        regio: Arc<dyn RegisterIo>,
        cfg: EngineConfig,
    ) -> Result<Arc<Self>> {
        let cpuid = regio.read_id();

        let pmu_ver = (cpuid.dfr0 >> 8) & 0xf;
        if pmu_ver == 0 {
            info!("PMUv3 not supported by hardware");
            return Err(Error::Unsupported("PMUv3 not present"));
        }
        info!("PMU version {}", pmu_ver);

        let aa64 = IdAa64Dfr0::from_bits(cpuid.aa64dfr0);
        info!("Performance Monitors Extension: {}", aa64.pmu_version().as_str());
        info!("Statistical Profiling Extension: {}", aa64.spe_version().as_str());

        let midr = Midr::from_bits(cpuid.midr);
        debug!(
            "arch: {}, implementer {}, variant: {}, part_num: {}, revision: {}",
            midr.architecture(),
            midr.implementer(),
            midr.variant(),
            midr.part_num(),
            midr.revision()
        );

        let long_counters = aa64.pmu_version().supports_long_counters();
        if long_counters {
            info!("64-bit event counters available");
        }

        let num_cores = host.num_cores();
        info!("{} cores detected", num_cores);
        if num_cores == 0 {
            return Err(Error::Internal("host reports zero cores".into()));
        }

        let probe = pool::probe(host.as_ref(), regio.as_ref())?;
        let num_gpc = probe.num_gpc;
        let reservation = CounterReservation::reserve(host.clone(), probe)?;
        reservation.configure_thread_profiling()?;
        let counter_map = reservation.counter_map().to_vec();

        let shared: Vec<_> = (0..num_cores)
            .map(|_| Arc::new(SampleShared::new()))
            .collect();
        let executor = CoreExecutor::new(regio.clone(), &shared)?;

        let dpcs: Vec<DpcSender> = (0..num_cores).map(|i| executor.dpc_sender(i)).collect();
        let isr = PmuIsr::new(regio.clone(), &shared, dpcs);
        if let Err(e) = host.set_pmi_handler(Some(isr as Arc<dyn crate::hal::PmiHandler>)) {
            error!("register sampling isr failed");
            return Err(e);
        }

        let dsu = cfg.dsu.clone().map(DsuUnit::new);
        let dmc = cfg.dmc.clone().map(DmcUnit::new);
        let spe = SpeUnit::probe(&cpuid, cfg.spe.clone());

        let engine = Arc::new(Engine {
            host,
            regio,
            cpuid,
            num_cores,
            num_gpc,
            counter_map: counter_map.clone(),
            long_counters,
            multiplex_interval: cfg.multiplex_interval.unwrap_or(DEFAULT_MULTIPLEX_INTERVAL),
            reservation: Mutex::new(Some(reservation)),
            executor,
            shared,
            programs: Mutex::new(vec![CoreProgram::default(); num_cores]),
            mux: Mutex::new(None),
            running: AtomicBool::new(true),
            clients: AtomicUsize::new(0),
            teardown: Mutex::new(()),
            teardown_cv: Condvar::new(),
            dsu,
            dmc,
            spe,
        });

        // default events, then a one-shot reset so the hardware starts from
        // a known state; any failure unwinds through Drop
        let cutoff = cfg.default_event_cutoff.unwrap_or(counter_map.len());
        let defaults = default_event_set(cutoff);
        engine.apply_assignment(&(0..num_cores).collect::<Vec<_>>(), defaults)?;
        engine.submit_all_wait(|_| CoreOp::Reset)?;

        info!("loaded");
        Ok(engine)
    }

    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    pub fn hw_cfg(&self) -> HwCfg {
        let aa64 = IdAa64Dfr0::from_bits(self.cpuid.aa64dfr0);
        let mut counter_idx_map = self.counter_map.clone();
        counter_idx_map.push(CYCLE_COUNTER_IDX);
        HwCfg {
            pmu_ver: ((self.cpuid.dfr0 >> 8) & 0xf) as u8,
            aa64_pmu_ver: aa64.pmu_ver_field(),
            aa64_pms_ver: aa64.pms_ver_field(),
            num_gpc: self.num_gpc,
            free_gpc: self.counter_map.len() as u8,
            cycle_counter_supported: true,
            midr: self.cpuid.midr,
            counter_idx_map,
        }
    }

    pub fn events_assign(
        &self,
        core_bitmap: u64,
        events: &[EventSpec],
        kernel_mode: bool,
    ) -> Result<()> {
        self.ensure_running()?;
        let cores = self.cores_of(core_bitmap)?;
        if events.is_empty() {
            return Err(Error::InvalidParameter("no events given"));
        }
        if events.len() > MAX_ASSIGNED_EVENTS {
            return Err(Error::InvalidParameter("too many events"));
        }
        let assigned = events
            .iter()
            .map(|e| resolve_event(e, kernel_mode))
            .collect::<Result<Vec<_>>>()?;
        self.apply_assignment(&cores, assigned)
    }

    pub fn reset(&self, flags: u32) -> Result<()> {
        self.ensure_running()?;
        self.validate_flags(flags)?;
        if flags & CTL_FLAG_CORE != 0 {
            self.submit_all_wait(|_| CoreOp::Reset)?;
        }
        if flags & CTL_FLAG_DSU != 0 {
            self.dsu()?.reset();
        }
        if flags & CTL_FLAG_DMC != 0 {
            self.dmc()?.reset();
        }
        Ok(())
    }

    pub fn start(&self, flags: u32) -> Result<()> {
        self.ensure_running()?;
        self.validate_flags(flags)?;
        if flags & CTL_FLAG_CORE != 0 {
            self.submit_all_wait(|_| CoreOp::Start)?;
            self.start_mux_timer()?;
        }
        if flags & CTL_FLAG_DSU != 0 {
            self.dsu()?.set_running(true);
        }
        if flags & CTL_FLAG_DMC != 0 {
            self.dmc()?.set_running(true);
        }
        Ok(())
    }

    pub fn stop(&self, flags: u32) -> Result<()> {
        self.validate_flags(flags)?;
        if flags & CTL_FLAG_CORE != 0 {
            self.stop_mux_timer();
            self.submit_all_wait(|_| CoreOp::Stop)?;
        }
        if flags & CTL_FLAG_DSU != 0 {
            self.dsu()?.set_running(false);
        }
        if flags & CTL_FLAG_DMC != 0 {
            self.dmc()?.set_running(false);
        }
        Ok(())
    }

    pub fn read_counting(&self, core_bitmap: u64) -> Result<Vec<CoreCounts>> {
        self.ensure_running()?;
        let cores = self.cores_of(core_bitmap)?;
        let mut out = Vec::with_capacity(cores.len());
        for core in cores {
            let (reply, rx) = sync_channel(1);
            self.executor.submit(core, CoreOp::ReadCounting { reply })?;
            let counts = rx.recv().map_err(|_| Error::Cancelled)?;
            out.push(CoreCounts {
                core: core as u32,
                counts,
            });
        }
        Ok(out)
    }

    pub fn sample_set_src(&self, sources: &[SampleSource], kernel_mode: bool) -> Result<()> {
        self.ensure_running()?;
        if sources.is_empty() {
            return Err(Error::InvalidParameter("no sample sources given"));
        }

        let filter = if kernel_mode {
            FilterFlags::empty()
        } else {
            FilterFlags::EXCLUDE_EL1
        };

        let mut slots: Vec<SampleSlot> = Vec::with_capacity(sources.len());
        let mut next_logical = 0;
        for src in sources {
            if src.interval == 0 {
                return Err(Error::InvalidParameter("zero sample interval"));
            }
            if !pmu_data::is_known_event(src.event_id) {
                return Err(Error::InvalidParameter("unknown event id"));
            }
            let slot = if src.event_id == pmu_data::CYCLE_EVENT_IDX {
                if slots.iter().any(|s| s.slot == CYCLE_COUNTER_IDX) {
                    return Err(Error::InvalidParameter("cycle event assigned twice"));
                }
                CYCLE_COUNTER_IDX
            } else {
                if next_logical >= self.counter_map.len() {
                    return Err(Error::InvalidParameter("too many sample sources"));
                }
                let slot = self.counter_map[next_logical];
                next_logical += 1;
                slot
            };
            slots.push(SampleSlot {
                slot,
                event: src.event_id,
                interval: src.interval,
                filter,
            });
        }

        self.submit_all_wait(|_| CoreOp::SampleProgram {
            slots: slots.clone(),
        })
    }

    pub fn sample_start(&self) -> Result<()> {
        self.ensure_running()?;
        self.submit_all_wait(|_| CoreOp::SampleStart)
    }

    pub fn sample_stop(&self) -> Result<()> {
        self.submit_all_wait(|_| CoreOp::SampleStop)
    }

    pub fn sample_get(&self, core: usize) -> Result<Vec<SampleRecord>> {
        self.ensure_running()?;
        let shared = self
            .shared
            .get(core)
            .ok_or(Error::InvalidParameter("core index out of range"))?;
        Ok(shared
            .drain()
            .into_iter()
            .map(|s| SampleRecord {
                pc: s.pc,
                lr: s.lr,
                ov_flags: s.ov_flags,
            })
            .collect())
    }

    pub fn sample_stats(&self, core: usize) -> Result<(u64, u64)> {
        self.ensure_running()?;
        let shared = self
            .shared
            .get(core)
            .ok_or(Error::InvalidParameter("core index out of range"))?;
        Ok(shared.stats())
    }

    pub fn dsu(&self) -> Result<&DsuUnit> {
        self.dsu.as_ref().ok_or(Error::Unsupported("DSU not present"))
    }

    pub fn dmc(&self) -> Result<&DmcUnit> {
        self.dmc.as_ref().ok_or(Error::Unsupported("DMC not present"))
    }

    pub fn spe(&self) -> Result<&SpeUnit> {
        self.spe.as_ref().ok_or(Error::Unsupported("SPE not present"))
    }

    /// A client opened a handle to the device.
    pub fn client_connect(&self) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        self.clients.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn client_disconnect(&self) {
        self.clients.fetch_sub(1, Ordering::AcqRel);
        self.teardown_cv.notify_all();
    }

    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The host asked to unload. New work is refused from here on; the call
    /// blocks until every client handle is closed, then cancels timers and
    /// queued deferred work.
    pub fn query_remove(&self) {
        self.running.store(false, Ordering::Release);

        let mut guard = self.teardown.lock();
        while self.clients.load(Ordering::Acquire) > 0 {
            self.teardown_cv
                .wait_for(&mut guard, Duration::from_millis(10));
        }
        drop(guard);

        self.stop_mux_timer();
        let _ = self.submit_all_wait(|_| CoreOp::SampleStop);
        let _ = self.submit_all_wait(|_| CoreOp::Stop);
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::Cancelled)
        }
    }

    fn validate_flags(&self, flags: u32) -> Result<()> {
        if flags == 0 || flags & !(CTL_FLAG_CORE | CTL_FLAG_DSU | CTL_FLAG_DMC) != 0 {
            return Err(Error::InvalidParameter("unit flags"));
        }
        Ok(())
    }

    fn cores_of(&self, bitmap: u64) -> Result<Vec<usize>> {
        if bitmap == 0 {
            return Err(Error::InvalidParameter("empty core bitmap"));
        }
        let mut cores = Vec::new();
        for core in 0..64usize {
            if bitmap & (1 << core) == 0 {
                continue;
            }
            if core >= self.num_cores {
                return Err(Error::InvalidParameter("core index out of range"));
            }
            cores.push(core);
        }
        Ok(cores)
    }

    fn apply_assignment(&self, cores: &[usize], events: Vec<AssignedEvent>) -> Result<()> {
        let program = sched::build_program(&events, &self.counter_map, self.long_counters)?;

        let mut programs = self.programs.lock();
        let mut written: Vec<(usize, CoreProgram)> = Vec::new();
        for &core in cores {
            let op = CoreOp::Assign {
                program: program.clone(),
            };
            if let Err(e) = self.executor.submit_wait(core, op) {
                // no partial programming: put the cores already written
                // back onto their previous program
                for (prev_core, prev) in &written {
                    let _ = self.executor.submit_wait(
                        *prev_core,
                        CoreOp::Assign {
                            program: prev.clone(),
                        },
                    );
                    programs[*prev_core] = prev.clone();
                }
                return Err(e);
            }
            written.push((core, programs[core].clone()));
            programs[core] = program.clone();
        }
        Ok(())
    }

    fn submit_all_wait<F>(&self, mk: F) -> Result<()>
    where
        F: FnMut(usize) -> CoreOp,
    {
        let cores: Vec<usize> = (0..self.num_cores).collect();
        self.executor.submit_wait_each(&cores, mk)
    }

    fn start_mux_timer(&self) -> Result<()> {
        let mux_cores: Vec<usize> = {
            let programs = self.programs.lock();
            programs
                .iter()
                .enumerate()
                .filter(|(_, p)| p.multiplexed())
                .map(|(core, _)| core)
                .collect()
        };
        if mux_cores.is_empty() {
            return Ok(());
        }

        let senders: Vec<DpcSender> = mux_cores
            .iter()
            .map(|&core| self.executor.dpc_sender(core))
            .collect();
        let stop = Arc::new(MuxStop {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        });
        let timer_stop = stop.clone();
        let interval = self.multiplex_interval;

        let join = std::thread::Builder::new()
            .name("pmu-multiplex".into())
            .spawn(move || {
                let mut stopped = timer_stop.stopped.lock();
                loop {
                    if *stopped {
                        break;
                    }
                    let result = timer_stop.cv.wait_for(&mut stopped, interval);
                    if *stopped {
                        break;
                    }
                    if result.timed_out() {
                        for tx in &senders {
                            tx.queue(CoreOp::Multiplex);
                        }
                    }
                }
            })
            .map_err(|e| Error::Internal(format!("failed to spawn multiplex timer: {e}")))?;

        *self.mux.lock() = Some(MuxTimer {
            stop,
            join: Some(join),
        });
        Ok(())
    }

    fn stop_mux_timer(&self) {
        let timer = self.mux.lock().take();
        if let Some(mut timer) = timer {
            *timer.stop.stopped.lock() = true;
            timer.stop.cv.notify_all();
            if let Some(join) = timer.join.take() {
                let _ = join.join();
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.stop_mux_timer();

        let _ = self.submit_all_wait(|_| CoreOp::SampleStop);
        let _ = self.submit_all_wait(|_| CoreOp::Stop);

        if self.host.set_pmi_handler(None).is_err() {
            error!("uninstalling sampling isr failed");
        }
        self.executor.shutdown();

        if let Some(mut reservation) = self.reservation.lock().take() {
            reservation.release();
        }
        info!("unloaded");
    }
}

fn default_event_set(cutoff: usize) -> Vec<AssignedEvent> {
    DEFAULT_EVENTS
        .iter()
        .take(1 + cutoff)
        .map(|&id| AssignedEvent {
            id,
            filter: FilterFlags::EXCLUDE_EL1,
        })
        .collect()
}

fn resolve_event(spec: &EventSpec, kernel_mode: bool) -> Result<AssignedEvent> {
    if !pmu_data::is_known_event(spec.id) {
        return Err(Error::InvalidParameter("unknown event id"));
    }
    let filter = if spec.filter != 0 {
        FilterFlags::from_bits_truncate(spec.filter)
    } else if kernel_mode {
        FilterFlags::empty()
    } else {
        FilterFlags::EXCLUDE_EL1
    };
    Ok(AssignedEvent {
        id: spec.id,
        filter,
    })
}
