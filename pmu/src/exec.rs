//! Per-core deferred contexts.
//!
//! Every operation that touches a core's counters becomes a typed work-item
//! submitted to that core's FIFO queue and executed by a dedicated worker,
//! mirroring a DPC targeted at that processor. Submitters can wait on a
//! completion signal; the interrupt path queues without waiting.

use std::cell::Cell;
use std::sync::mpsc::{channel, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use pmu_protocol::CounterValue;

use crate::hal::RegisterIo;
use crate::state::{CoreProgram, CoreState, SampleShared, SampleSlot};
use crate::{counting, sampling, Error, Result};

thread_local! {
    static CURRENT_CORE: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// The core whose context the calling thread is executing in, or
/// `usize::MAX` outside any core context.
pub fn current_core() -> usize {
    CURRENT_CORE.with(|c| c.get())
}

/// Enter a core context for the duration of the returned guard. Used by the
/// workers and by hardware models delivering interrupts.
pub(crate) fn enter_core(idx: usize) -> CoreScope {
    let prev = CURRENT_CORE.with(|c| c.replace(idx));
    CoreScope { prev }
}

pub(crate) struct CoreScope {
    prev: usize,
}

impl Drop for CoreScope {
    fn drop(&mut self) {
        CURRENT_CORE.with(|c| c.set(self.prev));
    }
}

/// Work-items a core's deferred context understands.
pub enum CoreOp {
    Assign { program: CoreProgram },
    Reset,
    Start,
    Stop,
    Multiplex,
    OverflowExtend { flags: u32 },
    ReadCounting { reply: SyncSender<Vec<CounterValue>> },
    SampleProgram { slots: Vec<SampleSlot> },
    SampleStart,
    SampleStop,
}

enum Message {
    Op(CoreOp, Option<SyncSender<()>>),
    Shutdown,
}

/// Handle the interrupt path uses to queue deferred work on a core.
#[derive(Clone)]
pub struct DpcSender {
    tx: Sender<Message>,
}

impl DpcSender {
    pub fn queue(&self, op: CoreOp) {
        // a closed queue means teardown has begun; the work is moot
        let _ = self.tx.send(Message::Op(op, None));
    }
}

struct CoreWorker {
    tx: Sender<Message>,
    join: Option<JoinHandle<()>>,
}

/// One FIFO queue and worker per core.
pub struct CoreExecutor {
    workers: Vec<CoreWorker>,
}

impl CoreExecutor {
    pub fn new(
        regio: Arc<dyn RegisterIo>,
        shared: &[Arc<SampleShared>],
    ) -> Result<Self> {
        let mut workers = Vec::with_capacity(shared.len());
        for (idx, sh) in shared.iter().enumerate() {
            let (tx, rx) = channel();
            let regio = regio.clone();
            let sh = sh.clone();
            let join = std::thread::Builder::new()
                .name(format!("pmu-core-{idx}"))
                .spawn(move || worker_loop(idx, regio, sh, rx))
                .map_err(|e| Error::Internal(format!("failed to spawn core worker: {e}")))?;
            workers.push(CoreWorker {
                tx,
                join: Some(join),
            });
        }
        Ok(CoreExecutor { workers })
    }

    pub fn num_cores(&self) -> usize {
        self.workers.len()
    }

    pub fn dpc_sender(&self, core: usize) -> DpcSender {
        DpcSender {
            tx: self.workers[core].tx.clone(),
        }
    }

    /// Queue without waiting.
    pub fn submit(&self, core: usize, op: CoreOp) -> Result<()> {
        let worker = self.workers.get(core).ok_or(Error::InvalidParameter("core index"))?;
        worker
            .tx
            .send(Message::Op(op, None))
            .map_err(|_| Error::Cancelled)
    }

    /// Queue and wait for the core to finish the work.
    pub fn submit_wait(&self, core: usize, op: CoreOp) -> Result<()> {
        let worker = self.workers.get(core).ok_or(Error::InvalidParameter("core index"))?;
        let (done_tx, done_rx) = std::sync::mpsc::sync_channel(1);
        worker
            .tx
            .send(Message::Op(op, Some(done_tx)))
            .map_err(|_| Error::Cancelled)?;
        done_rx.recv().map_err(|_| Error::Cancelled)
    }

    /// Queue one work-item per core, then wait for all of them.
    pub fn submit_wait_each<F>(&self, cores: &[usize], mut mk: F) -> Result<()>
    where
        F: FnMut(usize) -> CoreOp,
    {
        let mut pending = Vec::with_capacity(cores.len());
        for &core in cores {
            let worker = self
                .workers
                .get(core)
                .ok_or(Error::InvalidParameter("core index"))?;
            let (done_tx, done_rx) = std::sync::mpsc::sync_channel(1);
            worker
                .tx
                .send(Message::Op(mk(core), Some(done_tx)))
                .map_err(|_| Error::Cancelled)?;
            pending.push(done_rx);
        }
        for rx in pending {
            rx.recv().map_err(|_| Error::Cancelled)?;
        }
        Ok(())
    }

    /// Drain the queues and join the workers. Called once at teardown.
    pub fn shutdown(&mut self) {
        for w in &self.workers {
            let _ = w.tx.send(Message::Shutdown);
        }
        for w in &mut self.workers {
            if let Some(join) = w.join.take() {
                let _ = join.join();
            }
        }
    }
}

impl Drop for CoreExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    idx: usize,
    regio: Arc<dyn RegisterIo>,
    shared: Arc<SampleShared>,
    rx: Receiver<Message>,
) {
    let _scope = enter_core(idx);
    let mut state = CoreState::new(idx, shared);

    while let Ok(msg) = rx.recv() {
        match msg {
            Message::Op(op, done) => {
                execute(&mut state, regio.as_ref(), op);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Message::Shutdown => break,
        }
    }
}

fn execute(state: &mut CoreState, regio: &dyn RegisterIo, op: CoreOp) {
    match op {
        CoreOp::Assign { program } => counting::assign(state, regio, program),
        CoreOp::Reset => counting::reset(state, regio),
        CoreOp::Start => counting::start(state, regio),
        CoreOp::Stop => counting::stop(state, regio),
        CoreOp::Multiplex => counting::multiplex_tick(state, regio),
        CoreOp::OverflowExtend { flags } => counting::overflow_extend(state, flags),
        CoreOp::ReadCounting { reply } => {
            let counts = counting::read(state, regio);
            let _ = reply.send(counts);
        }
        CoreOp::SampleProgram { slots } => sampling::program(state, regio, slots),
        CoreOp::SampleStart => sampling::start(state, regio),
        CoreOp::SampleStop => {
            sampling::stop(state, regio);
            sampling::log_session(state.idx, &state.shared);
        }
    }
}
