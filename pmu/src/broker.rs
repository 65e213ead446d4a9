//! The single command ingress.
//!
//! Commands arrive as `{code, input blob, output blob}` from the host's
//! request queue; [`CommandBroker::dispatch_raw`] decodes them against
//! `pmu-protocol` and the typed [`CommandBroker::dispatch`] validates the
//! global state machine before touching the engines. Ingress is serialised;
//! the state itself lives under its own lock and changes only there.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;
use pmu_protocol::{self as proto, CommandCode};

use crate::engine::Engine;
use crate::{Error, Result};

/// Identifies one open client handle (one file object).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    Counting,
    Sampling,
}

/// The process-wide session record. At most one client is out of IDLE at a
/// time; only that client may continue or end the session.
struct LockStatus {
    state: DeviceState,
    current_ioctl: Option<CommandCode>,
    owner: Option<ClientId>,
    session_flags: u32,
    spe_core: Option<usize>,
    events_assigned: bool,
    sample_src_set: bool,
}

pub enum Command {
    Version,
    NumCores,
    QueryHwCfg,
    EventsAssign(proto::EventsAssignRequest),
    Reset(u32),
    Start(u32),
    Stop(u32),
    ReadCounting(u64),
    SampleSetSrc(proto::SampleSetSrcRequest),
    SampleStart,
    SampleStop,
    SampleGet(u32),
    SampleStats(u32),
    DsuQueryHwCfg,
    DsuEventsAssign(proto::DsuEventsAssignRequest),
    DsuReadCounting,
    DmcQueryHwCfg,
    DmcEventsAssign(proto::DmcEventsAssignRequest),
    DmcReadCounting,
    SpeQueryCaps,
    SpeStart(u32),
    SpeStop(u32),
    SpeGet(u32),
}

impl Command {
    fn code(&self) -> CommandCode {
        match self {
            Command::Version => CommandCode::Version,
            Command::NumCores => CommandCode::NumCores,
            Command::QueryHwCfg => CommandCode::QueryHwCfg,
            Command::EventsAssign(_) => CommandCode::EventsAssign,
            Command::Reset(_) => CommandCode::Reset,
            Command::Start(_) => CommandCode::Start,
            Command::Stop(_) => CommandCode::Stop,
            Command::ReadCounting(_) => CommandCode::ReadCounting,
            Command::SampleSetSrc(_) => CommandCode::SampleSetSrc,
            Command::SampleStart => CommandCode::SampleStart,
            Command::SampleStop => CommandCode::SampleStop,
            Command::SampleGet(_) => CommandCode::SampleGet,
            Command::SampleStats(_) => CommandCode::SampleStats,
            Command::DsuQueryHwCfg => CommandCode::DsuQueryHwCfg,
            Command::DsuEventsAssign(_) => CommandCode::DsuEventsAssign,
            Command::DsuReadCounting => CommandCode::DsuReadCounting,
            Command::DmcQueryHwCfg => CommandCode::DmcQueryHwCfg,
            Command::DmcEventsAssign(_) => CommandCode::DmcEventsAssign,
            Command::DmcReadCounting => CommandCode::DmcReadCounting,
            Command::SpeQueryCaps => CommandCode::SpeQueryCaps,
            Command::SpeStart(_) => CommandCode::SpeStart,
            Command::SpeStop(_) => CommandCode::SpeStop,
            Command::SpeGet(_) => CommandCode::SpeGet,
        }
    }
}

#[derive(Debug)]
pub enum Response {
    None,
    Version(proto::VersionInfo),
    NumCores(u32),
    HwCfg(proto::HwCfg),
    Counts(proto::ReadCountingResponse),
    Samples(proto::SampleGetResponse),
    SampleStats(proto::SampleStatsResponse),
    DsuHwCfg(proto::DsuHwCfg),
    DsuCounts(proto::DsuReadCountingResponse),
    DmcHwCfg(proto::DmcHwCfg),
    DmcCounts(proto::DmcReadCountingResponse),
    SpeCaps(proto::SpeCaps),
    SpeBuffer(proto::SpeGetResponse),
}

/// Whether `code` may be issued at all while the machine is in `state`.
/// Ownership of a running session is checked separately.
fn allowed(state: DeviceState, code: CommandCode) -> bool {
    use CommandCode::*;
    match code {
        Version | NumCores | QueryHwCfg | DsuQueryHwCfg | DmcQueryHwCfg | SpeQueryCaps => true,
        EventsAssign | Reset | SampleSetSrc | DsuEventsAssign | DmcEventsAssign | Start
        | SampleStart | SpeStart => state == DeviceState::Idle,
        // a stop that has nothing to stop succeeds as a no-op
        Stop => matches!(state, DeviceState::Idle | DeviceState::Counting),
        SampleStop | SpeStop => matches!(state, DeviceState::Idle | DeviceState::Sampling),
        ReadCounting | DsuReadCounting | DmcReadCounting => state == DeviceState::Counting,
        SampleGet | SampleStats | SpeGet => state == DeviceState::Sampling,
    }
}

pub struct CommandBroker {
    engine: Arc<Engine>,
    ingress: Mutex<()>,
    status: Mutex<LockStatus>,
    next_client: AtomicU64,
}

impl CommandBroker {
    pub fn new(engine: Arc<Engine>) -> Self {
        CommandBroker {
            engine,
            ingress: Mutex::new(()),
            status: Mutex::new(LockStatus {
                state: DeviceState::Idle,
                current_ioctl: None,
                owner: None,
                session_flags: 0,
                spe_core: None,
                events_assigned: false,
                sample_src_set: false,
            }),
            next_client: AtomicU64::new(1),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn state(&self) -> DeviceState {
        self.status.lock().state
    }

    /// A client opened a handle.
    pub fn open(&self) -> Result<ClientId> {
        self.engine.client_connect()?;
        Ok(ClientId(self.next_client.fetch_add(1, Ordering::Relaxed)))
    }

    /// A client handle went away. Any session it still owned is ended on
    /// its behalf.
    pub fn close(&self, client: ClientId) {
        let orphaned = {
            let mut status = self.status.lock();
            if status.owner == Some(client) {
                let orphaned = (status.state, status.session_flags, status.spe_core);
                status.state = DeviceState::Idle;
                status.owner = None;
                status.session_flags = 0;
                status.spe_core = None;
                Some(orphaned)
            } else {
                None
            }
        };

        match orphaned {
            Some((DeviceState::Counting, flags, _)) => {
                let _ = self.engine.stop(flags);
            }
            Some((DeviceState::Sampling, flags, spe_core)) => {
                if flags == proto::CTL_FLAG_SPE {
                    if let (Ok(spe), Some(core)) = (self.engine.spe(), spe_core) {
                        let _ = spe.stop(core, self.engine.num_cores());
                    }
                } else {
                    let _ = self.engine.sample_stop();
                }
            }
            _ => {}
        }

        self.engine.client_disconnect();
    }

    /// Decode, dispatch and encode one raw command.
    pub fn dispatch_raw(&self, client: ClientId, code: u32, input: &[u8]) -> (u32, Vec<u8>) {
        match self.try_dispatch_raw(client, code, input) {
            Ok(bytes) => (proto::STATUS_SUCCESS, bytes),
            Err(e) => (e.status_code(), Vec::new()),
        }
    }

    fn try_dispatch_raw(&self, client: ClientId, code: u32, input: &[u8]) -> Result<Vec<u8>> {
        let code =
            CommandCode::try_from(code).map_err(|_| Error::InvalidParameter("command code"))?;

        fn invalid_input(_: proto::ProtocolError) -> Error {
            Error::InvalidParameter("input payload")
        }
        fn ctl_flags(input: &[u8]) -> Result<u32> {
            let req: proto::CtlRequest = proto::decode(input).map_err(invalid_input)?;
            Ok(req.flags)
        }
        fn sample_core(input: &[u8]) -> Result<u32> {
            let req: proto::SampleRequest = proto::decode(input).map_err(invalid_input)?;
            Ok(req.core)
        }

        let cmd = match code {
            CommandCode::Version => Command::Version,
            CommandCode::NumCores => Command::NumCores,
            CommandCode::QueryHwCfg => Command::QueryHwCfg,
            CommandCode::EventsAssign => {
                Command::EventsAssign(proto::decode(input).map_err(invalid_input)?)
            }
            CommandCode::Reset => Command::Reset(ctl_flags(input)?),
            CommandCode::Start => Command::Start(ctl_flags(input)?),
            CommandCode::Stop => Command::Stop(ctl_flags(input)?),
            CommandCode::ReadCounting => {
                let req: proto::ReadCountingRequest =
                    proto::decode(input).map_err(invalid_input)?;
                Command::ReadCounting(req.core_bitmap)
            }
            CommandCode::SampleSetSrc => {
                Command::SampleSetSrc(proto::decode(input).map_err(invalid_input)?)
            }
            CommandCode::SampleStart => Command::SampleStart,
            CommandCode::SampleStop => Command::SampleStop,
            CommandCode::SampleGet => Command::SampleGet(sample_core(input)?),
            CommandCode::SampleStats => Command::SampleStats(sample_core(input)?),
            CommandCode::DsuQueryHwCfg => Command::DsuQueryHwCfg,
            CommandCode::DsuEventsAssign => {
                Command::DsuEventsAssign(proto::decode(input).map_err(invalid_input)?)
            }
            CommandCode::DsuReadCounting => Command::DsuReadCounting,
            CommandCode::DmcQueryHwCfg => Command::DmcQueryHwCfg,
            CommandCode::DmcEventsAssign => {
                Command::DmcEventsAssign(proto::decode(input).map_err(invalid_input)?)
            }
            CommandCode::DmcReadCounting => Command::DmcReadCounting,
            CommandCode::SpeQueryCaps => Command::SpeQueryCaps,
            CommandCode::SpeStart => Command::SpeStart(sample_core(input)?),
            CommandCode::SpeStop => Command::SpeStop(sample_core(input)?),
            CommandCode::SpeGet => Command::SpeGet(sample_core(input)?),
        };

        let response = self.dispatch(client, cmd)?;

        let encode = |r: std::result::Result<Vec<u8>, proto::ProtocolError>| {
            r.map_err(|e| Error::Internal(format!("response encoding failed: {e}")))
        };
        match response {
            Response::None => Ok(Vec::new()),
            Response::Version(v) => encode(proto::encode(&v)),
            Response::NumCores(v) => encode(proto::encode(&v)),
            Response::HwCfg(v) => encode(proto::encode(&v)),
            Response::Counts(v) => encode(proto::encode(&v)),
            Response::Samples(v) => encode(proto::encode(&v)),
            Response::SampleStats(v) => encode(proto::encode(&v)),
            Response::DsuHwCfg(v) => encode(proto::encode(&v)),
            Response::DsuCounts(v) => encode(proto::encode(&v)),
            Response::DmcHwCfg(v) => encode(proto::encode(&v)),
            Response::DmcCounts(v) => encode(proto::encode(&v)),
            Response::SpeCaps(v) => encode(proto::encode(&v)),
            Response::SpeBuffer(v) => encode(proto::encode(&v)),
        }
    }

    /// Validate against the state machine and run one command.
    pub fn dispatch(&self, client: ClientId, cmd: Command) -> Result<Response> {
        let _ingress = self.ingress.lock();

        if !self.engine.is_running() {
            return Err(Error::Cancelled);
        }

        let code = cmd.code();
        {
            let mut status = self.status.lock();
            if !allowed(status.state, code) {
                trace!("{:?} rejected in state {:?}", code, status.state);
                return Err(Error::InvalidDeviceState);
            }
            if status.state != DeviceState::Idle && status.owner != Some(client) {
                return Err(Error::InvalidDeviceState);
            }
            status.current_ioctl = Some(code);
        }

        let result = self.run(client, cmd);

        self.status.lock().current_ioctl = None;
        result
    }

    fn run(&self, client: ClientId, cmd: Command) -> Result<Response> {
        match cmd {
            Command::Version => Ok(Response::Version(proto::VersionInfo::current())),
            Command::NumCores => Ok(Response::NumCores(self.engine.num_cores() as u32)),
            Command::QueryHwCfg => Ok(Response::HwCfg(self.engine.hw_cfg())),

            Command::EventsAssign(req) => {
                self.engine
                    .events_assign(req.core_bitmap, &req.events, req.kernel_mode)?;
                self.status.lock().events_assigned = true;
                Ok(Response::None)
            }
            Command::Reset(flags) => {
                self.engine.reset(flags)?;
                Ok(Response::None)
            }
            Command::Start(flags) => {
                // a session needs an explicit assignment first
                if !self.status.lock().events_assigned {
                    return Err(Error::InvalidDeviceState);
                }
                self.engine.start(flags)?;
                self.begin_session(client, DeviceState::Counting, flags, None);
                Ok(Response::None)
            }
            Command::Stop(flags) => {
                if self.state() == DeviceState::Idle {
                    return Ok(Response::None);
                }
                self.engine.stop(flags)?;
                self.end_session();
                Ok(Response::None)
            }
            Command::ReadCounting(core_bitmap) => {
                let cores = self.engine.read_counting(core_bitmap)?;
                Ok(Response::Counts(proto::ReadCountingResponse { cores }))
            }

            Command::SampleSetSrc(req) => {
                self.engine.sample_set_src(&req.sources, req.kernel_mode)?;
                self.status.lock().sample_src_set = true;
                Ok(Response::None)
            }
            Command::SampleStart => {
                if !self.status.lock().sample_src_set {
                    return Err(Error::InvalidDeviceState);
                }
                self.engine.sample_start()?;
                self.begin_session(client, DeviceState::Sampling, 0, None);
                Ok(Response::None)
            }
            Command::SampleStop => {
                if self.state() == DeviceState::Idle {
                    return Ok(Response::None);
                }
                if self.status.lock().session_flags == proto::CTL_FLAG_SPE {
                    return Err(Error::InvalidDeviceState);
                }
                self.engine.sample_stop()?;
                self.end_session();
                Ok(Response::None)
            }
            Command::SampleGet(core) => {
                let samples = self.engine.sample_get(core as usize)?;
                Ok(Response::Samples(proto::SampleGetResponse { samples }))
            }
            Command::SampleStats(core) => {
                let (generated, dropped) = self.engine.sample_stats(core as usize)?;
                Ok(Response::SampleStats(proto::SampleStatsResponse {
                    generated,
                    dropped,
                }))
            }

            Command::DsuQueryHwCfg => Ok(Response::DsuHwCfg(self.engine.dsu()?.hw_cfg())),
            Command::DsuEventsAssign(req) => {
                self.engine
                    .dsu()?
                    .assign(req.cluster_bitmap, &req.events)?;
                self.status.lock().events_assigned = true;
                Ok(Response::None)
            }
            Command::DsuReadCounting => {
                let clusters = self.engine.dsu()?.read();
                Ok(Response::DsuCounts(proto::DsuReadCountingResponse {
                    clusters,
                }))
            }

            Command::DmcQueryHwCfg => Ok(Response::DmcHwCfg(self.engine.dmc()?.hw_cfg())),
            Command::DmcEventsAssign(req) => {
                self.engine
                    .dmc()?
                    .assign(req.channel, &req.clk_events, &req.clkdiv2_events)?;
                self.status.lock().events_assigned = true;
                Ok(Response::None)
            }
            Command::DmcReadCounting => {
                let channels = self.engine.dmc()?.read();
                Ok(Response::DmcCounts(proto::DmcReadCountingResponse {
                    channels,
                }))
            }

            Command::SpeQueryCaps => Ok(Response::SpeCaps(self.engine.spe()?.caps())),
            Command::SpeStart(core) => {
                self.engine
                    .spe()?
                    .start(core as usize, self.engine.num_cores())?;
                self.begin_session(
                    client,
                    DeviceState::Sampling,
                    proto::CTL_FLAG_SPE,
                    Some(core as usize),
                );
                Ok(Response::None)
            }
            Command::SpeStop(core) => {
                if self.state() == DeviceState::Idle {
                    return Ok(Response::None);
                }
                if self.status.lock().session_flags != proto::CTL_FLAG_SPE {
                    return Err(Error::InvalidDeviceState);
                }
                self.engine
                    .spe()?
                    .stop(core as usize, self.engine.num_cores())?;
                self.end_session();
                Ok(Response::None)
            }
            Command::SpeGet(core) => {
                if self.status.lock().session_flags != proto::CTL_FLAG_SPE {
                    return Err(Error::InvalidDeviceState);
                }
                let buffer = self
                    .engine
                    .spe()?
                    .drain(core as usize, self.engine.num_cores())?;
                Ok(Response::SpeBuffer(proto::SpeGetResponse { core, buffer }))
            }
        }
    }

    fn begin_session(
        &self,
        client: ClientId,
        state: DeviceState,
        flags: u32,
        spe_core: Option<usize>,
    ) {
        let mut status = self.status.lock();
        status.state = state;
        status.owner = Some(client);
        status.session_flags = flags;
        status.spe_core = spe_core;
    }

    fn end_session(&self) {
        let mut status = self.status.lock();
        status.state = DeviceState::Idle;
        status.owner = None;
        status.session_flags = 0;
        status.spe_core = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use CommandCode::*;
        use DeviceState::*;

        // queries pass in any state
        for state in [Idle, Counting, Sampling] {
            assert!(allowed(state, Version));
            assert!(allowed(state, NumCores));
            assert!(allowed(state, QueryHwCfg));
        }

        // mutating setup requires IDLE
        for code in [EventsAssign, Reset, SampleSetSrc, Start, SampleStart] {
            assert!(allowed(Idle, code));
            assert!(!allowed(Counting, code));
            assert!(!allowed(Sampling, code));
        }

        // session continuation requires the right session
        assert!(allowed(Counting, ReadCounting));
        assert!(!allowed(Idle, ReadCounting));
        assert!(!allowed(Sampling, ReadCounting));
        assert!(allowed(Sampling, SampleGet));
        assert!(!allowed(Counting, SampleGet));

        // stop is idempotent from IDLE
        assert!(allowed(Idle, Stop));
        assert!(allowed(Counting, Stop));
        assert!(!allowed(Sampling, Stop));
        assert!(allowed(Idle, SampleStop));
        assert!(allowed(Sampling, SampleStop));
        assert!(!allowed(Counting, SampleStop));
    }
}
