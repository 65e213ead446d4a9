//! Wire contract between the PMU driver engine and user-space clients.
//!
//! Every command travels as `{code, input blob, output blob}`. The blobs are
//! bincode-encoded payload structs defined here, so both sides of the
//! boundary share one definition of the surface.

use bincode::{Decode, Encode};
use thiserror::Error;

pub const MAJOR: u16 = 1;
pub const MINOR: u16 = 0;
pub const PATCH: u16 = 0;

/// Unit-class selection bits carried by RESET/START/STOP.
pub const CTL_FLAG_CORE: u32 = 1 << 0;
pub const CTL_FLAG_DSU: u32 = 1 << 1;
pub const CTL_FLAG_DMC: u32 = 1 << 2;
pub const CTL_FLAG_SPE: u32 = 1 << 3;

/// Host status codes the broker maps engine errors onto.
pub const STATUS_SUCCESS: u32 = 0x0000_0000;
pub const STATUS_INSUFFICIENT_RESOURCES: u32 = 0xC000_009A;
pub const STATUS_INVALID_DEVICE_STATE: u32 = 0xC000_0184;
pub const STATUS_INVALID_PARAMETER: u32 = 0xC000_000D;
pub const STATUS_NOT_SUPPORTED: u32 = 0xC000_00BB;
pub const STATUS_CANCELLED: u32 = 0xC000_0120;
pub const STATUS_INTERNAL_ERROR: u32 = 0xC000_00E5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandCode {
    Version = 0x100,
    NumCores = 0x101,
    QueryHwCfg = 0x102,
    EventsAssign = 0x110,
    Reset = 0x111,
    Start = 0x112,
    Stop = 0x113,
    ReadCounting = 0x114,
    SampleSetSrc = 0x120,
    SampleStart = 0x121,
    SampleStop = 0x122,
    SampleGet = 0x123,
    SampleStats = 0x124,
    DsuQueryHwCfg = 0x130,
    DsuEventsAssign = 0x131,
    DsuReadCounting = 0x132,
    DmcQueryHwCfg = 0x140,
    DmcEventsAssign = 0x141,
    DmcReadCounting = 0x142,
    SpeQueryCaps = 0x150,
    SpeStart = 0x151,
    SpeStop = 0x152,
    SpeGet = 0x153,
}

impl TryFrom<u32> for CommandCode {
    type Error = ProtocolError;

    fn try_from(raw: u32) -> Result<Self, ProtocolError> {
        use CommandCode::*;
        let code = match raw {
            0x100 => Version,
            0x101 => NumCores,
            0x102 => QueryHwCfg,
            0x110 => EventsAssign,
            0x111 => Reset,
            0x112 => Start,
            0x113 => Stop,
            0x114 => ReadCounting,
            0x120 => SampleSetSrc,
            0x121 => SampleStart,
            0x122 => SampleStop,
            0x123 => SampleGet,
            0x124 => SampleStats,
            0x130 => DsuQueryHwCfg,
            0x131 => DsuEventsAssign,
            0x132 => DsuReadCounting,
            0x140 => DmcQueryHwCfg,
            0x141 => DmcEventsAssign,
            0x142 => DmcReadCounting,
            0x150 => SpeQueryCaps,
            0x151 => SpeStart,
            0x152 => SpeStop,
            0x153 => SpeGet,
            other => return Err(ProtocolError::UnknownCommand(other)),
        };
        Ok(code)
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown command code 0x{0:X}")]
    UnknownCommand(u32),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode payload: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("trailing bytes after payload")]
    TrailingBytes,
}

#[derive(Encode, Decode, Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl VersionInfo {
    pub fn current() -> Self {
        VersionInfo {
            major: MAJOR,
            minor: MINOR,
            patch: PATCH,
        }
    }
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct HwCfg {
    pub pmu_ver: u8,
    pub aa64_pmu_ver: u8,
    pub aa64_pms_ver: u8,
    pub num_gpc: u8,
    pub free_gpc: u8,
    pub cycle_counter_supported: bool,
    pub midr: u64,
    /// Permutation of logical counter indices onto physical slots; the last
    /// entry is the cycle counter mapping onto itself.
    pub counter_idx_map: Vec<u8>,
}

#[derive(Encode, Decode, Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventSpec {
    pub id: u16,
    /// Raw PMXEVTYPER filter word; bit 31 excludes EL1, bit 30 excludes EL0.
    pub filter: u32,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct EventsAssignRequest {
    pub core_bitmap: u64,
    pub kernel_mode: bool,
    pub events: Vec<EventSpec>,
}

#[derive(Encode, Decode, Clone, Copy, Debug)]
pub struct CtlRequest {
    pub flags: u32,
}

#[derive(Encode, Decode, Clone, Copy, Debug)]
pub struct ReadCountingRequest {
    pub core_bitmap: u64,
}

#[derive(Encode, Decode, Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterValue {
    pub event_id: u16,
    pub value: u64,
    pub scheduled_ticks: u64,
    pub total_ticks: u64,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct CoreCounts {
    pub core: u32,
    pub counts: Vec<CounterValue>,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct ReadCountingResponse {
    pub cores: Vec<CoreCounts>,
}

#[derive(Encode, Decode, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleSource {
    pub event_id: u16,
    /// Events between overflows; zero disables sampling on this source.
    pub interval: u32,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct SampleSetSrcRequest {
    pub kernel_mode: bool,
    pub sources: Vec<SampleSource>,
}

#[derive(Encode, Decode, Clone, Copy, Debug)]
pub struct SampleRequest {
    pub core: u32,
}

#[derive(Encode, Decode, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleRecord {
    pub pc: u64,
    pub lr: u64,
    pub ov_flags: u64,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct SampleGetResponse {
    pub samples: Vec<SampleRecord>,
}

#[derive(Encode, Decode, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleStatsResponse {
    pub generated: u64,
    pub dropped: u64,
}

#[derive(Encode, Decode, Clone, Copy, Debug)]
pub struct DsuHwCfg {
    pub num_clusters: u16,
    pub cluster_size: u16,
    pub num_gpc: u8,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct DsuEventsAssignRequest {
    pub cluster_bitmap: u64,
    pub events: Vec<EventSpec>,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct DsuReadCountingResponse {
    pub clusters: Vec<CoreCounts>,
}

#[derive(Encode, Decode, Clone, Copy, Debug)]
pub struct DmcHwCfg {
    pub num_channels: u8,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct DmcEventsAssignRequest {
    pub channel: u8,
    pub clk_events: Vec<EventSpec>,
    pub clkdiv2_events: Vec<EventSpec>,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct DmcCounts {
    pub channel: u8,
    pub clk: Vec<CounterValue>,
    pub clkdiv2: Vec<CounterValue>,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct DmcReadCountingResponse {
    pub channels: Vec<DmcCounts>,
}

#[derive(Encode, Decode, Clone, Copy, Debug)]
pub struct SpeCaps {
    pub pms_ver: u8,
    pub pmbidr: u64,
    pub pmsidr: u64,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct SpeGetResponse {
    pub core: u32,
    pub buffer: Vec<u8>,
}

pub fn encode<T: Encode>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(bincode::encode_to_vec(value, bincode::config::standard())?)
}

pub fn decode<T: Decode<()>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, read) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
    if read != bytes.len() {
        return Err(ProtocolError::TrailingBytes);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes_round_trip() {
        for raw in [0x100u32, 0x114, 0x124, 0x132, 0x142, 0x153] {
            let code = CommandCode::try_from(raw).unwrap();
            assert_eq!(code as u32, raw);
        }
        assert!(CommandCode::try_from(0xDEAD).is_err());
    }

    #[test]
    fn assign_request_round_trips() {
        let req = EventsAssignRequest {
            core_bitmap: 0b1011,
            kernel_mode: false,
            events: vec![
                EventSpec {
                    id: 0x11,
                    filter: 1 << 31,
                },
                EventSpec {
                    id: 0x08,
                    filter: 1 << 31,
                },
            ],
        };

        let bytes = encode(&req).unwrap();
        let back: EventsAssignRequest = decode(&bytes).unwrap();
        assert_eq!(back.core_bitmap, req.core_bitmap);
        assert_eq!(back.events, req.events);
    }

    #[test]
    fn trailing_bytes_are_an_error() {
        let mut bytes = encode(&VersionInfo::current()).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode::<VersionInfo>(&bytes),
            Err(ProtocolError::TrailingBytes)
        ));
    }
}
