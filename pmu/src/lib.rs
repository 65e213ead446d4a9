//! Kernel-side AArch64 PMU engine.
//!
//! The engine owns the hardware-counter reservation, one deferred context
//! per core, the performance-monitor interrupt handler and the peripheral
//! monitoring units (DSU, DMC, SPE). Clients drive it through
//! [`CommandBroker`], whose command surface is defined in `pmu-protocol`.
//!
//! Hardware access goes through the [`hal`] seams; [`driver::emu`] provides
//! a deterministic software model of the machine, which is what the test
//! suite runs against.

pub mod broker;
mod counting;
pub mod dmc;
pub mod driver;
pub mod dsu;
pub mod engine;
pub mod exec;
pub mod hal;
pub mod pool;
pub mod regs;
mod sampling;
mod sched;
pub mod spe;
pub mod state;

pub use broker::{ClientId, Command, CommandBroker, DeviceState, Response};
pub use engine::{Engine, EngineConfig};

use thiserror::Error as ThisError;

/// The dedicated cycle counter's slot index in every counter bitmap.
pub const CYCLE_COUNTER_IDX: u8 = 31;

/// Fixed capacity of each core's sample ring.
pub const SAMPLE_CHAIN_BUFFER_SIZE: usize = 128;

/// Architectural ceiling on general-purpose counters.
pub const AARCH64_MAX_HWC: usize = 31;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("hardware counters unavailable or exhausted")]
    InsufficientResources,
    #[error("operation not permitted in the current device state")]
    InvalidDeviceState,
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("not supported on this CPU: {0}")]
    Unsupported(&'static str),
    #[error("driver is shutting down")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The host status code this error surfaces as on the command boundary.
    pub fn status_code(&self) -> u32 {
        match self {
            Error::InsufficientResources => pmu_protocol::STATUS_INSUFFICIENT_RESOURCES,
            Error::InvalidDeviceState => pmu_protocol::STATUS_INVALID_DEVICE_STATE,
            Error::InvalidParameter(_) => pmu_protocol::STATUS_INVALID_PARAMETER,
            Error::Unsupported(_) => pmu_protocol::STATUS_NOT_SUPPORTED,
            Error::Cancelled => pmu_protocol::STATUS_CANCELLED,
            Error::Internal(_) => pmu_protocol::STATUS_INTERNAL_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
