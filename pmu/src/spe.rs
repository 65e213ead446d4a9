//! Statistical Profiling Extension, at the interface level.
//!
//! Presence is probed from ID_AA64DFR0.PMSVer at init, with PMBIDR and
//! PMSIDR captured for clients. The profiling buffer is drained one-shot:
//! a drain hands over whatever the unit wrote since the last drain and
//! disarms the buffer until the next one.

use pmu_protocol::SpeCaps;
use std::sync::Arc;

use crate::regs::{IdAa64Dfr0, SpeVersion};
use crate::hal::CpuId;
use crate::{Error, Result};

/// Profiling-buffer control for one core.
pub trait SpeIo: Send + Sync {
    fn enable(&self, core: usize);
    fn disable(&self, core: usize);
    /// Take the buffer contents accumulated since the previous drain.
    fn drain(&self, core: usize) -> Vec<u8>;
}

pub struct SpeUnit {
    io: Arc<dyn SpeIo>,
    version: SpeVersion,
    caps: SpeCaps,
}

impl SpeUnit {
    /// `None` when the CPU does not implement SPE; the broker then reports
    /// every SPE command as unsupported.
    pub fn probe(cpuid: &CpuId, io: Option<Arc<dyn SpeIo>>) -> Option<Self> {
        let version = IdAa64Dfr0::from_bits(cpuid.aa64dfr0).spe_version();
        if !version.implemented() {
            return None;
        }
        let io = io?;
        Some(SpeUnit {
            io,
            version,
            caps: SpeCaps {
                pms_ver: IdAa64Dfr0::from_bits(cpuid.aa64dfr0).pms_ver_field(),
                pmbidr: cpuid.pmbidr,
                pmsidr: cpuid.pmsidr,
            },
        })
    }

    pub fn version(&self) -> SpeVersion {
        self.version
    }

    pub fn caps(&self) -> SpeCaps {
        self.caps
    }

    pub fn start(&self, core: usize, num_cores: usize) -> Result<()> {
        if core >= num_cores {
            return Err(Error::InvalidParameter("core index out of range"));
        }
        self.io.enable(core);
        Ok(())
    }

    pub fn stop(&self, core: usize, num_cores: usize) -> Result<()> {
        if core >= num_cores {
            return Err(Error::InvalidParameter("core index out of range"));
        }
        self.io.disable(core);
        Ok(())
    }

    pub fn drain(&self, core: usize, num_cores: usize) -> Result<Vec<u8>> {
        if core >= num_cores {
            return Err(Error::InvalidParameter("core index out of range"));
        }
        Ok(self.io.drain(core))
    }
}
