//! System-register backend for AArch64 Windows hosts.
//!
//! Every accessor is an `mrs`/`msr` pair on the current core; the indexed
//! event-count and event-type registers go through the PMSELR window. The
//! host-side collaborator (counter arbitration, the profile-interrupt hook)
//! is bound by the platform driver scaffolding and is not part of this
//! module.

use crate::hal::{CpuId, RegisterIo};
use crate::regs::{Evtype, Pmcr};
use crate::CYCLE_COUNTER_IDX;

macro_rules! mrs {
    ($reg:literal) => {{
        let value: u64;
        unsafe {
            core::arch::asm!(
                concat!("mrs {value}, ", $reg),
                value = out(reg) value,
                options(nomem, nostack, preserves_flags),
            );
        }
        value
    }};
}

macro_rules! msr {
    ($reg:literal, $value:expr) => {{
        let value: u64 = $value;
        unsafe {
            core::arch::asm!(
                concat!("msr ", $reg, ", {value}"),
                value = in(reg) value,
                options(nomem, nostack, preserves_flags),
            );
        }
    }};
}

fn isb() {
    unsafe {
        core::arch::asm!("isb sy", options(nostack, preserves_flags));
    }
}

/// Direct system-register access on the executing core.
pub struct MsrRegisterIo;

impl MsrRegisterIo {
    fn select(&self, slot: u8) {
        msr!("PMSELR_EL0", slot as u64);
        isb();
    }
}

impl RegisterIo for MsrRegisterIo {
    fn read_pmcr(&self) -> Pmcr {
        Pmcr::from_bits(mrs!("PMCR_EL0"))
    }

    fn write_pmcr(&self, pmcr: Pmcr) {
        msr!("PMCR_EL0", pmcr.bits());
        isb();
    }

    fn counter_enable_set(&self, mask: u32) {
        msr!("PMCNTENSET_EL0", mask as u64);
        isb();
    }

    fn counter_enable_clear(&self, mask: u32) {
        msr!("PMCNTENCLR_EL0", mask as u64);
        isb();
    }

    fn take_overflow_flags(&self) -> u32 {
        let flags = mrs!("PMOVSCLR_EL0") as u32;
        msr!("PMOVSCLR_EL0", flags as u64);
        isb();
        flags
    }

    fn intr_enable_set(&self, mask: u32) {
        msr!("PMINTENSET_EL1", mask as u64);
        isb();
    }

    fn intr_enable_clear(&self, mask: u32) {
        msr!("PMINTENCLR_EL1", mask as u64);
        isb();
    }

    fn write_evtype(&self, slot: u8, evtype: Evtype) {
        if slot == CYCLE_COUNTER_IDX {
            msr!("PMCCFILTR_EL0", evtype.bits() as u64);
        } else {
            self.select(slot);
            msr!("PMXEVTYPER_EL0", evtype.bits() as u64);
        }
        isb();
    }

    fn read_counter(&self, slot: u8) -> u64 {
        if slot == CYCLE_COUNTER_IDX {
            mrs!("PMCCNTR_EL0")
        } else {
            self.select(slot);
            mrs!("PMXEVCNTR_EL0")
        }
    }

    fn write_counter(&self, slot: u8, value: u64) {
        if slot == CYCLE_COUNTER_IDX {
            msr!("PMCCNTR_EL0", value);
        } else {
            self.select(slot);
            msr!("PMXEVCNTR_EL0", value);
        }
        isb();
    }

    fn read_id(&self) -> CpuId {
        CpuId {
            dfr0: mrs!("ID_DFR0_EL1"),
            midr: mrs!("MIDR_EL1"),
            aa64dfr0: mrs!("ID_AA64DFR0_EL1"),
            pmbidr: mrs!("PMBIDR_EL1"),
            pmsidr: mrs!("PMSIDR_EL1"),
        }
    }

    fn isb(&self) {
        isb();
    }
}
