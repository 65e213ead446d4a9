//! Typed views of the ARMv8 performance-monitor system registers.
//!
//! Each wrapper mirrors the architectural bitfield layout of one register;
//! the raw bits travel through [`crate::hal::RegisterIo`] untouched, and the
//! accessors here are the only place the field offsets appear.

use bitflags::bitflags;

/// Bit selecting the dedicated cycle counter in enable/overflow bitmaps.
pub const CYCLE_COUNTER_BIT: u32 = 1 << 31;

/// Bits selecting general-purpose counters in enable/overflow bitmaps.
pub const GP_COUNTER_MASK: u32 = !CYCLE_COUNTER_BIT;

pub const fn counter_bit(slot: u8) -> u32 {
    1 << slot
}

bitflags! {
    /// Exception-level filter bits of PMEVTYPER / PMCCFILTR.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FilterFlags: u32 {
        /// P bit: do not count at EL1.
        const EXCLUDE_EL1 = 1 << 31;
        /// U bit: do not count at EL0.
        const EXCLUDE_EL0 = 1 << 30;
    }
}

/// PMCR_EL0, Performance Monitors Control Register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pmcr(u64);

impl Pmcr {
    const E: u64 = 1 << 0;
    const P: u64 = 1 << 1;
    const C: u64 = 1 << 2;
    const LC: u64 = 1 << 6;
    const LP: u64 = 1 << 7;
    const N_SHIFT: u64 = 11;
    const N_MASK: u64 = 0x1f;

    pub const fn from_bits(bits: u64) -> Self {
        Pmcr(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn enabled(self) -> bool {
        self.0 & Self::E != 0
    }

    pub fn set_enable(&mut self, on: bool) {
        if on {
            self.0 |= Self::E;
        } else {
            self.0 &= !Self::E;
        }
    }

    /// P bit, write-only: resets all event counters to zero.
    pub fn set_event_counter_reset(&mut self) {
        self.0 |= Self::P;
    }

    pub const fn event_counter_reset(self) -> bool {
        self.0 & Self::P != 0
    }

    /// C bit, write-only: resets the cycle counter to zero.
    pub fn set_cycle_counter_reset(&mut self) {
        self.0 |= Self::C;
    }

    pub const fn cycle_counter_reset(self) -> bool {
        self.0 & Self::C != 0
    }

    /// LC bit: cycle-counter overflow on the 64-bit boundary instead of
    /// the low 32 bits.
    pub const fn long_cycle(self) -> bool {
        self.0 & Self::LC != 0
    }

    pub fn set_long_cycle(&mut self, on: bool) {
        if on {
            self.0 |= Self::LC;
        } else {
            self.0 &= !Self::LC;
        }
    }

    /// LP bit (FEAT_PMUv3p5): 64-bit event counters.
    pub const fn long_events(self) -> bool {
        self.0 & Self::LP != 0
    }

    pub fn set_long_events(&mut self, on: bool) {
        if on {
            self.0 |= Self::LP;
        } else {
            self.0 &= !Self::LP;
        }
    }

    /// N field: number of general-purpose event counters implemented.
    pub const fn n(self) -> u8 {
        ((self.0 >> Self::N_SHIFT) & Self::N_MASK) as u8
    }
}

/// PMEVTYPER<n>_EL0 / PMCCFILTR_EL0 contents: an event identifier plus the
/// exception-level filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Evtype(u32);

impl Evtype {
    const EVENT_MASK: u32 = 0xffff;

    pub fn new(event: u16, filter: FilterFlags) -> Self {
        Evtype(event as u32 | filter.bits())
    }

    pub const fn from_bits(bits: u32) -> Self {
        Evtype(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn event(self) -> u16 {
        (self.0 & Self::EVENT_MASK) as u16
    }

    pub fn filter(self) -> FilterFlags {
        FilterFlags::from_bits_truncate(self.0)
    }
}

/// Architected PMU feature levels, from ID_AA64DFR0_EL1.PMUVer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PmuVersion {
    NotImplemented,
    V3,
    V3p1,
    V3p4,
    V3p5,
    V3p7,
    V3p8,
}

impl PmuVersion {
    pub fn from_field(field: u8) -> Self {
        match field {
            0b0001 => PmuVersion::V3,
            0b0100 => PmuVersion::V3p1,
            0b0101 => PmuVersion::V3p4,
            0b0110 => PmuVersion::V3p5,
            0b0111 => PmuVersion::V3p7,
            0b1000 => PmuVersion::V3p8,
            _ => PmuVersion::NotImplemented,
        }
    }

    /// FEAT_PMUv3p5 introduced 64-bit event counters.
    pub fn supports_long_counters(self) -> bool {
        self >= PmuVersion::V3p5
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PmuVersion::NotImplemented => "not implemented",
            PmuVersion::V3 => "FEAT_PMUv3",
            PmuVersion::V3p1 => "FEAT_PMUv3p1",
            PmuVersion::V3p4 => "FEAT_PMUv3p4",
            PmuVersion::V3p5 => "FEAT_PMUv3p5",
            PmuVersion::V3p7 => "FEAT_PMUv3p7",
            PmuVersion::V3p8 => "FEAT_PMUv3p8",
        }
    }
}

/// Statistical Profiling Extension feature levels, from
/// ID_AA64DFR0_EL1.PMSVer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpeVersion {
    NotImplemented,
    V1,
    V1p1,
    V1p2,
    V1p3,
}

impl SpeVersion {
    pub fn from_field(field: u8) -> Self {
        match field {
            0b001 => SpeVersion::V1,
            0b010 => SpeVersion::V1p1,
            0b011 => SpeVersion::V1p2,
            0b100 => SpeVersion::V1p3,
            _ => SpeVersion::NotImplemented,
        }
    }

    pub fn implemented(self) -> bool {
        self != SpeVersion::NotImplemented
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SpeVersion::NotImplemented => "not implemented",
            SpeVersion::V1 => "FEAT_SPE",
            SpeVersion::V1p1 => "FEAT_SPEv1p1",
            SpeVersion::V1p2 => "FEAT_SPEv1p2",
            SpeVersion::V1p3 => "FEAT_SPEv1p3",
        }
    }
}

/// ID_AA64DFR0_EL1, AArch64 Debug Feature Register 0.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IdAa64Dfr0(u64);

impl IdAa64Dfr0 {
    pub const fn from_bits(bits: u64) -> Self {
        IdAa64Dfr0(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn pmu_ver_field(self) -> u8 {
        ((self.0 >> 8) & 0xf) as u8
    }

    pub const fn pms_ver_field(self) -> u8 {
        ((self.0 >> 32) & 0xf) as u8
    }

    pub fn pmu_version(self) -> PmuVersion {
        PmuVersion::from_field(self.pmu_ver_field())
    }

    pub fn spe_version(self) -> SpeVersion {
        SpeVersion::from_field(self.pms_ver_field())
    }
}

/// MIDR_EL1, Main ID Register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Midr(u64);

impl Midr {
    pub const fn from_bits(bits: u64) -> Self {
        Midr(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn implementer(self) -> u8 {
        ((self.0 >> 24) & 0xff) as u8
    }

    pub const fn variant(self) -> u8 {
        ((self.0 >> 20) & 0xf) as u8
    }

    pub const fn architecture(self) -> u8 {
        ((self.0 >> 16) & 0xf) as u8
    }

    pub const fn part_num(self) -> u16 {
        ((self.0 >> 4) & 0xfff) as u16
    }

    pub const fn revision(self) -> u8 {
        (self.0 & 0xf) as u8
    }
}

/// PMBIDR_EL1, Profiling Buffer ID Register (FEAT_SPE).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pmbidr(u64);

impl Pmbidr {
    pub const fn from_bits(bits: u64) -> Self {
        Pmbidr(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Align field: log2 of the minimum buffer alignment.
    pub const fn align(self) -> u8 {
        (self.0 & 0xf) as u8
    }

    /// P bit: profiling prohibited at the current exception level.
    pub const fn prohibited(self) -> bool {
        self.0 & (1 << 4) != 0
    }
}

/// PMSIDR_EL1, Sampling Profiling ID Register (FEAT_SPE).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pmsidr(u64);

impl Pmsidr {
    pub const fn from_bits(bits: u64) -> Self {
        Pmsidr(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Interval field: log2-encoded minimum sampling interval.
    pub const fn min_interval_field(self) -> u8 {
        ((self.0 >> 8) & 0xf) as u8
    }

    /// FE bit: filtering by event is supported.
    pub const fn filter_by_event(self) -> bool {
        self.0 & 1 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pmcr_round_trips_canonical_pattern() {
        // E | LC set, 6 counters implemented
        let raw = 0x1u64 | (1 << 6) | (6 << 11);
        let pmcr = Pmcr::from_bits(raw);
        assert!(pmcr.enabled());
        assert!(pmcr.long_cycle());
        assert!(!pmcr.long_events());
        assert_eq!(pmcr.n(), 6);
        assert_eq!(pmcr.bits(), raw);

        let mut pmcr = pmcr;
        pmcr.set_enable(false);
        pmcr.set_event_counter_reset();
        pmcr.set_cycle_counter_reset();
        assert_eq!(pmcr.bits(), (1 << 6) | (6 << 11) | (1 << 1) | (1 << 2));
    }

    #[test]
    fn evtype_packs_event_and_filter() {
        let ty = Evtype::new(0x22, FilterFlags::EXCLUDE_EL1);
        assert_eq!(ty.bits(), 0x8000_0022);
        assert_eq!(ty.event(), 0x22);
        assert_eq!(ty.filter(), FilterFlags::EXCLUDE_EL1);

        let both = Evtype::new(0x08, FilterFlags::EXCLUDE_EL1 | FilterFlags::EXCLUDE_EL0);
        assert_eq!(both.bits(), 0xC000_0008);
    }

    #[test]
    fn dfr0_decodes_feature_levels() {
        let dfr0 = IdAa64Dfr0::from_bits((0b0110 << 8) | (0b010u64 << 32));
        assert_eq!(dfr0.pmu_version(), PmuVersion::V3p5);
        assert!(dfr0.pmu_version().supports_long_counters());
        assert_eq!(dfr0.spe_version(), SpeVersion::V1p1);

        let v3 = IdAa64Dfr0::from_bits(0b0001 << 8);
        assert_eq!(v3.pmu_version(), PmuVersion::V3);
        assert!(!v3.pmu_version().supports_long_counters());
        assert!(!v3.spe_version().implemented());
    }

    #[test]
    fn midr_decodes_neoverse_n1() {
        let midr = Midr::from_bits(0x414F_D0C1);
        assert_eq!(midr.implementer(), 0x41);
        assert_eq!(midr.variant(), 0x4);
        assert_eq!(midr.architecture(), 0xf);
        assert_eq!(midr.part_num(), 0xD0C);
        assert_eq!(midr.revision(), 0x1);
    }

    #[test]
    fn counter_bits() {
        assert_eq!(counter_bit(0), 1);
        assert_eq!(counter_bit(5), 0b10_0000);
        assert_eq!(counter_bit(31), CYCLE_COUNTER_BIT);
        assert_eq!(GP_COUNTER_MASK & CYCLE_COUNTER_BIT, 0);
    }
}
