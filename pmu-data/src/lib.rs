use std::collections::HashMap;

use lazy_static::lazy_static;
use serde::{de, Deserialize, Serialize};

/// The dedicated cycle event. It only ever binds to the cycle counter.
pub const CYCLE_EVENT_IDX: u16 = 0x11;

/// Rough grouping of architectural events, used by consumers that want to
/// present or schedule related events together.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventGroup {
    Retired,
    Speculative,
    Cycle,
    Cache,
    Tlb,
    Branch,
    Stall,
    Bus,
    Memory,
    Exception,
    Other,
}

/// Description of a single architectural PMU event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventDesc {
    pub name: String,
    pub desc: String,
    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
    pub code: u16,
    pub group: EventGroup,
}

macro_rules! armv8_events {
    ($(($code:expr, $name:ident, $group:ident, $desc:expr),)*) => {
        $(pub const $name: u16 = $code;)*

        /// Every architectural event known to this driver stack, in
        /// ascending code order.
        pub static EVENTS: &[(u16, &str, EventGroup, &str)] = &[
            $(($code, stringify!($name), EventGroup::$group, $desc),)*
        ];
    };
}

armv8_events! {
    (0x00, SW_INCR, Other, "software increment"),
    (0x01, L1I_CACHE_REFILL, Cache, "L1 instruction cache refill"),
    (0x02, L1I_TLB_REFILL, Tlb, "L1 instruction TLB refill"),
    (0x03, L1D_CACHE_REFILL, Cache, "L1 data cache refill"),
    (0x04, L1D_CACHE, Cache, "L1 data cache access"),
    (0x05, L1D_TLB_REFILL, Tlb, "L1 data TLB refill"),
    (0x06, LD_RETIRED, Retired, "load instruction architecturally executed"),
    (0x07, ST_RETIRED, Retired, "store instruction architecturally executed"),
    (0x08, INST_RETIRED, Retired, "instruction architecturally executed"),
    (0x09, EXC_TAKEN, Exception, "exception taken"),
    (0x0A, EXC_RETURN, Exception, "exception return architecturally executed"),
    (0x0B, CID_WRITE_RETIRED, Retired, "write to CONTEXTIDR architecturally executed"),
    (0x0C, PC_WRITE_RETIRED, Retired, "software change of the PC architecturally executed"),
    (0x0D, BR_IMMED_RETIRED, Branch, "immediate branch architecturally executed"),
    (0x0E, BR_RETURN_RETIRED, Branch, "function return architecturally executed"),
    (0x0F, UNALIGNED_LDST_RETIRED, Retired, "unaligned access architecturally executed"),
    (0x10, BR_MIS_PRED, Branch, "mispredicted or not predicted branch speculatively executed"),
    (0x11, CPU_CYCLES, Cycle, "processor cycle"),
    (0x12, BR_PRED, Branch, "predictable branch speculatively executed"),
    (0x13, MEM_ACCESS, Memory, "data memory access"),
    (0x14, L1I_CACHE, Cache, "L1 instruction cache access"),
    (0x15, L1D_CACHE_WB, Cache, "L1 data cache write-back"),
    (0x16, L2D_CACHE, Cache, "L2 data cache access"),
    (0x17, L2D_CACHE_REFILL, Cache, "L2 data cache refill"),
    (0x18, L2D_CACHE_WB, Cache, "L2 data cache write-back"),
    (0x19, BUS_ACCESS, Bus, "bus access"),
    (0x1A, MEMORY_ERROR, Memory, "local memory error"),
    (0x1B, INST_SPEC, Speculative, "operation speculatively executed"),
    (0x1C, TTBR_WRITE_RETIRED, Retired, "write to TTBR architecturally executed"),
    (0x1D, BUS_CYCLES, Bus, "bus cycle"),
    (0x1F, L1D_CACHE_ALLOCATE, Cache, "L1 data cache allocation without refill"),
    (0x20, L2D_CACHE_ALLOCATE, Cache, "L2 data cache allocation without refill"),
    (0x21, BR_RETIRED, Branch, "branch instruction architecturally executed"),
    (0x22, BR_MIS_PRED_RETIRED, Branch, "mispredicted branch instruction architecturally executed"),
    (0x23, STALL_FRONTEND, Stall, "no operation issued because of the frontend"),
    (0x24, STALL_BACKEND, Stall, "no operation issued because of the backend"),
    (0x25, L1D_TLB, Tlb, "L1 data TLB access"),
    (0x26, L1I_TLB, Tlb, "L1 instruction TLB access"),
    (0x27, L2I_CACHE, Cache, "L2 instruction cache access"),
    (0x28, L2I_CACHE_REFILL, Cache, "L2 instruction cache refill"),
    (0x29, L3D_CACHE_ALLOCATE, Cache, "L3 data cache allocation without refill"),
    (0x2A, L3D_CACHE_REFILL, Cache, "L3 data cache refill"),
    (0x2B, L3D_CACHE, Cache, "L3 data cache access"),
    (0x2C, L3D_CACHE_WB, Cache, "L3 data cache write-back"),
    (0x2D, L2D_TLB_REFILL, Tlb, "L2 data TLB refill"),
    (0x2E, L2I_TLB_REFILL, Tlb, "L2 instruction TLB refill"),
    (0x2F, L2D_TLB, Tlb, "L2 data TLB access"),
    (0x30, L2I_TLB, Tlb, "L2 instruction TLB access"),
    (0x31, REMOTE_ACCESS, Memory, "access to another socket in a multi-socket system"),
    (0x32, LL_CACHE, Cache, "last level cache access"),
    (0x33, LL_CACHE_MISS, Cache, "last level cache miss"),
    (0x34, DTLB_WALK, Tlb, "data TLB access with at least one translation table walk"),
    (0x35, ITLB_WALK, Tlb, "instruction TLB access with at least one translation table walk"),
    (0x36, LL_CACHE_RD, Cache, "last level cache access, read"),
    (0x37, LL_CACHE_MISS_RD, Cache, "last level cache miss, read"),
    (0x6E, STREX_PASS_SPEC, Speculative, "exclusive store speculatively executed, passed"),
    (0x6F, STREX_FAIL_SPEC, Speculative, "exclusive store speculatively executed, failed"),
    (0x70, LD_SPEC, Speculative, "load speculatively executed"),
    (0x71, ST_SPEC, Speculative, "store speculatively executed"),
    (0x72, LDST_SPEC, Speculative, "load or store speculatively executed"),
    (0x73, DP_SPEC, Speculative, "integer data-processing operation speculatively executed"),
    (0x74, ASE_SPEC, Speculative, "advanced SIMD operation speculatively executed"),
    (0x75, VFP_SPEC, Speculative, "floating-point operation speculatively executed"),
    (0x76, PC_WRITE_SPEC, Speculative, "software change of the PC speculatively executed"),
    (0x77, CRYPTO_SPEC, Speculative, "cryptographic operation speculatively executed"),
    (0x78, BR_IMMED_SPEC, Branch, "immediate branch speculatively executed"),
    (0x79, BR_RETURN_SPEC, Branch, "function return speculatively executed"),
    (0x7A, BR_INDIRECT_SPEC, Branch, "indirect branch speculatively executed"),
}

lazy_static! {
    static ref BY_CODE: HashMap<u16, &'static (u16, &'static str, EventGroup, &'static str)> =
        EVENTS.iter().map(|e| (e.0, e)).collect();
    static ref BY_NAME: HashMap<&'static str, &'static (u16, &'static str, EventGroup, &'static str)> =
        EVENTS.iter().map(|e| (e.1, e)).collect();
}

pub fn lookup_code(code: u16) -> Option<EventDesc> {
    BY_CODE.get(&code).map(|e| desc_of(e))
}

pub fn lookup_name(name: &str) -> Option<EventDesc> {
    BY_NAME.get(name).map(|e| desc_of(e))
}

/// Whether `code` names an event this stack recognises.
pub fn is_known_event(code: u16) -> bool {
    BY_CODE.contains_key(&code)
}

pub fn event_name(code: u16) -> &'static str {
    BY_CODE.get(&code).map(|e| e.1).unwrap_or("unknown")
}

pub fn all_events() -> impl Iterator<Item = EventDesc> {
    EVENTS.iter().map(desc_of)
}

fn desc_of(e: &(u16, &str, EventGroup, &str)) -> EventDesc {
    EventDesc {
        name: e.1.to_string(),
        desc: e.3.to_string(),
        code: e.0,
        group: e.2,
    }
}

fn serialize_hex<S>(v: &u16, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let string = format!("0x{:X}", v);
    serializer.serialize_str(&string)
}

fn deserialize_hex<'a, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'a>,
{
    struct Visitor;

    impl de::Visitor<'_> for Visitor {
        type Value = u16;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string containing a hexadecimal number starting with '0x'")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if !v.starts_with("0x") {
                return Err(E::custom("does not start with '0x'"));
            }

            let hex_only = &v[2..];
            match u16::from_str_radix(hex_only, 16) {
                Ok(value) => Ok(value),
                Err(err) => Err(E::custom(err)),
            }
        }
    }

    deserializer.deserialize_str(Visitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_event_is_distinguished() {
        assert_eq!(CYCLE_EVENT_IDX, CPU_CYCLES);
        let desc = lookup_code(CYCLE_EVENT_IDX).unwrap();
        assert_eq!(desc.name, "CPU_CYCLES");
        assert_eq!(desc.group, EventGroup::Cycle);
    }

    #[test]
    fn lookup_by_name_round_trips() {
        for desc in all_events() {
            let by_name = lookup_name(&desc.name).unwrap();
            assert_eq!(by_name.code, desc.code);
        }
    }

    #[test]
    fn codes_are_unique_and_sorted() {
        let mut prev = None;
        for (code, ..) in EVENTS {
            if let Some(p) = prev {
                assert!(*code > p, "event 0x{code:X} out of order");
            }
            prev = Some(*code);
        }
    }

    #[test]
    fn event_desc_parses_from_json() {
        let json = r#"
        {
            "name": "INST_RETIRED",
            "desc": "instruction architecturally executed",
            "code": "0x8",
            "group": "retired"
        }
        "#;

        let desc: EventDesc = serde_json::from_str(json).expect("failed to parse event json");
        assert_eq!(desc.code, INST_RETIRED);

        let back = serde_json::to_string(&desc).unwrap();
        assert!(back.contains("0x8"));
    }

    #[test]
    fn unknown_codes_are_rejected() {
        assert!(!is_known_event(0x3FF));
        assert!(lookup_code(0x3FF).is_none());
        assert_eq!(event_name(0x3FF), "unknown");
    }
}
