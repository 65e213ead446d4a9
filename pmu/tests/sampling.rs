//! Overflow-driven sampling scenarios: capture, reload, drop accounting.

use std::sync::Arc;

use pmu::driver::emu::EmuHw;
use pmu::hal::TrapFrame;
use pmu::{Engine, EngineConfig, SAMPLE_CHAIN_BUFFER_SIZE};
use pmu_protocol::SampleSource;

fn make_engine(hw: &Arc<EmuHw>) -> Arc<Engine> {
    let _ = env_logger::builder().is_test(true).try_init();
    Engine::new(hw.host(), hw.regio(), EngineConfig::default()).expect("engine init")
}

fn src(event_id: u16, interval: u32) -> SampleSource {
    SampleSource { event_id, interval }
}

#[test]
fn samples_capture_pc_and_lr() {
    let hw = EmuHw::new(1, 6);
    let engine = make_engine(&hw);

    engine
        .sample_set_src(&[src(pmu_data::BR_MIS_PRED_RETIRED, 100)], false)
        .unwrap();
    engine.sample_start().unwrap();

    let frame = TrapFrame {
        pc: 0x0000_7FF6_1234_5678,
        lr: 0x0000_7FF6_1234_9ABC,
    };
    // interval + 1 events wrap the reloaded counter
    hw.tick_with_frame(0, pmu_data::BR_MIS_PRED_RETIRED, 101, frame);

    engine.sample_stop().unwrap();

    let samples = engine.sample_get(0).unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].pc, frame.pc);
    assert_eq!(samples[0].lr, frame.lr);
    // the first granted counter on a clean machine is physical slot 0
    assert_eq!(samples[0].ov_flags, 1);

    let (generated, dropped) = engine.sample_stats(0).unwrap();
    assert_eq!(generated, 1);
    assert_eq!(dropped, 0);
}

#[test]
fn counter_reloads_after_each_sample() {
    let hw = EmuHw::new(1, 6);
    let engine = make_engine(&hw);

    engine
        .sample_set_src(&[src(pmu_data::INST_RETIRED, 100)], false)
        .unwrap();
    engine.sample_start().unwrap();

    // a full interval does not overflow the reloaded counter...
    hw.tick(0, pmu_data::INST_RETIRED, 100);
    assert!(engine.sample_get(0).unwrap().is_empty());

    // ...one more event does
    hw.tick(0, pmu_data::INST_RETIRED, 1);
    assert_eq!(engine.sample_get(0).unwrap().len(), 1);

    // and the ISR reload restores the same period
    hw.tick(0, pmu_data::INST_RETIRED, 100);
    assert!(engine.sample_get(0).unwrap().is_empty());
    hw.tick(0, pmu_data::INST_RETIRED, 1);
    assert_eq!(engine.sample_get(0).unwrap().len(), 1);

    engine.sample_stop().unwrap();
}

#[test]
fn full_ring_drops_and_accounts() {
    let hw = EmuHw::new(1, 6);
    let engine = make_engine(&hw);

    engine
        .sample_set_src(&[src(pmu_data::BR_MIS_PRED_RETIRED, 100)], false)
        .unwrap();
    engine.sample_start().unwrap();

    // one more overflow than the ring can hold; the dropped one is not
    // reloaded, so the counter stays far from its next wrap
    for _ in 0..SAMPLE_CHAIN_BUFFER_SIZE as u64 + 1 {
        hw.tick(0, pmu_data::BR_MIS_PRED_RETIRED, 101);
    }

    engine.sample_stop().unwrap();

    let (generated, dropped) = engine.sample_stats(0).unwrap();
    let drained = engine.sample_get(0).unwrap().len() as u64;

    assert_eq!(generated, SAMPLE_CHAIN_BUFFER_SIZE as u64 + 1);
    assert_eq!(drained, SAMPLE_CHAIN_BUFFER_SIZE as u64);
    assert_eq!(dropped, 1);
    assert!(generated >= dropped + drained);

    // the drain rewound the ring; a fresh session fills it again
    engine.sample_start().unwrap();
    hw.tick(0, pmu_data::BR_MIS_PRED_RETIRED, 101);
    engine.sample_stop().unwrap();
    assert_eq!(engine.sample_get(0).unwrap().len(), 1);
}

#[test]
fn cycle_counter_samples_through_slot_31() {
    let hw = EmuHw::new(1, 6);
    let engine = make_engine(&hw);

    let interval = 1_000;
    engine
        .sample_set_src(&[src(pmu_data::CYCLE_EVENT_IDX, interval)], false)
        .unwrap();
    engine.sample_start().unwrap();

    // the reload writes 0xFFFFFFFF - interval into the low word
    assert_eq!(hw.counter(0, 31), (0xFFFF_FFFFu32 - interval) as u64);

    hw.tick_cycles(0, interval as u64 + 1);

    engine.sample_stop().unwrap();

    let samples = engine.sample_get(0).unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].ov_flags, 1 << 31);
}

#[test]
fn multiple_sources_share_one_ring() {
    let hw = EmuHw::new(1, 6);
    let engine = make_engine(&hw);

    engine
        .sample_set_src(
            &[
                src(pmu_data::CYCLE_EVENT_IDX, 10_000),
                src(pmu_data::BR_MIS_PRED_RETIRED, 100),
            ],
            false,
        )
        .unwrap();
    engine.sample_start().unwrap();

    hw.tick(0, pmu_data::BR_MIS_PRED_RETIRED, 101);
    hw.tick_cycles(0, 10_001);
    hw.tick(0, pmu_data::BR_MIS_PRED_RETIRED, 101);

    engine.sample_stop().unwrap();

    let samples = engine.sample_get(0).unwrap();
    assert_eq!(samples.len(), 3);
    // per-core ordering follows capture order
    assert_eq!(samples[0].ov_flags, 1);
    assert_eq!(samples[1].ov_flags, 1 << 31);
    assert_eq!(samples[2].ov_flags, 1);
}

#[test]
fn sampling_does_not_capture_once_stopped() {
    let hw = EmuHw::new(1, 6);
    let engine = make_engine(&hw);

    engine
        .sample_set_src(&[src(pmu_data::INST_RETIRED, 50)], false)
        .unwrap();
    engine.sample_start().unwrap();
    hw.tick(0, pmu_data::INST_RETIRED, 51);
    engine.sample_stop().unwrap();

    hw.tick(0, pmu_data::INST_RETIRED, 51);

    assert_eq!(engine.sample_get(0).unwrap().len(), 1);
    let (generated, _) = engine.sample_stats(0).unwrap();
    assert_eq!(generated, 1);
}

#[test]
fn set_src_validates_inputs() {
    let hw = EmuHw::new(1, 2);
    let engine = make_engine(&hw);

    // zero interval
    assert!(engine
        .sample_set_src(&[src(pmu_data::INST_RETIRED, 0)], false)
        .is_err());
    // unknown event
    assert!(engine.sample_set_src(&[src(0x3FF, 100)], false).is_err());
    // no sources
    assert!(engine.sample_set_src(&[], false).is_err());
    // more general sources than free counters
    assert!(engine
        .sample_set_src(
            &[
                src(pmu_data::INST_RETIRED, 100),
                src(pmu_data::L1D_CACHE, 100),
                src(pmu_data::BR_RETIRED, 100),
            ],
            false,
        )
        .is_err());
}
