//! Command-surface scenarios: the state machine, the raw blob contract,
//! the peripheral units and driver teardown.

use std::sync::Arc;
use std::time::Duration;

use pmu::driver::emu::{EmuDmc, EmuDsu, EmuHw, EmuSpe};
use pmu::dmc::DmcDomain;
use pmu::{Command, CommandBroker, DeviceState, Engine, EngineConfig, Response};
use pmu_protocol::{self as proto, CommandCode, EventSpec, SampleSource, CTL_FLAG_CORE};

fn make_broker(hw: &Arc<EmuHw>) -> CommandBroker {
    let _ = env_logger::builder().is_test(true).try_init();
    let engine = Engine::new(hw.host(), hw.regio(), EngineConfig::default()).expect("engine init");
    CommandBroker::new(engine)
}

fn assign_cmd(core_bitmap: u64, ids: &[u16]) -> Command {
    Command::EventsAssign(proto::EventsAssignRequest {
        core_bitmap,
        kernel_mode: false,
        events: ids.iter().map(|&id| EventSpec { id, filter: 0 }).collect(),
    })
}

#[test]
fn queries_work_in_any_state() {
    let hw = EmuHw::new(2, 4);
    let broker = make_broker(&hw);
    let client = broker.open().unwrap();

    match broker.dispatch(client, Command::Version).unwrap() {
        Response::Version(v) => assert_eq!(v, proto::VersionInfo::current()),
        _ => panic!("expected version response"),
    }
    match broker.dispatch(client, Command::NumCores).unwrap() {
        Response::NumCores(n) => assert_eq!(n, 2),
        _ => panic!("expected core count"),
    }
    match broker.dispatch(client, Command::QueryHwCfg).unwrap() {
        Response::HwCfg(cfg) => {
            assert_eq!(cfg.num_gpc, 4);
            assert_eq!(cfg.free_gpc, 4);
            assert!(cfg.cycle_counter_supported);
            assert_eq!(cfg.counter_idx_map, vec![0, 1, 2, 3, 31]);
        }
        _ => panic!("expected hw config"),
    }

    broker.close(client);
}

#[test]
fn start_without_assign_is_rejected_and_enables_nothing() {
    let hw = EmuHw::new(1, 4);
    let broker = make_broker(&hw);
    let client = broker.open().unwrap();

    let err = broker
        .dispatch(client, Command::Start(CTL_FLAG_CORE))
        .unwrap_err();
    assert_eq!(err.status_code(), proto::STATUS_INVALID_DEVICE_STATE);
    assert_eq!(hw.enabled_mask(0), 0);
    assert_eq!(broker.state(), DeviceState::Idle);

    broker.close(client);
}

#[test]
fn counting_session_walks_the_state_machine() {
    let hw = EmuHw::new(1, 4);
    let broker = make_broker(&hw);
    let client = broker.open().unwrap();

    broker
        .dispatch(client, assign_cmd(0b1, &[pmu_data::INST_RETIRED]))
        .unwrap();
    broker
        .dispatch(client, Command::Reset(CTL_FLAG_CORE))
        .unwrap();

    // reads outside a counting session are invalid
    assert!(broker.dispatch(client, Command::ReadCounting(0b1)).is_err());

    broker
        .dispatch(client, Command::Start(CTL_FLAG_CORE))
        .unwrap();
    assert_eq!(broker.state(), DeviceState::Counting);

    // a second session cannot begin while one is running
    assert!(broker
        .dispatch(client, Command::Start(CTL_FLAG_CORE))
        .is_err());
    assert!(broker
        .dispatch(client, assign_cmd(0b1, &[pmu_data::L1D_CACHE]))
        .is_err());

    hw.tick(0, pmu_data::INST_RETIRED, 777);

    match broker.dispatch(client, Command::ReadCounting(0b1)).unwrap() {
        Response::Counts(r) => {
            assert_eq!(r.cores.len(), 1);
            assert_eq!(r.cores[0].counts[0].value, 777);
        }
        _ => panic!("expected counts"),
    }

    broker
        .dispatch(client, Command::Stop(CTL_FLAG_CORE))
        .unwrap();
    assert_eq!(broker.state(), DeviceState::Idle);

    // stop after stop is a no-op that succeeds
    broker
        .dispatch(client, Command::Stop(CTL_FLAG_CORE))
        .unwrap();

    broker.close(client);
}

#[test]
fn only_the_owning_client_may_continue_a_session() {
    let hw = EmuHw::new(1, 4);
    let broker = make_broker(&hw);
    let alice = broker.open().unwrap();
    let bob = broker.open().unwrap();

    broker
        .dispatch(alice, assign_cmd(0b1, &[pmu_data::INST_RETIRED]))
        .unwrap();
    broker
        .dispatch(alice, Command::Start(CTL_FLAG_CORE))
        .unwrap();

    let err = broker.dispatch(bob, Command::ReadCounting(0b1)).unwrap_err();
    assert_eq!(err.status_code(), proto::STATUS_INVALID_DEVICE_STATE);
    assert!(broker.dispatch(bob, Command::Stop(CTL_FLAG_CORE)).is_err());

    // queries stay open to everyone
    assert!(broker.dispatch(bob, Command::Version).is_ok());

    broker
        .dispatch(alice, Command::Stop(CTL_FLAG_CORE))
        .unwrap();
    broker.close(bob);
    broker.close(alice);
}

#[test]
fn sampling_session_over_the_raw_surface() {
    let hw = EmuHw::new(1, 4);
    let broker = make_broker(&hw);
    let client = broker.open().unwrap();

    let set_src = proto::encode(&proto::SampleSetSrcRequest {
        kernel_mode: false,
        sources: vec![SampleSource {
            event_id: pmu_data::BR_MIS_PRED_RETIRED,
            interval: 100,
        }],
    })
    .unwrap();

    let (status, _) = broker.dispatch_raw(client, CommandCode::SampleSetSrc as u32, &set_src);
    assert_eq!(status, proto::STATUS_SUCCESS);

    let (status, _) = broker.dispatch_raw(client, CommandCode::SampleStart as u32, &[]);
    assert_eq!(status, proto::STATUS_SUCCESS);
    assert_eq!(broker.state(), DeviceState::Sampling);

    for _ in 0..3 {
        hw.tick(0, pmu_data::BR_MIS_PRED_RETIRED, 101);
    }

    let get = proto::encode(&proto::SampleRequest { core: 0 }).unwrap();
    let (status, bytes) = broker.dispatch_raw(client, CommandCode::SampleGet as u32, &get);
    assert_eq!(status, proto::STATUS_SUCCESS);
    let samples: proto::SampleGetResponse = proto::decode(&bytes).unwrap();
    assert_eq!(samples.samples.len(), 3);

    let (status, bytes) = broker.dispatch_raw(client, CommandCode::SampleStats as u32, &get);
    assert_eq!(status, proto::STATUS_SUCCESS);
    let stats: proto::SampleStatsResponse = proto::decode(&bytes).unwrap();
    assert_eq!(stats.generated, 3);
    assert_eq!(stats.dropped, 0);

    let (status, _) = broker.dispatch_raw(client, CommandCode::SampleStop as u32, &[]);
    assert_eq!(status, proto::STATUS_SUCCESS);
    assert_eq!(broker.state(), DeviceState::Idle);

    // the raw surface rejects junk
    let (status, _) = broker.dispatch_raw(client, 0xDEAD_BEEF, &[]);
    assert_eq!(status, proto::STATUS_INVALID_PARAMETER);
    let (status, _) = broker.dispatch_raw(client, CommandCode::SampleGet as u32, &[1, 2, 3]);
    assert_eq!(status, proto::STATUS_INVALID_PARAMETER);

    broker.close(client);
}

#[test]
fn sample_get_requires_a_sampling_session() {
    let hw = EmuHw::new(1, 4);
    let broker = make_broker(&hw);
    let client = broker.open().unwrap();

    let err = broker.dispatch(client, Command::SampleGet(0)).unwrap_err();
    assert_eq!(err.status_code(), proto::STATUS_INVALID_DEVICE_STATE);

    // sampling cannot start before its sources are set
    assert!(broker.dispatch(client, Command::SampleStart).is_err());

    broker.close(client);
}

#[test]
fn dsu_and_dmc_commands_round_trip() {
    let hw = EmuHw::new(1, 4);
    let dsu = EmuDsu::new(2, 4, 6);
    let dmc = EmuDmc::new(2);
    let cfg = EngineConfig {
        dsu: Some(dsu.clone()),
        dmc: Some(dmc.clone()),
        ..Default::default()
    };
    let engine = Engine::new(hw.host(), hw.regio(), cfg).expect("engine init");
    let broker = CommandBroker::new(engine);
    let client = broker.open().unwrap();

    match broker.dispatch(client, Command::DsuQueryHwCfg).unwrap() {
        Response::DsuHwCfg(cfg) => {
            assert_eq!(cfg.num_clusters, 2);
            assert_eq!(cfg.cluster_size, 4);
            assert_eq!(cfg.num_gpc, 6);
        }
        _ => panic!("expected DSU config"),
    }
    match broker.dispatch(client, Command::DmcQueryHwCfg).unwrap() {
        Response::DmcHwCfg(cfg) => assert_eq!(cfg.num_channels, 2),
        _ => panic!("expected DMC config"),
    }

    broker
        .dispatch(
            client,
            Command::DsuEventsAssign(proto::DsuEventsAssignRequest {
                cluster_bitmap: 0b11,
                events: vec![EventSpec {
                    id: pmu_data::L3D_CACHE,
                    filter: 0,
                }],
            }),
        )
        .unwrap();
    broker
        .dispatch(
            client,
            Command::DmcEventsAssign(proto::DmcEventsAssignRequest {
                channel: 0,
                clk_events: vec![EventSpec { id: 0x1, filter: 0 }],
                clkdiv2_events: vec![EventSpec { id: 0x2, filter: 0 }],
            }),
        )
        .unwrap();

    broker
        .dispatch(
            client,
            Command::Start(proto::CTL_FLAG_DSU | proto::CTL_FLAG_DMC),
        )
        .unwrap();

    dsu.tick(0, pmu_data::L3D_CACHE, 40);
    dsu.tick(1, pmu_data::L3D_CACHE, 60);
    dmc.tick(0, DmcDomain::Clk, 0x1, 11);
    dmc.tick(0, DmcDomain::Clkdiv2, 0x2, 22);

    match broker.dispatch(client, Command::DsuReadCounting).unwrap() {
        Response::DsuCounts(r) => {
            assert_eq!(r.clusters.len(), 2);
            assert_eq!(r.clusters[0].counts[0].value, 40);
            assert_eq!(r.clusters[1].counts[0].value, 60);
        }
        _ => panic!("expected DSU counts"),
    }
    match broker.dispatch(client, Command::DmcReadCounting).unwrap() {
        Response::DmcCounts(r) => {
            assert_eq!(r.channels.len(), 1);
            assert_eq!(r.channels[0].clk[0].value, 11);
            assert_eq!(r.channels[0].clkdiv2[0].value, 22);
        }
        _ => panic!("expected DMC counts"),
    }

    broker
        .dispatch(
            client,
            Command::Stop(proto::CTL_FLAG_DSU | proto::CTL_FLAG_DMC),
        )
        .unwrap();
    broker.close(client);
}

#[test]
fn peripheral_units_absent_report_unsupported() {
    let hw = EmuHw::new(1, 4);
    let broker = make_broker(&hw);
    let client = broker.open().unwrap();

    for cmd in [
        Command::DsuQueryHwCfg,
        Command::DmcQueryHwCfg,
        Command::SpeQueryCaps,
    ] {
        let err = broker.dispatch(client, cmd).unwrap_err();
        assert_eq!(err.status_code(), proto::STATUS_NOT_SUPPORTED);
    }

    broker.close(client);
}

#[test]
fn spe_session_drains_one_shot() {
    // PMUv3 with FEAT_SPE
    let hw = EmuHw::new_with(2, 4, 0b0001, 0b001);
    let spe = EmuSpe::new(2);
    let cfg = EngineConfig {
        spe: Some(spe.clone()),
        ..Default::default()
    };
    let engine = Engine::new(hw.host(), hw.regio(), cfg).expect("engine init");
    let broker = CommandBroker::new(engine);
    let client = broker.open().unwrap();

    match broker.dispatch(client, Command::SpeQueryCaps).unwrap() {
        Response::SpeCaps(caps) => {
            assert_eq!(caps.pms_ver, 0b001);
            assert_ne!(caps.pmbidr, 0);
        }
        _ => panic!("expected SPE caps"),
    }

    // records pushed while disabled are not buffered
    spe.push_record(1, &[0xAA; 8]);

    broker.dispatch(client, Command::SpeStart(1)).unwrap();
    assert_eq!(broker.state(), DeviceState::Sampling);
    spe.push_record(1, &[0x42; 16]);

    match broker.dispatch(client, Command::SpeGet(1)).unwrap() {
        Response::SpeBuffer(r) => {
            assert_eq!(r.core, 1);
            assert_eq!(r.buffer, vec![0x42; 16]);
        }
        _ => panic!("expected SPE buffer"),
    }
    // one-shot: a second drain is empty
    match broker.dispatch(client, Command::SpeGet(1)).unwrap() {
        Response::SpeBuffer(r) => assert!(r.buffer.is_empty()),
        _ => panic!("expected SPE buffer"),
    }

    // a PMU sample-stop does not end an SPE session
    assert!(broker.dispatch(client, Command::SampleStop).is_err());

    broker.dispatch(client, Command::SpeStop(1)).unwrap();
    assert_eq!(broker.state(), DeviceState::Idle);

    broker.close(client);
}

#[test]
fn unload_blocks_until_the_last_handle_closes() {
    let hw = EmuHw::new(1, 4);
    let engine = Engine::new(hw.host(), hw.regio(), EngineConfig::default()).expect("engine init");
    let broker = Arc::new(CommandBroker::new(engine.clone()));
    let client = broker.open().unwrap();

    let set_src = proto::SampleSetSrcRequest {
        kernel_mode: false,
        sources: vec![SampleSource {
            event_id: pmu_data::INST_RETIRED,
            interval: 100,
        }],
    };
    broker
        .dispatch(client, Command::SampleSetSrc(set_src))
        .unwrap();
    broker.dispatch(client, Command::SampleStart).unwrap();

    let remover = {
        let engine = engine.clone();
        std::thread::spawn(move || engine.query_remove())
    };

    // the unload request stalls while the handle is open
    std::thread::sleep(Duration::from_millis(50));
    assert!(!remover.is_finished());

    // new work is already refused
    let err = broker.dispatch(client, Command::Version).unwrap_err();
    assert_eq!(err.status_code(), proto::STATUS_CANCELLED);
    assert!(broker.open().is_err());

    broker.close(client);
    remover.join().expect("query_remove completed");

    // a subsequent load succeeds once the old instance is gone
    drop(broker);
    drop(engine);
    let again = Engine::new(hw.host(), hw.regio(), EngineConfig::default());
    assert!(again.is_ok());
}
