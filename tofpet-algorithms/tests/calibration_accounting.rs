//! Calibration counters and table loading from disk.

use std::io::Write;
use std::sync::Arc;

use approx::assert_relative_eq;
use tofpet_algorithms::{
    coarse_tot, CalibrationConfig, CalibrationTable, Calibrator, Edge, EdgeCalibration,
};
use tofpet_core::{EventBuffer, EventHandler, RawData, RawHit, SystemConfig};

const T: i64 = 6250;

fn tofpet(channel_id: u32, time_cycles: i64, t_coarse: u16, e_coarse: u16) -> RawHit {
    RawHit {
        time: time_cycles * T,
        time_end: (time_cycles + coarse_tot(t_coarse, e_coarse)) * T,
        channel_id,
        channel_idle_time: 0,
        data: RawData::Tofpet {
            tac: 0,
            t_coarse,
            e_coarse,
            t_fine: 100,
            e_fine: 100,
            tac_idle_time: 0,
        },
    }
}

fn stic(time: i64) -> RawHit {
    RawHit {
        time,
        time_end: time + 10 * T,
        data: RawData::Stic {
            t_coarse: 0,
            e_coarse: 40,
            t_fine: 0,
            e_fine: 0,
            t_bad_hit: false,
            e_bad_hit: false,
        },
        ..RawHit::default()
    }
}

/// Channel 1 answers with an out-of-range `q` on its time edge.
fn table() -> Arc<CalibrationTable> {
    let mut table = CalibrationTable::new(4);
    table
        .set_edge(1, 0, Edge::Time, EdgeCalibration::Constant(5.0))
        .unwrap();
    Arc::new(table)
}

/// Two normal, two zero-ToT (one on the denormal channel), two denormal,
/// one STIC and one hit past the window.
fn mixed_chunk() -> EventBuffer<RawHit> {
    EventBuffer::from_records(
        vec![
            tofpet(0, 10, 10, 20),
            tofpet(2, 20, 20, 20),
            tofpet(1, 30, 30, 40),
            stic(35 * T),
            tofpet(1, 40, 40, 40),
            tofpet(3, 50, 50, 70),
            tofpet(0, 60, 60, 60),
            tofpet(1, 70, 70, 90),
            tofpet(0, 500, 500, 510),
        ],
        0,
        100 * T,
    )
}

#[test]
fn test_counters_partition_events() {
    let configs = [
        CalibrationConfig::default(),
        CalibrationConfig::default().with_kill_zero_tot(true),
        CalibrationConfig::default().with_kill_denormal(true),
        CalibrationConfig::default()
            .with_kill_zero_tot(true)
            .with_kill_denormal(true),
    ];
    for config in configs {
        let stage = Calibrator::new(table(), config, &SystemConfig::default());
        let out = stage.handle_events(&mixed_chunk());
        let s = stage.stats();

        assert_eq!(s.n_event, 8, "{config:?}");
        assert_eq!(s.n_wrong_front_end, 1);
        assert_eq!(
            s.n_event,
            s.n_wrong_front_end + s.n_zero_tot + s.n_not_normal + s.n_passed,
            "{config:?}"
        );

        let kept_denormal = if config.kill_denormal { 0 } else { s.n_not_normal };
        assert_eq!(out.len() as u64, s.n_passed + kept_denormal, "{config:?}");
        assert_eq!(out.t_max(), 100 * T);
    }
}

#[test]
fn test_kill_zero_tot_removes_zero_width_hits() {
    let stage = Calibrator::new(
        table(),
        CalibrationConfig::default().with_kill_zero_tot(true),
        &SystemConfig::default(),
    );
    let out = stage.handle_events(&mixed_chunk());
    let s = stage.stats();

    assert_eq!(s.n_zero_tot, 3);
    assert_eq!(s.n_not_normal, 2);
    assert_eq!(s.n_passed, 2);
    for hit in &out {
        let RawData::Tofpet {
            t_coarse, e_coarse, ..
        } = hit.raw.data
        else {
            panic!("non-TOFPET hit in calibration output");
        };
        assert_ne!(coarse_tot(t_coarse, e_coarse), 0);
    }
    assert_eq!(out.iter().filter(|h| h.bad_event).count(), 2);
}

#[test]
fn test_table_loaded_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "default": {{ "constant": 2.0 }},
            "channels": [
                {{
                    "channel": 2,
                    "time_offset_ps": 500.0,
                    "energy_response": [[0.0, 0.0], [62.5, 511.0]],
                    "tacs": [
                        {{ "tac": 0, "time": {{ "constant": 2.5 }}, "energy": {{ "constant": 2.5 }} }}
                    ]
                }}
            ]
        }}"#
    )
    .unwrap();
    file.flush().unwrap();

    let path = file.path().to_str().unwrap();
    let table = CalibrationTable::load(path, 4).unwrap();
    let stage = Calibrator::new(
        Arc::new(table),
        CalibrationConfig::default(),
        &SystemConfig::default(),
    );

    let out = stage.handle_events(&EventBuffer::from_records(
        vec![tofpet(2, 100, 100, 110)],
        0,
        i64::MAX,
    ));
    let hit = out.get(0).unwrap();
    assert!(!hit.bad_event);
    assert_relative_eq!(hit.tofpet_tqt, 2.5);
    // Both edges move by the same fraction, so the width is kept.
    assert_eq!(hit.time_end - hit.time, 10 * T);
    assert_relative_eq!(hit.energy, 511.0, epsilon = 1e-3);
}

#[test]
fn test_missing_table_file() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.json");
    let err = CalibrationTable::load(missing.to_str().unwrap(), 4).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(2));
}
