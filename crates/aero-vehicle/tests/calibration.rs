mod common;

use aero_link::ConcurrencyError;
use aero_proto::CalibrationReport;
use aero_vehicle::{CalibrationConfig, CalibrationKind, CalibrationState, ProtocolError, SafetySettings, VehicleError, VehicleEvent};
use common::{connect, drain, fast_config};
use std::time::Duration;

const PREFLIGHT_CALIBRATION: u16 = 241;
const ACCELCAL_VEHICLE_POS: u16 = 42429;

#[tokio::test]
async fn test_progress_is_monotonic_unless_restarted() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;
    let mut events = vehicle.subscribe_events();

    let (res, ()) = tokio::join!(vehicle.calibrate(CalibrationKind::Gyroscope), async {
        let cmd = sim.expect_command().await;
        assert_eq!(cmd.command, PREFLIGHT_CALIBRATION);
        assert_eq!(cmd.params[0], 1.0);
        sim.ack(PREFLIGHT_CALIBRATION, 0).await;
        for (percent, flags) in [(10, 0), (30, 0), (20, 0), (50, 0), (5, CalibrationReport::FLAG_RESTART), (60, 0)] {
            sim.calibration(1, percent, 0, flags).await;
        }
        sim.calibration(1, 100, 0, CalibrationReport::FLAG_COMPLETE).await;
    });

    res.unwrap();
    assert_eq!(vehicle.calibration().state(), CalibrationState::Completed(CalibrationKind::Gyroscope));
    let percents: Vec<u8> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            VehicleEvent::CalibrationProgress(p) => Some(p.percent),
            _ => None,
        })
        .collect();
    assert_eq!(percents, vec![10, 30, 50, 5, 60, 100]);
}

#[tokio::test]
async fn test_second_calibration_rejected() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;

    let (first, second, ()) = tokio::join!(
        vehicle.calibrate(CalibrationKind::Gyroscope),
        vehicle.calibrate(CalibrationKind::Accelerometer),
        async {
            sim.expect_command().await;
            sim.ack(PREFLIGHT_CALIBRATION, 0).await;
            sim.calibration(1, 100, 0, CalibrationReport::FLAG_COMPLETE).await;
        }
    );

    first.unwrap();
    assert_eq!(second, Err(VehicleError::Concurrency(ConcurrencyError::CalibrationAlreadyInProgress)));
    assert!(sim.try_recv(Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn test_vehicle_reported_failure() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;

    let (res, ()) = tokio::join!(vehicle.calibrate(CalibrationKind::Magnetometer), async {
        let cmd = sim.expect_command().await;
        assert_eq!(cmd.params[1], 1.0);
        sim.ack(PREFLIGHT_CALIBRATION, 0).await;
        sim.calibration(3, 40, 0, 0).await;
        sim.calibration(3, 40, 0, CalibrationReport::FLAG_FAILED).await;
    });

    assert!(matches!(res, Err(VehicleError::Protocol(ProtocolError::CalibrationFailed { .. }))));
    assert_eq!(vehicle.calibration().state(), CalibrationState::Failed(CalibrationKind::Magnetometer));
}

#[tokio::test]
async fn test_stalled_calibration_fails_after_step_window() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;

    let (res, ()) = tokio::join!(vehicle.calibrate(CalibrationKind::Barometer), async {
        sim.expect_command().await;
        sim.ack(PREFLIGHT_CALIBRATION, 0).await;
        sim.calibration(4, 10, 0, 0).await;
    });

    assert!(matches!(res, Err(VehicleError::Protocol(ProtocolError::CalibrationFailed { .. }))));
    assert!(!vehicle.calibration().is_active());

    // A fresh run is accepted once the previous one ended.
    let (res, ()) = tokio::join!(vehicle.calibrate(CalibrationKind::Barometer), async {
        sim.expect_command().await;
        sim.ack(PREFLIGHT_CALIBRATION, 0).await;
        sim.calibration(4, 100, 0, CalibrationReport::FLAG_COMPLETE).await;
    });
    res.unwrap();
}

#[tokio::test]
async fn test_rejected_start_leaves_machine_idle_for_retry() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;

    let (res, ()) = tokio::join!(vehicle.calibrate(CalibrationKind::Level), async {
        let cmd = sim.expect_command().await;
        assert_eq!(cmd.params[4], 2.0);
        sim.ack(PREFLIGHT_CALIBRATION, 1).await;
    });

    assert!(matches!(res, Err(VehicleError::Command(_))));
    assert_eq!(vehicle.calibration().state(), CalibrationState::Failed(CalibrationKind::Level));
}

#[tokio::test]
async fn test_accelerometer_positions_and_cancel() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;
    let mut events = vehicle.subscribe_events();

    let (res, ()) = tokio::join!(vehicle.calibrate(CalibrationKind::Accelerometer), async {
        let cmd = sim.expect_command().await;
        assert_eq!(cmd.params[4], 1.0);
        sim.ack(PREFLIGHT_CALIBRATION, 0).await;
        sim.calibration(2, 17, 1, 0).await;
        common::wait_until(|| {
            vehicle.calibration().state() == CalibrationState::InProgress { kind: CalibrationKind::Accelerometer, step: 1 }
        })
        .await;

        let (confirmed, ()) = tokio::join!(vehicle.calibration().confirm_vehicle_position(), async {
            let cmd = sim.expect_command().await;
            assert_eq!(cmd.command, ACCELCAL_VEHICLE_POS);
            assert_eq!(cmd.params[0], 2.0);
            sim.ack(ACCELCAL_VEHICLE_POS, 0).await;
        });
        confirmed.unwrap();

        assert_eq!(vehicle.calibration().cancel().await, Ok(true));
        let cmd = sim.expect_command().await;
        assert_eq!(cmd.command, PREFLIGHT_CALIBRATION);
        assert_eq!(cmd.params, [0.0; 7]);
    });

    assert!(matches!(res, Err(VehicleError::Protocol(ProtocolError::CalibrationCancelled { .. }))));
    assert_eq!(vehicle.calibration().state(), CalibrationState::Cancelled(CalibrationKind::Accelerometer));

    let labels: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            VehicleEvent::CalibrationProgress(p) => p.position_label(),
            _ => None,
        })
        .collect();
    assert_eq!(labels, vec!["on its left side"]);
}

#[tokio::test]
async fn test_window_follows_the_current_step() {
    let mut config = fast_config();
    config.calibration = CalibrationConfig { step_window_ms: Some(150), operator_window_ms: Some(600) };
    let common::Harness { vehicle, mut sim, .. } = connect(config, SafetySettings::default()).await;

    let (res, ()) = tokio::join!(vehicle.calibrate(CalibrationKind::Accelerometer), async {
        sim.expect_command().await;
        sim.ack(PREFLIGHT_CALIBRATION, 0).await;
        sim.calibration(2, 0, 0, 0).await;

        // Waiting for the operator: longer than a sampling step may stay quiet.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(vehicle.calibration().is_active());

        let (confirmed, ()) = tokio::join!(vehicle.calibration().confirm_vehicle_position(), async {
            assert_eq!(sim.expect_command().await.command, ACCELCAL_VEHICLE_POS);
            sim.ack(ACCELCAL_VEHICLE_POS, 0).await;
        });
        confirmed.unwrap();
        // Sampling now; the vehicle goes silent.
    });

    match res {
        Err(VehicleError::Protocol(ProtocolError::CalibrationFailed { reason, .. })) => {
            assert_eq!(reason, "no progress in step 0 for 150 ms");
        }
        other => panic!("expected a stalled step, got {:?}", other),
    }
    assert_eq!(vehicle.calibration().state(), CalibrationState::Failed(CalibrationKind::Accelerometer));
}
