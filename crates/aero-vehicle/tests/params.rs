mod common;

use aero_link::{ConcurrencyError, LinkError};
use aero_proto::Message;
use aero_vehicle::{
    MemoryProfileStore, ParamMetadata, ProfileStore, ProfileValues, ProtocolError, SafetySettings, ValidationError,
    VehicleError, VehicleEvent,
};
use common::{connect, drain, fast_config, wait_until};
use std::time::Duration;

#[tokio::test]
async fn test_download_rerequests_lost_index() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;
    let mut events = vehicle.subscribe_events();

    let (res, ()) = tokio::join!(vehicle.refresh_parameters(), async {
        assert!(matches!(sim.recv().await, Message::ParamRequestList { .. }));
        for i in (0..10u16).filter(|i| *i != 4) {
            sim.param(&format!("P{}", i), f32::from(i), i, 10).await;
        }
        match sim.recv().await {
            Message::ParamRequestRead { index, .. } => assert_eq!(index, 4),
            other => panic!("expected a re-request, got {:?}", other),
        }
        sim.param("P4", 4.0, 4, 10).await;
    });

    let snap = res.unwrap();
    assert_eq!(snap.received, 10);
    assert_eq!(snap.expected, Some(10));
    assert!(vehicle.params().is_download_complete());
    assert!(!vehicle.params().is_download_in_progress());
    assert_eq!(vehicle.params().parameter("P4").unwrap().value, 4.0);

    let completed: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, VehicleEvent::ParameterDownloadCompleted { .. }))
        .collect();
    assert_eq!(completed, vec![VehicleEvent::ParameterDownloadCompleted { success: true, received: 10, expected: Some(10) }]);
}

#[tokio::test]
async fn test_out_of_order_reports_complete_once() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;
    let mut events = vehicle.subscribe_events();

    let (res, ()) = tokio::join!(vehicle.refresh_parameters(), async {
        sim.recv().await;
        for i in [0u16, 2, 1, 3, 4, 5, 6, 7, 8, 9] {
            sim.param(&format!("P{}", i), f32::from(i), i, 10).await;
        }
    });

    assert_eq!(res.unwrap().received, 10);
    let events = drain(&mut events);
    let progress: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            VehicleEvent::ParameterDownloadProgress { received, expected: 10 } => Some(*received),
            _ => None,
        })
        .collect();
    assert_eq!(progress, (1..=10).collect::<Vec<_>>());
    let completed = events.iter().filter(|e| matches!(e, VehicleEvent::ParameterDownloadCompleted { .. })).count();
    assert_eq!(completed, 1);
    assert!(matches!(events.last(), Some(VehicleEvent::ParameterDownloadCompleted { success: true, received: 10, .. })));
}

#[tokio::test]
async fn test_refresh_after_reset_starts_fresh() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;

    let (res, ()) = tokio::join!(vehicle.refresh_parameters(), async {
        sim.recv().await;
        sim.param("A", 1.0, 0, 2).await;
        sim.param("B", 2.0, 1, 2).await;
    });
    assert_eq!(res.unwrap().expected, Some(2));

    vehicle.params().reset();
    assert_eq!(vehicle.params().expected_count(), None);
    assert_eq!(vehicle.params().received_count(), 0);

    let (res, ()) = tokio::join!(vehicle.refresh_parameters(), async {
        sim.recv().await;
        assert_eq!(vehicle.params().expected_count(), None);
        assert_eq!(vehicle.params().received_count(), 0);
        assert!(vehicle.params().is_download_in_progress());
        for (i, name) in ["A", "B", "C"].into_iter().enumerate() {
            sim.param(name, 1.0, i as u16, 3).await;
        }
    });

    let snap = res.unwrap();
    assert_eq!((snap.received, snap.expected), (3, Some(3)));
}

#[tokio::test]
async fn test_cancelled_download_is_not_completed_by_late_reports() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;
    let mut events = vehicle.subscribe_events();

    let (res, ()) = tokio::join!(vehicle.refresh_parameters(), async {
        sim.recv().await;
        sim.param("A", 1.0, 0, 2).await;
        wait_until(|| vehicle.params().received_count() == 1).await;
        assert!(vehicle.params().cancel_download());
    });
    assert_eq!(res, Err(VehicleError::Protocol(ProtocolError::DownloadCancelled)));

    sim.param("B", 2.0, 1, 2).await;
    wait_until(|| vehicle.params().parameter("B").is_some()).await;
    assert_eq!(vehicle.params().received_count(), 1);
    assert!(!vehicle.params().is_download_complete());

    let completed: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, VehicleEvent::ParameterDownloadCompleted { .. }))
        .collect();
    assert_eq!(completed, vec![VehicleEvent::ParameterDownloadCompleted { success: false, received: 1, expected: Some(2) }]);
}

#[tokio::test]
async fn test_duplicate_reports_counted_once() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;

    let (res, ()) = tokio::join!(vehicle.refresh_parameters(), async {
        sim.recv().await;
        sim.param("A", 1.0, 0, 3).await;
        sim.param("B", 2.0, 1, 3).await;
        sim.param("B", 2.5, 1, 3).await;
        sim.param("C", 3.0, 2, 3).await;
    });

    assert_eq!(res.unwrap().received, 3);
    assert_eq!(vehicle.params().received_count(), 3);
    assert_eq!(vehicle.params().parameter("B").unwrap().value, 2.5);
}

#[tokio::test]
async fn test_download_gives_up_without_progress() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;

    let (res, ()) = tokio::join!(vehicle.refresh_parameters(), async {
        sim.recv().await;
        sim.param("A", 1.0, 0, 3).await;
    });

    assert_eq!(
        res,
        Err(VehicleError::Protocol(ProtocolError::DownloadIncomplete { received: 1, expected: Some(3) }))
    );
    assert!(!vehicle.params().is_download_in_progress());
    assert!(vehicle.params().parameter("A").is_some());
}

#[tokio::test]
async fn test_second_refresh_rejected_while_running() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;

    let (first, second, ()) = tokio::join!(vehicle.params().refresh_parameters(), vehicle.params().refresh_parameters(), async {
        sim.recv().await;
        sim.param("A", 1.0, 0, 1).await;
    });

    assert!(first.is_ok());
    assert_eq!(second, Err(VehicleError::Concurrency(ConcurrencyError::DownloadInProgress)));
}

#[tokio::test]
async fn test_set_parameter_retries_until_echoed() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;

    let (res, ()) = tokio::join!(vehicle.set_parameter("RATE_P", 0.15), async {
        // First write is "lost".
        assert!(matches!(sim.recv().await, Message::ParamSet { .. }));
        match sim.recv().await {
            Message::ParamSet { name, value, .. } => {
                assert_eq!(name, "RATE_P");
                sim.param(&name, value, 7, 100).await;
            }
            other => panic!("expected PARAM_SET, got {:?}", other),
        }
    });

    res.unwrap();
    assert_eq!(vehicle.params().parameter("RATE_P").unwrap().value, 0.15);
}

#[tokio::test]
async fn test_set_parameter_ignores_stale_echo() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;

    let (res, ()) = tokio::join!(vehicle.set_parameter("RATE_P", 0.15), async {
        sim.recv().await;
        sim.param("RATE_P", 0.10, 7, 100).await;
        sim.param("RATE_P", 0.15, 7, 100).await;
    });

    res.unwrap();
}

#[tokio::test]
async fn test_set_parameter_unconfirmed() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;

    let (res, sent) = tokio::join!(vehicle.set_parameter("RATE_P", 0.15), async {
        let mut sent = 0;
        while let Some(msg) = sim.try_recv(Duration::from_millis(300)).await {
            assert!(matches!(msg, Message::ParamSet { .. }));
            sent += 1;
        }
        sent
    });

    assert_eq!(
        res,
        Err(VehicleError::Protocol(ProtocolError::WriteNotConfirmed { name: "RATE_P".into(), attempts: 4 }))
    );
    assert_eq!(sent, 4);
}

#[tokio::test]
async fn test_out_of_range_write_sends_nothing() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;
    vehicle.params().set_metadata(ParamMetadata {
        name: "RATE_P".into(),
        min: Some(0.0),
        max: Some(1.0),
        description: Some("roll rate P".into()),
    });

    let res = vehicle.set_parameter("RATE_P", 3.0).await;
    assert!(matches!(res, Err(VehicleError::Validation(ValidationError::OutOfRange { .. }))));
    let res = vehicle.set_parameter("RATE_P", f32::INFINITY).await;
    assert!(matches!(res, Err(VehicleError::Validation(ValidationError::NotFinite { .. }))));
    assert!(sim.try_recv(Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn test_concurrent_writes_to_same_name() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;

    let (a, b, ()) = tokio::join!(vehicle.set_parameter("RATE_P", 0.1), vehicle.set_parameter("RATE_P", 0.2), async {
        sim.recv().await;
        sim.param("RATE_P", 0.1, 0, 1).await;
    });

    a.unwrap();
    assert!(matches!(b, Err(VehicleError::Concurrency(ConcurrencyError::AlreadyPending(_)))));
}

#[tokio::test]
async fn test_read_parameter() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;

    let (res, ()) = tokio::join!(vehicle.params().read_parameter("BATT_LOW_VOLT"), async {
        match sim.recv().await {
            Message::ParamRequestRead { index, name, .. } => {
                assert_eq!(index, -1);
                sim.param(&name, 10.8, 3, 400).await;
            }
            other => panic!("expected PARAM_REQUEST_READ, got {:?}", other),
        }
    });

    let p = res.unwrap();
    assert_eq!(p.value, 10.8);
    assert_eq!(p.index, Some(3));
}

#[tokio::test]
async fn test_link_loss_fails_pending_write_and_clears_table() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;
    sim.param("A", 1.0, 0, 5).await;
    wait_until(|| vehicle.params().parameter("A").is_some()).await;

    let (res, ()) = tokio::join!(vehicle.set_parameter("A", 2.0), async move {
        sim.recv().await;
        drop(sim);
    });

    assert!(matches!(res, Err(VehicleError::Link(_))));
    wait_until(|| vehicle.params().parameters().is_empty()).await;
    assert_eq!(vehicle.params().expected_count(), None);
    assert_eq!(vehicle.params().set_parameter("A", 2.0).await, Err(VehicleError::Link(LinkError::NotConnected)));
}

#[tokio::test]
async fn test_profile_round_trip_only_writes_differences() {
    let common::Harness { vehicle, mut sim, .. } = connect(fast_config(), SafetySettings::default()).await;
    sim.param("A", 1.0, 0, 2).await;
    sim.param("B", 2.0, 1, 2).await;
    wait_until(|| vehicle.params().parameters().len() == 2).await;

    let store = MemoryProfileStore::new();
    assert_eq!(vehicle.params().save_profile(&store, "bench").unwrap(), 2);

    let mut tuned: ProfileValues = store.load_profile("bench").unwrap();
    tuned.insert("B".into(), 5.0);
    store.save_profile("tuned", &tuned).unwrap();

    let (report, ()) = tokio::join!(vehicle.params().apply_profile(&store, "tuned"), async {
        match sim.recv().await {
            Message::ParamSet { name, value, .. } => {
                assert_eq!((name.as_str(), value), ("B", 5.0));
                sim.param(&name, value, 1, 2).await;
            }
            other => panic!("expected PARAM_SET, got {:?}", other),
        }
    });

    let report = report.unwrap();
    assert_eq!(report.applied, vec!["B".to_string()]);
    assert_eq!(report.unchanged, 1);
    assert!(report.failed.is_empty());
    assert!(matches!(
        vehicle.params().apply_profile(&store, "missing").await,
        Err(VehicleError::Profile(_))
    ));
}
