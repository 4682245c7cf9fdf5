mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{events_until_terminal, ip, manager, manager_with, FakeHost, FakeProber};
use netscan::config::EngineConfig;
use netscan::events::ScanEvent;
use netscan::inventory::Inventory;
use netscan::types::{Backend, ScanOptions, ScanStatus, ScanStrategy};
use netscan::ScanError;

fn slow_prober() -> Arc<FakeProber> {
    Arc::new(FakeProber::new().alive("10.0.0.3").delay(Duration::from_millis(25)))
}

fn narrow() -> ScanOptions {
    ScanOptions {
        concurrency: Some(2),
        retries: Some(0),
        ..Default::default()
    }
}

#[tokio::test]
async fn sweep_with_no_live_hosts_completes() {
    let (mgr, inventory) = manager(Arc::new(FakeProber::new()));
    let mut rx = mgr.events().subscribe();

    let id = mgr
        .start_scan("10.0.0.1-4", ScanStrategy::PingSweep, ScanOptions::default())
        .await
        .unwrap();
    let events = events_until_terminal(&mut rx, id).await;
    let job = mgr.wait(id).await.unwrap();

    assert_eq!(job.status, ScanStatus::Completed);
    assert_eq!(job.backend, Some(Backend::Pool));
    assert_eq!(job.resolved_count, 4);
    assert_eq!((job.probed, job.total), (4, 4));
    assert_eq!(job.devices_found, 0);
    assert!(job.started_at.is_some() && job.ended_at.is_some());
    assert!(inventory.is_empty().await);
    assert!(!events.iter().any(|e| matches!(e, ScanEvent::DeviceFound { .. })));
    assert_eq!(mgr.active_job().await, None);
}

#[tokio::test]
async fn live_hosts_land_in_the_inventory() {
    let prober = Arc::new(FakeProber::new().host(
        "10.0.0.2",
        FakeHost {
            ttl: Some(64),
            mac: Some("aa:bb:cc:00:11:22".into()),
            hostname: Some("nas.lan".into()),
            open_ports: vec![22],
            ..Default::default()
        },
    ));
    let (mgr, inventory) = manager(prober);
    let mut rx = mgr.events().subscribe();

    let opts = ScanOptions {
        ports: Some("22,80".into()),
        ..Default::default()
    };
    let id = mgr.start_scan("10.0.0.1-3", ScanStrategy::PortScan, opts).await.unwrap();
    let events = events_until_terminal(&mut rx, id).await;
    let job = mgr.wait(id).await.unwrap();

    assert_eq!(job.status, ScanStatus::Completed);
    assert_eq!(job.devices_found, 1);

    let found: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ScanEvent::DeviceFound { device, .. } => Some(device.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(found.len(), 1);

    let devices = inventory.all().await.unwrap();
    assert_eq!(devices.len(), 1);
    let dev = &devices[0];
    assert_eq!(dev.id, found[0].id);
    assert_eq!(dev.address, ip("10.0.0.2"));
    assert_eq!(dev.mac.as_deref(), Some("aa:bb:cc:00:11:22"));
    assert_eq!(dev.hostname.as_deref(), Some("nas.lan"));
    assert_eq!(dev.os.as_deref(), Some("Linux/Unix"));
    assert_eq!(dev.open_ports.iter().map(|p| p.port).collect::<Vec<_>>(), vec![22]);
    assert_eq!(dev.last_job, Some(id));
}

#[tokio::test]
async fn rescanning_updates_rather_than_duplicates() {
    let prober = Arc::new(FakeProber::new().host(
        "10.0.0.2",
        FakeHost {
            ttl: Some(64),
            mac: Some("aa:bb:cc:00:11:22".into()),
            ..Default::default()
        },
    ));
    let (mgr, inventory) = manager(prober);

    let first = mgr
        .start_scan("10.0.0.2", ScanStrategy::PingSweep, ScanOptions::default())
        .await
        .unwrap();
    mgr.wait(first).await.unwrap();
    let before = inventory.all().await.unwrap();

    let second = mgr
        .start_scan("10.0.0.2", ScanStrategy::PingSweep, ScanOptions::default())
        .await
        .unwrap();
    mgr.wait(second).await.unwrap();
    let after = inventory.all().await.unwrap();

    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, before[0].id);
    assert_eq!(after[0].first_seen, before[0].first_seen);
    assert!(after[0].last_seen >= before[0].last_seen);
    assert_eq!(after[0].last_job, Some(second));
}

#[tokio::test]
async fn events_are_ordered_with_one_terminal() {
    let (mgr, _) = manager(Arc::new(FakeProber::new().alive("10.0.0.1").alive("10.0.0.4")));
    let mut rx = mgr.events().subscribe();

    let id = mgr
        .start_scan("10.0.0.0/29", ScanStrategy::PingSweep, ScanOptions::default())
        .await
        .unwrap();
    let events = events_until_terminal(&mut rx, id).await;

    assert!(matches!(events.first(), Some(ScanEvent::ScanStarted { .. })));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(events.last().unwrap().is_terminal());
    assert_eq!(events.iter().filter(|e| matches!(e, ScanEvent::ScanStarted { .. })).count(), 1);

    let mut last = 0;
    for event in &events {
        if let ScanEvent::Progress { probed, total, .. } = event {
            assert!(*probed <= *total);
            assert!(*probed >= last, "progress went backwards");
            last = *probed;
        }
    }
    assert_eq!(last, 6);
    match events.last() {
        Some(ScanEvent::ScanCompleted { job }) => {
            assert_eq!(job.status, ScanStatus::Completed);
            assert_eq!(job.devices_found, 2);
        }
        other => panic!("unexpected terminal event {other:?}"),
    }
}

#[tokio::test]
async fn stop_mid_run_ends_stopped() {
    let (mgr, _) = manager(slow_prober());
    let mut rx = mgr.events().subscribe();

    let id = mgr
        .start_scan("10.0.0.1-40", ScanStrategy::PingSweep, narrow())
        .await
        .unwrap();

    let mut events = Vec::new();
    loop {
        let event = rx.recv().await.unwrap();
        let progressed = matches!(event, ScanEvent::Progress { .. });
        events.push(event);
        if progressed {
            break;
        }
    }
    assert!(mgr.stop_scan(id).await);
    assert!(mgr.stop_scan(id).await, "repeated stop on a stopping job is accepted");
    events.extend(events_until_terminal(&mut rx, id).await);

    let job = mgr.wait(id).await.unwrap();
    assert_eq!(job.status, ScanStatus::Stopped);
    assert!(job.probed < job.total);
    assert_eq!(job.error, None);
    for event in &events {
        if let ScanEvent::Progress { probed, total, .. } = event {
            assert!(probed <= total);
        }
    }
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(matches!(events.last(), Some(ScanEvent::ScanCompleted { job }) if job.status == ScanStatus::Stopped));
}

#[tokio::test]
async fn stop_is_refused_for_finished_and_unknown_jobs() {
    let (mgr, _) = manager(Arc::new(FakeProber::new()));
    let id = mgr
        .start_scan("10.0.0.1", ScanStrategy::PingSweep, ScanOptions::default())
        .await
        .unwrap();
    mgr.wait(id).await.unwrap();

    assert!(!mgr.stop_scan(id).await);
    assert!(!mgr.stop_scan(uuid::Uuid::new_v4()).await);
    assert_eq!(mgr.get_job_status(id).await.unwrap().status, ScanStatus::Completed);
}

#[tokio::test]
async fn bad_target_is_rejected_with_an_error_event() {
    let (mgr, _) = manager(Arc::new(FakeProber::new()));
    let mut rx = mgr.events().subscribe();

    let err = mgr
        .start_scan("not-an-address, 10.0.0.300", ScanStrategy::PingSweep, ScanOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::Validation(_)));

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let ScanEvent::ScanError { job_id, message } = event else {
        panic!("expected scan_error, got {event:?}");
    };
    assert!(message.contains("not-an-address"));

    let job = mgr.get_job_status(job_id).await.unwrap();
    assert_eq!(job.status, ScanStatus::Error);
    assert!(job.error.is_some());
    assert_eq!(mgr.active_job().await, None);
}

#[tokio::test]
async fn bad_port_list_is_rejected() {
    let (mgr, _) = manager(Arc::new(FakeProber::new()));
    let opts = ScanOptions {
        ports: Some("22,http".into()),
        ..Default::default()
    };
    let err = mgr
        .start_scan("10.0.0.1", ScanStrategy::PortScan, opts)
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::Validation(_)));
}

#[tokio::test]
async fn unusable_prober_fails_the_job() {
    let (mgr, _) = manager(Arc::new(FakeProber::new().failing_check()));
    let mut rx = mgr.events().subscribe();

    let id = mgr
        .start_scan("10.0.0.1-3", ScanStrategy::PingSweep, ScanOptions::default())
        .await
        .unwrap();
    let events = events_until_terminal(&mut rx, id).await;
    let job = mgr.wait(id).await.unwrap();

    assert_eq!(job.status, ScanStatus::Error);
    assert!(job.error.as_deref().unwrap_or_default().contains("ping"));
    assert!(matches!(events.first(), Some(ScanEvent::ScanStarted { .. })));
    assert!(matches!(events.last(), Some(ScanEvent::ScanError { .. })));
}

#[tokio::test]
async fn new_scan_preempts_the_active_one() {
    let (mgr, _) = manager(slow_prober());

    let first = mgr
        .start_scan("10.0.0.1-40", ScanStrategy::PingSweep, narrow())
        .await
        .unwrap();
    assert_eq!(mgr.active_job().await, Some(first));

    let second = mgr
        .start_scan("10.0.0.3", ScanStrategy::PingSweep, narrow())
        .await
        .unwrap();

    let preempted = mgr.get_job_status(first).await.unwrap();
    assert_eq!(preempted.status, ScanStatus::Stopped);
    assert!(preempted.probed < preempted.total);

    let job = mgr.wait(second).await.unwrap();
    assert_eq!(job.status, ScanStatus::Completed);
    assert_eq!(job.devices_found, 1);

    let jobs = mgr.list_jobs().await;
    assert_eq!(jobs.iter().map(|j| j.id).collect::<Vec<_>>(), vec![first, second]);
}

#[tokio::test]
async fn rejected_start_leaves_the_running_scan_alone() {
    let (mgr, _) = manager(slow_prober());
    let first = mgr
        .start_scan("10.0.0.1-40", ScanStrategy::PingSweep, narrow())
        .await
        .unwrap();

    let err = mgr
        .start_scan("bogus", ScanStrategy::PingSweep, narrow())
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::Validation(_)));
    let opts = ScanOptions {
        ports: Some("22,http".into()),
        ..narrow()
    };
    let err = mgr.start_scan("10.0.0.3", ScanStrategy::PortScan, opts).await.unwrap_err();
    assert!(matches!(err, ScanError::Validation(_)));

    assert_eq!(mgr.active_job().await, Some(first));
    let running = mgr.get_job_status(first).await.unwrap();
    assert!(!running.status.is_terminal());
    assert_ne!(running.status, ScanStatus::Stopping);

    let job = mgr.wait(first).await.unwrap();
    assert_eq!(job.status, ScanStatus::Completed);
    assert_eq!((job.probed, job.total), (40, 40));
}

#[tokio::test]
async fn external_scan_refuses_mixed_address_families() {
    let config = EngineConfig {
        nmap_path: "/nonexistent/netscan-test/nmap".into(),
        ..EngineConfig::default()
    };
    let (mgr, _) = manager_with(config, Arc::new(FakeProber::new()));

    let err = mgr
        .start_scan("10.0.0.1, fd00::1", ScanStrategy::FingerprintScan, ScanOptions::default())
        .await
        .unwrap_err();
    let ScanError::Validation(message) = err else {
        panic!("expected a validation error, got {err:?}");
    };
    assert!(message.contains("IPv6"));
    assert_eq!(mgr.active_job().await, None);

    // The built-in pool handles both families in one job.
    let id = mgr
        .start_scan("10.0.0.1, fd00::1", ScanStrategy::PingSweep, ScanOptions::default())
        .await
        .unwrap();
    assert_eq!(mgr.wait(id).await.unwrap().status, ScanStatus::Completed);
}

#[tokio::test]
async fn history_is_bounded() {
    let config = EngineConfig {
        history_limit: 2,
        ..EngineConfig::default()
    };
    let (mgr, _) = manager_with(config, Arc::new(FakeProber::new()));

    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = mgr
            .start_scan("10.0.0.1", ScanStrategy::PingSweep, ScanOptions::default())
            .await
            .unwrap();
        mgr.wait(id).await.unwrap();
        ids.push(id);
    }

    assert!(mgr.get_job_status(ids[0]).await.is_none());
    let kept: Vec<_> = mgr.list_jobs().await.into_iter().map(|j| j.id).collect();
    assert_eq!(kept, ids[1..].to_vec());
}

#[tokio::test]
async fn fingerprinting_without_the_scanner_fails_the_job() {
    let config = EngineConfig {
        nmap_path: "/nonexistent/netscan-test/nmap".into(),
        ..EngineConfig::default()
    };
    let (mgr, inventory) = manager_with(config, Arc::new(FakeProber::new().alive("10.0.0.1")));

    let id = mgr
        .start_scan("10.0.0.1", ScanStrategy::FingerprintScan, ScanOptions::default())
        .await
        .unwrap();
    let job = mgr.wait(id).await.unwrap();

    assert_eq!(job.backend, Some(Backend::External));
    assert_eq!(job.status, ScanStatus::Error);
    assert!(job.error.as_deref().unwrap_or_default().contains("not found"));
    assert!(inventory.is_empty().await);
}

#[tokio::test]
async fn advanced_options_route_to_the_external_scanner() {
    let config = EngineConfig {
        nmap_path: "/nonexistent/netscan-test/nmap".into(),
        ..EngineConfig::default()
    };
    let (mgr, _) = manager_with(config, Arc::new(FakeProber::new()));
    let opts = ScanOptions {
        service_detection: true,
        ..Default::default()
    };
    let id = mgr.start_scan("10.0.0.1", ScanStrategy::PortScan, opts).await.unwrap();
    let job = mgr.wait(id).await.unwrap();
    assert_eq!(job.backend, Some(Backend::External));
}
