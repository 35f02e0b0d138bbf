//! Concurrency tests for the session manager.
//!
//! Many device tasks write to the same [`SessionManager`] at once; each
//! device's stream must stay complete and in order, and never leak into
//! another device's session.

use std::sync::Arc;

use gsr_core::{Sample, SessionState};
use gsr_orchestrator::application::session_manager::{SessionError, SessionManager};
use tokio_test::assert_ok;

fn batch(first_seq: u64, count: u64) -> Vec<Sample> {
    (first_seq..first_seq + count)
        .map(|seq| Sample {
            t_mono_ns: seq as i64 * 1_000_000,
            t_utc_ns: 1_700_000_000_000_000_000 + seq as i64 * 1_000_000,
            seq,
            gsr_raw: 1.5,
            gsr_filt: 1.25,
            temp: 32.0,
            flag_spike: false,
            flag_sat: false,
            flag_dropout: false,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_devices_keep_their_own_ordered_streams() {
    // Arrange
    let manager = Arc::new(SessionManager::new());
    let devices: Vec<String> = (0..8).map(|i| format!("dev-{i}")).collect();
    for device in &devices {
        assert_ok!(manager.start_session(device, "parallel", None, None).await);
    }

    // Act
    let mut tasks = Vec::new();
    for device in devices.clone() {
        let manager = Arc::clone(&manager);
        tasks.push(tokio::spawn(async move {
            for b in 0..20 {
                manager.store_samples(&device, batch(b * 25, 25)).await.unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Assert
    for device in &devices {
        let session = manager.stop_session(device).await.unwrap();
        assert_eq!(session.device_id, *device);
        assert_eq!(session.state, SessionState::Done);
        let seqs: Vec<u64> = session.samples.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, (0..500).collect::<Vec<_>>(), "{device}");
        assert_eq!(session.quality.missing_samples, 0);
    }
    assert_eq!(manager.active_session_count().await, 0);
    assert_eq!(manager.list_sessions().await.len(), devices.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_start_on_one_device_admits_exactly_one() {
    // Arrange
    let manager = Arc::new(SessionManager::new());

    // Act
    let mut tasks = Vec::new();
    for i in 0..16 {
        let manager = Arc::clone(&manager);
        tasks.push(tokio::spawn(async move {
            manager
                .start_session("dev-a", &format!("attempt-{i}"), None, None)
                .await
        }));
    }
    let mut started = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => started += 1,
            Err(SessionError::SessionConflict { .. }) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    // Assert
    assert_eq!(started, 1);
    assert_eq!(conflicts, 15);
    assert_eq!(manager.active_session_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_racing_with_writes_loses_no_accepted_batch() {
    // Arrange
    let manager = Arc::new(SessionManager::new());
    assert_ok!(manager.start_session("dev-a", "race", None, None).await);

    // Act: a writer keeps appending while another task stops the session
    let writer = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let mut accepted = 0u64;
            for b in 0..200 {
                match manager.store_samples("dev-a", batch(b * 5, 5)).await {
                    Ok(_) => accepted += 5,
                    Err(SessionError::NoActiveSession { .. }) => break,
                    Err(other) => panic!("unexpected error: {other}"),
                }
                tokio::task::yield_now().await;
            }
            accepted
        })
    };
    tokio::task::yield_now().await;
    let finished = manager.stop_session("dev-a").await.unwrap();
    let accepted = writer.await.unwrap();

    // Assert: every batch that was accepted is in the finished session
    assert_eq!(finished.samples.len() as u64, accepted);
    assert!(manager.get_active_session("dev-a").await.is_none());
}
