mod common;

use common::{MockDriver, SessionPlan};
use std::sync::Arc;
use std::time::Duration;
use txscope::config::MonitorSettings;
use txscope::db::{ConnectionHandle, Driver, LeakMonitor, ResourceReleaser, ResourceTracker};
use txscope::error::DriverError;

/// Open `count` connections and register them without ever releasing them.
async fn leak(
    driver: &MockDriver,
    tracker: &Arc<ResourceTracker>,
    count: usize,
) -> Vec<ConnectionHandle> {
    let mut handles = Vec::with_capacity(count);
    for _ in 0..count {
        let handle = ConnectionHandle::new(driver.connect().await.unwrap());
        tracker.register(&handle);
        handles.push(handle);
    }
    handles
}

fn settings(leak_threshold: usize) -> MonitorSettings {
    MonitorSettings {
        interval: Duration::from_secs(30),
        leak_threshold,
    }
}

#[tokio::test]
async fn test_tick_below_threshold_leaves_connections() {
    let driver = MockDriver::new();
    let tracker = ResourceTracker::new();
    let handles = leak(&driver, &tracker, 3).await;
    let monitor = LeakMonitor::new(tracker.clone(), settings(3));

    assert_eq!(monitor.tick().await, 0);
    assert_eq!(tracker.snapshot().active, 3);
    assert!(handles.iter().all(|h| !h.is_detached()));
    assert_eq!(driver.closes(), 0);
}

#[tokio::test]
async fn test_tick_above_threshold_detaches_everything() {
    let driver = MockDriver::new();
    let tracker = ResourceTracker::new();
    let handles = leak(&driver, &tracker, 4).await;
    let monitor = LeakMonitor::new(tracker.clone(), settings(3));

    assert_eq!(monitor.tick().await, 4);
    assert!(handles.iter().all(ConnectionHandle::is_detached));
    assert_eq!(driver.closes(), 4);

    let stats = tracker.snapshot();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.total, 4);
    assert_eq!(stats.peak, 4);
    assert_eq!(stats.errors, 0);
}

#[tokio::test]
async fn test_threshold_zero_sweeps_single_connection() {
    let driver = MockDriver::new();
    let tracker = ResourceTracker::new();
    let handles = leak(&driver, &tracker, 1).await;
    let monitor = LeakMonitor::new(tracker.clone(), settings(0));

    assert_eq!(monitor.tick().await, 1);
    assert!(handles[0].is_detached());
    assert_eq!(tracker.snapshot().active, 0);
}

#[tokio::test]
async fn test_sweep_counts_detach_failures() {
    let driver = MockDriver::with_plans(vec![
        SessionPlan {
            close: Some(DriverError::new("broken pipe")),
            ..SessionPlan::ok()
        },
        SessionPlan::ok(),
    ]);
    let tracker = ResourceTracker::new();
    leak(&driver, &tracker, 2).await;
    let monitor = LeakMonitor::new(tracker.clone(), settings(0));

    assert_eq!(monitor.tick().await, 2);
    let stats = tracker.snapshot();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.errors, 1);
}

#[tokio::test]
async fn test_shutdown_fires_once() {
    let driver = MockDriver::new();
    let tracker = ResourceTracker::new();
    leak(&driver, &tracker, 2).await;
    let monitor = LeakMonitor::start(tracker.clone(), settings(5));

    assert!(!monitor.is_shut_down());
    assert_eq!(monitor.shutdown().await, Some(2));
    assert!(monitor.is_shut_down());
    assert_eq!(tracker.snapshot().active, 0);

    leak(&driver, &tracker, 1).await;
    assert_eq!(monitor.shutdown().await, None);
    assert_eq!(tracker.snapshot().active, 1);
    assert_eq!(driver.closes(), 2);
}

#[tokio::test]
async fn test_ticker_sweeps_in_background() {
    let driver = MockDriver::new();
    let tracker = ResourceTracker::new();
    let handles = leak(&driver, &tracker, 2).await;
    let _monitor = LeakMonitor::start(
        tracker.clone(),
        MonitorSettings {
            interval: Duration::from_millis(20),
            leak_threshold: 1,
        },
    );

    let swept = tokio::time::timeout(Duration::from_secs(5), async {
        while tracker.snapshot().active > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    assert!(swept.is_ok(), "Monitor did not sweep leaked connections");
    assert!(handles.iter().all(ConnectionHandle::is_detached));
}

#[tokio::test]
async fn test_sweep_does_not_touch_released_connections() {
    let driver = MockDriver::new();
    let tracker = ResourceTracker::new();
    let handles = leak(&driver, &tracker, 2).await;
    handles[0].detach().await.unwrap();

    let monitor = LeakMonitor::new(tracker.clone(), settings(0));
    assert_eq!(monitor.sweep().await, 1);
    assert_eq!(driver.closes(), 2);
}

#[tokio::test]
async fn test_abandoned_sweep_still_deregisters() {
    let driver = MockDriver::with_plans(vec![SessionPlan {
        close_delay: Some(Duration::from_millis(200)),
        ..SessionPlan::ok()
    }]);
    let tracker = ResourceTracker::new();
    let handles = leak(&driver, &tracker, 1).await;
    let monitor = LeakMonitor::new(tracker.clone(), settings(0));

    let abandoned = tokio::time::timeout(Duration::from_millis(20), monitor.sweep()).await;
    assert!(abandoned.is_err());

    // Waits for the close the abandoned sweep started
    handles[0].detach().await.unwrap();
    assert!(handles[0].is_detached());
    assert_eq!(tracker.snapshot().active, 0);
    assert_eq!(monitor.sweep().await, 0);
    assert_eq!(monitor.sweep().await, 0);
    assert_eq!(driver.closes(), 1);
}

#[tokio::test]
async fn test_release_during_sweep_waits_for_close() {
    let driver = MockDriver::with_plans(vec![SessionPlan {
        close_delay: Some(Duration::from_millis(100)),
        ..SessionPlan::ok()
    }]);
    let tracker = ResourceTracker::new();
    let handles = leak(&driver, &tracker, 1).await;
    let monitor = LeakMonitor::new(tracker.clone(), settings(0));

    let sweep = tokio::spawn({
        let monitor = monitor.clone();
        async move { monitor.sweep().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    ResourceReleaser::new(tracker.clone())
        .release(Some(handles[0].clone()), None)
        .await;
    assert!(!tracker.contains(handles[0].id()));
    assert_eq!(tracker.snapshot().active, 0);

    assert_eq!(sweep.await.unwrap(), 1);
    assert_eq!(driver.closes(), 1);
    assert_eq!(tracker.snapshot().errors, 0);
}
