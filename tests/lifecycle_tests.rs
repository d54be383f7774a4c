//! Device lifecycle integration tests
//!
//! End-to-end scenarios against the mock platform: open/close, hot-plug
//! disconnection, recoverable loss and reactivation, permanent death, and
//! the async-activation/disconnect race.

use std::sync::Arc;
use std::time::{Duration, Instant};

use audio_backend_core::platform::mock::{endpoint, MockPlatform};
use audio_backend_core::platform::StreamFault;
use audio_backend_core::{
    AudioBackend, BackendConfig, BackendError, DeviceDirection, DeviceEvent, DeviceId,
};
use serial_test::serial;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_test::assert_ok;

/// Honor RUST_LOG when diagnosing timing-sensitive failures.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn recv_event(rx: &mut UnboundedReceiver<DeviceEvent>, timeout: Duration) -> Option<DeviceEvent> {
    let deadline = Instant::now() + timeout;
    loop {
        match rx.try_recv() {
            Ok(ev) => return Some(ev),
            Err(TryRecvError::Empty) => {
                if Instant::now() >= deadline {
                    return None;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Disconnected) => return None,
        }
    }
}

fn test_config() -> BackendConfig {
    BackendConfig {
        reactivation_attempts: 3,
        reactivation_delay: Duration::from_millis(5),
        period_wait_timeout: Duration::from_millis(20),
    }
}

fn speakers_and_mic() -> Vec<audio_backend_core::DeviceInfo> {
    vec![
        endpoint("out-1", "Mock Speakers", DeviceDirection::Playback),
        endpoint("mic-1", "Mock Microphone", DeviceDirection::Capture),
    ]
}

#[test]
fn start_announces_endpoints_and_defaults() {
    let platform = MockPlatform::with_endpoints(speakers_and_mic());
    let (backend, mut events) =
        AudioBackend::start(platform.clone(), test_config()).unwrap();

    let mut added = Vec::new();
    for _ in 0..2 {
        match recv_event(&mut events, Duration::from_secs(1)) {
            Some(DeviceEvent::Added(info)) => added.push(info.id),
            other => panic!("expected Added event, got {:?}", other),
        }
    }
    assert!(added.contains(&DeviceId::new("out-1")));
    assert!(added.contains(&DeviceId::new("mic-1")));

    assert_eq!(backend.default_playback(), Some(DeviceId::new("out-1")));
    assert_eq!(backend.default_capture(), Some(DeviceId::new("mic-1")));
    assert_eq!(backend.devices().len(), 2);

    backend.shutdown();
    assert_eq!(platform.deinit_calls(), 1);
}

#[test]
fn enumeration_failure_fails_start() {
    let platform = MockPlatform::with_endpoints(speakers_and_mic());
    platform.fail_next_enumerations(1);

    let err = AudioBackend::start(platform.clone(), test_config()).unwrap_err();
    assert!(matches!(err, BackendError::EnumerationFailed { .. }));
    // The management thread is stopped again on the failure path.
    assert_eq!(platform.deinit_calls(), 1);
}

#[test]
#[serial]
fn open_runs_io_and_close_tears_down_in_order() {
    init_tracing();
    let platform = MockPlatform::with_endpoints(speakers_and_mic());
    let (backend, mut events) =
        AudioBackend::start(platform.clone(), test_config()).unwrap();
    while recv_event(&mut events, Duration::from_millis(50)).is_some() {}

    let device = backend.open(&DeviceId::new("out-1")).unwrap();
    assert!(device.negotiated_format().is_some());
    assert!(
        wait_until(Duration::from_secs(2), || platform.periods_done() > 10),
        "I/O thread never rendered"
    );
    assert_eq!(platform.io_thread_inits(), 1);

    backend.close(&device).unwrap();
    assert_eq!(platform.io_thread_deinits(), 1);
    assert_eq!(platform.streams_dropped(), 1);
    assert_eq!(platform.device_handles_freed(), 1);
    assert!(!device.platform_context_initialized());
    assert!(!device.is_disconnecting());

    // An explicit close is not a removal.
    assert!(recv_event(&mut events, Duration::from_millis(50)).is_none());

    backend.shutdown();
}

#[test]
#[serial]
fn closed_device_can_be_reopened() {
    init_tracing();
    let platform = MockPlatform::with_endpoints(speakers_and_mic());
    let (backend, mut events) =
        AudioBackend::start(platform.clone(), test_config()).unwrap();
    while recv_event(&mut events, Duration::from_millis(50)).is_some() {}

    let device = backend.open(&DeviceId::new("out-1")).unwrap();
    backend.close(&device).unwrap();
    assert_eq!(platform.device_handles_freed(), 1);

    // Close released everything but the endpoint stays registered; the
    // same handle opens again without a rescan.
    let reopened = backend.open(&DeviceId::new("out-1")).unwrap();
    assert!(Arc::ptr_eq(&device, &reopened));
    assert!(
        wait_until(Duration::from_secs(2), || platform.io_thread_inits() == 2),
        "second open never started an I/O thread"
    );

    backend.close(&reopened).unwrap();
    assert_eq!(platform.device_handles_freed(), 2);
    assert!(recv_event(&mut events, Duration::from_millis(50)).is_none());

    backend.shutdown();
}

#[test]
fn prepare_failure_surfaces_and_device_stays_openable() {
    let platform = MockPlatform::with_endpoints(speakers_and_mic());
    let (backend, _events) =
        AudioBackend::start(platform.clone(), test_config()).unwrap();

    platform.fail_next_prepares(1);
    let err = backend.open(&DeviceId::new("out-1")).unwrap_err();
    assert!(matches!(err, BackendError::PrepareFailed { .. }));

    // Failure left the device enumerated; a later open succeeds.
    let device = backend.open(&DeviceId::new("out-1")).unwrap();
    backend.close(&device).unwrap();
    backend.shutdown();
}

#[test]
fn activation_failure_surfaces_and_device_stays_openable() {
    let platform = MockPlatform::with_endpoints(speakers_and_mic());
    let (backend, _events) =
        AudioBackend::start(platform.clone(), test_config()).unwrap();

    platform.fail_next_activations(1);
    let err = backend.open(&DeviceId::new("out-1")).unwrap_err();
    assert!(matches!(err, BackendError::ActivationFailed { .. }));

    let device = backend.open(&DeviceId::new("out-1")).unwrap();
    backend.close(&device).unwrap();
    backend.shutdown();
}

#[test]
fn open_unknown_device_fails() {
    let platform = MockPlatform::with_endpoints(speakers_and_mic());
    let (backend, _events) =
        AudioBackend::start(platform.clone(), test_config()).unwrap();

    let err = backend.open(&DeviceId::new("no-such-endpoint")).unwrap_err();
    assert!(matches!(err, BackendError::DeviceNotFound { .. }));
    backend.shutdown();
}

#[test]
#[serial]
fn hot_plug_disconnect_stops_io_and_notifies_once() {
    init_tracing();
    let platform = MockPlatform::with_endpoints(speakers_and_mic());
    let (backend, mut events) =
        AudioBackend::start(platform.clone(), test_config()).unwrap();
    while recv_event(&mut events, Duration::from_millis(50)).is_some() {}

    let device = backend.open(&DeviceId::new("out-1")).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        platform.periods_done() > 5
    }));

    // Simulate the OS removal notification arriving on a foreign thread.
    {
        let d = Arc::clone(&device);
        std::thread::spawn(move || d.flag_disconnect())
            .join()
            .unwrap();
    }

    match recv_event(&mut events, Duration::from_secs(2)) {
        Some(DeviceEvent::Removed(id)) => assert_eq!(id, DeviceId::new("out-1")),
        other => panic!("expected Removed event, got {:?}", other),
    }

    // Teardown ran before the notification: no further native I/O happens.
    let after_removal = platform.periods_done();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(platform.periods_done(), after_removal);

    assert!(device.is_dead());
    assert_eq!(platform.streams_dropped(), 1);
    assert_eq!(platform.device_handles_freed(), 1);
    assert!(backend.device(&DeviceId::new("out-1")).is_none());

    // Exactly one notification.
    assert!(recv_event(&mut events, Duration::from_millis(50)).is_none());

    backend.shutdown();
}

#[test]
#[serial]
fn duplicate_disconnect_after_teardown_stays_silent() {
    init_tracing();
    let platform = MockPlatform::with_endpoints(speakers_and_mic());
    let (backend, mut events) =
        AudioBackend::start(platform.clone(), test_config()).unwrap();
    while recv_event(&mut events, Duration::from_millis(50)).is_some() {}

    let device = backend.open(&DeviceId::new("out-1")).unwrap();
    device.flag_disconnect();
    assert!(matches!(
        recv_event(&mut events, Duration::from_secs(2)),
        Some(DeviceEvent::Removed(_))
    ));
    assert!(device.is_dead());

    // A late duplicate OS notification must not queue a second teardown
    // or a second removal.
    device.flag_disconnect();
    assert!(recv_event(&mut events, Duration::from_millis(100)).is_none());
    assert_eq!(platform.device_handles_freed(), 1);

    backend.shutdown();
}

#[test]
fn concurrent_disconnect_flags_collapse_to_one_teardown() {
    let platform = MockPlatform::with_endpoints(speakers_and_mic());
    let (backend, mut events) =
        AudioBackend::start(platform.clone(), test_config()).unwrap();
    while recv_event(&mut events, Duration::from_millis(50)).is_some() {}

    let device = backend.open(&DeviceId::new("out-1")).unwrap();

    let mut flaggers = Vec::new();
    for _ in 0..8 {
        let d = Arc::clone(&device);
        flaggers.push(std::thread::spawn(move || d.flag_disconnect()));
    }
    for f in flaggers {
        f.join().unwrap();
    }

    assert!(matches!(
        recv_event(&mut events, Duration::from_secs(2)),
        Some(DeviceEvent::Removed(_))
    ));
    assert!(recv_event(&mut events, Duration::from_millis(50)).is_none());
    assert_eq!(platform.device_handles_freed(), 1);

    backend.shutdown();
}

#[test]
fn dead_device_needs_fresh_enumeration_to_come_back() {
    let platform = MockPlatform::with_endpoints(speakers_and_mic());
    let (backend, mut events) =
        AudioBackend::start(platform.clone(), test_config()).unwrap();
    while recv_event(&mut events, Duration::from_millis(50)).is_some() {}

    let device = backend.open(&DeviceId::new("out-1")).unwrap();
    let activations_before = platform.activate_calls();
    device.flag_disconnect();
    assert!(matches!(
        recv_event(&mut events, Duration::from_secs(2)),
        Some(DeviceEvent::Removed(_))
    ));

    // No re-activation without a new enumeration.
    let err = backend.open(&DeviceId::new("out-1")).unwrap_err();
    assert!(matches!(err, BackendError::DeviceNotFound { .. }));
    assert_eq!(platform.activate_calls(), activations_before);
    assert!(device.is_dead());

    // The endpoint reappearing in an enumeration creates a fresh handle.
    backend.rescan().unwrap();
    assert!(matches!(
        recv_event(&mut events, Duration::from_secs(1)),
        Some(DeviceEvent::Added(_))
    ));
    let reopened = backend.open(&DeviceId::new("out-1")).unwrap();
    assert!(!reopened.is_dead());

    backend.close(&reopened).unwrap();
    backend.shutdown();
}

#[test]
#[serial]
fn lost_stream_reactivates_exactly_once_per_loss() {
    init_tracing();
    let platform = MockPlatform::with_endpoints(speakers_and_mic());
    let (backend, mut events) =
        AudioBackend::start(platform.clone(), test_config()).unwrap();
    while recv_event(&mut events, Duration::from_millis(50)).is_some() {}

    platform.script_stream_fault(3, StreamFault::Lost);
    let device = backend.open(&DeviceId::new("out-1")).unwrap();
    assert_eq!(platform.activate_calls(), 1);

    // One loss event, one transparent reactivation.
    assert!(
        wait_until(Duration::from_secs(2), || platform.activate_calls() == 2),
        "device never reactivated"
    );
    let after_recovery = platform.periods_done();
    assert!(wait_until(Duration::from_secs(2), || {
        platform.periods_done() > after_recovery + 10
    }));
    assert!(!device.is_lost());
    assert!(!device.is_dead());
    assert_eq!(platform.activate_calls(), 2);
    assert_eq!(platform.io_thread_inits(), 2);

    backend.close(&device).unwrap();
    backend.shutdown();
}

#[test]
#[serial]
fn exhausted_reactivation_turns_loss_into_death() {
    init_tracing();
    let platform = MockPlatform::with_endpoints(speakers_and_mic());
    let config = BackendConfig {
        reactivation_attempts: 2,
        reactivation_delay: Duration::from_millis(5),
        period_wait_timeout: Duration::from_millis(20),
    };
    let (backend, mut events) =
        AudioBackend::start(platform.clone(), config).unwrap();
    while recv_event(&mut events, Duration::from_millis(50)).is_some() {}

    // Slow the period down so the failure script is in place before the
    // first fault fires.
    platform.set_period(Duration::from_millis(20));
    platform.script_stream_fault(1, StreamFault::Lost);
    let device = backend.open(&DeviceId::new("out-1")).unwrap();
    platform.fail_next_prepares(2);

    match recv_event(&mut events, Duration::from_secs(2)) {
        Some(DeviceEvent::Removed(id)) => assert_eq!(id, DeviceId::new("out-1")),
        other => panic!("expected Removed event, got {:?}", other),
    }
    assert!(device.is_dead());
    assert_eq!(platform.device_handles_freed(), 1);
    assert!(backend.device(&DeviceId::new("out-1")).is_none());

    backend.shutdown();
}

#[test]
#[serial]
fn dead_stream_fault_tears_down_without_retry() {
    init_tracing();
    let platform = MockPlatform::with_endpoints(speakers_and_mic());
    let (backend, mut events) =
        AudioBackend::start(platform.clone(), test_config()).unwrap();
    while recv_event(&mut events, Duration::from_millis(50)).is_some() {}

    platform.script_stream_fault(2, StreamFault::Dead);
    let device = backend.open(&DeviceId::new("out-1")).unwrap();
    let activations_before = platform.activate_calls();

    match recv_event(&mut events, Duration::from_secs(2)) {
        Some(DeviceEvent::Removed(id)) => assert_eq!(id, DeviceId::new("out-1")),
        other => panic!("expected Removed event, got {:?}", other),
    }
    assert!(device.is_dead());
    assert_eq!(platform.activate_calls(), activations_before);

    backend.shutdown();
}

#[test]
fn async_activation_completes_on_the_management_thread() {
    let platform = MockPlatform::with_endpoints(speakers_and_mic());
    let (backend, mut events) =
        AudioBackend::start(platform.clone(), test_config()).unwrap();
    while recv_event(&mut events, Duration::from_millis(50)).is_some() {}

    platform.set_async_activation(true);
    let device = backend.open(&DeviceId::new("out-1")).unwrap();
    assert_eq!(platform.pending_activations(), 1);
    assert_eq!(platform.io_thread_inits(), 0);

    assert!(platform.complete_next_activation(true));
    assert!(
        wait_until(Duration::from_secs(2), || platform.periods_done() > 0),
        "device never became active after async completion"
    );
    assert_eq!(platform.activation_handles_released(), 1);

    backend.close(&device).unwrap();
    backend.shutdown();
}

#[test]
fn async_activation_failure_leaves_device_openable() {
    let platform = MockPlatform::with_endpoints(speakers_and_mic());
    let (backend, mut events) =
        AudioBackend::start(platform.clone(), test_config()).unwrap();
    while recv_event(&mut events, Duration::from_millis(50)).is_some() {}

    platform.set_async_activation(true);
    let device = backend.open(&DeviceId::new("out-1")).unwrap();
    assert_eq!(platform.pending_activations(), 1);

    assert!(platform.complete_next_activation(false));
    assert!(wait_until(Duration::from_secs(2), || {
        platform.activation_handles_released() == 1
    }));

    // The failure never starts I/O and is not a removal.
    assert_eq!(platform.io_thread_inits(), 0);
    assert_eq!(platform.periods_done(), 0);
    assert!(recv_event(&mut events, Duration::from_millis(50)).is_none());
    assert!(!device.is_dead());

    // The endpoint is still openable, synchronously this time.
    platform.set_async_activation(false);
    let reopened = backend.open(&DeviceId::new("out-1")).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        platform.periods_done() > 0
    }));

    backend.close(&reopened).unwrap();
    backend.shutdown();
}

#[test]
fn disconnect_before_async_completion_abandons_the_activation() {
    let platform = MockPlatform::with_endpoints(speakers_and_mic());
    let (backend, mut events) =
        AudioBackend::start(platform.clone(), test_config()).unwrap();
    while recv_event(&mut events, Duration::from_millis(50)).is_some() {}

    platform.set_async_activation(true);
    let device = backend.open(&DeviceId::new("out-1")).unwrap();
    assert_eq!(platform.pending_activations(), 1);

    device.flag_disconnect();
    assert!(matches!(
        recv_event(&mut events, Duration::from_secs(2)),
        Some(DeviceEvent::Removed(_))
    ));
    // Teardown consumed the outstanding activation context exactly once.
    assert_eq!(platform.activation_handles_released(), 1);

    // The late completion must not activate the device, and the abandoned
    // stream is released exactly once, never double-freed.
    assert!(platform.complete_next_activation(true));
    assert!(wait_until(Duration::from_secs(2), || {
        platform.streams_dropped() == 1
    }));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(platform.io_thread_inits(), 0);
    assert_eq!(platform.periods_done(), 0);
    assert_eq!(platform.activation_handles_released(), 1);
    assert_eq!(platform.streams_dropped(), 1);

    backend.shutdown();
}

#[test]
fn rescan_picks_up_new_endpoints() {
    let platform = MockPlatform::with_endpoints(vec![endpoint(
        "out-1",
        "Mock Speakers",
        DeviceDirection::Playback,
    )]);
    let (backend, mut events) =
        AudioBackend::start(platform.clone(), test_config()).unwrap();
    while recv_event(&mut events, Duration::from_millis(50)).is_some() {}

    platform.add_endpoint(endpoint("mic-1", "Mock Microphone", DeviceDirection::Capture));
    backend.rescan().unwrap();

    match recv_event(&mut events, Duration::from_secs(1)) {
        Some(DeviceEvent::Added(info)) => assert_eq!(info.id, DeviceId::new("mic-1")),
        other => panic!("expected Added event, got {:?}", other),
    }
    assert_eq!(backend.devices().len(), 2);
    assert_eq!(backend.default_capture(), Some(DeviceId::new("mic-1")));

    backend.shutdown();
}

#[test]
fn operations_after_shutdown_are_rejected() {
    let platform = MockPlatform::with_endpoints(speakers_and_mic());
    let (backend, _events) =
        AudioBackend::start(platform.clone(), test_config()).unwrap();

    backend.shutdown();
    let err = backend.rescan().unwrap_err();
    assert_eq!(err, BackendError::TaskRejected);
    let err = backend.open(&DeviceId::new("out-1")).unwrap_err();
    assert_eq!(err, BackendError::TaskRejected);
}

#[tokio::test]
async fn events_are_consumable_from_async_context() {
    let platform = MockPlatform::with_endpoints(vec![endpoint(
        "out-1",
        "Mock Speakers",
        DeviceDirection::Playback,
    )]);
    let p = Arc::clone(&platform);
    let (backend, mut events) =
        tokio::task::spawn_blocking(move || AudioBackend::start(p, BackendConfig::default()))
            .await
            .unwrap()
            .unwrap();

    match events.recv().await {
        Some(DeviceEvent::Added(info)) => assert_eq!(info.id, DeviceId::new("out-1")),
        other => panic!("expected Added event, got {:?}", other),
    }
    let rescan = tokio::task::spawn_blocking({
        let b = Arc::clone(&backend);
        move || b.rescan()
    })
    .await
    .unwrap();
    assert_ok!(rescan);

    tokio::task::spawn_blocking(move || backend.shutdown())
        .await
        .unwrap();
}
