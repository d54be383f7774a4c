//! In-memory mock platform
//!
//! Implements the full hook seam against memory-backed "endpoints" so the
//! lifecycle core can be exercised without audio hardware: scripted
//! prepare/activation failures, synchronous or asynchronous activation,
//! scripted stream faults at a chosen period, and invocation counters for
//! every hook.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::device::DeviceHandle;
use crate::error::{BackendError, BackendResult};
use crate::platform::{
    Activation, ActivationHandle, CaptureClient, EndpointList, NativeIo, NativeStream,
    PeriodWaiter, PlatformHooks, RenderClient, StreamFault,
};
use crate::types::{AudioSpec, DeviceDirection, DeviceInfo, NegotiatedFormat};

/// Convenience constructor for test endpoints
pub fn endpoint(id: &str, name: &str, direction: DeviceDirection) -> DeviceInfo {
    DeviceInfo {
        id: id.into(),
        name: name.to_string(),
        direction,
    }
}

#[derive(Default)]
struct Counters {
    init: AtomicU64,
    deinit: AtomicU64,
    deinit_start: AtomicU64,
    enumerate: AtomicU64,
    prepare: AtomicU64,
    activate: AtomicU64,
    io_init: AtomicU64,
    io_deinit: AtomicU64,
    releases: AtomicU64,
    frees: AtomicU64,
    periods: AtomicU64,
    stream_drops: AtomicU64,
}

struct MockActivationHandle;

impl ActivationHandle for MockActivationHandle {}

struct PendingEntry {
    device: Arc<DeviceHandle>,
    generation: u64,
}

#[derive(Clone, Copy)]
struct FaultScript {
    after_periods: u64,
    fault: StreamFault,
}

/// Shared guts of one mock stream; dropped exactly once when the stream's
/// sub-interface is released.
struct MockStreamCore {
    counters: Arc<Counters>,
    fault: Option<FaultScript>,
    periods_done: u64,
}

impl MockStreamCore {
    fn run_period(&mut self) -> Result<(), StreamFault> {
        if let Some(script) = self.fault {
            if self.periods_done >= script.after_periods {
                return Err(script.fault);
            }
        }
        self.periods_done += 1;
        self.counters.periods.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MockStreamCore {
    fn drop(&mut self) {
        self.counters.stream_drops.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockRenderClient(MockStreamCore);

impl RenderClient for MockRenderClient {
    fn render_period(&mut self, _frames: u32) -> Result<(), StreamFault> {
        self.0.run_period()
    }
}

struct MockCaptureClient(MockStreamCore);

impl CaptureClient for MockCaptureClient {
    fn capture_period(&mut self, _frames: u32) -> Result<(), StreamFault> {
        self.0.run_period()
    }
}

struct MockWaiter {
    period: Duration,
}

impl PeriodWaiter for MockWaiter {
    fn wait_period(&self, timeout: Duration) -> bool {
        std::thread::sleep(self.period.min(timeout));
        true
    }
}

/// Scriptable in-memory platform
pub struct MockPlatform {
    endpoints: Mutex<EndpointList>,
    counters: Arc<Counters>,
    period: Mutex<Duration>,
    enumerate_failures: AtomicU32,
    prepare_failures: AtomicU32,
    activate_failures: AtomicU32,
    async_activation: AtomicBool,
    pending: Mutex<VecDeque<PendingEntry>>,
    fault_script: Mutex<Option<FaultScript>>,
}

impl MockPlatform {
    /// Create a platform presenting the given endpoints; the first
    /// playback/capture endpoints become the defaults.
    pub fn with_endpoints(devices: Vec<DeviceInfo>) -> Arc<Self> {
        let default_playback = devices
            .iter()
            .find(|d| d.direction == DeviceDirection::Playback)
            .map(|d| d.id.clone());
        let default_capture = devices
            .iter()
            .find(|d| d.direction == DeviceDirection::Capture)
            .map(|d| d.id.clone());
        Arc::new(Self {
            endpoints: Mutex::new(EndpointList {
                devices,
                default_playback,
                default_capture,
            }),
            counters: Arc::new(Counters::default()),
            period: Mutex::new(Duration::from_millis(2)),
            enumerate_failures: AtomicU32::new(0),
            prepare_failures: AtomicU32::new(0),
            activate_failures: AtomicU32::new(0),
            async_activation: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            fault_script: Mutex::new(None),
        })
    }

    /// Make an additional endpoint appear; picked up by the next rescan.
    pub fn add_endpoint(&self, info: DeviceInfo) {
        let mut list = self.endpoints.lock();
        match info.direction {
            DeviceDirection::Playback if list.default_playback.is_none() => {
                list.default_playback = Some(info.id.clone());
            }
            DeviceDirection::Capture if list.default_capture.is_none() => {
                list.default_capture = Some(info.id.clone());
            }
            _ => {}
        }
        list.devices.push(info);
    }

    /// Simulated I/O period length.
    pub fn set_period(&self, period: Duration) {
        *self.period.lock() = period;
    }

    /// Fail the next `n` enumerations.
    pub fn fail_next_enumerations(&self, n: u32) {
        self.enumerate_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` prepare calls.
    pub fn fail_next_prepares(&self, n: u32) {
        self.prepare_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` activation calls.
    pub fn fail_next_activations(&self, n: u32) {
        self.activate_failures.store(n, Ordering::SeqCst);
    }

    /// Switch between synchronous (Win32-style) and asynchronous
    /// (activation-handler-style) activation.
    pub fn set_async_activation(&self, on: bool) {
        self.async_activation.store(on, Ordering::SeqCst);
    }

    /// Number of asynchronous activations awaiting completion.
    pub fn pending_activations(&self) -> usize {
        self.pending.lock().len()
    }

    /// Complete the oldest pending asynchronous activation, successfully or
    /// with a scripted failure. Returns `false` if none is pending.
    pub fn complete_next_activation(&self, success: bool) -> bool {
        let entry = self.pending.lock().pop_front();
        let Some(entry) = entry else {
            return false;
        };
        let result = if success {
            Ok(self.make_stream(&entry.device))
        } else {
            Err(BackendError::ActivationFailed {
                device_id: entry.device.id().clone(),
                reason: "scripted async activation failure".to_string(),
            })
        };
        entry.device.complete_activation(entry.generation, result);
        true
    }

    /// Make the next created stream fault after `after_periods` successful
    /// periods.
    pub fn script_stream_fault(&self, after_periods: u64, fault: StreamFault) {
        *self.fault_script.lock() = Some(FaultScript {
            after_periods,
            fault,
        });
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn make_stream(&self, device: &DeviceHandle) -> NativeStream {
        let format = device.negotiated_format().unwrap_or(NegotiatedFormat {
            spec: AudioSpec::default(),
            period_frames: 480,
        });
        let core = MockStreamCore {
            counters: Arc::clone(&self.counters),
            fault: self.fault_script.lock().take(),
            periods_done: 0,
        };
        let io = match device.direction() {
            DeviceDirection::Playback => NativeIo::Render(Box::new(MockRenderClient(core))),
            DeviceDirection::Capture => NativeIo::Capture(Box::new(MockCaptureClient(core))),
        };
        NativeStream {
            io,
            waiter: Box::new(MockWaiter {
                period: *self.period.lock(),
            }),
            format,
        }
    }

    pub fn init_calls(&self) -> u64 {
        self.counters.init.load(Ordering::SeqCst)
    }

    pub fn deinit_calls(&self) -> u64 {
        self.counters.deinit.load(Ordering::SeqCst)
    }

    pub fn deinit_start_calls(&self) -> u64 {
        self.counters.deinit_start.load(Ordering::SeqCst)
    }

    pub fn enumerate_calls(&self) -> u64 {
        self.counters.enumerate.load(Ordering::SeqCst)
    }

    pub fn prepare_calls(&self) -> u64 {
        self.counters.prepare.load(Ordering::SeqCst)
    }

    pub fn activate_calls(&self) -> u64 {
        self.counters.activate.load(Ordering::SeqCst)
    }

    pub fn io_thread_inits(&self) -> u64 {
        self.counters.io_init.load(Ordering::SeqCst)
    }

    pub fn io_thread_deinits(&self) -> u64 {
        self.counters.io_deinit.load(Ordering::SeqCst)
    }

    pub fn activation_handles_released(&self) -> u64 {
        self.counters.releases.load(Ordering::SeqCst)
    }

    pub fn device_handles_freed(&self) -> u64 {
        self.counters.frees.load(Ordering::SeqCst)
    }

    /// Total periods rendered/captured across all streams.
    pub fn periods_done(&self) -> u64 {
        self.counters.periods.load(Ordering::SeqCst)
    }

    /// Number of native streams released (sub-interface dropped).
    pub fn streams_dropped(&self) -> u64 {
        self.counters.stream_drops.load(Ordering::SeqCst)
    }
}

impl PlatformHooks for MockPlatform {
    fn init(&self) -> BackendResult<()> {
        self.counters.init.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn deinit(&self) {
        self.counters.deinit.fetch_add(1, Ordering::SeqCst);
    }

    fn deinit_start(&self) {
        self.counters.deinit_start.fetch_add(1, Ordering::SeqCst);
    }

    fn enumerate_endpoints(&self) -> BackendResult<EndpointList> {
        self.counters.enumerate.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.enumerate_failures) {
            return Err(BackendError::EnumerationFailed {
                reason: "scripted enumeration failure".to_string(),
            });
        }
        Ok(self.endpoints.lock().clone())
    }

    fn prepare_device(
        &self,
        device: &Arc<DeviceHandle>,
        requested: &AudioSpec,
    ) -> BackendResult<NegotiatedFormat> {
        self.counters.prepare.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.prepare_failures) {
            return Err(BackendError::PrepareFailed {
                device_id: device.id().clone(),
                reason: "scripted prepare failure".to_string(),
            });
        }
        device.set_platform_context_initialized(true);
        Ok(NegotiatedFormat {
            spec: *requested,
            period_frames: 480,
        })
    }

    fn activate_device(
        &self,
        device: &Arc<DeviceHandle>,
        generation: u64,
    ) -> BackendResult<Activation> {
        self.counters.activate.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.activate_failures) {
            return Err(BackendError::ActivationFailed {
                device_id: device.id().clone(),
                reason: "scripted activation failure".to_string(),
            });
        }
        if self.async_activation.load(Ordering::SeqCst) {
            self.pending.lock().push_back(PendingEntry {
                device: Arc::clone(device),
                generation,
            });
            Ok(Activation::Pending(Box::new(MockActivationHandle)))
        } else {
            Ok(Activation::Ready(self.make_stream(device)))
        }
    }

    fn io_thread_init(&self, _device: &DeviceHandle) {
        self.counters.io_init.fetch_add(1, Ordering::SeqCst);
    }

    fn io_thread_deinit(&self, _device: &DeviceHandle) {
        self.counters.io_deinit.fetch_add(1, Ordering::SeqCst);
    }

    fn release_activation_handle(&self, handle: Box<dyn ActivationHandle>) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
        drop(handle);
    }

    fn free_device_handle(&self, device: &DeviceHandle) {
        device.set_platform_context_initialized(false);
        self.counters.frees.fetch_add(1, Ordering::SeqCst);
    }
}
