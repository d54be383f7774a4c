//! Platform hook seam
//!
//! A concrete native backend (WASAPI-style, CoreAudio-style, ...) plugs into
//! the core by implementing [`PlatformHooks`]. The core calls every hook on
//! the management thread, with two exceptions that run on the device's I/O
//! thread and are marked as such. This discipline is enforced by
//! construction: only the management-thread loop and the I/O loop invoke
//! them.
//!
//! The in-tree [`mock`] implementation backs the test suite and
//! hardware-less environments.

pub mod mock;

use std::sync::Arc;
use std::time::Duration;

use crate::device::DeviceHandle;
use crate::error::BackendResult;
use crate::types::{AudioSpec, DeviceId, DeviceInfo, NegotiatedFormat};

/// Opaque context for an in-flight asynchronous activation.
///
/// Owned by the platform layer; the core only stores it while the request
/// is outstanding and hands it back through
/// [`PlatformHooks::release_activation_handle`], never inspecting it.
pub trait ActivationHandle: Send {}

/// Outcome of [`PlatformHooks::activate_device`]
pub enum Activation {
    /// Activation completed synchronously; the stream is ready
    Ready(NativeStream),
    /// Activation is in flight; the platform will call
    /// [`DeviceHandle::complete_activation`] later, from any thread
    Pending(Box<dyn ActivationHandle>),
}

/// How a native I/O call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFault {
    /// Stream invalidated but the endpoint might still be retried
    /// (e.g. default-device change)
    Lost,
    /// Endpoint permanently gone; no retry
    Dead,
}

/// Render side of a direction-exclusive native stream
pub trait RenderClient: Send {
    /// Fill and submit one period of `frames` frames.
    fn render_period(&mut self, frames: u32) -> Result<(), StreamFault>;
}

/// Capture side of a direction-exclusive native stream
pub trait CaptureClient: Send {
    /// Drain one period of up to `frames` frames.
    fn capture_period(&mut self, frames: u32) -> Result<(), StreamFault>;
}

/// Direction-exclusive native sub-interface
pub enum NativeIo {
    Render(Box<dyn RenderClient>),
    Capture(Box<dyn CaptureClient>),
}

/// Wait handle signaled by the native API when a new I/O period is ready
pub trait PeriodWaiter: Send {
    /// Block until the next period or until `timeout` elapses.
    ///
    /// Returns `true` if a period is ready. The I/O thread re-checks the
    /// disconnect flag after every return, so `timeout` bounds how stale
    /// that check can get.
    fn wait_period(&self, timeout: Duration) -> bool;
}

/// Everything activation yields: the native resources the I/O thread owns
/// for the remainder of the device's active life.
pub struct NativeStream {
    /// Render-or-capture sub-interface
    pub io: NativeIo,
    /// Per-period wait handle
    pub waiter: Box<dyn PeriodWaiter>,
    /// Format the stream actually runs at
    pub format: NegotiatedFormat,
}

/// Result of endpoint enumeration
#[derive(Debug, Clone, Default)]
pub struct EndpointList {
    /// All currently present endpoints
    pub devices: Vec<DeviceInfo>,
    /// Default playback endpoint, if any
    pub default_playback: Option<DeviceId>,
    /// Default capture endpoint, if any
    pub default_capture: Option<DeviceId>,
}

/// The fixed capability set a concrete native backend supplies.
///
/// Unless otherwise noted, every hook is invoked on the management thread
/// only.
pub trait PlatformHooks: Send + Sync + 'static {
    /// One-time platform initialization. Runs on the management thread
    /// before any task.
    fn init(&self) -> BackendResult<()>;

    /// Final platform teardown. Runs on the management thread after the
    /// task queue has drained.
    fn deinit(&self);

    /// Begin graceful shutdown: stop accepting new enumerations. Runs
    /// before the remaining queued tasks drain.
    fn deinit_start(&self);

    /// Enumerate currently present endpoints and report the defaults.
    fn enumerate_endpoints(&self) -> BackendResult<EndpointList>;

    /// Negotiate format and buffer size for a device.
    ///
    /// Failure leaves the device in its enumerated state.
    fn prepare_device(
        &self,
        device: &Arc<DeviceHandle>,
        requested: &AudioSpec,
    ) -> BackendResult<NegotiatedFormat>;

    /// Acquire the native render/capture sub-interface and period wait
    /// handle, synchronously or by starting an asynchronous activation.
    ///
    /// For the asynchronous form the platform must echo `generation` back
    /// through [`DeviceHandle::complete_activation`]; the core uses it to
    /// ignore completions for activation cycles that were since abandoned.
    fn activate_device(
        &self,
        device: &Arc<DeviceHandle>,
        generation: u64,
    ) -> BackendResult<Activation>;

    /// Per-thread setup (priority boost, per-thread platform context).
    /// Runs on the device's I/O thread, not the management thread.
    fn io_thread_init(&self, device: &DeviceHandle);

    /// Per-thread teardown. Runs on the device's I/O thread, not the
    /// management thread.
    fn io_thread_deinit(&self, device: &DeviceHandle);

    /// Release an abandoned or completed asynchronous activation context.
    fn release_activation_handle(&self, handle: Box<dyn ActivationHandle>);

    /// Free platform-side state for a device being destroyed. The device's
    /// per-object platform context, if one was recorded as initialized, is
    /// deinitialized here.
    fn free_device_handle(&self, device: &DeviceHandle);
}
