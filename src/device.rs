//! Device handle and lifecycle state
//!
//! One [`DeviceHandle`] exists per enumerated hardware endpoint. Its
//! bookkeeping lock guards only generic lifecycle bookkeeping shared with
//! callers; native resources are moved straight into the I/O thread at
//! activation and are never behind this lock, which is what makes the
//! executor's deadlock contract sufficient rather than merely advisory.
//!
//! The `disconnecting`/`lost`/`dead` flags are lock-free atomics shared
//! without the lock. Their observation by the I/O thread is a polling
//! contract: checked once per I/O period, monotonic once set except for a
//! deliberate clear by a fresh successful activation (`lost`) or by
//! management-thread teardown (`disconnecting`).

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::BackendResult;
use crate::manager::AudioBackend;
use crate::platform::{ActivationHandle, NativeStream};
use crate::types::{DeviceDirection, DeviceId, DeviceInfo, NegotiatedFormat};

/// Lifecycle stage, guarded by the bookkeeping lock.
///
/// There is no separate "activated" stage: the management task that
/// observes a completed activation starts the I/O thread in the same
/// breath, so activation success is only ever visible as `Active`.
pub(crate) enum Stage {
    /// Known from enumeration; no resources held
    Enumerated,
    /// Format and buffer size negotiated
    Prepared,
    /// Asynchronous activation outstanding; carries the opaque
    /// platform-owned context for it
    PendingActivation {
        handle: Box<dyn ActivationHandle>,
        generation: u64,
    },
    /// I/O thread running (or exiting); holds its join handle
    Active { io: Option<JoinHandle<()>> },
    /// Torn down; terminal
    Closed,
}

impl Stage {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Stage::Enumerated => "enumerated",
            Stage::Prepared => "prepared",
            Stage::PendingActivation { .. } => "pending-activation",
            Stage::Active { .. } => "active",
            Stage::Closed => "closed",
        }
    }
}

/// Generic per-device bookkeeping, shared with caller threads.
pub(crate) struct Bookkeeping {
    pub(crate) stage: Stage,
    pub(crate) format: Option<NegotiatedFormat>,
}

/// One hardware audio endpoint tracked by the backend.
pub struct DeviceHandle {
    id: DeviceId,
    name: String,
    direction: DeviceDirection,
    backend: Weak<AudioBackend>,
    pub(crate) book: Mutex<Bookkeeping>,
    /// Set by any thread via [`flag_disconnect`](Self::flag_disconnect),
    /// read by the I/O thread each period, cleared only by
    /// management-thread teardown of a still-usable device; latched once
    /// the device is dead. Deliberately not under `book`.
    disconnecting: AtomicBool,
    lost: AtomicBool,
    dead: AtomicBool,
    /// Whether a per-object platform context (COM-apartment-equivalent)
    /// was initialized and must be torn down in `free_device_handle`.
    platform_context: AtomicBool,
    activation_generation: AtomicU64,
}

impl DeviceHandle {
    pub(crate) fn new(info: DeviceInfo, backend: Weak<AudioBackend>) -> Arc<Self> {
        Arc::new(Self {
            id: info.id,
            name: info.name,
            direction: info.direction,
            backend,
            book: Mutex::new(Bookkeeping {
                stage: Stage::Enumerated,
                format: None,
            }),
            disconnecting: AtomicBool::new(false),
            lost: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            platform_context: AtomicBool::new(false),
            activation_generation: AtomicU64::new(0),
        })
    }

    /// Platform endpoint identifier
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Human-readable device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Endpoint direction
    pub fn direction(&self) -> DeviceDirection {
        self.direction
    }

    /// Format and period size negotiated during prepare, if prepared
    pub fn negotiated_format(&self) -> Option<NegotiatedFormat> {
        self.book.lock().format
    }

    /// Whether teardown has been requested
    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::Acquire)
    }

    /// Whether the stream was invalidated but may be reactivated
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Whether the endpoint is permanently gone
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub(crate) fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }

    pub(crate) fn clear_lost(&self) {
        self.lost.store(false, Ordering::Release);
    }

    pub(crate) fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    /// Set the disconnect flag without queueing a teardown. Used by the
    /// management thread at the start of an explicit close so the I/O
    /// thread stops before the join.
    pub(crate) fn raise_disconnecting(&self) {
        self.disconnecting.store(true, Ordering::Release);
    }

    pub(crate) fn clear_disconnecting(&self) {
        self.disconnecting.store(false, Ordering::Release);
    }

    pub(crate) fn next_activation_generation(&self) -> u64 {
        self.activation_generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Whether a per-object platform context is recorded as initialized
    pub fn platform_context_initialized(&self) -> bool {
        self.platform_context.load(Ordering::Acquire)
    }

    /// Record whether the per-object platform context is initialized.
    /// Called by platform hooks only.
    pub fn set_platform_context_initialized(&self, initialized: bool) {
        self.platform_context.store(initialized, Ordering::Release);
    }

    /// Signal from any thread that this device has gone away.
    ///
    /// Lock-free and non-blocking: sets the `disconnecting` flag and, on
    /// the first call only, queues the single fire-and-forget teardown
    /// task. Never acquires the bookkeeping lock (and must never be made
    /// to), so OS hot-plug callbacks holding arbitrary OS-internal locks
    /// can call it without any lock-order inversion. Teardown itself
    /// happens later on the management thread.
    pub fn flag_disconnect(self: &Arc<Self>) {
        // Dead is terminal: the single teardown and removal notification
        // already ran (or is queued), so late duplicate notifications from
        // the OS must not reopen the gate.
        if self.is_dead() {
            return;
        }
        if self.disconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(device = %self.id, "disconnect flagged");
        let Some(backend) = self.backend.upgrade() else {
            return;
        };
        let device = Arc::clone(self);
        let mgmt = Arc::clone(backend.management());
        if let Err(e) = mgmt.submit(move || backend.teardown_disconnected(device)) {
            warn!(device = %self.id, error = %e, "could not queue disconnect teardown");
        }
    }

    /// Deliver the result of an asynchronous activation.
    ///
    /// Callable from any thread; the transition itself is re-entered onto
    /// the management thread. `generation` must be the value passed to
    /// [`PlatformHooks::activate_device`](crate::platform::PlatformHooks::activate_device);
    /// completions for abandoned activation cycles are discarded there with
    /// their resources released exactly once.
    pub fn complete_activation(
        self: &Arc<Self>,
        generation: u64,
        result: BackendResult<NativeStream>,
    ) {
        let Some(backend) = self.backend.upgrade() else {
            return;
        };
        let device = Arc::clone(self);
        let mgmt = Arc::clone(backend.management());
        if let Err(e) =
            mgmt.submit(move || backend.finish_activation(device, generation, result))
        {
            warn!(device = %self.id, error = %e, "could not queue activation completion");
        }
    }

    pub(crate) fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            direction: self.direction,
        }
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("stage", &self.book.lock().stage.name())
            .field("disconnecting", &self.is_disconnecting())
            .field("lost", &self.is_lost())
            .field("dead", &self.is_dead())
            .finish()
    }
}
