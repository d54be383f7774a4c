//! Backend manager: the public open/close/query surface
//!
//! `AudioBackend` owns the management thread, the device registry, and the
//! outbound event channel. Every lifecycle mutation — enumeration,
//! prepare, activation, reactivation, teardown — is a task serialized onto
//! the management thread; callers on arbitrary threads only ever block
//! inside `submit_and_wait`, never on a device's own lock and the
//! management thread together.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::device::{DeviceHandle, Stage};
use crate::error::{BackendError, BackendResult};
use crate::executor::ManagementThread;
use crate::io_thread;
use crate::platform::{Activation, ActivationHandle, NativeStream, PlatformHooks};
use crate::types::{AudioSpec, BackendConfig, DeviceEvent, DeviceId, DeviceInfo, NegotiatedFormat};

#[derive(Default)]
struct Defaults {
    playback: Option<DeviceId>,
    capture: Option<DeviceId>,
}

/// The audio-device backend core.
///
/// Create with [`AudioBackend::start`]; the returned receiver carries
/// [`DeviceEvent`] notifications (always sent without any device lock
/// held). Drop of the receiver is tolerated: events are then discarded.
pub struct AudioBackend {
    config: BackendConfig,
    platform: Arc<dyn PlatformHooks>,
    mgmt: Arc<ManagementThread>,
    devices: DashMap<DeviceId, Arc<DeviceHandle>>,
    defaults: Mutex<Defaults>,
    events: mpsc::UnboundedSender<DeviceEvent>,
}

impl AudioBackend {
    /// Start the backend: spawn the management thread (which runs the
    /// platform init hook) and perform the initial endpoint enumeration.
    pub fn start(
        platform: Arc<dyn PlatformHooks>,
        config: BackendConfig,
    ) -> BackendResult<(Arc<Self>, mpsc::UnboundedReceiver<DeviceEvent>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mgmt = ManagementThread::spawn(Arc::clone(&platform))?;
        let backend = Arc::new(Self {
            config,
            platform,
            mgmt,
            devices: DashMap::new(),
            defaults: Mutex::new(Defaults::default()),
            events: events_tx,
        });

        if let Err(e) = backend.rescan() {
            backend.mgmt.stop();
            return Err(e);
        }
        info!("audio backend started");
        Ok((backend, events_rx))
    }

    pub(crate) fn management(&self) -> &Arc<ManagementThread> {
        &self.mgmt
    }

    pub(crate) fn platform(&self) -> &Arc<dyn PlatformHooks> {
        &self.platform
    }

    pub(crate) fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Current default playback endpoint, if any
    pub fn default_playback(&self) -> Option<DeviceId> {
        self.defaults.lock().playback.clone()
    }

    /// Current default capture endpoint, if any
    pub fn default_capture(&self) -> Option<DeviceId> {
        self.defaults.lock().capture.clone()
    }

    /// Snapshot of all registered endpoints
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.iter().map(|e| e.value().info()).collect()
    }

    /// Look up a registered endpoint
    pub fn device_info(&self, id: &DeviceId) -> Option<DeviceInfo> {
        self.devices.get(id).map(|e| e.value().info())
    }

    /// Look up the handle for a registered endpoint
    pub fn device(&self, id: &DeviceId) -> Option<Arc<DeviceHandle>> {
        self.devices.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Re-run endpoint enumeration on the management thread.
    ///
    /// Newly present endpoints are registered and announced with
    /// [`DeviceEvent::Added`]; the default-device ids are refreshed.
    pub fn rescan(self: &Arc<Self>) -> BackendResult<()> {
        let backend = Arc::clone(self);
        self.mgmt.submit_and_wait(move || backend.enumerate_on_mgmt())
    }

    /// Open an endpoint for I/O: prepare, activate, and start its I/O
    /// thread, serialized on the management thread.
    ///
    /// Returns once the synchronous part has run; with an asynchronous
    /// platform activation the device finishes its transition when the
    /// platform delivers the completion. Errors name the failing stage.
    pub fn open(self: &Arc<Self>, id: &DeviceId) -> BackendResult<Arc<DeviceHandle>> {
        let device = self
            .device(id)
            .ok_or_else(|| BackendError::DeviceNotFound {
                device_id: id.clone(),
            })?;
        if device.is_dead() {
            return Err(BackendError::DeviceDead {
                device_id: id.clone(),
            });
        }

        let backend = Arc::clone(self);
        let d = Arc::clone(&device);
        self.mgmt.submit_and_wait(move || backend.open_on_mgmt(d))?;
        Ok(device)
    }

    /// Close an endpoint, blocking until teardown has run on the
    /// management thread.
    ///
    /// Per the executor contract, the caller must not hold the device's
    /// bookkeeping lock.
    pub fn close(self: &Arc<Self>, device: &Arc<DeviceHandle>) -> BackendResult<()> {
        let backend = Arc::clone(self);
        let d = Arc::clone(device);
        self.mgmt.submit_and_wait(move || backend.teardown_on_mgmt(&d))
    }

    /// Close all devices and stop the management thread.
    pub fn shutdown(self: &Arc<Self>) {
        info!("audio backend shutting down");
        let handles: Vec<_> = self.devices.iter().map(|e| Arc::clone(e.value())).collect();
        for device in handles {
            if let Err(e) = self.close(&device) {
                warn!(device = %device.id(), error = %e, "close during shutdown failed");
            }
        }
        self.mgmt.stop();
    }

    // ---- management-thread lifecycle operations -------------------------
    //
    // Everything below runs inside tasks on the management thread, which is
    // the only thread allowed to call the enumeration/activation/teardown
    // hooks and to mutate native resource ownership.

    fn enumerate_on_mgmt(self: &Arc<Self>) -> BackendResult<()> {
        let list = self.platform.enumerate_endpoints()?;

        let mut added = Vec::new();
        for info in list.devices {
            if self.devices.contains_key(&info.id) {
                continue;
            }
            debug!(device = %info.id, name = %info.name, direction = %info.direction, "endpoint enumerated");
            let handle = DeviceHandle::new(info.clone(), Arc::downgrade(self));
            self.devices.insert(info.id.clone(), handle);
            added.push(info);
        }

        {
            let mut defaults = self.defaults.lock();
            defaults.playback = list.default_playback;
            defaults.capture = list.default_capture;
        }

        for info in added {
            let _ = self.events.send(DeviceEvent::Added(info));
        }
        Ok(())
    }

    fn open_on_mgmt(self: &Arc<Self>, device: Arc<DeviceHandle>) -> BackendResult<()> {
        if device.is_dead() {
            return Err(BackendError::DeviceDead {
                device_id: device.id().clone(),
            });
        }
        {
            // Prepared is re-openable: a failed activation leaves it behind.
            let book = device.book.lock();
            if !matches!(book.stage, Stage::Enumerated | Stage::Prepared) {
                return Err(BackendError::InvalidState {
                    device_id: device.id().clone(),
                    operation: "open",
                });
            }
        }

        self.prepare_on_mgmt(&device)?;
        self.activate_on_mgmt(&device)
    }

    /// Negotiate format/buffer size. Failure leaves the previous stage
    /// untouched.
    fn prepare_on_mgmt(&self, device: &Arc<DeviceHandle>) -> BackendResult<NegotiatedFormat> {
        let requested = device
            .negotiated_format()
            .map(|f| f.spec)
            .unwrap_or_else(AudioSpec::default);
        let negotiated = self.platform.prepare_device(device, &requested)?;

        let mut book = device.book.lock();
        book.format = Some(negotiated);
        book.stage = Stage::Prepared;
        debug!(device = %device.id(), ?negotiated, "device prepared");
        Ok(negotiated)
    }

    fn activate_on_mgmt(self: &Arc<Self>, device: &Arc<DeviceHandle>) -> BackendResult<()> {
        let generation = device.next_activation_generation();
        match self.platform.activate_device(device, generation)? {
            Activation::Ready(stream) => self.start_io(device, stream),
            Activation::Pending(handle) => {
                debug!(device = %device.id(), generation, "activation pending");
                let mut book = device.book.lock();
                book.stage = Stage::PendingActivation { handle, generation };
                Ok(())
            }
        }
    }

    /// Spawn the per-device I/O thread, handing it exclusive ownership of
    /// the native stream.
    fn start_io(self: &Arc<Self>, device: &Arc<DeviceHandle>, stream: NativeStream) -> BackendResult<()> {
        let format = stream.format;
        let backend = Arc::clone(self);
        let d = Arc::clone(device);
        let join = std::thread::Builder::new()
            .name(format!("audio-io-{}", device.id()))
            .spawn(move || io_thread::run(backend, d, stream))
            .map_err(|e| BackendError::ResourceExhausted {
                reason: format!("failed to spawn I/O thread: {}", e),
            })?;

        {
            let mut book = device.book.lock();
            book.format = Some(format);
            book.stage = Stage::Active { io: Some(join) };
        }
        // A fresh successful activation is the one deliberate clear of the
        // lost flag.
        device.clear_lost();
        info!(device = %device.id(), "device active");
        Ok(())
    }

    /// Resume point for an asynchronous activation, re-entered onto the
    /// management thread by [`DeviceHandle::complete_activation`].
    pub(crate) fn finish_activation(
        self: &Arc<Self>,
        device: Arc<DeviceHandle>,
        generation: u64,
        result: BackendResult<NativeStream>,
    ) -> BackendResult<()> {
        let mut taken: Option<Box<dyn ActivationHandle>> = None;
        {
            let mut book = device.book.lock();
            let current = matches!(
                &book.stage,
                Stage::PendingActivation { generation: g, .. } if *g == generation
            );
            if current {
                if let Stage::PendingActivation { handle, .. } =
                    std::mem::replace(&mut book.stage, Stage::Prepared)
                {
                    taken = Some(handle);
                }
            }
        }

        let Some(handle) = taken else {
            // A teardown or a newer activation cycle consumed the pending
            // state already; this completion is stale. Dropping `result`
            // releases the abandoned stream, exactly once.
            debug!(device = %device.id(), generation, "discarding stale activation completion");
            return Ok(());
        };
        self.platform.release_activation_handle(handle);

        if device.is_disconnecting() || device.is_dead() {
            // Disconnect won the race; the device must not become active.
            debug!(device = %device.id(), "activation completed after disconnect, discarding stream");
            return Ok(());
        }

        match result {
            Ok(stream) => self.start_io(&device, stream),
            Err(e) => {
                warn!(device = %device.id(), error = %e, "asynchronous activation failed");
                Err(e)
            }
        }
    }

    /// Teardown queued by [`DeviceHandle::flag_disconnect`]: hot-plug
    /// removal is terminal for the endpoint.
    pub(crate) fn teardown_disconnected(&self, device: Arc<DeviceHandle>) -> BackendResult<()> {
        device.mark_dead();
        self.teardown_on_mgmt(&device)?;

        self.devices.remove(device.id());
        // Exactly one removal notification, delivered with no device lock
        // held; flag_disconnect's single flip guarantees we run once.
        let _ = self.events.send(DeviceEvent::Removed(device.id().clone()));
        Ok(())
    }

    /// Tear down in reverse acquisition order: I/O thread joined first,
    /// then native sub-interfaces (dropped by the I/O thread as it exits),
    /// then any outstanding activation context, then platform per-object
    /// state. Idempotent.
    ///
    /// An explicit close leaves the endpoint registered and back at
    /// `Enumerated`, so it can be opened again; only the dead path is
    /// terminal (`Closed`, disconnect flag latched).
    fn teardown_on_mgmt(&self, device: &Arc<DeviceHandle>) -> BackendResult<()> {
        // Make the I/O thread stop issuing native I/O within one period.
        device.raise_disconnecting();

        let stage = {
            let mut book = device.book.lock();
            std::mem::replace(&mut book.stage, Stage::Closed)
        };

        let held_resources = match stage {
            Stage::Closed => {
                if !device.is_dead() {
                    device.book.lock().stage = Stage::Enumerated;
                    device.clear_disconnecting();
                }
                return Ok(());
            }
            Stage::Active { io } => {
                if let Some(join) = io {
                    // Bookkeeping lock is not held here; the I/O thread
                    // exits within one period wait.
                    if join.join().is_err() {
                        error!(device = %device.id(), "I/O thread panicked");
                    }
                }
                true
            }
            Stage::PendingActivation { handle, .. } => {
                self.platform.release_activation_handle(handle);
                true
            }
            Stage::Prepared => true,
            Stage::Enumerated => false,
        };

        if held_resources || device.is_dead() {
            self.platform.free_device_handle(device);
        }
        if !device.is_dead() {
            device.book.lock().stage = Stage::Enumerated;
            device.clear_disconnecting();
        }
        info!(device = %device.id(), "device torn down");
        Ok(())
    }

    /// Reactivation after a recoverable stream loss, queued fire-and-forget
    /// by the I/O thread.
    pub(crate) fn recover_lost(self: &Arc<Self>, device: Arc<DeviceHandle>) -> BackendResult<()> {
        if device.is_disconnecting() || device.is_dead() {
            // A disconnect teardown is queued (or done); nothing to recover.
            return Ok(());
        }

        let stage = {
            let mut book = device.book.lock();
            std::mem::replace(&mut book.stage, Stage::Prepared)
        };
        match stage {
            Stage::Active { io } => {
                if let Some(join) = io {
                    if join.join().is_err() {
                        error!(device = %device.id(), "I/O thread panicked");
                    }
                }
            }
            other => {
                // Lost flag raced with a close or another transition; put
                // the stage back and leave it alone.
                let mut book = device.book.lock();
                book.stage = other;
                return Ok(());
            }
        }

        let attempts = self.config.reactivation_attempts.max(1);
        for attempt in 1..=attempts {
            if device.is_disconnecting() || device.is_dead() {
                return Ok(());
            }
            let result = self
                .prepare_on_mgmt(&device)
                .and_then(|_| self.activate_on_mgmt(&device));
            match result {
                Ok(()) => {
                    info!(device = %device.id(), attempt, "device reactivated after stream loss");
                    return Ok(());
                }
                Err(e) => {
                    warn!(device = %device.id(), attempt, error = %e, "reactivation attempt failed");
                    if attempt < attempts {
                        std::thread::sleep(self.config.reactivation_delay);
                    }
                }
            }
        }

        // Retries exhausted: the endpoint is permanently unusable.
        device.mark_dead();
        {
            let mut book = device.book.lock();
            book.stage = Stage::Closed;
        }
        self.platform.free_device_handle(&device);
        self.devices.remove(device.id());
        let _ = self.events.send(DeviceEvent::Removed(device.id().clone()));
        Err(BackendError::DeviceDead {
            device_id: device.id().clone(),
        })
    }
}

impl fmt::Debug for AudioBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioBackend")
            .field("devices", &self.devices.len())
            .field("default_playback", &self.default_playback())
            .field("default_capture", &self.default_capture())
            .finish()
    }
}
