//! Per-device real-time I/O loop
//!
//! Started by the management thread once activation has completed; from
//! then on this thread exclusively owns the native render/capture
//! sub-interface and period wait handle. It blocks only on the native
//! per-period wait, polls the `disconnecting` flag at each period
//! boundary, and on any exit path submits follow-up work to the
//! management thread strictly fire-and-forget — waiting here would mean
//! waiting on our own teardown.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::device::DeviceHandle;
use crate::manager::AudioBackend;
use crate::platform::{NativeIo, NativeStream, StreamFault};

pub(crate) fn run(backend: Arc<AudioBackend>, device: Arc<DeviceHandle>, stream: NativeStream) {
    backend.platform().io_thread_init(&device);
    debug!(device = %device.id(), "I/O thread started");

    let NativeStream {
        mut io,
        waiter,
        format,
    } = stream;
    let timeout = backend.config().period_wait_timeout;

    loop {
        if device.is_disconnecting() {
            // Whoever flagged the disconnect already queued the teardown;
            // just stop issuing native I/O.
            debug!(device = %device.id(), "I/O thread observed disconnect flag");
            break;
        }

        if !waiter.wait_period(timeout) {
            continue;
        }
        if device.is_disconnecting() {
            debug!(device = %device.id(), "I/O thread observed disconnect flag");
            break;
        }

        let result = match &mut io {
            NativeIo::Render(client) => client.render_period(format.period_frames),
            NativeIo::Capture(client) => client.capture_period(format.period_frames),
        };

        match result {
            Ok(()) => {}
            Err(StreamFault::Lost) => {
                info!(device = %device.id(), "stream lost, requesting reactivation");
                device.mark_lost();
                let b = Arc::clone(&backend);
                let d = Arc::clone(&device);
                if let Err(e) = backend.management().submit(move || b.recover_lost(d)) {
                    warn!(device = %device.id(), error = %e, "could not queue reactivation");
                }
                break;
            }
            Err(StreamFault::Dead) => {
                // The queued teardown marks the device dead; marking it
                // here would close flag_disconnect's gate before the
                // teardown is queued.
                info!(device = %device.id(), "stream dead, flagging disconnect");
                device.flag_disconnect();
                break;
            }
        }
    }

    backend.platform().io_thread_deinit(&device);
    // Native sub-interface and wait handle are released here, on the same
    // thread that used them, before the management thread's join returns.
    drop(io);
    drop(waiter);
    debug!(device = %device.id(), "I/O thread exited");
}
