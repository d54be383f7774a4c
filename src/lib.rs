//! Cross-thread command and lifecycle core for hardware audio endpoints
//!
//! This crate serializes everything that touches non-thread-safe native
//! audio APIs — enumeration, activation, reactivation, teardown — onto one
//! dedicated management thread, while real-time render/capture continues on
//! a per-device I/O thread and public open/close/query calls arrive from
//! arbitrary caller threads.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐    ┌─────────────────────┐    ┌─────────────────────┐
//! │   Caller threads    │    │  Management thread  │    │  Platform backend   │
//! │                     │    │                     │    │                     │
//! │ open()/close()      │───▶│ FIFO task queue     │───▶│ PlatformHooks impl  │
//! │ rescan()/queries    │    │ lifecycle state     │    │ (native or mock)    │
//! └─────────────────────┘    └─────────┬───────────┘    └─────────────────────┘
//!                                      │ starts/joins
//!                                      ▼
//! ┌─────────────────────┐    ┌─────────────────────┐
//! │ OS notification     │    │  I/O thread (per    │
//! │ callbacks           │    │  active device)     │
//! │                     │    │                     │
//! │ flag_disconnect() ──┼───▶│ polls disconnect    │
//! │ (lock-free, any     │    │ flag each period,   │
//! │  thread)            │    │ render/capture loop │
//! └─────────────────────┘    └─────────────────────┘
//! ```
//!
//! Three thread roles interact per device: arbitrary callers block only
//! inside a synchronous task submission; the management thread blocks only
//! waiting for the next task; the I/O thread blocks only on the native
//! per-period wait handle. Hot-plug notifications run on OS-owned threads
//! treated as untrusted callers with no lock rights — they may only set the
//! lock-free disconnect flag.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use audio_backend_core::{AudioBackend, BackendConfig};
//! use audio_backend_core::platform::mock::MockPlatform;
//!
//! # fn example() -> audio_backend_core::BackendResult<()> {
//! let platform = MockPlatform::with_endpoints(vec![]);
//! let (backend, _events) = AudioBackend::start(platform, BackendConfig::default())?;
//!
//! if let Some(id) = backend.default_playback() {
//!     let device = backend.open(&id)?;
//!     // ... device renders on its own I/O thread ...
//!     backend.close(&device)?;
//! }
//!
//! backend.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod error;
pub mod executor;
mod io_thread;
pub mod manager;
pub mod platform;
pub mod types;

pub use device::DeviceHandle;
pub use error::{BackendError, BackendResult};
pub use executor::ManagementThread;
pub use manager::AudioBackend;
pub use types::{
    AudioSpec, BackendConfig, DeviceDirection, DeviceEvent, DeviceId, DeviceInfo,
    NegotiatedFormat, SampleFormat,
};
