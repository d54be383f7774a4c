//! Core types for audio endpoint identification, formats, and events

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque platform endpoint identifier
///
/// Wraps whatever string the native enumeration reports for an endpoint
/// (a wide-character device path on Windows-style platforms). The core
/// never interprets its contents, it only uses it as a registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device id from a platform identifier string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw platform identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Direction of an audio endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceDirection {
    /// Audio output (render)
    Playback,
    /// Audio input (capture)
    Capture,
}

impl fmt::Display for DeviceDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceDirection::Playback => f.write_str("playback"),
            DeviceDirection::Capture => f.write_str("capture"),
        }
    }
}

/// Sample encoding used by a negotiated stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    /// Signed 16-bit PCM
    S16,
    /// 32-bit float PCM
    F32,
}

impl SampleFormat {
    /// Size of one sample in bytes
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::S16 => 2,
            SampleFormat::F32 => 4,
        }
    }
}

/// Audio format specification requested from, or negotiated with, a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSpec {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of interleaved channels
    pub channels: u16,
    /// Sample encoding
    pub format: SampleFormat,
}

impl AudioSpec {
    /// Create a new audio spec
    pub fn new(sample_rate: u32, channels: u16, format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            format,
        }
    }

    /// Size of one interleaved frame in bytes
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.format.bytes_per_sample()
    }
}

impl Default for AudioSpec {
    fn default() -> Self {
        Self::new(48_000, 2, SampleFormat::F32)
    }
}

/// Format and buffer size negotiated with the platform during prepare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedFormat {
    /// The format the device will actually run at
    pub spec: AudioSpec,
    /// Frames per I/O period
    pub period_frames: u32,
}

impl NegotiatedFormat {
    /// Bytes per I/O period
    pub fn period_bytes(&self) -> usize {
        self.period_frames as usize * self.spec.frame_size()
    }
}

/// Information about an enumerated audio endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Platform endpoint identifier
    pub id: DeviceId,
    /// Human-readable device name
    pub name: String,
    /// Endpoint direction
    pub direction: DeviceDirection,
}

/// Notifications crossing from the backend to the generic audio subsystem
///
/// Delivered over an unbounded channel, never with any device lock held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A new endpoint was enumerated
    Added(DeviceInfo),
    /// An endpoint reached the dead state and was torn down
    Removed(DeviceId),
}

/// Backend tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Reactivation attempts after a recoverable stream loss before the
    /// device is declared dead
    pub reactivation_attempts: u32,
    /// Delay between reactivation attempts
    pub reactivation_delay: Duration,
    /// Upper bound on one period wait; the I/O thread re-checks the
    /// disconnect flag at least this often
    pub period_wait_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            reactivation_attempts: 3,
            reactivation_delay: Duration::from_millis(250),
            period_wait_timeout: Duration::from_millis(100),
        }
    }
}
