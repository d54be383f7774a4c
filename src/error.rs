//! Error handling for the audio backend core
//!
//! This module defines the error types that can occur while enumerating,
//! preparing, activating, and tearing down hardware audio endpoints,
//! providing enough detail for callers to tell which lifecycle stage failed.

use crate::types::DeviceId;
use thiserror::Error;

/// Result type alias for backend operations
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Error type for backend operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Endpoint enumeration failed
    #[error("endpoint enumeration failed: {reason}")]
    EnumerationFailed { reason: String },

    /// Format/buffer negotiation was rejected by the platform
    #[error("prepare failed for device {device_id}: {reason}")]
    PrepareFailed { device_id: DeviceId, reason: String },

    /// Native resource acquisition failed, synchronously or via async completion
    #[error("activation failed for device {device_id}: {reason}")]
    ActivationFailed { device_id: DeviceId, reason: String },

    /// The stream was invalidated but the endpoint may still be retried
    #[error("device {device_id} lost its stream (recoverable)")]
    DeviceLost { device_id: DeviceId },

    /// The endpoint is permanently gone; no retry will be attempted
    #[error("device {device_id} is dead")]
    DeviceDead { device_id: DeviceId },

    /// No endpoint with the given id is known to the backend
    #[error("device not found: {device_id}")]
    DeviceNotFound { device_id: DeviceId },

    /// The management thread has begun shutdown and accepts no more tasks
    #[error("task rejected: management thread is shutting down")]
    TaskRejected,

    /// The operation is not valid for the device's current lifecycle stage
    #[error("invalid state for device {device_id}: cannot {operation}")]
    InvalidState {
        device_id: DeviceId,
        operation: &'static str,
    },

    /// Thread or queue resources could not be allocated
    #[error("out of resources: {reason}")]
    ResourceExhausted { reason: String },
}
