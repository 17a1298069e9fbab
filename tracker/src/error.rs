//! Error types for the Databuddy tracker.
//!
//! Module-level errors ([`ConfigError`], [`DeliveryError`],
//! [`StorageError`]) convert into the crate-level [`TrackerError`]. Only
//! construction and awaited sends ever return one to the caller; the
//! background paths log and carry on.

use thiserror::Error;

use crate::config::ConfigError;
use crate::delivery::DeliveryError;
use crate::storage::StorageError;

/// Errors that can occur during tracker operations.
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Options failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Collector request failed.
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Host storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The tracker was constructed outside a tokio runtime.
    #[error("no tokio runtime available; construct the tracker inside a runtime")]
    NoRuntime,

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized `Result` type for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;
