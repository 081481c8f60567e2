//! Error types for PIOP driver operations.
//!
//! Every failure the driver can observe maps onto one [`PiopError`] variant,
//! and every variant maps onto one [`ErrorKind`]. The kind is what gets
//! stored in a device's private state once the worker has finished a
//! transaction, so record processing can raise the right alarm without
//! holding on to the full error.
//!
//! ## Error Categories
//!
//! - **Allocation**: a bus package could not be allocated or extended
//! - **Bus transaction**: the device returned a bad status after all retries
//! - **Device dead**: the status block heartbeat did not advance
//! - **Image pipeline**: source, size, reset and per-block download failures
//! - **Dispatch**: queue backpressure and worker fail-stop
//!
//! ## Recovery
//!
//! ```rust
//! use piop::{BusStatus, PiopError};
//!
//! let error = PiopError::bus_transaction("status block read", BusStatus(0x2a), 4);
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

use crate::bus::BusStatus;

/// Result type alias for driver operations.
pub type Result<T, E = PiopError> = std::result::Result<T, E>;

/// Main error type for driver operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PiopError {
    #[error("Failed to allocate bus package for {context}: status {status}")]
    Allocation { context: String, status: BusStatus },

    #[error("{operation} failed after {attempts} attempt(s): status {status}")]
    BusTransaction { operation: String, status: BusStatus, attempts: u32 },

    #[error("{block} block checksum mismatch: computed {computed:#06x}, received {received:#06x}")]
    Checksum { block: &'static str, computed: u16, received: u16 },

    #[error("Device not responding: heartbeat counter stuck at {heartbeat}")]
    DeviceDead { heartbeat: u16 },

    #[error("Control block payload of {len} bytes exceeds the {max} byte limit")]
    InvalidPayload { len: usize, max: usize },

    #[error("Image source error: {path}")]
    ImageSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Image exceeds maximum size: {size} bytes > {max} bytes")]
    ImageTooLarge { size: usize, max: usize },

    #[error("Device reset failed: bus status {status}, echoed status {echo:#010x}")]
    DownloadResetFailed { status: BusStatus, echo: u32 },

    #[error("Download block {block} failed: {reason}")]
    DownloadBlockFailed { block: usize, reason: BlockFailure },

    #[error("Dispatch queue full ({capacity} messages outstanding)")]
    QueueFull { capacity: usize },

    #[error("Dispatch worker fault: {reason}")]
    WorkerFault { reason: String },

    #[error("Configuration error in {context}: {details}")]
    Config { context: String, details: String },
}

/// Why a single download block was rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFailure {
    #[error("bus status {0}")]
    Bus(BusStatus),
    #[error("status probe returned {0:#010x}")]
    Probe(u32),
    #[error("transfer returned {0:#010x}")]
    Transfer(u32),
    #[error("unknown block tag {0:#06x}")]
    UnknownTag(u16),
}

/// Taxonomy tag for a [`PiopError`], small enough to keep in device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AllocationError,
    BusTransactionError,
    DeviceDead,
    InvalidRequest,
    ImageSourceError,
    ImageTooLarge,
    DownloadResetFailed,
    DownloadBlockFailed,
    QueueFull,
    WorkerFault,
    ConfigError,
}

impl PiopError {
    /// Taxonomy tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PiopError::Allocation { .. } => ErrorKind::AllocationError,
            PiopError::BusTransaction { .. } => ErrorKind::BusTransactionError,
            PiopError::Checksum { .. } => ErrorKind::BusTransactionError,
            PiopError::DeviceDead { .. } => ErrorKind::DeviceDead,
            PiopError::InvalidPayload { .. } => ErrorKind::InvalidRequest,
            PiopError::ImageSource { .. } => ErrorKind::ImageSourceError,
            PiopError::ImageTooLarge { .. } => ErrorKind::ImageTooLarge,
            PiopError::DownloadResetFailed { .. } => ErrorKind::DownloadResetFailed,
            PiopError::DownloadBlockFailed { .. } => ErrorKind::DownloadBlockFailed,
            PiopError::QueueFull { .. } => ErrorKind::QueueFull,
            PiopError::WorkerFault { .. } => ErrorKind::WorkerFault,
            PiopError::Config { .. } => ErrorKind::ConfigError,
        }
    }

    /// Returns whether a later attempt (next scan, restarted download) may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PiopError::BusTransaction { .. } => true,
            PiopError::Checksum { .. } => true,
            PiopError::DeviceDead { .. } => true,
            PiopError::QueueFull { .. } => true,
            PiopError::DownloadResetFailed { .. } => true,
            PiopError::DownloadBlockFailed { .. } => true,
            PiopError::Allocation { .. } => false,
            PiopError::InvalidPayload { .. } => false,
            PiopError::ImageSource { .. } => false,
            PiopError::ImageTooLarge { .. } => false,
            PiopError::WorkerFault { .. } => false,
            PiopError::Config { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            PiopError::Allocation { .. } => vec![
                "Check the CAMAC driver has free package slots",
                "Verify the crate and slot address",
                "Reboot the IOC if packages are leaking",
            ],
            PiopError::BusTransaction { .. } => vec![
                "Check the crate is powered and online",
                "Verify the PIOP is seated in the configured slot",
                "Increase retry count or delay",
            ],
            PiopError::Checksum { .. } => vec![
                "Check the wire format swap settings",
                "Re-read the block on the next scan",
            ],
            PiopError::DeviceDead { .. } => vec![
                "Check the PIOP front panel for a halted CPU",
                "Download a fresh image to restart the PIOP",
            ],
            PiopError::InvalidPayload { .. } => vec![
                "Shorten the control block payload",
                "Use a bitmap function code for full-block payloads",
            ],
            PiopError::ImageSource { .. } => vec![
                "Check the image exists in one of the search path directories",
                "Set PIOP_IMAGE_PATH to the image directory",
                "Check file permissions",
            ],
            PiopError::ImageTooLarge { .. } => vec![
                "Verify the image file is a PIOP image",
                "Raise max_image_blocks if the firmware grew",
            ],
            PiopError::DownloadResetFailed { .. } => vec![
                "Check the PIOP responds to CAMAC commands",
                "Power cycle the crate and retry the download",
            ],
            PiopError::DownloadBlockFailed { .. } => vec![
                "Restart the whole download sequence",
                "Verify the image file is not corrupted",
            ],
            PiopError::QueueFull { .. } => vec![
                "Reduce the scan rate of PIOP records",
                "Raise queue_capacity",
            ],
            PiopError::WorkerFault { .. } => vec![
                "Restart the IOC; the dispatch worker does not recover on its own",
            ],
            PiopError::Config { .. } => vec![
                "Check the configuration file syntax",
                "Compare against the documented defaults",
            ],
        }
    }

    /// Helper constructor for allocation failures.
    pub fn allocation(context: impl Into<String>, status: BusStatus) -> Self {
        PiopError::Allocation { context: context.into(), status }
    }

    /// Helper constructor for exhausted bus transactions.
    pub fn bus_transaction(operation: impl Into<String>, status: BusStatus, attempts: u32) -> Self {
        PiopError::BusTransaction { operation: operation.into(), status, attempts }
    }

    /// Helper constructor for image source errors with path context.
    pub fn image_source(path: PathBuf, source: std::io::Error) -> Self {
        PiopError::ImageSource { path, source }
    }

    /// Helper constructor for worker faults.
    pub fn worker_fault(reason: impl Into<String>) -> Self {
        PiopError::WorkerFault { reason: reason.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(context: impl Into<String>, details: impl Into<String>) -> Self {
        PiopError::Config { context: context.into(), details: details.into() }
    }
}

impl From<std::io::Error> for PiopError {
    fn from(err: std::io::Error) -> Self {
        PiopError::ImageSource { path: PathBuf::from("<unknown>"), source: err }
    }
}
