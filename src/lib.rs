//! Driver core for the CAMAC programmable I/O processor (PIOP).
//!
//! The PIOP controls klystron modulators over a CAMAC bus. This crate sits
//! between a record-processing framework and the host CAMAC driver:
//!
//! - **Dispatch**: one worker task serializes all bus I/O behind a bounded,
//!   non-blocking queue, so record processing never waits on the bus.
//! - **Block protocol**: control block writes and status/FTP block reads,
//!   with checksums, wire byte order correction and bounded retries.
//! - **Image download**: streams a framed firmware image into the PIOP one
//!   block at a time, checking every block's response.
//!
//! The CAMAC driver is consumed through [`CamacBus`] and the record framework
//! through [`Record`]. Log output goes through `tracing`; install a
//! subscriber to see it.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use piop::{
//!     BlockOperation, CamacAddress, CamacBus, Completion, DeviceOperation, DriverConfig,
//!     Piop, Record,
//! };
//!
//! # async fn example(bus: Arc<dyn CamacBus>, record: Arc<dyn Record>) -> piop::Result<()> {
//! let mut config = DriverConfig::load("/etc/piop.yaml")?;
//! config.apply_env();
//!
//! let piop = Piop::start(bus, config)?;
//! let device = piop.attach(
//!     "KLYS:LI20:31:STATUS",
//!     CamacAddress::new(2, 5),
//!     DeviceOperation::Block(BlockOperation::ReadStatus),
//!     record,
//! )?;
//!
//! let adapter = piop.adapter();
//! assert_eq!(adapter.process(&device)?, Completion::Pending);
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod bus;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod download;
pub mod engine;
mod error;
pub mod image;
pub mod messages;
pub mod package;
pub mod record;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;

use std::sync::Arc;

pub use block::{FtpBlock, FunctionCode, StatusBlock, WireFormat};
pub use bus::{BusStatus, CamacAddress, CamacBus, ControlWord, OwnedPackage, Package};
pub use config::DriverConfig;
pub use device::{BlockOperation, Device, DeviceOperation, DeviceStatus};
pub use dispatch::{DispatchMessage, Dispatcher, DispatcherHandle, Submitter, WorkerState};
pub use download::{DownloadReport, DownloadSequencer, DownloadTiming};
pub use engine::{BlockEngine, RetryPolicy};
pub use error::*;
pub use image::{Image, ImageSource};
pub use record::{AlarmCondition, Completion, Record, RecordAdapter, RecordLock, Severity};

/// A running PIOP driver: one dispatch worker plus its configuration.
///
/// Dropping it cancels the worker after the message in progress.
pub struct Piop {
    // Declared first so the worker is cancelled before the queue closes.
    dispatcher: DispatcherHandle,
    submitter: Submitter,
    bus: Arc<dyn CamacBus>,
    config: DriverConfig,
}

impl Piop {
    /// Validate `config` and start the dispatch worker.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PiopError::Config`] if the configuration is invalid.
    pub fn start(bus: Arc<dyn CamacBus>, config: DriverConfig) -> Result<Self> {
        config.validate()?;
        let (submitter, dispatcher) = Dispatcher::spawn(Arc::clone(&bus), &config);
        tracing::info!(
            queue_capacity = config.queue_capacity,
            search_dirs = config.image_search_path.len(),
            "PIOP driver started"
        );
        Ok(Self { dispatcher, submitter, bus, config })
    }

    /// Create the device for one record.
    ///
    /// Block devices get their bus packages here, once, and the retry policy
    /// configured for their operation.
    ///
    /// # Errors
    ///
    /// Returns [`PiopError::Allocation`] if the packages cannot be built.
    pub fn attach(
        &self,
        name: impl Into<String>,
        address: CamacAddress,
        operation: DeviceOperation,
        record: Arc<dyn Record>,
    ) -> Result<Arc<Device>> {
        let retries = &self.config.retries;
        let retry = match &operation {
            DeviceOperation::Block(BlockOperation::WriteControl(_)) => retries.control,
            DeviceOperation::Block(BlockOperation::ReadStatus) => retries.status,
            DeviceOperation::Block(BlockOperation::ReadFtp) => retries.ftp,
            DeviceOperation::Download { .. } => retries.control,
        };
        let device = Device::new(&self.bus, name, address, operation, retry, record)?;
        tracing::debug!(device = device.name(), %address, "Attached device");
        Ok(Arc::new(device))
    }

    /// Record support entry points bound to this driver's queue.
    pub fn adapter(&self) -> RecordAdapter {
        RecordAdapter::new(self.submitter.clone())
    }

    pub fn worker_state(&self) -> WorkerState {
        self.dispatcher.state()
    }

    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }
}

impl std::fmt::Debug for Piop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Piop")
            .field("worker", &self.dispatcher.state())
            .field("queue_depth", &self.submitter.depth())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Heartbeat, MockBus, MockRecord};
    use anyhow::{Result, ensure};
    use futures::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn status_record_round_trip() -> Result<()> {
        let mock = MockBus::new();
        mock.set_heartbeat(Heartbeat::Counting(40));
        mock.set_message_code(4);
        let bus: Arc<dyn CamacBus> = mock.clone();
        let piop = Piop::start(bus, DriverConfig::default())?;
        let record = MockRecord::new("KLYS:LI20:31:STATUS");

        let device = piop.attach(
            "KLYS:LI20:31:STATUS",
            CamacAddress::new(2, 5),
            DeviceOperation::Block(BlockOperation::ReadStatus),
            record.clone(),
        )?;
        let adapter = piop.adapter();

        ensure!(adapter.process(&device)? == Completion::Pending);
        record.wait_processed().await;
        ensure!(adapter.process(&device)? == Completion::Done);

        let data = device.data();
        ensure!(block::word(&data, block::STATUS_HEARTBEAT_WORD) == 41);
        ensure!(block::word(&data, block::STATUS_MESSAGE_WORD) == 4);
        ensure!(record.alarms().is_empty());
        ensure!(piop.worker_state() == WorkerState::Running);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn attach_uses_the_configured_retry_policy() -> Result<()> {
        let bus: Arc<dyn CamacBus> = MockBus::new();
        let piop = Piop::start(bus, DriverConfig::default())?;

        let ftp = piop.attach(
            "ftp",
            CamacAddress::new(1, 1),
            DeviceOperation::Block(BlockOperation::ReadFtp),
            MockRecord::new("ftp"),
        )?;
        ensure!(ftp.retry() == piop.config().retries.ftp);

        let status = piop.attach(
            "status",
            CamacAddress::new(1, 1),
            DeviceOperation::Block(BlockOperation::ReadStatus),
            MockRecord::new("status"),
        )?;
        ensure!(status.retry() == piop.config().retries.status);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_is_rejected() {
        let bus: Arc<dyn CamacBus> = MockBus::new();
        let config = DriverConfig { queue_capacity: 0, ..DriverConfig::default() };

        let err = Piop::start(bus, config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_driver_stops_the_worker() {
        let bus: Arc<dyn CamacBus> = MockBus::new();
        let piop = Piop::start(bus, DriverConfig::default()).expect("start");
        let updates = piop.dispatcher().state_updates();
        drop(piop);

        let mut state = std::pin::pin!(updates);
        let mut last = None;
        while let Some(update) = state.next().await {
            last = Some(update);
        }
        assert_eq!(last, Some(WorkerState::Stopped));
    }
}
