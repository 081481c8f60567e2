//! Per-record device state.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::block::FunctionCode;
use crate::bus::{CamacAddress, CamacBus};
use crate::engine::RetryPolicy;
use crate::error::ErrorKind;
use crate::package::BlockPackages;
use crate::record::{AlarmCondition, Record};
use crate::Result;

/// Block protocol operation a device performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOperation {
    /// Send the record's data as a control block with this function code.
    WriteControl(FunctionCode),
    ReadStatus,
    ReadFtp,
}

/// What processing a device's record does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOperation {
    Block(BlockOperation),
    /// Download the named image from the search path.
    Download { image: String },
}

impl DeviceOperation {
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            DeviceOperation::Block(BlockOperation::ReadStatus | BlockOperation::ReadFtp)
        )
    }

    /// Alarm condition raised when the operation fails.
    pub fn alarm_condition(&self) -> AlarmCondition {
        if self.is_read() { AlarmCondition::Read } else { AlarmCondition::Write }
    }
}

/// Outcome of the last completed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Idle,
    Success,
    Failed(ErrorKind),
}

#[derive(Debug)]
struct DeviceState {
    status: DeviceStatus,
    data: Vec<u8>,
    pending: bool,
    last_error: Option<String>,
}

pub(crate) enum DeviceIo {
    Block {
        operation: BlockOperation,
        packages: tokio::sync::Mutex<BlockPackages>,
    },
    Download {
        image: String,
    },
}

/// One PIOP function bound to one record.
///
/// Record-visible state (status, data, pending flag) is guarded by a plain
/// mutex and written by the worker only while the record lock is held. The
/// bus packages are touched only by the dispatch worker.
pub struct Device {
    name: String,
    address: CamacAddress,
    io: DeviceIo,
    retry: RetryPolicy,
    state: Mutex<DeviceState>,
    record: Arc<dyn Record>,
}

impl Device {
    /// Create a device, building its bus packages for block operations.
    pub fn new(
        bus: &Arc<dyn CamacBus>,
        name: impl Into<String>,
        address: CamacAddress,
        operation: DeviceOperation,
        retry: RetryPolicy,
        record: Arc<dyn Record>,
    ) -> Result<Self> {
        let io = match operation {
            DeviceOperation::Block(operation) => DeviceIo::Block {
                operation,
                packages: tokio::sync::Mutex::new(BlockPackages::build(bus, address)?),
            },
            DeviceOperation::Download { image } => DeviceIo::Download { image },
        };

        Ok(Self {
            name: name.into(),
            address,
            io,
            retry,
            state: Mutex::new(DeviceState {
                status: DeviceStatus::Idle,
                data: Vec::new(),
                pending: false,
                last_error: None,
            }),
            record,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> CamacAddress {
        self.address
    }

    pub fn operation(&self) -> DeviceOperation {
        match &self.io {
            DeviceIo::Block { operation, .. } => DeviceOperation::Block(*operation),
            DeviceIo::Download { image } => DeviceOperation::Download { image: image.clone() },
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    pub fn record(&self) -> &Arc<dyn Record> {
        &self.record
    }

    pub(crate) fn io(&self) -> &DeviceIo {
        &self.io
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> DeviceStatus {
        self.state().status
    }

    /// Record data: the payload to write, or the last block read.
    pub fn data(&self) -> Vec<u8> {
        self.state().data.clone()
    }

    pub fn set_data(&self, data: Vec<u8>) {
        self.state().data = data;
    }

    pub fn is_pending(&self) -> bool {
        self.state().pending
    }

    pub(crate) fn set_pending(&self, pending: bool) {
        self.state().pending = pending;
    }

    /// Message of the last failure, cleared by the next success.
    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    /// Store a worker outcome. Callers hold the record lock.
    pub(crate) fn complete(&self, outcome: &Result<Option<Vec<u8>>>) {
        let mut state = self.state();
        match outcome {
            Ok(data) => {
                state.status = DeviceStatus::Success;
                state.last_error = None;
                if let Some(data) = data {
                    state.data.clone_from(data);
                }
            }
            Err(e) => {
                state.status = DeviceStatus::Failed(e.kind());
                state.last_error = Some(e.to_string());
            }
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("operation", &self.operation())
            .field("state", &*self.state())
            .finish()
    }
}
