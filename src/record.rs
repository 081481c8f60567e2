//! Record framework interface and the record support adapter.
//!
//! Record processing is asynchronous. The first `process` call queues the
//! device's operation and returns [`Completion::Pending`]; the dispatch
//! worker performs it, stores the outcome under the record lock, and calls
//! [`Record::process`] so the framework re-enters. The second `process`
//! call sees the pending flag, raises any alarm and returns
//! [`Completion::Done`].

use std::sync::Arc;
use tracing::{debug, warn};

use crate::device::{Device, DeviceStatus};
use crate::dispatch::{DispatchMessage, Submitter};
use crate::Result;

/// Alarm severity, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    NoAlarm,
    Minor,
    Major,
    Invalid,
}

/// Condition reported with an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmCondition {
    Read,
    Write,
    Comm,
    Timeout,
}

/// The record-processing framework's view of one record.
pub trait Record: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Take the record lock. Prefer [`RecordLock::acquire`].
    fn lock(&self);

    fn unlock(&self);

    /// Re-enter record processing after an asynchronous completion.
    fn process(&self);

    fn raise_alarm(&self, condition: AlarmCondition, severity: Severity);
}

/// Holds a record's lock until dropped.
#[must_use = "the record is unlocked as soon as the guard is dropped"]
pub struct RecordLock<'a> {
    record: &'a dyn Record,
}

impl<'a> RecordLock<'a> {
    pub fn acquire(record: &'a dyn Record) -> Self {
        record.lock();
        Self { record }
    }
}

impl Drop for RecordLock<'_> {
    fn drop(&mut self) {
        self.record.unlock();
    }
}

/// Result of one record support `process` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Work was queued; the record is re-entered when it completes.
    Pending,
    Done,
}

/// Record support entry points for PIOP devices.
#[derive(Debug, Clone)]
pub struct RecordAdapter {
    submitter: Submitter,
}

impl RecordAdapter {
    pub fn new(submitter: Submitter) -> Self {
        Self { submitter }
    }

    /// Route to [`pre_process`](Self::pre_process) or
    /// [`post_process`](Self::post_process) by the device's pending flag.
    pub fn process(&self, device: &Arc<Device>) -> Result<Completion> {
        if device.is_pending() { self.post_process(device) } else { self.pre_process(device) }
    }

    /// Queue the device's operation without blocking.
    ///
    /// On a full queue the record gets an invalid alarm and the next scan
    /// can simply try again.
    pub fn pre_process(&self, device: &Arc<Device>) -> Result<Completion> {
        device.set_pending(true);
        match self.submitter.try_submit(DispatchMessage { device: Arc::clone(device) }) {
            Ok(()) => {
                debug!(device = device.name(), "Queued device operation");
                Ok(Completion::Pending)
            }
            Err(e) => {
                device.set_pending(false);
                warn!(device = device.name(), error = %e, "Could not queue device operation");
                device.record().raise_alarm(AlarmCondition::Write, Severity::Invalid);
                Err(e)
            }
        }
    }

    /// Finish an operation the worker has completed.
    pub fn post_process(&self, device: &Arc<Device>) -> Result<Completion> {
        device.set_pending(false);
        if let DeviceStatus::Failed(kind) = device.status() {
            let condition = device.operation().alarm_condition();
            debug!(device = device.name(), ?kind, ?condition, "Raising alarm for failed operation");
            device.record().raise_alarm(condition, Severity::Invalid);
        }
        Ok(Completion::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::FunctionCode;
    use crate::bus::{BusStatus, CamacAddress, CamacBus};
    use crate::config::DriverConfig;
    use crate::device::{BlockOperation, DeviceOperation};
    use crate::dispatch::Dispatcher;
    use crate::engine::RetryPolicy;
    use crate::test_utils::{MockBus, MockRecord};
    use crate::{ErrorKind, PiopError};
    use std::time::Duration;

    fn device(
        bus: &Arc<dyn CamacBus>,
        operation: DeviceOperation,
        record: &Arc<MockRecord>,
    ) -> Arc<Device> {
        let record: Arc<dyn Record> = record.clone();
        Arc::new(
            Device::new(
                bus,
                "KLYS:LI20:31",
                CamacAddress::new(2, 5),
                operation,
                RetryPolicy::new(1, Duration::from_millis(1)),
                record,
            )
            .expect("device"),
        )
    }

    #[test]
    fn lock_guard_unlocks_on_drop() {
        let record = MockRecord::new("r");
        {
            let _lock = RecordLock::acquire(record.as_ref());
            assert!(record.is_locked());
        }
        assert!(!record.is_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn read_completes_in_two_passes() {
        let mock = MockBus::new();
        let bus: Arc<dyn CamacBus> = mock.clone();
        let (submitter, dispatcher) = Dispatcher::spawn(Arc::clone(&bus), &DriverConfig::default());
        let adapter = RecordAdapter::new(submitter);
        let record = MockRecord::new("status");
        let device = device(&bus, DeviceOperation::Block(BlockOperation::ReadStatus), &record);

        assert_eq!(adapter.process(&device).expect("pre"), Completion::Pending);
        assert!(device.is_pending());
        record.wait_processed().await;

        assert_eq!(adapter.process(&device).expect("post"), Completion::Done);
        assert!(!device.is_pending());
        assert_eq!(device.status(), DeviceStatus::Success);
        assert_eq!(device.data().len(), crate::block::STATUS_BLOCK_LEN);
        assert!(record.alarms().is_empty());
        drop(dispatcher);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_raises_write_alarm() {
        let mock = MockBus::new();
        mock.fail_always(BusStatus(0x2a));
        let bus: Arc<dyn CamacBus> = mock.clone();
        let (submitter, _dispatcher) =
            Dispatcher::spawn(Arc::clone(&bus), &DriverConfig::default());
        let adapter = RecordAdapter::new(submitter);
        let record = MockRecord::new("trigger");
        let device = device(
            &bus,
            DeviceOperation::Block(BlockOperation::WriteControl(FunctionCode::SET_TRIGGER)),
            &record,
        );
        device.set_data(vec![1, 0]);

        adapter.process(&device).expect("pre");
        record.wait_processed().await;
        adapter.process(&device).expect("post");

        assert_eq!(device.status(), DeviceStatus::Failed(ErrorKind::BusTransactionError));
        assert_eq!(record.alarms(), vec![(AlarmCondition::Write, Severity::Invalid)]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_read_raises_read_alarm() {
        let mock = MockBus::new();
        mock.corrupt_checksums(true);
        let bus: Arc<dyn CamacBus> = mock.clone();
        let (submitter, _dispatcher) =
            Dispatcher::spawn(Arc::clone(&bus), &DriverConfig::default());
        let adapter = RecordAdapter::new(submitter);
        let record = MockRecord::new("ftp");
        let device = device(&bus, DeviceOperation::Block(BlockOperation::ReadFtp), &record);

        adapter.process(&device).expect("pre");
        record.wait_processed().await;
        adapter.process(&device).expect("post");

        assert_eq!(record.alarms(), vec![(AlarmCondition::Read, Severity::Invalid)]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_alarms_and_clears_pending() {
        let mock = MockBus::new();
        let bus: Arc<dyn CamacBus> = mock.clone();
        let config = DriverConfig { queue_capacity: 1, ..DriverConfig::default() };
        let (submitter, dispatcher) = Dispatcher::spawn(Arc::clone(&bus), &config);
        let adapter = RecordAdapter::new(submitter);
        let first_record = MockRecord::new("first");
        let second_record = MockRecord::new("second");
        let first = device(&bus, DeviceOperation::Block(BlockOperation::ReadStatus), &first_record);
        let second =
            device(&bus, DeviceOperation::Block(BlockOperation::ReadStatus), &second_record);

        // The worker has not run yet, so the single slot stays taken.
        adapter.pre_process(&first).expect("first fits");
        let err = adapter.pre_process(&second).unwrap_err();

        assert!(matches!(err, PiopError::QueueFull { capacity: 1 }));
        assert!(!second.is_pending());
        assert_eq!(second_record.alarms(), vec![(AlarmCondition::Write, Severity::Invalid)]);

        first_record.wait_processed().await;
        assert_eq!(adapter.pre_process(&second).expect("retry"), Completion::Pending);
        drop(dispatcher);
    }
}
