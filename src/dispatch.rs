//! Dispatch worker: serializes all PIOP bus I/O behind a bounded queue.
//!
//! Record processing only ever calls [`Submitter::try_submit`], which never
//! blocks. A single worker task drains the queue, runs each device's
//! operation to completion, and hands the outcome back to the record under
//! the record lock.
//!
//! The worker is fail-stop: if its message source fails it logs the error,
//! publishes [`WorkerState::Faulted`] and exits. Cancellation is honoured
//! between messages only, never in the middle of a bus transaction.

use futures::Stream;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::bus::CamacBus;
use crate::config::DriverConfig;
use crate::device::{BlockOperation, Device, DeviceIo};
use crate::download::DownloadSequencer;
use crate::engine::BlockEngine;
use crate::messages::MessageLog;
use crate::record::RecordLock;
use crate::{PiopError, Result};

/// A request for the worker to run one device's operation.
#[derive(Debug, Clone)]
pub struct DispatchMessage {
    pub device: Arc<Device>,
}

/// Lifecycle of the dispatch worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    /// Cancelled through its handle.
    Stopped,
    /// The message source failed; the worker will not restart.
    Faulted { reason: String },
}

impl WorkerState {
    pub fn is_running(&self) -> bool {
        matches!(self, WorkerState::Running)
    }
}

/// Where the worker receives messages from.
#[async_trait::async_trait]
pub trait MessageSource: Send + 'static {
    /// Wait for the next message. An error stops the worker for good.
    async fn receive(&mut self) -> Result<DispatchMessage>;

    /// Stop accepting messages and return those still queued.
    fn drain(&mut self) -> Vec<DispatchMessage> {
        Vec::new()
    }
}

#[async_trait::async_trait]
impl MessageSource for mpsc::Receiver<DispatchMessage> {
    async fn receive(&mut self) -> Result<DispatchMessage> {
        self.recv()
            .await
            .ok_or_else(|| PiopError::worker_fault("dispatch queue closed by every producer"))
    }

    fn drain(&mut self) -> Vec<DispatchMessage> {
        self.close();
        let mut queued = Vec::new();
        while let Ok(message) = self.try_recv() {
            queued.push(message);
        }
        queued
    }
}

/// Producer side of the dispatch queue.
#[derive(Debug, Clone)]
pub struct Submitter {
    tx: mpsc::Sender<DispatchMessage>,
}

impl Submitter {
    /// Enqueue without waiting.
    ///
    /// A full queue is [`PiopError::QueueFull`] and leaves the queue as it
    /// was. A worker that has stopped is [`PiopError::WorkerFault`].
    pub fn try_submit(&self, message: DispatchMessage) -> Result<()> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                PiopError::QueueFull { capacity: self.tx.max_capacity() }
            }
            mpsc::error::TrySendError::Closed(_) => {
                PiopError::worker_fault("dispatch worker is no longer running")
            }
        })
    }

    /// Messages waiting in the queue.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

/// Supervision handle for a running worker. Dropping it cancels the worker.
#[derive(Debug)]
pub struct DispatcherHandle {
    state: watch::Receiver<WorkerState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn state(&self) -> WorkerState {
        self.state.borrow().clone()
    }

    /// The current state followed by every change.
    pub fn state_updates(&self) -> impl Stream<Item = WorkerState> + 'static {
        WatchStream::new(self.state.clone())
    }

    /// Wait until the worker has left [`WorkerState::Running`].
    pub async fn wait_terminal(&self) -> WorkerState {
        let mut state = self.state.clone();
        match state.wait_for(|s| !s.is_running()).await {
            Ok(s) => s.clone(),
            Err(_) => WorkerState::Faulted { reason: "dispatch worker task ended".to_string() },
        }
    }

    /// Cancel the worker and wait for it to finish its current message.
    pub async fn shutdown(mut self) -> WorkerState {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Dispatch worker task failed: {}", e);
            }
        }
        self.state()
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        debug!("Dropping dispatcher handle");
        self.cancel.cancel();
    }
}

/// Spawns dispatch workers.
pub struct Dispatcher;

impl Dispatcher {
    /// Spawn a worker fed by a new bounded queue of `config.queue_capacity`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(bus: Arc<dyn CamacBus>, config: &DriverConfig) -> (Submitter, DispatcherHandle) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let handle = Self::spawn_with_source(bus, config, rx);
        (Submitter { tx }, handle)
    }

    /// Spawn a worker reading from `source`.
    pub fn spawn_with_source<S>(
        bus: Arc<dyn CamacBus>,
        config: &DriverConfig,
        source: S,
    ) -> DispatcherHandle
    where
        S: MessageSource,
    {
        let (state_tx, state_rx) = watch::channel(WorkerState::Running);
        let cancel = CancellationToken::new();

        let worker = Worker {
            sequencer: DownloadSequencer::new(
                config.image_source(),
                config.wire_format(),
                config.max_image_blocks,
                config.download,
            ),
            engine: config.block_engine(),
            messages: MessageLog::new(),
            bus,
        };

        let cancel_worker = cancel.clone();
        let task = tokio::spawn(async move {
            worker.run(source, state_tx, cancel_worker).await;
        });

        DispatcherHandle { state: state_rx, cancel, task: Some(task) }
    }
}

struct Worker {
    bus: Arc<dyn CamacBus>,
    engine: BlockEngine,
    sequencer: DownloadSequencer,
    messages: MessageLog,
}

impl Worker {
    async fn run<S>(
        mut self,
        mut source: S,
        state: watch::Sender<WorkerState>,
        cancel: CancellationToken,
    ) where
        S: MessageSource,
    {
        info!("Dispatch worker started");
        let mut handled = 0u64;

        let final_state = loop {
            if cancel.is_cancelled() {
                info!("Dispatch worker cancelled");
                break WorkerState::Stopped;
            }

            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Dispatch worker cancelled while idle");
                    break WorkerState::Stopped;
                }
                received = source.receive() => received,
            };

            match received {
                Ok(message) => {
                    self.handle(message).await;
                    handled += 1;
                }
                Err(e) => {
                    error!("Dispatch queue receive failed, worker stopping: {}", e);
                    break WorkerState::Faulted { reason: e.to_string() };
                }
            }
        };

        // Queued requests will never run; fail them so their records complete.
        let abandoned = source.drain();
        if !abandoned.is_empty() {
            warn!("Failing {} queued requests left by the stopped worker", abandoned.len());
        }
        for message in abandoned {
            let device = message.device;
            let outcome =
                Err(PiopError::worker_fault("dispatch worker stopped before the request ran"));
            self.finish(&device, &outcome);
        }

        state.send_replace(final_state);
        info!("Dispatch worker ended (handled {} messages)", handled);
    }

    async fn handle(&mut self, message: DispatchMessage) {
        let device = message.device;
        let span = info_span!("piop_io", device = device.name(), address = %device.address());

        let outcome = self.perform(&device).instrument(span).await;
        match &outcome {
            Ok(_) => trace!(device = device.name(), "Device operation complete"),
            Err(e) => {
                warn!(device = device.name(), kind = ?e.kind(), "Device operation failed: {}", e)
            }
        }

        self.finish(&device, &outcome);
    }

    /// Store the outcome and re-enter the record, under its lock.
    fn finish(&self, device: &Device, outcome: &Result<Option<Vec<u8>>>) {
        let record = Arc::clone(device.record());
        let _lock = RecordLock::acquire(record.as_ref());
        device.complete(outcome);
        record.process();
    }

    async fn perform(&mut self, device: &Device) -> Result<Option<Vec<u8>>> {
        match device.io() {
            DeviceIo::Block { operation, packages } => {
                let mut packages = packages.lock().await;
                let retry = device.retry();
                match *operation {
                    BlockOperation::WriteControl(function) => {
                        let payload = {
                            let _lock = RecordLock::acquire(device.record().as_ref());
                            device.data()
                        };
                        self.engine.write_control(&mut packages, function, &payload, retry).await?;
                        Ok(None)
                    }
                    BlockOperation::ReadStatus => {
                        let block = self.engine.read_status(&mut packages, retry).await?;
                        self.messages.observe(device.name(), block.message_code());
                        Ok(Some(block.as_bytes().to_vec()))
                    }
                    BlockOperation::ReadFtp => {
                        let block = self.engine.read_ftp(&mut packages, retry).await?;
                        Ok(Some(block.as_bytes().to_vec()))
                    }
                }
            }
            DeviceIo::Download { image } => {
                let report = self.sequencer.download(&self.bus, device.address(), image).await?;
                debug!(
                    image = %report.image.display(),
                    blocks = report.blocks_sent,
                    marker = report.terminated_by_marker,
                    "Download finished"
                );
                Ok(None)
            }
        }
    }
}
