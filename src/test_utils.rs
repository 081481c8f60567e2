//! Test utilities: a simulated PIOP on a CAMAC bus, a recording record, and
//! an image file builder.
//!
//! These are shared by the unit tests of every module and by the benches.

#![cfg(any(test, feature = "benchmark"))]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::block::{
    self, FTP_BLOCK_LEN, STATUS_BLOCK_LEN, STATUS_HEARTBEAT_WORD, STATUS_MESSAGE_WORD, WireFormat,
};
use crate::bus::{
    BusOperation, BusStatus, CamacBus, ControlWord, Package, STATUS_Q, STATUS_X, function,
};
use crate::download::DOWNLOAD_SUBADDRESS;
use crate::image::{IMAGE_BLOCK_STRIDE, TAG_CONTROL, TAG_FTP, TAG_TERMINAL};
use crate::package::STATUS_SUBADDRESS;
use crate::record::{AlarmCondition, Record, Severity};

/// Status words the simulated PIOP answers with.
pub const RESPONSE_OK: u32 = STATUS_X | STATUS_Q;

/// How the simulated PIOP fills the heartbeat word.
#[derive(Debug, Clone, Copy)]
pub enum Heartbeat {
    /// Increment before every status read, starting after the given value.
    Counting(u16),
    /// Always report the same value.
    Fixed(u16),
}

/// A data write observed on the bus.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub control: ControlWord,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct MockState {
    next_id: u64,
    live: HashSet<u64>,
    allocations: usize,
    releases: usize,
    allocation_limit: Option<usize>,
    fail_append: bool,
    execute_calls: usize,
    reset_calls: usize,
    scripted_failures: VecDeque<BusStatus>,
    persistent_failure: Option<BusStatus>,
    heartbeat: Heartbeat,
    message_code: u16,
    corrupt_checksums: bool,
    format: WireFormat,
    reset_echo: u32,
    writes: Vec<Transfer>,
    download_transfers: usize,
    failing_transfer: Option<(usize, u32)>,
}

/// Simulated PIOP behind a CAMAC bus driver.
#[derive(Debug)]
pub struct MockBus {
    state: Mutex<MockState>,
}

impl MockBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                next_id: 1,
                live: HashSet::new(),
                allocations: 0,
                releases: 0,
                allocation_limit: None,
                fail_append: false,
                execute_calls: 0,
                reset_calls: 0,
                scripted_failures: VecDeque::new(),
                persistent_failure: None,
                heartbeat: Heartbeat::Counting(0),
                message_code: 0,
                corrupt_checksums: false,
                format: WireFormat::native(),
                reset_echo: RESPONSE_OK,
                writes: Vec::new(),
                download_transfers: 0,
                failing_transfer: None,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail every allocation once `count` packages have been allocated.
    pub fn fail_allocation_after(&self, count: usize) {
        self.state().allocation_limit = Some(count);
    }

    pub fn fail_appends(&self) {
        self.state().fail_append = true;
    }

    /// Fail the next executions with these statuses, in order.
    pub fn fail_next_executes(&self, statuses: impl IntoIterator<Item = BusStatus>) {
        self.state().scripted_failures.extend(statuses);
    }

    pub fn fail_always(&self, status: BusStatus) {
        self.state().persistent_failure = Some(status);
    }

    pub fn set_heartbeat(&self, heartbeat: Heartbeat) {
        self.state().heartbeat = heartbeat;
    }

    pub fn set_message_code(&self, code: u16) {
        self.state().message_code = code;
    }

    pub fn corrupt_checksums(&self, corrupt: bool) {
        self.state().corrupt_checksums = corrupt;
    }

    pub fn set_format(&self, format: WireFormat) {
        self.state().format = format;
    }

    pub fn set_reset_echo(&self, echo: u32) {
        self.state().reset_echo = echo;
    }

    /// Answer download transfer number `index` with `status`.
    pub fn fail_download_transfer(&self, index: usize, status: u32) {
        self.state().failing_transfer = Some((index, status));
    }

    pub fn live_packages(&self) -> usize {
        self.state().live.len()
    }

    pub fn allocations(&self) -> usize {
        self.state().allocations
    }

    pub fn releases(&self) -> usize {
        self.state().releases
    }

    pub fn execute_calls(&self) -> usize {
        self.state().execute_calls
    }

    pub fn reset_calls(&self) -> usize {
        self.state().reset_calls
    }

    /// Every data write, in bus order.
    pub fn writes(&self) -> Vec<Transfer> {
        self.state().writes.clone()
    }

    /// Data writes to the download port, in bus order.
    pub fn download_writes(&self) -> Vec<Transfer> {
        self.state()
            .writes
            .iter()
            .filter(|t| t.control.subaddress() == DOWNLOAD_SUBADDRESS)
            .cloned()
            .collect()
    }
}

impl MockState {
    fn respond(&mut self, op: &mut BusOperation) {
        let control = op.control;
        match control.function() {
            function::TEST_STATUS => op.status = RESPONSE_OK,
            function::CLEAR => op.status = self.reset_echo,
            function::WRITE => {
                self.writes.push(Transfer { control, data: op.data.clone() });
                op.status = RESPONSE_OK | op.data.len() as u32;
                if control.subaddress() == DOWNLOAD_SUBADDRESS {
                    let index = self.download_transfers;
                    self.download_transfers += 1;
                    if let Some((failing, status)) = self.failing_transfer {
                        if failing == index {
                            op.status = status;
                        }
                    }
                }
            }
            function::READ if control.subaddress() == STATUS_SUBADDRESS => {
                let heartbeat = match &mut self.heartbeat {
                    Heartbeat::Counting(n) => {
                        *n = n.wrapping_add(1);
                        *n
                    }
                    Heartbeat::Fixed(n) => *n,
                };
                let mut raw = [0u8; STATUS_BLOCK_LEN];
                block::set_word(&mut raw, STATUS_HEARTBEAT_WORD, heartbeat);
                block::set_word(&mut raw, STATUS_MESSAGE_WORD, self.message_code);
                for i in 2..31 {
                    block::set_word(&mut raw, i, 0x0100 + i as u16);
                }
                self.seal(&mut raw);
                let len = op.data.len();
                op.data.copy_from_slice(&raw[..len]);
                op.status = RESPONSE_OK | op.data.len() as u32;
            }
            function::READ => {
                let mut raw = [0u8; FTP_BLOCK_LEN];
                for i in 0..FTP_BLOCK_LEN / 2 - 1 {
                    block::set_word(&mut raw, i, i as u16 * 3);
                }
                self.seal(&mut raw);
                let len = op.data.len();
                op.data.copy_from_slice(&raw[..len]);
                op.status = RESPONSE_OK | op.data.len() as u32;
            }
            _ => op.status = STATUS_X,
        }
    }

    /// Store the checksum and convert to wire order.
    fn seal(&self, raw: &mut [u8]) {
        let last = raw.len() / 2 - 1;
        let mut sum = block::checksum(&raw[..last * 2]);
        if self.corrupt_checksums {
            sum = sum.wrapping_add(1);
        }
        block::set_word(raw, last, sum);
        self.format.to_wire(raw);
    }
}

#[async_trait::async_trait]
impl CamacBus for MockBus {
    fn allocate(&self, operations: usize) -> Result<Package, BusStatus> {
        let mut state = self.state();
        if state.allocation_limit.is_some_and(|limit| state.allocations >= limit) {
            return Err(BusStatus(0x24));
        }
        let id = state.next_id;
        state.next_id += 1;
        state.allocations += 1;
        state.live.insert(id);
        Ok(Package::new(id, operations))
    }

    fn append_operation(
        &self,
        package: &mut Package,
        control: ControlWord,
        byte_count: usize,
        status_mask: u32,
    ) -> Result<(), BusStatus> {
        if self.state().fail_append {
            return Err(BusStatus(0x2c));
        }
        let op = BusOperation { control, data: vec![0; byte_count], status: 0, status_mask };
        if package.push(op) { Ok(()) } else { Err(BusStatus(0x2e)) }
    }

    async fn execute(&self, package: &mut Package) -> BusStatus {
        let mut state = self.state();
        state.execute_calls += 1;
        if let Some(status) = state.scripted_failures.pop_front() {
            return status;
        }
        if let Some(status) = state.persistent_failure {
            return status;
        }
        for op in package.operations_mut() {
            state.respond(op);
        }
        BusStatus::SUCCESS
    }

    async fn reset(&self, _package: &mut Package) -> BusStatus {
        self.state().reset_calls += 1;
        BusStatus::SUCCESS
    }

    fn release(&self, package: &mut Package) {
        let mut state = self.state();
        state.live.remove(&package.id());
        state.releases += 1;
    }
}

/// Record that remembers what the driver did to it.
#[derive(Debug)]
pub struct MockRecord {
    name: String,
    locked: AtomicBool,
    lock_calls: AtomicUsize,
    process_calls: AtomicUsize,
    processed_unlocked: AtomicBool,
    alarms: Mutex<Vec<(AlarmCondition, Severity)>>,
    processed: Notify,
}

impl MockRecord {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            locked: AtomicBool::new(false),
            lock_calls: AtomicUsize::new(0),
            process_calls: AtomicUsize::new(0),
            processed_unlocked: AtomicBool::new(false),
            alarms: Mutex::new(Vec::new()),
            processed: Notify::new(),
        })
    }

    pub fn lock_calls(&self) -> usize {
        self.lock_calls.load(Ordering::SeqCst)
    }

    pub fn process_calls(&self) -> usize {
        self.process_calls.load(Ordering::SeqCst)
    }

    /// Whether `process` was ever called without the record lock held.
    pub fn processed_unlocked(&self) -> bool {
        self.processed_unlocked.load(Ordering::SeqCst)
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn alarms(&self) -> Vec<(AlarmCondition, Severity)> {
        self.alarms.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Wait for the worker to hand the record back.
    pub async fn wait_processed(&self) {
        self.processed.notified().await;
    }
}

impl Record for MockRecord {
    fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) {
        let was_locked = self.locked.swap(true, Ordering::SeqCst);
        assert!(!was_locked, "record {} locked twice", self.name);
        self.lock_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    fn process(&self) {
        if !self.is_locked() {
            self.processed_unlocked.store(true, Ordering::SeqCst);
        }
        self.process_calls.fetch_add(1, Ordering::SeqCst);
        self.processed.notify_one();
    }

    fn raise_alarm(&self, condition: AlarmCondition, severity: Severity) {
        self.alarms.lock().unwrap_or_else(|p| p.into_inner()).push((condition, severity));
    }
}

/// Builds PIOP download images, both as the corrected in-memory buffer and
/// as the framed file the sequencer reads.
#[derive(Debug, Clone, Default)]
pub struct ImageBuilder {
    slots: Vec<Vec<u8>>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, tag: u16, body: &[u8]) -> Self {
        let mut slot = vec![0u8; IMAGE_BLOCK_STRIDE];
        block::set_word(&mut slot, 0, tag);
        let len = body.len().min(IMAGE_BLOCK_STRIDE - 2);
        slot[2..2 + len].copy_from_slice(&body[..len]);
        self.slots.push(slot);
        self
    }

    pub fn control(self, body: &[u8]) -> Self {
        self.push(TAG_CONTROL, body)
    }

    pub fn ftp(self, body: &[u8]) -> Self {
        self.push(TAG_FTP, body)
    }

    pub fn terminal_ftp(self, body: &[u8]) -> Self {
        self.push(TAG_FTP | TAG_TERMINAL, body)
    }

    pub fn raw_tag(self, tag: u16, body: &[u8]) -> Self {
        self.push(tag, body)
    }

    /// `count` FTP blocks whose bodies start with their index.
    pub fn numbered_ftp(mut self, count: usize) -> Self {
        for i in 0..count {
            let mut body = vec![0u8; FTP_BLOCK_LEN];
            body[0] = i as u8;
            body[1] = (i >> 8) as u8;
            body[2] = 0x5A;
            self = self.ftp(&body);
        }
        self
    }

    /// The buffer the sequencer should hold after loading.
    pub fn memory_image(&self) -> Vec<u8> {
        self.slots.concat()
    }

    /// The image file for `format`, split into frames of `frame_payload`
    /// bytes (rounded down to even) and closed with a zero-length frame.
    pub fn framed(&self, format: WireFormat, frame_payload: usize) -> Vec<u8> {
        let mut wire = Vec::new();
        for slot in &self.slots {
            let mut slot = slot.clone();
            if format.swap_words {
                block::swap_words(&mut slot);
            }
            wire.extend_from_slice(&slot);
        }
        if format.swap_bytes {
            block::swap_bytes(&mut wire);
        }

        let chunk = (frame_payload & !1).max(2);
        let frames: Vec<Vec<u8>> = wire.chunks(chunk).map(<[u8]>::to_vec).collect();
        frame_file(&frames, true)
    }
}

/// Frame raw payloads into the image file format.
pub fn frame_file(payloads: &[Vec<u8>], terminator: bool) -> Vec<u8> {
    let mut out = Vec::new();
    for payload in payloads {
        let len = (payload.len() + 2) as u16;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(payload);
    }
    if terminator {
        out.extend_from_slice(&[0, 0, 0, 0]);
    }
    out
}
