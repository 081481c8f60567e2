//! Block protocol engine: control block writes, status and FTP block reads.
//!
//! All three operations run on a device's pre-built packages
//! ([`BlockPackages`]). Writes and FTP reads retry with a fixed delay
//! between attempts; status reads retry in passes of back-to-back attempts.
//! Retries are always bounded and an exhausted retry loop reports the last
//! bus status it saw.

use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::block::{
    CONTROL_BLOCK_LEN, FTP_BLOCK_LEN, FtpBlock, FunctionCode, STATUS_BLOCK_LEN, StatusBlock,
    WireFormat, encode_control_block, verify_checksum,
};
use crate::bus::{BusStatus, OwnedPackage};
use crate::package::{BlockPackages, DATA_OP};
use crate::{PiopError, Result};

/// Back-to-back attempts in one status read pass.
pub const STATUS_ATTEMPTS_PER_PASS: u32 = 3;

/// Retry bound and inter-attempt delay for one block operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Retries after the first attempt (passes, for status reads).
    pub tries: u32,
    #[serde(rename = "delay_ms", deserialize_with = "crate::config::millis")]
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(tries: u32, delay: Duration) -> Self {
        Self { tries, delay }
    }
}

/// Encodes, executes and decodes PIOP blocks.
#[derive(Debug, Clone, Copy)]
pub struct BlockEngine {
    format: WireFormat,
    verify_checksums: bool,
}

impl BlockEngine {
    pub fn new(format: WireFormat, verify_checksums: bool) -> Self {
        Self { format, verify_checksums }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Send a control block.
    ///
    /// Sleeps `policy.delay` before the first attempt to let the PIOP settle.
    pub async fn write_control(
        &self,
        packages: &mut BlockPackages,
        function: FunctionCode,
        payload: &[u8],
        policy: RetryPolicy,
    ) -> Result<()> {
        let mut block = [0u8; CONTROL_BLOCK_LEN];
        encode_control_block(&mut block, function, payload)?;
        self.format.to_wire(&mut block);

        let package = &mut packages.control_write;
        package.clear();
        package.data_mut(DATA_OP).copy_from_slice(&block);

        trace!(function = function.0, len = payload.len(), "Writing control block");
        tokio::time::sleep(policy.delay).await;
        execute_with_retry(package, policy, "control block write").await
    }

    /// Read the status block and check the heartbeat advanced.
    ///
    /// A heartbeat equal to the cached one means the PIOP stopped running:
    /// the cache is cleared so the next change is seen, and the read fails
    /// with [`PiopError::DeviceDead`].
    pub async fn read_status(
        &self,
        packages: &mut BlockPackages,
        policy: RetryPolicy,
    ) -> Result<StatusBlock> {
        let package = &mut packages.status_read;
        package.clear();
        execute_in_passes(package, policy).await?;

        let mut raw = [0u8; STATUS_BLOCK_LEN];
        raw.copy_from_slice(package.data(DATA_OP));
        self.format.from_wire(&mut raw);
        if self.verify_checksums {
            verify_checksum("status", &raw)?;
        }

        let block = StatusBlock::from_host_bytes(raw);
        let heartbeat = block.heartbeat();
        if heartbeat == packages.heartbeat {
            warn!(heartbeat, address = %packages.address(), "Heartbeat did not advance");
            packages.heartbeat = 0;
            return Err(PiopError::DeviceDead { heartbeat });
        }

        trace!(previous = packages.heartbeat, heartbeat, "Heartbeat advanced");
        packages.heartbeat = heartbeat;
        Ok(block)
    }

    /// Read the FTP block.
    ///
    /// Sleeps `policy.delay` before the first attempt so the PIOP can finish
    /// filling the block.
    pub async fn read_ftp(
        &self,
        packages: &mut BlockPackages,
        policy: RetryPolicy,
    ) -> Result<FtpBlock> {
        let package = &mut packages.ftp_read;
        package.clear();
        tokio::time::sleep(policy.delay).await;
        execute_with_retry(package, policy, "FTP block read").await?;

        let mut raw = [0u8; FTP_BLOCK_LEN];
        raw.copy_from_slice(package.data(DATA_OP));
        self.format.from_wire(&mut raw);
        if self.verify_checksums {
            verify_checksum("FTP", &raw)?;
        }
        Ok(FtpBlock::from_host_bytes(raw))
    }
}

/// One attempt plus `policy.tries` retries, `policy.delay` apart.
async fn execute_with_retry(
    package: &mut OwnedPackage,
    policy: RetryPolicy,
    operation: &str,
) -> Result<()> {
    let mut attempt = 1;
    loop {
        let status = package.execute().await;
        if status.is_success() {
            if attempt > 1 {
                debug!(operation, attempt, "Bus transaction succeeded after retry");
            }
            return Ok(());
        }

        warn!(operation, attempt, %status, "Bus transaction failed");
        if attempt > policy.tries {
            return Err(PiopError::bus_transaction(operation, status, attempt));
        }

        reset_for_retry(package).await;
        tokio::time::sleep(policy.delay).await;
        attempt += 1;
    }
}

/// Up to `max(policy.tries, 1)` passes of back-to-back attempts, `policy.delay` between passes.
async fn execute_in_passes(package: &mut OwnedPackage, policy: RetryPolicy) -> Result<()> {
    let passes = policy.tries.max(1);
    let total = passes * STATUS_ATTEMPTS_PER_PASS;
    let mut attempts = 0;
    let mut last_status = BusStatus(0);

    for pass in 0..passes {
        if pass > 0 {
            tokio::time::sleep(policy.delay).await;
        }
        for _ in 0..STATUS_ATTEMPTS_PER_PASS {
            attempts += 1;
            let status = package.execute().await;
            if status.is_success() {
                return Ok(());
            }
            last_status = status;
            if attempts < total {
                reset_for_retry(package).await;
            }
        }
        debug!(pass = pass + 1, passes, status = %last_status, "Status block read pass failed");
    }

    warn!(attempts, status = %last_status, "Status block read failed");
    Err(PiopError::bus_transaction("status block read", last_status, attempts))
}

async fn reset_for_retry(package: &mut OwnedPackage) {
    let status = package.reset().await;
    if !status.is_success() {
        debug!(%status, "Package reset failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::word;
    use crate::bus::{CamacAddress, CamacBus};
    use crate::test_utils::{Heartbeat, MockBus};
    use crate::ErrorKind;
    use std::sync::Arc;
    use tokio::time::Instant;

    fn setup() -> (Arc<MockBus>, BlockPackages) {
        let mock = MockBus::new();
        let bus: Arc<dyn CamacBus> = mock.clone();
        let packages = BlockPackages::build(&bus, CamacAddress::new(1, 4)).expect("build");
        (mock, packages)
    }

    fn engine() -> BlockEngine {
        BlockEngine::new(WireFormat::native(), true)
    }

    #[tokio::test(start_paused = true)]
    async fn control_block_goes_out_checksummed_in_wire_order() {
        let (mock, mut packages) = setup();
        let policy = RetryPolicy::new(2, Duration::from_millis(10));

        engine()
            .write_control(&mut packages, FunctionCode::SET_TIMING, &[1, 2, 3, 4], policy)
            .await
            .expect("write");

        let writes = mock.writes();
        assert_eq!(writes.len(), 1);
        let mut block = writes[0].data.clone();
        assert_eq!(block.len(), CONTROL_BLOCK_LEN);
        WireFormat::native().from_wire(&mut block);

        assert_eq!(word(&block, 0), FunctionCode::SET_TIMING.0);
        assert_eq!(&block[2..6], &[1, 2, 3, 4]);
        assert!(verify_checksum("control", &block).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failure_is_attempted_tries_plus_one_times() {
        let (mock, mut packages) = setup();
        mock.fail_always(BusStatus(0x2a));
        let delay = Duration::from_millis(10);
        let policy = RetryPolicy::new(3, delay);

        let start = Instant::now();
        let err = engine()
            .write_control(&mut packages, FunctionCode::STANDBY, &[], policy)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PiopError::BusTransaction { status: BusStatus(0x2a), attempts: 4, .. }
        ));
        assert_eq!(mock.execute_calls(), 4);
        assert_eq!(mock.reset_calls(), 3);
        // Settle delay plus one delay before each of the three retries.
        assert!(start.elapsed() >= delay * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn last_observed_failure_is_reported() {
        let (mock, mut packages) = setup();
        mock.fail_next_executes([BusStatus(0x10), BusStatus(0x12), BusStatus(0x14)]);

        let err = engine()
            .write_control(
                &mut packages,
                FunctionCode::RESET_FAULTS,
                &[],
                RetryPolicy::new(2, Duration::from_millis(1)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PiopError::BusTransaction { status: BusStatus(0x14), .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_recover_within_bound() {
        let (mock, mut packages) = setup();
        mock.fail_next_executes([BusStatus(0x2a), BusStatus(0x2c)]);

        engine()
            .write_control(
                &mut packages,
                FunctionCode::SET_TRIGGER,
                &[9, 9],
                RetryPolicy::new(3, Duration::from_millis(5)),
            )
            .await
            .expect("write should recover");

        assert_eq!(mock.execute_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_payload_never_reaches_the_bus() {
        let (mock, mut packages) = setup();

        let err = engine()
            .write_control(
                &mut packages,
                FunctionCode::SET_TIMING,
                &[0u8; 29],
                RetryPolicy::new(1, Duration::ZERO),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(mock.execute_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_heartbeat_reports_dead_then_recovers() {
        let (mock, mut packages) = setup();
        mock.set_heartbeat(Heartbeat::Fixed(5));
        let policy = RetryPolicy::new(1, Duration::from_millis(1));
        let engine = engine();

        let first = engine.read_status(&mut packages, policy).await.expect("first read");
        assert_eq!(first.heartbeat(), 5);
        assert_eq!(packages.heartbeat(), 5);

        let second = engine.read_status(&mut packages, policy).await.unwrap_err();
        assert!(matches!(second, PiopError::DeviceDead { heartbeat: 5 }));
        assert_eq!(packages.heartbeat(), 0);

        let third = engine.read_status(&mut packages, policy).await.expect("third read");
        assert_eq!(third.heartbeat(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn advancing_heartbeat_keeps_device_alive() {
        let (mock, mut packages) = setup();
        mock.set_heartbeat(Heartbeat::Counting(100));
        mock.set_message_code(2);
        let policy = RetryPolicy::new(1, Duration::ZERO);

        for expected in 101..105 {
            let block = engine().read_status(&mut packages, policy).await.expect("read");
            assert_eq!(block.heartbeat(), expected);
            assert_eq!(block.message_code(), 2);
            assert_eq!(block.word(2), 0x0102);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn status_read_runs_three_attempts_per_pass() {
        let (mock, mut packages) = setup();
        mock.fail_always(BusStatus(0x30));
        let delay = Duration::from_millis(20);

        let start = Instant::now();
        let err = engine()
            .read_status(&mut packages, RetryPolicy::new(2, delay))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PiopError::BusTransaction { status: BusStatus(0x30), attempts: 6, .. }
        ));
        assert_eq!(mock.execute_calls(), 6);
        assert!(start.elapsed() >= delay);
        assert_eq!(packages.heartbeat(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn status_checksum_mismatch_leaves_heartbeat_cache() {
        let (mock, mut packages) = setup();
        mock.corrupt_checksums(true);

        let err = engine()
            .read_status(&mut packages, RetryPolicy::new(1, Duration::ZERO))
            .await
            .unwrap_err();

        assert!(matches!(err, PiopError::Checksum { block: "status", .. }));
        assert_eq!(packages.heartbeat(), 0);

        let unchecked = BlockEngine::new(WireFormat::native(), false);
        assert!(
            unchecked.read_status(&mut packages, RetryPolicy::new(1, Duration::ZERO)).await.is_ok()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ftp_read_waits_then_decodes() {
        let (mock, mut packages) = setup();
        let delay = Duration::from_millis(15);

        let start = Instant::now();
        let block = engine()
            .read_ftp(&mut packages, RetryPolicy::new(0, delay))
            .await
            .expect("ftp read");

        assert!(start.elapsed() >= delay);
        assert_eq!(mock.execute_calls(), 1);
        assert_eq!(block.as_bytes().len(), FTP_BLOCK_LEN);
        assert_eq!(block.word(10), 30);
        assert!(verify_checksum("FTP", block.as_bytes()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn decoding_follows_configured_wire_format() {
        let format = WireFormat { swap_bytes: true, swap_words: false };
        let (mock, mut packages) = setup();
        mock.set_format(format);
        mock.set_heartbeat(Heartbeat::Fixed(0x1234));

        let block = BlockEngine::new(format, true)
            .read_status(&mut packages, RetryPolicy::new(1, Duration::ZERO))
            .await
            .expect("read");

        assert_eq!(block.heartbeat(), 0x1234);
    }
}
