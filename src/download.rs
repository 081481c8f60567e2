//! Image download sequencer.
//!
//! A download resolves the image on the search path, loads and corrects it,
//! resets the PIOP, then streams the image one block per bus transaction
//! until the terminal block has been sent. The image buffer lives only for
//! the duration of one download, so every request reloads from disk.

use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::block::WireFormat;
use crate::bus::{
    BusStatus, CamacAddress, CamacBus, ControlWord, OwnedPackage, STATUS_Q, STATUS_RESPONSE_MASK,
    STATUS_X, function,
};
use crate::error::BlockFailure;
use crate::image::{IMAGE_BLOCK_STRIDE, Image, ImageBlock, ImageSource};
use crate::package::{DATA_OP, PROBE_OP};
use crate::{PiopError, Result};

/// Subaddress of the PIOP download port.
pub const DOWNLOAD_SUBADDRESS: u8 = 2;
/// Subaddress the reset (F9) is issued on.
pub const RESET_SUBADDRESS: u8 = 0;

/// Response every download operation must echo.
const EXPECTED_RESPONSE: u32 = STATUS_X | STATUS_Q;

/// Settle intervals around a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadTiming {
    /// Wait after the reset before the first block.
    #[serde(rename = "reset_settle_ms", deserialize_with = "crate::config::millis")]
    pub reset_settle: Duration,
    /// Wait after the last block.
    #[serde(rename = "final_settle_ms", deserialize_with = "crate::config::millis")]
    pub final_settle: Duration,
}

impl Default for DownloadTiming {
    fn default() -> Self {
        Self { reset_settle: Duration::from_millis(2000), final_settle: Duration::from_millis(500) }
    }
}

/// Outcome of a completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub image: PathBuf,
    pub blocks_sent: usize,
    /// False when the image ran out of blocks before a terminal marker.
    pub terminated_by_marker: bool,
}

/// Streams images into a PIOP.
#[derive(Debug, Clone)]
pub struct DownloadSequencer {
    source: ImageSource,
    format: WireFormat,
    max_blocks: usize,
    timing: DownloadTiming,
}

impl DownloadSequencer {
    pub fn new(
        source: ImageSource,
        format: WireFormat,
        max_blocks: usize,
        timing: DownloadTiming,
    ) -> Self {
        Self { source, format, max_blocks, timing }
    }

    pub fn source(&self) -> &ImageSource {
        &self.source
    }

    /// Run a full download of `image_name` into the PIOP at `address`.
    ///
    /// Blocks already sent are not rolled back when a later block fails; the
    /// caller restarts the whole sequence.
    pub async fn download(
        &self,
        bus: &Arc<dyn CamacBus>,
        address: CamacAddress,
        image_name: &str,
    ) -> Result<DownloadReport> {
        let path = self.source.resolve(image_name)?;
        let max_bytes = self.max_blocks.saturating_mul(IMAGE_BLOCK_STRIDE);
        let image = Image::load(&path, self.format, max_bytes)?;
        info!(%address, image = %path.display(), blocks = image.block_count(), "Starting download");

        reset_device(bus, address).await?;
        tokio::time::sleep(self.timing.reset_settle).await;

        let mut blocks_sent = 0;
        let mut terminated_by_marker = false;
        for block in image.blocks().take(self.max_blocks) {
            send_block(bus, address, &block).await?;
            blocks_sent += 1;
            if block.is_terminal() {
                terminated_by_marker = true;
                break;
            }
        }

        if !terminated_by_marker {
            warn!(
                %address,
                blocks_sent,
                "Image ended without a terminal block; it may be truncated"
            );
        }

        tokio::time::sleep(self.timing.final_settle).await;
        info!(%address, blocks_sent, "Download complete");

        Ok(DownloadReport { image: path, blocks_sent, terminated_by_marker })
    }
}

/// Issue F9 and check the echoed response.
async fn reset_device(bus: &Arc<dyn CamacBus>, address: CamacAddress) -> Result<()> {
    let mut package = OwnedPackage::allocate(bus, 1, "download reset")?;
    package.push(
        ControlWord::new(address, RESET_SUBADDRESS, function::CLEAR),
        0,
        STATUS_RESPONSE_MASK,
        "download reset",
    )?;

    let status = package.execute().await;
    let echo = package.operation(0).map_or(0, |op| op.status);
    if !status.is_success() || echo & STATUS_RESPONSE_MASK != EXPECTED_RESPONSE {
        warn!(%address, %status, echo, "Reset was not acknowledged");
        return Err(PiopError::DownloadResetFailed { status, echo });
    }

    debug!(%address, "Reset acknowledged");
    Ok(())
}

async fn send_block(
    bus: &Arc<dyn CamacBus>,
    address: CamacAddress,
    block: &ImageBlock<'_>,
) -> Result<()> {
    let fail = |reason| PiopError::DownloadBlockFailed { block: block.index, reason };
    let kind = block.kind().ok_or_else(|| fail(BlockFailure::UnknownTag(block.tag)))?;
    let payload = block.payload(kind);

    let mut package = OwnedPackage::allocate(bus, 2, "download block")?;
    package.push(
        ControlWord::new(address, DOWNLOAD_SUBADDRESS, function::TEST_STATUS),
        0,
        STATUS_RESPONSE_MASK,
        "download block",
    )?;
    package.push(
        ControlWord::new(address, DOWNLOAD_SUBADDRESS, function::WRITE).packed(),
        payload.len(),
        STATUS_RESPONSE_MASK,
        "download block",
    )?;
    package.data_mut(DATA_OP).copy_from_slice(payload);

    let status = package.execute().await;
    check_block(&package, status).map_err(|reason| {
        warn!(%address, block = block.index, %reason, "Download block rejected");
        fail(reason)
    })?;

    trace!(block = block.index, tag = block.tag, len = payload.len(), "Sent download block");
    Ok(())
}

fn check_block(package: &OwnedPackage, status: BusStatus) -> std::result::Result<(), BlockFailure> {
    if !status.is_success() {
        return Err(BlockFailure::Bus(status));
    }
    let probe = package.operation(PROBE_OP).map_or(0, |op| op.status);
    if probe & STATUS_RESPONSE_MASK != EXPECTED_RESPONSE {
        return Err(BlockFailure::Probe(probe));
    }
    let transfer = package.operation(DATA_OP).map_or(0, |op| op.status);
    if transfer & STATUS_RESPONSE_MASK != EXPECTED_RESPONSE {
        return Err(BlockFailure::Transfer(transfer));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::block::{CONTROL_BLOCK_LEN, FTP_BLOCK_LEN};
    use crate::image::{DEFAULT_MAX_BLOCKS, TAG_FTP};
    use crate::test_utils::{ImageBuilder, MockBus, frame_file};
    use tempfile::TempDir;
    use tokio::time::Instant;

    const ADDRESS: CamacAddress = CamacAddress { crate_id: 1, slot: 7 };

    fn timing() -> DownloadTiming {
        DownloadTiming {
            reset_settle: Duration::from_millis(200),
            final_settle: Duration::from_millis(50),
        }
    }

    fn write_image(builder: &ImageBuilder) -> (TempDir, DownloadSequencer) {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("kly.img"), builder.framed(WireFormat::native(), 200))
            .expect("write image");
        let sequencer = DownloadSequencer::new(
            ImageSource::new(vec![dir.path().to_path_buf()]),
            WireFormat::native(),
            DEFAULT_MAX_BLOCKS,
            timing(),
        );
        (dir, sequencer)
    }

    fn bus(mock: &Arc<MockBus>) -> Arc<dyn CamacBus> {
        mock.clone()
    }

    #[tokio::test(start_paused = true)]
    async fn streams_blocks_until_terminal_marker() {
        let builder =
            ImageBuilder::new().control(&[0x11; 32]).numbered_ftp(3).terminal_ftp(&[0x22; 134]);
        let (_dir, sequencer) = write_image(&builder);
        let mock = MockBus::new();

        let start = Instant::now();
        let report = sequencer.download(&bus(&mock), ADDRESS, "kly.img").await.expect("download");

        assert_eq!(report.blocks_sent, 5);
        assert!(report.terminated_by_marker);
        assert!(start.elapsed() >= Duration::from_millis(250));

        let writes = mock.download_writes();
        assert_eq!(writes.len(), 5);
        assert_eq!(writes[0].data, vec![0x11; CONTROL_BLOCK_LEN]);
        assert_eq!(writes[1].data.len(), FTP_BLOCK_LEN);
        assert_eq!(writes[2].data[0], 1);
        assert_eq!(writes[4].data, vec![0x22; FTP_BLOCK_LEN]);
        assert!(writes.iter().all(|w| w.control.is_packed() && w.control.slot() == 7));
        assert_eq!(mock.live_packages(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_after_marker_are_not_sent() {
        let builder = ImageBuilder::new().terminal_ftp(&[1]).numbered_ftp(4);
        let (_dir, sequencer) = write_image(&builder);
        let mock = MockBus::new();

        let report = sequencer.download(&bus(&mock), ADDRESS, "kly.img").await.expect("download");

        assert_eq!(report.blocks_sent, 1);
        assert_eq!(mock.download_writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_block_stops_the_stream() {
        let builder = ImageBuilder::new().numbered_ftp(10).terminal_ftp(&[0]);
        let (_dir, sequencer) = write_image(&builder);
        let mock = MockBus::new();
        mock.fail_download_transfer(7, STATUS_X);

        let err = sequencer.download(&bus(&mock), ADDRESS, "kly.img").await.unwrap_err();

        assert!(matches!(
            err,
            PiopError::DownloadBlockFailed { block: 7, reason: BlockFailure::Transfer(STATUS_X) }
        ));
        let writes = mock.download_writes();
        assert_eq!(writes.len(), 8);
        for (i, write) in writes.iter().take(7).enumerate() {
            assert_eq!(write.data[0], i as u8);
        }
        assert_eq!(mock.live_packages(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bus_failure_names_the_block() {
        let builder = ImageBuilder::new().numbered_ftp(3);
        let (_dir, sequencer) = write_image(&builder);
        let mock = MockBus::new();
        let bus = bus(&mock);

        let handle =
            tokio::spawn(async move { sequencer.download(&bus, ADDRESS, "kly.img").await });
        // The reset has been acknowledged; fail the bus during the settle wait.
        tokio::time::sleep(Duration::from_millis(100)).await;
        mock.fail_always(BusStatus(0x2a));

        let err = handle.await.expect("join").unwrap_err();
        assert!(matches!(
            err,
            PiopError::DownloadBlockFailed { block: 0, reason: BlockFailure::Bus(BusStatus(0x2a)) }
        ));
        assert_eq!(mock.live_packages(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_reset_fails_before_streaming() {
        let builder = ImageBuilder::new().terminal_ftp(&[1]);
        let (_dir, sequencer) = write_image(&builder);
        let mock = MockBus::new();
        mock.set_reset_echo(STATUS_X);

        let err = sequencer.download(&bus(&mock), ADDRESS, "kly.img").await.unwrap_err();

        assert!(matches!(err, PiopError::DownloadResetFailed { echo: STATUS_X, .. }));
        assert!(mock.download_writes().is_empty());
        assert_eq!(mock.live_packages(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_marker_is_success_with_warning() {
        let builder = ImageBuilder::new().numbered_ftp(3);
        let (_dir, sequencer) = write_image(&builder);
        let mock = MockBus::new();

        let report = sequencer.download(&bus(&mock), ADDRESS, "kly.img").await.expect("download");

        assert_eq!(report.blocks_sent, 3);
        assert!(!report.terminated_by_marker);
    }

    #[tokio::test(start_paused = true)]
    async fn block_count_is_bounded() {
        let builder = ImageBuilder::new().numbered_ftp(6);
        let (dir, _) = write_image(&builder);
        let sequencer = DownloadSequencer::new(
            ImageSource::new(vec![dir.path().to_path_buf()]),
            WireFormat::native(),
            4,
            timing(),
        );
        let mock = MockBus::new();

        let err = sequencer.download(&bus(&mock), ADDRESS, "kly.img").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImageTooLarge);
        assert_eq!(mock.execute_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_tag_is_block_failure() {
        let builder = ImageBuilder::new().ftp(&[1]).raw_tag(0x0007, &[2]).raw_tag(TAG_FTP, &[3]);
        let (_dir, sequencer) = write_image(&builder);
        let mock = MockBus::new();

        let err = sequencer.download(&bus(&mock), ADDRESS, "kly.img").await.unwrap_err();

        assert!(matches!(
            err,
            PiopError::DownloadBlockFailed { block: 1, reason: BlockFailure::UnknownTag(0x0007) }
        ));
        assert_eq!(mock.download_writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_image_touches_nothing() {
        let (_dir, sequencer) = write_image(&ImageBuilder::new().terminal_ftp(&[1]));
        let mock = MockBus::new();

        let err = sequencer.download(&bus(&mock), ADDRESS, "absent.img").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ImageSourceError);
        assert_eq!(mock.allocations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_images_fail_before_the_reset() {
        let (dir, sequencer) = write_image(&ImageBuilder::new().terminal_ftp(&[1]));
        let mock = MockBus::new();
        let bus = bus(&mock);

        let mut partial = ImageBuilder::new().terminal_ftp(&[1]).memory_image();
        partial.extend_from_slice(&[0xEE; 4]);
        std::fs::write(dir.path().join("kly.img"), frame_file(&[partial], true))
            .expect("write partial image");
        let err = sequencer.download(&bus, ADDRESS, "kly.img").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImageSourceError);

        std::fs::write(dir.path().join("kly.img"), frame_file(&[vec![0; 10], vec![0; 20]], true))
            .expect("write short image");
        let err = sequencer.download(&bus, ADDRESS, "kly.img").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImageSourceError);

        assert_eq!(mock.allocations(), 0);
        assert_eq!(mock.reset_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn every_request_reloads_from_disk() {
        let (dir, sequencer) = write_image(&ImageBuilder::new().terminal_ftp(&[0xAA; 134]));
        let mock = MockBus::new();
        let bus = bus(&mock);

        sequencer.download(&bus, ADDRESS, "kly.img").await.expect("first");
        std::fs::write(
            dir.path().join("kly.img"),
            ImageBuilder::new().terminal_ftp(&[0xBB; 134]).framed(WireFormat::native(), 64),
        )
        .expect("rewrite image");
        sequencer.download(&bus, ADDRESS, "kly.img").await.expect("second");

        let writes = mock.download_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].data[0], 0xAA);
        assert_eq!(writes[1].data[0], 0xBB);
    }
}
