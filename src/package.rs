//! Pre-built bus packages for one PIOP.
//!
//! Each PIOP gets three packages at record initialization: control block
//! write, FTP block read and status block read. Every package pairs a
//! zero-length status probe with the data transfer, and is reused for the
//! lifetime of the device.

use std::sync::Arc;
use tracing::debug;

use crate::block::{CONTROL_BLOCK_LEN, FTP_BLOCK_LEN, STATUS_BLOCK_LEN};
use crate::bus::{CamacAddress, CamacBus, ControlWord, OwnedPackage, STATUS_RESPONSE_MASK, function};
use crate::Result;

pub const CONTROL_SUBADDRESS: u8 = 0;
pub const FTP_SUBADDRESS: u8 = 0;
pub const STATUS_SUBADDRESS: u8 = 1;

/// Index of the status probe operation in every block package.
pub const PROBE_OP: usize = 0;
/// Index of the data transfer operation in every block package.
pub const DATA_OP: usize = 1;

/// The three packages of a block device plus its liveness cache.
#[derive(Debug)]
pub struct BlockPackages {
    address: CamacAddress,
    pub(crate) control_write: OwnedPackage,
    pub(crate) ftp_read: OwnedPackage,
    pub(crate) status_read: OwnedPackage,
    /// Last heartbeat seen in a status block; zero when unknown.
    pub(crate) heartbeat: u16,
}

impl BlockPackages {
    /// Allocate and fill all three packages for the PIOP at `address`.
    ///
    /// Packages that were already built are released if a later one fails.
    pub fn build(bus: &Arc<dyn CamacBus>, address: CamacAddress) -> Result<Self> {
        let control_write = build_package(
            bus,
            address,
            CONTROL_SUBADDRESS,
            function::WRITE,
            CONTROL_BLOCK_LEN,
            "control block write",
        )?;
        let ftp_read = build_package(
            bus,
            address,
            FTP_SUBADDRESS,
            function::READ,
            FTP_BLOCK_LEN,
            "FTP block read",
        )?;
        let status_read = build_package(
            bus,
            address,
            STATUS_SUBADDRESS,
            function::READ,
            STATUS_BLOCK_LEN,
            "status block read",
        )?;

        debug!(%address, "Built block packages");
        Ok(Self { address, control_write, ftp_read, status_read, heartbeat: 0 })
    }

    pub fn address(&self) -> CamacAddress {
        self.address
    }

    pub fn heartbeat(&self) -> u16 {
        self.heartbeat
    }
}

fn build_package(
    bus: &Arc<dyn CamacBus>,
    address: CamacAddress,
    subaddress: u8,
    transfer_function: u8,
    byte_count: usize,
    context: &str,
) -> Result<OwnedPackage> {
    let mut package = OwnedPackage::allocate(bus, 2, context)?;
    let probe = ControlWord::new(address, subaddress, function::TEST_STATUS);
    package.push(probe, 0, STATUS_RESPONSE_MASK, context)?;
    let transfer = ControlWord::new(address, subaddress, transfer_function).packed();
    package.push(transfer, byte_count, STATUS_RESPONSE_MASK, context)?;
    Ok(package)
}
