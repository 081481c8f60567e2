//! CAMAC bus transaction interface.
//!
//! The low-level bus primitives live outside this crate. They are consumed
//! through [`CamacBus`], which mirrors the package life cycle of the host
//! CAMAC driver: allocate a package, append operations, execute (and reset
//! for a retry), release. [`OwnedPackage`] ties a package to the bus that
//! allocated it and releases it exactly once, when it is dropped.

use std::fmt;
use std::sync::Arc;
use tracing::trace;

use crate::{PiopError, Result};

/// Command accepted (X response) bit of an operation status word.
pub const STATUS_X: u32 = 0x0002_0000;
/// Q response bit of an operation status word.
pub const STATUS_Q: u32 = 0x0001_0000;
/// Response bits checked against the expected pattern.
pub const STATUS_RESPONSE_MASK: u32 = STATUS_X | STATUS_Q;

/// CAMAC function codes used by the PIOP.
pub mod function {
    /// Read group 1 register.
    pub const READ: u8 = 0;
    /// Clear; used as the PIOP hardware reset.
    pub const CLEAR: u8 = 9;
    /// Write group 1 register.
    pub const WRITE: u8 = 16;
    /// Test status; zero-length probe.
    pub const TEST_STATUS: u8 = 27;
}

/// Status returned by the bus driver.
///
/// The driver uses odd values for success. Always test with
/// [`BusStatus::is_success`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusStatus(pub u32);

impl BusStatus {
    pub const SUCCESS: BusStatus = BusStatus(1);

    pub fn is_success(self) -> bool {
        self.0 & 1 == 1
    }
}

impl fmt::Display for BusStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Crate and slot of a CAMAC module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CamacAddress {
    pub crate_id: u8,
    pub slot: u8,
}

impl CamacAddress {
    pub fn new(crate_id: u8, slot: u8) -> Self {
        Self { crate_id, slot }
    }
}

impl fmt::Display for CamacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{} N{}", self.crate_id, self.slot)
    }
}

/// Packed CAMAC control word: `F << 16 | C << 12 | N << 7 | A`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlWord(pub u32);

impl ControlWord {
    /// Transfer 16-bit words packed into the data buffer.
    pub const PACK_16: u32 = 0x0800_0000;

    pub fn new(address: CamacAddress, subaddress: u8, function: u8) -> Self {
        ControlWord(
            (u32::from(function & 0x1F) << 16)
                | (u32::from(address.crate_id & 0x0F) << 12)
                | (u32::from(address.slot & 0x1F) << 7)
                | u32::from(subaddress & 0x0F),
        )
    }

    pub fn packed(self) -> Self {
        ControlWord(self.0 | Self::PACK_16)
    }

    pub fn function(self) -> u8 {
        ((self.0 >> 16) & 0x1F) as u8
    }

    pub fn crate_id(self) -> u8 {
        ((self.0 >> 12) & 0x0F) as u8
    }

    pub fn slot(self) -> u8 {
        ((self.0 >> 7) & 0x1F) as u8
    }

    pub fn subaddress(self) -> u8 {
        (self.0 & 0x0F) as u8
    }

    pub fn is_packed(self) -> bool {
        self.0 & Self::PACK_16 != 0
    }
}

/// One operation of a package and the buffer it transfers.
#[derive(Debug, Clone)]
pub struct BusOperation {
    pub control: ControlWord,
    /// Data buffer; its length is the operation byte count.
    pub data: Vec<u8>,
    /// Status word written back by the driver on execution.
    pub status: u32,
    /// Expected-status mask handed to the driver.
    pub status_mask: u32,
}

/// A bus transaction package.
///
/// Created by [`CamacBus::allocate`]. Bus implementations use the id to find
/// their own resources; the rest of the crate only touches the operations.
#[derive(Debug)]
pub struct Package {
    id: u64,
    capacity: usize,
    operations: Vec<BusOperation>,
}

impl Package {
    pub fn new(id: u64, capacity: usize) -> Self {
        Self { id, capacity, operations: Vec::with_capacity(capacity) }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn operations(&self) -> &[BusOperation] {
        &self.operations
    }

    pub fn operations_mut(&mut self) -> &mut [BusOperation] {
        &mut self.operations
    }

    /// Append an operation if the package has room.
    pub fn push(&mut self, operation: BusOperation) -> bool {
        if self.operations.len() >= self.capacity {
            return false;
        }
        self.operations.push(operation);
        true
    }
}

/// Host CAMAC driver interface.
#[async_trait::async_trait]
pub trait CamacBus: Send + Sync + 'static {
    /// Allocate a package able to hold `operations` operations.
    fn allocate(&self, operations: usize) -> std::result::Result<Package, BusStatus>;

    /// Append an operation with a zeroed buffer of `byte_count` bytes.
    fn append_operation(
        &self,
        package: &mut Package,
        control: ControlWord,
        byte_count: usize,
        status_mask: u32,
    ) -> std::result::Result<(), BusStatus>;

    /// Execute every operation of the package in order.
    async fn execute(&self, package: &mut Package) -> BusStatus;

    /// Reset a package after a failed execution so it can be re-executed.
    async fn reset(&self, package: &mut Package) -> BusStatus;

    /// Return the package's driver resources.
    fn release(&self, package: &mut Package);
}

/// A package together with the bus that owns its resources.
pub struct OwnedPackage {
    bus: Arc<dyn CamacBus>,
    package: Package,
}

impl OwnedPackage {
    /// Allocate a package on `bus`.
    pub fn allocate(bus: &Arc<dyn CamacBus>, operations: usize, context: &str) -> Result<Self> {
        let package =
            bus.allocate(operations).map_err(|status| PiopError::allocation(context, status))?;
        trace!(package = package.id(), operations, "Allocated bus package");
        Ok(Self { bus: Arc::clone(bus), package })
    }

    /// Append an operation; failure is an allocation error for `context`.
    pub fn push(
        &mut self,
        control: ControlWord,
        byte_count: usize,
        status_mask: u32,
        context: &str,
    ) -> Result<()> {
        self.bus
            .append_operation(&mut self.package, control, byte_count, status_mask)
            .map_err(|status| PiopError::allocation(context, status))
    }

    pub async fn execute(&mut self) -> BusStatus {
        self.bus.execute(&mut self.package).await
    }

    pub async fn reset(&mut self) -> BusStatus {
        self.bus.reset(&mut self.package).await
    }

    /// Zero every operation buffer and status word.
    pub fn clear(&mut self) {
        for op in self.package.operations_mut() {
            op.data.fill(0);
            op.status = 0;
        }
    }

    pub fn operation(&self, index: usize) -> Option<&BusOperation> {
        self.package.operations().get(index)
    }

    pub fn operation_mut(&mut self, index: usize) -> Option<&mut BusOperation> {
        self.package.operations_mut().get_mut(index)
    }

    /// Buffer of operation `index`.
    ///
    /// # Panics
    ///
    /// Panics if the package has no operation `index`.
    pub fn data(&self, index: usize) -> &[u8] {
        &self.package.operations()[index].data
    }

    /// Mutable buffer of operation `index`.
    ///
    /// # Panics
    ///
    /// Panics if the package has no operation `index`.
    pub fn data_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.package.operations_mut()[index].data
    }

    pub fn package(&self) -> &Package {
        &self.package
    }
}

impl Drop for OwnedPackage {
    fn drop(&mut self) {
        trace!(package = self.package.id(), "Releasing bus package");
        self.bus.release(&mut self.package);
    }
}

impl fmt::Debug for OwnedPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedPackage").field("package", &self.package).finish()
    }
}
