//! PIOP wire blocks.
//!
//! The PIOP exchanges three fixed-size blocks of 16-bit words:
//!
//! | Block   | Bytes | Direction      |
//! |---------|-------|----------------|
//! | Control | 32    | host -> device |
//! | Status  | 64    | device -> host |
//! | FTP     | 134   | device -> host |
//!
//! The last word of each block is a checksum: the 16-bit wrapping sum of all
//! preceding words. Two bitmap function codes use the whole control block
//! for data and carry no checksum.
//!
//! Blocks are assembled in host byte order and converted with
//! [`WireFormat`] just before they go on the bus (and just after they come
//! back). The device is big-endian and the bus transports 32-bit longwords,
//! so a little-endian host swaps both bytes and words.

use crate::{PiopError, Result};

pub const CONTROL_BLOCK_LEN: usize = 32;
pub const STATUS_BLOCK_LEN: usize = 64;
pub const FTP_BLOCK_LEN: usize = 134;

/// Payload bytes of a checksummed control block (function word and checksum excluded).
pub const CONTROL_PAYLOAD_LEN: usize = CONTROL_BLOCK_LEN - 4;
/// Payload bytes of a bitmap control block, which reuses the checksum slot.
pub const BITMAP_PAYLOAD_LEN: usize = CONTROL_BLOCK_LEN - 2;

pub const STATUS_HEARTBEAT_WORD: usize = 0;
pub const STATUS_MESSAGE_WORD: usize = 1;

/// Control block function code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionCode(pub u16);

impl FunctionCode {
    pub const SET_TRIGGER: FunctionCode = FunctionCode(0x0001);
    pub const SET_TIMING: FunctionCode = FunctionCode(0x0002);
    pub const STANDBY: FunctionCode = FunctionCode(0x0003);
    pub const RESET_FAULTS: FunctionCode = FunctionCode(0x0004);
    pub const FTP_SETUP: FunctionCode = FunctionCode(0x0010);
    /// Bitmap of channels sampled by the fast time plot.
    pub const FTP_BITMAP: FunctionCode = FunctionCode(0x0029);
    /// Bitmap of masked fault inputs.
    pub const MASK_BITMAP: FunctionCode = FunctionCode(0x002A);

    pub fn is_checksum_exempt(self) -> bool {
        self == Self::FTP_BITMAP || self == Self::MASK_BITMAP
    }

    /// Largest payload this function can carry.
    pub fn max_payload(self) -> usize {
        if self.is_checksum_exempt() { BITMAP_PAYLOAD_LEN } else { CONTROL_PAYLOAD_LEN }
    }
}

/// Byte and word order conversions between host memory and the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireFormat {
    /// Swap the two bytes of every 16-bit word.
    pub swap_bytes: bool,
    /// Swap the two 16-bit halves of every 32-bit longword.
    pub swap_words: bool,
}

impl WireFormat {
    /// Conversions needed by this host.
    pub fn native() -> Self {
        let little = cfg!(target_endian = "little");
        Self { swap_bytes: little, swap_words: little }
    }

    /// No conversion at all.
    pub fn identity() -> Self {
        Self { swap_bytes: false, swap_words: false }
    }

    pub fn to_wire(&self, buf: &mut [u8]) {
        if self.swap_bytes {
            swap_bytes(buf);
        }
        if self.swap_words {
            swap_words(buf);
        }
    }

    pub fn from_wire(&self, buf: &mut [u8]) {
        if self.swap_words {
            swap_words(buf);
        }
        if self.swap_bytes {
            swap_bytes(buf);
        }
    }
}

impl Default for WireFormat {
    fn default() -> Self {
        Self::native()
    }
}

/// Swap adjacent byte pairs. A trailing odd byte is left in place.
pub fn swap_bytes(buf: &mut [u8]) {
    for pair in buf.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

/// Swap the 16-bit halves of each 32-bit longword. A trailing partial longword is left in place.
pub fn swap_words(buf: &mut [u8]) {
    for quad in buf.chunks_exact_mut(4) {
        quad.swap(0, 2);
        quad.swap(1, 3);
    }
}

/// Read host-order word `index`.
pub fn word(buf: &[u8], index: usize) -> u16 {
    u16::from_ne_bytes([buf[2 * index], buf[2 * index + 1]])
}

/// Write host-order word `index`.
pub fn set_word(buf: &mut [u8], index: usize, value: u16) {
    buf[2 * index..2 * index + 2].copy_from_slice(&value.to_ne_bytes());
}

/// Wrapping sum of the host-order words in `buf`.
pub fn checksum(buf: &[u8]) -> u16 {
    buf.chunks_exact(2).fold(0u16, |sum, w| sum.wrapping_add(u16::from_ne_bytes([w[0], w[1]])))
}

/// Fill `buf` with a control block in host order.
///
/// `buf` is zeroed first. The checksum word is left untouched for
/// checksum-exempt functions.
pub fn encode_control_block(
    buf: &mut [u8; CONTROL_BLOCK_LEN],
    function: FunctionCode,
    payload: &[u8],
) -> Result<()> {
    let max = function.max_payload();
    if payload.len() > max {
        return Err(PiopError::InvalidPayload { len: payload.len(), max });
    }

    buf.fill(0);
    set_word(buf, 0, function.0);
    buf[2..2 + payload.len()].copy_from_slice(payload);

    if !function.is_checksum_exempt() {
        let last = CONTROL_BLOCK_LEN / 2 - 1;
        let sum = checksum(&buf[..CONTROL_BLOCK_LEN - 2]);
        set_word(buf, last, sum);
    }
    Ok(())
}

/// Check the trailing checksum word of a host-order block.
pub fn verify_checksum(block: &'static str, buf: &[u8]) -> Result<()> {
    let last = buf.len() / 2 - 1;
    let computed = checksum(&buf[..last * 2]);
    let received = word(buf, last);
    if computed != received {
        return Err(PiopError::Checksum { block, computed, received });
    }
    Ok(())
}

/// Decoded status block, in host byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusBlock {
    raw: [u8; STATUS_BLOCK_LEN],
}

impl StatusBlock {
    pub fn from_host_bytes(raw: [u8; STATUS_BLOCK_LEN]) -> Self {
        Self { raw }
    }

    pub fn heartbeat(&self) -> u16 {
        word(&self.raw, STATUS_HEARTBEAT_WORD)
    }

    pub fn message_code(&self) -> u16 {
        word(&self.raw, STATUS_MESSAGE_WORD)
    }

    pub fn word(&self, index: usize) -> u16 {
        word(&self.raw, index)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}

/// Decoded FTP (fast time plot) block, in host byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpBlock {
    raw: [u8; FTP_BLOCK_LEN],
}

impl FtpBlock {
    pub fn from_host_bytes(raw: [u8; FTP_BLOCK_LEN]) -> Self {
        Self { raw }
    }

    pub fn word(&self, index: usize) -> u16 {
        word(&self.raw, index)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}
