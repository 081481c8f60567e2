//! PIOP download images.
//!
//! An image file is a sequence of variable-length records:
//!
//! ```text
//! [u16 big-endian length][u16 reserved][length - 2 payload bytes]
//! ```
//!
//! A zero length (or end of file at a record boundary) ends the image.
//! Payloads are concatenated into one buffer which is then read as fixed
//! 136-byte block slots: a tag word followed by the block body.
//!
//! The image was written for the bus transport, which fixes byte order but
//! not the longword order of the 32-bit bus. Loading therefore byte-swaps
//! each record as it is appended and longword-swaps every slot once the
//! file has been read.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::block::{self, CONTROL_BLOCK_LEN, FTP_BLOCK_LEN, WireFormat};
use crate::{PiopError, Result};

/// Bytes per block slot in the loaded image.
pub const IMAGE_BLOCK_STRIDE: usize = 2 + FTP_BLOCK_LEN;
/// Default bound on the number of block slots.
pub const DEFAULT_MAX_BLOCKS: usize = 512;

pub const TAG_KIND_MASK: u16 = 0x00FF;
pub const TAG_CONTROL: u16 = 0x0001;
pub const TAG_FTP: u16 = 0x0002;
/// Set on the last block of an image.
pub const TAG_TERMINAL: u16 = 0x8000;

/// Kind of a download block, which fixes its transfer length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Control,
    Ftp,
}

impl BlockKind {
    pub fn transfer_len(self) -> usize {
        match self {
            BlockKind::Control => CONTROL_BLOCK_LEN,
            BlockKind::Ftp => FTP_BLOCK_LEN,
        }
    }
}

/// One block slot of a loaded image.
#[derive(Debug, Clone, Copy)]
pub struct ImageBlock<'a> {
    pub index: usize,
    pub tag: u16,
    body: &'a [u8],
}

impl<'a> ImageBlock<'a> {
    /// Block kind, or `None` for an unknown tag.
    pub fn kind(&self) -> Option<BlockKind> {
        match self.tag & TAG_KIND_MASK {
            TAG_CONTROL => Some(BlockKind::Control),
            TAG_FTP => Some(BlockKind::Ftp),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.tag & TAG_TERMINAL != 0
    }

    /// Bytes to transfer for a block of `kind`.
    pub fn payload(&self, kind: BlockKind) -> &'a [u8] {
        &self.body[..kind.transfer_len()]
    }
}

/// Directories searched, in order, for image files.
#[derive(Debug, Clone, Default)]
pub struct ImageSource {
    search_path: Vec<PathBuf>,
}

impl ImageSource {
    pub fn new(search_path: Vec<PathBuf>) -> Self {
        Self { search_path }
    }

    pub fn search_path(&self) -> &[PathBuf] {
        &self.search_path
    }

    /// First existing regular file called `name` on the search path.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        for dir in &self.search_path {
            let candidate = dir.join(name);
            if candidate.is_file() {
                trace!(path = %candidate.display(), "Resolved image");
                return Ok(candidate);
            }
        }
        Err(PiopError::image_source(
            PathBuf::from(name),
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("not found in {} search directories", self.search_path.len()),
            ),
        ))
    }
}

/// A loaded, order-corrected image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    path: PathBuf,
    data: Vec<u8>,
}

impl Image {
    /// Read and correct the image at `path`.
    ///
    /// The image must hold at least one block slot and end on a slot boundary.
    pub fn load<P: AsRef<Path>>(path: P, format: WireFormat, max_bytes: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| PiopError::image_source(path.to_path_buf(), e))?;
        let data = Self::parse(BufReader::new(file), format, max_bytes).map_err(|e| match e {
            PiopError::ImageSource { source, .. } => {
                PiopError::image_source(path.to_path_buf(), source)
            }
            other => other,
        })?;
        check_slots(&data).map_err(|e| PiopError::image_source(path.to_path_buf(), e))?;

        debug!(path = %path.display(), bytes = data.len(), "Loaded image");
        Ok(Self { path: path.to_path_buf(), data })
    }

    /// Parse framed records from `reader` into a corrected buffer.
    pub fn parse<R: Read>(mut reader: R, format: WireFormat, max_bytes: usize) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut frames = 0usize;

        while let Some(len) = read_length(&mut reader)? {
            if len == 0 {
                trace!(frames, "Zero-length record ends image");
                break;
            }
            if len < 2 {
                return Err(PiopError::from(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("record {} has length {}", frames, len),
                )));
            }

            let mut reserved = [0u8; 2];
            reader.read_exact(&mut reserved)?;

            let payload_len = usize::from(len) - 2;
            let size = data.len() + payload_len;
            if size > max_bytes {
                return Err(PiopError::ImageTooLarge { size, max: max_bytes });
            }

            let start = data.len();
            data.resize(size, 0);
            reader.read_exact(&mut data[start..])?;
            if format.swap_bytes {
                block::swap_bytes(&mut data[start..]);
            }
            frames += 1;
        }

        if format.swap_words {
            for slot in data.chunks_mut(IMAGE_BLOCK_STRIDE) {
                block::swap_words(slot);
            }
        }

        trace!(frames, bytes = data.len(), "Parsed image records");
        Ok(data)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Block slots, in order.
    pub fn blocks(&self) -> impl Iterator<Item = ImageBlock<'_>> + '_ {
        self.data.chunks_exact(IMAGE_BLOCK_STRIDE).enumerate().map(|(index, slot)| ImageBlock {
            index,
            tag: block::word(slot, 0),
            body: &slot[2..],
        })
    }

    pub fn block_count(&self) -> usize {
        self.data.len() / IMAGE_BLOCK_STRIDE
    }
}

fn check_slots(data: &[u8]) -> io::Result<()> {
    if data.is_empty() || data.len() % IMAGE_BLOCK_STRIDE != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "image holds {} bytes, not a whole number of {}-byte blocks",
                data.len(),
                IMAGE_BLOCK_STRIDE
            ),
        ));
    }
    Ok(())
}

/// Read a record length; `None` at a clean end of file.
fn read_length<R: Read>(reader: &mut R) -> io::Result<Option<u16>> {
    let mut buf = [0u8; 2];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Some(u16::from_be_bytes(buf)))
}
