//! File header structure and serialization.
//!
//! The header occupies the first 9 bytes of the file:
//! - `status`: 1 byte (`0` open or uncleanly closed, `1` cleanly closed)
//! - `root`: 8 bytes, little-endian address of the root node
//!
//! Records start right after it, so a fresh file places its empty root at 9.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::storage::btree::node::encode_pointer;
use crate::storage::error::StoreError;

/// Size of the header, and the address of the first record.
pub const HEADER_SIZE: u64 = 9;

/// Address of the root pointer, treated as the parent slot of the root node.
pub const ROOT_SLOT: u64 = 1;

/// Header field offsets.
mod offsets {
    pub const STATUS: usize = 0;
    pub const ROOT: usize = 1;
}

/// Whether the file was closed cleanly.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// Open, or the last session crashed.
    Open,
    /// The last session called `close()`.
    Clean,
}

impl Status {
    const fn to_byte(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Clean => 1,
        }
    }
}

/// The decoded file header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub status: Status,
    pub root: u64,
}

impl Default for Superblock {
    fn default() -> Self {
        Self::new()
    }
}

impl Superblock {
    /// Header of a freshly created file.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            status: Status::Open,
            root: HEADER_SIZE,
        }
    }

    /// Serialize the header.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 9] {
        let mut bytes = [0u8; 9];
        bytes[offsets::STATUS] = self.status.to_byte();
        bytes[offsets::ROOT..].copy_from_slice(&self.root.to_le_bytes());
        bytes
    }

    /// Deserialize a header.
    pub fn from_bytes(bytes: &[u8; 9]) -> Result<Self, SuperblockError> {
        let status = match bytes[offsets::STATUS] {
            0 => Status::Open,
            1 => Status::Clean,
            other => return Err(SuperblockError::InvalidStatus(other)),
        };
        let mut root = [0u8; 8];
        root.copy_from_slice(&bytes[offsets::ROOT..]);
        let root = u64::from_le_bytes(root);
        if root < HEADER_SIZE {
            return Err(SuperblockError::RootInHeader(root));
        }
        Ok(Self { status, root })
    }

    /// Read and validate the header of `file`.
    pub fn read_from(file: &mut File) -> Result<Self, SuperblockError> {
        let len = file.metadata().map_err(SuperblockError::Io)?.len();
        if len < HEADER_SIZE {
            return Err(SuperblockError::Truncated(len));
        }
        let mut bytes = [0u8; 9];
        file.seek(SeekFrom::Start(0)).map_err(SuperblockError::Io)?;
        file.read_exact(&mut bytes).map_err(SuperblockError::Io)?;
        let header = Self::from_bytes(&bytes)?;
        if header.root >= len {
            return Err(SuperblockError::RootPastEnd { root: header.root, len });
        }
        Ok(header)
    }

    /// Write the whole header.
    pub fn write_to(&self, file: &mut File) -> std::io::Result<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.to_bytes())
    }
}

/// Overwrite only the status byte.
pub fn write_status(file: &mut File, status: Status) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offsets::STATUS as u64))?;
    file.write_all(&[status.to_byte()])
}

/// Overwrite only the root pointer.
pub fn write_root(file: &mut File, root: u64) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(ROOT_SLOT))?;
    file.write_all(&encode_pointer(root))
}

/// Errors that can occur when reading the header.
#[derive(Debug)]
pub enum SuperblockError {
    /// I/O error.
    Io(std::io::Error),
    /// File is shorter than the header.
    Truncated(u64),
    /// Status byte is neither 0 nor 1.
    InvalidStatus(u8),
    /// Root address points into the header.
    RootInHeader(u64),
    /// Root address points past the end of the file.
    RootPastEnd { root: u64, len: u64 },
}

impl std::fmt::Display for SuperblockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Truncated(len) => write!(f, "file of {len} bytes has no header"),
            Self::InvalidStatus(byte) => write!(f, "invalid status byte {byte:#04x}"),
            Self::RootInHeader(root) => write!(f, "root address {root} lies inside the header"),
            Self::RootPastEnd { root, len } => {
                write!(f, "root address {root} past end of file ({len} bytes)")
            }
        }
    }
}

impl std::error::Error for SuperblockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SuperblockError> for StoreError {
    fn from(e: SuperblockError) -> Self {
        match e {
            SuperblockError::Io(e) => Self::Io(e),
            other => Self::CorruptedRecord {
                address: 0,
                reason: other.to_string(),
            },
        }
    }
}
