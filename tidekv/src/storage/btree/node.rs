//! On-disk layout of index nodes and value records.
//!
//! Both record kinds live in the same heap at allocator-chosen offsets and
//! describe their own length.
//!
//! Index node:
//! - `tag`: 1 byte (`0xB0` internal, `0xB1` leaf)
//! - `header_len`: 4 bytes
//! - `keys`: `header_len` bytes of bincode
//! - value pointers: 8 bytes each, one per key
//! - child pointers: 8 bytes each, one more than keys (internal only)
//!
//! Value record:
//! - `live`: 1 byte (`0` tombstone, `1` live)
//! - `payload_len`: 4 bytes
//! - `checksum`: 4 bytes, crc32 of the payload
//! - `payload`: bincode of `(key, value)`
//!
//! Pointers sit at the tail of a node at fixed width so a single slot can be
//! patched in place. The node tags never collide with the liveness tags, which
//! keeps the repair scan from mistaking a node for a value record.

// Record sizes are bounded by `max_record_size`, which fits in u32.
#![allow(clippy::cast_possible_truncation)]

use std::io::{ErrorKind, Read, Write};

use bincode::Options;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::storage::error::{Result, StoreError};

/// Tag byte of an internal index node.
pub const NODE_TAG_INTERNAL: u8 = 0xB0;
/// Tag byte of a leaf index node.
pub const NODE_TAG_LEAF: u8 = 0xB1;
/// Liveness byte of a tombstoned value record.
pub const VALUE_TAG_DEAD: u8 = 0;
/// Liveness byte of a live value record.
pub const VALUE_TAG_LIVE: u8 = 1;

/// Width of one on-disk pointer.
pub const POINTER_SIZE: u64 = 8;

/// Fixed prefix of an index node: tag + header length.
const NODE_PREFIX: usize = 5;
/// Fixed prefix of a value record: tag + payload length + checksum.
const VALUE_PREFIX: usize = 9;

/// Encode a pointer the way it is stored in a node slot or the file header.
#[must_use]
pub fn encode_pointer(pointer: u64) -> Vec<u8> {
    pointer.to_le_bytes().to_vec()
}

/// Serialization settings shared by every record.
///
/// Wraps bincode with fixed-width integers and a byte limit so corrupt length
/// fields cannot trigger huge allocations.
#[derive(Debug, Clone, Copy)]
pub struct RecordCodec {
    limit: u64,
}

impl RecordCodec {
    /// Create a codec that rejects records larger than `limit` bytes.
    #[must_use]
    pub const fn new(limit: u64) -> Self {
        Self { limit }
    }

    fn options(self) -> impl Options {
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_limit(self.limit)
    }

    /// Append one bincode value to a stream.
    pub fn serialize_into<T: Serialize, W: Write>(self, writer: W, value: &T) -> Result<()> {
        self.options()
            .serialize_into(writer, value)
            .map_err(|e| StoreError::Codec(e.to_string()))
    }

    /// Read one bincode value from a stream.
    pub fn deserialize_from<T: DeserializeOwned, R: Read>(self, reader: R) -> Result<T> {
        self.options()
            .deserialize_from(reader)
            .map_err(|e| StoreError::Codec(e.to_string()))
    }

    /// Serialize a node and record its encoded size on it.
    pub fn encode_node<K: Serialize>(self, node: &mut IndexNode<K>) -> Result<Vec<u8>> {
        let header = self
            .options()
            .serialize(&node.keys)
            .map_err(|e| StoreError::Codec(e.to_string()))?;

        let pointers = node.values.len() + node.children.len();
        let mut bytes = Vec::with_capacity(NODE_PREFIX + header.len() + pointers * 8);
        bytes.push(if node.is_leaf {
            NODE_TAG_LEAF
        } else {
            NODE_TAG_INTERNAL
        });
        bytes.extend_from_slice(&(header.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&header);
        for pointer in node.values.iter().chain(node.children.iter()) {
            bytes.extend_from_slice(&pointer.to_le_bytes());
        }

        node.size = bytes.len() as u64;
        Ok(bytes)
    }

    /// Read one node starting at `address`.
    ///
    /// The reader must be positioned at `address`; it is left just past the node.
    pub fn decode_node<K: DeserializeOwned, R: Read>(
        self,
        reader: &mut R,
        address: u64,
    ) -> Result<IndexNode<K>> {
        let mut prefix = [0u8; NODE_PREFIX];
        read_record(reader, &mut prefix, address)?;

        let is_leaf = match prefix[0] {
            NODE_TAG_LEAF => true,
            NODE_TAG_INTERNAL => false,
            tag => return Err(corrupted(address, format!("bad node tag {tag:#04x}"))),
        };
        let header_len = u64::from(u32::from_le_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]));
        if header_len > self.limit {
            return Err(corrupted(address, format!("node header of {header_len} bytes")));
        }

        let mut header = vec![0u8; header_len as usize];
        read_record(reader, &mut header, address)?;
        let keys: Vec<K> = self
            .options()
            .deserialize(&header)
            .map_err(|e| corrupted(address, format!("undecodable keys: {e}")))?;

        let key_count = keys.len();
        let pointer_count = if is_leaf {
            key_count
        } else {
            2 * key_count + 1
        };
        let pointer_bytes = pointer_count as u64 * POINTER_SIZE;
        if pointer_bytes > self.limit {
            return Err(corrupted(address, format!("{key_count} keys exceed record limit")));
        }

        let mut raw = vec![0u8; pointer_bytes as usize];
        read_record(reader, &mut raw, address)?;
        let mut pointers = raw.chunks_exact(8).map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            u64::from_le_bytes(word)
        });

        let values: Vec<u64> = pointers.by_ref().take(key_count).collect();
        let children: Vec<u64> = pointers.collect();

        Ok(IndexNode {
            is_leaf,
            keys,
            values,
            children,
            address,
            size: NODE_PREFIX as u64 + header_len + pointer_bytes,
        })
    }

    /// Serialize a live value record and record its encoded size on it.
    pub fn encode_value<K: Serialize, V: Serialize>(
        self,
        record: &mut ValueNode<K, V>,
    ) -> Result<Vec<u8>> {
        let payload = self
            .options()
            .serialize(&(&record.key, &record.value))
            .map_err(|e| StoreError::Codec(e.to_string()))?;

        let mut bytes = Vec::with_capacity(VALUE_PREFIX + payload.len());
        bytes.push(if record.live {
            VALUE_TAG_LIVE
        } else {
            VALUE_TAG_DEAD
        });
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        bytes.extend_from_slice(&payload);

        record.size = bytes.len() as u64;
        Ok(bytes)
    }

    /// Read one value record starting at `address`.
    ///
    /// Tombstoned records decode normally with `live == false`: a reader that
    /// still holds a superseded pointer is allowed to see the old value.
    pub fn decode_value<K: DeserializeOwned, V: DeserializeOwned, R: Read>(
        self,
        reader: &mut R,
        address: u64,
    ) -> Result<ValueNode<K, V>> {
        let mut prefix = [0u8; VALUE_PREFIX];
        read_record(reader, &mut prefix, address)?;

        let live = match prefix[0] {
            VALUE_TAG_LIVE => true,
            VALUE_TAG_DEAD => false,
            tag => return Err(corrupted(address, format!("bad liveness tag {tag:#04x}"))),
        };
        let payload_len = u64::from(u32::from_le_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]));
        let checksum = u32::from_le_bytes([prefix[5], prefix[6], prefix[7], prefix[8]]);
        if payload_len > self.limit {
            return Err(corrupted(address, format!("value payload of {payload_len} bytes")));
        }

        let mut payload = vec![0u8; payload_len as usize];
        read_record(reader, &mut payload, address)?;
        if crc32fast::hash(&payload) != checksum {
            return Err(corrupted(address, "checksum mismatch".to_string()));
        }

        let (key, value) = self
            .options()
            .deserialize(&payload)
            .map_err(|e| corrupted(address, format!("undecodable payload: {e}")))?;

        Ok(ValueNode {
            live,
            key,
            value,
            address,
            size: VALUE_PREFIX as u64 + payload_len,
        })
    }
}

/// One B-tree node, leaf or internal.
///
/// `values[i]` points at the value record for `keys[i]`. For internal nodes
/// `children[i]` holds keys below `keys[i]` and `children[i + 1]` keys above it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexNode<K> {
    pub is_leaf: bool,
    pub keys: Vec<K>,
    pub values: Vec<u64>,
    pub children: Vec<u64>,
    /// Where the node lives on disk, 0 until placed.
    pub address: u64,
    /// Encoded length, 0 until encoded.
    pub size: u64,
}

impl<K> IndexNode<K> {
    /// Create an empty, unplaced leaf.
    #[must_use]
    pub const fn leaf() -> Self {
        Self {
            is_leaf: true,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
            address: 0,
            size: 0,
        }
    }

    /// Create an empty, unplaced internal node.
    #[must_use]
    pub const fn internal() -> Self {
        Self {
            is_leaf: false,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
            address: 0,
            size: 0,
        }
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the node holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Whether the node holds the maximum `2t - 1` keys.
    #[must_use]
    pub fn is_full(&self, min_degree: usize) -> bool {
        self.keys.len() >= 2 * min_degree - 1
    }

    /// Disk address of the first pointer slot.
    fn pointer_base(&self) -> u64 {
        debug_assert!(self.address > 0 && self.size > 0, "node is not placed");
        let pointers = (self.values.len() + self.children.len()) as u64;
        self.address + self.size - pointers * POINTER_SIZE
    }

    /// Disk address of the pointer to the value of `keys[n]`.
    #[must_use]
    pub fn value_slot(&self, n: usize) -> u64 {
        self.pointer_base() + n as u64 * POINTER_SIZE
    }

    /// Disk address of the pointer to `children[n]`.
    #[must_use]
    pub fn child_slot(&self, n: usize) -> u64 {
        self.pointer_base() + (self.values.len() + n) as u64 * POINTER_SIZE
    }
}

impl<K: Ord> IndexNode<K> {
    /// Binary search for `key`: `Ok(i)` on a hit, `Err(i)` with the child to
    /// descend into (equivalently, the insertion point) otherwise.
    pub fn search(&self, key: &K) -> std::result::Result<usize, usize> {
        self.keys.binary_search(key)
    }
}

/// One stored key/value record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueNode<K, V> {
    pub live: bool,
    pub key: K,
    pub value: V,
    /// Where the record lives on disk, 0 until placed.
    pub address: u64,
    /// Encoded length, 0 until encoded.
    pub size: u64,
}

impl<K, V> ValueNode<K, V> {
    /// Create an unplaced live record.
    pub const fn new(key: K, value: V) -> Self {
        Self {
            live: true,
            key,
            value,
            address: 0,
            size: 0,
        }
    }
}

fn corrupted(address: u64, reason: String) -> StoreError {
    StoreError::CorruptedRecord { address, reason }
}

/// `read_exact`, treating a short read as a corrupt record rather than I/O failure.
fn read_record<R: Read>(reader: &mut R, buf: &mut [u8], address: u64) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            corrupted(address, "record runs past end of file".to_string())
        } else {
            StoreError::Io(e)
        }
    })
}
