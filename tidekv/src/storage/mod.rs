//! Single-file storage engine.
//!
//! # File Format
//!
//! - Bytes 0-8: header (clean flag + root address)
//! - Everything after: index nodes and value records at allocator-chosen
//!   offsets, with freed gaps reused
//!
//! # Write Path
//!
//! A mutation writes its value record synchronously, records the node and
//! pointer changes in the version tracker, and queues their bytes for the
//! write pipeline. Readers consult the tracker first and fall back to the file.

pub mod allocator;
pub mod btree;
pub mod error;
pub mod file;
pub mod pipeline;
pub mod recovery;
pub mod superblock;
pub mod version;

pub use btree::{Engine, EngineStats, Key, Value};
pub use error::{Result, StoreError};
pub use recovery::RepairReport;
