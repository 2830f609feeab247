//! An ordered, persistent key-value store in a single file.
//!
//! Life of a write:
//! 1. The value record is appended (or reuses freed space) and written at once
//! 2. The B-tree path to it is copied, never edited in place
//! 3. The new nodes and repointed slots are recorded per address in the
//!    version tracker and queued for the background write pipeline
//! 4. The pipeline writes them in address order, dropping any a newer
//!    operation has already superseded
//!
//! Life of a read:
//! 1. Take a snapshot of the root and a reader task
//! 2. Walk down, asking the version tracker before reading the file
//!
//! Crash safety comes from the value records alone: a file that was not
//! closed cleanly is rebuilt from its live value records on the next open.

#![cfg_attr(test, allow(clippy::disallowed_methods))]

pub mod config;
pub mod db;
pub mod storage;

#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod testing;

pub use config::{ConfigError, EngineConfig};
pub use db::AsyncDb;
pub use storage::{Engine, EngineStats, Key, RepairReport, Result, StoreError, Value};
