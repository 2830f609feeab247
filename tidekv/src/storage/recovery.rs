//! Repair of files that were not closed cleanly.
//!
//! Index nodes reach the file asynchronously, so after a crash the tree on
//! disk can be inconsistent. Value records are written synchronously and
//! tombstoned in place when superseded, so the set of live records is always
//! the committed contents of the store.
//!
//! # Repair Process
//!
//! 1. Scan every byte after the header for the live tag.
//! 2. Try to decode a checksummed value record there; on success stage the
//!    pair and jump past the record, otherwise move on by one byte.
//! 3. Write the staged pairs to `<path>.items.tmp`, then rename it to
//!    `<path>.items`.
//!
//! The engine then rebuilds a fresh file from the staging file and deletes it
//! last, so a crash at any point resumes from a complete staging file.

// Offsets into an in-memory copy of the file, which fits in usize.
#![allow(clippy::cast_possible_truncation)]

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use crate::storage::btree::node::{RecordCodec, VALUE_TAG_LIVE, ValueNode};
use crate::storage::btree::{Key, Value};
use crate::storage::error::{Result, StoreError};
use crate::storage::superblock::HEADER_SIZE;

/// Result of a repair scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RepairReport {
    /// Size of the scanned file.
    pub bytes_scanned: u64,

    /// Live value records written to the staging file.
    pub records_recovered: u64,

    /// Offsets carrying the live tag that did not hold a valid record.
    pub records_skipped: u64,
}

/// Where repaired records are staged for `path`.
#[must_use]
pub fn staging_path(path: &Path) -> PathBuf {
    with_suffix(path, ".items")
}

fn temp_staging_path(path: &Path) -> PathBuf {
    with_suffix(path, ".items.tmp")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Scan `path` for live value records and stage them next to it.
pub fn repair<K: Key, V: Value>(path: &Path, codec: RecordCodec) -> Result<RepairReport> {
    let data = std::fs::read(path)?;
    let temp = temp_staging_path(path);
    let mut writer = BufWriter::new(File::create(&temp)?);
    let mut report = RepairReport {
        bytes_scanned: data.len() as u64,
        ..RepairReport::default()
    };

    let mut offset = HEADER_SIZE as usize;
    while offset < data.len() {
        if data[offset] != VALUE_TAG_LIVE {
            offset += 1;
            continue;
        }

        let mut reader = &data[offset..];
        match codec.decode_value::<K, V, _>(&mut reader, offset as u64) {
            Ok(record) => {
                stage(codec, &mut writer, &record)?;
                report.records_recovered += 1;
                offset += record.size as usize;
            }
            Err(StoreError::Io(e)) => return Err(e.into()),
            Err(e) => {
                tracing::debug!("no record at {offset}: {e}");
                report.records_skipped += 1;
                offset += 1;
            }
        }
    }

    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);
    std::fs::rename(&temp, staging_path(path))?;

    if report.records_skipped > 0 {
        tracing::warn!(
            "Skipped {} undecodable records while repairing '{}'",
            report.records_skipped,
            path.display()
        );
    }
    Ok(report)
}

fn stage<K: Key, V: Value, W: Write>(
    codec: RecordCodec,
    writer: &mut W,
    record: &ValueNode<K, V>,
) -> Result<()> {
    codec.serialize_into(writer, &(&record.key, &record.value))
}

/// The pairs of a staging file, in the order they were found.
pub struct StagedItems<K, V> {
    reader: BufReader<File>,
    codec: RecordCodec,
    failed: bool,
    pairs: PhantomData<fn() -> (K, V)>,
}

impl<K, V> StagedItems<K, V> {
    /// Open the staging file at `path`.
    pub fn open(path: &Path, codec: RecordCodec) -> Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
            codec,
            failed: false,
            pairs: PhantomData,
        })
    }
}

impl<K: DeserializeOwned, V: DeserializeOwned> Iterator for StagedItems<K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.reader.fill_buf() {
            Ok([]) => return None,
            Ok(_) => {}
            Err(e) => {
                self.failed = true;
                return Some(Err(e.into()));
            }
        }

        let item = self.codec.deserialize_from(&mut self.reader);
        self.failed = item.is_err();
        Some(item)
    }
}
