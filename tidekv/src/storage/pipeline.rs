//! Write pipeline: the queue of staged byte patches and the loop draining it.
//!
//! Mutations never write index nodes or pointer slots themselves. They stage
//! `(address, task, bytes, depend)` commands here, and one background drain
//! loop applies them through [`AsyncFile`](crate::storage::file::AsyncFile)
//! in address order, oldest task first for equal addresses.
//!
//! Before each write the loop asks the version tracker whether the command
//! was superseded: a newer task recorded the address (or the node holding it,
//! `depend`), or the address was logically deleted. Superseded writes are
//! dropped, which is the normal outcome under contention and not an error.
//!
//! # Invariants
//!
//! - At most one drain loop runs per engine (`draining`).
//! - While a write is in flight its range, padded by one byte on each side,
//!   is published so allocation never hands out overlapping space.
//! - Every popped command is reported to the tracker exactly once, whether
//!   it was written, dropped or failed.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::storage::btree::Shared;
use crate::storage::error::StoreError;
use crate::storage::version::TaskId;

/// One staged write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub data: Vec<u8>,
    /// Address of the node holding `address`, or 0 for none.
    pub depend: u64,
}

/// Sorted queue of pending writes plus the drain loop's bookkeeping.
#[derive(Debug, Default)]
pub struct WriteQueue {
    /// Keyed by (address, task, arrival) so equal addresses apply oldest first.
    commands: BTreeMap<(u64, TaskId, u64), Command>,
    arrivals: u64,
    draining: bool,
    /// Inclusive byte range currently being written.
    in_flight: Option<(u64, u64)>,
    /// First background write failure, surfaced by `close()`.
    failure: Option<StoreError>,
    written: u64,
    dropped: u64,
}

impl WriteQueue {
    /// Queue a command.
    ///
    /// Returns `true` when no drain loop is running and the caller must start
    /// one; the queue then counts as draining.
    #[must_use]
    pub fn push(&mut self, address: u64, task: TaskId, data: Vec<u8>, depend: u64) -> bool {
        self.commands
            .insert((address, task, self.arrivals), Command { data, depend });
        self.arrivals += 1;

        if self.draining {
            false
        } else {
            self.draining = true;
            true
        }
    }

    /// Take the lowest (address, task) command.
    ///
    /// Returns `None` and clears the draining flag once the queue is empty,
    /// so the loop that got `None` must exit.
    pub fn pop(&mut self) -> Option<(u64, TaskId, Command)> {
        let Some(((address, task, _), command)) = self.commands.pop_first() else {
            self.draining = false;
            return None;
        };
        Some((address, task, command))
    }

    /// Publish the range of a write about to be issued.
    pub fn begin_write(&mut self, address: u64, len: u64) {
        self.in_flight = Some((address.saturating_sub(1), address + len + 1));
    }

    /// Clear the in-flight range.
    pub fn end_write(&mut self, written: bool) {
        self.in_flight = None;
        if written {
            self.written += 1;
        }
    }

    /// Count a command dropped as superseded.
    pub fn note_dropped(&mut self) {
        self.dropped += 1;
    }

    /// Whether `[address, address + size)` touches the in-flight range.
    #[must_use]
    pub fn overlaps_in_flight(&self, address: u64, size: u64) -> bool {
        self.in_flight
            .is_some_and(|(begin, end)| address <= end && begin <= address + size)
    }

    /// Keep the first background failure.
    pub fn fail(&mut self, error: StoreError) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    /// Take the stored background failure, if any.
    pub fn take_failure(&mut self) -> Option<StoreError> {
        self.failure.take()
    }

    /// Number of queued commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Whether a drain loop owns the queue.
    #[must_use]
    pub const fn is_draining(&self) -> bool {
        self.draining
    }

    /// Commands written so far.
    #[must_use]
    pub const fn written(&self) -> u64 {
        self.written
    }

    /// Commands dropped as superseded so far.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Spawn the drain loop on the engine's runtime.
pub(crate) fn spawn_drain<K: crate::storage::btree::Key>(shared: &Arc<Shared<K>>) {
    #[allow(clippy::disallowed_methods)] // Arc::clone hands the engine state to the loop
    let shared_for_loop = Arc::clone(shared);
    drop(shared.runtime.spawn(drain(shared_for_loop)));
}

/// Apply queued commands until the queue is empty.
async fn drain<K: crate::storage::btree::Key>(shared: Arc<Shared<K>>) {
    tracing::debug!("write pipeline started");

    loop {
        let next = {
            let mut inner = shared.lock();
            loop {
                let Some((address, task, command)) = inner.writes.pop() else {
                    break None;
                };

                let stale = (command.depend != 0 && inner.tracker.is_stale(task, command.depend))
                    || inner.tracker.is_stale(task, address);
                if stale {
                    tracing::debug!("dropped superseded write at {} from task {}", address, task);
                    inner.writes.note_dropped();
                    inner.retire_command(task);
                    continue;
                }

                inner.writes.begin_write(address, command.data.len() as u64);
                break Some((address, task, command.data));
            }
        };

        let Some((address, task, data)) = next else {
            break;
        };

        let result = shared.file.write(address, data).await;

        let mut inner = shared.lock();
        inner.writes.end_write(result.is_ok());
        if let Err(e) = result {
            tracing::error!("Background write at {} from task {} failed: {e}", address, task);
            inner.writes.fail(e);
        }
        inner.retire_command(task);
    }

    tracing::debug!("write pipeline idle");
}
