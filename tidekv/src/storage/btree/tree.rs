//! The engine: an asynchronous, copy-on-write B-tree stored in one file.
//!
//! Mutations (`set`, `remove`) run to completion under the engine lock without
//! suspending. They write value records synchronously and leave node and
//! pointer writes to the background pipeline. Reads (`get`, `items`) take a
//! passive task and a snapshot of the root, then suspend on file reads; the
//! version tracker keeps their view consistent while writers move on.
//!
//! # Opening
//!
//! - No file: create one with an empty root leaf right after the header.
//! - Cleanly closed file: load the root and mark the file open.
//! - Anything else: scan the file for live value records into a staging
//!   file, then rebuild a fresh tree from it. The staging file is deleted
//!   last, so a crash mid-rebuild resumes from it on the next open.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;

use crate::config::EngineConfig;
use crate::storage::allocator::FreeSpaceAllocator;
use crate::storage::btree::mutation::{Mutation, time_travel};
use crate::storage::btree::node::{IndexNode, RecordCodec, ValueNode};
use crate::storage::error::{Result, StoreError};
use crate::storage::file::AsyncFile;
use crate::storage::pipeline::{self, WriteQueue};
use crate::storage::recovery::{self, StagedItems};
use crate::storage::superblock::{self, HEADER_SIZE, Status, Superblock, SuperblockError};
use crate::storage::version::{self, TaskId, VersionTracker};

/// Keys the engine can store.
pub trait Key: Ord + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Key for T where T: Ord + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Values the engine can store.
///
/// Equality lets `set` skip rewriting an unchanged value.
pub trait Value: PartialEq + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Value for T where T: PartialEq + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// State shared between engine handles and the drain loop.
pub struct Shared<K> {
    state: Mutex<Inner<K>>,
    pub file: AsyncFile,
    pub runtime: Handle,
    codec: RecordCodec,
    min_degree: usize,
    path: PathBuf,
}

impl<K> Shared<K> {
    pub fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        #[allow(clippy::expect_used)] // Poisoning means an operation panicked mid-mutation
        self.state.lock().expect("lock poisoned")
    }
}

/// Everything guarded by the engine lock.
pub struct Inner<K> {
    pub root: Arc<IndexNode<K>>,
    pub allocator: FreeSpaceAllocator,
    pub tracker: VersionTracker<K>,
    pub writes: WriteQueue,
    /// Handle for synchronous value writes, header updates and mutation reads.
    pub file: File,
    closed: bool,
    finalized: bool,
}

impl<K> Inner<K> {
    /// Report one finished command and free whatever its retirement releases.
    pub fn retire_command(&mut self, task: TaskId) {
        for (address, size) in self.tracker.command_done(task) {
            self.allocator.release(address, size);
        }
    }

    /// Retire tasks that finished without queueing any command.
    pub fn retire_idle(&mut self) {
        for (address, size) in self.tracker.prune() {
            self.allocator.release(address, size);
        }
    }

    /// Find `size` bytes, reusing free space unless it touches the write in flight.
    pub fn malloc(&mut self, file: &AsyncFile, size: u64) -> u64 {
        if let Some(address) = self.allocator.allocate(size) {
            if !self.writes.overlaps_in_flight(address, size) {
                return address;
            }
            self.allocator.release(address, size);
        }
        file.grow(size)
    }
}

/// Counters describing an engine's internal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub pending_tasks: usize,
    pub tracked_addresses: usize,
    pub queued_writes: usize,
    pub writes_applied: u64,
    pub writes_dropped: u64,
    pub free_bytes: u64,
    pub file_size: u64,
    pub root_address: u64,
}

/// A persistent ordered map from `K` to `V`.
///
/// Handles are cheap to clone and share one engine.
pub struct Engine<K, V> {
    shared: Arc<Shared<K>>,
    value: PhantomData<fn() -> V>,
}

impl<K, V> Clone for Engine<K, V> {
    fn clone(&self) -> Self {
        Self {
            #[allow(clippy::disallowed_methods)] // Arc::clone shares the engine
            shared: Arc::clone(&self.shared),
            value: PhantomData,
        }
    }
}

impl<K: Key, V: Value> Engine<K, V> {
    /// Open or create the store at `path`, repairing it if needed.
    ///
    /// Background writes and file I/O run on `runtime`.
    pub async fn open(path: &Path, config: EngineConfig, runtime: Handle) -> Result<Self> {
        config.validate()?;
        let path = path.to_path_buf();
        let codec = RecordCodec::new(config.max_record_size);
        let staging = recovery::staging_path(&path);

        if !staging.exists() {
            if !path.exists() {
                return Self::create(&path, &config, runtime);
            }
            if let Some(engine) = Self::load(&path, &config, runtime.clone())? {
                return Ok(engine);
            }

            let repair_path = path.clone();
            let report = runtime
                .spawn_blocking(move || recovery::repair::<K, V>(&repair_path, codec))
                .await??;
            tracing::info!(
                "Repaired '{}': {} records recovered, {} skipped in {} bytes",
                path.display(),
                report.records_recovered,
                report.records_skipped,
                report.bytes_scanned
            );
        }

        Self::rebuild(&path, &staging, &config, runtime).await
    }

    /// Look up `key`.
    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        let (task, root) = self.begin_read()?;
        let result = self.lookup(task, root, key).await;
        self.shared.lock().retire_command(task);
        result
    }

    /// Insert or replace `key`.
    ///
    /// Returns once the change is visible to every later operation; the
    /// index nodes reach the file in the background.
    ///
    /// The value record is written and the touched nodes are read with
    /// blocking file I/O under the engine lock, so a call blocks the calling
    /// thread (and any other operation on this engine) for that long. Callers
    /// on a multi-threaded runtime that issue large writes can wrap the call
    /// in `tokio::task::block_in_place`.
    pub fn set(&self, key: K, value: V) -> Result<()> {
        self.mutate(|mutation| mutation.set(key, value))
    }

    /// Remove `key`. Removing a missing key is not an error.
    ///
    /// Blocks like [`set`](Self::set).
    pub fn remove(&self, key: &K) -> Result<()> {
        self.mutate(|mutation| mutation.remove::<V>(key))
    }

    /// Up to `max_len` entries (0 for no limit) with keys in `[from, to]`,
    /// ascending, or descending when `reverse` is set.
    pub async fn items(
        &self,
        from: Option<&K>,
        to: Option<&K>,
        max_len: usize,
        reverse: bool,
    ) -> Result<Vec<(K, V)>> {
        self.ensure_open()?;
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Ok(Vec::new());
            }
            if from == to {
                let found = self.get(from).await?;
                return Ok(found.map(|value| (from.clone(), value)).into_iter().collect());
            }
        }

        let (task, root) = self.begin_read()?;
        let result = self.scan(task, root, from, to, max_len, reverse).await;
        self.shared.lock().retire_command(task);
        result
    }

    /// Reject new operations, wait for pending ones, and mark the file clean.
    ///
    /// Calling it again is a no-op. Returns the first background write
    /// failure, if any.
    pub async fn close(&self) -> Result<()> {
        self.shared.lock().closed = true;
        self.wait_until_idle().await;

        let mut inner = self.shared.lock();
        if inner.finalized {
            return Ok(());
        }
        inner.finalized = true;

        let root = inner.root.address;
        superblock::write_root(&mut inner.file, root)?;
        superblock::write_status(&mut inner.file, Status::Clean)?;
        inner.file.sync_all()?;
        self.shared.file.close();

        tracing::info!(
            "Closed '{}' with root at {} ({} bytes)",
            self.shared.path.display(),
            root,
            self.shared.file.size()
        );
        inner.writes.take_failure().map_or(Ok(()), Err)
    }

    /// Suspend until every queued task has retired.
    pub async fn wait_until_idle(&self) {
        let signal = self.shared.lock().tracker.idle_signal();
        version::wait_until_idle(&signal, || self.shared.lock().tracker.is_idle()).await;
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Path of the store file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Snapshot of internal counters.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let inner = self.shared.lock();
        EngineStats {
            pending_tasks: inner.tracker.pending_tasks(),
            tracked_addresses: inner.tracker.tracked_addresses(),
            queued_writes: inner.writes.len(),
            writes_applied: inner.writes.written(),
            writes_dropped: inner.writes.dropped(),
            free_bytes: inner.allocator.free_bytes(),
            file_size: self.shared.file.size(),
            root_address: inner.root.address,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.lock().closed {
            Err(StoreError::ClosedEngine)
        } else {
            Ok(())
        }
    }

    fn mutate<F>(&self, op: F) -> Result<()>
    where
        F: FnOnce(&mut Mutation<'_, K>) -> Result<()>,
    {
        let start_drain = {
            let mut inner = self.shared.lock();
            if inner.closed {
                return Err(StoreError::ClosedEngine);
            }

            let shared = &*self.shared;
            let mut mutation = Mutation::begin(&mut inner, &shared.file, shared.codec, shared.min_degree);
            let outcome = op(&mut mutation).and_then(|()| mutation.finish());
            if outcome.is_err() {
                mutation.abandon();
            }
            outcome?
        };

        if start_drain {
            pipeline::spawn_drain(&self.shared);
        }
        Ok(())
    }

    fn begin_read(&self) -> Result<(TaskId, Arc<IndexNode<K>>)> {
        let mut inner = self.shared.lock();
        if inner.closed {
            return Err(StoreError::ClosedEngine);
        }
        let task = inner.tracker.create_task(false);
        inner.tracker.add_command(task);
        #[allow(clippy::disallowed_methods)] // Arc::clone snapshots the root
        let root = Arc::clone(&inner.root);
        Ok((task, root))
    }

    async fn lookup(&self, task: TaskId, root: Arc<IndexNode<K>>, key: &K) -> Result<Option<V>> {
        let mut node = root;
        loop {
            match node.search(key) {
                Ok(index) => {
                    let pointer = self
                        .resolve_slot(task, node.value_slot(index), node.address)
                        .unwrap_or(node.values[index]);
                    let record = self.load_value(pointer).await?;
                    if record.key != *key {
                        return Err(StoreError::Invariant(format!(
                            "value record at {pointer} holds another key"
                        )));
                    }
                    return Ok(Some(record.value));
                }
                Err(_) if node.is_leaf => return Ok(None),
                Err(index) => {
                    let pointer = self
                        .resolve_slot(task, node.child_slot(index), node.address)
                        .unwrap_or(node.children[index]);
                    node = self.load_node(task, pointer).await?;
                }
            }
        }
    }

    async fn scan(
        &self,
        task: TaskId,
        root: Arc<IndexNode<K>>,
        from: Option<&K>,
        to: Option<&K>,
        max_len: usize,
        reverse: bool,
    ) -> Result<Vec<(K, V)>> {
        let mut found = Vec::new();
        let mut pending = Vec::new();
        push_visits(&root, from, to, reverse, &mut pending);

        while let Some(visit) = pending.pop() {
            if max_len > 0 && found.len() >= max_len {
                break;
            }
            match visit {
                Visit::Item(key, pointer) => {
                    let record = self.load_value(pointer).await?;
                    if record.key != key {
                        return Err(StoreError::Invariant(format!(
                            "value record at {pointer} holds another key"
                        )));
                    }
                    found.push((record.key, record.value));
                }
                Visit::Child(pointer) => {
                    let node = self.load_node(task, pointer).await?;
                    let mut node = Arc::unwrap_or_clone(node);
                    time_travel(&self.shared.lock().tracker, task, &mut node);
                    push_visits(&node, from, to, reverse, &mut pending);
                }
            }
        }
        Ok(found)
    }

    fn resolve_slot(&self, task: TaskId, slot: u64, depend: u64) -> Option<u64> {
        self.shared.lock().tracker.resolve_pointer(task, slot, depend)
    }

    async fn load_node(&self, task: TaskId, address: u64) -> Result<Arc<IndexNode<K>>> {
        let tracked = self.shared.lock().tracker.resolve_node(task, address, 0);
        if let Some(node) = tracked {
            return Ok(node);
        }
        let codec = self.shared.codec;
        let node = self
            .shared
            .file
            .execute(address, move |reader| codec.decode_node(reader, address))
            .await?;
        Ok(Arc::new(node))
    }

    async fn load_value(&self, address: u64) -> Result<ValueNode<K, V>> {
        let codec = self.shared.codec;
        self.shared
            .file
            .execute(address, move |reader| codec.decode_value(reader, address))
            .await
    }

    fn create(path: &Path, config: &EngineConfig, runtime: Handle) -> Result<Self> {
        let codec = RecordCodec::new(config.max_record_size);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        Superblock::new().write_to(&mut file)?;
        let mut root = IndexNode::leaf();
        let bytes = codec.encode_node(&mut root)?;
        root.address = HEADER_SIZE;
        file.write_all(&bytes)?;
        file.sync_all()?;

        tracing::info!("Created store at '{}'", path.display());
        Self::assemble(path, file, root, config, runtime)
    }

    /// Open a cleanly closed file, or `None` when it needs repair.
    fn load(path: &Path, config: &EngineConfig, runtime: Handle) -> Result<Option<Self>> {
        let codec = RecordCodec::new(config.max_record_size);
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let header = match Superblock::read_from(&mut file) {
            Ok(header) => header,
            Err(SuperblockError::Io(e)) => return Err(e.into()),
            Err(e) => {
                tracing::warn!("Unreadable header in '{}': {e}", path.display());
                return Ok(None);
            }
        };
        if header.status == Status::Open {
            tracing::warn!("'{}' was not closed cleanly", path.display());
            return Ok(None);
        }

        let decoded = {
            let mut reader = BufReader::new(&file);
            reader.seek(SeekFrom::Start(header.root))?;
            codec.decode_node(&mut reader, header.root)
        };
        let root = match decoded {
            Ok(root) => root,
            Err(StoreError::CorruptedRecord { address, reason }) => {
                tracing::warn!("Corrupted root at {address} in '{}': {reason}", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        superblock::write_status(&mut file, Status::Open)?;
        file.sync_data()?;

        tracing::info!("Opened '{}' with root at {}", path.display(), root.address);
        Self::assemble(path, file, root, config, runtime).map(Some)
    }

    /// Build a fresh file from the staged records of a repair.
    async fn rebuild(path: &Path, staging: &Path, config: &EngineConfig, runtime: Handle) -> Result<Self> {
        let codec = RecordCodec::new(config.max_record_size);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let engine = Self::create(path, config, runtime)?;

        let mut replayed = 0u64;
        for item in StagedItems::<K, V>::open(staging, codec)? {
            let (key, value) = item?;
            engine.set(key, value)?;
            replayed += 1;
        }
        engine.wait_until_idle().await;
        std::fs::remove_file(staging)?;

        tracing::info!("Rebuilt '{}' from {} staged records", path.display(), replayed);
        Ok(engine)
    }

    fn assemble(
        path: &Path,
        file: File,
        root: IndexNode<K>,
        config: &EngineConfig,
        runtime: Handle,
    ) -> Result<Self> {
        let async_file = AsyncFile::open(path, config.io_handles, runtime.clone())?;
        let inner = Inner {
            root: Arc::new(root),
            allocator: FreeSpaceAllocator::new(config.allocator_capacity),
            tracker: VersionTracker::new(),
            writes: WriteQueue::default(),
            file,
            closed: false,
            finalized: false,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(inner),
                file: async_file,
                runtime,
                codec: RecordCodec::new(config.max_record_size),
                min_degree: config.min_degree,
                path: path.to_path_buf(),
            }),
            value: PhantomData,
        })
    }
}

/// One step of a range scan.
enum Visit<K> {
    /// A key and the pointer to its value record.
    Item(K, u64),
    Child(u64),
}

/// Queue the parts of `node` that can hold keys in `[from, to]`.
///
/// `pending` is a stack, so visits are pushed in reverse of the order they
/// should run.
fn push_visits<K: Ord + Clone>(
    node: &IndexNode<K>,
    from: Option<&K>,
    to: Option<&K>,
    reverse: bool,
    pending: &mut Vec<Visit<K>>,
) {
    let lo = from.map_or(0, |from| node.keys.partition_point(|k| k < from));
    let hi = to.map_or(node.len(), |to| node.keys.partition_point(|k| k <= to));

    let mut visits = Vec::with_capacity(2 * hi.saturating_sub(lo) + 1);
    let first_child_needed = match (from, node.keys.get(lo)) {
        (Some(from), Some(key)) => key > from,
        _ => true,
    };
    if !node.is_leaf && first_child_needed {
        visits.push(Visit::Child(node.children[lo]));
    }
    for i in lo..hi {
        visits.push(Visit::Item(node.keys[i].clone(), node.values[i]));
        if !node.is_leaf {
            visits.push(Visit::Child(node.children[i + 1]));
        }
    }

    if reverse {
        pending.extend(visits);
    } else {
        pending.extend(visits.into_iter().rev());
    }
}
