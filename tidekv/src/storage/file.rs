//! Pooled asynchronous file I/O.
//!
//! The engine never touches the disk from its own control flow for reads on
//! the query path or for queued writes. Those go through `AsyncFile`, which
//! keeps a small pool of independent handles to the same file and runs each
//! operation on the runtime's blocking pool.
//!
//! # Invariants
//!
//! - At most `io_handles` operations run at once; the semaphore hands out
//!   exactly one permit per pooled handle.
//! - A handle is only ever used by one operation at a time.
//! - `write` never extends the file past `size()`; callers reserve space with
//!   [`AsyncFile::grow`] first.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::storage::error::{Result, StoreError};

/// One pooled file handle and where its cursor currently sits.
#[derive(Debug)]
struct PooledFile {
    file: File,
    /// `None` after a failed operation left the position unknown.
    cursor: Option<u64>,
}

impl PooledFile {
    fn seek_to(&mut self, offset: u64) -> std::io::Result<()> {
        if self.cursor != Some(offset) {
            self.cursor = None;
            self.file.seek(SeekFrom::Start(offset))?;
            self.cursor = Some(offset);
        }
        Ok(())
    }
}

/// Reader handed to [`AsyncFile::execute`] callbacks.
///
/// Tracks how far the callback read so the handle's cursor stays known.
pub struct HandleReader<'a> {
    handle: &'a mut PooledFile,
    position: u64,
}

impl Read for HandleReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.handle.file.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

/// A file shared by several handles, driven from async code.
#[derive(Debug)]
pub struct AsyncFile {
    path: PathBuf,
    runtime: Handle,
    pool: Arc<Mutex<Vec<PooledFile>>>,
    permits: Arc<Semaphore>,
    /// Logical end of file; space below it is either written or reserved.
    size: AtomicU64,
}

impl AsyncFile {
    /// Open `handles` independent handles to an existing file.
    ///
    /// Blocking work is scheduled on `runtime`.
    pub fn open(path: &Path, handles: usize, runtime: Handle) -> Result<Self> {
        let handles = handles.max(1);
        let mut pool = Vec::with_capacity(handles);
        for _ in 0..handles {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            pool.push(PooledFile { file, cursor: None });
        }
        let size = std::fs::metadata(path)?.len();

        Ok(Self {
            path: path.to_path_buf(),
            runtime,
            pool: Arc::new(Mutex::new(pool)),
            permits: Arc::new(Semaphore::new(handles)),
            size: AtomicU64::new(size),
        })
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current logical size.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Reserve `by` bytes at the end of the file and return where they start.
    pub fn grow(&self, by: u64) -> u64 {
        self.size.fetch_add(by, Ordering::AcqRel)
    }

    /// Read `len` bytes at `offset`.
    pub async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.with_handle(move |handle| {
            handle.seek_to(offset)?;
            let mut buf = vec![0u8; len];
            handle.cursor = None;
            handle.file.read_exact(&mut buf)?;
            handle.cursor = Some(offset + len as u64);
            Ok(buf)
        })
        .await
    }

    /// Write `data` at `offset`, which must lie inside the reserved size.
    pub async fn write(&self, offset: u64, data: Vec<u8>) -> Result<()> {
        let end = offset + data.len() as u64;
        let size = self.size();
        if end > size {
            return Err(StoreError::Invariant(format!(
                "write of [{offset}, {end}) past end of file at {size}"
            )));
        }

        self.with_handle(move |handle| {
            handle.seek_to(offset)?;
            handle.cursor = None;
            handle.file.write_all(&data)?;
            handle.cursor = Some(end);
            Ok(())
        })
        .await
    }

    /// Run `decode` against a handle positioned at `offset`.
    pub async fn execute<T, F>(&self, offset: u64, decode: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut HandleReader<'_>) -> Result<T> + Send + 'static,
    {
        self.with_handle(move |handle| {
            handle.seek_to(offset)?;
            let mut reader = HandleReader {
                handle: &mut *handle,
                position: offset,
            };
            let result = decode(&mut reader);
            let position = reader.position;
            handle.cursor = result.is_ok().then_some(position);
            result
        })
        .await
    }

    /// Release every pooled handle.
    ///
    /// Operations already running finish; later ones fail with `ClosedEngine`.
    pub fn close(&self) {
        self.permits.close();
        #[allow(clippy::expect_used)] // Poisoning means a blocking task panicked
        self.pool.lock().expect("lock poisoned").clear();
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    async fn with_handle<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PooledFile) -> Result<T> + Send + 'static,
    {
        #[allow(clippy::disallowed_methods)] // Arc::clone moves the permit pool into the task
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| StoreError::ClosedEngine)?;
        #[allow(clippy::disallowed_methods)] // Arc::clone moves the handle pool into the task
        let pool = Arc::clone(&self.pool);

        self.runtime
            .spawn_blocking(move || {
                #[allow(clippy::expect_used)] // Poisoning means a blocking task panicked
                let checked_out = pool.lock().expect("lock poisoned").pop();
                let Some(mut handle) = checked_out else {
                    return Err(StoreError::ClosedEngine);
                };

                let result = op(&mut handle);

                #[allow(clippy::expect_used)] // Poisoning means a blocking task panicked
                let mut pool = pool.lock().expect("lock poisoned");
                if !permit.semaphore().is_closed() {
                    pool.push(handle);
                }
                drop(pool);
                drop(permit);
                result
            })
            .await?
    }
}
