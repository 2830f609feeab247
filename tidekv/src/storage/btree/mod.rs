//! Copy-on-write B-tree engine.
//!
//! # Structure
//!
//! - [`node`]: on-disk layout of index nodes and value records
//! - [`rebalance`]: which fixup a removal needs at each level
//! - `mutation`: the copy-on-write `set` and `remove`
//! - `tree`: the [`Engine`] handle, reads, open and close
//!
//! # Usage
//!
//! ```no_run
//! use std::path::Path;
//!
//! use tidekv::{Engine, EngineConfig};
//! use tokio::runtime::Handle;
//!
//! # async fn demo() -> tidekv::Result<()> {
//! let engine: Engine<u64, String> =
//!     Engine::open(Path::new("store.db"), EngineConfig::default(), Handle::current()).await?;
//! engine.set(1, "one".to_string())?;
//! assert_eq!(engine.get(&1).await?, Some("one".to_string()));
//! engine.close().await?;
//! # Ok(())
//! # }
//! ```

mod mutation;
pub mod node;
pub mod rebalance;
mod tree;

pub(crate) use tree::Shared;
pub use tree::{Engine, EngineStats, Key, Value};
