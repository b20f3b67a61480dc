//! A thread-safe string-keyed map that spreads its keys over independently locked shards.
//!
//! # Overview
//! `shardmap` routes every key to one of a fixed number of shards with a 32-bit FNV-1a
//! hash. Each shard is guarded by its own reader-writer lock, so operations on keys of
//! different shards never contend.
//!
//! # Features
//! - Deterministic routing: a key always maps to the same shard for a given shard count
//! - Scoped access to a whole shard for atomic multi-key updates
//! - Whole-map scans that lock one shard at a time
//! - No poisoning, the lock is released normally on panic
//! - `TaskGroup` to fan work out over threads and collect their panics
//!
//! # Examples
//! ```
//! use shardmap::ShardedMap;
//!
//! let map = ShardedMap::<u32>::new(4);
//!
//! // Basic operations
//! map.put("alice", 1)?;
//! map.put("bob", 2)?;
//! assert_eq!(map.get("alice")?, Some(1));
//! assert_eq!(map.get("carol")?, None);
//!
//! // Scoped access to the shard that owns a key
//! map.write_shard_of("alice", |entries| {
//!     if let Some(v) = entries.get_mut("alice") {
//!         *v += 10;
//!     }
//! })?;
//! assert_eq!(map.get("alice")?, Some(11));
//!
//! // Remove a value
//! assert_eq!(map.delete("alice")?, Some(11));
//! assert_eq!(map.get("alice")?, None);
//!
//! // Empty keys are rejected
//! assert!(map.put("", 3).is_err());
//! # Ok::<(), shardmap::Error>(())
//! ```
mod error;
mod fnv;
mod futex;
mod shard;
#[doc = include_str!("../README.md")]
mod sharded_map;
mod task_group;
mod waiter;

pub use error::*;
pub use fnv::*;
use futex::*;
pub use shard::*;
pub use sharded_map::*;
pub use task_group::*;
use waiter::*;
