//! `shardsort` sorts files of fixed-width binary records by a fixed-width
//! key prefix, either on a single machine or across a fixed set of peers.
//!
//! Records are 100-byte blocks whose first 10 bytes form the sort key,
//! compared as unsigned big-endian bytes. Two engines share that record
//! model:
//!
//! * **Local sort:** inputs up to a byte threshold are sorted in memory;
//!   larger inputs are split into sorted on-disk runs and merged back with
//!   a bounded-memory k-way merge.
//! * **Distributed partitioned sort:** every peer routes each of its
//!   records to the peer owning that key's prefix range, the peers exchange
//!   buckets over TCP, and each peer sorts and writes the contiguous key
//!   range it ends up owning. Peer outputs concatenated in id order form
//!   one globally sorted sequence.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use shardsort::LocalSorterBuilder;
//!
//! fn main() {
//!     let sorter = LocalSorterBuilder::new()
//!         .with_tmp_dir(Path::new("./"))
//!         .with_threads(4)
//!         .build()
//!         .unwrap();
//!
//!     sorter
//!         .sort_file(Path::new("input.bin"), Path::new("output.bin"))
//!         .unwrap();
//! }
//! ```

pub mod dist;
pub mod exchange;
pub mod merger;
pub mod partition;
pub mod record;
pub mod roster;
pub mod run;
pub mod sort;

pub use dist::{sort_shard, DistError};
pub use exchange::ExchangeError;
pub use partition::partition_of;
pub use record::{Record, KEY_BYTES, RECORD_BYTES};
pub use roster::{Peer, Roster, RosterError};
pub use sort::{LocalSorter, LocalSorterBuilder, SortError, EXTERNAL_THRESHOLD};
