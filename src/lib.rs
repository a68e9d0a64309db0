//! `ext-mem` is a toolkit for external-memory computation: algorithms whose
//! working sets exceed physical memory and stream through disk-backed
//! buffers instead.
//!
//! # Overview
//!
//! `ext-mem` provides the following building blocks:
//!
//! * **Record streams:**
//!   typed, sequential, seekable files of fixed-size records with a
//!   prefetching in-core block buffer ([`Stream`]).
//! * **Cache manager:**
//!   a set-associative LRU map from 64-bit keys to user values with
//!   caller-defined writeback on displacement ([`CacheManager`]).
//! * **Job system:**
//!   a bounded LIFO worker pool with parent/child completion chaining
//!   ([`JobPool`]).
//! * **Parallel sort:**
//!   a quicksort whose recursion is decomposed into jobs, with progress
//!   accounting ([`parallel_sort`]).
//! * **Memory budget:**
//!   every in-core block and slot array is charged against a process-wide
//!   byte budget ([`MemoryManager`]).
//!
//! # Example
//!
//! ```no_run
//! use env_logger;
//! use log;
//!
//! use ext_mem::{parallel_sort, AccessMode, JobPool, Stream};
//!
//! fn main() {
//!     env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();
//!
//!     let mut input: Stream<i64> = Stream::open("records.dat", AccessMode::Read).unwrap();
//!     let mut records = Vec::new();
//!     input.scan(|record| records.push(*record)).unwrap();
//!
//!     let pool = JobPool::new(None);
//!     parallel_sort(&mut records, &pool);
//!
//!     let mut output: Stream<i64> = Stream::open("sorted.dat", AccessMode::Write).unwrap();
//!     for record in records {
//!         output.write_item(record).unwrap();
//!     }
//! }
//! ```

pub mod block;
pub mod cache;
pub mod device;
pub mod error;
pub mod job;
pub mod memory;
pub mod progress;
pub mod sort;
pub mod stream;
pub mod tempname;

pub use block::Block;
pub use cache::{CacheManager, Writeback};
pub use device::DeviceDescriptor;
pub use error::{Error, ErrorKind, Result};
pub use job::{JobContext, JobHandle, JobItem, JobPool};
pub use memory::{MemoryCharge, MemoryManager};
pub use progress::{ProgressIndicator, ProgressState, TimePredictor};
pub use sort::{parallel_sort, parallel_sort_by, Sorter};
pub use stream::{AccessMode, Stream, StreamOptions};
