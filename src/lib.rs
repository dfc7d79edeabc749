//! `ext-merge` is a rust external merge sort for files of fixed-width binary records.
//!
//! External sorting is a class of sorting algorithms that can handle massive amounts of data.
//! It is required when the data being sorted do not fit into the main memory (RAM) of a
//! computer and must therefore reside in slower external storage, usually a hard disk drive.
//! Sorting is achieved in two phases. During the first phase the source file is ingested
//! in budget-sized chunks, each sorted in memory and written out as a "run" file; during the
//! second phase batches of runs are merged with a k-way heap merge, epoch after epoch, until a
//! single sorted file remains. For more information see
//! [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `ext-merge` supports the following features:
//!
//! * **Record agnostic:**
//!   any fixed-width type sorts by implementing the [`Record`] byte-image contract;
//!   the little-endian integer primitives are supported out of the box.
//! * **Order agnostic:**
//!   sorting accepts any comparator over the record type, so one type can be sorted
//!   under different orders.
//! * **Memory limit support:**
//!   every phase keeps its resident data buffers within the configured budget no
//!   matter how large the input file is; the merge fan-in is chosen to fit.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use ext_merge::SorterBuilder;
//!
//! fn main() {
//!     let sorter = SorterBuilder::new()
//!         .with_budget(64 * 1024 * 1024)
//!         .build()
//!         .unwrap();
//!
//!     let sorted = sorter.sort::<u64>(Path::new("measurements.bin")).unwrap();
//!     println!("sorted file written to {}", sorted.display());
//! }
//! ```

pub mod merger;
pub mod record;
pub mod run;
pub mod sort;

pub use merger::merge_runs;
pub use record::Record;
pub use run::{run_file_name, RunReader};
pub use sort::{SortError, Sorter, SorterBuilder};
