//! External sorter: configuration, run production and merge scheduling.

use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};

use log;

use crate::merger::merge_runs;
use crate::record::Record;
use crate::run::{close_file, create_run_file, open_sequential, read_fill, run_file_name};

/// Default I/O unit the memory budget is partitioned into during merges.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default number of pages a merge reserves for its write buffer.
pub const DEFAULT_WRITE_PAGES: usize = 256;

/// Sorting error.
///
/// Every error is fatal to the sort in progress. Run files already written
/// are left in place; the caller may remove anything matching
/// `<source>_run_<epoch>_<index>`.
#[derive(Debug)]
pub enum SortError {
    /// A file could not be opened, created or stat'ed.
    IoOpen(PathBuf, io::Error),
    /// A read failed.
    IoRead(PathBuf, io::Error),
    /// A read returned no data although records remain.
    IoShortRead(PathBuf),
    /// A write failed.
    IoWrite(PathBuf, io::Error),
    /// An fsync failed.
    IoSync(PathBuf, io::Error),
    /// A close failed.
    IoClose(PathBuf, io::Error),
    /// A consumed run could not be removed.
    IoUnlink(PathBuf, io::Error),
    /// File length is not a multiple of the record size.
    BadSize(PathBuf, u64),
    /// The memory budget cannot accommodate the phase.
    BudgetTooSmall(usize),
    /// A caller-side invariant was violated.
    Precondition(String),
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::IoOpen(_, err)
            | SortError::IoRead(_, err)
            | SortError::IoWrite(_, err)
            | SortError::IoSync(_, err)
            | SortError::IoClose(_, err)
            | SortError::IoUnlink(_, err) => Some(err),
            SortError::IoShortRead(_)
            | SortError::BadSize(_, _)
            | SortError::BudgetTooSmall(_)
            | SortError::Precondition(_) => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::IoOpen(path, err) => write!(f, "open failed for {}: {}", path.display(), err),
            SortError::IoRead(path, err) => write!(f, "read failed for {}: {}", path.display(), err),
            SortError::IoShortRead(path) => {
                write!(f, "unexpected end of file while reading {}", path.display())
            }
            SortError::IoWrite(path, err) => write!(f, "write failed for {}: {}", path.display(), err),
            SortError::IoSync(path, err) => write!(f, "fsync failed for {}: {}", path.display(), err),
            SortError::IoClose(path, err) => write!(f, "close failed for {}: {}", path.display(), err),
            SortError::IoUnlink(path, err) => {
                write!(f, "unlink failed for {}: {}", path.display(), err)
            }
            SortError::BadSize(path, len) => write!(
                f,
                "{} is {} bytes long, not a whole number of records",
                path.display(),
                len
            ),
            SortError::BudgetTooSmall(budget) => write!(
                f,
                "memory budget of {} bytes is too small for this phase",
                budget
            ),
            SortError::Precondition(message) => write!(f, "precondition violated: {}", message),
        }
    }
}

/// External sorter builder. Provides methods for [`Sorter`] initialization.
#[derive(Clone)]
pub struct SorterBuilder {
    /// Memory budget in bytes for each sorting phase.
    budget: usize,
    /// I/O unit the merge budget is partitioned into.
    page_size: usize,
    /// Pages a merge reserves for its write buffer.
    write_pages: usize,
}

impl SorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        SorterBuilder::default()
    }

    /// Sets the memory budget in bytes. Each phase keeps its resident data
    /// buffers within this bound.
    pub fn with_budget(mut self, budget: usize) -> SorterBuilder {
        self.budget = budget;
        return self;
    }

    /// Sets the page size the merge budget is partitioned into. Must be a
    /// power of two.
    pub fn with_page_size(mut self, page_size: usize) -> SorterBuilder {
        self.page_size = page_size;
        return self;
    }

    /// Sets how many pages a merge reserves for its write buffer.
    pub fn with_write_pages(mut self, write_pages: usize) -> SorterBuilder {
        self.write_pages = write_pages;
        return self;
    }

    /// Builds a [`Sorter`] instance using the provided configuration.
    pub fn build(self) -> Result<Sorter, SortError> {
        if self.budget == 0 {
            return Err(SortError::BudgetTooSmall(0));
        }
        if !self.page_size.is_power_of_two() {
            return Err(SortError::Precondition(format!(
                "page size {} is not a power of two",
                self.page_size
            )));
        }
        if self.write_pages == 0 {
            return Err(SortError::Precondition(
                "write buffer needs at least one page".to_string(),
            ));
        }

        return Ok(Sorter {
            budget: self.budget,
            page_size: self.page_size,
            write_pages: self.write_pages,
        });
    }
}

impl Default for SorterBuilder {
    fn default() -> Self {
        SorterBuilder {
            budget: 64 * 1024 * 1024,
            page_size: DEFAULT_PAGE_SIZE,
            write_pages: DEFAULT_WRITE_PAGES,
        }
    }
}

/// Two-phase external sorter for files of fixed-width records.
///
/// The sorter is strictly single-threaded and synchronous: a call blocks
/// until the sort completes or fails. Phase one splits the source into
/// budget-sized sorted runs; phase two merges batches of runs, epoch by
/// epoch, until one run remains. That run is handed to the caller and is the
/// only file the sorter leaves behind on success.
pub struct Sorter {
    budget: usize,
    page_size: usize,
    write_pages: usize,
}

impl Sorter {
    /// Sorts the file at `source` under the record type's natural order and
    /// returns the path of the sorted result.
    pub fn sort<T>(&self, source: &Path) -> Result<PathBuf, SortError>
    where
        T: Record + Ord,
    {
        self.sort_by(source, T::cmp)
    }

    /// Sorts the file at `source` under `compare` and returns the path of
    /// the sorted result.
    ///
    /// The source file is never modified or deleted. Intermediate runs are
    /// created next to it and removed as they are consumed; after a fatal
    /// error some may remain. Two concurrent sorts of the same source file
    /// collide on run names and fail on the exclusive create.
    pub fn sort_by<T, F>(&self, source: &Path, compare: F) -> Result<PathBuf, SortError>
    where
        T: Record,
        F: Fn(&T, &T) -> Ordering + Copy,
    {
        let produced = self.produce_runs(source, compare)?;
        log::info!("{}: {} runs produced", source.display(), produced);

        if produced == 0 {
            // Zero-length input: the result is an equally empty run.
            let path = run_file_name(source, 1, 1);
            let file = create_run_file(&path)?;
            file.sync_all()
                .map_err(|err| SortError::IoSync(path.clone(), err))?;
            close_file(file, &path)?;
            return Ok(path);
        }

        let result = self.merge_epochs::<T, F>(source, produced, compare)?;
        log::info!("{}: sorted into {}", source.display(), result.display());
        return Ok(result);
    }

    /// Splits the file at `source` into sorted epoch-1 runs of at most
    /// `⌊budget / SIZE⌋` records each and returns how many were written.
    ///
    /// Run `i` is written to `<source>_run_1_<i>`, exclusively created,
    /// fsynced and closed. The run sizes sum to the source size. Fails with
    /// [`SortError::BudgetTooSmall`] unless a record is strictly smaller
    /// than the budget, and with [`SortError::BadSize`] if the source length
    /// is not a whole number of records.
    pub fn produce_runs<T, F>(&self, source: &Path, compare: F) -> Result<usize, SortError>
    where
        T: Record,
        F: Fn(&T, &T) -> Ordering + Copy,
    {
        if T::SIZE >= self.budget {
            return Err(SortError::BudgetTooSmall(self.budget));
        }

        let mut file = open_sequential(source)?;
        let source_len = file
            .metadata()
            .map_err(|err| SortError::IoOpen(source.to_path_buf(), err))?
            .len();
        if source_len % T::SIZE as u64 != 0 {
            return Err(SortError::BadSize(source.to_path_buf(), source_len));
        }

        // The chunk accumulates decoded records up to the budget; disk bytes
        // move through a record-aligned staging buffer of about one page.
        let chunk_records = self.budget / T::SIZE;
        let staging_records = (self.page_size / T::SIZE).max(1);
        let mut staging = vec![0u8; staging_records * T::SIZE];
        let mut records: Vec<T> = Vec::with_capacity(chunk_records);

        let mut produced = 0;
        let mut consumed = 0u64;
        loop {
            let capacity_left = (chunk_records - records.len()) * T::SIZE;
            let want = capacity_left.min(staging.len());
            let got = read_fill(&mut file, &mut staging[..want], source)?;
            if got == 0 {
                break;
            }
            if got % T::SIZE != 0 {
                return Err(SortError::BadSize(source.to_path_buf(), source_len));
            }
            consumed += got as u64;

            for image in staging[..got].chunks_exact(T::SIZE) {
                records.push(T::decode(image));
            }
            if records.len() == chunk_records {
                produced += 1;
                self.write_run(source, produced, &mut records, compare, &mut staging)?;
                log::debug!(
                    "{}: progress {}/{} bytes",
                    source.display(),
                    consumed,
                    source_len
                );
            }
        }
        if !records.is_empty() {
            produced += 1;
            self.write_run(source, produced, &mut records, compare, &mut staging)?;
        }
        if consumed != source_len {
            return Err(SortError::IoShortRead(source.to_path_buf()));
        }

        close_file(file, source)?;
        return Ok(produced);
    }

    // Sorts the accumulated chunk and writes it out as run `index` of epoch 1,
    // draining `records`. `staging` frames the output bytes on the way down.
    fn write_run<T, F>(
        &self,
        source: &Path,
        index: usize,
        records: &mut Vec<T>,
        compare: F,
        staging: &mut [u8],
    ) -> Result<(), SortError>
    where
        T: Record,
        F: Fn(&T, &T) -> Ordering + Copy,
    {
        records.sort_unstable_by(compare);

        let path = run_file_name(source, 1, index);
        let mut file = create_run_file(&path)?;
        for group in records.chunks(staging.len() / T::SIZE) {
            for (slot, record) in group.iter().enumerate() {
                record.encode(&mut staging[slot * T::SIZE..(slot + 1) * T::SIZE]);
            }
            file.write_all(&staging[..group.len() * T::SIZE])
                .map_err(|err| SortError::IoWrite(path.clone(), err))?;
        }
        file.sync_all()
            .map_err(|err| SortError::IoSync(path.clone(), err))?;
        close_file(file, &path)?;

        log::debug!("run {} written: {} records", path.display(), records.len());
        records.clear();
        Ok(())
    }

    // Repeatedly merges batches of runs into the next epoch until a single
    // run remains, unlinking batch inputs once their merge output is closed.
    fn merge_epochs<T, F>(
        &self,
        source: &Path,
        run_count: usize,
        compare: F,
    ) -> Result<PathBuf, SortError>
    where
        T: Record,
        F: Fn(&T, &T) -> Ordering + Copy,
    {
        // Two pages per run is the batch-sizing reservation; on top of it a
        // batch must stay partitionable by the merger, which needs one write
        // page plus one page per reader. That caps the fan-in at one page
        // short of the budget, and runs can only pair off with three pages.
        let min_per_run = 2 * self.page_size;
        let max_fan_in = (self.budget / self.page_size).saturating_sub(1);
        if max_fan_in == 0 || (max_fan_in < 2 && run_count > 1) {
            return Err(SortError::BudgetTooSmall(self.budget));
        }

        let mut old_epoch: Vec<PathBuf> = (1..=run_count)
            .map(|index| run_file_name(source, 1, index))
            .collect();
        let mut new_epoch: Vec<PathBuf> = Vec::new();

        let mut epoch = 1;
        let mut result_index = 1;
        let mut batch: Vec<PathBuf> = Vec::new();
        while !old_epoch.is_empty() {
            batch.clear();
            let mut reserved = 0;
            while batch.len() < max_fan_in && reserved < self.budget {
                match old_epoch.pop() {
                    Some(path) => batch.push(path),
                    None => break,
                }
                reserved += min_per_run;
            }

            let output = run_file_name(source, epoch + 1, result_index);
            result_index += 1;
            log::debug!(
                "epoch {}: merging a batch of {} runs into {}",
                epoch,
                batch.len(),
                output.display()
            );
            merge_runs::<T, F>(
                &batch,
                &output,
                compare,
                self.budget,
                self.page_size,
                self.write_pages,
            )?;
            new_epoch.push(output);

            for path in &batch {
                fs::remove_file(path).map_err(|err| SortError::IoUnlink(path.clone(), err))?;
            }

            if old_epoch.is_empty() && new_epoch.len() != 1 {
                log::debug!("epoch {} finished: {} runs remain", epoch, new_epoch.len());
                old_epoch = std::mem::take(&mut new_epoch);
                epoch += 1;
                result_index = 1;
            }
        }

        match new_epoch.pop() {
            Some(result) if new_epoch.is_empty() => Ok(result),
            _ => Err(SortError::Precondition(
                "merge epochs converged to more than one run".to_string(),
            )),
        }
    }
}
