//! Run files and the streaming run reader.
//!
//! A run is a file of concatenated record images already in non-decreasing
//! order. Runs are named after the file they were produced from plus the merge
//! epoch and a within-epoch index, are created exclusively (creation fails if
//! the name is taken), and are deleted by the merge scheduler once consumed.

use std::fs::{File, OpenOptions};
use std::io;
use std::io::Read;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use log;

use crate::record::Record;
use crate::sort::SortError;

/// Returns the deterministic path of a run file: `<source>_run_<epoch>_<index>`.
///
/// Epochs and indices start at 1. The scheduler never reuses an
/// `(epoch, index)` pair while its file is in flight, which keeps the names
/// unique within a sorting pass.
pub fn run_file_name(source: &Path, epoch: usize, index: usize) -> PathBuf {
    let mut name = source.as_os_str().to_os_string();
    name.push(format!("_run_{}_{}", epoch, index));
    PathBuf::from(name)
}

/// Opens `path` read-only and hints sequential access to the OS.
pub(crate) fn open_sequential(path: &Path) -> Result<File, SortError> {
    let file = File::open(path).map_err(|err| SortError::IoOpen(path.to_path_buf(), err))?;
    advise_sequential(&file);
    Ok(file)
}

#[cfg(target_os = "linux")]
pub(crate) fn advise_sequential(file: &File) {
    use std::os::unix::io::AsRawFd;

    // Read-ahead hint; the advice carries no correctness obligations.
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_SEQUENTIAL);
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn advise_sequential(_file: &File) {}

/// Creates a run file exclusively: owner gets read-write, everyone else read.
pub(crate) fn create_run_file(path: &Path) -> Result<File, SortError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    options
        .open(path)
        .map_err(|err| SortError::IoOpen(path.to_path_buf(), err))
}

/// Reads until `buf` is full or the file ends, retrying short reads and
/// interrupted calls. Returns the number of bytes placed into `buf`.
pub(crate) fn read_fill(file: &mut File, buf: &mut [u8], path: &Path) -> Result<usize, SortError> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(count) => filled += count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(SortError::IoRead(path.to_path_buf(), err)),
        }
    }
    Ok(filled)
}

/// Closes `file`, surfacing the OS close result instead of dropping it.
#[cfg(unix)]
pub(crate) fn close_file(file: File, path: &Path) -> Result<(), SortError> {
    use std::os::unix::io::IntoRawFd;

    let fd = file.into_raw_fd();
    if unsafe { libc::close(fd) } < 0 {
        return Err(SortError::IoClose(path.to_path_buf(), io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn close_file(file: File, _path: &Path) -> Result<(), SortError> {
    drop(file);
    Ok(())
}

/// Forward-only cursor over one run file.
///
/// The reader owns an exclusive file handle and a bounded buffer of up to
/// `⌊budget / SIZE⌋` record images, refilled on demand; its resident cost
/// stays within the construction budget no matter how large the run is. The
/// handle is released when the reader is dropped, on every exit path.
pub struct RunReader<T: Record> {
    path: PathBuf,
    file: File,
    buf: Vec<u8>,
    /// Records per buffered window.
    capacity: u64,
    file_len: u64,
    /// Bytes fetched from disk so far.
    buffered: u64,
    popped: u64,

    record_type: PhantomData<T>,
}

impl<T: Record> RunReader<T> {
    /// Opens the run at `path` with at most `budget` bytes of read buffer.
    ///
    /// Fails with [`SortError::BudgetTooSmall`] if the budget cannot hold one
    /// record, [`SortError::IoOpen`] if the file cannot be opened or stat'ed
    /// and [`SortError::BadSize`] if its length is not a whole number of
    /// records.
    pub fn open(path: impl AsRef<Path>, budget: usize) -> Result<Self, SortError> {
        let path = path.as_ref().to_path_buf();
        if budget < T::SIZE {
            return Err(SortError::BudgetTooSmall(budget));
        }

        let file = open_sequential(&path)?;
        let file_len = file
            .metadata()
            .map_err(|err| SortError::IoOpen(path.clone(), err))?
            .len();
        if file_len % T::SIZE as u64 != 0 {
            return Err(SortError::BadSize(path, file_len));
        }

        let capacity = (budget / T::SIZE) as u64;
        log::trace!(
            "reader over {}: {} records, window of {}",
            path.display(),
            file_len / T::SIZE as u64,
            capacity
        );

        return Ok(RunReader {
            buf: vec![0u8; capacity as usize * T::SIZE],
            capacity,
            file_len,
            buffered: 0,
            popped: 0,
            path,
            file,
            record_type: PhantomData,
        });
    }

    /// True while records remain to be popped.
    pub fn has_more(&self) -> bool {
        self.popped < self.total()
    }

    /// Number of records in the underlying run.
    pub fn total(&self) -> u64 {
        self.file_len / T::SIZE as u64
    }

    /// Number of records popped so far.
    pub fn popped(&self) -> u64 {
        self.popped
    }

    /// Returns the next record without advancing past it.
    ///
    /// The first call fetches the first buffer window; afterwards peeking is
    /// a decode from the resident window.
    pub fn peek(&mut self) -> Result<T, SortError> {
        if !self.has_more() {
            return Err(SortError::Precondition(format!(
                "read past the end of run {}",
                self.path.display()
            )));
        }
        if self.buffered == 0 {
            self.refill()?;
        }

        let slot = (self.popped % self.capacity) as usize * T::SIZE;
        Ok(T::decode(&self.buf[slot..slot + T::SIZE]))
    }

    /// Returns the next record and advances past it.
    ///
    /// When the buffered window is exhausted and records remain on disk, the
    /// next window is fetched before returning.
    pub fn pop(&mut self) -> Result<T, SortError> {
        let record = self.peek()?;
        self.popped += 1;
        if self.popped % self.capacity == 0 && self.has_more() {
            self.refill()?;
        }
        Ok(record)
    }

    // Overwrites the window with the next `capacity` records, or with however
    // many remain on disk.
    fn refill(&mut self) -> Result<(), SortError> {
        let remain = (self.file_len - self.buffered) as usize;
        let want = remain.min(self.buf.len());
        let got = read_fill(&mut self.file, &mut self.buf[..want], &self.path)?;
        if got < want {
            return Err(SortError::IoShortRead(self.path.clone()));
        }
        self.buffered += got as u64;

        log::trace!(
            "reader over {}: buffered {}/{} bytes",
            self.path.display(),
            self.buffered,
            self.file_len
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::Path;

    use rstest::*;

    use super::{run_file_name, RunReader};
    use crate::sort::SortError;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn write_records(path: &Path, values: &[u64]) {
        let mut bytes = Vec::with_capacity(values.len() * 8);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_run_file_name() {
        let name = run_file_name(Path::new("./accounts.data"), 2, 7);
        assert_eq!(name, Path::new("./accounts.data_run_2_7"));
    }

    #[rstest]
    #[case(8)] // one record per window
    #[case(24)] // window rolls over mid-run
    #[case(200)] // window larger than the run
    fn test_reader_streams_whole_run(tmp_dir: tempfile::TempDir, #[case] budget: usize) {
        let path = tmp_dir.path().join("run");
        let values = Vec::from_iter(0..10u64);
        write_records(&path, &values);

        let mut reader: RunReader<u64> = RunReader::open(&path, budget).unwrap();
        assert_eq!(reader.total(), 10);
        assert_eq!(reader.popped(), 0);

        let mut popped = Vec::new();
        while reader.has_more() {
            assert_eq!(reader.peek().unwrap(), reader.peek().unwrap());
            popped.push(reader.pop().unwrap());
        }

        assert_eq!(popped, values);
        assert_eq!(reader.popped(), 10);
        assert!(matches!(reader.pop(), Err(SortError::Precondition(_))));
    }

    #[rstest]
    fn test_reader_rejects_ragged_file(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("run");
        fs::write(&path, [0u8; 12]).unwrap();

        let result: Result<RunReader<u64>, _> = RunReader::open(&path, 64);
        assert!(matches!(result, Err(SortError::BadSize(_, 12))));
    }

    #[rstest]
    fn test_reader_rejects_budget_below_one_record(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("run");
        write_records(&path, &[1]);

        let result: Result<RunReader<u64>, _> = RunReader::open(&path, 7);
        assert!(matches!(result, Err(SortError::BudgetTooSmall(7))));
    }

    #[test]
    fn test_reader_missing_file() {
        let result: Result<RunReader<u64>, _> = RunReader::open("./no-such-run", 64);
        assert!(matches!(result, Err(SortError::IoOpen(_, _))));
    }

    #[rstest]
    fn test_empty_run(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("run");
        write_records(&path, &[]);

        let mut reader: RunReader<u64> = RunReader::open(&path, 64).unwrap();
        assert!(!reader.has_more());
        assert_eq!(reader.total(), 0);
        assert!(reader.peek().is_err());
    }
}
