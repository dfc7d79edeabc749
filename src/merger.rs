//! K-way merge of sorted runs, driven by a min-heap of reader heads.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io::Write;
use std::path::{Path, PathBuf};

use log;

use crate::record::Record;
use crate::run::{advise_sequential, close_file, create_run_file, RunReader};
use crate::sort::SortError;

// One buffered head record, tagged with the index of the reader it came from.
// `BinaryHeap` is a max-heap, so the ordering is reversed to make it a
// min-heap; ties fall back to the reader index, which keeps the choice
// between equal heads deterministic.
struct HeapEntry<T, F> {
    record: T,
    reader: usize,
    compare: F,
}

impl<T, F> Ord for HeapEntry<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    fn cmp(&self, other: &Self) -> Ordering {
        (self.compare)(&self.record, &other.record)
            .then_with(|| self.reader.cmp(&other.reader))
            .reverse()
    }
}

impl<T, F> PartialOrd for HeapEntry<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T, F> PartialEq for HeapEntry<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T, F> Eq for HeapEntry<T, F> where F: Fn(&T, &T) -> Ordering {}

/// Merges the sorted runs at `inputs` into a single sorted file at `output`.
///
/// `budget` bytes are partitioned into `page_size`-byte pages: up to
/// `write_pages` of them buffer the output (clamped so every reader keeps at
/// least one page), and the rest is split evenly among the input readers.
/// The output file is created exclusively, fsynced and closed before
/// the call returns; its length is the sum of the input lengths and its
/// records are the multiset union of the inputs in non-decreasing `compare`
/// order.
///
/// Fails with [`SortError::BudgetTooSmall`] when a page cannot hold one
/// record or when the budget holds too few pages to give every reader one
/// besides the write buffer's. All reader
/// construction happens before the output is created, so a failing input
/// aborts the merge before any write.
pub fn merge_runs<T, F>(
    inputs: &[PathBuf],
    output: &Path,
    compare: F,
    budget: usize,
    page_size: usize,
    write_pages: usize,
) -> Result<(), SortError>
where
    T: Record,
    F: Fn(&T, &T) -> Ordering + Copy,
{
    if inputs.is_empty() {
        return Err(SortError::Precondition(
            "merge invoked with no input runs".to_string(),
        ));
    }
    if page_size < T::SIZE {
        return Err(SortError::BudgetTooSmall(page_size));
    }

    let pages = budget / page_size;
    if pages <= inputs.len() {
        return Err(SortError::BudgetTooSmall(budget));
    }
    // One page per reader is the floor; the write buffer takes what remains,
    // up to its configured share.
    let write_buf_pages = write_pages.clamp(1, pages - inputs.len());
    let pages_per_reader = (pages - write_buf_pages) / inputs.len();

    log::debug!(
        "merging {} runs into {}: {} pages, {} for writes, {} per reader",
        inputs.len(),
        output.display(),
        pages,
        write_buf_pages,
        pages_per_reader
    );

    let mut readers: Vec<RunReader<T>> = Vec::with_capacity(inputs.len());
    let mut heap = BinaryHeap::with_capacity(inputs.len());
    for path in inputs {
        let mut reader = RunReader::open(path, pages_per_reader * page_size)?;
        if reader.has_more() {
            heap.push(HeapEntry {
                record: reader.pop()?,
                reader: readers.len(),
                compare,
            });
        }
        readers.push(reader);
    }

    let write_buf_records = write_buf_pages * page_size / T::SIZE;
    let mut write_buf = vec![0u8; write_buf_records * T::SIZE];
    let mut pending = 0;

    let mut out_file = create_run_file(output)?;
    advise_sequential(&out_file);

    while let Some(entry) = heap.pop() {
        if pending == write_buf_records {
            out_file
                .write_all(&write_buf)
                .map_err(|err| SortError::IoWrite(output.to_path_buf(), err))?;
            pending = 0;
            log::trace!("{}: write buffer flushed", output.display());
        }

        entry
            .record
            .encode(&mut write_buf[pending * T::SIZE..(pending + 1) * T::SIZE]);
        pending += 1;

        let reader = &mut readers[entry.reader];
        if reader.has_more() {
            heap.push(HeapEntry {
                record: reader.pop()?,
                reader: entry.reader,
                compare,
            });
        }
    }

    if pending > 0 {
        out_file
            .write_all(&write_buf[..pending * T::SIZE])
            .map_err(|err| SortError::IoWrite(output.to_path_buf(), err))?;
    }
    out_file
        .sync_all()
        .map_err(|err| SortError::IoSync(output.to_path_buf(), err))?;
    close_file(out_file, output)?;

    return Ok(());
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::{Path, PathBuf};

    use rstest::*;

    use super::merge_runs;
    use crate::sort::SortError;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn write_run(dir: &Path, name: &str, values: &[u64]) -> PathBuf {
        let path = dir.join(name);
        let mut bytes = Vec::with_capacity(values.len() * 8);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        fs::write(&path, bytes).unwrap();
        path
    }

    fn read_run(path: &Path) -> Vec<u64> {
        let bytes = fs::read(path).unwrap();
        bytes
            .chunks_exact(8)
            .map(|image| u64::from_le_bytes(image.try_into().unwrap()))
            .collect()
    }

    #[rstest]
    #[case(
        vec![vec![4, 5, 7], vec![1, 6], vec![3], vec![]],
        vec![1, 3, 4, 5, 6, 7],
    )]
    #[case(
        vec![vec![1, 2, 3]],
        vec![1, 2, 3],
    )]
    #[case(
        vec![vec![5, 5], vec![5, 5]],
        vec![5, 5, 5, 5],
    )]
    #[case(
        vec![vec![], vec![]],
        vec![],
    )]
    fn test_merge_runs(
        tmp_dir: tempfile::TempDir,
        #[case] runs: Vec<Vec<u64>>,
        #[case] expected: Vec<u64>,
    ) {
        let inputs: Vec<PathBuf> = runs
            .iter()
            .enumerate()
            .map(|(index, values)| write_run(tmp_dir.path(), &format!("run_{}", index), values))
            .collect();
        let output = tmp_dir.path().join("merged");

        merge_runs(&inputs, &output, u64::cmp, 256, 16, 4).unwrap();

        assert_eq!(read_run(&output), expected);
    }

    #[rstest]
    fn test_merge_refills_and_flushes(tmp_dir: tempfile::TempDir) {
        // Single-page readers hold two records each, so a 200-record merge
        // rolls every buffer over many times.
        let left: Vec<u64> = (0..100).map(|n| n * 2).collect();
        let right: Vec<u64> = (0..100).map(|n| n * 2 + 1).collect();
        let inputs = vec![
            write_run(tmp_dir.path(), "left", &left),
            write_run(tmp_dir.path(), "right", &right),
        ];
        let output = tmp_dir.path().join("merged");

        merge_runs(&inputs, &output, u64::cmp, 160, 16, 256).unwrap();

        assert_eq!(read_run(&output), Vec::from_iter(0..200u64));
    }

    #[rstest]
    fn test_merge_with_reversed_order(tmp_dir: tempfile::TempDir) {
        let inputs = vec![
            write_run(tmp_dir.path(), "left", &[9, 5, 1]),
            write_run(tmp_dir.path(), "right", &[8, 2]),
        ];
        let output = tmp_dir.path().join("merged");

        merge_runs(&inputs, &output, |a: &u64, b: &u64| b.cmp(a), 256, 16, 4).unwrap();

        assert_eq!(read_run(&output), vec![9, 8, 5, 2, 1]);
    }

    #[rstest]
    fn test_merge_single_page_readers(tmp_dir: tempfile::TempDir) {
        // Four pages and three readers: the write buffer yields down to one
        // page so every reader still gets its own.
        let inputs = vec![
            write_run(tmp_dir.path(), "run_0", &[0, 3, 6]),
            write_run(tmp_dir.path(), "run_1", &[1, 4, 7]),
            write_run(tmp_dir.path(), "run_2", &[2, 5, 8]),
        ];
        let output = tmp_dir.path().join("merged");

        merge_runs(&inputs, &output, u64::cmp, 64, 16, 2).unwrap();

        assert_eq!(read_run(&output), Vec::from_iter(0..9u64));
    }

    #[rstest]
    fn test_merge_rejects_more_readers_than_pages(tmp_dir: tempfile::TempDir) {
        let inputs: Vec<PathBuf> = (0..3)
            .map(|index| write_run(tmp_dir.path(), &format!("run_{}", index), &[index]))
            .collect();
        let output = tmp_dir.path().join("merged");

        // three pages cannot host three readers plus the write buffer
        let result = merge_runs(&inputs, &output, u64::cmp, 48, 16, 2);
        assert!(matches!(result, Err(SortError::BudgetTooSmall(48))));
        assert!(!output.exists());
    }

    #[rstest]
    fn test_merge_rejects_page_below_record(tmp_dir: tempfile::TempDir) {
        let inputs = vec![write_run(tmp_dir.path(), "run", &[1])];
        let output = tmp_dir.path().join("merged");

        let result = merge_runs(&inputs, &output, u64::cmp, 256, 4, 4);
        assert!(matches!(result, Err(SortError::BudgetTooSmall(4))));
    }

    #[test]
    fn test_merge_requires_inputs() {
        let result = merge_runs::<u64, _>(&[], Path::new("./merged"), u64::cmp, 256, 16, 4);
        assert!(matches!(result, Err(SortError::Precondition(_))));
    }

    #[rstest]
    fn test_merge_aborts_before_write_on_missing_input(tmp_dir: tempfile::TempDir) {
        let inputs = vec![
            write_run(tmp_dir.path(), "present", &[1]),
            tmp_dir.path().join("missing"),
        ];
        let output = tmp_dir.path().join("merged");

        let result = merge_runs(&inputs, &output, u64::cmp, 256, 16, 4);
        assert!(matches!(result, Err(SortError::IoOpen(_, _))));
        assert!(!output.exists());
    }

    #[rstest]
    fn test_merge_refuses_existing_output(tmp_dir: tempfile::TempDir) {
        let inputs = vec![write_run(tmp_dir.path(), "run", &[1])];
        let output = write_run(tmp_dir.path(), "merged", &[7]);

        let result = merge_runs(&inputs, &output, u64::cmp, 256, 16, 4);
        assert!(matches!(result, Err(SortError::IoOpen(_, _))));
        // the pre-existing file is untouched
        assert_eq!(read_run(&output), vec![7]);
    }
}
