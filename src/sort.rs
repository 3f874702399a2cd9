//! Local sort driver: in-memory below the threshold, external merge above.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use log;

use crate::merger;
use crate::record::{self, RECORD_BYTES};
use crate::run;

/// Input size in bytes above which sorting goes through on-disk runs.
pub const EXTERNAL_THRESHOLD: u64 = 10_000_000;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// The input ended inside a record.
    PartialRecord,
    /// Reading the input or a run failed.
    Read(io::Error),
    /// Writing the output or a run failed.
    Write(io::Error),
    /// Scratch directory or run file creation failed.
    Scratch(io::Error),
    /// Workers thread pool initialization failed.
    ThreadPool(rayon::ThreadPoolBuildError),
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::PartialRecord => None,
            SortError::Read(err) => Some(err),
            SortError::Write(err) => Some(err),
            SortError::Scratch(err) => Some(err),
            SortError::ThreadPool(err) => Some(err),
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::PartialRecord => {
                write!(f, "input length is not a multiple of {} bytes", RECORD_BYTES)
            }
            SortError::Read(err) => write!(f, "read failed: {}", err),
            SortError::Write(err) => write!(f, "write failed: {}", err),
            SortError::Scratch(err) => {
                write!(f, "scratch directory or file not created: {}", err)
            }
            SortError::ThreadPool(err) => {
                write!(f, "thread pool initialization failed: {}", err)
            }
        }
    }
}

/// Local sorter builder. Provides methods for [`LocalSorter`] initialization.
#[derive(Clone)]
pub struct LocalSorterBuilder {
    /// Input size in bytes above which the external path is taken.
    threshold: u64,
    /// Directory the scratch directory is created under.
    tmp_dir: Option<PathBuf>,
    /// Number of threads used to sort batches in parallel.
    threads: Option<usize>,
}

impl LocalSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        LocalSorterBuilder::default()
    }

    /// Sets the external-sort threshold in bytes.
    pub fn with_threshold(mut self, threshold: u64) -> LocalSorterBuilder {
        self.threshold = threshold;
        return self;
    }

    /// Sets the directory the scratch directory is created under.
    pub fn with_tmp_dir(mut self, path: &Path) -> LocalSorterBuilder {
        self.tmp_dir = Some(path.to_path_buf());
        return self;
    }

    /// Sets the number of threads used to sort batches in parallel.
    pub fn with_threads(mut self, threads: usize) -> LocalSorterBuilder {
        self.threads = Some(threads);
        return self;
    }

    /// Builds a [`LocalSorter`] instance using the provided configuration.
    pub fn build(self) -> Result<LocalSorter, SortError> {
        return Ok(LocalSorter {
            thread_pool: init_thread_pool(self.threads)?,
            threshold: self.threshold.max(RECORD_BYTES as u64),
            tmp_dir: self.tmp_dir,
        });
    }
}

impl Default for LocalSorterBuilder {
    fn default() -> Self {
        LocalSorterBuilder {
            threshold: EXTERNAL_THRESHOLD,
            tmp_dir: None,
            threads: None,
        }
    }
}

fn init_thread_pool(threads: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
    let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

    if let Some(threads) = threads {
        log::info!("initializing thread-pool (threads: {})", threads);
        thread_pool_builder = thread_pool_builder.num_threads(threads);
    } else {
        log::info!("initializing thread-pool (threads: default)");
    }
    let thread_pool = thread_pool_builder.build().map_err(SortError::ThreadPool)?;

    return Ok(thread_pool);
}

/// Sorts files of fixed-width records by key. Inputs at most `threshold`
/// bytes long are sorted entirely in memory; larger inputs go through
/// sorted on-disk runs merged with bounded record residency.
pub struct LocalSorter {
    /// Batch sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Input size in bytes above which the external path is taken.
    threshold: u64,
    /// Directory the scratch directory is created under.
    tmp_dir: Option<PathBuf>,
}

impl LocalSorter {
    /// Sorts `input` into `output`.
    ///
    /// The first error is surfaced and nothing of the partial output is
    /// promised; the scratch directory is removed on every exit path.
    pub fn sort_file(&self, input: &Path, output: &Path) -> Result<(), SortError> {
        let input_file = fs::File::open(input).map_err(SortError::Read)?;
        let input_len = input_file.metadata().map_err(SortError::Read)?.len();
        let mut reader = io::BufReader::new(input_file);

        let output_file = fs::File::create(output).map_err(SortError::Write)?;
        let mut writer = io::BufWriter::new(output_file);

        if input_len <= self.threshold {
            log::debug!("sorting {} bytes in memory", input_len);
            let mut records = record::read_records(&mut reader, 0)?;
            self.thread_pool.install(|| record::sort_records(&mut records));
            record::write_records(&mut writer, &records)?;
        } else {
            log::info!("input is {} bytes, sorting through on-disk runs", input_len);
            self.sort_external(&mut reader, &mut writer)?;
        }

        writer.flush().map_err(SortError::Write)?;
        return Ok(());
    }

    fn sort_external<R, W>(&self, input: &mut R, output: &mut W) -> Result<(), SortError>
    where
        R: Read,
        W: Write,
    {
        let scratch = self.init_scratch_dir()?;
        let run_capacity = (self.threshold as usize / RECORD_BYTES).max(1);

        // runs are formed until the input is exhausted, so a threshold that
        // is not record-aligned never strands trailing records
        let runs = run::write_runs(input, run_capacity, &scratch, &self.thread_pool)?;
        log::info!("merging {} runs", runs.len());

        // one extra window's worth is reserved for the output buffer, so the
        // merge never holds more than `run_capacity` records at once
        let window = run_capacity / (runs.len() + 1);
        return merger::merge(runs, window, output);
    }

    fn init_scratch_dir(&self) -> Result<tempfile::TempDir, SortError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("sort-");

        let scratch = match &self.tmp_dir {
            Some(tmp_dir) => builder.tempdir_in(tmp_dir),
            None => builder.tempdir(),
        }
        .map_err(SortError::Scratch)?;

        log::info!("using {} as a scratch directory", scratch.path().display());
        return Ok(scratch);
    }
}
