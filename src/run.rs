//! Run formation: sorted temporary run files for the external sort.

use std::io::{self, prelude::*};

use log;
use tempfile::{NamedTempFile, TempDir};

use crate::record;
use crate::sort::SortError;

/// Consumes the whole input in batches of up to `run_capacity` records,
/// sorts each batch and writes it as a uniquely named run file inside
/// `scratch`. Runs are formed until the input is exhausted, so no trailing
/// records are left unread. Every returned handle is rewound to the start
/// of its run, ready to merge. The scratch directory owns the files;
/// dropping it removes them.
pub fn write_runs<R: Read>(
    input: &mut R,
    run_capacity: usize,
    scratch: &TempDir,
    pool: &rayon::ThreadPool,
) -> Result<Vec<NamedTempFile>, SortError> {
    let mut runs = Vec::new();

    loop {
        let mut records = record::read_records(input, run_capacity)?;
        if records.is_empty() {
            break;
        }
        pool.install(|| record::sort_records(&mut records));

        let i = runs.len();
        let mut run = tempfile::Builder::new()
            .prefix(&format!("run-{}-", i))
            .tempfile_in(scratch.path())
            .map_err(SortError::Scratch)?;

        let mut writer = io::BufWriter::new(run.as_file_mut());
        record::write_records(&mut writer, &records)?;
        writer.flush().map_err(SortError::Write)?;
        drop(writer);

        log::debug!("run {} written ({} records)", i, records.len());
        runs.push(run);
    }

    for run in runs.iter_mut() {
        run.as_file_mut().rewind().map_err(SortError::Read)?;
    }

    return Ok(runs);
}
