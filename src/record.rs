//! Fixed-width records and record-stream I/O.

use std::fmt;
use std::io::{self, prelude::*};

use rayon::prelude::*;

use crate::sort::SortError;

/// Size of a single record in bytes.
pub const RECORD_BYTES: usize = 100;
/// Size of the sort key at the start of each record.
pub const KEY_BYTES: usize = 10;

/// A fixed-width block of [`RECORD_BYTES`] bytes. The leading [`KEY_BYTES`]
/// bytes form the sort key, compared as unsigned big-endian bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Record([u8; RECORD_BYTES]);

impl Record {
    /// Returns the sort key.
    pub fn key(&self) -> &[u8] {
        &self.0[..KEY_BYTES]
    }

    /// Returns the whole record, key included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; RECORD_BYTES]> for Record {
    fn from(bytes: [u8; RECORD_BYTES]) -> Self {
        Record(bytes)
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Record(key=")?;
        for byte in self.key() {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// Reads whole records from `src` until `max_count` records have been read
/// (when `max_count > 0`) or the stream ends. The read position advances,
/// so callers refill incrementally by passing the same handle again.
///
/// A stream that ends inside a record fails with [`SortError::PartialRecord`];
/// ending exactly on a record boundary is normal termination.
pub fn read_records<R: Read>(src: &mut R, max_count: usize) -> Result<Vec<Record>, SortError> {
    let mut records = if max_count > 0 {
        Vec::with_capacity(max_count)
    } else {
        Vec::new()
    };

    let mut buf = [0u8; RECORD_BYTES];
    loop {
        let filled = fill(src, &mut buf).map_err(SortError::Read)?;
        if filled == 0 {
            break;
        }
        if filled < RECORD_BYTES {
            return Err(SortError::PartialRecord);
        }
        records.push(Record(buf));
        if max_count > 0 && records.len() >= max_count {
            break;
        }
    }

    return Ok(records);
}

/// Writes every record's bytes in order, without separators.
pub fn write_records<W: Write>(dst: &mut W, records: &[Record]) -> Result<(), SortError> {
    for record in records {
        dst.write_all(&record.0).map_err(SortError::Write)?;
    }
    return Ok(());
}

/// Sorts a record batch in place by key. Equal keys may reorder.
pub fn sort_records(records: &mut [Record]) {
    records.par_sort_unstable_by(|a, b| a.key().cmp(b.key()));
}

/// Reads into `buf` until it is full or the stream ends, returning the
/// number of bytes read. Unlike `read_exact`, a clean end of stream is not
/// an error here; the caller distinguishes boundary from mid-record.
fn fill<R: Read>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    return Ok(filled);
}
