//! K-way merge of sorted runs through a binary min-heap.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::io::prelude::*;

use log;

use crate::record::{self, Record};
use crate::sort::SortError;

/// One run being merged: the source handle plus the window of records most
/// recently read from it. The buffer is replaced wholesale on refill, which
/// is why heap entries own their record instead of borrowing into it.
struct RunCursor<R> {
    source: R,
    buffer: Vec<Record>,
}

/// An owned heap entry: the record at the head of a run, the index of the
/// record after it in the run's buffer, and the run it came from.
struct HeapEntry {
    record: Record,
    next_index: usize,
    run: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.record.key() == other.record.key() && self.run == other.run
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // ordered by key bytes; equal keys fall back to the run index,
        // which keeps the order total without promising stability
        self.record
            .key()
            .cmp(other.record.key())
            .then_with(|| self.run.cmp(&other.run))
    }
}

/// Merges sorted `sources` into `output` in non-decreasing key order,
/// emitting each record exactly once.
///
/// `window` is the per-run buffer size in records; the output buffer is the
/// same size, so peak residency is `(sources + 1) * window` records.
pub fn merge<R, W>(sources: Vec<R>, window: usize, output: &mut W) -> Result<(), SortError>
where
    R: Read,
    W: Write,
{
    let window = window.max(1);

    let mut cursors = Vec::with_capacity(sources.len());
    let mut heap = BinaryHeap::with_capacity(sources.len());

    for (run, mut source) in sources.into_iter().enumerate() {
        let buffer = record::read_records(&mut source, window)?;
        if let Some(head) = buffer.first() {
            heap.push(Reverse(HeapEntry {
                record: head.clone(),
                next_index: 1,
                run,
            }));
        }
        cursors.push(RunCursor { source, buffer });
    }

    log::debug!("merging {} runs (window {} records)", cursors.len(), window);

    let mut out_buf: Vec<Record> = Vec::with_capacity(window);
    while let Some(Reverse(entry)) = heap.pop() {
        if out_buf.len() >= window {
            record::write_records(output, &out_buf)?;
            out_buf.clear();
        }
        out_buf.push(entry.record);

        let cursor = &mut cursors[entry.run];
        let mut next_index = entry.next_index;
        if next_index >= cursor.buffer.len() {
            cursor.buffer = record::read_records(&mut cursor.source, window)?;
            next_index = 0;
        }
        if let Some(head) = cursor.buffer.get(next_index) {
            heap.push(Reverse(HeapEntry {
                record: head.clone(),
                next_index: next_index + 1,
                run: entry.run,
            }));
        }
    }

    record::write_records(output, &out_buf)?;
    return Ok(());
}
