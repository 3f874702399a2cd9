//! Distributed sort driver: partition the local shard, exchange records so
//! each peer owns a contiguous key range, then sort and write that range.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;
use std::sync::Arc;

use log;

use crate::exchange::{self, ExchangeError};
use crate::partition::partition_of;
use crate::record::{self, KEY_BYTES, RECORD_BYTES};
use crate::roster::Roster;
use crate::sort::SortError;

/// Distributed sort error.
#[derive(Debug)]
pub enum DistError {
    /// Reading, sorting or writing records failed.
    Sort(SortError),
    /// The record exchange failed.
    Exchange(ExchangeError),
}

impl Error for DistError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            DistError::Sort(err) => Some(err),
            DistError::Exchange(err) => Some(err),
        }
    }
}

impl Display for DistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            DistError::Sort(err) => write!(f, "{}", err),
            DistError::Exchange(err) => write!(f, "{}", err),
        }
    }
}

impl From<SortError> for DistError {
    fn from(err: SortError) -> Self {
        DistError::Sort(err)
    }
}

impl From<ExchangeError> for DistError {
    fn from(err: ExchangeError) -> Self {
        DistError::Exchange(err)
    }
}

/// Sorts this peer's shard of a partitioned data set.
///
/// Reads the whole shard, routes every record to the bucket of its owning
/// peer, exchanges buckets with the rest of the roster, then sorts the
/// records this peer owns (its own bucket plus everything received) and
/// writes them to `output`. The post-exchange working set is assumed to fit
/// in memory.
///
/// Concatenating all peers' outputs in ascending id order yields one
/// globally sorted sequence.
pub async fn sort_shard(
    local_id: u32,
    input: &Path,
    output: &Path,
    roster: &Roster,
) -> Result<(), DistError> {
    let shard = fs::read(input).map_err(SortError::Read)?;
    if shard.len() % RECORD_BYTES != 0 {
        return Err(SortError::PartialRecord.into());
    }

    let peer_count = roster.len();
    let mut buckets: Vec<Vec<u8>> = vec![Vec::new(); peer_count];
    for rec in shard.chunks_exact(RECORD_BYTES) {
        let owner = partition_of(&rec[..KEY_BYTES], peer_count);
        buckets[owner].extend_from_slice(rec);
    }
    log::debug!(
        "peer {}: partitioned {} records into {} buckets",
        local_id,
        shard.len() / RECORD_BYTES,
        peer_count
    );

    let buckets = Arc::new(buckets);
    let inbound = exchange::exchange(roster, local_id, buckets.clone()).await?;

    // the owned key range: the local bucket plus every received block
    let mut owned = buckets[local_id as usize].clone();
    for block in &inbound {
        owned.extend_from_slice(block);
    }

    let mut records = record::read_records(&mut owned.as_slice(), 0)?;
    record::sort_records(&mut records);

    let output_file = fs::File::create(output).map_err(SortError::Write)?;
    let mut writer = io::BufWriter::new(output_file);
    record::write_records(&mut writer, &records)?;
    writer.flush().map_err(SortError::Write)?;

    log::info!("peer {}: wrote {} records", local_id, records.len());
    return Ok(());
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::PathBuf;

    use super::sort_shard;
    use crate::record::RECORD_BYTES;
    use crate::roster::{Peer, Roster};

    fn roster(ports: &[u16]) -> Roster {
        let peers = ports
            .iter()
            .enumerate()
            .map(|(id, port)| Peer {
                peer_id: id as u32,
                host: "127.0.0.1".to_string(),
                port: port.to_string(),
            })
            .collect();
        Roster::from_peers(peers).unwrap()
    }

    fn record(key: &[u8], filler: u8) -> Vec<u8> {
        let mut bytes = vec![filler; RECORD_BYTES];
        bytes[..key.len()].copy_from_slice(key);
        bytes
    }

    /// Writes `shards[i]` as peer i's input and runs every peer to
    /// completion, returning each peer's output bytes.
    async fn run_peers(roster: &Roster, shards: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        let dir = tempfile::tempdir().unwrap();

        let mut handles = Vec::new();
        let mut outputs: Vec<PathBuf> = Vec::new();
        for (id, shard) in shards.into_iter().enumerate() {
            let input = dir.path().join(format!("input-{}", id));
            let output = dir.path().join(format!("output-{}", id));
            fs::write(&input, &shard).unwrap();
            outputs.push(output.clone());

            let roster = roster.clone();
            handles.push(tokio::spawn(async move {
                sort_shard(id as u32, &input, &output, &roster).await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        outputs.iter().map(|path| fs::read(path).unwrap()).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_peers_split_key_space() {
        let roster = roster(&[24351, 24352]);

        // each shard holds one low-keyed and one high-keyed record
        let low_0 = record(&[0x00, 0x01], 1);
        let high_0 = record(&[0xff, 0x01], 2);
        let low_1 = record(&[0x00, 0x02], 3);
        let high_1 = record(&[0xff, 0x02], 4);

        let outputs = run_peers(
            &roster,
            vec![
                [high_0.clone(), low_0.clone()].concat(),
                [high_1.clone(), low_1.clone()].concat(),
            ],
        )
        .await;

        // peer 0 owns the low half of the key space, peer 1 the high half
        assert_eq!(outputs[0], [low_0, low_1].concat());
        assert_eq!(outputs[1], [high_0, high_1].concat());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concatenated_outputs_are_globally_sorted() {
        let roster = roster(&[24361, 24362]);

        let mut shard_0 = Vec::new();
        let mut shard_1 = Vec::new();
        for key in (0u8..32).rev() {
            // spread keys over the whole range so both peers own some
            let spread = key.wrapping_mul(8);
            let rec = record(&[spread, key], key);
            if key % 2 == 0 {
                shard_0.extend(rec);
            } else {
                shard_1.extend(rec);
            }
        }

        let outputs = run_peers(&roster, vec![shard_0, shard_1]).await;

        let global = [outputs[0].clone(), outputs[1].clone()].concat();
        assert_eq!(global.len(), 32 * RECORD_BYTES);
        let keys: Vec<&[u8]> = global.chunks(RECORD_BYTES).map(|r| &r[..10]).collect();
        for pair in keys.windows(2) {
            assert!(pair[0] <= pair[1], "output out of order");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sentinel_prefixed_key_crosses_peers() {
        let roster = roster(&[24371, 24372]);

        // keyed "EOF..." (0x45...) so it belongs to peer 0 but starts on
        // peer 1 and must cross the wire intact
        let tricky = record(b"EOFEOFEOFE", 0x5a);
        let high = record(&[0xf0], 9);

        let outputs = run_peers(&roster, vec![high.clone(), tricky.clone()]).await;

        assert_eq!(outputs[0], tricky);
        assert_eq!(outputs[1], high);
    }

    #[tokio::test]
    async fn test_single_peer_sorts_locally() {
        let roster = roster(&[24381]);

        let shard = [record(&[2], 2), record(&[0], 0), record(&[1], 1)].concat();
        let outputs = run_peers(&roster, vec![shard]).await;

        let expected = [record(&[0], 0), record(&[1], 1), record(&[2], 2)].concat();
        assert_eq!(outputs[0], expected);
    }

    #[tokio::test]
    async fn test_partial_shard_is_fatal() {
        let roster = roster(&[24391]);
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let output = dir.path().join("output");
        fs::write(&input, [0u8; RECORD_BYTES + 10]).unwrap();

        let result = sort_shard(0, &input, &output, &roster).await;
        assert!(result.is_err());
        assert!(!output.exists(), "partial outputs must not be written");
    }
}
