//! All-to-all record exchange between sort peers.
//!
//! Every peer simultaneously dials every other peer (announcing its own id,
//! then reading that peer's outbound records until the end-of-stream
//! sentinel) and serves every inbound connection (reading the caller's id,
//! then streaming the bucket owned by that caller). The driver proceeds only
//! once all inbound blocks have arrived and all outbound streams have
//! drained.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use log;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;

use crate::record::RECORD_BYTES;
use crate::roster::Roster;

/// End-of-stream marker. Distinguishable from a record only by its short
/// length: receivers fill a whole record's worth of bytes before looking at
/// the payload, so a record that happens to start with these bytes is
/// transferred intact.
const SENTINEL: &[u8] = b"EOF";

/// Handshake ids are ASCII decimal in a single write of at most this size.
const HANDSHAKE_BYTES: usize = 16;

/// First connect retry delay; doubled per attempt up to [`RETRY_CEILING`].
const RETRY_FLOOR: Duration = Duration::from_micros(1);
/// Upper bound on the per-attempt retry delay.
const RETRY_CEILING: Duration = Duration::from_millis(1);

/// Exchange protocol error. Any of these is fatal to the whole exchange.
#[derive(Debug)]
pub enum ExchangeError {
    /// The local listen address cannot be bound.
    Bind(io::Error),
    /// Accepting an inbound connection failed.
    Accept(io::Error),
    /// Sending or receiving a handshake id failed.
    Handshake(io::Error),
    /// A handshake id is not a peer of this roster.
    BadPeer(String),
    /// Receiving records failed after a retry.
    Read(io::Error),
    /// Streaming records or the sentinel failed.
    Write(io::Error),
    /// An inbound stream ended inside a record without a sentinel.
    Truncated,
    /// A protocol task stopped without reporting a result.
    Lost,
}

impl Error for ExchangeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            ExchangeError::Bind(err) => Some(err),
            ExchangeError::Accept(err) => Some(err),
            ExchangeError::Handshake(err) => Some(err),
            ExchangeError::BadPeer(_) => None,
            ExchangeError::Read(err) => Some(err),
            ExchangeError::Write(err) => Some(err),
            ExchangeError::Truncated => None,
            ExchangeError::Lost => None,
        }
    }
}

impl Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ExchangeError::Bind(err) => write!(f, "listen address not bindable: {}", err),
            ExchangeError::Accept(err) => write!(f, "inbound connection not accepted: {}", err),
            ExchangeError::Handshake(err) => write!(f, "handshake failed: {}", err),
            ExchangeError::BadPeer(id) => write!(f, "handshake id {:?} is not a roster peer", id),
            ExchangeError::Read(err) => write!(f, "record receive failed: {}", err),
            ExchangeError::Write(err) => write!(f, "record send failed: {}", err),
            ExchangeError::Truncated => write!(f, "inbound stream ended inside a record"),
            ExchangeError::Lost => write!(f, "protocol task stopped without a result"),
        }
    }
}

/// Runs one peer's side of the all-to-all exchange.
///
/// `buckets[i]` holds the outbound records owned by peer `i`, flat and
/// unframed; `buckets[local_id]` is never transmitted. Returns the byte
/// block received from every other peer, in arrival order, once every
/// outbound stream has drained as well.
pub async fn exchange(
    roster: &Roster,
    local_id: u32,
    buckets: Arc<Vec<Vec<u8>>>,
) -> Result<Vec<Vec<u8>>, ExchangeError> {
    let local = roster
        .get(local_id)
        .ok_or_else(|| ExchangeError::BadPeer(local_id.to_string()))?;
    let peer_count = roster.len();

    // bind before any outbound dial so peers dialing us can get through
    let listener = TcpListener::bind(local.addr())
        .await
        .map_err(ExchangeError::Bind)?;
    log::info!("peer {}: listening on {}", local_id, local.addr());

    let (inbox_tx, mut inbox_rx) = mpsc::channel(peer_count.max(2));
    let (done_tx, mut done_rx) = mpsc::channel(peer_count.max(2));

    for peer in roster.others(local_id) {
        let addr = peer.addr();
        let remote_id = peer.peer_id;
        let inbox_tx = inbox_tx.clone();
        tokio::spawn(async move {
            let result = receive_from(&addr, remote_id, local_id).await;
            let _ = inbox_tx.send(result).await;
        });
    }
    drop(inbox_tx);

    let outbound = buckets.clone();
    let accept_done_tx = done_tx.clone();
    tokio::spawn(async move {
        for _ in 0..peer_count - 1 {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let buckets = outbound.clone();
                    let done_tx = accept_done_tx.clone();
                    tokio::spawn(async move {
                        let result = send_bucket(stream, buckets).await;
                        let _ = done_tx.send(result).await;
                    });
                }
                Err(err) => {
                    let _ = accept_done_tx.send(Err(ExchangeError::Accept(err))).await;
                    return;
                }
            }
        }
    });
    drop(done_tx);

    // completion barrier: every inbound block and every sends-done signal
    let mut inbound = Vec::with_capacity(peer_count - 1);
    for _ in 0..peer_count - 1 {
        let block = inbox_rx.recv().await.ok_or(ExchangeError::Lost)??;
        inbound.push(block);
    }
    for _ in 0..peer_count - 1 {
        done_rx.recv().await.ok_or(ExchangeError::Lost)??;
    }

    log::info!("peer {}: exchange complete", local_id);
    return Ok(inbound);
}

/// Client side of one directed edge: dial `addr` until the peer is up,
/// announce the local id, then accumulate records until end-of-stream.
async fn receive_from(addr: &str, remote_id: u32, local_id: u32) -> Result<Vec<u8>, ExchangeError> {
    let mut stream = connect_with_retry(addr).await;
    log::debug!("peer {}: connected to peer {} at {}", local_id, remote_id, addr);

    stream
        .write_all(local_id.to_string().as_bytes())
        .await
        .map_err(ExchangeError::Handshake)?;

    let mut block = Vec::new();
    let mut buf = [0u8; RECORD_BYTES];
    loop {
        let filled = fill_record(&mut stream, &mut buf).await?;
        if filled == RECORD_BYTES {
            block.extend_from_slice(&buf);
            continue;
        }
        // a stream-level end without the sentinel is accepted as well
        if filled == 0 || buf[..filled].starts_with(SENTINEL) {
            break;
        }
        return Err(ExchangeError::Truncated);
    }

    log::debug!(
        "peer {}: received {} records from peer {}",
        local_id,
        block.len() / RECORD_BYTES,
        remote_id
    );
    return Ok(block);
}

/// Server side of one directed edge: read the caller's id, stream its
/// bucket record by record, then mark end-of-stream and close.
async fn send_bucket(mut stream: TcpStream, buckets: Arc<Vec<Vec<u8>>>) -> Result<(), ExchangeError> {
    let mut id_buf = [0u8; HANDSHAKE_BYTES];
    let n = stream.read(&mut id_buf).await.map_err(ExchangeError::Handshake)?;
    let remote_id = std::str::from_utf8(&id_buf[..n])
        .ok()
        .and_then(|id| id.parse::<usize>().ok())
        .filter(|&id| id < buckets.len())
        .ok_or_else(|| ExchangeError::BadPeer(String::from_utf8_lossy(&id_buf[..n]).into_owned()))?;

    let bucket = &buckets[remote_id];
    log::debug!("streaming {} records to peer {}", bucket.len() / RECORD_BYTES, remote_id);

    for chunk in bucket.chunks(RECORD_BYTES) {
        stream.write_all(chunk).await.map_err(ExchangeError::Write)?;
    }
    stream.write_all(SENTINEL).await.map_err(ExchangeError::Write)?;
    stream.shutdown().await.map_err(ExchangeError::Write)?;

    return Ok(());
}

/// Dials until the peer comes up. There is no deadline; the delay backs off
/// exponentially from [`RETRY_FLOOR`] to [`RETRY_CEILING`] per attempt.
async fn connect_with_retry(addr: &str) -> TcpStream {
    let mut delay = RETRY_FLOOR;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return stream,
            Err(err) => {
                log::trace!("connect to {} failed ({}), retrying", addr, err);
                time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_CEILING);
            }
        }
    }
}

/// Reads until a whole record is buffered or the stream ends, returning the
/// number of bytes read. One transient read failure is retried after a
/// short sleep; the second is fatal.
async fn fill_record(
    stream: &mut TcpStream,
    buf: &mut [u8; RECORD_BYTES],
) -> Result<usize, ExchangeError> {
    let mut filled = 0;
    let mut retried = false;
    while filled < RECORD_BYTES {
        match stream.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if !retried => {
                log::debug!("record receive failed ({}), retrying once", err);
                retried = true;
                time::sleep(RETRY_CEILING).await;
            }
            Err(err) => return Err(ExchangeError::Read(err)),
        }
    }
    return Ok(filled);
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::exchange;
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

    #[tokio::test]
    async fn test_single_peer_exchanges_nothing() {
        let roster = roster(&[24310]);
        let buckets = Arc::new(vec![record(b"a", 1)]);

        let inbound = exchange(&roster, 0, buckets).await.unwrap();
        assert!(inbound.is_empty());
    }

    #[tokio::test]
    async fn test_two_peers_swap_buckets() {
        let roster = roster(&[24311, 24312]);

        // peer 0 owes peer 1 one record and vice versa
        let buckets_0 = Arc::new(vec![record(b"keep0", 0), record(b"to1", 1)]);
        let buckets_1 = Arc::new(vec![record(b"to0", 2), record(b"keep1", 3)]);

        let roster_0 = roster.clone();
        let (from_0, from_1) = tokio::join!(
            exchange(&roster_0, 0, buckets_0),
            exchange(&roster, 1, buckets_1),
        );

        let inbound_0 = from_0.unwrap();
        let inbound_1 = from_1.unwrap();
        assert_eq!(inbound_0, vec![record(b"to0", 2)]);
        assert_eq!(inbound_1, vec![record(b"to1", 1)]);
    }

    #[tokio::test]
    async fn test_empty_buckets_still_complete() {
        let roster = roster(&[24321, 24322]);

        let buckets_0 = Arc::new(vec![Vec::new(), Vec::new()]);
        let buckets_1 = Arc::new(vec![Vec::new(), Vec::new()]);

        let roster_0 = roster.clone();
        let (from_0, from_1) = tokio::join!(
            exchange(&roster_0, 0, buckets_0),
            exchange(&roster, 1, buckets_1),
        );

        assert_eq!(from_0.unwrap(), vec![Vec::<u8>::new()]);
        assert_eq!(from_1.unwrap(), vec![Vec::<u8>::new()]);
    }

    #[tokio::test]
    async fn test_sentinel_prefixed_record_round_trips() {
        // a full record whose key begins with the sentinel bytes must not
        // terminate the stream early
        let roster = roster(&[24331, 24332]);

        let tricky = record(b"EOF", 0xaa);
        let buckets_0 = Arc::new(vec![Vec::new(), [tricky.clone(), record(b"x", 1)].concat()]);
        let buckets_1 = Arc::new(vec![Vec::new(), Vec::new()]);

        let roster_0 = roster.clone();
        let (from_0, from_1) = tokio::join!(
            exchange(&roster_0, 0, buckets_0),
            exchange(&roster, 1, buckets_1),
        );

        from_0.unwrap();
        let inbound_1 = from_1.unwrap();
        assert_eq!(inbound_1.len(), 1);
        assert_eq!(inbound_1[0].len(), 2 * RECORD_BYTES);
        assert_eq!(&inbound_1[0][..RECORD_BYTES], tricky.as_slice());
    }

    #[test]
    fn test_four_peers_all_to_all() {
        let ports = &[24341, 24342, 24343, 24344];
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let roster = roster(ports);

            // bucket for peer j from peer i carries one record keyed (i, j)
            let mut handles = Vec::new();
            for i in 0..4u32 {
                let roster = roster.clone();
                let buckets: Vec<Vec<u8>> =
                    (0..4).map(|j| record(&[i as u8, j as u8], i as u8)).collect();
                handles.push(tokio::spawn(async move {
                    exchange(&roster, i, Arc::new(buckets)).await
                }));
            }

            for (i, handle) in handles.into_iter().enumerate() {
                let mut inbound = handle.await.unwrap().unwrap();
                assert_eq!(inbound.len(), 3);
                // arrival order is unspecified
                inbound.sort();
                let senders: Vec<u8> = inbound.iter().map(|block| block[0]).collect();
                let mut expected: Vec<u8> = (0..4u8).filter(|&s| s != i as u8).collect();
                expected.sort();
                assert_eq!(senders, expected);
                for block in &inbound {
                    assert_eq!(block[1], i as u8, "bucket routed to the wrong peer");
                }
            }
        });
    }
}
