//! Peer roster: the fixed set of sort peers and their listen addresses.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::Path;

use serde::Deserialize;

/// Roster loading error.
#[derive(Debug)]
pub enum RosterError {
    /// The roster file cannot be read.
    Missing(io::Error),
    /// The roster file is not valid YAML of the expected shape.
    Malformed(serde_yaml::Error),
    /// The roster parsed but its contents are unusable.
    Invalid(String),
    /// Prefix partitioning requires a power-of-two peer count.
    PeerCountNotPowerOfTwo(usize),
}

impl Error for RosterError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            RosterError::Missing(err) => Some(err),
            RosterError::Malformed(err) => Some(err),
            RosterError::Invalid(_) => None,
            RosterError::PeerCountNotPowerOfTwo(_) => None,
        }
    }
}

impl Display for RosterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            RosterError::Missing(err) => write!(f, "roster file not readable: {}", err),
            RosterError::Malformed(err) => write!(f, "roster file not parsable: {}", err),
            RosterError::Invalid(reason) => write!(f, "roster invalid: {}", reason),
            RosterError::PeerCountNotPowerOfTwo(count) => {
                write!(f, "peer count {} is not a power of two", count)
            }
        }
    }
}

/// One participant: its id and the address it listens on.
#[derive(Debug, Clone, Deserialize)]
pub struct Peer {
    pub peer_id: u32,
    pub host: String,
    pub port: String,
}

impl Peer {
    /// Returns the peer's `host:port` dial/listen address.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The ordered list of all peers, constant for the life of a run.
///
/// A loaded roster is always valid: non-empty, peer ids are exactly
/// `0..len()` with no duplicates, and the count is a power of two.
#[derive(Debug, Clone, Deserialize)]
pub struct Roster {
    peers: Vec<Peer>,
}

impl Roster {
    /// Loads and validates a roster from a YAML file.
    pub fn load(path: &Path) -> Result<Self, RosterError> {
        let text = fs::read_to_string(path).map_err(RosterError::Missing)?;
        let roster: Roster = serde_yaml::from_str(&text).map_err(RosterError::Malformed)?;
        roster.validate()?;
        return Ok(roster);
    }

    /// Builds a validated roster from an in-memory peer list.
    pub fn from_peers(peers: Vec<Peer>) -> Result<Self, RosterError> {
        let roster = Roster { peers };
        roster.validate()?;
        return Ok(roster);
    }

    fn validate(&self) -> Result<(), RosterError> {
        let count = self.peers.len();
        if count == 0 {
            return Err(RosterError::Invalid("roster lists no peers".to_string()));
        }
        if !count.is_power_of_two() {
            return Err(RosterError::PeerCountNotPowerOfTwo(count));
        }

        let mut seen = vec![false; count];
        for peer in &self.peers {
            let id = peer.peer_id as usize;
            if id >= count {
                return Err(RosterError::Invalid(format!(
                    "peer id {} out of range for {} peers",
                    peer.peer_id, count
                )));
            }
            if seen[id] {
                return Err(RosterError::Invalid(format!("duplicate peer id {}", peer.peer_id)));
            }
            seen[id] = true;
        }

        return Ok(());
    }

    /// Number of peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Looks up a peer by id.
    pub fn get(&self, peer_id: u32) -> Option<&Peer> {
        self.peers.iter().find(|peer| peer.peer_id == peer_id)
    }

    /// Iterates over every peer except `peer_id`, in roster order.
    pub fn others(&self, peer_id: u32) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(move |peer| peer.peer_id != peer_id)
    }
}
