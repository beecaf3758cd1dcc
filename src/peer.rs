//! # BitTorrent Peer Information
//!
//! Peers are discovered through tracker responses in the compact format:
//! 6-byte entries, an IPv4 address in network byte order followed by a
//! big-endian port.

use std::fmt;
use std::io::Cursor;
use std::net::Ipv4Addr;

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

const PEER_SIZE: usize = 6;

/// A BitTorrent peer in the swarm.
#[derive(Clone, Debug)]
pub struct Peer {
    /// Unique identifier assigned to this peer for internal tracking
    pub id: u32,
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port number for connecting to the peer
    pub port: u16,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parse a compact peer list from a tracker response.
///
/// Returns an error if the blob length is not a multiple of 6 bytes.
pub fn parse_compact_peers(blob: &[u8]) -> Result<Vec<Peer>> {
    if !blob.len().is_multiple_of(PEER_SIZE) {
        return Err(anyhow!("received malformed compact peer list from tracker"));
    }

    let nb_peers = blob.len() / PEER_SIZE;
    let mut peers = Vec::with_capacity(nb_peers);

    for i in 0..nb_peers {
        let offset = i * PEER_SIZE;
        let ip = Ipv4Addr::new(
            blob[offset],
            blob[offset + 1],
            blob[offset + 2],
            blob[offset + 3],
        );

        let mut port_cursor = Cursor::new(&blob[offset + 4..offset + 6]);
        let port = port_cursor.read_u16::<BigEndian>()?;

        peers.push(Peer {
            id: i as u32,
            ip,
            port,
        });
    }

    Ok(peers)
}
