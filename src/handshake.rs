//! # BitTorrent Handshake Protocol
//!
//! The handshake is the first exchange on a peer connection, a fixed 68-byte
//! message for the standard protocol string:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte, length of the protocol string (19)
//! - **pstr**: protocol identifier ("BitTorrent protocol")
//! - **reserved**: 8 bytes, all zeros (extension negotiation)
//! - **info_hash**: 20 bytes, SHA-1 of the torrent's info dictionary
//! - **peer_id**: 20 bytes, unique identifier for the peer
//!
//! The info hash keeps peers from joining the wrong swarm; validating it is
//! the caller's job after reading the remote handshake.

use std::io::Read;

use anyhow::{anyhow, Result};

const PROTOCOL_ID: &str = "BitTorrent protocol";

/// A BitTorrent handshake message.
pub struct Handshake {
    /// Protocol identifier bytes ("BitTorrent protocol")
    pub pstr: Vec<u8>,
    /// 8 reserved bytes for protocol extensions (all zeros)
    pub reserved: [u8; 8],
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: [u8; 20],
    /// 20-byte unique identifier for the peer
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Build a handshake for the standard protocol string.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake {
            pstr: PROTOCOL_ID.as_bytes().to_vec(),
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serialize the handshake for transmission.
    ///
    /// Total size is `49 + pstrlen` bytes, 68 for the standard protocol.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(49 + self.pstr.len());
        buf.push(self.pstr.len() as u8);
        buf.extend_from_slice(&self.pstr);
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);
        buf
    }

    /// Read a handshake from a stream.
    ///
    /// The first byte announces the protocol string length; the remaining
    /// `48 + pstrlen` bytes are read in full before parsing. A zero length is
    /// rejected.
    pub fn read(reader: &mut impl Read) -> Result<Handshake> {
        let mut len_buf = [0u8; 1];
        reader
            .read_exact(&mut len_buf)
            .map_err(|_| anyhow!("could not read handshake length from peer"))?;

        let pstrlen = len_buf[0] as usize;
        if pstrlen == 0 {
            return Err(anyhow!("invalid handshake length received from peer"));
        }

        let mut buf = vec![0u8; pstrlen + 48];
        reader
            .read_exact(&mut buf)
            .map_err(|_| anyhow!("could not read handshake from peer"))?;

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[pstrlen..pstrlen + 8]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[pstrlen + 8..pstrlen + 28]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[pstrlen + 28..pstrlen + 48]);

        Ok(Handshake {
            pstr: buf[..pstrlen].to_vec(),
            reserved,
            info_hash,
            peer_id,
        })
    }
}
