//! # BitTorrent Peer Session
//!
//! This module implements the client side of the peer wire protocol for a
//! single connection: dialing, the handshake, choke state, the peer's piece
//! availability, and length-framed message I/O.
//!
//! ## Connection States
//!
//! A session starts choked. The peer signals willingness to serve requests
//! with UNCHOKE; the worker only pipelines requests while unchoked.
//!
//! ## Bitfield Encoding
//!
//! The bitfield is a compact representation of piece availability:
//!
//! - Each byte represents 8 pieces
//! - Bit 7 (MSB) of byte 0 = piece index 0, bit 0 (LSB) = piece index 7
//! - Set bits indicate available pieces
//!
//! ## Timeouts
//!
//! Dialing is bounded to 3 seconds and the handshake round-trip to 5; both
//! are cleared once the remote info hash checks out. Longer per-piece
//! deadlines are applied by the worker for the duration of each download.

use std::io::{Cursor, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::Duration;

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

use crate::handshake::Handshake;
use crate::message::{self, Message, MESSAGE_INTERESTED, MESSAGE_KEEPALIVE};
use crate::peer::Peer;

const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

// Upper bound on a single frame; the largest legitimate messages are
// bitfields, and even a million-piece torrent stays far below this.
const MAX_MESSAGE_LEN: usize = 1 << 20;

/// Compact per-piece availability map for one peer.
#[derive(Default, Debug)]
pub struct Bitfield(Vec<u8>);

impl Bitfield {
    pub fn new() -> Bitfield {
        Bitfield::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Bitfield {
        Bitfield(bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the piece at `index` is marked available.
    ///
    /// Out-of-range indices are simply absent.
    pub fn has_piece(&self, index: u32) -> bool {
        let byte_index = (index / 8) as usize;
        let offset = (index % 8) as u8;

        if byte_index >= self.0.len() {
            return false;
        }
        (self.0[byte_index] >> (7 - offset)) & 1 != 0
    }

    /// Mark the piece at `index` available, growing the map if needed.
    pub fn set_piece(&mut self, index: u32) {
        let byte_index = (index / 8) as usize;
        let offset = (index % 8) as u8;

        if byte_index >= self.0.len() {
            self.0.resize(byte_index + 1, 0);
        }
        self.0[byte_index] |= 1 << (7 - offset);
    }
}

/// A connection to a remote BitTorrent peer.
///
/// One `Client` corresponds to one peer in the swarm and carries all protocol
/// state for that connection. It is driven by a single worker thread.
pub struct Client {
    /// Information about the remote peer (IP, port, ID)
    peer: Peer,
    /// 20-byte unique identifier for this client instance
    peer_id: [u8; 20],
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: [u8; 20],
    /// TCP stream connection to the peer
    conn: TcpStream,
    /// Pieces the peer has announced, via BITFIELD and HAVE
    bitfield: Bitfield,
    /// Whether the peer has choked this client
    choked: bool,
}

impl Client {
    /// Establish a TCP connection to a peer.
    ///
    /// The dial is bounded by a 3-second timeout. The session starts choked
    /// with an empty bitfield.
    pub fn connect(peer: Peer, peer_id: [u8; 20], info_hash: [u8; 20]) -> Result<Client> {
        let peer_socket = SocketAddr::new(IpAddr::V4(peer.ip), peer.port);
        let conn = TcpStream::connect_timeout(&peer_socket, DIAL_TIMEOUT)
            .map_err(|e| anyhow!("could not connect to peer {}: {}", peer, e))?;

        info!("Connected to peer {}", peer);

        Ok(Client {
            peer,
            peer_id,
            info_hash,
            conn,
            bitfield: Bitfield::new(),
            choked: true,
        })
    }

    /// Perform the handshake with the remote peer.
    ///
    /// Sends our handshake, reads the peer's, and rejects the connection if
    /// the remote info hash differs from ours. The remote peer id is not
    /// checked. A 5-second deadline covers the round-trip and is cleared
    /// once the hash is validated.
    pub fn handshake(&mut self) -> Result<()> {
        self.set_timeouts(Some(HANDSHAKE_TIMEOUT))?;

        let handshake = Handshake::new(self.info_hash, self.peer_id);
        self.conn
            .write_all(&handshake.serialize())
            .map_err(|_| anyhow!("could not send handshake to peer"))?;

        let remote = Handshake::read(&mut self.conn)?;
        if remote.info_hash != self.info_hash {
            return Err(anyhow!("info hash mismatch in handshake from peer"));
        }

        self.set_timeouts(None)?;

        Ok(())
    }

    /// Set or clear read and write timeouts on the connection.
    pub fn set_timeouts(&self, timeout: Option<Duration>) -> Result<()> {
        self.conn
            .set_write_timeout(timeout)
            .map_err(|_| anyhow!("could not set write timeout"))?;
        self.conn
            .set_read_timeout(timeout)
            .map_err(|_| anyhow!("could not set read timeout"))?;
        Ok(())
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn set_choked(&mut self, choked: bool) {
        self.choked = choked;
    }

    /// Whether the peer has announced any pieces yet.
    pub fn knows_bitfield(&self) -> bool {
        !self.bitfield.is_empty()
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has_piece(index)
    }

    /// Record a HAVE announcement in the peer's bitfield.
    pub fn record_have(&mut self, index: u32) {
        self.bitfield.set_piece(index);
    }

    /// Replace the peer's bitfield with the payload of a BITFIELD message.
    pub fn set_bitfield(&mut self, bytes: Vec<u8>) {
        self.bitfield = Bitfield::from_bytes(bytes);
    }

    /// Read one length-framed message from the peer.
    ///
    /// A zero length prefix is a keep-alive and consumes no further bytes.
    /// Otherwise the full body is drained with `read_exact` before parsing.
    pub fn read_message(&mut self) -> Result<Message> {
        let mut len_buf = [0u8; 4];
        self.conn
            .read_exact(&mut len_buf)
            .map_err(|_| anyhow!("could not read message length from peer"))?;

        let mut cursor = Cursor::new(len_buf);
        let message_len = cursor.read_u32::<BigEndian>()? as usize;

        // Keep-alive
        if message_len == 0 {
            trace!("Receive KEEP_ALIVE from peer {}", self.peer);
            return Ok(Message::new(MESSAGE_KEEPALIVE));
        }

        if message_len > MAX_MESSAGE_LEN {
            return Err(anyhow!("oversized message frame from peer"));
        }

        let mut message_buf = vec![0u8; message_len];
        self.conn
            .read_exact(&mut message_buf)
            .map_err(|_| anyhow!("could not read message from peer"))?;

        message::deserialize_message(&message_buf)
    }

    fn send_message(&mut self, message: &Message) -> Result<()> {
        let encoded = message.serialize()?;
        self.conn
            .write_all(&encoded)
            .map_err(|_| anyhow!("could not send message to peer"))?;
        Ok(())
    }

    /// Announce interest in downloading from this peer.
    pub fn send_interested(&mut self) -> Result<()> {
        debug!("Send INTERESTED to peer {}", self.peer);
        self.send_message(&Message::new(MESSAGE_INTERESTED))
    }

    /// Request `length` bytes at offset `begin` within piece `index`.
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        trace!(
            "Send REQUEST for piece {} [{}:{}] to peer {}",
            index,
            begin,
            begin + length,
            self.peer
        );
        let message = message::format_request(index, begin, length)?;
        self.send_message(&message)
    }
}
