//! # BitTorrent Peer Wire Messages
//!
//! Every message after the handshake follows the same framing:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length prefix**: 4 bytes (big-endian u32), length of ID + payload
//! - **Message ID**: 1 byte
//! - **Payload**: `length - 1` bytes
//!
//! A frame with length 0 is a keep-alive; it carries no ID and no payload and
//! is represented here by a sentinel ID outside the protocol's range.

use std::io::Cursor;

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

pub type MessageId = u8;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
pub const MESSAGE_CANCEL: MessageId = 8;
/// Sentinel for a length-zero frame (keep-alive carries no ID on the wire).
pub const MESSAGE_KEEPALIVE: MessageId = 255;

#[derive(Debug)]
pub struct Message {
    /// Message type identifier
    pub id: MessageId,
    /// Message payload data
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a new message without a payload.
    pub fn new(id: MessageId) -> Message {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a new message with a payload.
    pub fn new_with_payload(id: MessageId, payload: Vec<u8>) -> Message {
        Message { id, payload }
    }

    /// Serialize message with its length prefix.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let message_len = 1 + self.payload.len();

        let mut serialized: Vec<u8> = Vec::with_capacity(4 + message_len);
        serialized.write_u32::<BigEndian>(message_len as u32)?;
        serialized.push(self.id);
        serialized.extend_from_slice(&self.payload);

        Ok(serialized)
    }
}

/// Deserialize a message body (everything after the length prefix).
pub fn deserialize_message(buf: &[u8]) -> Result<Message> {
    let id = *buf
        .first()
        .ok_or_else(|| anyhow!("empty message body from peer"))?;
    Ok(Message::new_with_payload(id, buf[1..].to_vec()))
}

/// Build a REQUEST for `length` bytes at offset `begin` of piece `index`.
pub fn format_request(index: u32, begin: u32, length: u32) -> Result<Message> {
    let mut payload: Vec<u8> = Vec::with_capacity(12);
    payload.write_u32::<BigEndian>(index)?;
    payload.write_u32::<BigEndian>(begin)?;
    payload.write_u32::<BigEndian>(length)?;

    Ok(Message::new_with_payload(MESSAGE_REQUEST, payload))
}

/// Extract the piece index announced by a HAVE message.
pub fn parse_have(message: &Message) -> Result<u32> {
    if message.id != MESSAGE_HAVE || message.payload.len() != 4 {
        return Err(anyhow!("received invalid HAVE message from peer"));
    }

    let mut cursor = Cursor::new(&message.payload);
    Ok(cursor.read_u32::<BigEndian>()?)
}

/// Copy the block carried by a PIECE message into the piece buffer.
///
/// Validates that the message targets the piece being downloaded and that
/// the block fits inside the buffer, then copies it at its `begin` offset.
/// Returns the block length.
pub fn parse_piece(message: &Message, index: u32, buf: &mut [u8]) -> Result<u32> {
    if message.id != MESSAGE_PIECE {
        return Err(anyhow!("received invalid PIECE message from peer"));
    }
    if message.payload.len() < 8 {
        return Err(anyhow!("received PIECE message with short payload"));
    }

    let mut cursor = Cursor::new(&message.payload[..8]);
    let piece_index = cursor.read_u32::<BigEndian>()?;
    if piece_index != index {
        return Err(anyhow!(
            "received block for piece {} while downloading piece {}",
            piece_index,
            index
        ));
    }

    let begin = cursor.read_u32::<BigEndian>()? as usize;
    let block = &message.payload[8..];
    if begin + block.len() > buf.len() {
        return Err(anyhow!("received block outside piece bounds from peer"));
    }

    buf[begin..begin + block.len()].copy_from_slice(block);

    Ok(block.len() as u32)
}
