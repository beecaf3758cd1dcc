//! # BitTorrent Piece Management
//!
//! Pieces are the verification units of a torrent. `PieceWork` is the unit
//! handed to a worker over the work channel; `PieceResult` is what comes back
//! for hash verification and writing. A work item is owned exclusively by one
//! worker while in flight and is pushed back onto the queue on failure.

/// A single piece to download, as queued on the work channel.
#[derive(Clone, Debug)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Expected SHA-1 hash of the piece data
    pub hash: [u8; 20],
    /// Length of the piece in bytes
    pub length: u32,
}

/// A fully downloaded piece, awaiting verification and storage.
#[derive(Debug)]
pub struct PieceResult {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Complete piece data buffer
    pub buf: Vec<u8>,
}

impl PieceWork {
    pub fn new(index: u32, hash: [u8; 20], length: u32) -> PieceWork {
        PieceWork {
            index,
            hash,
            length,
        }
    }
}

impl PieceResult {
    pub fn new(index: u32, buf: Vec<u8>) -> PieceResult {
        PieceResult { index, buf }
    }
}
