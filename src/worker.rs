//! # BitTorrent Worker Thread
//!
//! One worker per peer. A worker connects, handshakes, announces interest,
//! then pulls `PieceWork` off the shared work channel and downloads each
//! piece as a sequence of 16 KiB block requests, keeping up to `MAX_BACKLOG`
//! blocks in flight.
//!
//! ## Failure Handling
//!
//! Any error while holding a piece pushes that piece back onto the work
//! channel before the worker terminates, so another peer can pick it up.
//! Hash verification happens in the coordinator; the worker only reassembles
//! bytes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::client::Client;
use crate::message::{
    self, MESSAGE_BITFIELD, MESSAGE_CHOKE, MESSAGE_HAVE, MESSAGE_KEEPALIVE, MESSAGE_PIECE,
    MESSAGE_UNCHOKE,
};
use crate::peer::Peer;
use crate::piece::{PieceResult, PieceWork};
use crate::status::{Activity, StatusCell};

/// Standard block size for piece downloads (16 KiB).
pub const BLOCK_SIZE: u32 = 16384;

/// Maximum number of unanswered block requests kept in flight per peer.
pub const MAX_BACKLOG: u32 = 10;

// Deadline for downloading a single piece
const PIECE_TIMEOUT: Duration = Duration::from_secs(30);

// How often an idle worker checks whether the queue has been closed.
// Workers hold requeue senders, so the channel itself never disconnects
// while any of them is alive; closure is signalled out of band.
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Manages downloading from a single BitTorrent peer.
pub struct Worker {
    /// Information about the remote peer (IP, port, ID)
    peer: Peer,
    /// 20-byte unique identifier for this client instance
    peer_id: [u8; 20],
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: [u8; 20],
    /// Requeue handle for failed or unserveable pieces
    work_tx: Sender<PieceWork>,
    /// Shared work channel the worker draws pieces from
    work_rx: Receiver<PieceWork>,
    /// Channel for completed pieces, consumed by the coordinator
    result_tx: Sender<PieceResult>,
    /// Set by the coordinator once every piece is verified and written
    queue_closed: Arc<AtomicBool>,
    /// Status cell read by the progress reporter
    status: Arc<StatusCell>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer: Peer,
        peer_id: [u8; 20],
        info_hash: [u8; 20],
        work_tx: Sender<PieceWork>,
        work_rx: Receiver<PieceWork>,
        result_tx: Sender<PieceResult>,
        queue_closed: Arc<AtomicBool>,
        status: Arc<StatusCell>,
    ) -> Worker {
        Worker {
            peer,
            peer_id,
            info_hash,
            work_tx,
            work_rx,
            result_tx,
            queue_closed,
            status,
        }
    }

    /// Run the worker until the work channel closes or the session fails.
    pub fn run(self) {
        self.status.set_activity(Activity::Connecting);
        let mut client =
            match Client::connect(self.peer.clone(), self.peer_id, self.info_hash) {
                Ok(client) => client,
                Err(e) => {
                    debug!("[{}] dial failed: {}", self.peer, e);
                    self.status.set_activity(Activity::Stopped);
                    return;
                }
            };

        self.status.set_activity(Activity::Handshaking);
        if let Err(e) = client.handshake() {
            debug!("[{}] handshake failed: {}", self.peer, e);
            self.status.set_activity(Activity::Stopped);
            return;
        }

        // Fire and forget; requests wait for UNCHOKE, not for a reply to this
        if let Err(e) = client.send_interested() {
            debug!("[{}] could not announce interest: {}", self.peer, e);
            self.status.set_activity(Activity::Stopped);
            return;
        }

        info!("[{}] handshake complete", self.peer);

        loop {
            let piece_work = match self.work_rx.recv_timeout(QUEUE_POLL_INTERVAL) {
                Ok(piece_work) => piece_work,
                Err(RecvTimeoutError::Timeout) => {
                    if self.queue_closed.load(Ordering::Relaxed) {
                        // All pieces are accounted for
                        debug!("[{}] work queue closed, exiting", self.peer);
                        self.status.set_activity(Activity::Stopped);
                        return;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("[{}] work channel disconnected, exiting", self.peer);
                    self.status.set_activity(Activity::Stopped);
                    return;
                }
            };

            // Skip pieces the peer has told us it does not have
            if client.knows_bitfield() && !client.has_piece(piece_work.index) {
                if self.work_tx.send(piece_work).is_err() {
                    self.status.set_activity(Activity::Stopped);
                    return;
                }
                continue;
            }

            self.status.set_downloading(piece_work.index);

            match self.download_piece(&mut client, &piece_work) {
                Ok(buf) => {
                    if self
                        .result_tx
                        .send(PieceResult::new(piece_work.index, buf))
                        .is_err()
                    {
                        self.status.set_activity(Activity::Stopped);
                        return;
                    }
                    self.status.set_activity(Activity::Idle);
                }
                Err(e) => {
                    warn!("[{}] piece {} failed: {}", self.peer, piece_work.index, e);
                    // Hand the piece back so another worker can serve it
                    let _ = self.work_tx.send(piece_work);
                    self.status.set_activity(Activity::Stopped);
                    return;
                }
            }
        }
    }

    /// Download a single piece with pipelined block requests.
    ///
    /// Keeps at most `MAX_BACKLOG * BLOCK_SIZE` requested-but-unreceived
    /// bytes in flight, and pauses the pipeline while choked.
    fn download_piece(&self, client: &mut Client, piece_work: &PieceWork) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; piece_work.length as usize];
        let mut downloaded: u32 = 0;
        let mut requested: u32 = 0;

        client.set_timeouts(Some(PIECE_TIMEOUT))?;

        while downloaded < piece_work.length {
            if !client.is_choked() {
                while requested < piece_work.length
                    && requested.saturating_sub(downloaded) < MAX_BACKLOG * BLOCK_SIZE
                {
                    let block_size = BLOCK_SIZE.min(piece_work.length - requested);
                    client.send_request(piece_work.index, requested, block_size)?;
                    requested += block_size;
                }
            }

            let message = client.read_message()?;
            match message.id {
                MESSAGE_KEEPALIVE => {}
                MESSAGE_CHOKE => {
                    debug!("[{}] choked", self.peer);
                    client.set_choked(true);
                }
                MESSAGE_UNCHOKE => {
                    debug!("[{}] unchoked", self.peer);
                    client.set_choked(false);
                }
                MESSAGE_HAVE => client.record_have(message::parse_have(&message)?),
                MESSAGE_BITFIELD => client.set_bitfield(message.payload),
                MESSAGE_PIECE => {
                    downloaded += message::parse_piece(&message, piece_work.index, &mut buf)?;
                }
                other => trace!("[{}] ignoring message id {}", self.peer, other),
            }
        }

        client.set_timeouts(None)?;

        debug!("[{}] downloaded piece {}", self.peer, piece_work.index);

        Ok(buf)
    }
}
