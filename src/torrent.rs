//! # BitTorrent Torrent Management
//!
//! This module handles torrent file parsing, tracker communication, and
//! download coordination, from metainfo bytes to a verified file on disk.
//!
//! ## Torrent File Format
//!
//! Torrent files are bencoded dictionaries:
//!
//! - **announce** / **announce-list**: tracker URLs for peer discovery
//! - **info**: dictionary with file information and piece hashes
//!   - **name**: suggested filename
//!   - **piece length**: size of each piece (except possibly the last)
//!   - **pieces**: concatenated 20-byte SHA-1 hashes, one per piece
//!   - **length** or **files**: single-file size, or per-file sizes
//!
//! The info hash identifying the torrent is the SHA-1 of the verbatim bytes
//! of the `info` value in the original file, which the decoder captures as a
//! span. Multi-file torrents are downloaded as one concatenated file.
//!
//! ## Download Coordination
//!
//! 1. Plan the piece list and seed the work channel with every piece
//! 2. Spawn one worker thread per peer
//! 3. Receive completed pieces, verify each SHA-1, requeue on mismatch
//! 4. Write verified pieces at their byte offset in the output file
//!
//! The coordinator is the only writer of the output file, and each piece's
//! byte range is written exactly once. If every worker dies while pieces are
//! still outstanding, the result channel disconnects and the download fails
//! instead of hanging.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use crossbeam_channel::{bounded, unbounded};
use rand::seq::SliceRandom;
use rand::Rng;
use url::Url;

use crate::bencode::{self, DecodeError, Decoder, Value};
use crate::peer::{self, Peer};
use crate::piece::{PieceResult, PieceWork};
use crate::status::{Reporter, StatusCell};
use crate::worker::Worker;

// Default port reported to trackers
const PORT: u16 = 6881;
// Size of SHA-1 hash in bytes
const SHA1_HASH_SIZE: usize = 20;

/// A parsed torrent, ready for peer discovery and downloading.
#[derive(Debug)]
pub struct Torrent {
    /// Tracker tiers for peer discovery (each tier is a list of URLs)
    tiers: Vec<Vec<String>>,
    /// 20-byte SHA-1 hash of the bencoded info dictionary
    info_hash: [u8; 20],
    /// One 20-byte SHA-1 hash per piece
    pieces_hashes: Vec<[u8; 20]>,
    /// Size of each piece in bytes (except possibly the last)
    piece_length: u32,
    /// Total size of the content in bytes
    length: u64,
    /// Suggested filename from torrent metadata
    name: String,
    /// 20-byte unique identifier for this client instance
    peer_id: [u8; 20],
}

impl Torrent {
    /// Parse a torrent file from disk.
    pub fn open(filepath: &Path) -> Result<Torrent> {
        let buf = fs::read(filepath).map_err(|_| anyhow!("could not read torrent file"))?;
        Torrent::from_bytes(&buf)
    }

    /// Parse a torrent from raw metainfo bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Torrent> {
        let mut decoder = Decoder::new(buf);
        let root = decoder
            .decode()
            .map_err(|e| anyhow!("could not decode torrent: {}", e))?;
        if root.as_dict().is_none() {
            return Err(anyhow!("torrent is not a bencoded dictionary"));
        }

        // Collect tracker tiers, preferring announce-list per BEP 12
        let mut tiers: Vec<Vec<String>> = Vec::new();
        if let Some(tier_list) = root.get(b"announce-list").and_then(Value::as_list) {
            for tier in tier_list {
                let urls: Vec<String> = tier
                    .as_list()
                    .unwrap_or(&[])
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect();
                if !urls.is_empty() {
                    tiers.push(urls);
                }
            }
        }
        if tiers.is_empty() {
            match root.get(b"announce").and_then(Value::as_str) {
                Some(announce) => tiers.push(vec![announce.to_owned()]),
                None => return Err(anyhow!("torrent has no announce or announce-list")),
            }
        }
        // Shuffle each tier as per BEP 12
        let mut rng = rand::thread_rng();
        for tier in &mut tiers {
            tier.shuffle(&mut rng);
        }

        let info = root
            .get(b"info")
            .filter(|value| value.as_dict().is_some())
            .ok_or(DecodeError::MissingInfo)?;

        // The info hash comes from the bytes we saw, not from what we rebuild
        let info_span = decoder.info_span().ok_or(DecodeError::MissingInfo)?;
        let mut hasher = Sha1::new();
        hasher.update(&buf[info_span]);
        let info_hash = hasher.finish();

        let name = info
            .get(b"name")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("torrent info has no name"))?
            .to_owned();

        let piece_length = info
            .get(b"piece length")
            .and_then(Value::as_int)
            .filter(|&n| n > 0 && n <= u32::MAX as i64)
            .ok_or_else(|| anyhow!("torrent info has an invalid piece length"))?
            as u32;

        let pieces = info
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| anyhow!("torrent info has no pieces"))?;
        if !pieces.len().is_multiple_of(SHA1_HASH_SIZE) {
            return Err(anyhow!("torrent is invalid"));
        }
        let pieces_hashes: Vec<[u8; 20]> = pieces
            .chunks_exact(SHA1_HASH_SIZE)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        // Single-file torrents carry a length; multi-file torrents a file list
        let length: u64 = if let Some(n) = info.get(b"length").and_then(Value::as_int) {
            if n < 0 {
                return Err(anyhow!("torrent is invalid"));
            }
            n as u64
        } else if let Some(files) = info.get(b"files").and_then(Value::as_list) {
            if files.is_empty() {
                return Err(anyhow!("torrent file list is empty"));
            }
            let mut total: u64 = 0;
            for file in files {
                let file_length = file
                    .get(b"length")
                    .and_then(Value::as_int)
                    .filter(|&n| n >= 0)
                    .ok_or_else(|| anyhow!("torrent file entry has an invalid length"))?;
                total += file_length as u64;
            }
            total
        } else {
            return Err(anyhow!("torrent info has no length or files"));
        };

        Ok(Torrent {
            tiers,
            info_hash,
            pieces_hashes,
            piece_length,
            length,
            name,
            peer_id: generate_peer_id(),
        })
    }

    /// Returns the suggested filename from the torrent metadata.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the torrent's 20-byte info hash.
    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    /// Returns the total content length in bytes.
    pub fn total_length(&self) -> u64 {
        self.length
    }

    /// Plan the full piece list with expected hashes and lengths.
    pub fn piece_list(&self) -> Vec<PieceWork> {
        self.pieces_hashes
            .iter()
            .enumerate()
            .map(|(index, hash)| {
                let index = index as u32;
                PieceWork::new(index, *hash, self.piece_length_at(index))
            })
            .collect()
    }

    /// Length of the piece at `index`; only the last piece may be short.
    fn piece_length_at(&self, index: u32) -> u32 {
        let begin = index as u64 * self.piece_length as u64;
        let mut end = begin + self.piece_length as u64;

        // Prevent unbounded values; an oversized pieces blob yields
        // zero-length trailing pieces rather than underflow
        if end > self.length {
            end = self.length;
        }

        end.saturating_sub(begin) as u32
    }

    /// Request peers from all trackers.
    ///
    /// Queries every unique tracker URL across the tiers in parallel, merges
    /// the compact peer lists, and deduplicates by address. Fails only if no
    /// tracker produced any peers, surfacing the first tracker failure.
    pub fn request_peers(&self) -> Result<Vec<Peer>> {
        // Flatten all tiers into a unique list of tracker URLs
        let mut seen = HashSet::new();
        let mut tracker_urls: Vec<String> = Vec::new();
        for tier in &self.tiers {
            for tracker_url in tier {
                if seen.insert(tracker_url.clone()) {
                    tracker_urls.push(tracker_url.clone());
                }
            }
        }
        if tracker_urls.is_empty() {
            return Err(anyhow!("no tracker URLs available"));
        }

        // Query all trackers in parallel
        let mut handles = Vec::new();
        for tracker_url in tracker_urls {
            match self.build_tracker_url(&tracker_url) {
                Ok(announce_url) => {
                    handles.push(thread::spawn(move || announce_tracker(&announce_url)));
                }
                Err(e) => warn!("skipping tracker {}: {}", tracker_url, e),
            }
        }

        let mut all_peers: Vec<Peer> = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        for handle in handles {
            match handle.join() {
                Ok(Ok(blob)) => match peer::parse_compact_peers(&blob) {
                    Ok(mut peers) => all_peers.append(&mut peers),
                    Err(e) => failures.push(e.to_string()),
                },
                Ok(Err(e)) => failures.push(e.to_string()),
                Err(_) => failures.push("tracker query thread panicked".to_string()),
            }
        }

        if all_peers.is_empty() {
            return match failures.into_iter().next() {
                Some(reason) => Err(anyhow!("could not get peers from any tracker: {}", reason)),
                None => Err(anyhow!("could not get peers from any tracker")),
            };
        }

        // Deduplicate peers by (ip, port) and assign sequential ids
        let mut unique = HashSet::new();
        let mut deduped: Vec<Peer> = Vec::new();
        for peer in all_peers {
            if unique.insert((peer.ip, peer.port)) {
                deduped.push(peer);
            }
        }
        for (i, peer) in deduped.iter_mut().enumerate() {
            peer.id = i as u32;
        }

        Ok(deduped)
    }

    /// Build the announce URL for one tracker.
    fn build_tracker_url(&self, announce: &str) -> Result<String> {
        /// Each byte is encoded as %XX where XX is the hexadecimal representation
        fn percent_encode_binary(data: &[u8]) -> String {
            const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
            let mut encoded = String::with_capacity(data.len() * 3);

            for &byte in data {
                encoded.push('%');
                encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
                encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
            }

            encoded
        }

        // Parse tracker URL from torrent
        let base_url =
            Url::parse(announce).map_err(|_| anyhow!("could not parse tracker url"))?;

        // Build query string manually to keep the binary fields byte-exact
        let query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1&event=started",
            percent_encode_binary(&self.info_hash),
            percent_encode_binary(&self.peer_id),
            PORT,
            self.length
        );

        let mut announce_url = base_url.to_string();
        if announce_url.contains('?') {
            announce_url.push('&');
        } else {
            announce_url.push('?');
        }
        announce_url.push_str(&query);

        Ok(announce_url)
    }

    /// Download the torrent to `output`.
    ///
    /// Spawns one worker per peer and runs the coordinator loop on the
    /// calling thread until every piece has been verified and written.
    pub fn download(&self, peers: &[Peer], output: &Path) -> Result<()> {
        let pieces = self.piece_list();

        println!("Downloading {:?} ({} pieces)", self.name, pieces.len());

        // Every piece lives in exactly one place (queue, worker, or disk),
        // so a queue sized to the piece count never blocks a sender.
        let (work_tx, work_rx) = bounded::<PieceWork>(pieces.len().max(1));
        let (result_tx, result_rx) = unbounded::<PieceResult>();

        // Seed the work channel with every piece
        for piece_work in &pieces {
            work_tx
                .send(piece_work.clone())
                .map_err(|_| anyhow!("could not seed work queue"))?;
        }

        // Spawn one worker per peer, each with its own status cell
        let queue_closed = Arc::new(AtomicBool::new(false));
        let mut cells = Vec::with_capacity(peers.len());
        for peer in peers {
            let cell = Arc::new(StatusCell::new(peer.to_string()));
            cells.push(Arc::clone(&cell));

            let worker = Worker::new(
                peer.clone(),
                self.peer_id,
                self.info_hash,
                work_tx.clone(),
                work_rx.clone(),
                result_tx.clone(),
                Arc::clone(&queue_closed),
                cell,
            );
            thread::spawn(move || worker.run());
        }

        // The workers now hold the only result senders; when the last worker
        // terminates, the receive loop below observes the disconnect instead
        // of blocking forever.
        drop(result_tx);
        drop(work_rx);

        // Open the output file for positional writes
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(output)
            .map_err(|e| anyhow!("could not create output file {:?}: {}", output, e))?;

        let done = Arc::new(AtomicUsize::new(0));
        let bytes_done = Arc::new(AtomicU64::new(0));
        let reporter = Reporter::spawn(
            cells,
            Arc::clone(&done),
            Arc::clone(&bytes_done),
            pieces.len(),
            self.length,
        );

        let outcome = self.write_pieces(&pieces, &file, &work_tx, &result_rx, &done, &bytes_done);

        // Close the work queue so idle workers stop waiting for pieces.
        // The channel cannot disconnect on its own while workers hold their
        // requeue senders, so closure is an explicit signal.
        queue_closed.store(true, Ordering::Relaxed);
        reporter.stop();

        outcome
    }

    /// Coordinator loop: verify each result and write it at its offset.
    fn write_pieces(
        &self,
        pieces: &[PieceWork],
        file: &fs::File,
        work_tx: &crossbeam_channel::Sender<PieceWork>,
        result_rx: &crossbeam_channel::Receiver<PieceResult>,
        done: &AtomicUsize,
        bytes_done: &AtomicU64,
    ) -> Result<()> {
        while done.load(Ordering::Relaxed) < pieces.len() {
            let result = match result_rx.recv() {
                Ok(result) => result,
                Err(_) => {
                    let remaining = pieces.len() - done.load(Ordering::Relaxed);
                    return Err(anyhow!(
                        "all peer connections failed with {} pieces remaining",
                        remaining
                    ));
                }
            };

            let piece_work = pieces
                .get(result.index as usize)
                .ok_or_else(|| anyhow!("received result for unknown piece {}", result.index))?;

            // Verify piece integrity before anything touches the disk
            let mut hasher = Sha1::new();
            hasher.update(&result.buf);
            if hasher.finish() != piece_work.hash {
                warn!("piece {} failed hash check, requeueing", result.index);
                work_tx
                    .send(PieceWork::new(
                        piece_work.index,
                        piece_work.hash,
                        piece_work.length,
                    ))
                    .map_err(|_| anyhow!("could not requeue piece {}", result.index))?;
                continue;
            }

            // Each piece occupies a disjoint range, written exactly once
            let offset = result.index as u64 * self.piece_length as u64;
            file.write_all_at(&result.buf, offset)
                .map_err(|e| anyhow!("failed writing piece {} to disk: {}", result.index, e))?;

            bytes_done.fetch_add(result.buf.len() as u64, Ordering::Relaxed);
            done.fetch_add(1, Ordering::Relaxed);

            debug!("piece {} verified and written", result.index);
        }

        Ok(())
    }
}

/// Announce to one tracker and return its compact peers blob.
fn announce_tracker(announce_url: &str) -> Result<Vec<u8>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .map_err(|_| anyhow!("could not build tracker http client"))?;

    let response = client
        .get(announce_url)
        .send()
        .map_err(|e| anyhow!("tracker request failed: {}", e))?;
    if !response.status().is_success() {
        return Err(anyhow!("tracker returned status {}", response.status()));
    }

    let body = response
        .bytes()
        .map_err(|e| anyhow!("could not read tracker response: {}", e))?;

    parse_tracker_response(&body)
}

/// Extract the peers blob from a bencoded tracker response.
fn parse_tracker_response(body: &[u8]) -> Result<Vec<u8>> {
    let response = bencode::decode(body)
        .map_err(|e| anyhow!("could not decode tracker response: {}", e))?;

    if let Some(reason) = response.get(b"failure reason").and_then(Value::as_bytes) {
        return Err(anyhow!(
            "tracker failed: {}",
            String::from_utf8_lossy(reason)
        ));
    }

    let peers = response
        .get(b"peers")
        .and_then(Value::as_bytes)
        .ok_or_else(|| anyhow!("tracker response missing peers"))?;

    Ok(peers.to_vec())
}

/// Generate a random Azureus-style peer id.
fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(b"-MR0001-");

    let mut rng = rand::thread_rng();
    for byte in peer_id[8..].iter_mut() {
        *byte = rng.gen();
    }

    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_metainfo(announce: &str, name: &str, piece_length: u32, total_length: u64) -> Vec<u8> {
        let piece_count = total_length.div_ceil(piece_length as u64) as usize;
        let pieces = vec![0xAB_u8; piece_count * SHA1_HASH_SIZE];

        let mut info = Vec::new();
        info.extend_from_slice(
            format!(
                "d6:lengthi{}e4:name{}:{}12:piece lengthi{}e6:pieces{}:",
                total_length,
                name.len(),
                name,
                piece_length,
                pieces.len()
            )
            .as_bytes(),
        );
        info.extend_from_slice(&pieces);
        info.push(b'e');

        let mut buf = Vec::new();
        buf.extend_from_slice(format!("d8:announce{}:{}4:info", announce.len(), announce).as_bytes());
        buf.extend_from_slice(&info);
        buf.push(b'e');
        buf
    }

    #[test]
    fn test_from_bytes() {
        let buf = build_metainfo("http://tracker.example/announce", "file.iso", 32768, 108304);
        let torrent = Torrent::from_bytes(&buf).unwrap();

        assert_eq!(torrent.name(), "file.iso");
        assert_eq!(torrent.total_length(), 108304);
        assert_eq!(torrent.piece_list().len(), 4);
    }

    #[test]
    fn test_info_hash_comes_from_raw_slice() {
        let buf = build_metainfo("http://tracker.example/announce", "a", 16384, 16384);
        let torrent = Torrent::from_bytes(&buf).unwrap();

        // Hash the embedded info dictionary bytes directly
        let start = buf
            .windows(6)
            .position(|window| window == b"4:info")
            .unwrap()
            + 6;
        let end = buf.len() - 1;
        let mut hasher = Sha1::new();
        hasher.update(&buf[start..end]);

        assert_eq!(torrent.info_hash(), hasher.finish());
    }

    #[test]
    fn test_piece_list_last_piece_short() {
        let buf = build_metainfo("http://t/a", "x", 32768, 3 * 32768 + 10000);
        let torrent = Torrent::from_bytes(&buf).unwrap();
        let pieces = torrent.piece_list();

        assert_eq!(pieces.len(), 4);
        assert_eq!(pieces[0].length, 32768);
        assert_eq!(pieces[2].length, 32768);
        assert_eq!(pieces[3].length, 10000);
        assert_eq!(pieces[3].index, 3);
    }

    #[test]
    fn test_piece_list_exact_multiple() {
        let buf = build_metainfo("http://t/a", "x", 32768, 2 * 32768);
        let torrent = Torrent::from_bytes(&buf).unwrap();
        let pieces = torrent.piece_list();

        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[1].length, 32768);
    }

    #[test]
    fn test_multi_file_length_is_summed() {
        let pieces = vec![0xCD_u8; SHA1_HASH_SIZE];
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce10:http://t/a4:infod5:filesl");
        buf.extend_from_slice(b"d6:lengthi300ee");
        buf.extend_from_slice(b"d6:lengthi200ee");
        buf.extend_from_slice(b"e4:name1:x12:piece lengthi512e6:pieces20:");
        buf.extend_from_slice(&pieces);
        buf.extend_from_slice(b"ee");

        let torrent = Torrent::from_bytes(&buf).unwrap();
        assert_eq!(torrent.total_length(), 500);
        assert_eq!(torrent.piece_list()[0].length, 500);
    }

    #[test]
    fn test_empty_file_list_rejected() {
        let pieces = vec![0xCD_u8; SHA1_HASH_SIZE];
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce10:http://t/a4:infod5:filesl");
        buf.extend_from_slice(b"e4:name1:x12:piece lengthi512e6:pieces20:");
        buf.extend_from_slice(&pieces);
        buf.extend_from_slice(b"ee");

        let err = Torrent::from_bytes(&buf).unwrap_err();
        assert!(err.to_string().contains("file list is empty"));
    }

    #[test]
    fn test_missing_announce_rejected() {
        let buf = b"d4:infod4:name1:a12:piece lengthi1e6:pieces0:6:lengthi0eee";
        assert!(Torrent::from_bytes(buf).is_err());
    }

    #[test]
    fn test_missing_info_rejected() {
        let buf = b"d8:announce10:http://t/ae";
        let err = Torrent::from_bytes(buf).unwrap_err();
        assert!(err.to_string().contains("missing info"));
    }

    #[test]
    fn test_invalid_pieces_length_rejected() {
        let buf = b"d8:announce10:http://t/a4:infod6:lengthi1e4:name1:a12:piece lengthi1e6:pieces3:abcee";
        assert!(Torrent::from_bytes(buf).is_err());
    }

    #[test]
    fn test_build_tracker_url() {
        let buf = build_metainfo("http://tracker.example/announce", "x", 16384, 16384);
        let torrent = Torrent::from_bytes(&buf).unwrap();

        let url = torrent
            .build_tracker_url("http://tracker.example/announce")
            .unwrap();

        assert!(url.starts_with("http://tracker.example/announce?info_hash=%"));
        assert!(url.contains("&port=6881"));
        assert!(url.contains("&uploaded=0"));
        assert!(url.contains("&downloaded=0"));
        assert!(url.contains("&left=16384"));
        assert!(url.contains("&compact=1"));
        // peer_id is percent-encoded byte for byte: 20 bytes, 3 chars each
        let peer_id_field = url
            .split("peer_id=")
            .nth(1)
            .and_then(|rest| rest.split('&').next())
            .unwrap();
        assert_eq!(peer_id_field.len(), 60);
    }

    #[test]
    fn test_parse_tracker_response_peers() {
        let blob = parse_tracker_response(b"d8:intervali900e5:peers6:\x7f\x00\x00\x01\x1a\xe1e")
            .unwrap();
        assert_eq!(blob, b"\x7f\x00\x00\x01\x1a\xe1");
    }

    #[test]
    fn test_parse_tracker_response_failure_reason() {
        let err = parse_tracker_response(b"d14:failure reason4:nopee").unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_parse_tracker_response_missing_peers() {
        let err = parse_tracker_response(b"d8:intervali900ee").unwrap_err();
        assert!(err.to_string().contains("missing peers"));
    }

    #[test]
    fn test_generate_peer_id_prefix() {
        let peer_id = generate_peer_id();
        assert_eq!(&peer_id[..8], b"-MR0001-");
    }
}
