//! # Marmot BitTorrent Client
//!
//! A command-line BitTorrent client written in Rust.
//!
//! ## Features
//!
//! - Core BitTorrent peer wire protocol
//! - Byte-exact bencode decoding with raw `info` capture
//! - Basic multitracker support
//! - Multi-peer concurrent downloading
//! - Piece verification with SHA-1 hashing
//! - Progress tracking with visual progress bar
//!
//! ## Architecture
//!
//! The client follows a multi-threaded architecture:
//!
//! - **Main thread**: Parses arguments, loads torrent, coordinates download
//! - **Worker threads**: Each handles communication with one peer
//! - **Reporter thread**: Renders download progress from shared status cells
//! - **Channels**: Coordinate piece work distribution and result collection

#[macro_use]
extern crate log;

pub mod bencode;
pub mod client;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod piece;
pub mod status;
pub mod torrent;
pub mod worker;
