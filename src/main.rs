use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;

use marmot::torrent::Torrent;

/// A command-line BitTorrent client, written in Rust.
#[derive(Parser, Debug)]
#[command(version, author, about)]
struct Args {
    /// The .torrent file to download
    torrent: PathBuf,

    /// Where to save the download (defaults to the name in the torrent)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

/// Make a torrent-supplied name safe to use as a local filename.
fn sanitize_filename(name: &str) -> String {
    // Path separators would let a torrent write outside the working directory
    let safe = name.replace(['/', '\\'], "_");

    if safe.trim().is_empty() {
        String::from("download")
    } else {
        safe
    }
}

fn run(args: Args) -> Result<()> {
    // Check if torrent file exists
    if !args.torrent.exists() {
        return Err(anyhow!(
            "could not find torrent file: {}",
            args.torrent.display()
        ));
    }

    // Parse torrent metadata
    let torrent = Torrent::open(&args.torrent)?;

    // Determine output filename
    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(sanitize_filename(torrent.name())));

    // Discover peers
    println!("Contacting trackers...");
    let peers = torrent.request_peers()?;
    println!("Found {} peers.", peers.len());

    // Download torrent
    torrent.download(&peers, &output)?;

    println!("Saved in {:?}.", output);

    Ok(())
}

fn main() {
    pretty_env_logger::init_timed();

    if let Err(error) = run(Args::parse()) {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }
}
