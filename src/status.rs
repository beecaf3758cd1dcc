//! # Download Status Reporting
//!
//! Progress rendering is a read-only observer of the download. Each worker
//! owns one `StatusCell` and is its only writer; the reporter thread reads
//! all cells plus two counters published by the coordinator (pieces done,
//! bytes written) and drives a progress bar. Slightly stale reads are fine,
//! nothing here participates in download correctness.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

const REFRESH_INTERVAL: Duration = Duration::from_millis(200);

/// What a worker is currently doing with its peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activity {
    Idle,
    Connecting,
    Handshaking,
    Downloading,
    Stopped,
}

struct CellState {
    activity: Activity,
    piece: Option<u32>,
}

/// Per-worker status, written by the owning worker, read by the reporter.
pub struct StatusCell {
    addr: String,
    state: Mutex<CellState>,
}

impl StatusCell {
    pub fn new(addr: String) -> StatusCell {
        StatusCell {
            addr,
            state: Mutex::new(CellState {
                activity: Activity::Idle,
                piece: None,
            }),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn set_activity(&self, activity: Activity) {
        if let Ok(mut state) = self.state.lock() {
            state.activity = activity;
        }
    }

    /// Mark the worker as downloading `piece`.
    pub fn set_downloading(&self, piece: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.activity = Activity::Downloading;
            state.piece = Some(piece);
        }
    }

    pub fn activity(&self) -> Activity {
        self.state
            .lock()
            .map(|state| state.activity)
            .unwrap_or(Activity::Stopped)
    }

    pub fn piece(&self) -> Option<u32> {
        self.state.lock().ok().and_then(|state| state.piece)
    }
}

/// Background thread rendering download progress.
pub struct Reporter {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Reporter {
    /// Spawn the reporter thread.
    ///
    /// The bar is sized in bytes; `done` counts verified pieces and decides
    /// completion.
    pub fn spawn(
        cells: Vec<Arc<StatusCell>>,
        done: Arc<AtomicUsize>,
        bytes_done: Arc<AtomicU64>,
        total_pieces: usize,
        total_bytes: u64,
    ) -> Reporter {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            let pb = ProgressBar::new(total_bytes);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}% {msg}",
                    )
                    .unwrap()
                    .progress_chars("#>-"),
            );

            loop {
                let finished = done.load(Ordering::Relaxed) >= total_pieces;

                pb.set_position(bytes_done.load(Ordering::Relaxed));

                let mut active = 0;
                for cell in &cells {
                    if cell.activity() == Activity::Downloading {
                        trace!("{} downloading piece {:?}", cell.addr(), cell.piece());
                        active += 1;
                    }
                }
                pb.set_message(format!("{} peers", active));

                if finished {
                    pb.finish();
                    return;
                }
                if stop_flag.load(Ordering::Relaxed) {
                    pb.finish_and_clear();
                    return;
                }

                thread::sleep(REFRESH_INTERVAL);
            }
        });

        Reporter {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the reporter to exit and wait for it.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_cell_updates() {
        let cell = StatusCell::new("10.0.0.1:6881".to_string());
        assert_eq!(cell.activity(), Activity::Idle);
        assert_eq!(cell.piece(), None);

        cell.set_activity(Activity::Connecting);
        assert_eq!(cell.activity(), Activity::Connecting);

        cell.set_downloading(3);
        assert_eq!(cell.activity(), Activity::Downloading);
        assert_eq!(cell.piece(), Some(3));
    }

    #[test]
    fn test_reporter_finishes_when_done() {
        let done = Arc::new(AtomicUsize::new(4));
        let bytes_done = Arc::new(AtomicU64::new(1024));
        let reporter = Reporter::spawn(vec![], Arc::clone(&done), bytes_done, 4, 1024);

        // done already equals the total, so the thread exits on its own
        reporter.stop();
    }
}
