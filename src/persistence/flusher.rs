//! Debounced flusher
//!
//! Background thread that turns dirty signals into coalesced flushes:
//! the first signal opens a window, every further signal restarts the quiet
//! period (`flush_delay`), and the window never stays open longer than
//! `max_flush_delay`. When it closes, all dirty domains are flushed once.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;

use super::manager::{FlushSignal, PersistenceManager};

/// Handle to the running flusher thread
///
/// Dropping the handle stops the thread without a final flush; the store
/// performs its own final flush before shutting the worker down.
pub struct FlushWorker {
    shutdown: Option<Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl FlushWorker {
    /// Start the flusher thread
    pub fn spawn(
        manager: Arc<PersistenceManager>,
        delay: Duration,
        max_delay: Duration,
    ) -> std::io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);
        let signals = manager.tracker().signals();

        let thread = thread::Builder::new()
            .name("cairnkv-flusher".to_string())
            .spawn(move || run(manager, signals, shutdown_rx, delay, max_delay))?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Stop the thread and wait for it to exit
    pub fn shutdown(mut self) {
        self.stop();
    }

    /// Whether the thread is still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }

    fn stop(&mut self) {
        // Dropping the sender disconnects the shutdown channel
        self.shutdown.take();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!("Flusher thread panicked");
            }
        }
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State of an open flush window after waiting once
enum Window {
    Extend,
    Close,
    Stop,
}

fn run(
    manager: Arc<PersistenceManager>,
    signals: Receiver<FlushSignal>,
    shutdown: Receiver<()>,
    delay: Duration,
    max_delay: Duration,
) {
    tracing::debug!("Flusher started (delay={:?}, max={:?})", delay, max_delay);

    // Set after a failed flush: the next window opens without a new signal
    let mut retry = false;

    loop {
        let woken = retry
            || select! {
                recv(signals) -> msg => msg.is_ok(),
                recv(shutdown) -> _ => false,
            };
        if !woken {
            break;
        }

        let opened = Instant::now();
        loop {
            let wait = delay.min(max_delay.saturating_sub(opened.elapsed()));
            if wait.is_zero() {
                break;
            }
            let next = select! {
                recv(signals) -> msg => if msg.is_ok() { Window::Extend } else { Window::Stop },
                recv(shutdown) -> _ => Window::Stop,
                default(wait) => Window::Close,
            };
            match next {
                Window::Extend => continue,
                Window::Close => break,
                Window::Stop => {
                    tracing::debug!("Flusher stopping with a flush window open");
                    return;
                }
            }
        }

        retry = !manager.flush_dirty_logged();
    }

    tracing::debug!("Flusher stopped");
}
