//! Dedicated device threads with a bounded stop.
//!
//! Uses std::thread (NOT tokio tasks) for blocking audio I/O. Stopping is
//! signal-then-wait-then-proceed: if the thread is stuck inside a device
//! call past the deadline it is detached and left to exit on its own, so
//! teardown never hangs the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

pub(crate) struct Worker {
    name: &'static str,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    done: Receiver<()>,
}

impl Worker {
    /// Spawn `body` on a named thread. The body must return soon after the
    /// flag it is given turns false.
    pub fn spawn<F>(name: &'static str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(&AtomicBool) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let (done_tx, done) = crossbeam_channel::bounded(1);

        let handle = {
            let running = running.clone();
            thread::Builder::new().name(name.into()).spawn(move || {
                body(&running);
                let _ = done_tx.send(());
            })?
        };

        Ok(Self {
            name,
            running,
            handle: Some(handle),
            done,
        })
    }

    /// Signal the thread to stop and wait up to `timeout` for it.
    ///
    /// Returns false if the thread was still blocked at the deadline and has
    /// been detached. Calling this again is a no-op.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.running.store(false, Ordering::SeqCst);
        let Some(handle) = self.handle.take() else {
            return true;
        };

        match self.done.recv_timeout(timeout) {
            // Disconnected: the body panicked before signalling.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    log::error!("{} thread panicked", self.name);
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "{} thread did not exit within {:?}, detaching it",
                    self.name,
                    timeout
                );
                false
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
