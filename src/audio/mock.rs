//! In-memory devices for exercising the streams without audio hardware.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::capture::ActivitySignal;
use super::device::{CaptureBackend, CaptureDevice, MicPermission, PlaybackBackend, PlaybackDevice};
use super::AudioConfig;

/// Poll `cond` every few milliseconds until it holds or `limit` passes.
pub fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Open/close bookkeeping shared by a backend and the devices it opens.
#[derive(Debug, Default)]
pub struct DeviceLog {
    opened: AtomicUsize,
    released: AtomicUsize,
}

impl DeviceLog {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

pub struct MockPermission(AtomicBool);

impl MockPermission {
    pub fn new(granted: bool) -> Self {
        Self(AtomicBool::new(granted))
    }
}

impl MicPermission for MockPermission {
    fn is_granted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct TestSignal(AtomicBool);

impl TestSignal {
    pub fn set(&self, active: bool) {
        self.0.store(active, Ordering::SeqCst);
    }
}

impl ActivitySignal for TestSignal {
    fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ======================== Capture ========================

pub struct MockCaptureBackend {
    pub log: Arc<DeviceLog>,
    pub fail_open: AtomicBool,
    /// Every read blocks for seconds, like a wedged driver
    pub stuck: AtomicBool,
    feed: Receiver<Vec<i16>>,
    stats: Arc<ReadStats>,
}

#[derive(Default)]
struct ReadStats {
    started: AtomicUsize,
    delivered: AtomicUsize,
    /// `delivered` as seen at the entry of the latest read
    delivered_at_last_entry: AtomicUsize,
}

impl MockCaptureBackend {
    /// The sender feeds sample batches to whichever device is open.
    pub fn new() -> (Arc<Self>, Sender<Vec<i16>>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let backend = Arc::new(Self {
            log: Arc::new(DeviceLog::default()),
            fail_open: AtomicBool::new(false),
            stuck: AtomicBool::new(false),
            feed: rx,
            stats: Arc::new(ReadStats::default()),
        });
        (backend, tx)
    }

    pub fn reads_started(&self) -> usize {
        self.stats.started.load(Ordering::SeqCst)
    }

    /// True once the loop has asked for another read after `n` batches were
    /// delivered, i.e. it has finished handling batch `n`.
    pub fn reads_after_delivery(&self, n: usize) -> bool {
        self.stats.delivered.load(Ordering::SeqCst) >= n
            && self.stats.delivered_at_last_entry.load(Ordering::SeqCst) >= n
    }
}

impl CaptureBackend for MockCaptureBackend {
    fn open_capture(&self, _config: &AudioConfig) -> Result<Box<dyn CaptureDevice>> {
        if self.fail_open.load(Ordering::SeqCst) {
            bail!("mock capture device unavailable");
        }
        self.log.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockCaptureDevice {
            log: self.log.clone(),
            feed: self.feed.clone(),
            stuck: self.stuck.load(Ordering::SeqCst),
            stats: self.stats.clone(),
        }))
    }
}

struct MockCaptureDevice {
    log: Arc<DeviceLog>,
    feed: Receiver<Vec<i16>>,
    stuck: bool,
    stats: Arc<ReadStats>,
}

impl CaptureDevice for MockCaptureDevice {
    fn min_buffer_bytes(&self) -> usize {
        1024
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize> {
        self.stats.started.fetch_add(1, Ordering::SeqCst);
        self.stats
            .delivered_at_last_entry
            .store(self.stats.delivered.load(Ordering::SeqCst), Ordering::SeqCst);

        if self.stuck {
            thread::sleep(Duration::from_secs(5));
            return Ok(0);
        }

        match self.feed.recv_timeout(Duration::from_millis(20)) {
            Ok(batch) => {
                let n = batch.len().min(buf.len());
                buf[..n].copy_from_slice(&batch[..n]);
                self.stats.delivered.fetch_add(1, Ordering::SeqCst);
                Ok(n)
            }
            Err(RecvTimeoutError::Timeout) => Ok(0),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("capture feed closed")),
        }
    }
}

impl Drop for MockCaptureDevice {
    fn drop(&mut self) {
        self.log.released.fetch_add(1, Ordering::SeqCst);
    }
}

// ======================== Playback ========================

pub struct MockPlaybackBackend {
    pub log: Arc<DeviceLog>,
    pub fail_open: AtomicBool,
    /// Writes never return within a test's lifetime
    pub block_writes: AtomicBool,
    pub fail_writes: AtomicBool,
    /// Extra time each write takes
    pub write_delay: Mutex<Duration>,
    /// `None`: device has no playback cursor
    pub cursor: Option<Arc<AtomicU64>>,
    pub min_buffer_bytes: usize,
    pub writes: Arc<Mutex<Vec<Vec<i16>>>>,
    pub writes_started: Arc<AtomicUsize>,
    pub halted: Arc<AtomicUsize>,
}

impl MockPlaybackBackend {
    /// A device whose playback position the test moves by hand.
    pub fn with_cursor() -> (Arc<Self>, Arc<AtomicU64>) {
        let cursor = Arc::new(AtomicU64::new(0));
        (Arc::new(Self::build(Some(cursor.clone()), 4096)), cursor)
    }

    /// A device without a position query.
    pub fn without_cursor(min_buffer_bytes: usize) -> Arc<Self> {
        Arc::new(Self::build(None, min_buffer_bytes))
    }

    fn build(cursor: Option<Arc<AtomicU64>>, min_buffer_bytes: usize) -> Self {
        Self {
            log: Arc::new(DeviceLog::default()),
            fail_open: AtomicBool::new(false),
            block_writes: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            write_delay: Mutex::new(Duration::ZERO),
            cursor,
            min_buffer_bytes,
            writes: Arc::new(Mutex::new(Vec::new())),
            writes_started: Arc::new(AtomicUsize::new(0)),
            halted: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn written(&self) -> Vec<Vec<i16>> {
        self.writes.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }
}

impl PlaybackBackend for MockPlaybackBackend {
    fn open_playback(&self, _config: &AudioConfig) -> Result<Box<dyn PlaybackDevice>> {
        if self.fail_open.load(Ordering::SeqCst) {
            bail!("mock playback device unavailable");
        }
        self.log.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockPlaybackDevice {
            log: self.log.clone(),
            block: self.block_writes.load(Ordering::SeqCst),
            fail: self.fail_writes.load(Ordering::SeqCst),
            delay: *self.write_delay.lock(),
            cursor: self.cursor.clone(),
            min_buffer_bytes: self.min_buffer_bytes,
            writes: self.writes.clone(),
            writes_started: self.writes_started.clone(),
            halted: self.halted.clone(),
        }))
    }
}

struct MockPlaybackDevice {
    log: Arc<DeviceLog>,
    block: bool,
    fail: bool,
    delay: Duration,
    cursor: Option<Arc<AtomicU64>>,
    min_buffer_bytes: usize,
    writes: Arc<Mutex<Vec<Vec<i16>>>>,
    writes_started: Arc<AtomicUsize>,
    halted: Arc<AtomicUsize>,
}

impl PlaybackDevice for MockPlaybackDevice {
    fn min_buffer_bytes(&self) -> usize {
        self.min_buffer_bytes
    }

    fn write(&mut self, samples: &[i16]) -> Result<usize> {
        self.writes_started.fetch_add(1, Ordering::SeqCst);
        if self.block {
            thread::sleep(Duration::from_secs(5));
        }
        if self.fail {
            bail!("mock playback write failed");
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.writes.lock().push(samples.to_vec());
        Ok(samples.len())
    }

    fn played_frames(&mut self) -> Option<u64> {
        self.cursor.as_ref().map(|c| c.load(Ordering::SeqCst))
    }

    fn halt(&mut self) {
        self.halted.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for MockPlaybackDevice {
    fn drop(&mut self) {
        self.log.released.fetch_add(1, Ordering::SeqCst);
    }
}
