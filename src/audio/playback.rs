//! Speaker playback: FIFO queue, drain loop and the is-speaking signal.
//!
//! "Speaking" is not "queue non-empty". A device accepts a write long before
//! the samples are audible, so the drain loop keeps two counters per session:
//! samples handed to the device and samples the device has played. The
//! played count comes from the hardware cursor when the device has one, and
//! from a buffer drain-time estimate otherwise.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use super::capture::{ActivitySignal, FaultHandler};
use super::device::{PlaybackBackend, PlaybackDevice};
use super::worker::Worker;
use super::{AudioConfig, AudioFrame};
use crate::error::{CallError, Result};

/// Queue and counters of one open speaker. Replaced wholesale on every
/// start, so a detached drain thread can never touch the next session.
struct PlaybackSession {
    queue_tx: Sender<AudioFrame>,
    queue_rx: Receiver<AudioFrame>,
    /// Frames enqueued and not yet written or discarded
    pending: AtomicUsize,
    /// Samples accepted by the device
    handed: AtomicU64,
    /// Samples known to have left the speaker; never above `handed`
    played: AtomicU64,
    active: AtomicBool,
}

impl PlaybackSession {
    fn new() -> Self {
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
        Self {
            queue_tx,
            queue_rx,
            pending: AtomicUsize::new(0),
            handed: AtomicU64::new(0),
            played: AtomicU64::new(0),
            active: AtomicBool::new(true),
        }
    }

    fn enqueue(&self, frame: AudioFrame) -> bool {
        if !self.active.load(Ordering::SeqCst) {
            return false;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        // The session holds the receiver, so the channel cannot disconnect.
        let _ = self.queue_tx.send(frame);
        true
    }

    fn discard_queued(&self) -> usize {
        let mut discarded = 0;
        while self.queue_rx.try_recv().is_ok() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            discarded += 1;
        }
        discarded
    }

    // The drain loop publishes `handed` before it retires a frame from
    // `pending`, so reading in this order never sees a gap.
    fn is_speaking(&self) -> bool {
        if !self.active.load(Ordering::SeqCst) {
            return false;
        }
        if self.pending.load(Ordering::SeqCst) > 0 {
            return true;
        }
        let played = self.played.load(Ordering::SeqCst);
        played < self.handed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.discard_queued();
    }
}

type SessionSlot = Arc<Mutex<Option<Arc<PlaybackSession>>>>;

/// Owns the speaker and the drain thread.
pub struct PlaybackStream {
    config: AudioConfig,
    backend: Arc<dyn PlaybackBackend>,
    on_fault: FaultHandler,
    current: SessionSlot,
    worker: Mutex<Option<Worker>>,
}

impl PlaybackStream {
    pub fn new(config: AudioConfig, backend: Arc<dyn PlaybackBackend>) -> Self {
        Self {
            config,
            backend,
            on_fault: Arc::new(|_: String| {}),
            current: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
        }
    }

    pub fn on_fault(mut self, handler: FaultHandler) -> Self {
        self.on_fault = handler;
        self
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Open the speaker and start the drain thread. Returns false when the
    /// device cannot be opened or a session is already running.
    pub fn start(&self) -> bool {
        match self.try_start() {
            Ok(()) => true,
            Err(e) => {
                log::error!("Playback start failed: {}", e);
                false
            }
        }
    }

    pub fn try_start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(CallError::AlreadyActive("playback stream"));
        }

        let mut device = self
            .backend
            .open_playback(&self.config)
            .map_err(|e| CallError::DeviceInit(format!("{:#}", e)))?;

        let buffer_bytes = self.config.buffer_bytes(device.min_buffer_bytes());
        let cursor = match device.played_frames() {
            Some(_) => Cursor::Hardware,
            None => {
                let drain = self.config.bytes_duration(buffer_bytes);
                log::info!("Playback device has no position query, estimating drain as {:?}", drain);
                Cursor::Estimated {
                    drain,
                    last_write: None,
                }
            }
        };

        let session = Arc::new(PlaybackSession::new());
        let drain = DrainLoop {
            session: session.clone(),
            cursor,
            handed: 0,
            idle_poll: self.config.idle_poll,
            on_fault: self.on_fault.clone(),
        };

        let spawned = Worker::spawn("audio-play", move |running| drain.run(device, running))
            .map_err(|e| CallError::DeviceInit(format!("Failed to spawn playback thread: {}", e)))?;

        log::info!(
            "Playback started: rate={}, buffer_bytes={}",
            self.config.sample_rate,
            buffer_bytes
        );
        *self.current.lock() = Some(session);
        *worker = Some(spawned);
        Ok(())
    }

    /// Append a frame to the playback queue. Never blocks; frames queued
    /// while no session is running are dropped.
    pub fn queue_audio(&self, frame: AudioFrame) {
        if frame.is_empty() {
            return;
        }
        let session = self.current.lock().clone();
        let queued = session.is_some_and(|s| s.enqueue(frame));
        if !queued {
            log::debug!("Playback not running, dropping frame");
        }
    }

    /// Discard every pending frame without stopping the device. Audio the
    /// device already holds still plays out. Returns the number discarded.
    pub fn clear_queue(&self) -> usize {
        let session = self.current.lock().clone();
        let discarded = session.map_or(0, |s| s.discard_queued());
        if discarded > 0 {
            log::info!("Cleared {} queued playback frames", discarded);
        }
        discarded
    }

    /// True while queued or device-buffered audio remains to be heard.
    pub fn is_speaking(&self) -> bool {
        self.current.lock().as_ref().is_some_and(|s| s.is_speaking())
    }

    /// A handle onto this stream's activity signal that outlives restarts.
    pub fn activity(&self) -> PlaybackActivity {
        PlaybackActivity {
            current: self.current.clone(),
        }
    }

    /// Stop the drain thread (bounded wait), discard the queue, reset the
    /// counters and release the device. Safe to call repeatedly or
    /// concurrently.
    pub fn stop(&self) {
        let Some(mut worker) = self.worker.lock().take() else {
            return;
        };
        if let Some(session) = self.current.lock().take() {
            session.close();
        }
        if !worker.stop(self.config.join_timeout) {
            log::warn!("Playback device write still blocked; device released when it returns");
        }
        log::info!("Playback stopped");
    }
}

impl Drop for PlaybackStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Cloneable view of [`PlaybackStream::is_speaking`], used as the capture
/// suppression gate.
#[derive(Clone)]
pub struct PlaybackActivity {
    current: SessionSlot,
}

impl PlaybackActivity {
    pub fn is_speaking(&self) -> bool {
        self.current.lock().as_ref().is_some_and(|s| s.is_speaking())
    }
}

impl ActivitySignal for PlaybackActivity {
    fn is_active(&self) -> bool {
        self.is_speaking()
    }
}

enum Cursor {
    /// Device reports how many samples it has played
    Hardware,
    /// Everything handed is assumed played one buffer-drain after the last write
    Estimated {
        drain: Duration,
        last_write: Option<Instant>,
    },
}

struct DrainLoop {
    session: Arc<PlaybackSession>,
    cursor: Cursor,
    handed: u64,
    idle_poll: Duration,
    on_fault: FaultHandler,
}

impl DrainLoop {
    fn run(mut self, mut device: Box<dyn PlaybackDevice>, running: &AtomicBool) {
        while running.load(Ordering::SeqCst) {
            let Ok(frame) = self.session.queue_rx.try_recv() else {
                self.publish_played(device.as_mut());
                thread::sleep(self.idle_poll);
                continue;
            };

            let written = device.write(&frame.samples());
            match written {
                Ok(n) => {
                    self.handed += n as u64;
                    self.session.handed.store(self.handed, Ordering::SeqCst);
                    self.session.pending.fetch_sub(1, Ordering::SeqCst);
                    if let Cursor::Estimated { last_write, .. } = &mut self.cursor {
                        *last_write = Some(Instant::now());
                    }
                    self.publish_played(device.as_mut());
                }
                Err(e) => {
                    self.session.pending.fetch_sub(1, Ordering::SeqCst);
                    if running.load(Ordering::SeqCst) {
                        log::error!("Playback device failed: {:#}", e);
                        (self.on_fault)(format!("{:#}", e));
                    }
                    break;
                }
            }
        }

        self.session.close();
        device.halt();
        drop(device);
        log::debug!("Drain loop exited after {} samples", self.handed);
    }

    fn publish_played(&mut self, device: &mut dyn PlaybackDevice) {
        let played = match &self.cursor {
            Cursor::Hardware => match device.played_frames() {
                Some(position) => position.min(self.handed),
                // Transient query failure: keep the last position.
                None => return,
            },
            Cursor::Estimated { drain, last_write } => {
                if last_write.is_some_and(|at| at.elapsed() < *drain) {
                    return;
                }
                self.handed
            }
        };
        self.session.played.store(played, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mock::{MockPlaybackBackend, wait_until};

    fn frame(value: i16, samples: usize) -> AudioFrame {
        AudioFrame::from_samples(&vec![value; samples])
    }

    #[test]
    fn writes_follow_enqueue_order() {
        let (backend, _cursor) = MockPlaybackBackend::with_cursor();
        let player = PlaybackStream::new(AudioConfig::default(), backend.clone());
        assert!(player.start());

        for value in [1, 2, 3] {
            player.queue_audio(frame(value, 8));
        }
        assert!(wait_until(Duration::from_secs(2), || backend.write_count() == 3));
        let firsts: Vec<i16> = backend.written().iter().map(|w| w[0]).collect();
        assert_eq!(firsts, vec![1, 2, 3]);
        player.stop();
    }

    #[test]
    fn concurrent_producers_lose_nothing_and_keep_their_own_order() {
        let (backend, _cursor) = MockPlaybackBackend::with_cursor();
        let player = Arc::new(PlaybackStream::new(AudioConfig::default(), backend.clone()));
        assert!(player.start());

        let producers: Vec<_> = (0..4i16)
            .map(|producer| {
                let player = player.clone();
                thread::spawn(move || {
                    for seq in 0..50i16 {
                        player.queue_audio(AudioFrame::from_samples(&[producer, seq]));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || backend.write_count() == 200));
        for producer in 0..4i16 {
            let seqs: Vec<i16> = backend
                .written()
                .iter()
                .filter(|w| w[0] == producer)
                .map(|w| w[1])
                .collect();
            assert_eq!(seqs, (0..50).collect::<Vec<_>>());
        }
        player.stop();
    }

    #[test]
    fn speaking_until_hardware_cursor_reaches_handed_samples() {
        let (backend, cursor) = MockPlaybackBackend::with_cursor();
        let player = PlaybackStream::new(AudioConfig::default(), backend.clone());
        assert!(player.start());
        assert!(!player.is_speaking());

        // Three 4096-byte frames, accepted by the device but not yet heard.
        for value in [1, 2, 3] {
            player.queue_audio(frame(value, 2048));
        }
        assert!(player.is_speaking());
        assert!(wait_until(Duration::from_secs(2), || backend.write_count() == 3));
        thread::sleep(Duration::from_millis(50));
        assert!(player.is_speaking());

        cursor.store(4096, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert!(player.is_speaking());

        cursor.store(3 * 2048, Ordering::SeqCst);
        assert!(wait_until(Duration::from_millis(200), || !player.is_speaking()));
        player.stop();
    }

    #[test]
    fn estimated_drain_holds_speaking_for_the_device_buffer() {
        // 32000 bytes at 16 kHz mono: one second of buffered audio.
        let backend = MockPlaybackBackend::without_cursor(32000);
        let player = PlaybackStream::new(AudioConfig::default(), backend.clone());
        assert!(player.start());

        player.queue_audio(frame(7, 1600));
        assert!(wait_until(Duration::from_secs(1), || backend.write_count() == 1));
        let written_at = Instant::now();

        thread::sleep(Duration::from_millis(300));
        assert!(player.is_speaking());

        assert!(wait_until(Duration::from_secs(3), || !player.is_speaking()));
        assert!(written_at.elapsed() >= Duration::from_millis(900));
        player.stop();
    }

    #[test]
    fn new_frame_during_estimated_drain_extends_it() {
        let backend = MockPlaybackBackend::without_cursor(32000);
        let player = PlaybackStream::new(AudioConfig::default(), backend.clone());
        assert!(player.start());

        player.queue_audio(frame(1, 160));
        assert!(wait_until(Duration::from_secs(1), || backend.write_count() == 1));
        thread::sleep(Duration::from_millis(600));

        player.queue_audio(frame(2, 160));
        assert!(wait_until(Duration::from_secs(1), || backend.write_count() == 2));
        let second_at = Instant::now();

        thread::sleep(Duration::from_millis(600));
        assert!(player.is_speaking());
        assert!(wait_until(Duration::from_secs(3), || !player.is_speaking()));
        assert!(second_at.elapsed() >= Duration::from_millis(900));
        player.stop();
    }

    #[test]
    fn clear_queue_drops_pending_frames_but_keeps_the_device() {
        let (backend, cursor) = MockPlaybackBackend::with_cursor();
        *backend.write_delay.lock() = Duration::from_millis(100);
        let player = PlaybackStream::new(AudioConfig::default(), backend.clone());
        assert!(player.start());

        for value in 0..10 {
            player.queue_audio(frame(value, 16));
        }
        assert!(wait_until(Duration::from_secs(1), || {
            backend.writes_started.load(Ordering::SeqCst) >= 1
        }));
        let discarded = player.clear_queue();
        assert!(discarded >= 8, "discarded {}", discarded);

        thread::sleep(Duration::from_millis(300));
        assert!(backend.write_count() <= 2);
        assert!(player.is_running());

        // Whatever was handed over is still playing until the cursor says so.
        assert!(player.is_speaking());
        cursor.store(u64::MAX, Ordering::SeqCst);
        assert!(wait_until(Duration::from_millis(200), || !player.is_speaking()));

        player.queue_audio(frame(42, 16));
        assert!(wait_until(Duration::from_secs(1), || {
            backend.written().last().is_some_and(|w| w[0] == 42)
        }));
        player.stop();
    }

    #[test]
    fn frames_queued_before_start_are_dropped() {
        let (backend, _cursor) = MockPlaybackBackend::with_cursor();
        let player = PlaybackStream::new(AudioConfig::default(), backend.clone());

        player.queue_audio(frame(1, 16));
        assert!(!player.is_speaking());

        assert!(player.start());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(backend.write_count(), 0);
        player.stop();
    }

    #[test]
    fn stop_resets_everything_and_is_idempotent() {
        let (backend, _cursor) = MockPlaybackBackend::with_cursor();
        let player = PlaybackStream::new(AudioConfig::default(), backend.clone());
        assert!(player.start());

        player.queue_audio(frame(1, 2048));
        assert!(wait_until(Duration::from_secs(1), || backend.write_count() == 1));
        assert!(player.is_speaking());

        player.stop();
        player.stop();
        assert!(!player.is_speaking());
        assert!(!player.is_running());
        assert_eq!(backend.log.released(), 1);
        assert_eq!(backend.halted.load(Ordering::SeqCst), 1);

        // A fresh session starts from zero.
        assert!(player.start());
        assert!(!player.is_speaking());
        player.stop();
        assert_eq!(backend.log.opened(), 2);
        assert_eq!(backend.log.released(), 2);
    }

    #[test]
    fn concurrent_stop_releases_once() {
        let (backend, _cursor) = MockPlaybackBackend::with_cursor();
        let player = Arc::new(PlaybackStream::new(AudioConfig::default(), backend.clone()));
        assert!(player.start());

        let stoppers: Vec<_> = (0..4)
            .map(|_| {
                let player = player.clone();
                thread::spawn(move || player.stop())
            })
            .collect();
        for stopper in stoppers {
            stopper.join().unwrap();
        }
        assert!(wait_until(Duration::from_secs(2), || backend.log.released() == 1));
        assert_eq!(backend.log.released(), 1);
    }

    #[test]
    fn stop_is_bounded_when_write_blocks() {
        let (backend, _cursor) = MockPlaybackBackend::with_cursor();
        backend.block_writes.store(true, Ordering::SeqCst);
        let player = PlaybackStream::new(AudioConfig::default(), backend.clone());
        assert!(player.start());

        player.queue_audio(frame(1, 16));
        assert!(wait_until(Duration::from_secs(1), || {
            backend.writes_started.load(Ordering::SeqCst) == 1
        }));

        let started = Instant::now();
        player.stop();
        assert!(started.elapsed() < Duration::from_millis(1100));
        assert!(!player.is_running());
        assert!(!player.is_speaking());
    }

    #[test]
    fn second_start_is_rejected() {
        let (backend, _cursor) = MockPlaybackBackend::with_cursor();
        let player = PlaybackStream::new(AudioConfig::default(), backend.clone());

        assert!(player.start());
        assert!(matches!(player.try_start(), Err(CallError::AlreadyActive(_))));
        assert_eq!(backend.log.opened(), 1);
        player.stop();
    }

    #[test]
    fn open_failure_starts_nothing() {
        let (backend, _cursor) = MockPlaybackBackend::with_cursor();
        backend.fail_open.store(true, Ordering::SeqCst);
        let player = PlaybackStream::new(AudioConfig::default(), backend.clone());

        assert!(matches!(player.try_start(), Err(CallError::DeviceInit(_))));
        assert!(!player.is_running());
    }

    #[test]
    fn write_failure_reports_a_fault_and_stops_speaking() {
        let (backend, _cursor) = MockPlaybackBackend::with_cursor();
        backend.fail_writes.store(true, Ordering::SeqCst);
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = faults.clone();
        let player = PlaybackStream::new(AudioConfig::default(), backend.clone())
            .on_fault(Arc::new(move |msg: String| sink.lock().push(msg)));
        assert!(player.start());

        player.queue_audio(frame(1, 16));
        assert!(wait_until(Duration::from_secs(1), || faults.lock().len() == 1));
        assert!(faults.lock()[0].contains("write failed"));
        assert!(wait_until(Duration::from_millis(200), || !player.is_speaking()));
        player.stop();
    }

    #[test]
    fn activity_handle_tracks_the_stream() {
        let (backend, cursor) = MockPlaybackBackend::with_cursor();
        let player = PlaybackStream::new(AudioConfig::default(), backend.clone());
        let activity = player.activity();
        assert!(!activity.is_active());

        assert!(player.start());
        player.queue_audio(frame(1, 64));
        assert!(activity.is_active());

        cursor.store(64, Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(1), || !activity.is_active()));
        player.stop();
    }
}
