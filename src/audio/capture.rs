//! Microphone capture loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::device::{CaptureBackend, CaptureDevice, MicPermission};
use super::worker::Worker;
use super::{AudioConfig, AudioFrame, BYTES_PER_SAMPLE};
use crate::error::{CallError, Result};

/// Receives every frame that passes the suppression gate. Runs on the
/// capture thread and must not block.
pub type FrameHandler = Arc<dyn Fn(AudioFrame) + Send + Sync>;

/// Receives a description of a steady-state device failure. Called at most
/// once per session, from the device thread.
pub type FaultHandler = Arc<dyn Fn(String) + Send + Sync>;

/// "Is our own output audible right now?" Consulted for every captured frame.
pub trait ActivitySignal: Send + Sync {
    fn is_active(&self) -> bool;
}

/// Owns the microphone and the capture thread.
///
/// While suppressed (explicit flag, or the activity signal reports true)
/// frames are still read from the device so the hardware buffer never
/// overruns, but they are dropped before reaching the frame handler.
pub struct CaptureStream {
    config: AudioConfig,
    backend: Arc<dyn CaptureBackend>,
    permission: Arc<dyn MicPermission>,
    on_frame: FrameHandler,
    on_fault: FaultHandler,
    suppressed: Arc<AtomicBool>,
    gate: Option<Arc<dyn ActivitySignal>>,
    session: Mutex<Option<Worker>>,
}

impl CaptureStream {
    pub fn new(
        config: AudioConfig,
        backend: Arc<dyn CaptureBackend>,
        permission: Arc<dyn MicPermission>,
        on_frame: FrameHandler,
    ) -> Self {
        Self {
            config,
            backend,
            permission,
            on_frame,
            on_fault: Arc::new(|_: String| {}),
            suppressed: Arc::new(AtomicBool::new(false)),
            gate: None,
            session: Mutex::new(None),
        }
    }

    pub fn on_fault(mut self, handler: FaultHandler) -> Self {
        self.on_fault = handler;
        self
    }

    /// Drop frames whenever `signal` reports activity (half-duplex gate).
    pub fn suppress_while(mut self, signal: Arc<dyn ActivitySignal>) -> Self {
        self.gate = Some(signal);
        self
    }

    pub fn set_suppressed(&self, suppressed: bool) {
        self.suppressed.store(suppressed, Ordering::SeqCst);
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Open the microphone and start the capture thread.
    ///
    /// Returns false, with no thread started and no device held, when
    /// permission is missing, the device cannot be opened, or a session is
    /// already running.
    pub fn start(&self) -> bool {
        match self.try_start() {
            Ok(()) => true,
            Err(e) => {
                log::error!("Capture start failed: {}", e);
                false
            }
        }
    }

    /// Same as [`start`](Self::start) but says why it failed.
    pub fn try_start(&self) -> Result<()> {
        let mut session = self.session.lock();
        if session.is_some() {
            return Err(CallError::AlreadyActive("capture stream"));
        }

        if !self.permission.is_granted() {
            return Err(CallError::PermissionDenied);
        }

        let mut device = self
            .backend
            .open_capture(&self.config)
            .map_err(|e| CallError::DeviceInit(format!("{:#}", e)))?;

        if device.enable_voice_processing() {
            log::info!("Platform echo cancellation / noise suppression enabled");
        } else {
            log::warn!("Platform echo cancellation not available on this device");
        }

        let buffer_bytes = self.config.buffer_bytes(device.min_buffer_bytes());
        let capture = CaptureLoop {
            samples_per_read: buffer_bytes / BYTES_PER_SAMPLE,
            on_frame: self.on_frame.clone(),
            on_fault: self.on_fault.clone(),
            suppressed: self.suppressed.clone(),
            gate: self.gate.clone(),
        };

        let worker = Worker::spawn("audio-record", move |running| capture.run(device, running))
            .map_err(|e| CallError::DeviceInit(format!("Failed to spawn capture thread: {}", e)))?;

        log::info!(
            "Recording started: rate={}, read_bytes={}",
            self.config.sample_rate,
            buffer_bytes
        );
        *session = Some(worker);
        Ok(())
    }

    /// Stop the capture thread (bounded wait) and release the microphone.
    /// Safe to call repeatedly or concurrently.
    pub fn stop(&self) {
        let Some(mut worker) = self.session.lock().take() else {
            return;
        };
        if !worker.stop(self.config.join_timeout) {
            log::warn!("Capture device read still blocked; device released when it returns");
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureLoop {
    samples_per_read: usize,
    on_frame: FrameHandler,
    on_fault: FaultHandler,
    suppressed: Arc<AtomicBool>,
    gate: Option<Arc<dyn ActivitySignal>>,
}

impl CaptureLoop {
    fn run(self, mut device: Box<dyn CaptureDevice>, running: &AtomicBool) {
        let mut read_buf = vec![0i16; self.samples_per_read];
        let mut dropped = 0u64;

        while running.load(Ordering::SeqCst) {
            match device.read(&mut read_buf) {
                Ok(0) => continue,
                Ok(n) => {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    if self.is_gated() {
                        dropped += 1;
                        continue;
                    }
                    (self.on_frame)(AudioFrame::from_samples(&read_buf[..n]));
                }
                Err(e) => {
                    if running.load(Ordering::SeqCst) {
                        log::error!("Capture device failed: {:#}", e);
                        (self.on_fault)(format!("{:#}", e));
                    }
                    break;
                }
            }
        }

        // Release the device on this thread before reporting completion.
        drop(device);
        log::info!("Recording stopped ({} frames suppressed)", dropped);
    }

    fn is_gated(&self) -> bool {
        self.suppressed.load(Ordering::SeqCst)
            || self.gate.as_ref().is_some_and(|gate| gate.is_active())
    }
}
