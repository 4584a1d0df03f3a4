//! audio - Microphone capture and speaker playback for a full-duplex call
//!
//! Each direction runs on its own OS thread doing blocking device I/O:
//! - capture: device read → `AudioFrame` → frame handler (network send)
//! - playback: network frame → FIFO queue → drain loop → device write
//!
//! PCM is always signed 16-bit little-endian mono at the configured rate.

mod alsa_device;
mod capture;
mod device;
mod frame;
mod playback;
mod worker;

#[cfg(test)]
pub(crate) mod mock;

use std::time::Duration;

pub use alsa_device::{AlsaBackend, AlsaMicPermission};
pub use capture::{ActivitySignal, CaptureStream, FaultHandler, FrameHandler};
pub use device::{CaptureBackend, CaptureDevice, MicPermission, PlaybackBackend, PlaybackDevice};
pub use frame::AudioFrame;
pub use playback::{PlaybackActivity, PlaybackStream};

/// Bytes per sample of the canonical encoding (S16LE mono).
pub const BYTES_PER_SAMPLE: usize = 2;

/// Audio parameters fixed for the lifetime of a call.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,
    /// Sample rate for both directions (16 kHz for the agent protocol)
    pub sample_rate: u32,
    /// Lower bound for device read/write buffers, in bytes
    pub min_buffer_bytes: usize,
    /// How long the drain loop sleeps when its queue is empty
    pub idle_poll: Duration,
    /// Upper bound for joining a device thread on teardown
    pub join_timeout: Duration,
}

impl AudioConfig {
    /// Read size in bytes: at least `min_buffer_bytes`, raised to the
    /// device's own minimum, rounded up to a whole sample.
    pub fn buffer_bytes(&self, device_min: usize) -> usize {
        let bytes = self.min_buffer_bytes.max(device_min);
        bytes.div_ceil(BYTES_PER_SAMPLE) * BYTES_PER_SAMPLE
    }

    /// Time the given number of bytes takes to play at the configured rate.
    pub fn bytes_duration(&self, bytes: usize) -> Duration {
        let samples = (bytes / BYTES_PER_SAMPLE) as u64;
        Duration::from_micros(samples * 1_000_000 / u64::from(self.sample_rate.max(1)))
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            sample_rate: 16000,
            min_buffer_bytes: 4096,
            idle_poll: Duration::from_millis(10),
            join_timeout: Duration::from_secs(1),
        }
    }
}
