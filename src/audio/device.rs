//! Device seams between the streams and the platform audio API.

use anyhow::Result;

use super::AudioConfig;

/// An open microphone.
pub trait CaptureDevice: Send {
    /// Smallest read the hardware supports, in bytes.
    fn min_buffer_bytes(&self) -> usize;

    /// Turn on platform echo cancellation / noise suppression.
    /// Returns false when the platform has none; that is not an error.
    fn enable_voice_processing(&mut self) -> bool {
        false
    }

    /// Block until samples are available and copy them into `buf`.
    ///
    /// `Ok(0)` means nothing was read (e.g. after an overrun was recovered).
    /// `Err` is unrecoverable for this session.
    fn read(&mut self, buf: &mut [i16]) -> Result<usize>;
}

/// An open speaker.
pub trait PlaybackDevice: Send {
    /// Smallest hardware buffer, in bytes.
    fn min_buffer_bytes(&self) -> usize;

    /// Block until the device has accepted `samples` (not until they are
    /// audible). Returns the number of samples accepted.
    fn write(&mut self, samples: &[i16]) -> Result<usize>;

    /// Samples the hardware has actually played since the device was opened.
    ///
    /// A device that returns `None` right after opening has no playback
    /// cursor and the stream falls back to a drain-time estimate. A later
    /// `None` is a transient failure and the last known position is kept.
    fn played_frames(&mut self) -> Option<u64> {
        None
    }

    /// Stop output immediately, discarding anything still buffered.
    fn halt(&mut self) {}
}

pub trait CaptureBackend: Send + Sync {
    fn open_capture(&self, config: &AudioConfig) -> Result<Box<dyn CaptureDevice>>;
}

pub trait PlaybackBackend: Send + Sync {
    fn open_playback(&self, config: &AudioConfig) -> Result<Box<dyn PlaybackDevice>>;
}

/// Yes/no answer to "may we use the microphone".
pub trait MicPermission: Send + Sync {
    fn is_granted(&self) -> bool;
}
