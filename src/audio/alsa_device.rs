//! ALSA PCM device wrappers for audio capture and playback.

use alsa::pcm::{Access, Format, HwParams, PCM, State};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result, bail};

use super::device::{CaptureBackend, CaptureDevice, MicPermission, PlaybackBackend, PlaybackDevice};
use super::{AudioConfig, BYTES_PER_SAMPLE};

/// Mono is the only layout the agent protocol speaks.
const CHANNELS: u32 = 1;

/// Consecutive XRUN recoveries tolerated for one write before the rest of
/// the frame is dropped.
const MAX_RECOVERY_RETRIES: u32 = 3;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Period size in frames (one frame = one mono sample here)
    pub period_size: usize,
    /// Ring buffer size in frames
    pub buffer_size: usize,
}

/// Opens capture and playback devices through ALSA.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlsaBackend;

impl CaptureBackend for AlsaBackend {
    fn open_capture(&self, config: &AudioConfig) -> Result<Box<dyn CaptureDevice>> {
        let (pcm, params) = open_pcm(&config.capture_device, Direction::Capture, config.sample_rate)?;
        pcm.prepare()?;
        Ok(Box::new(AlsaCapture { pcm, params }))
    }
}

impl PlaybackBackend for AlsaBackend {
    fn open_playback(&self, config: &AudioConfig) -> Result<Box<dyn PlaybackDevice>> {
        let (pcm, params) = open_pcm(&config.playback_device, Direction::Playback, config.sample_rate)?;

        // Start on the first written frame so a short tail is never held back
        // waiting for a full period.
        {
            let swp = pcm.sw_params_current()?;
            swp.set_start_threshold(1)?;
            pcm.sw_params(&swp)?;
        }
        pcm.prepare()?;

        Ok(Box::new(AlsaPlayback {
            pcm,
            params,
            written: 0,
        }))
    }
}

/// Microphone access on Linux: granted iff the capture device can be opened.
#[derive(Debug, Clone)]
pub struct AlsaMicPermission {
    device: String,
}

impl AlsaMicPermission {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

impl MicPermission for AlsaMicPermission {
    fn is_granted(&self) -> bool {
        // Non-blocking probe; the handle is closed again on drop.
        match PCM::new(&self.device, Direction::Capture, true) {
            Ok(_) => true,
            Err(e) => {
                log::warn!("Capture device '{}' not accessible: {}", self.device, e);
                false
            }
        }
    }
}

struct AlsaCapture {
    pcm: PCM,
    params: AlsaParams,
}

impl CaptureDevice for AlsaCapture {
    fn min_buffer_bytes(&self) -> usize {
        self.params.period_size * BYTES_PER_SAMPLE
    }

    fn enable_voice_processing(&mut self) -> bool {
        // ALSA exposes no echo canceller or noise suppressor of its own.
        false
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize> {
        let io = self.pcm.io_i16()?;
        match io.readi(buf) {
            Ok(frames) => Ok(frames),
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                self.pcm
                    .prepare()
                    .with_context(|| format!("Failed to recover PCM capture after: {}", e))?;
                Ok(0)
            }
        }
    }
}

struct AlsaPlayback {
    pcm: PCM,
    params: AlsaParams,
    /// Frames accepted by `writei` since the device was opened
    written: u64,
}

impl PlaybackDevice for AlsaPlayback {
    fn min_buffer_bytes(&self) -> usize {
        self.params.buffer_size * BYTES_PER_SAMPLE
    }

    fn write(&mut self, samples: &[i16]) -> Result<usize> {
        let io = self.pcm.io_i16()?;
        // Retry loop to handle short writes and XRUN recovery without losing frames.
        let mut frames_written = 0;
        let mut retry_count = 0u32;

        while frames_written < samples.len() {
            match io.writei(&samples[frames_written..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;

                    self.pcm
                        .prepare()
                        .with_context(|| format!("Failed to recover PCM playback after: {}", e))?;

                    // 熔断器：底层持续跟不上写入速度时，丢弃剩余帧防止死循环
                    if retry_count >= MAX_RECOVERY_RETRIES {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            samples.len() - frames_written
                        );
                        break;
                    }
                }
            }
        }

        self.written += frames_written as u64;
        Ok(frames_written)
    }

    fn played_frames(&mut self) -> Option<u64> {
        let pending = match self.pcm.state() {
            State::Running | State::Draining | State::Paused => match self.pcm.delay() {
                Ok(delay) => u64::try_from(delay).unwrap_or(0),
                Err(e) => {
                    log::debug!("snd_pcm_delay failed: {}", e);
                    return None;
                }
            },
            // Underrun or not started: nothing is left in the hardware buffer.
            _ => 0,
        };
        Some(self.written.saturating_sub(pending))
    }

    fn halt(&mut self) {
        if let Err(e) = self.pcm.drop() {
            log::debug!("snd_pcm_drop failed: {}", e);
        }
    }
}

fn open_pcm(device: &str, direction: Direction, sample_rate: u32) -> Result<(PCM, AlsaParams)> {
    let dir_name = match direction {
        Direction::Capture => "Capture",
        Direction::Playback => "Playback",
    };

    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    // Configure hardware parameters
    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(CHANNELS)?;
        hwp.set_rate(sample_rate, ValueOr::Nearest)
            .with_context(|| format!("{} device '{}' does not support {} Hz", dir_name, device, sample_rate))?;
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            period_size: hwp.get_period_size()? as usize,
            buffer_size: hwp.get_buffer_size()? as usize,
        }
    };

    if params.sample_rate != sample_rate {
        bail!(
            "{} device '{}' negotiated {} Hz instead of {} Hz",
            dir_name,
            device,
            params.sample_rate,
            sample_rate
        );
    }

    log::info!(
        "ALSA {}: device={}, rate={}, period_size={}, buffer_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.period_size,
        params.buffer_size,
    );

    Ok((pcm, params))
}
