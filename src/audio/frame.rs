use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use super::BYTES_PER_SAMPLE;

/// One chunk of S16LE mono PCM, moved as a unit between components.
///
/// Backed by `Bytes`, so clones share the buffer and the payload can be
/// handed to the WebSocket layer without copying. Frames are never mutated
/// after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    data: Bytes,
}

impl AudioFrame {
    /// Encode samples into the canonical little-endian byte layout.
    pub fn from_samples(samples: &[i16]) -> Self {
        let mut buf = BytesMut::with_capacity(samples.len() * BYTES_PER_SAMPLE);
        for &sample in samples {
            buf.put_i16_le(sample);
        }
        Self { data: buf.freeze() }
    }

    /// Wrap raw PCM bytes received from the network.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn len_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() < BYTES_PER_SAMPLE
    }

    /// Number of whole samples; a trailing odd byte is ignored.
    pub fn sample_count(&self) -> usize {
        self.data.len() / BYTES_PER_SAMPLE
    }

    /// Decode into samples for a device write.
    pub fn samples(&self) -> Vec<i16> {
        self.data
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    /// Playback time of this frame at `sample_rate`.
    pub fn duration(&self, sample_rate: u32) -> Duration {
        let samples = self.sample_count() as u64;
        Duration::from_micros(samples * 1_000_000 / u64::from(sample_rate.max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_little_endian() {
        let frame = AudioFrame::from_samples(&[1, -2, 0x1234]);
        assert_eq!(frame.as_bytes(), &[0x01, 0x00, 0xFE, 0xFF, 0x34, 0x12]);
        assert_eq!(frame.sample_count(), 3);
        assert_eq!(frame.samples(), vec![1, -2, 0x1234]);
    }

    #[test]
    fn odd_trailing_byte_is_not_a_sample() {
        let frame = AudioFrame::from_bytes(vec![0x10, 0x00, 0x7F]);
        assert_eq!(frame.sample_count(), 1);
        assert_eq!(frame.samples(), vec![0x10]);
        assert!(AudioFrame::from_bytes(vec![0x01]).is_empty());
    }

    #[test]
    fn duration_follows_sample_rate() {
        let frame = AudioFrame::from_samples(&[0; 1600]);
        assert_eq!(frame.duration(16000), Duration::from_millis(100));
    }
}
