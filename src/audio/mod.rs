//! 音频采集、播放与编解码。

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;

pub mod capture;
pub mod device;
pub mod playback;
pub mod resample;
pub mod spectrum;
pub mod wav;

#[cfg(test)]
pub(crate) mod testing;

pub use capture::{
    AudioCapture, CaptureBackend, CaptureError, CaptureOptions, CaptureSink, CaptureStream, RecordedAudio,
};
pub use device::{CpalInput, CpalOutput};
pub use playback::{AudioPlayback, OutputStream, PlaybackBackend, PlaybackError, PlaybackRenderer, TrackOffset};
pub use spectrum::{FrequencySnapshot, FrequencyView};

/// 实时通道使用的采样率。
pub const REALTIME_SAMPLE_RATE: u32 = 24_000;
/// 独立语音输入（转写）使用的采样率。
pub const VOICE_INPUT_SAMPLE_RATE: u32 = 44_100;

/// 单声道 16 位 PCM 帧，生成后不可变。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: impl Into<Arc<[i16]>>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// 由 [-1.0, 1.0] 浮点样本构造，越界部分截断。
    pub fn from_f32(samples: &[f32], sample_rate: u32) -> Self {
        let converted: Vec<i16> = samples.iter().map(|sample| f32_to_i16(*sample)).collect();
        Self::new(converted, sample_rate)
    }

    /// 解析小端 PCM16 字节流，末尾不足两字节的部分被丢弃。
    pub fn from_le_bytes(bytes: &[u8], sample_rate: u32) -> Self {
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self::new(samples, sample_rate)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn shared_samples(&self) -> Arc<[i16]> {
        Arc::clone(&self.samples)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    pub fn to_le_bytes(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(self.samples.len() * 2);
        for sample in self.samples.iter() {
            buffer.put_i16_le(*sample);
        }
        buffer.freeze()
    }
}

pub(crate) fn f32_to_i16(sample: f32) -> i16 {
    (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

pub(crate) fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn le_bytes_preserve_sample_order() {
        let frame = AudioFrame::new(vec![1, -2, i16::MAX, i16::MIN], REALTIME_SAMPLE_RATE);
        let bytes = frame.to_le_bytes();
        assert_eq!(&bytes[..4], &[1, 0, 0xfe, 0xff]);

        let decoded = AudioFrame::from_le_bytes(&bytes, REALTIME_SAMPLE_RATE);
        assert_eq!(decoded, frame);
    }

    #[test]
    fn odd_trailing_byte_is_ignored() {
        let frame = AudioFrame::from_le_bytes(&[0x10, 0x00, 0x7f], REALTIME_SAMPLE_RATE);
        assert_eq!(frame.samples(), &[16]);
    }

    #[test]
    fn duration_follows_sample_rate() {
        let frame = AudioFrame::new(vec![0; 12_000], REALTIME_SAMPLE_RATE);
        assert_eq!(frame.duration(), Duration::from_millis(500));
        assert_eq!(AudioFrame::new(vec![0; 4], 0).duration(), Duration::ZERO);
    }

    #[test]
    fn float_conversion_clamps() {
        let frame = AudioFrame::from_f32(&[2.0, -2.0, 0.0], VOICE_INPUT_SAMPLE_RATE);
        assert_eq!(frame.samples(), &[i16::MAX, i16::MIN, 0]);
    }
}
