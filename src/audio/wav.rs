use hound::{SampleFormat as WavSampleFormat, WavReader, WavSpec, WavWriter};
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WavError {
    #[error("failed to encode wave data: {0}")]
    Encode(#[source] hound::Error),
    #[error("failed to decode wave data: {0}")]
    Decode(#[source] hound::Error),
    #[error("unsupported wave layout: {channels} channel(s), {bits} bits")]
    Unsupported { channels: u16, bits: u16 },
}

/// 把单声道 PCM16 样本编码为 WAV 容器。
pub fn encode_pcm16(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, WavError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: WavSampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec).map_err(WavError::Encode)?;
        for sample in samples {
            writer.write_sample(*sample).map_err(WavError::Encode)?;
        }
        writer.finalize().map_err(WavError::Encode)?;
    }
    Ok(cursor.into_inner())
}

/// 解码单声道 PCM16 WAV，返回样本与采样率。
pub fn decode_pcm16(bytes: &[u8]) -> Result<(Vec<i16>, u32), WavError> {
    let reader = WavReader::new(Cursor::new(bytes)).map_err(WavError::Decode)?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.bits_per_sample != 16 || spec.sample_format != WavSampleFormat::Int {
        return Err(WavError::Unsupported {
            channels: spec.channels,
            bits: spec.bits_per_sample,
        });
    }
    let samples = reader
        .into_samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(WavError::Decode)?;
    Ok((samples, spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_recording_yields_header_only_wave() {
        let bytes = encode_pcm16(&[], 44_100).expect("encode");
        assert_eq!(&bytes[..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");

        let (samples, rate) = decode_pcm16(&bytes).expect("decode");
        assert!(samples.is_empty());
        assert_eq!(rate, 44_100);
    }

    #[test]
    fn decode_keeps_samples_and_rate() {
        let bytes = encode_pcm16(&[0, 100, -100, i16::MAX], 24_000).expect("encode");
        let (samples, rate) = decode_pcm16(&bytes).expect("decode");
        assert_eq!(samples, vec![0, 100, -100, i16::MAX]);
        assert_eq!(rate, 24_000);
    }

    #[test]
    fn stereo_wave_is_rejected() {
        let spec = WavSpec {
            channels: 2,
            sample_rate: 24_000,
            bits_per_sample: 16,
            sample_format: WavSampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).expect("writer");
            writer.write_sample(0i16).expect("left");
            writer.write_sample(0i16).expect("right");
            writer.finalize().expect("finalize");
        }

        let err = decode_pcm16(&cursor.into_inner()).expect_err("stereo must fail");
        assert!(matches!(err, WavError::Unsupported { channels: 2, .. }));
    }
}
