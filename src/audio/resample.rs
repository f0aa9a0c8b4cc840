//! 设备采样率与引擎采样率之间的流式线性插值转换。

/// 跨块保持相位的线性插值重采样器。
#[derive(Debug)]
pub(crate) struct StreamResampler {
    from_rate: u32,
    to_rate: u32,
    step: f64,
    position: f64,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub(crate) fn new(from_rate: u32, to_rate: u32) -> Self {
        let step = if to_rate == 0 {
            1.0
        } else {
            from_rate as f64 / to_rate as f64
        };
        Self {
            from_rate,
            to_rate,
            step,
            position: 0.0,
            pending: Vec::new(),
        }
    }

    fn passthrough(&self) -> bool {
        self.from_rate == 0 || self.to_rate == 0 || self.from_rate == self.to_rate
    }

    pub(crate) fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.passthrough() {
            return input.to_vec();
        }
        self.pending.extend_from_slice(input);
        let mut output = Vec::with_capacity((input.len() as f64 / self.step) as usize + 1);
        self.interpolate(&mut output);

        // 保留插值所需的最后一个样本
        let consumed = (self.position.floor() as usize).min(self.pending.len().saturating_sub(1));
        if consumed > 0 {
            self.pending.drain(..consumed);
            self.position -= consumed as f64;
        }
        output
    }

    pub(crate) fn finish(&mut self) -> Vec<f32> {
        if self.passthrough() {
            self.position = 0.0;
            return std::mem::take(&mut self.pending);
        }
        let mut output = Vec::new();
        if let Some(last) = self.pending.last().copied() {
            self.pending.push(last);
            self.interpolate(&mut output);
        }
        self.pending.clear();
        self.position = 0.0;
        output
    }

    fn interpolate(&mut self, output: &mut Vec<f32>) {
        while self.position + 1.0 < self.pending.len() as f64 {
            let base = self.position.floor() as usize;
            let frac = (self.position - base as f64) as f32;
            let current = self.pending[base];
            let next = self.pending[base + 1];
            output.push(current + (next - current) * frac);
            self.position += self.step;
        }
    }
}

/// 把交错的多声道样本平均为单声道。
pub(crate) fn downmix<T>(data: &[T], channels: usize) -> Vec<f32>
where
    T: Copy + Into<f32>,
{
    if channels <= 1 {
        return data.iter().map(|sample| (*sample).into()).collect();
    }
    data.chunks(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|sample| (*sample).into()).sum();
            sum / frame.len() as f32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downsamples_48k_to_realtime_rate() {
        let mut resampler = StreamResampler::new(48_000, 24_000);
        let input: Vec<f32> = (0..480).map(|idx| (idx as f32 / 48.0).sin()).collect();
        let output = resampler.process(&input);
        assert!(
            (output.len() as i32 - 240).abs() <= 1,
            "expected roughly 240 samples, got {}",
            output.len()
        );
    }

    #[test]
    fn streams_44100_in_blocks_without_drift() {
        let mut resampler = StreamResampler::new(44_100, 24_000);
        let signal: Vec<f32> = (0..4410).map(|idx| (idx as f32 / 100.0).sin()).collect();
        let mut combined = Vec::new();
        for block in signal.chunks(441) {
            combined.extend(resampler.process(block));
        }
        combined.extend(resampler.finish());
        assert!(
            (combined.len() as i32 - 2400).abs() <= 2,
            "expected approx 2400 samples, got {}",
            combined.len()
        );
        assert!(combined.iter().all(|value| value.abs() <= 1.0 + f32::EPSILON));
    }

    #[test]
    fn upsampling_interpolates_between_samples() {
        let mut resampler = StreamResampler::new(12_000, 24_000);
        let output = resampler.process(&[0.0, 1.0, 0.0]);
        assert_eq!(output.len(), 4);
        assert!((output[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn equal_rates_pass_through() {
        let mut resampler = StreamResampler::new(24_000, 24_000);
        assert_eq!(resampler.process(&[0.25, -0.25]), vec![0.25, -0.25]);
        assert!(resampler.finish().is_empty());
    }

    #[test]
    fn downmix_averages_channels() {
        let stereo = [1.0_f32, 0.0, -1.0, -1.0];
        assert_eq!(downmix(&stereo, 2), vec![0.5, -1.0]);
    }
}
