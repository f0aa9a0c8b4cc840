//! 录音电平的频谱快照，用于驱动可视化。

use serde::Serialize;
use std::f32::consts::PI;

pub(crate) const ANALYSIS_WINDOW: usize = 1024;
const LINEAR_BINS: usize = 64;
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;
const VOICE_MIN_HZ: f32 = 32.0;
const VOICE_MAX_HZ: f32 = 2_000.0;
const NOTE_NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];
// C1 ..= B8
const FIRST_NOTE_MIDI: u8 = 24;
const LAST_NOTE_MIDI: u8 = 119;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyView {
    /// 线性分桶，覆盖到奈奎斯特频率。
    Frequency,
    /// 按十二平均律音符分桶。
    Music,
    /// 仅保留人声范围内的音符。
    Voice,
}

impl FrequencyView {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrequencyView::Frequency => "frequency",
            FrequencyView::Music => "music",
            FrequencyView::Voice => "voice",
        }
    }
}

/// 归一化到 0..=1 的频谱能量。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrequencySnapshot {
    pub values: Vec<f32>,
    pub frequencies: Vec<f32>,
    pub labels: Vec<Option<String>>,
}

impl FrequencySnapshot {
    /// 与 `view` 形状一致的静音快照。
    pub fn silent(view: FrequencyView, sample_rate: u32) -> Self {
        let (frequencies, labels) = bins_for(view, sample_rate);
        Self {
            values: vec![0.0; frequencies.len()],
            frequencies,
            labels,
        }
    }

    pub fn peak(&self) -> f32 {
        self.values.iter().copied().fold(0.0, f32::max)
    }
}

/// 固定长度的环形窗口，采集回调写入，读取方按需计算。
#[derive(Debug)]
pub(crate) struct FrequencyAnalyser {
    sample_rate: u32,
    window: Vec<f32>,
    hann: Vec<f32>,
    hann_sum: f32,
    cursor: usize,
}

impl FrequencyAnalyser {
    pub(crate) fn new(sample_rate: u32) -> Self {
        let hann: Vec<f32> = (0..ANALYSIS_WINDOW)
            .map(|idx| 0.5 - 0.5 * (2.0 * PI * idx as f32 / (ANALYSIS_WINDOW - 1) as f32).cos())
            .collect();
        let hann_sum = hann.iter().sum();
        Self {
            sample_rate,
            window: vec![0.0; ANALYSIS_WINDOW],
            hann,
            hann_sum,
            cursor: 0,
        }
    }

    pub(crate) fn reset(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
        self.window.iter_mut().for_each(|value| *value = 0.0);
        self.cursor = 0;
    }

    pub(crate) fn push(&mut self, samples: &[i16]) {
        for sample in samples {
            self.window[self.cursor] = super::i16_to_f32(*sample);
            self.cursor = (self.cursor + 1) % ANALYSIS_WINDOW;
        }
    }

    pub(crate) fn snapshot(&self, view: FrequencyView) -> FrequencySnapshot {
        let (frequencies, labels) = bins_for(view, self.sample_rate);
        let windowed: Vec<f32> = (0..ANALYSIS_WINDOW)
            .map(|idx| self.window[(self.cursor + idx) % ANALYSIS_WINDOW] * self.hann[idx])
            .collect();
        let values = frequencies
            .iter()
            .map(|frequency| {
                let magnitude = goertzel(&windowed, *frequency, self.sample_rate);
                normalise_decibels(2.0 * magnitude / self.hann_sum)
            })
            .collect();
        FrequencySnapshot {
            values,
            frequencies,
            labels,
        }
    }
}

fn goertzel(samples: &[f32], frequency: f32, sample_rate: u32) -> f32 {
    if sample_rate == 0 {
        return 0.0;
    }
    let omega = 2.0 * PI * frequency / sample_rate as f32;
    let coeff = 2.0 * omega.cos();
    let (mut s1, mut s2) = (0.0_f32, 0.0_f32);
    for sample in samples {
        let s0 = sample + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
    }
    let power = s1 * s1 + s2 * s2 - coeff * s1 * s2;
    power.max(0.0).sqrt()
}

fn normalise_decibels(amplitude: f32) -> f32 {
    if amplitude <= 0.0 {
        return 0.0;
    }
    let decibels = 20.0 * amplitude.log10();
    ((decibels - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS)).clamp(0.0, 1.0)
}

fn bins_for(view: FrequencyView, sample_rate: u32) -> (Vec<f32>, Vec<Option<String>>) {
    let nyquist = sample_rate as f32 / 2.0;
    match view {
        FrequencyView::Frequency => {
            let width = nyquist / LINEAR_BINS as f32;
            let frequencies = (0..LINEAR_BINS).map(|idx| (idx as f32 + 0.5) * width).collect();
            (frequencies, vec![None; LINEAR_BINS])
        }
        FrequencyView::Music | FrequencyView::Voice => {
            let (min, max) = match view {
                FrequencyView::Voice => (VOICE_MIN_HZ, VOICE_MAX_HZ.min(nyquist)),
                _ => (0.0, nyquist),
            };
            (FIRST_NOTE_MIDI..=LAST_NOTE_MIDI)
                .map(|midi| (note_frequency(midi), note_label(midi)))
                .filter(|(frequency, _)| *frequency >= min && *frequency < max)
                .map(|(frequency, label)| (frequency, Some(label)))
                .unzip()
        }
    }
}

fn note_frequency(midi: u8) -> f32 {
    440.0 * 2f32.powf((midi as f32 - 69.0) / 12.0)
}

fn note_label(midi: u8) -> String {
    let octave = midi as i32 / 12 - 1;
    format!("{}{}", NOTE_NAMES[midi as usize % 12], octave)
}
