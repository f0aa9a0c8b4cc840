//! 麦克风采集：固定节奏出帧、频谱快照与整段录音导出。

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::spectrum::{FrequencyAnalyser, FrequencySnapshot, FrequencyView};
use super::wav::{self, WavError};
use super::AudioFrame;

const TARGET: &str = "audio_capture";
pub const DEFAULT_FRAME_SAMPLES: usize = 4_096;

/// 设备线程把原始 PCM16 单声道样本推给采集器的入口。
pub type CaptureSink = Arc<dyn Fn(&[i16]) + Send + Sync>;
type FrameCallback = Arc<dyn Fn(AudioFrame) + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("audio input device unavailable: {message}")]
    DeviceUnavailable { message: String },
    #[error("capture has not begun")]
    NotStarted,
    #[error("failed to export recording: {message}")]
    Export { message: String },
}

impl CaptureError {
    pub fn device_unavailable(message: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            message: message.into(),
        }
    }

    pub fn export(message: impl Into<String>) -> Self {
        Self::Export {
            message: message.into(),
        }
    }
}

impl From<WavError> for CaptureError {
    fn from(err: WavError) -> Self {
        CaptureError::export(err.to_string())
    }
}

/// 打开输入设备的抽象，设备以 `sample_rate` 单声道 PCM16 调用 sink。
pub trait CaptureBackend: Send + Sync {
    fn open(&self, sample_rate: u32, sink: CaptureSink) -> Result<Box<dyn CaptureStream>, CaptureError>;
}

/// 已打开的输入流，drop 或 `stop` 后释放设备。
pub trait CaptureStream: Send {
    fn stop(&mut self);
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    pub frame_samples: usize,
    /// 是否累积整段录音供 `end` 导出。
    pub retain_recording: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            frame_samples: DEFAULT_FRAME_SAMPLES,
            retain_recording: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedAudio {
    pub wav: Bytes,
    pub size: usize,
    pub sample_rate: u32,
    pub samples: usize,
}

struct CaptureShared {
    frame_samples: usize,
    retain_recording: bool,
    recording: AtomicBool,
    on_frame: Mutex<Option<FrameCallback>>,
    pending: Mutex<Vec<i16>>,
    recorded: Mutex<Vec<i16>>,
    analyser: Mutex<FrequencyAnalyser>,
    sample_rate: AtomicU32,
}

impl CaptureShared {
    fn ingest(&self, samples: &[i16]) {
        if let Ok(mut analyser) = self.analyser.try_lock() {
            analyser.push(samples);
        }
        if !self.recording.load(Ordering::Acquire) {
            return;
        }

        let sample_rate = self.sample_rate.load(Ordering::Acquire);
        let frames = {
            let Ok(mut pending) = self.pending.lock() else {
                return;
            };
            pending.extend_from_slice(samples);
            let mut frames = Vec::new();
            while pending.len() >= self.frame_samples {
                let chunk: Vec<i16> = pending.drain(..self.frame_samples).collect();
                frames.push(AudioFrame::new(chunk, sample_rate));
            }
            frames
        };
        if frames.is_empty() {
            return;
        }

        if self.retain_recording {
            if let Ok(mut recorded) = self.recorded.lock() {
                for frame in &frames {
                    recorded.extend_from_slice(frame.samples());
                }
            }
        }

        let callback = self.on_frame.lock().ok().and_then(|slot| slot.clone());
        if let Some(callback) = callback {
            for frame in frames {
                callback(frame);
            }
        }
    }

    fn drain_pending(&self) {
        let rest = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return,
        };
        if self.retain_recording && !rest.is_empty() {
            if let Ok(mut recorded) = self.recorded.lock() {
                recorded.extend_from_slice(&rest);
            }
        }
    }

    fn take_recorded(&self) -> Vec<i16> {
        self.recorded
            .lock()
            .map(|mut recorded| std::mem::take(&mut *recorded))
            .unwrap_or_default()
    }
}

/// 麦克风采集器。一次 `begin` 只持有一个设备句柄。
pub struct AudioCapture {
    backend: Arc<dyn CaptureBackend>,
    shared: Arc<CaptureShared>,
    stream: Mutex<Option<Box<dyn CaptureStream>>>,
}

impl std::fmt::Debug for AudioCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCapture")
            .field("is_open", &self.is_open())
            .field("is_recording", &self.is_recording())
            .finish_non_exhaustive()
    }
}

impl AudioCapture {
    pub fn new(backend: Arc<dyn CaptureBackend>, options: CaptureOptions) -> Self {
        Self {
            backend,
            shared: Arc::new(CaptureShared {
                frame_samples: options.frame_samples.max(1),
                retain_recording: options.retain_recording,
                recording: AtomicBool::new(false),
                on_frame: Mutex::new(None),
                pending: Mutex::new(Vec::new()),
                recorded: Mutex::new(Vec::new()),
                analyser: Mutex::new(FrequencyAnalyser::new(0)),
                sample_rate: AtomicU32::new(0),
            }),
            stream: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::Acquire)
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate.load(Ordering::Acquire)
    }

    /// 申请麦克风。已经打开时直接返回，不会重复占用设备。
    pub async fn begin(&self, sample_rate: u32) -> Result<(), CaptureError> {
        if self.is_open() {
            debug!(target: TARGET, "capture already begun");
            return Ok(());
        }

        self.shared.sample_rate.store(sample_rate, Ordering::Release);
        if let Ok(mut analyser) = self.shared.analyser.lock() {
            analyser.reset(sample_rate);
        }

        let backend = Arc::clone(&self.backend);
        let shared = Arc::clone(&self.shared);
        let sink: CaptureSink = Arc::new(move |samples: &[i16]| shared.ingest(samples));
        let stream = tokio::task::spawn_blocking(move || backend.open(sample_rate, sink))
            .await
            .map_err(|err| CaptureError::device_unavailable(format!("device task failed: {err}")))??;

        let mut slot = self
            .stream
            .lock()
            .map_err(|_| CaptureError::device_unavailable("capture state poisoned"))?;
        if slot.is_some() {
            // 并发 begin：保留先到者
            let mut duplicate = stream;
            duplicate.stop();
            return Ok(());
        }
        *slot = Some(stream);
        info!(target: TARGET, sample_rate, "microphone acquired");
        Ok(())
    }

    /// 开始按固定节奏回调帧。回调运行在采集线程上，必须尽快返回。
    pub fn record<F>(&self, on_frame: F) -> Result<(), CaptureError>
    where
        F: Fn(AudioFrame) + Send + Sync + 'static,
    {
        if !self.is_open() {
            return Err(CaptureError::NotStarted);
        }
        if let Ok(mut slot) = self.shared.on_frame.lock() {
            *slot = Some(Arc::new(on_frame));
        }
        self.shared.recording.store(true, Ordering::Release);
        debug!(target: TARGET, frame_samples = self.shared.frame_samples, "recording started");
        Ok(())
    }

    /// 暂停出帧，保留设备。
    pub fn pause(&self) {
        self.shared.recording.store(false, Ordering::Release);
    }

    /// 非阻塞地读取最新窗口的频谱，分析器被占用时返回同形状的静音快照。
    pub fn get_frequencies(&self, view: FrequencyView) -> FrequencySnapshot {
        match self.shared.analyser.try_lock() {
            Ok(analyser) => analyser.snapshot(view),
            Err(_) => FrequencySnapshot::silent(view, self.sample_rate()),
        }
    }

    /// 停止采集、释放设备，并把累积的录音导出为 WAV。
    pub async fn end(&self) -> Result<RecordedAudio, CaptureError> {
        self.release();
        self.shared.drain_pending();

        let samples = self.shared.take_recorded();
        let sample_rate = self.sample_rate();
        let sample_count = samples.len();
        let wav = tokio::task::spawn_blocking(move || wav::encode_pcm16(&samples, sample_rate))
            .await
            .map_err(|err| CaptureError::export(format!("encode task failed: {err}")))??;

        info!(target: TARGET, samples = sample_count, bytes = wav.len(), "recording exported");
        Ok(RecordedAudio {
            size: wav.len(),
            wav: Bytes::from(wav),
            sample_rate,
            samples: sample_count,
        })
    }

    /// 立即释放设备，丢弃未导出的录音。
    pub fn quit(&self) {
        self.release();
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.clear();
        }
        drop(self.shared.take_recorded());
    }

    fn release(&self) {
        self.shared.recording.store(false, Ordering::Release);
        if let Ok(mut slot) = self.shared.on_frame.lock() {
            slot.take();
        }
        let stream = match self.stream.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut stream) = stream {
            stream.stop();
            info!(target: TARGET, "microphone released");
        } else {
            debug!(target: TARGET, "release requested without open device");
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        if self.is_open() {
            warn!(target: TARGET, "capture dropped while open; releasing device");
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::FakeMicrophone;
    use std::sync::atomic::AtomicUsize;

    fn capture(backend: &Arc<FakeMicrophone>, frame_samples: usize, retain: bool) -> AudioCapture {
        AudioCapture::new(
            backend.clone() as Arc<dyn CaptureBackend>,
            CaptureOptions {
                frame_samples,
                retain_recording: retain,
            },
        )
    }

    #[tokio::test]
    async fn begin_is_idempotent() {
        let backend = Arc::new(FakeMicrophone::default());
        let capture = capture(&backend, 4, false);

        capture.begin(24_000).await.expect("first begin");
        capture.begin(24_000).await.expect("second begin");

        assert_eq!(backend.opened(), 1);
        assert!(capture.is_open());
    }

    #[tokio::test]
    async fn denied_permission_surfaces_device_unavailable() {
        let backend = Arc::new(FakeMicrophone::default());
        backend.deny_permission();
        let capture = capture(&backend, 4, false);

        let err = capture.begin(24_000).await.expect_err("denied");
        assert!(matches!(err, CaptureError::DeviceUnavailable { .. }));
        assert!(!capture.is_open());
    }

    #[tokio::test]
    async fn frames_are_chunked_in_capture_order() {
        let backend = Arc::new(FakeMicrophone::default());
        let capture = capture(&backend, 4, false);
        capture.begin(24_000).await.expect("begin");

        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        capture
            .record(move |frame| sink.lock().unwrap().push(frame))
            .expect("record");

        backend.push(&[1, 2, 3]);
        backend.push(&[4, 5, 6, 7, 8, 9]);

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples(), &[1, 2, 3, 4]);
        assert_eq!(frames[1].samples(), &[5, 6, 7, 8]);
        assert!(frames.iter().all(|frame| frame.sample_rate() == 24_000));
    }

    #[tokio::test]
    async fn paused_capture_keeps_device_but_stops_frames() {
        let backend = Arc::new(FakeMicrophone::default());
        let capture = capture(&backend, 2, false);
        capture.begin(24_000).await.expect("begin");

        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        capture
            .record(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("record");

        backend.push(&[0; 4]);
        capture.pause();
        backend.push(&[0; 4]);

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(capture.is_open());
    }

    #[tokio::test]
    async fn end_without_record_returns_empty_wave() {
        let backend = Arc::new(FakeMicrophone::default());
        let capture = capture(&backend, 4, true);
        capture.begin(44_100).await.expect("begin");

        let recorded = capture.end().await.expect("end");
        assert_eq!(recorded.samples, 0);
        assert_eq!(recorded.sample_rate, 44_100);
        assert_eq!(recorded.size, recorded.wav.len());

        let (samples, rate) = wav::decode_pcm16(&recorded.wav).expect("decode");
        assert!(samples.is_empty());
        assert_eq!(rate, 44_100);
        assert_eq!(backend.stopped(), 1);
    }

    #[tokio::test]
    async fn end_exports_retained_audio_including_partial_frame() {
        let backend = Arc::new(FakeMicrophone::default());
        let capture = capture(&backend, 4, true);
        capture.begin(44_100).await.expect("begin");
        capture.record(|_| {}).expect("record");

        backend.push(&[10, 20, 30, 40, 50, 60]);
        let recorded = capture.end().await.expect("end");

        let (samples, _) = wav::decode_pcm16(&recorded.wav).expect("decode");
        assert_eq!(samples, vec![10, 20, 30, 40, 50, 60]);
        assert!(!capture.is_open());
    }

    #[tokio::test]
    async fn quit_releases_device_mid_capture() {
        let backend = Arc::new(FakeMicrophone::default());
        let capture = capture(&backend, 4, true);
        capture.begin(24_000).await.expect("begin");
        capture.record(|_| {}).expect("record");
        backend.push(&[1; 8]);

        capture.quit();

        assert!(!capture.is_open());
        assert!(!capture.is_recording());
        assert_eq!(backend.stopped(), 1);
        let recorded = capture.end().await.expect("end after quit");
        assert_eq!(recorded.samples, 0);
    }

    #[tokio::test]
    async fn record_requires_begin() {
        let backend = Arc::new(FakeMicrophone::default());
        let capture = capture(&backend, 4, false);
        assert_eq!(capture.record(|_| {}), Err(CaptureError::NotStarted));
    }

    #[tokio::test]
    async fn frequencies_follow_captured_audio() {
        let backend = Arc::new(FakeMicrophone::default());
        let capture = capture(&backend, 4_096, false);
        capture.begin(24_000).await.expect("begin");

        let silent = capture.get_frequencies(FrequencyView::Voice);
        assert_eq!(silent.peak(), 0.0);

        let tone: Vec<i16> = (0..2_048)
            .map(|idx| {
                let phase = 2.0 * std::f32::consts::PI * 843.75 * idx as f32 / 24_000.0;
                (phase.sin() * 12_000.0) as i16
            })
            .collect();
        backend.push(&tone);
        let snapshot = capture.get_frequencies(FrequencyView::Frequency);
        assert!(snapshot.peak() > 0.5);
    }
}
