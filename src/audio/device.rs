//! 基于 cpal 的系统默认输入/输出设备。
//!
//! cpal 的 `Stream` 不能跨线程移动，因此每个流都运行在独立线程上，
//! 由停止信号结束。

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample, StreamConfig};
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::JoinHandle;
use tracing::{error, info, warn};

use super::capture::{CaptureBackend, CaptureError, CaptureSink, CaptureStream};
use super::playback::{OutputStream, PlaybackBackend, PlaybackError, PlaybackRenderer};
use super::resample::{downmix, StreamResampler};
use super::{f32_to_i16, i16_to_f32};

const RENDER_BLOCK: usize = 256;

/// 设备线程的停止句柄，同时用于输入与输出。
struct DeviceThread {
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceThread {
    fn spawn<E, F>(name: &str, body: F) -> Result<Self, E>
    where
        E: Send + 'static,
        F: FnOnce(SyncSender<Result<(), E>>, Receiver<()>) + Send + 'static,
        E: From<String>,
    {
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(ready_tx, stop_rx))
            .map_err(|err| E::from(format!("failed to spawn device thread: {err}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(E::from("device thread exited before reporting readiness".to_string()))
            }
        }
    }

    fn shutdown(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(target: "audio_device", "device thread panicked during shutdown");
            }
        }
    }
}

impl Drop for DeviceThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl CaptureStream for DeviceThread {
    fn stop(&mut self) {
        self.shutdown();
    }
}

impl OutputStream for DeviceThread {
    fn stop(&mut self) {
        self.shutdown();
    }
}

impl From<String> for CaptureError {
    fn from(message: String) -> Self {
        CaptureError::device_unavailable(message)
    }
}

impl From<String> for PlaybackError {
    fn from(message: String) -> Self {
        PlaybackError::device_unavailable(message)
    }
}

/// 系统默认麦克风。
#[derive(Debug, Default, Clone)]
pub struct CpalInput;

impl CaptureBackend for CpalInput {
    fn open(&self, sample_rate: u32, sink: CaptureSink) -> Result<Box<dyn CaptureStream>, CaptureError> {
        let thread = DeviceThread::spawn::<CaptureError, _>("voxtutor-capture", move |ready, stop| {
            let stream = match open_input(sample_rate, sink) {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = ready.send(Err(err));
                    return;
                }
            };
            let _ = ready.send(Ok(()));
            let _ = stop.recv();
            let _ = stream.pause();
            drop(stream);
        })?;
        Ok(Box::new(thread))
    }
}

fn open_input(target_rate: u32, sink: CaptureSink) -> Result<cpal::Stream, CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| CaptureError::device_unavailable("no default audio input device"))?;
    let label = device.name().unwrap_or_else(|_| "default input".into());
    let supported = device
        .default_input_config()
        .map_err(|err| CaptureError::device_unavailable(format!("failed to query input config: {err}")))?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();

    let stream = match sample_format {
        SampleFormat::F32 => build_input::<f32>(&device, &config, target_rate, sink, |sample| sample),
        SampleFormat::I16 => build_input::<i16>(&device, &config, target_rate, sink, i16_to_f32),
        SampleFormat::U16 => build_input::<u16>(&device, &config, target_rate, sink, |sample| {
            (sample as f32 / u16::MAX as f32) * 2.0 - 1.0
        }),
        other => {
            return Err(CaptureError::device_unavailable(format!(
                "unsupported input sample format: {other:?}"
            )))
        }
    }?;

    stream
        .play()
        .map_err(|err| CaptureError::device_unavailable(format!("failed to start input stream: {err}")))?;
    info!(
        target: "audio_device",
        device = %label,
        device_rate = config.sample_rate.0,
        channels = config.channels,
        target_rate,
        "input stream started"
    );
    Ok(stream)
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    target_rate: u32,
    sink: CaptureSink,
    convert: fn(T) -> f32,
) -> Result<cpal::Stream, CaptureError>
where
    T: SizedSample + Send + 'static,
{
    let channels = config.channels as usize;
    let mut resampler = StreamResampler::new(config.sample_rate.0, target_rate);
    device
        .build_input_stream(
            config,
            move |data: &[T], _| {
                let converted: Vec<f32> = data.iter().map(|sample| convert(*sample)).collect();
                let mono = downmix(&converted, channels);
                let resampled = resampler.process(&mono);
                if resampled.is_empty() {
                    return;
                }
                let pcm: Vec<i16> = resampled.iter().map(|sample| f32_to_i16(*sample)).collect();
                sink(&pcm);
            },
            |err| error!(target: "audio_device", %err, "input stream error"),
            None,
        )
        .map_err(|err| CaptureError::device_unavailable(format!("failed to build input stream: {err}")))
}

/// 系统默认扬声器。
#[derive(Debug, Default, Clone)]
pub struct CpalOutput;

impl PlaybackBackend for CpalOutput {
    fn open(
        &self,
        sample_rate: u32,
        renderer: PlaybackRenderer,
    ) -> Result<Box<dyn OutputStream>, PlaybackError> {
        let thread = DeviceThread::spawn::<PlaybackError, _>("voxtutor-playback", move |ready, stop| {
            let stream = match open_output(sample_rate, renderer) {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = ready.send(Err(err));
                    return;
                }
            };
            let _ = ready.send(Ok(()));
            let _ = stop.recv();
            let _ = stream.pause();
            drop(stream);
        })?;
        Ok(Box::new(thread))
    }
}

/// 以设备时钟拉取渲染器，并把 24 kHz 单声道转换到设备格式。
struct OutputPump {
    renderer: PlaybackRenderer,
    resampler: StreamResampler,
    carry: VecDeque<f32>,
    block: Vec<i16>,
}

impl OutputPump {
    fn new(renderer: PlaybackRenderer, source_rate: u32, device_rate: u32) -> Self {
        Self {
            renderer,
            resampler: StreamResampler::new(source_rate, device_rate),
            carry: VecDeque::new(),
            block: vec![0; RENDER_BLOCK],
        }
    }

    /// 打断后丢弃已渲染但尚未交给设备的样本。
    fn discard_if_interrupted(&mut self) {
        if self.renderer.is_interrupted() && !self.carry.is_empty() {
            self.carry.clear();
            let _ = self.resampler.finish();
        }
    }

    fn next_frame(&mut self) -> f32 {
        while self.carry.is_empty() {
            self.renderer.render(&mut self.block);
            let input: Vec<f32> = self.block.iter().map(|sample| i16_to_f32(*sample)).collect();
            self.carry.extend(self.resampler.process(&input));
        }
        self.carry.pop_front().unwrap_or(0.0)
    }
}

fn open_output(source_rate: u32, renderer: PlaybackRenderer) -> Result<cpal::Stream, PlaybackError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| PlaybackError::device_unavailable("no default audio output device"))?;
    let supported = device
        .default_output_config()
        .map_err(|err| PlaybackError::device_unavailable(format!("failed to query output config: {err}")))?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();
    let pump = OutputPump::new(renderer, source_rate, config.sample_rate.0);

    let stream = match sample_format {
        SampleFormat::F32 => build_output::<f32>(&device, &config, pump, |value| value),
        SampleFormat::I16 => build_output::<i16>(&device, &config, pump, f32_to_i16),
        SampleFormat::U16 => build_output::<u16>(&device, &config, pump, |value| {
            (((value.clamp(-1.0, 1.0) + 1.0) / 2.0) * u16::MAX as f32) as u16
        }),
        other => {
            return Err(PlaybackError::device_unavailable(format!(
                "unsupported output sample format: {other:?}"
            )))
        }
    }?;

    stream
        .play()
        .map_err(|err| PlaybackError::device_unavailable(format!("failed to start output stream: {err}")))?;
    info!(
        target: "audio_device",
        device_rate = config.sample_rate.0,
        channels = config.channels,
        source_rate,
        "output stream started"
    );
    Ok(stream)
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut pump: OutputPump,
    convert: fn(f32) -> T,
) -> Result<cpal::Stream, PlaybackError>
where
    T: SizedSample + Send + 'static,
{
    let channels = (config.channels as usize).max(1);
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                pump.discard_if_interrupted();
                for frame in data.chunks_mut(channels) {
                    let value = convert(pump.next_frame());
                    frame.iter_mut().for_each(|slot| *slot = value);
                }
            },
            |err| error!(target: "audio_device", %err, "output stream error"),
            None,
        )
        .map_err(|err| PlaybackError::device_unavailable(format!("failed to build output stream: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::RecordingOutput;
    use crate::audio::{AudioFrame, AudioPlayback};
    use std::sync::Arc;

    #[tokio::test]
    async fn interrupt_drops_samples_not_yet_handed_to_device() {
        let output = Arc::new(RecordingOutput::default());
        let playback = AudioPlayback::new(output.clone() as Arc<dyn PlaybackBackend>, 24_000, 8);
        playback.connect().await.expect("connect");
        let renderer = output.take_renderer().expect("renderer");
        let mut pump = OutputPump::new(renderer, 24_000, 24_000);

        playback
            .add_16bit_pcm(&AudioFrame::new(vec![i16::MAX; RENDER_BLOCK * 2], 24_000), "item_a")
            .expect("chunk");
        assert!(pump.next_frame() > 0.9);
        assert_eq!(pump.carry.len(), RENDER_BLOCK - 1);

        let offset = playback.interrupt().expect("interrupt");
        assert_eq!(offset.offset, RENDER_BLOCK as u64);

        pump.discard_if_interrupted();
        assert!(pump.carry.is_empty());
        assert_eq!(pump.next_frame(), 0.0);
        assert!(!pump.renderer.is_interrupted());
    }
}
