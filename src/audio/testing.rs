//! 测试用的内存设备。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::capture::{CaptureBackend, CaptureError, CaptureSink, CaptureStream};
use super::playback::{OutputStream, PlaybackBackend, PlaybackError, PlaybackRenderer};

struct CountingStream {
    stopped: Arc<AtomicUsize>,
}

impl CaptureStream for CountingStream {
    fn stop(&mut self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

impl OutputStream for CountingStream {
    fn stop(&mut self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

/// 由测试手动推送样本的麦克风。
#[derive(Default)]
pub(crate) struct FakeMicrophone {
    sink: Mutex<Option<CaptureSink>>,
    opened: AtomicUsize,
    stopped: Arc<AtomicUsize>,
    deny: AtomicBool,
}

impl FakeMicrophone {
    pub(crate) fn deny_permission(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    pub(crate) fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn is_live(&self) -> bool {
        self.opened() > self.stopped()
    }

    /// 模拟设备回调。设备未打开时返回 false。
    pub(crate) fn push(&self, samples: &[i16]) -> bool {
        let sink = self.sink.lock().unwrap().clone();
        match sink {
            Some(sink) if self.is_live() => {
                sink(samples);
                true
            }
            _ => false,
        }
    }
}

impl CaptureBackend for FakeMicrophone {
    fn open(&self, _sample_rate: u32, sink: CaptureSink) -> Result<Box<dyn CaptureStream>, CaptureError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(CaptureError::device_unavailable("permission denied"));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock().unwrap() = Some(sink);
        Ok(Box::new(CountingStream {
            stopped: Arc::clone(&self.stopped),
        }))
    }
}

/// 把渲染器留给测试驱动的输出设备。
#[derive(Default)]
pub(crate) struct RecordingOutput {
    renderer: Mutex<Option<PlaybackRenderer>>,
    opened: AtomicUsize,
    stopped: Arc<AtomicUsize>,
}

impl RecordingOutput {
    pub(crate) fn render(&self, len: usize) -> (Vec<i16>, usize) {
        let mut out = vec![0; len];
        let written = self
            .renderer
            .lock()
            .unwrap()
            .as_mut()
            .map(|renderer| renderer.render(&mut out))
            .unwrap_or(0);
        (out, written)
    }

    pub(crate) fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    /// 交出渲染器，由测试自己的输出泵驱动。
    pub(crate) fn take_renderer(&self) -> Option<PlaybackRenderer> {
        self.renderer.lock().unwrap().take()
    }
}

impl PlaybackBackend for RecordingOutput {
    fn open(
        &self,
        _sample_rate: u32,
        renderer: PlaybackRenderer,
    ) -> Result<Box<dyn OutputStream>, PlaybackError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        *self.renderer.lock().unwrap() = Some(renderer);
        Ok(Box::new(CountingStream {
            stopped: Arc::clone(&self.stopped),
        }))
    }
}
