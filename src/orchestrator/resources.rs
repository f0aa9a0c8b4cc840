use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::audio::{AudioCapture, AudioPlayback};
use crate::channel::{ChannelSender, RealtimeChannel};
use crate::orchestrator::constants::TARGET;
use crate::orchestrator::runtime::FrameQueue;

/// 一代会话持有的全部资源。
#[derive(Default)]
pub(crate) struct EngineResources {
    pub(crate) generation: Option<u64>,
    pub(crate) started_at: Option<Instant>,
    pub(crate) capture: Option<AudioCapture>,
    pub(crate) playback: Option<Arc<AudioPlayback>>,
    pub(crate) channel: Option<RealtimeChannel>,
    pub(crate) sender: Option<ChannelSender>,
    pub(crate) frames: Option<Arc<FrameQueue>>,
    pub(crate) forwarder: Option<JoinHandle<()>>,
    pub(crate) pump: Option<JoinHandle<()>>,
}

impl EngineResources {
    pub(crate) fn staged(generation: u64) -> Self {
        Self {
            generation: Some(generation),
            started_at: Some(Instant::now()),
            ..Self::default()
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.generation.is_some()
    }

    /// 依次停止采集、发送、播放与通道。每一步都不会失败，缺失的资源直接跳过。
    /// 由事件泵自身发起时不能中止泵任务，`abort_pump` 为 false 时只分离句柄。
    pub(crate) async fn teardown(&mut self, abort_pump: bool) {
        if let Some(capture) = self.capture.take() {
            capture.quit();
        }
        if let Some(frames) = self.frames.take() {
            frames.close();
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(playback) = self.playback.take() {
            if let Some(offset) = playback.interrupt() {
                debug!(target: TARGET, track_id = %offset.track_id, "playback stopped at teardown");
            }
            playback.close();
        }
        self.sender = None;
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        if let Some(pump) = self.pump.take() {
            if abort_pump {
                pump.abort();
            }
        }
        self.generation = None;
        self.started_at = None;
    }
}

impl std::fmt::Debug for EngineResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineResources")
            .field("generation", &self.generation)
            .field("capture", &self.capture.is_some())
            .field("playback", &self.playback.is_some())
            .field("channel", &self.channel.is_some())
            .finish_non_exhaustive()
    }
}
