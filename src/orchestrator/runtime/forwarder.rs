//! 采集线程与发送任务之间的帧队列。
//!
//! 采集回调不能等待，满时丢弃最旧的帧以保持实时性。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::audio::AudioFrame;
use crate::channel::ChannelSender;
use crate::orchestrator::constants::TARGET;
use crate::telemetry::events::record_frames_dropped;

pub(crate) struct FrameQueue {
    capacity: usize,
    frames: Mutex<VecDeque<AudioFrame>>,
    ready: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// 不阻塞地入队，返回是否挤掉了最旧的帧。
    pub(crate) fn push(&self, frame: AudioFrame) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let evicted = {
            let mut frames = match self.frames.lock() {
                Ok(frames) => frames,
                Err(poisoned) => poisoned.into_inner(),
            };
            let evicted = if frames.len() >= self.capacity {
                frames.pop_front();
                true
            } else {
                false
            };
            frames.push_back(frame);
            evicted
        };
        if evicted {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if total == 1 || total % 50 == 0 {
                record_frames_dropped(total, self.capacity);
            }
        }
        self.ready.notify_one();
        evicted
    }

    /// 等待下一帧；队列关闭后返回 `None`。
    pub(crate) async fn pop(&self) -> Option<AudioFrame> {
        loop {
            let notified = self.ready.notified();
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(frame) = self.try_pop() {
                return Some(frame);
            }
            notified.await;
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut frames) = self.frames.lock() {
            frames.clear();
        }
        self.ready.notify_waiters();
        self.ready.notify_one();
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn try_pop(&self) -> Option<AudioFrame> {
        match self.frames.lock() {
            Ok(mut frames) => frames.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }
}

/// 按采集顺序把帧写入通道，通道关闭即退出。
pub(crate) fn spawn_forwarder(queue: Arc<FrameQueue>, sender: ChannelSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut forwarded = 0_u64;
        while let Some(frame) = queue.pop().await {
            if let Err(err) = sender.append_input_audio(&frame).await {
                warn!(target: TARGET, %err, "stopping audio forwarder");
                break;
            }
            forwarded += 1;
        }
        debug!(
            target: TARGET,
            forwarded,
            dropped = queue.dropped(),
            "audio forwarder finished"
        );
    })
}
