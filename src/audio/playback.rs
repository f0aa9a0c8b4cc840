//! 增量播放与样本级精确打断。
//!
//! 生产端（网络事件）通过有界队列投递 PCM 块，输出时钟端（设备回调）
//! 由 [`PlaybackRenderer`] 拉取。当前轨道与已播放样本数打包在同一个
//! `AtomicU64` 中：高 32 位为轨道序号，第 31 位为打断标记，低 31 位为计数。
//! 渲染端每次提交样本数前都会检查打断标记，打断端用一次 CAS 置位，
//! 因此返回的偏移恰好等于已交给设备的样本数。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::AudioFrame;

const TARGET: &str = "audio_playback";
const INTERRUPTED: u64 = 1 << 31;
const COUNT_MASK: u64 = INTERRUPTED - 1;
const SERIAL_SHIFT: u32 = 32;
const RECENT_TRACKS: usize = 32;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("playback is not connected")]
    NotConnected,
    #[error("audio output device unavailable: {message}")]
    DeviceUnavailable { message: String },
    #[error("playback queue full, dropped chunk for track {track_id}")]
    QueueFull { track_id: String },
    #[error("expected {expected} Hz audio, received {actual} Hz")]
    SampleRateMismatch { expected: u32, actual: u32 },
}

impl PlaybackError {
    pub fn device_unavailable(message: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            message: message.into(),
        }
    }
}

/// 打开输出设备的抽象。设备按自己的时钟调用 `renderer.render`。
pub trait PlaybackBackend: Send + Sync {
    fn open(
        &self,
        sample_rate: u32,
        renderer: PlaybackRenderer,
    ) -> Result<Box<dyn OutputStream>, PlaybackError>;
}

pub trait OutputStream: Send {
    fn stop(&mut self);
}

/// 打断时某条轨道已播放到的位置。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackOffset {
    pub track_id: String,
    /// 已渲染的样本数。
    pub offset: u64,
    pub sample_rate: u32,
}

impl TrackOffset {
    pub fn audio_end_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.offset * 1_000 / self.sample_rate as u64
    }
}

#[derive(Debug)]
struct PcmChunk {
    serial: u32,
    samples: Arc<[i16]>,
}

fn pack(serial: u32, played: u64) -> u64 {
    ((serial as u64) << SERIAL_SHIFT) | (played & COUNT_MASK)
}

fn serial_of(state: u64) -> u32 {
    (state >> SERIAL_SHIFT) as u32
}

fn played_of(state: u64) -> u64 {
    state & COUNT_MASK
}

fn is_interrupted(state: u64) -> bool {
    state & INTERRUPTED != 0
}

#[derive(Debug, Default)]
struct PlaybackShared {
    cursor: AtomicU64,
    dropped_through: AtomicU32,
}

impl PlaybackShared {
    fn reset(&self) {
        self.cursor.store(0, Ordering::Release);
        self.dropped_through.store(0, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct TrackRegistry {
    next_serial: u32,
    recent: VecDeque<(u32, String)>,
    interrupted: VecDeque<String>,
}

impl TrackRegistry {
    fn serial_for(&mut self, track_id: &str) -> u32 {
        if let Some((serial, _)) = self.recent.iter().rev().find(|(_, id)| id == track_id) {
            return *serial;
        }
        self.next_serial = self.next_serial.wrapping_add(1).max(1);
        self.recent.push_back((self.next_serial, track_id.to_string()));
        if self.recent.len() > RECENT_TRACKS {
            self.recent.pop_front();
        }
        self.next_serial
    }

    fn name_of(&self, serial: u32) -> Option<String> {
        self.recent
            .iter()
            .find(|(candidate, _)| *candidate == serial)
            .map(|(_, id)| id.clone())
    }

    fn mark_interrupted(&mut self, track_id: &str) {
        self.interrupted.push_back(track_id.to_string());
        if self.interrupted.len() > RECENT_TRACKS {
            self.interrupted.pop_front();
        }
    }

    fn is_interrupted(&self, track_id: &str) -> bool {
        self.interrupted.iter().any(|id| id == track_id)
    }
}

/// 输出时钟端。由设备回调独占持有。
pub struct PlaybackRenderer {
    shared: Arc<PlaybackShared>,
    queue: mpsc::Receiver<PcmChunk>,
    current: Option<PcmChunk>,
    position: usize,
    last_serial: u32,
    last_played: u64,
}

impl std::fmt::Debug for PlaybackRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackRenderer")
            .field("last_serial", &self.last_serial)
            .field("last_played", &self.last_played)
            .finish_non_exhaustive()
    }
}

impl PlaybackRenderer {
    /// 填满 `out`，返回其中真实音频的样本数，其余位置写零。
    pub fn render(&mut self, out: &mut [i16]) -> usize {
        let mut written = 0;
        while written < out.len() {
            if self.current.is_none() && !self.advance() {
                break;
            }
            let Some(chunk) = self.current.as_ref() else {
                break;
            };

            let serial = chunk.serial;
            let take = (chunk.samples.len() - self.position).min(out.len() - written);
            let committed = self.shared.cursor.fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                if serial_of(state) == serial && !is_interrupted(state) {
                    Some(state + take as u64)
                } else {
                    None
                }
            });

            match committed {
                Ok(previous) => {
                    let end = self.position + take;
                    out[written..written + take].copy_from_slice(&chunk.samples[self.position..end]);
                    written += take;
                    self.last_played = played_of(previous) + take as u64;
                    if end == chunk.samples.len() {
                        self.current = None;
                        self.position = 0;
                    } else {
                        self.position = end;
                    }
                }
                Err(_) => {
                    // 被打断：丢弃当前块，后续同轨道块在 advance 中过滤
                    self.current = None;
                    self.position = 0;
                }
            }
        }

        out[written..].iter_mut().for_each(|sample| *sample = 0);
        if self.current.is_none() {
            self.retire_if_idle();
        }
        written
    }

    /// 当前轨道已被打断、但渲染器尚未收尾。
    pub(crate) fn is_interrupted(&self) -> bool {
        is_interrupted(self.shared.cursor.load(Ordering::Acquire))
    }

    fn advance(&mut self) -> bool {
        loop {
            let chunk = match self.queue.try_recv() {
                Ok(chunk) => chunk,
                Err(_) => return false,
            };
            if chunk.serial <= self.shared.dropped_through.load(Ordering::Acquire) {
                continue;
            }
            if self.start(chunk) {
                return true;
            }
        }
    }

    fn start(&mut self, chunk: PcmChunk) -> bool {
        let resume = if chunk.serial == self.last_serial {
            self.last_played
        } else {
            0
        };
        let next = pack(chunk.serial, resume);
        loop {
            let state = self.shared.cursor.load(Ordering::Acquire);
            if serial_of(state) == chunk.serial {
                if is_interrupted(state) {
                    return false;
                }
                break;
            }
            if self
                .shared
                .cursor
                .compare_exchange(state, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        self.last_serial = chunk.serial;
        self.last_played = resume;
        self.current = Some(chunk);
        self.position = 0;
        true
    }

    fn retire_if_idle(&mut self) {
        let state = self.shared.cursor.load(Ordering::Acquire);
        if state != 0 && serial_of(state) == self.last_serial {
            let _ = self
                .shared
                .cursor
                .compare_exchange(state, 0, Ordering::AcqRel, Ordering::Acquire);
        }
    }
}

struct PlaybackLink {
    sender: mpsc::Sender<PcmChunk>,
    stream: Box<dyn OutputStream>,
}

/// 智能体音频的流式播放器。
pub struct AudioPlayback {
    backend: Arc<dyn PlaybackBackend>,
    sample_rate: u32,
    queue_capacity: usize,
    shared: Arc<PlaybackShared>,
    tracks: Mutex<TrackRegistry>,
    link: Mutex<Option<PlaybackLink>>,
}

impl std::fmt::Debug for AudioPlayback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioPlayback")
            .field("sample_rate", &self.sample_rate)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl AudioPlayback {
    pub fn new(backend: Arc<dyn PlaybackBackend>, sample_rate: u32, queue_capacity: usize) -> Self {
        Self {
            backend,
            sample_rate,
            queue_capacity: queue_capacity.max(1),
            shared: Arc::new(PlaybackShared::default()),
            tracks: Mutex::new(TrackRegistry::default()),
            link: Mutex::new(None),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().map(|link| link.is_some()).unwrap_or(false)
    }

    /// 打开输出设备。已连接时直接返回。
    pub async fn connect(&self) -> Result<(), PlaybackError> {
        if self.is_connected() {
            return Ok(());
        }
        self.shared.reset();
        if let Ok(mut tracks) = self.tracks.lock() {
            *tracks = TrackRegistry::default();
        }

        let (sender, queue) = mpsc::channel(self.queue_capacity);
        let renderer = PlaybackRenderer {
            shared: Arc::clone(&self.shared),
            queue,
            current: None,
            position: 0,
            last_serial: 0,
            last_played: 0,
        };
        let backend = Arc::clone(&self.backend);
        let sample_rate = self.sample_rate;
        let stream = tokio::task::spawn_blocking(move || backend.open(sample_rate, renderer))
            .await
            .map_err(|err| PlaybackError::device_unavailable(format!("device task failed: {err}")))??;

        let mut link = self
            .link
            .lock()
            .map_err(|_| PlaybackError::device_unavailable("playback state poisoned"))?;
        if link.is_some() {
            let mut duplicate = stream;
            duplicate.stop();
            return Ok(());
        }
        *link = Some(PlaybackLink { sender, stream });
        info!(target: TARGET, sample_rate, "audio output connected");
        Ok(())
    }

    /// 非阻塞入队。同一轨道的块按顺序连续播放，新轨道排在当前轨道之后。
    pub fn add_16bit_pcm(&self, frame: &AudioFrame, track_id: &str) -> Result<(), PlaybackError> {
        if frame.sample_rate() != self.sample_rate {
            return Err(PlaybackError::SampleRateMismatch {
                expected: self.sample_rate,
                actual: frame.sample_rate(),
            });
        }
        if frame.is_empty() {
            return Ok(());
        }

        let mut tracks = self
            .tracks
            .lock()
            .map_err(|_| PlaybackError::NotConnected)?;
        if tracks.is_interrupted(track_id) {
            debug!(target: TARGET, track_id, "dropping audio for interrupted track");
            return Ok(());
        }

        let link = self.link.lock().map_err(|_| PlaybackError::NotConnected)?;
        let Some(link) = link.as_ref() else {
            return Err(PlaybackError::NotConnected);
        };
        let serial = tracks.serial_for(track_id);
        let chunk = PcmChunk {
            serial,
            samples: frame.shared_samples(),
        };
        link.sender.try_send(chunk).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                warn!(target: TARGET, track_id, "playback queue full");
                PlaybackError::QueueFull {
                    track_id: track_id.to_string(),
                }
            }
            mpsc::error::TrySendError::Closed(_) => PlaybackError::NotConnected,
        })
    }

    /// 在当前样本处停止播放。空闲时返回 `None` 且没有任何副作用；
    /// 并发调用时只有一个调用方拿到偏移。
    pub fn interrupt(&self) -> Option<TrackOffset> {
        loop {
            let state = self.shared.cursor.load(Ordering::Acquire);
            if state == 0 || is_interrupted(state) {
                return None;
            }
            if self
                .shared
                .cursor
                .compare_exchange(state, state | INTERRUPTED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            let serial = serial_of(state);
            // 打断前已入队的所有轨道一并丢弃，之后新建的轨道照常播放
            let track_id = match self.tracks.lock() {
                Ok(mut tracks) => {
                    self.shared
                        .dropped_through
                        .fetch_max(tracks.next_serial.max(serial), Ordering::AcqRel);
                    let track_id = tracks.name_of(serial).unwrap_or_else(|| serial.to_string());
                    tracks.mark_interrupted(&track_id);
                    track_id
                }
                Err(_) => {
                    self.shared.dropped_through.fetch_max(serial, Ordering::AcqRel);
                    serial.to_string()
                }
            };
            let offset = TrackOffset {
                track_id,
                offset: played_of(state),
                sample_rate: self.sample_rate,
            };
            info!(
                target: TARGET,
                track_id = %offset.track_id,
                offset = offset.offset,
                "playback interrupted"
            );
            return Some(offset);
        }
    }

    /// 读取当前轨道的播放位置，不影响播放。
    pub fn track_offset(&self) -> Option<TrackOffset> {
        let state = self.shared.cursor.load(Ordering::Acquire);
        if state == 0 || is_interrupted(state) {
            return None;
        }
        let serial = serial_of(state);
        let track_id = self.tracks.lock().ok()?.name_of(serial)?;
        Some(TrackOffset {
            track_id,
            offset: played_of(state),
            sample_rate: self.sample_rate,
        })
    }

    /// 释放输出设备，丢弃排队中的音频。
    pub fn close(&self) {
        let link = match self.link.lock() {
            Ok(mut link) => link.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut link) = link {
            link.stream.stop();
            info!(target: TARGET, "audio output closed");
        }
        self.shared.reset();
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.close();
    }
}
