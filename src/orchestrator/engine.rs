use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::audio::{
    AudioCapture, AudioPlayback, CaptureBackend, CaptureError, CaptureOptions, FrequencySnapshot, FrequencyView,
    PlaybackBackend, PlaybackError,
};
use crate::channel::{build_session_url, ChannelError, RealtimeChannel, SessionConfig};
use crate::orchestrator::config::EngineConfig;
use crate::orchestrator::constants::TARGET;
use crate::orchestrator::resources::EngineResources;
use crate::orchestrator::runtime::{spawn_forwarder, EventPump, FrameQueue};
use crate::orchestrator::traits::Collaborators;
use crate::orchestrator::types::SessionContext;
use crate::session::{DisconnectReason, SessionHandle, SessionLifecycleUpdate, SessionPhase};
use crate::telemetry::events::record_session_transition;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no realtime session is connected")]
    NotConnected,
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Playback(#[from] PlaybackError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    context: SessionContext,
    session: SessionHandle,
    capture_backend: Arc<dyn CaptureBackend>,
    playback_backend: Arc<dyn PlaybackBackend>,
    collaborators: Collaborators,
    resources: Mutex<EngineResources>,
    generation: AtomicU64,
    /// 当前存活的一代，0 表示没有。
    live: AtomicU64,
}

impl EngineInner {
    pub(crate) fn is_live(&self, generation: u64) -> bool {
        generation != 0 && self.live.load(Ordering::Acquire) == generation
    }

    /// 只结束指定的一代会话；该代已结束时返回 false。
    pub(crate) async fn end_generation(&self, generation: u64, reason: DisconnectReason, abort_pump: bool) -> bool {
        let mut resources = self.resources.lock().await;
        if resources.generation != Some(generation) {
            debug!(target: TARGET, generation, reason = reason.as_str(), "teardown skipped for stale session");
            return false;
        }
        self.teardown_locked(&mut resources, reason, abort_pump).await;
        true
    }

    async fn teardown_locked(&self, resources: &mut EngineResources, reason: DisconnectReason, abort_pump: bool) {
        let Some(generation) = resources.generation else {
            return;
        };
        let elapsed = resources.started_at.map(|started| started.elapsed());
        let _ = self
            .live
            .compare_exchange(generation, 0, Ordering::AcqRel, Ordering::Acquire);

        self.transition(SessionLifecycleUpdate::new(generation, SessionPhase::Disconnecting), None);
        resources.teardown(abort_pump).await;
        self.session.clear_transient();
        info!(target: TARGET, generation, reason = reason.as_str(), "voice session ended");
        self.transition(SessionLifecycleUpdate::ended(generation, reason), elapsed);
    }

    fn transition(&self, update: SessionLifecycleUpdate, elapsed: Option<Duration>) {
        record_session_transition(update.generation, update.phase, update.reason.as_ref(), elapsed);
        self.session.set_phase(update);
    }

    /// 按顺序获取采集、播放与通道；每拿到一项就登记进 `staged`，
    /// 失败时由调用方统一释放。
    async fn establish(self: &Arc<Self>, generation: u64, staged: &mut EngineResources) -> Result<(), EngineError> {
        let sample_rate = self.config.channel.sample_rate;

        let capture = AudioCapture::new(
            Arc::clone(&self.capture_backend),
            CaptureOptions {
                frame_samples: self.config.capture.frame_samples,
                retain_recording: false,
            },
        );
        capture.begin(sample_rate).await?;
        staged.capture = Some(capture);

        let playback = Arc::new(AudioPlayback::new(
            Arc::clone(&self.playback_backend),
            sample_rate,
            self.config.playback.queue_capacity,
        ));
        staged.playback = Some(Arc::clone(&playback));
        playback.connect().await?;

        let url = build_session_url(
            &self.config.channel.scheme,
            &self.config.channel.host,
            &self.context.user_id,
            &self.context.content_id,
        )?;
        let (channel, events) = RealtimeChannel::connect(&url, &self.config.channel).await?;
        let sender = channel.sender();
        staged.channel = Some(channel);
        staged.sender = Some(sender.clone());
        sender.update_session(SessionConfig::from(&self.config.realtime)).await?;

        let pump = EventPump {
            generation,
            engine: Arc::downgrade(self),
            session: self.session.clone(),
            playback,
            sender: sender.clone(),
            collaborators: self.collaborators.clone(),
            context: self.context.clone(),
        };
        staged.pump = Some(pump.spawn(events));

        // 手动轮次检测时只保留设备与频谱，不向服务端推流
        if !self.config.realtime.server_vad {
            debug!(target: TARGET, generation, "server turn detection disabled; audio not streamed");
            return Ok(());
        }

        let frames = Arc::new(FrameQueue::new(self.config.capture.frame_queue_capacity));
        staged.forwarder = Some(spawn_forwarder(Arc::clone(&frames), sender));
        staged.frames = Some(Arc::clone(&frames));

        let gate = self.session.clone();
        if let Some(capture) = staged.capture.as_ref() {
            capture.record(move |frame| {
                // 静音时仍在采集，只是不转发
                if !gate.is_muted() {
                    frames.push(frame);
                }
            })?;
        }
        Ok(())
    }
}

/// 实时语音会话的编排器，可廉价克隆。
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("context", &self.inner.context)
            .field("session", &self.inner.session)
            .finish_non_exhaustive()
    }
}

impl SessionOrchestrator {
    pub fn new(
        config: EngineConfig,
        context: SessionContext,
        capture_backend: Arc<dyn CaptureBackend>,
        playback_backend: Arc<dyn PlaybackBackend>,
    ) -> Self {
        Self::with_components(
            config,
            context,
            SessionHandle::default(),
            capture_backend,
            playback_backend,
            Collaborators::default(),
        )
    }

    pub fn with_components(
        config: EngineConfig,
        context: SessionContext,
        session: SessionHandle,
        capture_backend: Arc<dyn CaptureBackend>,
        playback_backend: Arc<dyn PlaybackBackend>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                context,
                session,
                capture_backend,
                playback_backend,
                collaborators,
                resources: Mutex::new(EngineResources::default()),
                generation: AtomicU64::new(0),
                live: AtomicU64::new(0),
            }),
        }
    }

    pub fn session(&self) -> SessionHandle {
        self.inner.session.clone()
    }

    pub fn context(&self) -> &SessionContext {
        &self.inner.context
    }

    /// 打开一代新会话。已有会话时先以 `Replaced` 结束旧的一代。
    pub async fn connect_conversation(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        let mut resources = inner.resources.lock().await;
        if resources.is_active() {
            inner
                .teardown_locked(&mut resources, DisconnectReason::Replaced, true)
                .await;
        }

        let generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        inner.live.store(generation, Ordering::Release);
        *resources = EngineResources::staged(generation);
        inner.transition(SessionLifecycleUpdate::new(generation, SessionPhase::Connecting), None);

        match inner.establish(generation, &mut resources).await {
            Ok(()) => {
                info!(
                    target: TARGET,
                    generation,
                    user_id = %inner.context.user_id,
                    content_id = %inner.context.content_id,
                    "voice session connected"
                );
                inner.transition(SessionLifecycleUpdate::new(generation, SessionPhase::Connected), None);
                Ok(())
            }
            Err(err) => {
                warn!(target: TARGET, generation, %err, "failed to establish voice session");
                inner
                    .teardown_locked(&mut resources, DisconnectReason::ConnectFailed(err.to_string()), true)
                    .await;
                Err(err)
            }
        }
    }

    /// 结束当前会话；空闲时什么也不做。
    pub async fn disconnect_conversation(&self) {
        let mut resources = self.inner.resources.lock().await;
        if !resources.is_active() {
            debug!(target: TARGET, "disconnect requested while idle");
            return;
        }
        self.inner
            .teardown_locked(&mut resources, DisconnectReason::Requested, true)
            .await;
    }

    /// 用户主动停止：断开并退出学习模式与最小化状态。
    pub async fn handle_stop(&self) {
        self.disconnect_conversation().await;
        self.inner.session.set_learn_mode(false);
        self.inner.session.set_minimized(false);
    }

    /// 只切换转发闸门，采集设备保持打开。返回新的静音状态。
    pub fn toggle_mute(&self) -> bool {
        let muted = self.inner.session.toggle_muted();
        debug!(target: TARGET, muted, "mute toggled");
        muted
    }

    pub fn set_learn_mode(&self, active: bool) {
        self.inner.session.set_learn_mode(active);
    }

    pub fn set_minimized(&self, minimized: bool) {
        self.inner.session.set_minimized(minimized);
    }

    pub async fn send_text(&self, text: &str) -> Result<(), EngineError> {
        let sender = {
            let resources = self.inner.resources.lock().await;
            resources.sender.clone()
        };
        let sender = sender.ok_or(EngineError::NotConnected)?;
        sender.send_text(text).await?;
        Ok(())
    }

    /// 麦克风频谱，供界面绘制波形。会话忙于切换时返回静音快照。
    pub fn frequencies(&self, view: FrequencyView) -> FrequencySnapshot {
        let sample_rate = self.inner.config.channel.sample_rate;
        match self.inner.resources.try_lock() {
            Ok(resources) => match resources.capture.as_ref() {
                Some(capture) => capture.get_frequencies(view),
                None => FrequencySnapshot::silent(view, sample_rate),
            },
            Err(_) => FrequencySnapshot::silent(view, sample_rate),
        }
    }

    /// 界面卸载。`keep_alive` 会话继续运行，否则停止并清空对话记录。
    pub async fn unmount(&self) {
        if self.inner.session.keep_alive() {
            debug!(target: TARGET, "unmount ignored for keep-alive session");
            return;
        }
        self.handle_stop().await;
        self.inner.session.clear_items();
    }
}
