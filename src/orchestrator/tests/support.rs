use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::audio::testing::{FakeMicrophone, RecordingOutput};
use crate::audio::{CaptureBackend, PlaybackBackend};
use crate::channel::testing::MockRealtimeServer;
use crate::orchestrator::config::{CaptureConfig, ChannelConfig, EngineConfig};
use crate::orchestrator::traits::{Collaborators, ModalSurface, Notifier, QueryCache};
use crate::orchestrator::types::{ModalRequest, QueryKey, SessionContext, SessionNotice};
use crate::orchestrator::SessionOrchestrator;
use crate::session::{SessionHandle, SessionLifecycleUpdate};

pub(super) const WAIT: Duration = Duration::from_millis(1_000);
pub(super) const FRAME_SAMPLES: usize = 4;

#[derive(Default)]
pub(super) struct RecordingCollaborators {
    pub(super) invalidations: Mutex<Vec<QueryKey>>,
    pub(super) notices: Mutex<Vec<SessionNotice>>,
    pub(super) modals: Mutex<Vec<ModalRequest>>,
}

#[async_trait]
impl QueryCache for RecordingCollaborators {
    async fn invalidate(&self, key: QueryKey) {
        self.invalidations.lock().unwrap().push(key);
    }
}

#[async_trait]
impl Notifier for RecordingCollaborators {
    async fn notify(&self, notice: SessionNotice) {
        self.notices.lock().unwrap().push(notice);
    }
}

#[async_trait]
impl ModalSurface for RecordingCollaborators {
    async fn open(&self, request: ModalRequest) {
        self.modals.lock().unwrap().push(request);
    }
}

pub(super) fn context() -> SessionContext {
    SessionContext {
        user_id: "user-1".into(),
        content_id: "content-9".into(),
        space_id: Some("space-3".into()),
        chatbot_type: "tutor".into(),
    }
}

pub(super) fn config_for(host: &str) -> EngineConfig {
    EngineConfig {
        channel: ChannelConfig {
            scheme: "ws".into(),
            host: host.into(),
            connect_timeout_ms: 1_000,
            close_timeout_ms: 500,
            ..ChannelConfig::default()
        },
        capture: CaptureConfig {
            frame_samples: FRAME_SAMPLES,
            frame_queue_capacity: 16,
        },
        ..EngineConfig::default()
    }
}

pub(super) struct Harness {
    pub(super) orchestrator: SessionOrchestrator,
    pub(super) session: SessionHandle,
    pub(super) lifecycle: broadcast::Receiver<SessionLifecycleUpdate>,
    pub(super) mic: Arc<FakeMicrophone>,
    pub(super) speaker: Arc<RecordingOutput>,
    pub(super) server: MockRealtimeServer,
    pub(super) collaborators: Arc<RecordingCollaborators>,
}

impl Harness {
    pub(super) async fn start() -> Self {
        Self::start_with(false).await
    }

    pub(super) async fn start_with(keep_alive: bool) -> Self {
        let server = MockRealtimeServer::start().await;
        let config = config_for(server.host());
        Self::build(server, config, keep_alive)
    }

    pub(super) fn build(server: MockRealtimeServer, config: EngineConfig, keep_alive: bool) -> Self {
        let session = SessionHandle::new(keep_alive);
        let lifecycle = session.subscribe_lifecycle();
        let mic = Arc::new(FakeMicrophone::default());
        let speaker = Arc::new(RecordingOutput::default());
        let collaborators = Arc::new(RecordingCollaborators::default());
        let orchestrator = SessionOrchestrator::with_components(
            config,
            context(),
            session.clone(),
            mic.clone() as Arc<dyn CaptureBackend>,
            speaker.clone() as Arc<dyn PlaybackBackend>,
            Collaborators {
                cache: collaborators.clone(),
                notifier: collaborators.clone(),
                modals: collaborators.clone(),
            },
        );
        Self {
            orchestrator,
            session,
            lifecycle,
            mic,
            speaker,
            server,
            collaborators,
        }
    }

    pub(super) async fn connected() -> Self {
        let mut harness = Self::start().await;
        harness.orchestrator.connect_conversation().await.expect("connect");
        harness.server.expect_client("session.update").await;
        harness
    }

    /// 读出到目前为止广播的全部生命周期事件。
    pub(super) fn drain_lifecycle(&mut self) -> Vec<SessionLifecycleUpdate> {
        std::iter::from_fn(|| self.lifecycle.try_recv().ok()).collect()
    }

    pub(super) fn invalidations(&self) -> Vec<QueryKey> {
        self.collaborators.invalidations.lock().unwrap().clone()
    }

    pub(super) fn notices(&self) -> Vec<SessionNotice> {
        self.collaborators.notices.lock().unwrap().clone()
    }

    pub(super) fn modals(&self) -> Vec<ModalRequest> {
        self.collaborators.modals.lock().unwrap().clone()
    }
}

pub(super) async fn wait_until<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
