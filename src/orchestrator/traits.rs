use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{info, warn};

use crate::orchestrator::types::{ModalRequest, NoticeLevel, QueryKey, SessionNotice};
use crate::session::transcription::{Transcription, TranscriptionError};

const TARGET: &str = "session_orchestrator";

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, wav: Bytes) -> Result<Transcription, TranscriptionError>;
}

#[async_trait]
pub trait QueryCache: Send + Sync {
    async fn invalidate(&self, key: QueryKey);
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: SessionNotice);
}

#[async_trait]
pub trait ModalSurface: Send + Sync {
    async fn open(&self, request: ModalRequest);
}

/// 没有界面时的默认协作者，只写日志。
#[derive(Debug, Default)]
pub(crate) struct LoggingCollaborator;

#[async_trait]
impl QueryCache for LoggingCollaborator {
    async fn invalidate(&self, key: QueryKey) {
        info!(target: TARGET, ?key, "query invalidated");
    }
}

#[async_trait]
impl Notifier for LoggingCollaborator {
    async fn notify(&self, notice: SessionNotice) {
        match notice.level {
            NoticeLevel::Info => info!(target: TARGET, message = %notice.message, "session notice"),
            NoticeLevel::Warn | NoticeLevel::Error => {
                warn!(target: TARGET, level = ?notice.level, message = %notice.message, "session notice")
            }
        }
    }
}

#[async_trait]
impl ModalSurface for LoggingCollaborator {
    async fn open(&self, request: ModalRequest) {
        info!(target: TARGET, ?request, "modal requested");
    }
}

/// 编排器对外部界面的全部依赖。
#[derive(Clone)]
pub struct Collaborators {
    pub cache: Arc<dyn QueryCache>,
    pub notifier: Arc<dyn Notifier>,
    pub modals: Arc<dyn ModalSurface>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        let logging = Arc::new(LoggingCollaborator);
        Self {
            cache: logging.clone(),
            notifier: logging.clone(),
            modals: logging,
        }
    }
}
