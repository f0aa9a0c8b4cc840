//! 实时语音会话编排。

mod constants;
mod engine;
mod resources;
mod runtime;

pub mod config;
pub mod traits;
pub mod types;

pub use config::{ConfigError, EngineConfig, RealtimeSessionConfig};
pub use engine::{EngineError, SessionOrchestrator};
pub use traits::{Collaborators, ModalSurface, Notifier, QueryCache, Transcriber};
pub use types::{ModalRequest, NoticeLevel, QueryKey, SessionContext, SessionNotice};

#[cfg(test)]
mod tests;
