//! 会话生命周期广播负载定义。

use serde::Serialize;
use std::time::SystemTime;

/// 会话状态机的阶段划分。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Connecting => "connecting",
            SessionPhase::Connected => "connected",
            SessionPhase::Disconnecting => "disconnecting",
        }
    }
}

/// 会话结束的原因。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DisconnectReason {
    Requested,
    VoiceLimitReached,
    ChannelClosed(String),
    ConnectFailed(String),
    Replaced,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Requested => "requested",
            DisconnectReason::VoiceLimitReached => "voice_limit_reached",
            DisconnectReason::ChannelClosed(_) => "channel_closed",
            DisconnectReason::ConnectFailed(_) => "connect_failed",
            DisconnectReason::Replaced => "replaced",
        }
    }
}

/// 生命周期事件。
#[derive(Debug, Clone)]
pub struct SessionLifecycleUpdate {
    pub generation: u64,
    pub phase: SessionPhase,
    pub issued_at: SystemTime,
    pub reason: Option<DisconnectReason>,
}

impl SessionLifecycleUpdate {
    pub fn new(generation: u64, phase: SessionPhase) -> Self {
        Self {
            generation,
            phase,
            issued_at: SystemTime::now(),
            reason: None,
        }
    }

    /// 声明某一代会话已回到 Idle。
    pub fn ended(generation: u64, reason: DisconnectReason) -> Self {
        Self {
            generation,
            phase: SessionPhase::Idle,
            issued_at: SystemTime::now(),
            reason: Some(reason),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase == SessionPhase::Idle && self.reason.is_some()
    }
}
