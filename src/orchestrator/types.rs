use serde::Deserialize;
use serde_json::Value;

/// 一次对话所针对的用户与学习内容。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub user_id: String,
    pub content_id: String,
    pub space_id: Option<String>,
    pub chatbot_type: String,
}

/// 需要失效的前端查询缓存键。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKey {
    ChatHistory {
        chatbot_type: String,
        content_id: String,
        space_id: Option<String>,
    },
    VoiceUsageLimits {
        user_id: String,
    },
}

impl QueryKey {
    pub(crate) fn chat_history(context: &SessionContext) -> Self {
        QueryKey::ChatHistory {
            chatbot_type: context.chatbot_type.clone(),
            content_id: context.content_id.clone(),
            space_id: context.space_id.clone(),
        }
    }

    pub(crate) fn voice_usage_limits(context: &SessionContext) -> Self {
        QueryKey::VoiceUsageLimits {
            user_id: context.user_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModalRequest {
    VoiceLimitReached,
    Whiteboard(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionNotice {
    pub level: NoticeLevel,
    pub message: String,
}

impl SessionNotice {
    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warn,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

/// 服务端下发的应用层控制事件。
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum AppEvent {
    UpdatedChatHistory,
    VoiceLimitWarning {
        #[serde(default)]
        message: Option<String>,
    },
    VoiceLimitReached,
    ToolCallStart {
        function: String,
    },
    ToolCallEnd {
        function: String,
        #[serde(default)]
        output: Value,
    },
}

impl AppEvent {
    /// 非应用层事件（实时协议事件或未知类型）返回 `None`。
    pub(crate) fn parse(event: &Value) -> Option<Self> {
        AppEvent::deserialize(event).ok()
    }
}

/// 能被会话理解的工具函数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ToolFunction {
    KeyConcepts,
    Whiteboard,
}

impl ToolFunction {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        match name {
            "key_concepts" => Some(ToolFunction::KeyConcepts),
            "whiteboard" => Some(ToolFunction::Whiteboard),
            _ => None,
        }
    }
}
