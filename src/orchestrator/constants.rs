pub(crate) const TARGET: &str = "session_orchestrator";
/// 助手语音所在的内容下标，截断时使用。
pub(crate) const AUDIO_CONTENT_INDEX: u32 = 0;
pub(crate) const VOICE_LIMIT_WARNING: &str = "语音对话时长即将用尽";
