//! 实时通道的线上消息格式。

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::orchestrator::config::RealtimeSessionConfig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum TurnDetection {
    #[serde(rename = "server_vad")]
    ServerVad {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        silence_duration_ms: Option<u32>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputAudioTranscription {
    pub model: String,
}

/// `session.update` 携带的会话配置。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub input_audio_format: String,
    pub output_audio_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputAudioTranscription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl From<&RealtimeSessionConfig> for SessionConfig {
    fn from(config: &RealtimeSessionConfig) -> Self {
        Self {
            modalities: config.modalities.clone(),
            input_audio_format: "pcm16".into(),
            output_audio_format: "pcm16".into(),
            turn_detection: config.server_vad.then_some(TurnDetection::ServerVad {
                silence_duration_ms: config.silence_duration_ms,
            }),
            input_audio_transcription: config
                .transcription_model
                .as_ref()
                .map(|model| InputAudioTranscription { model: model.clone() }),
            instructions: config.instructions.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UserMessageItem {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub role: &'static str,
    pub content: Vec<InputText>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InputText {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

impl UserMessageItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "message",
            role: "user",
            content: vec![InputText {
                kind: "input_text",
                text: text.into(),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: UserMessageItem },

    #[serde(rename = "conversation.item.truncate")]
    ConversationItemTruncate {
        item_id: String,
        content_index: u32,
        audio_end_ms: u64,
    },

    #[serde(rename = "response.create")]
    ResponseCreate,

    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    pub fn audio_append(pcm: &[u8]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: BASE64_STANDARD.encode(pcm),
        }
    }

    pub fn is_audio_append(&self) -> bool {
        matches!(self, ClientEvent::InputAudioBufferAppend { .. })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ClientEvent::InputAudioBufferCommit => "input_audio_buffer.commit",
            ClientEvent::InputAudioBufferClear => "input_audio_buffer.clear",
            ClientEvent::ConversationItemCreate { .. } => "conversation.item.create",
            ClientEvent::ConversationItemTruncate { .. } => "conversation.item.truncate",
            ClientEvent::ResponseCreate => "response.create",
            ClientEvent::ResponseCancel => "response.cancel",
        }
    }
}

/// 带 `event_id` 的出站事件。
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEvent {
    pub event_id: String,
    #[serde(flatten)]
    pub event: ClientEvent,
}

impl OutboundEvent {
    pub fn new(event: ClientEvent) -> Self {
        Self {
            event_id: format!("evt_{}", uuid::Uuid::new_v4().simple()),
            event,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    #[default]
    Message,
    FunctionCall,
    FunctionCallOutput,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemRole {
    User,
    #[default]
    Assistant,
    System,
}

/// 服务端描述的对话条目。
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerItem {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: ItemKind,
    #[serde(default)]
    pub role: Option<ItemRole>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
pub struct ServerError {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// 通道自身关心的服务端事件，其余类型一律归入 `Unknown`。
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error { error: ServerError },

    #[serde(rename = "session.created")]
    SessionCreated {},

    #[serde(rename = "session.updated")]
    SessionUpdated {},

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "conversation.item.created")]
    ItemCreated { item: ServerItem },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted { item_id: String, transcript: String },

    #[serde(rename = "conversation.item.truncated")]
    ItemTruncated { item_id: String, audio_end_ms: u64 },

    #[serde(rename = "conversation.item.deleted")]
    ItemDeleted { item_id: String },

    #[serde(rename = "response.output_item.added")]
    OutputItemAdded { item: ServerItem },

    #[serde(rename = "response.output_item.done")]
    OutputItemDone { item: ServerItem },

    #[serde(rename = "response.audio.delta")]
    AudioDelta { item_id: String, delta: String },

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { item_id: String, delta: String },

    #[serde(rename = "response.text.delta")]
    TextDelta { item_id: String, delta: String },

    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta { item_id: String, delta: String },

    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_event_flattens_type_and_id() {
        let event = OutboundEvent::new(ClientEvent::ConversationItemTruncate {
            item_id: "item_a".into(),
            content_index: 0,
            audio_end_ms: 30,
        });
        let value = serde_json::to_value(&event).expect("serialize");

        assert_eq!(value["type"], "conversation.item.truncate");
        assert_eq!(value["item_id"], "item_a");
        assert_eq!(value["audio_end_ms"], 30);
        assert!(value["event_id"].as_str().expect("event id").starts_with("evt_"));
    }

    #[test]
    fn session_config_enables_server_vad_and_transcription() {
        let session = SessionConfig::from(&RealtimeSessionConfig::default());
        let value = serde_json::to_value(ClientEvent::SessionUpdate { session }).expect("serialize");

        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(value["session"]["input_audio_transcription"]["model"], "whisper-1");
        assert_eq!(value["session"]["modalities"], json!(["text", "audio"]));
    }

    #[test]
    fn audio_append_is_base64_pcm() {
        let value = serde_json::to_value(ClientEvent::audio_append(&[1, 0, 2, 0])).expect("serialize");
        assert_eq!(value["audio"], "AQACAA==");
    }

    #[test]
    fn unrecognised_server_events_fall_back_to_unknown() {
        let event: ServerEvent =
            serde_json::from_value(json!({"type": "voice_limit_warning", "remaining": 30})).expect("parse");
        assert!(matches!(event, ServerEvent::Unknown));
    }

    #[test]
    fn audio_delta_parses_item_reference() {
        let event: ServerEvent = serde_json::from_value(json!({
            "type": "response.audio.delta",
            "event_id": "evt_1",
            "response_id": "resp_1",
            "item_id": "item_a",
            "output_index": 0,
            "content_index": 0,
            "delta": "AAA="
        }))
        .expect("parse");

        match event {
            ServerEvent::AudioDelta { item_id, delta } => {
                assert_eq!(item_id, "item_a");
                assert_eq!(delta, "AAA=");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
