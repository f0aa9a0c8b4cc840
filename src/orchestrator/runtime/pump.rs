//! 通道事件泵：每代会话一个，按到达顺序处理通道事件。

use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::AudioPlayback;
use crate::channel::{ChannelEvent, ChannelSender, ConversationItem, EventSource, ItemDelta};
use crate::orchestrator::constants::{AUDIO_CONTENT_INDEX, TARGET, VOICE_LIMIT_WARNING};
use crate::orchestrator::engine::EngineInner;
use crate::orchestrator::traits::Collaborators;
use crate::orchestrator::types::{AppEvent, ModalRequest, QueryKey, SessionContext, SessionNotice, ToolFunction};
use crate::session::{DisconnectReason, SessionHandle, ToolOutputState};
use crate::telemetry::events::{record_interruption, record_tool_call, record_voice_limit};

pub(crate) struct EventPump {
    pub(crate) generation: u64,
    pub(crate) engine: Weak<EngineInner>,
    pub(crate) session: SessionHandle,
    pub(crate) playback: Arc<AudioPlayback>,
    pub(crate) sender: ChannelSender,
    pub(crate) collaborators: Collaborators,
    pub(crate) context: SessionContext,
}

enum Flow {
    Continue,
    Stop,
}

impl EventPump {
    pub(crate) fn spawn(self, events: mpsc::UnboundedReceiver<ChannelEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    async fn run(self, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        while let Some(event) = events.recv().await {
            let Some(engine) = self.engine.upgrade() else {
                break;
            };
            if !engine.is_live(self.generation) {
                debug!(target: TARGET, generation = self.generation, "session no longer live; pump exiting");
                break;
            }
            if let Flow::Stop = self.dispatch(&engine, event).await {
                break;
            }
        }
        debug!(target: TARGET, generation = self.generation, "event pump finished");
    }

    async fn dispatch(&self, engine: &Arc<EngineInner>, event: ChannelEvent) -> Flow {
        match event {
            ChannelEvent::Realtime(envelope) => {
                if envelope.source != EventSource::Server {
                    return Flow::Continue;
                }
                match AppEvent::parse(&envelope.event) {
                    Some(app_event) => self.handle_app_event(engine, app_event).await,
                    None => Flow::Continue,
                }
            }
            ChannelEvent::ConversationUpdated { item, delta } => {
                self.handle_update(item, delta);
                Flow::Continue
            }
            ChannelEvent::ConversationItemDeleted { item_id } => {
                self.session.remove_item(&item_id);
                Flow::Continue
            }
            ChannelEvent::ConversationInterrupted => {
                self.handle_interruption().await;
                Flow::Continue
            }
            ChannelEvent::Error(error) => {
                self.collaborators
                    .notifier
                    .notify(SessionNotice::error(error.message))
                    .await;
                Flow::Continue
            }
            ChannelEvent::Closed { reason } => {
                info!(target: TARGET, generation = self.generation, %reason, "realtime channel ended");
                engine
                    .end_generation(self.generation, DisconnectReason::ChannelClosed(reason), false)
                    .await;
                Flow::Stop
            }
        }
    }

    /// 音频先入播放队列，再更新会话记录。
    fn handle_update(&self, item: ConversationItem, delta: Option<ItemDelta>) {
        if let Some(audio) = delta.as_ref().and_then(|delta| delta.audio.as_ref()) {
            if let Err(err) = self.playback.add_16bit_pcm(audio, &item.id) {
                warn!(target: TARGET, item_id = %item.id, %err, "failed to queue assistant audio");
            }
        }
        self.session.upsert_item(item);
    }

    async fn handle_interruption(&self) {
        let Some(offset) = self.playback.interrupt() else {
            debug!(target: TARGET, "speech started with nothing playing");
            return;
        };
        record_interruption(&offset);
        if let Err(err) = self.sender.cancel_response(&offset, AUDIO_CONTENT_INDEX).await {
            warn!(target: TARGET, %err, "failed to cancel interrupted response");
        }
    }

    async fn handle_app_event(&self, engine: &Arc<EngineInner>, event: AppEvent) -> Flow {
        match event {
            AppEvent::UpdatedChatHistory => {
                self.collaborators
                    .cache
                    .invalidate(QueryKey::chat_history(&self.context))
                    .await;
            }
            AppEvent::VoiceLimitWarning { message } => {
                record_voice_limit(self.generation, "warning", true);
                let message = message.unwrap_or_else(|| VOICE_LIMIT_WARNING.to_string());
                self.collaborators.notifier.notify(SessionNotice::warn(message)).await;
            }
            AppEvent::VoiceLimitReached => {
                let handled = engine
                    .end_generation(self.generation, DisconnectReason::VoiceLimitReached, false)
                    .await;
                record_voice_limit(self.generation, "reached", handled);
                if handled {
                    self.session.set_learn_mode(false);
                    self.session.set_minimized(false);
                    self.collaborators
                        .cache
                        .invalidate(QueryKey::voice_usage_limits(&self.context))
                        .await;
                    self.collaborators.modals.open(ModalRequest::VoiceLimitReached).await;
                }
                return Flow::Stop;
            }
            AppEvent::ToolCallStart { function } => {
                record_tool_call(&function, "start", ToolFunction::from_name(&function).is_some());
                self.session.update_tool_output(|output| {
                    *output = ToolOutputState {
                        loading: true,
                        ..ToolOutputState::default()
                    };
                });
            }
            AppEvent::ToolCallEnd { function, output } => {
                self.handle_tool_result(&function, output).await;
            }
        }
        Flow::Continue
    }

    async fn handle_tool_result(&self, function: &str, output: Value) {
        let tool = ToolFunction::from_name(function);
        record_tool_call(function, "end", tool.is_some());
        match tool {
            Some(ToolFunction::KeyConcepts) => {
                let concepts = key_concepts(&output);
                self.session.update_tool_output(|state| {
                    state.key_concepts = concepts;
                    state.loading = false;
                });
            }
            Some(ToolFunction::Whiteboard) => {
                let board = output.clone();
                self.session.update_tool_output(|state| {
                    state.whiteboard = Some(board);
                    state.loading = false;
                });
                self.collaborators.modals.open(ModalRequest::Whiteboard(output)).await;
            }
            None => {
                debug!(target: TARGET, function, "ignoring unknown tool result");
                self.session.update_tool_output(|state| state.loading = false);
            }
        }
    }
}

/// 接受字符串数组，或带 `key_concepts` 数组字段的对象。
fn key_concepts(output: &Value) -> BTreeSet<String> {
    let list = match output {
        Value::Array(list) => list,
        Value::Object(map) => match map.get("key_concepts") {
            Some(Value::Array(list)) => list,
            _ => return BTreeSet::new(),
        },
        _ => return BTreeSet::new(),
    };
    list.iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_concepts_accepts_list_or_wrapped_list() {
        let direct = key_concepts(&json!(["limits", "derivatives", 3]));
        assert_eq!(direct.into_iter().collect::<Vec<_>>(), vec!["derivatives", "limits"]);

        let wrapped = key_concepts(&json!({"key_concepts": ["chain rule"]}));
        assert!(wrapped.contains("chain rule"));

        assert!(key_concepts(&json!("limits")).is_empty());
    }
}
