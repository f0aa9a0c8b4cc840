//! 把服务端增量事件归并为按到达顺序排列的对话条目。

use base64::prelude::*;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::messages::{ItemKind, ItemRole, ServerEvent, ServerItem};
use crate::audio::{wav, AudioFrame};

const TARGET: &str = "realtime_channel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    InProgress,
    Completed,
}

/// 条目完成后可直接播放的音频。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioAttachment {
    pub wav: Bytes,
    pub sample_rate: u32,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationItem {
    pub id: String,
    pub role: ItemRole,
    pub kind: ItemKind,
    pub status: ItemStatus,
    pub text: String,
    pub transcript: String,
    pub arguments: String,
    pub name: Option<String>,
    pub call_id: Option<String>,
    pub output: Option<String>,
    pub audio_samples: usize,
    pub audio: Option<AudioAttachment>,
}

impl ConversationItem {
    fn from_server(item: &ServerItem) -> Self {
        Self {
            id: item.id.clone(),
            role: item.role.unwrap_or_default(),
            kind: item.kind,
            status: status_of(item),
            text: initial_text(item),
            transcript: String::new(),
            arguments: item.arguments.clone().unwrap_or_default(),
            name: item.name.clone(),
            call_id: item.call_id.clone(),
            output: item.output.clone(),
            audio_samples: 0,
            audio: None,
        }
    }
}

fn status_of(item: &ServerItem) -> ItemStatus {
    match item.status.as_deref() {
        Some("completed") => ItemStatus::Completed,
        _ => ItemStatus::InProgress,
    }
}

fn initial_text(item: &ServerItem) -> String {
    item.content
        .iter()
        .filter_map(|part| part.get("text").and_then(|text| text.as_str()))
        .collect::<Vec<_>>()
        .join("")
}

/// 单次更新携带的增量。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemDelta {
    pub audio: Option<AudioFrame>,
    pub text: Option<String>,
    pub transcript: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogUpdate {
    Updated { item: ConversationItem, delta: Option<ItemDelta> },
    Deleted { item_id: String },
}

struct LogEntry {
    item: ConversationItem,
    pcm: Vec<i16>,
}

pub struct ConversationLog {
    sample_rate: u32,
    entries: Vec<LogEntry>,
    index: HashMap<String, usize>,
}

impl ConversationLog {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn items(&self) -> Vec<ConversationItem> {
        self.entries.iter().map(|entry| entry.item.clone()).collect()
    }

    pub fn get(&self, item_id: &str) -> Option<&ConversationItem> {
        self.index.get(item_id).map(|idx| &self.entries[*idx].item)
    }

    /// 应用一个服务端事件，返回需要向上游广播的更新。
    pub fn apply(&mut self, event: &ServerEvent) -> Option<LogUpdate> {
        match event {
            ServerEvent::ItemCreated { item } | ServerEvent::OutputItemAdded { item } => {
                Some(self.upsert(item))
            }
            ServerEvent::OutputItemDone { item } => {
                self.upsert(item);
                self.complete(&item.id)
            }
            ServerEvent::AudioDelta { item_id, delta } => {
                let bytes = match BASE64_STANDARD.decode(delta) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(target: TARGET, item_id, %err, "discarding undecodable audio delta");
                        return None;
                    }
                };
                let frame = AudioFrame::from_le_bytes(&bytes, self.sample_rate);
                let entry = self.entry_mut(item_id)?;
                entry.pcm.extend_from_slice(frame.samples());
                entry.item.audio_samples = entry.pcm.len();
                Some(LogUpdate::Updated {
                    item: entry.item.clone(),
                    delta: Some(ItemDelta {
                        audio: Some(frame),
                        ..Default::default()
                    }),
                })
            }
            ServerEvent::AudioTranscriptDelta { item_id, delta } => {
                let entry = self.entry_mut(item_id)?;
                entry.item.transcript.push_str(delta);
                Some(LogUpdate::Updated {
                    item: entry.item.clone(),
                    delta: Some(ItemDelta {
                        transcript: Some(delta.clone()),
                        ..Default::default()
                    }),
                })
            }
            ServerEvent::TextDelta { item_id, delta } => {
                let entry = self.entry_mut(item_id)?;
                entry.item.text.push_str(delta);
                Some(LogUpdate::Updated {
                    item: entry.item.clone(),
                    delta: Some(ItemDelta {
                        text: Some(delta.clone()),
                        ..Default::default()
                    }),
                })
            }
            ServerEvent::FunctionCallArgumentsDelta { item_id, delta } => {
                let entry = self.entry_mut(item_id)?;
                entry.item.arguments.push_str(delta);
                Some(LogUpdate::Updated {
                    item: entry.item.clone(),
                    delta: Some(ItemDelta {
                        arguments: Some(delta.clone()),
                        ..Default::default()
                    }),
                })
            }
            ServerEvent::TranscriptionCompleted { item_id, transcript } => {
                let entry = self.entry_mut(item_id)?;
                entry.item.transcript = transcript.clone();
                Some(LogUpdate::Updated {
                    item: entry.item.clone(),
                    delta: Some(ItemDelta {
                        transcript: Some(transcript.clone()),
                        ..Default::default()
                    }),
                })
            }
            ServerEvent::ItemTruncated { item_id, audio_end_ms } => {
                let sample_rate = self.sample_rate as u64;
                let entry = self.entry_mut(item_id)?;
                let keep = (audio_end_ms.saturating_mul(sample_rate) / 1_000) as usize;
                entry.pcm.truncate(keep);
                entry.item.audio_samples = entry.pcm.len();
                Some(LogUpdate::Updated {
                    item: entry.item.clone(),
                    delta: None,
                })
            }
            ServerEvent::ItemDeleted { item_id } => self.remove(item_id),
            _ => None,
        }
    }

    fn upsert(&mut self, server_item: &ServerItem) -> LogUpdate {
        if let Some(idx) = self.index.get(&server_item.id).copied() {
            let entry = &mut self.entries[idx];
            if entry.item.name.is_none() {
                entry.item.name = server_item.name.clone();
            }
            if entry.item.call_id.is_none() {
                entry.item.call_id = server_item.call_id.clone();
            }
            if let Some(output) = &server_item.output {
                entry.item.output = Some(output.clone());
            }
            if entry.item.text.is_empty() {
                entry.item.text = initial_text(server_item);
            }
            return LogUpdate::Updated {
                item: entry.item.clone(),
                delta: None,
            };
        }

        let item = ConversationItem::from_server(server_item);
        self.index.insert(item.id.clone(), self.entries.len());
        self.entries.push(LogEntry {
            item: item.clone(),
            pcm: Vec::new(),
        });
        debug!(target: TARGET, item_id = %item.id, "conversation item added");
        LogUpdate::Updated { item, delta: None }
    }

    fn complete(&mut self, item_id: &str) -> Option<LogUpdate> {
        let sample_rate = self.sample_rate;
        let entry = self.entry_mut(item_id)?;
        entry.item.status = ItemStatus::Completed;
        if !entry.pcm.is_empty() {
            match wav::encode_pcm16(&entry.pcm, sample_rate) {
                Ok(bytes) => {
                    entry.item.audio = Some(AudioAttachment {
                        wav: Bytes::from(bytes),
                        sample_rate,
                        samples: entry.pcm.len(),
                    })
                }
                Err(err) => warn!(target: TARGET, item_id, %err, "failed to attach item audio"),
            }
        }
        Some(LogUpdate::Updated {
            item: entry.item.clone(),
            delta: None,
        })
    }

    fn remove(&mut self, item_id: &str) -> Option<LogUpdate> {
        let idx = self.index.remove(item_id)?;
        self.entries.remove(idx);
        for position in self.index.values_mut() {
            if *position > idx {
                *position -= 1;
            }
        }
        Some(LogUpdate::Deleted {
            item_id: item_id.to_string(),
        })
    }

    fn entry_mut(&mut self, item_id: &str) -> Option<&mut LogEntry> {
        match self.index.get(item_id) {
            Some(idx) => self.entries.get_mut(*idx),
            None => {
                warn!(target: TARGET, item_id, "delta for unknown conversation item ignored");
                None
            }
        }
    }
}
