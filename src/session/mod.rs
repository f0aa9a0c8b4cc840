//! 会话状态存储。
//!
//! [`SessionHandle`] 由编排器独占写入，界面与其他读者只拿到快照，
//! 并可通过广播订阅生命周期与状态变化。

pub mod lifecycle;
pub mod transcription;
pub mod voice_input;

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::debug;

use crate::channel::ConversationItem;
pub use lifecycle::{DisconnectReason, SessionLifecycleUpdate, SessionPhase};
pub use transcription::{HttpTranscriber, Transcription, TranscriptionError};
pub use voice_input::VoiceInputRecorder;

const TARGET: &str = "session_state";

/// 最近一次工具调用留下的临时输出。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolOutputState {
    pub loading: bool,
    pub key_concepts: BTreeSet<String>,
    pub whiteboard: Option<Value>,
}

/// 状态变化通知，只携带变化的种类。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionChange {
    Phase,
    Muted,
    LearnMode,
    Minimized,
    Items,
    ToolOutput,
}

#[derive(Debug, Default)]
struct SessionState {
    phase: SessionPhase,
    learn_mode_active: bool,
    minimized: bool,
    items: Vec<ConversationItem>,
    index: HashMap<String, usize>,
    tool_output: ToolOutputState,
}

struct SessionShared {
    keep_alive: bool,
    muted: AtomicBool,
    state: RwLock<SessionState>,
    lifecycle_tx: broadcast::Sender<SessionLifecycleUpdate>,
    changes_tx: broadcast::Sender<SessionChange>,
}

/// 会话状态句柄，可廉价克隆。
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionShared>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("phase", &self.phase())
            .field("muted", &self.is_muted())
            .field("keep_alive", &self.keep_alive())
            .finish_non_exhaustive()
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new(false)
    }
}

impl SessionHandle {
    /// `keep_alive` 为真时，界面卸载不会结束会话。
    pub fn new(keep_alive: bool) -> Self {
        let (lifecycle_tx, _) = broadcast::channel(32);
        let (changes_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(SessionShared {
                keep_alive,
                muted: AtomicBool::new(false),
                state: RwLock::new(SessionState::default()),
                lifecycle_tx,
                changes_tx,
            }),
        }
    }

    pub fn keep_alive(&self) -> bool {
        self.inner.keep_alive
    }

    pub fn phase(&self) -> SessionPhase {
        self.read().phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == SessionPhase::Connected
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::Acquire)
    }

    pub fn learn_mode_active(&self) -> bool {
        self.read().learn_mode_active
    }

    pub fn minimized(&self) -> bool {
        self.read().minimized
    }

    pub fn items(&self) -> Vec<ConversationItem> {
        self.read().items.clone()
    }

    pub fn item(&self, item_id: &str) -> Option<ConversationItem> {
        let state = self.read();
        state.index.get(item_id).map(|idx| state.items[*idx].clone())
    }

    pub fn tool_output(&self) -> ToolOutputState {
        self.read().tool_output.clone()
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<SessionLifecycleUpdate> {
        self.inner.lifecycle_tx.subscribe()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<SessionChange> {
        self.inner.changes_tx.subscribe()
    }

    pub(crate) fn set_phase(&self, update: SessionLifecycleUpdate) {
        let changed = {
            let mut state = self.write();
            let changed = state.phase != update.phase;
            state.phase = update.phase;
            changed
        };
        if changed {
            self.notify(SessionChange::Phase);
        }
        if self.inner.lifecycle_tx.send(update).is_err() {
            debug!(target: TARGET, "no lifecycle subscribers");
        }
    }

    /// 翻转静音标记并返回新值。
    pub(crate) fn toggle_muted(&self) -> bool {
        let muted = !self.inner.muted.fetch_xor(true, Ordering::AcqRel);
        self.notify(SessionChange::Muted);
        muted
    }

    pub(crate) fn set_learn_mode(&self, active: bool) {
        if self.replace(|state| std::mem::replace(&mut state.learn_mode_active, active) != active) {
            self.notify(SessionChange::LearnMode);
        }
    }

    pub(crate) fn set_minimized(&self, minimized: bool) {
        if self.replace(|state| std::mem::replace(&mut state.minimized, minimized) != minimized) {
            self.notify(SessionChange::Minimized);
        }
    }

    pub(crate) fn upsert_item(&self, item: ConversationItem) {
        {
            let mut state = self.write();
            match state.index.get(&item.id).copied() {
                Some(idx) => state.items[idx] = item,
                None => {
                    let idx = state.items.len();
                    state.index.insert(item.id.clone(), idx);
                    state.items.push(item);
                }
            }
        }
        self.notify(SessionChange::Items);
    }

    pub(crate) fn remove_item(&self, item_id: &str) {
        let removed = {
            let mut state = self.write();
            match state.index.remove(item_id) {
                Some(idx) => {
                    state.items.remove(idx);
                    for position in state.index.values_mut() {
                        if *position > idx {
                            *position -= 1;
                        }
                    }
                    true
                }
                None => false,
            }
        };
        if removed {
            self.notify(SessionChange::Items);
        }
    }

    pub(crate) fn clear_items(&self) {
        {
            let mut state = self.write();
            state.items.clear();
            state.index.clear();
        }
        self.notify(SessionChange::Items);
    }

    pub(crate) fn update_tool_output<F>(&self, apply: F)
    where
        F: FnOnce(&mut ToolOutputState),
    {
        {
            let mut state = self.write();
            apply(&mut state.tool_output);
        }
        self.notify(SessionChange::ToolOutput);
    }

    /// 清除工具输出等仅在连接期间有效的状态。
    pub(crate) fn clear_transient(&self) {
        let cleared = self.replace(|state| {
            let was_set = state.tool_output != ToolOutputState::default();
            state.tool_output = ToolOutputState::default();
            was_set
        });
        if cleared {
            self.notify(SessionChange::ToolOutput);
        }
    }

    fn replace<F>(&self, apply: F) -> bool
    where
        F: FnOnce(&mut SessionState) -> bool,
    {
        let mut state = self.write();
        apply(&mut state)
    }

    fn notify(&self, change: SessionChange) {
        let _ = self.inner.changes_tx.send(change);
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        match self.inner.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        match self.inner.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
