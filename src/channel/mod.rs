//! 与远端对话代理之间的持久双向实时通道。
//!
//! 传输任务独占 WebSocket，出站命令经有界队列进入，入站事件按到达顺序
//! 以 [`ChannelEvent`] 交给唯一的消费者。通道不做自动重连。

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

pub mod conversation;
pub mod messages;

pub use conversation::{AudioAttachment, ConversationItem, ConversationLog, ItemDelta, ItemStatus, LogUpdate};
pub use messages::{ClientEvent, ItemKind, ItemRole, OutboundEvent, ServerError, ServerEvent, SessionConfig};

use crate::audio::{AudioFrame, TrackOffset};
use crate::orchestrator::config::ChannelConfig;

const TARGET: &str = "realtime_channel";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid realtime url: {0}")]
    InvalidUrl(String),
    #[error("failed to connect realtime channel: {0}")]
    ConnectionFailed(String),
    #[error("realtime channel is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Client,
    Server,
}

/// 通道上流经的原始事件。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealtimeEnvelope {
    pub source: EventSource,
    pub event: Value,
}

impl RealtimeEnvelope {
    pub fn event_type(&self) -> Option<&str> {
        self.event.get("type").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Realtime(RealtimeEnvelope),
    ConversationUpdated {
        item: ConversationItem,
        delta: Option<ItemDelta>,
    },
    ConversationItemDeleted {
        item_id: String,
    },
    /// 服务端 VAD 检测到用户开口。
    ConversationInterrupted,
    Error(ServerError),
    Closed {
        reason: String,
    },
}

/// 组装会话地址：`<scheme>://<host>/ws?user_id=..&content_id=..`。
pub fn build_session_url(
    scheme: &str,
    host: &str,
    user_id: &str,
    content_id: &str,
) -> Result<Url, ChannelError> {
    let mut url = Url::parse(&format!("{scheme}://{host}/ws"))
        .map_err(|err| ChannelError::InvalidUrl(format!("{scheme}://{host}: {err}")))?;
    url.query_pairs_mut()
        .append_pair("user_id", user_id)
        .append_pair("content_id", content_id);
    Ok(url)
}

/// 可克隆的出站句柄，供采集转发与编排器共享。
#[derive(Debug, Clone)]
pub struct ChannelSender {
    outbound: mpsc::Sender<ClientEvent>,
    open: Arc<AtomicBool>,
}

impl ChannelSender {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    pub async fn send(&self, event: ClientEvent) -> Result<(), ChannelError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        self.outbound.send(event).await.map_err(|_| ChannelError::Closed)
    }

    pub async fn update_session(&self, session: SessionConfig) -> Result<(), ChannelError> {
        self.send(ClientEvent::SessionUpdate { session }).await
    }

    pub async fn append_input_audio(&self, frame: &AudioFrame) -> Result<(), ChannelError> {
        self.send(ClientEvent::audio_append(&frame.to_le_bytes())).await
    }

    /// 取消进行中的回复，并把条目截断到实际播放的位置。
    pub async fn cancel_response(&self, offset: &TrackOffset, content_index: u32) -> Result<(), ChannelError> {
        self.send(ClientEvent::ResponseCancel).await?;
        self.send(ClientEvent::ConversationItemTruncate {
            item_id: offset.track_id.clone(),
            content_index,
            audio_end_ms: offset.audio_end_ms(),
        })
        .await
    }

    pub async fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        self.send(ClientEvent::ConversationItemCreate {
            item: messages::UserMessageItem::text(text),
        })
        .await?;
        self.send(ClientEvent::ResponseCreate).await
    }
}

pub struct RealtimeChannel {
    sender: ChannelSender,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    close_timeout: Duration,
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("open", &self.sender.is_open())
            .finish_non_exhaustive()
    }
}

impl RealtimeChannel {
    /// 建立连接并启动传输任务。返回的接收端是事件流的唯一消费者。
    pub async fn connect(
        url: &Url,
        config: &ChannelConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>), ChannelError> {
        let (ws_stream, _response) = tokio::time::timeout(
            config.connect_timeout(),
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| ChannelError::ConnectionFailed("handshake timed out".into()))?
        .map_err(|err| ChannelError::ConnectionFailed(err.to_string()))?;

        info!(target: TARGET, host = url.host_str().unwrap_or_default(), "realtime channel connected");

        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let open = Arc::new(AtomicBool::new(true));

        let transport = Transport {
            log: ConversationLog::new(config.sample_rate),
            events: events_tx,
            open: Arc::clone(&open),
        };
        let task = tokio::spawn(transport.run(ws_stream, outbound_rx, shutdown_rx));

        Ok((
            Self {
                sender: ChannelSender {
                    outbound: outbound_tx,
                    open,
                },
                shutdown: Some(shutdown_tx),
                task: Some(task),
                close_timeout: config.close_timeout(),
            },
            events_rx,
        ))
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    /// 发送关闭帧并等待传输任务退出，超时则直接中止。可重复调用。
    pub async fn close(&mut self) {
        self.sender.open.store(false, Ordering::Release);
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(self.close_timeout, &mut task).await.is_err() {
                warn!(target: TARGET, "transport did not stop in time; aborting");
                task.abort();
            }
        }
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.sender.open.store(false, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Transport {
    log: ConversationLog,
    events: mpsc::UnboundedSender<ChannelEvent>,
    open: Arc<AtomicBool>,
}

impl Transport {
    async fn run(
        mut self,
        ws_stream: WsStream,
        mut outbound: mpsc::Receiver<ClientEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let reason = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client disconnect".into(),
                    };
                    if let Err(err) = ws_sink.send(Message::Close(Some(frame))).await {
                        debug!(target: TARGET, %err, "close frame not delivered");
                    }
                    break "closed by client".to_string();
                }
                Some(event) = outbound.recv() => {
                    let envelope = OutboundEvent::new(event);
                    let json = match serde_json::to_string(&envelope) {
                        Ok(json) => json,
                        Err(err) => {
                            error!(target: TARGET, %err, "failed to serialize client event");
                            continue;
                        }
                    };
                    if let Err(err) = ws_sink.send(Message::Text(json.into())).await {
                        error!(target: TARGET, %err, "failed to send realtime message");
                        break format!("send failed: {err}");
                    }
                    if !envelope.event.is_audio_append() {
                        self.echo(&envelope);
                    }
                }
                message = ws_stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text),
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(err) = ws_sink.send(Message::Pong(data)).await {
                                warn!(target: TARGET, %err, "failed to send pong");
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(target: TARGET, ?frame, "realtime channel closed by server");
                            break frame
                                .map(|frame| format!("closed by server: {}", frame.reason.as_str()))
                                .unwrap_or_else(|| "closed by server".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            error!(target: TARGET, %err, "realtime channel error");
                            break format!("transport error: {err}");
                        }
                        None => break "stream ended".to_string(),
                    }
                }
            }
        };

        self.open.store(false, Ordering::Release);
        let _ = self.events.send(ChannelEvent::Closed { reason });
    }

    fn echo(&self, envelope: &OutboundEvent) {
        match serde_json::to_value(envelope) {
            Ok(event) => self.emit(ChannelEvent::Realtime(RealtimeEnvelope {
                source: EventSource::Client,
                event,
            })),
            Err(err) => warn!(target: TARGET, %err, "failed to mirror client event"),
        }
    }

    fn handle_text(&mut self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                warn!(target: TARGET, %err, "discarding malformed server message");
                return;
            }
        };

        let parsed = ServerEvent::deserialize(&value);
        self.emit(ChannelEvent::Realtime(RealtimeEnvelope {
            source: EventSource::Server,
            event: value,
        }));

        let event = match parsed {
            Ok(event) => event,
            Err(err) => {
                debug!(target: TARGET, %err, "server event not understood by conversation log");
                return;
            }
        };
        match &event {
            ServerEvent::SpeechStarted { .. } => self.emit(ChannelEvent::ConversationInterrupted),
            ServerEvent::Error { error } => {
                warn!(target: TARGET, code = ?error.code, message = %error.message, "server reported error");
                self.emit(ChannelEvent::Error(error.clone()));
            }
            _ => {}
        }
        match self.log.apply(&event) {
            Some(LogUpdate::Updated { item, delta }) => {
                self.emit(ChannelEvent::ConversationUpdated { item, delta })
            }
            Some(LogUpdate::Deleted { item_id }) => self.emit(ChannelEvent::ConversationItemDeleted { item_id }),
            None => {}
        }
    }

    fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).is_err() {
            debug!(target: TARGET, "event consumer dropped");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing;
