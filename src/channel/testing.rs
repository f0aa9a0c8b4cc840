//! 本地 WebSocket 模拟服务端，记录客户端发来的每条消息。

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_millis(1_000);

#[derive(Debug)]
pub(crate) enum ServerAction {
    Send(Value),
    Close,
}

pub(crate) struct MockRealtimeServer {
    host: String,
    client_rx: mpsc::UnboundedReceiver<Value>,
    server_tx: mpsc::UnboundedSender<ServerAction>,
    requests: Arc<Mutex<Vec<String>>>,
    disconnects: Arc<Mutex<usize>>,
}

impl MockRealtimeServer {
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let host = listener.local_addr().expect("local addr").to_string();
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, mut server_rx) = mpsc::unbounded_channel::<ServerAction>();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let disconnects = Arc::new(Mutex::new(0));

        let seen = Arc::clone(&requests);
        let ended = Arc::clone(&disconnects);
        tokio::spawn(async move {
            // 顺序处理连接：重连必须等上一条连接结束
            while let Ok((stream, _)) = listener.accept().await {
                let seen = Arc::clone(&seen);
                let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                    seen.lock().unwrap().push(request.uri().to_string());
                    Ok(response)
                };
                let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    continue;
                };
                let (mut sink, mut source) = ws.split();
                loop {
                    tokio::select! {
                        incoming = source.next() => match incoming {
                            Some(Ok(Message::Text(text))) => {
                                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                                    let _ = client_tx.send(value);
                                }
                            }
                            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                            Some(Ok(_)) => {}
                        },
                        action = server_rx.recv() => match action {
                            Some(ServerAction::Send(value)) => {
                                if sink.send(Message::Text(value.to_string().into())).await.is_err() {
                                    break;
                                }
                            }
                            Some(ServerAction::Close) => {
                                let _ = sink.send(Message::Close(None)).await;
                                break;
                            }
                            None => return,
                        },
                    }
                }
                *ended.lock().unwrap() += 1;
            }
        });

        Self {
            host,
            client_rx,
            server_tx,
            requests,
            disconnects,
        }
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn send(&self, value: Value) {
        self.server_tx.send(ServerAction::Send(value)).expect("mock server alive");
    }

    pub(crate) fn close(&self) {
        self.server_tx.send(ServerAction::Close).expect("mock server alive");
    }

    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn disconnects(&self) -> usize {
        *self.disconnects.lock().unwrap()
    }

    /// 等待下一条给定类型的客户端消息，跳过其他类型。
    pub(crate) async fn expect_client(&mut self, event_type: &str) -> Value {
        loop {
            let value = timeout(WAIT, self.client_rx.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {event_type}"))
                .expect("mock server stopped");
            if value["type"] == event_type {
                return value;
            }
        }
    }

    /// 收集一段时间内到达的所有客户端消息。
    pub(crate) async fn collect_for(&mut self, window: Duration) -> Vec<Value> {
        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(value)) = tokio::time::timeout_at(deadline, self.client_rx.recv()).await {
            collected.push(value);
        }
        collected
    }
}
