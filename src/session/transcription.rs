//! 独立语音输入的 HTTP 转写客户端。

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::orchestrator::config::VoiceInputConfig;
use crate::orchestrator::traits::Transcriber;

const TARGET: &str = "voice_input";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TranscriptionError {
    #[error("voice input is not recording")]
    NotRecording,
    #[error("failed to capture voice input: {0}")]
    Capture(String),
    #[error("transcription request failed: {0}")]
    Request(String),
    #[error("transcription service returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid transcription response: {0}")]
    InvalidResponse(String),
}

/// 转写结果。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Transcription {
    pub text: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// 把 WAV 以 `audio/wav` 请求体 POST 到转写服务。
pub struct HttpTranscriber {
    agent: ureq::Agent,
    url: String,
}

impl std::fmt::Debug for HttpTranscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTranscriber")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl HttpTranscriber {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            url: url.into(),
        }
    }

    pub fn from_config(config: &VoiceInputConfig) -> Self {
        Self::new(config.transcription_url.clone(), config.request_timeout())
    }

    fn post(agent: &ureq::Agent, url: &str, wav: &[u8]) -> Result<Transcription, TranscriptionError> {
        let response = match agent.post(url).set("Content-Type", "audio/wav").send_bytes(wav) {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                return Err(TranscriptionError::Status { status, body });
            }
            Err(err) => return Err(TranscriptionError::Request(err.to_string())),
        };

        let body = response
            .into_string()
            .map_err(|err| TranscriptionError::InvalidResponse(err.to_string()))?;
        serde_json::from_str(&body).map_err(|err| TranscriptionError::InvalidResponse(err.to_string()))
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, wav: Bytes) -> Result<Transcription, TranscriptionError> {
        let agent = self.agent.clone();
        let url = self.url.clone();
        let bytes = wav.len();
        let result = tokio::task::spawn_blocking(move || Self::post(&agent, &url, &wav))
            .await
            .map_err(|err| TranscriptionError::Request(format!("request task failed: {err}")))?;

        match &result {
            Ok(transcription) => info!(
                target: TARGET,
                bytes,
                chars = transcription.text.chars().count(),
                "voice input transcribed"
            ),
            Err(err) => warn!(target: TARGET, %err, "voice input transcription failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;

    /// 应答一次请求并把收到的请求头与请求体交还给测试。
    fn serve_once(status_line: &'static str, body: &'static str) -> (String, mpsc::Receiver<(String, Vec<u8>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let url = format!("http://{}/api/transcribe", listener.local_addr().expect("addr"));
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut head = String::new();
            let mut length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("read header");
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    length = value.trim().parse().expect("length");
                }
                head.push_str(&line);
            }
            let mut payload = vec![0; length];
            reader.read_exact(&mut payload).expect("read body");
            tx.send((head, payload)).expect("report request");

            let mut stream = stream;
            let response = format!(
                "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).expect("write response");
        });
        (url, rx)
    }

    #[tokio::test]
    async fn posts_wave_and_parses_text() {
        let (url, requests) = serve_once("HTTP/1.1 200 OK", r#"{"text":"hello there","id":"tr_1","status":"completed"}"#);
        let transcriber = HttpTranscriber::new(url, Duration::from_secs(2));

        let result = transcriber
            .transcribe(Bytes::from_static(b"RIFF....WAVE"))
            .await
            .expect("transcribe");

        assert_eq!(result.text, "hello there");
        assert_eq!(result.id.as_deref(), Some("tr_1"));
        let (head, payload) = requests.recv().expect("request");
        assert!(head.starts_with("POST /api/transcribe"));
        assert!(head.to_ascii_lowercase().contains("content-type: audio/wav"));
        assert_eq!(payload, b"RIFF....WAVE");
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let (url, _requests) = serve_once("HTTP/1.1 503 Service Unavailable", r#"{"error":"busy"}"#);
        let transcriber = HttpTranscriber::new(url, Duration::from_secs(2));

        let err = transcriber
            .transcribe(Bytes::from_static(b"RIFF"))
            .await
            .expect_err("status");
        match err {
            TranscriptionError::Status { status, body } => {
                assert_eq!(status, 503);
                assert!(body.contains("busy"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_response() {
        let (url, _requests) = serve_once("HTTP/1.1 200 OK", "not json");
        let transcriber = HttpTranscriber::new(url, Duration::from_secs(2));

        let err = transcriber
            .transcribe(Bytes::from_static(b"RIFF"))
            .await
            .expect_err("invalid");
        assert!(matches!(err, TranscriptionError::InvalidResponse(_)));
    }
}
