use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::audio::capture::DEFAULT_FRAME_SAMPLES;
use crate::audio::playback::DEFAULT_QUEUE_CAPACITY;
use crate::audio::REALTIME_SAMPLE_RATE;

const ENV_PREFIX: &str = "VOXTUTOR_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub channel: ChannelConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub realtime: RealtimeSessionConfig,
    pub voice_input: VoiceInputConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    pub scheme: String,
    pub host: String,
    pub sample_rate: u32,
    pub outbound_capacity: usize,
    pub connect_timeout_ms: u64,
    pub close_timeout_ms: u64,
}

impl ChannelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            scheme: "wss".into(),
            host: "localhost:8000".into(),
            sample_rate: REALTIME_SAMPLE_RATE,
            outbound_capacity: 256,
            connect_timeout_ms: 10_000,
            close_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    pub frame_samples: usize,
    /// 采集回调与转发任务之间的帧队列容量，满时丢弃最旧的帧。
    pub frame_queue_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_samples: DEFAULT_FRAME_SAMPLES,
            frame_queue_capacity: 48,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    pub queue_capacity: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RealtimeSessionConfig {
    pub modalities: Vec<String>,
    pub server_vad: bool,
    pub silence_duration_ms: Option<u32>,
    pub transcription_model: Option<String>,
    pub instructions: Option<String>,
}

impl Default for RealtimeSessionConfig {
    fn default() -> Self {
        Self {
            modalities: vec!["text".into(), "audio".into()],
            server_vad: true,
            silence_duration_ms: None,
            transcription_model: Some("whisper-1".into()),
            instructions: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VoiceInputConfig {
    pub transcription_url: String,
    pub request_timeout_ms: u64,
}

impl VoiceInputConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for VoiceInputConfig {
    fn default() -> Self {
        Self {
            transcription_url: "https://localhost:8000/api/transcribe".into(),
            request_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TelemetryConfig {
    pub json: bool,
    pub log_dir: Option<PathBuf>,
}

impl EngineConfig {
    /// 默认配置叠加 `VOXTUTOR_*` 环境变量。
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// 读取 JSON 配置文件，再叠加环境变量。
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_json(&raw)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub(crate) fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|value| !value.is_empty());

        if let Some(scheme) = get("SCHEME") {
            self.channel.scheme = scheme;
        }
        if let Some(host) = get("HOST") {
            self.channel.host = host;
        }
        if let Some(frames) = get("FRAME_QUEUE_CAPACITY").and_then(|value| value.parse().ok()) {
            self.capture.frame_queue_capacity = frames;
        }
        if let Some(model) = get("TRANSCRIPTION_MODEL") {
            self.realtime.transcription_model = Some(model);
        }
        if let Some(instructions) = get("INSTRUCTIONS") {
            self.realtime.instructions = Some(instructions);
        }
        if let Some(url) = get("TRANSCRIBE_URL") {
            self.voice_input.transcription_url = url;
        }
        if let Some(json) = get("LOG_JSON") {
            self.telemetry.json = matches!(json.as_str(), "1" | "true" | "yes");
        }
        if let Some(dir) = get("LOG_DIR") {
            self.telemetry.log_dir = Some(PathBuf::from(dir));
        }
    }
}
