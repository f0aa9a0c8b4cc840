//! 独立语音输入：录一段 44.1 kHz 音频，结束后整段送去转写。
//!
//! 与实时会话完全隔离，失败只返回给调用方。

use std::sync::Arc;
use tracing::{debug, info};

use super::transcription::{Transcription, TranscriptionError};
use crate::audio::{
    AudioCapture, CaptureBackend, CaptureOptions, FrequencySnapshot, FrequencyView, VOICE_INPUT_SAMPLE_RATE,
};
use crate::orchestrator::traits::Transcriber;

const TARGET: &str = "voice_input";

pub struct VoiceInputRecorder {
    capture: AudioCapture,
    transcriber: Arc<dyn Transcriber>,
}

impl std::fmt::Debug for VoiceInputRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceInputRecorder")
            .field("capture", &self.capture)
            .finish_non_exhaustive()
    }
}

impl VoiceInputRecorder {
    pub fn new(backend: Arc<dyn CaptureBackend>, transcriber: Arc<dyn Transcriber>) -> Self {
        let capture = AudioCapture::new(
            backend,
            CaptureOptions {
                retain_recording: true,
                ..CaptureOptions::default()
            },
        );
        Self { capture, transcriber }
    }

    pub fn is_recording(&self) -> bool {
        self.capture.is_recording()
    }

    pub async fn start(&self) -> Result<(), TranscriptionError> {
        self.capture
            .begin(VOICE_INPUT_SAMPLE_RATE)
            .await
            .map_err(|err| TranscriptionError::Capture(err.to_string()))?;
        self.capture
            .record(|_| {})
            .map_err(|err| TranscriptionError::Capture(err.to_string()))?;
        info!(target: TARGET, "voice input recording");
        Ok(())
    }

    /// 录音波形展示用。
    pub fn frequencies(&self, view: FrequencyView) -> FrequencySnapshot {
        self.capture.get_frequencies(view)
    }

    /// 结束录音并提交转写。
    pub async fn stop(&self) -> Result<Transcription, TranscriptionError> {
        if !self.capture.is_open() {
            return Err(TranscriptionError::NotRecording);
        }
        let recorded = self
            .capture
            .end()
            .await
            .map_err(|err| TranscriptionError::Capture(err.to_string()))?;
        debug!(
            target: TARGET,
            samples = recorded.samples,
            bytes = recorded.size,
            "submitting voice input"
        );
        self.transcriber.transcribe(recorded.wav).await
    }

    pub fn cancel(&self) {
        self.capture.quit();
        debug!(target: TARGET, "voice input cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::FakeMicrophone;
    use crate::audio::wav;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingTranscriber {
        received: Mutex<Vec<Bytes>>,
        fail: bool,
    }

    #[async_trait]
    impl Transcriber for CapturingTranscriber {
        async fn transcribe(&self, wav: Bytes) -> Result<Transcription, TranscriptionError> {
            self.received.lock().unwrap().push(wav);
            if self.fail {
                return Err(TranscriptionError::Request("offline".into()));
            }
            Ok(Transcription {
                text: "what is a limit".into(),
                id: None,
                status: Some("completed".into()),
            })
        }
    }

    fn recorder(mic: &Arc<FakeMicrophone>, transcriber: &Arc<CapturingTranscriber>) -> VoiceInputRecorder {
        VoiceInputRecorder::new(
            mic.clone() as Arc<dyn CaptureBackend>,
            transcriber.clone() as Arc<dyn Transcriber>,
        )
    }

    #[tokio::test]
    async fn stop_submits_recorded_wave() {
        let mic = Arc::new(FakeMicrophone::default());
        let transcriber = Arc::new(CapturingTranscriber::default());
        let recorder = recorder(&mic, &transcriber);

        recorder.start().await.expect("start");
        assert!(recorder.is_recording());
        mic.push(&[5, -5, 7]);

        let result = recorder.stop().await.expect("stop");
        assert_eq!(result.text, "what is a limit");

        let received = transcriber.received.lock().unwrap();
        let (samples, rate) = wav::decode_pcm16(&received[0]).expect("decode");
        assert_eq!(samples, vec![5, -5, 7]);
        assert_eq!(rate, VOICE_INPUT_SAMPLE_RATE);
        assert!(!mic.is_live());
    }

    #[tokio::test]
    async fn stop_without_start_is_rejected() {
        let mic = Arc::new(FakeMicrophone::default());
        let transcriber = Arc::new(CapturingTranscriber::default());
        let recorder = recorder(&mic, &transcriber);

        assert_eq!(recorder.stop().await, Err(TranscriptionError::NotRecording));
        assert!(transcriber.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_releases_without_submitting() {
        let mic = Arc::new(FakeMicrophone::default());
        let transcriber = Arc::new(CapturingTranscriber::default());
        let recorder = recorder(&mic, &transcriber);

        recorder.start().await.expect("start");
        recorder.cancel();

        assert!(!mic.is_live());
        assert_eq!(recorder.stop().await, Err(TranscriptionError::NotRecording));
        assert!(transcriber.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transcriber_failure_reaches_caller() {
        let mic = Arc::new(FakeMicrophone::default());
        let transcriber = Arc::new(CapturingTranscriber {
            fail: true,
            ..CapturingTranscriber::default()
        });
        let recorder = recorder(&mic, &transcriber);

        recorder.start().await.expect("start");
        let err = recorder.stop().await.expect_err("fails");
        assert_eq!(err, TranscriptionError::Request("offline".into()));
    }

    #[tokio::test]
    async fn denied_microphone_is_capture_error() {
        let mic = Arc::new(FakeMicrophone::default());
        mic.deny_permission();
        let transcriber = Arc::new(CapturingTranscriber::default());
        let recorder = recorder(&mic, &transcriber);

        assert!(matches!(recorder.start().await, Err(TranscriptionError::Capture(_))));
    }
}
