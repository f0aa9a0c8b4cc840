use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::audio::TrackOffset;
use crate::session::{DisconnectReason, SessionPhase};

pub(crate) const TARGET: &str = "telemetry::voice_session";
pub(crate) const EVENT_TRANSITION: &str = "voice_session_transition";
pub(crate) const EVENT_INTERRUPTION: &str = "voice_session_interruption";
pub(crate) const EVENT_VOICE_LIMIT: &str = "voice_session_limit";
pub(crate) const EVENT_TOOL_CALL: &str = "voice_session_tool_call";
pub(crate) const EVENT_FRAMES_DROPPED: &str = "voice_session_frames_dropped";

#[derive(Debug, Serialize)]
pub struct SessionTransitionEvent<'a> {
    pub generation: u64,
    pub phase: SessionPhase,
    pub reason: Option<&'a DisconnectReason>,
    pub elapsed_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct InterruptionEvent<'a> {
    pub track_id: &'a str,
    pub offset: u64,
    pub audio_end_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct VoiceLimitEvent {
    pub generation: u64,
    pub kind: &'static str,
    pub handled: bool,
}

#[derive(Debug, Serialize)]
pub struct ToolCallEvent<'a> {
    pub function: &'a str,
    pub stage: &'static str,
    pub recognized: bool,
}

pub fn record_session_transition(
    generation: u64,
    phase: SessionPhase,
    reason: Option<&DisconnectReason>,
    elapsed: Option<Duration>,
) {
    let event = SessionTransitionEvent {
        generation,
        phase,
        reason,
        elapsed_ms: elapsed.map(duration_to_ms),
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: TARGET,
            event = EVENT_TRANSITION,
            generation,
            phase = phase.as_str(),
            reason = reason.map(DisconnectReason::as_str),
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_TRANSITION,
            %err,
            "failed to encode session transition event"
        ),
    }
}

pub fn record_interruption(offset: &TrackOffset) {
    let event = InterruptionEvent {
        track_id: &offset.track_id,
        offset: offset.offset,
        audio_end_ms: offset.audio_end_ms(),
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: TARGET,
            event = EVENT_INTERRUPTION,
            track_id = event.track_id,
            audio_end_ms = event.audio_end_ms,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_INTERRUPTION,
            %err,
            "failed to encode interruption event"
        ),
    }
}

pub fn record_voice_limit(generation: u64, kind: &'static str, handled: bool) {
    let event = VoiceLimitEvent {
        generation,
        kind,
        handled,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: TARGET,
            event = EVENT_VOICE_LIMIT,
            generation,
            kind,
            handled,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_VOICE_LIMIT,
            %err,
            "failed to encode voice limit event"
        ),
    }
}

pub fn record_tool_call(function: &str, stage: &'static str, recognized: bool) {
    let event = ToolCallEvent {
        function,
        stage,
        recognized,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: TARGET,
            event = EVENT_TOOL_CALL,
            function,
            stage,
            recognized,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_TOOL_CALL,
            %err,
            "failed to encode tool call event"
        ),
    }
}

pub fn record_frames_dropped(total: u64, capacity: usize) {
    warn!(
        target: TARGET,
        event = EVENT_FRAMES_DROPPED,
        total,
        capacity,
        "capture frames dropped"
    );
}

pub(crate) fn duration_to_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
