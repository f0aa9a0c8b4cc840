use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use voxtutor_core::audio::{CpalInput, CpalOutput};
use voxtutor_core::orchestrator::{EngineConfig, SessionContext, SessionOrchestrator};
use voxtutor_core::session::{SessionLifecycleUpdate, SessionPhase};
use voxtutor_core::telemetry::init_tracing;

fn required_env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{name} must be set"))
}

fn context_from_env() -> Result<SessionContext> {
    Ok(SessionContext {
        user_id: required_env("VOXTUTOR_USER_ID")?,
        content_id: required_env("VOXTUTOR_CONTENT_ID")?,
        space_id: std::env::var("VOXTUTOR_SPACE_ID").ok(),
        chatbot_type: std::env::var("VOXTUTOR_CHATBOT").unwrap_or_else(|_| "tutor".to_string()),
    })
}

/// 生命周期流告知会话已结束时返回 true。落后丢帧时以当前阶段为准。
fn lifecycle_ended(update: Result<SessionLifecycleUpdate, RecvError>, phase: SessionPhase) -> bool {
    match update {
        Ok(update) if update.is_terminal() => {
            info!(target: "voxtutor", reason = ?update.reason, "voice session ended");
            true
        }
        Ok(update) => {
            info!(target: "voxtutor", phase = update.phase.as_str(), "session phase changed");
            false
        }
        Err(RecvError::Lagged(skipped)) => {
            warn!(target: "voxtutor", skipped, phase = phase.as_str(), "lifecycle updates lagged");
            phase == SessionPhase::Idle
        }
        Err(RecvError::Closed) => {
            warn!(target: "voxtutor", "lifecycle stream closed");
            true
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::var("VOXTUTOR_CONFIG") {
        Ok(path) => EngineConfig::from_file(&path).with_context(|| format!("failed to load {path}"))?,
        Err(_) => EngineConfig::from_env(),
    };
    let _log_guard = init_tracing(&config.telemetry);

    let context = context_from_env()?;
    let orchestrator = SessionOrchestrator::new(config, context, Arc::new(CpalInput), Arc::new(CpalOutput));
    let mut lifecycle = orchestrator.session().subscribe_lifecycle();

    orchestrator
        .connect_conversation()
        .await
        .context("failed to start voice session")?;
    info!(target: "voxtutor", "voice session running; press Ctrl+C to stop");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(target: "voxtutor", %err, "failed to listen for shutdown signal");
                }
                break;
            }
            update = lifecycle.recv() => {
                if lifecycle_ended(update, orchestrator.session().phase()) {
                    break;
                }
            }
        }
    }

    orchestrator.handle_stop().await;
    Ok(())
}
