//! 观测性初始化。

pub mod events;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::orchestrator::config::TelemetryConfig;

const LOG_FILE_PREFIX: &str = "voxtutor.log";

/// 安装全局订阅者。配置了日志目录时额外按天滚动写文件，
/// 返回的 guard 必须存活到进程退出。
pub fn init_tracing(config: &TelemetryConfig) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = if config.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(false).boxed()
    };

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = Registry::default().with(env_filter).with(console).with(file_layer);
    tracing::subscriber::set_global_default(subscriber).expect("failed to set global subscriber");
    guard
}
