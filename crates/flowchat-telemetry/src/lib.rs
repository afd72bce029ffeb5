pub mod http;
pub mod log;
pub mod sqlite;

pub use http::HttpBackend;
pub use log::{LogTelemetry, NullTelemetry};
pub use sqlite::{SessionSummary, SqliteTelemetry};

use std::sync::Arc;

use flowchat_core::config::{AppConfig, TelemetryBackend};
use flowchat_core::error::{FlowError, Result};
use flowchat_core::traits::TelemetryPort;

/// Build the telemetry port selected by `[telemetry] backend`.
pub fn from_config(config: &AppConfig) -> Result<Arc<dyn TelemetryPort>> {
    let port: Arc<dyn TelemetryPort> = match config.telemetry.backend {
        TelemetryBackend::Log => Arc::new(LogTelemetry::new()),
        TelemetryBackend::None => Arc::new(NullTelemetry),
        TelemetryBackend::Sqlite => Arc::new(SqliteTelemetry::open(&config.db_path())?),
        TelemetryBackend::Http => {
            let base_url = config.telemetry.base_url.clone().ok_or_else(|| {
                FlowError::Config("telemetry.base_url is required for the http backend".into())
            })?;
            Arc::new(HttpBackend::new(base_url, config.telemetry.api_key.clone())?)
        }
    };
    Ok(port)
}
