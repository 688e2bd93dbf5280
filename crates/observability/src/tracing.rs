//! Subscriber installation.
//!
//! Filtering comes from `RUST_LOG` and falls back to `info`. Job engine
//! events carry their identifiers as structured fields (`job_id`,
//! `sync_key`, `parent_job_id`, ...), which the JSON format keeps queryable.

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "info";
const FORMAT_ENV: &str = "JOBWEAVE_LOG_FORMAT";

/// Output format of the process log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event.
    #[default]
    Json,
    /// Human-readable single-line output for local runs.
    Compact,
}

impl LogFormat {
    /// Parse `json` or `compact` (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(LogFormat::Json),
            "compact" => Some(LogFormat::Compact),
            _ => None,
        }
    }

    /// Format from `JOBWEAVE_LOG_FORMAT`; unset or unknown values mean JSON.
    pub fn from_env() -> Self {
        std::env::var(FORMAT_ENV)
            .ok()
            .and_then(|v| Self::parse(&v))
            .unwrap_or_default()
    }
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Install the global subscriber.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_thread_names(true)
        .with_target(false);

    let _ = match format {
        LogFormat::Json => builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_formats() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse(" compact "), Some(LogFormat::Compact));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn repeated_init_is_harmless() {
        init(LogFormat::Compact);
        init(LogFormat::Json);
        ::tracing::info!(job_id = "test", "still logging");
    }
}
