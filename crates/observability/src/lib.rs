//! Process-wide tracing setup shared by jobweave binaries.

/// Initialize process-wide tracing in the format named by
/// `JOBWEAVE_LOG_FORMAT` (JSON unless set to `compact`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Subscriber configuration (filters, output format).
pub mod tracing;

pub use self::tracing::LogFormat;
