//! Tracing/logging setup shared by the offsync binaries.

/// Tracing configuration (filters, formatting).
pub mod tracing;

pub use crate::tracing::LogFormat;

/// Initialize process-wide observability with JSON logs at `info`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(LogFormat::Json, "info");
}

/// Initialize with an explicit format and fallback filter.
///
/// `RUST_LOG` still takes precedence over `default_filter` when set.
pub fn init_with(format: LogFormat, default_filter: &str) {
    tracing::init(format, default_filter);
}
