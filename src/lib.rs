//! toolrelay: the core of a tool-augmented conversational backend.
//!
//! A prompt is classified against a fixed set of tool domains (weather,
//! stocks, web search). When one applies, its argument is extracted, the
//! tool server is called under a time budget, and the result is merged into
//! the streamed model answer. Any tool-side failure degrades to a plain
//! answer with a notice.

pub mod agent_core;
pub mod config;
pub mod inference;
pub mod tools;
pub mod transport;

#[cfg(test)]
mod test_support;

/// Default directives when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "toolrelay=info,warn";

/// Log output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// Reads `TOOLRELAY_LOG_FORMAT`; anything but `json` is text.
    pub fn from_env() -> Self {
        match std::env::var("TOOLRELAY_LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Initialize the tracing subscriber, writing to stderr so stdout stays
/// reserved for the answer stream.
///
/// `RUST_LOG` overrides `default_filter`. Calling this twice is harmless;
/// the second subscriber is ignored.
pub fn init_tracing(default_filter: &str, format: LogFormat) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    if installed.is_ok() {
        tracing::debug!(version = env!("CARGO_PKG_VERSION"), ?format, "tracing initialized");
    }
}
