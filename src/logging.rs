//! Log output for hosts and viewers
//!
//! Events are emitted under the module path of their origin, so `RUST_LOG`
//! can single out one part of the pipeline:
//!
//! | target                                  | what it reports                          |
//! |-----------------------------------------|------------------------------------------|
//! | `remote_desk_stream::capture::streamer` | loop start/stop, keyframes, display sets |
//! | `remote_desk_stream::capture::gpu`      | duplication open/release, faults         |
//! | `remote_desk_stream::capture::display`  | enumeration and configuration changes    |
//! | `remote_desk_stream::capture::failure_log` | repeated failures, once per interval  |
//! | `remote_desk_stream::transport`         | framing errors, connection state         |
//! | `remote_desk_stream::session::host`     | per-session start, end and send failures |
//! | `remote_desk_stream::viewer`            | surface allocation, dropped payloads     |
//!
//! Failures retried every frame (desktop switch, enumeration, display
//! selection) go through `FailureLog`, so their warnings carry its target.
//! The capture loop runs on the `screen-capture` thread, whose name is
//! printed with every event.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Per-frame detail: backend choice, cursor composites, throttling
    Trace,
    /// Per-capture failures, loop commands, handle releases
    Debug,
    /// Session and display lifecycle
    #[default]
    Info,
    /// Recoverable problems such as GPU faults or dropped payloads
    Warn,
    /// Encoder failures and panicked threads
    Error,
}

impl LogLevel {
    fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

fn crate_filter(level: LogLevel) -> String {
    format!("{}={}", env!("CARGO_CRATE_NAME"), level.as_filter_str())
}

/// Installs the global subscriber
///
/// `level` applies to every `remote_desk_stream` target. A `RUST_LOG` value
/// replaces it entirely, e.g.
/// `RUST_LOG=remote_desk_stream=info,remote_desk_stream::capture::gpu=trace`.
///
/// ```no_run
/// use remote_desk_stream::logging::{init_logging, LogLevel};
///
/// init_logging(LogLevel::Debug);
/// ```
pub fn init_logging(level: LogLevel) {
    let default_filter = crate_filter(level);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_filter));

    // A second call keeps the first subscriber
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_names(true)
        .try_init();
}
