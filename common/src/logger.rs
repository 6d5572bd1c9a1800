// Copyright (c) 2018-2022 The Botho Foundation

//! Logging bootstrap.
//!
//! The engine logs through the global `tracing` subscriber; components never
//! carry a logger instance, they just call `tracing::{debug,info,warn,error}`
//! directly. This module only provides the one-time process-level wiring, in
//! the style the rest of the workspace migrated to from slog.

/// Initialize a `tracing-subscriber` fmt subscriber driven by `RUST_LOG`
/// (default `info`). Safe to call more than once; later calls are no-ops.
///
/// Intended for binaries and tests embedding the engine. The library itself
/// never calls this on its own.
#[cfg(feature = "logger")]
pub fn init_logger() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// Time a scope and emit a trace-level log with the elapsed duration.
///
/// ```ignore
/// trace_time!("discovery::sync_loop");
/// ```
#[macro_export]
macro_rules! trace_time {
    ($($arg:tt)+) => {
        let _trace_time = $crate::__private::TraceTime::new(format!($($arg)+));
    };
}

#[doc(hidden)]
pub mod __private {
    use std::time::Instant;

    pub struct TraceTime {
        msg: String,
        start: Instant,
    }

    impl TraceTime {
        pub fn new(msg: String) -> Self {
            Self {
                msg,
                start: Instant::now(),
            }
        }
    }

    impl Drop for TraceTime {
        fn drop(&mut self) {
            let elapsed = self.start.elapsed();
            tracing::trace!(duration_ms = elapsed.as_secs_f64() * 1000.0, "{}", self.msg);
        }
    }
}

#[cfg(all(test, feature = "logger"))]
mod tests {
    use super::*;

    #[test]
    fn init_logger_is_idempotent() {
        init_logger();
        init_logger();
    }
}
