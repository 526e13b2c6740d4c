//! Replay-safe logging for orchestration code.
//!
//! Orchestrations re-run from the start on every activation, so a plain `tracing` call
//! would repeat once per activation. These macros only emit while the orchestration is
//! executing past the recorded part of its history.

#[macro_export]
macro_rules! durable_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        if ctx.is_logging_enabled() {
            ::tracing::debug!(target: "dureplay::orchestration", instance_id = %ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        if ctx.is_logging_enabled() {
            ::tracing::info!(target: "dureplay::orchestration", instance_id = %ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        if ctx.is_logging_enabled() {
            ::tracing::warn!(target: "dureplay::orchestration", instance_id = %ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        if ctx.is_logging_enabled() {
            ::tracing::error!(target: "dureplay::orchestration", instance_id = %ctx.instance_id(), $($arg)+);
        }
    }};
}
