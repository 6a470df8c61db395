//! Logging configuration

use std::sync::LazyLock;
use tracing_subscriber::{
    fmt, fmt::time::ChronoLocal, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

static HOSTNAME: LazyLock<String> = LazyLock::new(|| {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
});

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Resident memory of this process, e.g. `"42.3M"`
pub fn get_memory_usage() -> String {
    use sysinfo::{Pid, System};

    let pid = Pid::from_u32(std::process::id());
    let mut system = System::new();
    system.refresh_process(pid);
    match system.process(pid) {
        Some(process) => format!("{:.1}M", process.memory() as f64 / (1024.0 * 1024.0)),
        None => "N/A".to_string(),
    }
}

pub fn get_hostname() -> &'static str {
    &HOSTNAME
}

/// Compact human-readable output; `RUST_LOG` overrides the `info` default
pub fn init_logger() {
    dotenvy::dotenv().ok();

    let _ = tracing_subscriber::registry()
        .with(default_filter())
        .with(
            fmt::layer()
                .with_timer(ChronoLocal::rfc_3339())
                .with_target(false)
                .with_level(true)
                .with_ansi(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .try_init();

    tracing::info!("Logger initialized");
}

/// Like [`init_logger`] with module targets, announcing host and memory
pub fn init_logger_detailed() {
    dotenvy::dotenv().ok();

    let _ = tracing_subscriber::registry()
        .with(default_filter())
        .with(
            fmt::layer()
                .with_timer(ChronoLocal::rfc_3339())
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .try_init();

    tracing::info!(
        hostname = %get_hostname(),
        memory = %get_memory_usage(),
        "Logger initialized (detailed format)"
    );
}

#[cfg(feature = "json")]
pub fn init_logger_json() {
    dotenvy::dotenv().ok();

    let _ = tracing_subscriber::registry()
        .with(default_filter())
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true),
        )
        .try_init();

    tracing::info!(hostname = %get_hostname(), "Logger initialized (JSON format)");
}

/// Test writer with an `error` default; safe to call from every test
pub fn init_test_logger() {
    use tracing_subscriber::fmt::TestWriter;

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("error")))
        .with(
            fmt::layer()
                .with_writer(TestWriter::default())
                .with_target(false)
                .with_ansi(false)
                .compact(),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_harmless() {
        init_test_logger();
        init_test_logger();
        init_logger();
        tracing::error!("still logging");
    }

    #[test]
    fn test_host_and_memory_labels() {
        assert!(!get_hostname().is_empty());
        let memory = get_memory_usage();
        assert!(memory == "N/A" || memory.ends_with('M'));
    }
}
