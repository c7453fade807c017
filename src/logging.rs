//! Logging initialization, adapted from the teacher's `init_logging`:
//! an `EnvFilter` plus a console layer and an optional daily-rolling file
//! layer, registered through `tracing_subscriber::registry()`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Initializes the global subscriber. Must be called exactly once, before
/// any other module logs.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},binance_ingest=debug", config.level)));

    let file_layer = config.file.as_deref().and_then(build_file_layer);
    let file_logging_enabled = file_layer.is_some();

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if file_logging_enabled {
        if let Some(path) = &config.file {
            eprintln!("logging to: {path}");
        }
    }
}

type FileLayer = tracing_subscriber::fmt::Layer<
    tracing_subscriber::Registry,
    tracing_subscriber::fmt::format::DefaultFields,
    tracing_subscriber::fmt::format::Format,
    tracing_appender::non_blocking::NonBlocking,
>;

/// Builds the daily-rolling file layer. `dir` is preflight-checked for
/// writability: `tracing_appender::rolling::daily` panics if it can't
/// create its first file, and that panic would abort the release build
/// (it runs with `panic = "abort"`).
fn build_file_layer(dir: &str) -> Option<FileLayer> {
    if std::fs::create_dir_all(dir).is_err() {
        eprintln!("warning: could not create log directory {dir}, file logging disabled");
        return None;
    }

    let probe = std::path::Path::new(dir).join(".write_test");
    match std::fs::OpenOptions::new().create(true).append(true).open(&probe) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
        }
        Err(e) => {
            eprintln!("warning: log directory {dir} is not writable ({e}), file logging disabled");
            return None;
        }
    }

    let appender = tracing_appender::rolling::daily(dir, "binance-ingest.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    // Leaked deliberately: the guard must outlive the subscriber, and this
    // process runs for the program's whole lifetime.
    Box::leak(Box::new(guard));

    Some(
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true),
    )
}

/// Minimal logging for one-shot CLI commands (`--status`, `--list-symbols`).
pub fn init_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
