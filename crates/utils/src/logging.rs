//! provides logging helpers

use std::env;
use std::fmt;
use std::path::Path;

use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Subscriber;
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::format;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

/// Environment variable redirecting the human-readable log to a rolling file.
pub const LOG_PATH_ENV_VAR: &str = "GOVERNOR_LOG_PATH";

/// Tracing target reserved for encoded metric lines.
pub const METRICS_TARGET: &str = "metrics";

const DEFAULT_LOG_PREFIX: &str = "governor.log";
const DEFAULT_METRICS_PREFIX: &str = "metrics.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Writes the event's fields verbatim, one metric line per event.
struct RawLineFormatter;

struct FieldVisitor {
    msg: String,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, _: &Field, value: &str) {
        self.msg.push_str(value);
    }

    fn record_debug(&mut self, _: &Field, value: &dyn fmt::Debug) {
        self.msg.push_str(&format!("{value:?}"));
    }
}

impl<S, N> FormatEvent<S, N> for RawLineFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldVisitor { msg: String::new() };
        event.record(&mut visitor);
        write!(writer, "{}", visitor.msg)?;
        if !visitor.msg.ends_with('\n') {
            writeln!(writer)?;
        }
        Ok(())
    }
}

/// Splits a configured log location into the rotation directory and file prefix.
///
/// A directory keeps `default_prefix`; a file path rotates next to itself.
pub fn split_log_path<'a>(path: &'a Path, default_prefix: &'a str) -> (&'a Path, &'a str) {
    if path.is_dir() {
        return (path, default_prefix);
    }
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(default_prefix);
    (parent, prefix)
}

fn rolling_writer(path: &Path, default_prefix: &str) -> (NonBlocking, WorkerGuard) {
    let (rotation_dir, prefix) = split_log_path(path, default_prefix);
    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(rotation_dir)
    {
        Ok(appender) => tracing_appender::non_blocking(appender),
        Err(err) => {
            eprintln!(
                "failed to create rolling file appender at {}: {err}; falling back to stdout",
                rotation_dir.display()
            );
            tracing_appender::non_blocking(std::io::stdout())
        }
    }
}

/// initiate the global tracing subscriber
///
/// Human-readable events go to stderr (or to the rolling file named by
/// [`LOG_PATH_ENV_VAR`]). Events on the [`METRICS_TARGET`] target are routed
/// only to `metrics_file` when one is given. The returned guards flush the
/// non-blocking writers and must be held for the lifetime of the process.
pub fn init<P: AsRef<Path>>(metrics_file: Option<P>) -> Vec<WorkerGuard> {
    let mut guards = Vec::new();
    let mut layers: Vec<BoxedLayer> = Vec::new();

    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();
    let not_metrics = filter::filter_fn(|metadata| metadata.target() != METRICS_TARGET);

    match env::var(LOG_PATH_ENV_VAR).ok() {
        Some(log_path) => {
            let (writer, guard) = rolling_writer(Path::new(&log_path), DEFAULT_LOG_PREFIX);
            guards.push(guard);
            layers.push(
                layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .with_filter(env_filter.and(not_metrics))
                    .boxed(),
            );
        }
        None => {
            layers.push(
                layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_filter(env_filter.and(not_metrics))
                    .boxed(),
            );
        }
    }

    if let Some(metrics_file) = metrics_file {
        let (writer, guard) = rolling_writer(metrics_file.as_ref(), DEFAULT_METRICS_PREFIX);
        guards.push(guard);
        layers.push(
            layer()
                .event_format(RawLineFormatter)
                .fmt_fields(format::DefaultFields::new())
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter::filter_fn(|metadata| {
                    metadata.target() == METRICS_TARGET
                }))
                .boxed(),
        );
    }

    registry().with(layers).init();
    guards
}
