//! provides logging helpers

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// initiate the global tracing subscriber
///
/// Events go to stderr through a non-blocking writer so that a slow log sink
/// never stalls a watch loop. Keep the returned guard alive until exit, dropping
/// it flushes whatever is still buffered.
pub fn init() -> WorkerGuard {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    let fmt_layer = layer()
        .with_writer(writer)
        .with_target(true)
        .with_filter(env_filter);

    registry().with(fmt_layer).init();
    guard
}
