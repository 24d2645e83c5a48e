pub mod packets;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs the global subscriber: compact stderr output, plus daily rotated
/// `<app>.log` files under `log_dir` when given. Keep the guard alive until exit.
pub fn init_tracing(
    app: &str,
    default_directives: &[&str],
    log_dir: Option<&Path>,
) -> Option<WorkerGuard> {
    let mut filter = EnvFilter::from_default_env();
    for directive in default_directives {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("ignoring log directive {directive}: {e}"),
        }
    }

    let stderr = fmt::layer().compact().with_writer(std::io::stderr);
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, format!("{app}.log"));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
