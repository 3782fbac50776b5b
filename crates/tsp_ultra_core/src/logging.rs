use std::{
    fs::File,
    io::{self, Write},
    thread,
};

use env_logger::{Builder, Env, Target, fmt::Formatter};
use log::Record;

use crate::{
    Error, Result,
    options::{LogFormat, SolverOptions},
};

/// Extra directives, e.g. `TSP_ULTRA_LOG=tsp_ultra_core::algo::leaf=trace`.
pub const LOG_ENV: &str = "TSP_ULTRA_LOG";

#[derive(Clone, Copy)]
struct LineStyle {
    format: LogFormat,
    timestamp: bool,
}

impl LineStyle {
    fn write(self, buf: &mut Formatter, record: &Record<'_>) -> io::Result<()> {
        if self.timestamp {
            write!(buf, "{} ", buf.timestamp_millis())?;
        }
        let level = record.level().as_str();
        match self.format {
            LogFormat::Compact => writeln!(buf, "{level} {}", record.args()),
            LogFormat::Pretty => {
                // Leaf solves log from pool threads.
                let current = thread::current();
                writeln!(
                    buf,
                    "{level:<5} [{}] ({}) {}",
                    short_target(record.target()),
                    current.name().unwrap_or("main"),
                    record.args()
                )
            }
        }
    }
}

/// Installs the process-wide logger described by `options`. Directives in
/// [`LOG_ENV`] are applied on top of `--log-level`.
pub fn init_logger(options: &SolverOptions) -> Result<()> {
    let style = LineStyle {
        format: options.log_format,
        timestamp: options.log_timestamp,
    };

    let mut builder = Builder::new();
    builder
        .filter_level(options.log_level.to_filter())
        .parse_env(Env::new().filter(LOG_ENV))
        .write_style(env_logger::WriteStyle::Never)
        .format(move |buf, record| style.write(buf, record));

    match options.log_output_path() {
        Some(log_path) => {
            let log_file = File::create(log_path).map_err(|e| {
                Error::other(format!(
                    "failed to create log output file {}: {e}",
                    log_path.display()
                ))
            })?;
            builder.target(Target::Pipe(Box::new(log_file)));
        }
        None => {
            builder.target(Target::Stderr);
        }
    }

    builder
        .try_init()
        .map_err(|e| Error::other(format!("logger init failed: {e}")))
}

/// Drops the crate prefix from a module path target.
fn short_target(target: &str) -> &str {
    target
        .strip_prefix("tsp_ultra_core::")
        .unwrap_or(target)
}
