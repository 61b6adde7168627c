//! Logging setup: console and/or file sinks behind a level filter.

use anyhow::{bail, Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogConf, LogLevel};

fn level_filter(level: LogLevel) -> LevelFilter {
	match level {
		LogLevel::Debug => LevelFilter::DEBUG,
		LogLevel::Info => LevelFilter::INFO,
		LogLevel::Warning => LevelFilter::WARN,
		// tracing has no level above error
		LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
	}
}

/// Install the global subscriber. The returned guard (when file logging
/// is enabled) must be kept alive for the lifetime of the process.
pub fn init(conf: &LogConf) -> Result<Option<WorkerGuard>> {
	if conf.syslog {
		bail!("syslog output is not supported; set log.syslog to false");
	}

	let mut guard = None;

	let file_layer = match &conf.log_file {
		None => None,
		Some(path) => {
			let file = std::fs::OpenOptions::new()
				.create(true)
				.append(true)
				.open(path)
				.with_context(|| format!("unable to open log file {}", path.display()))?;
			let (writer, worker_guard) = tracing_appender::non_blocking(file);
			guard = Some(worker_guard);
			Some(fmt::layer().with_writer(writer).with_ansi(false).with_target(false))
		}
	};

	let console_layer = conf.console.then(|| fmt::layer().with_target(false));

	tracing_subscriber::registry()
		.with(level_filter(conf.filter))
		.with(console_layer)
		.with(file_layer)
		.try_init()
		.map_err(|e| anyhow::anyhow!("unable to install logger: {e}"))?;

	Ok(guard)
}
