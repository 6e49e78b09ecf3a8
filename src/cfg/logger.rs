// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, io, path::PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt::time::ChronoUtc};

#[derive(Debug, Deserialize)]
struct LoggerConfig {
    logger: LogConfig,
}

/// Where log lines go.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Output {
    Stdout,
    Stderr,
    File,
}

#[derive(Debug, Deserialize)]
struct LogConfig {
    /// An `EnvFilter` directive string, e.g. `info` or `h1_client_rs=debug`.
    level: String,
    output: Output,
    #[serde(default)]
    is_show_line: bool,
    #[serde(default)]
    is_show_target: bool,
    /// Log file path; required when `output` is `file`.
    file: Option<PathBuf>,
}

/// Installs the process-wide JSON logger described by a YAML config and
/// returns the guard that flushes buffered lines on drop.
///
/// The engine logs per-chunk I/O at debug, connection lifecycle at info,
/// stalls and forced shutdowns at warn and failures at error; the `level`
/// directive decides how much of that reaches the writer.  The environment
/// (`RUST_LOG`) wins when the configured directive does not parse.
pub fn init_logger(config_path: &str) -> Result<WorkerGuard> {
    let raw = fs::read_to_string(config_path).with_context(|| {
        format!("failed to read logger config {config_path}")
    })?;
    let config: LoggerConfig = serde_yaml::from_str(&raw).with_context(|| {
        format!("failed to parse logger config {config_path}")
    })?;
    let config = config.logger;

    let (writer, guard) = match config.output {
        Output::Stdout => tracing_appender::non_blocking(io::stdout()),
        Output::Stderr => tracing_appender::non_blocking(io::stderr()),
        Output::File => {
            let path = config
                .file
                .as_ref()
                .context("logger.file is required for output=file")?;
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| {
                    format!("failed to open log file {path:?}")
                })?;
            tracing_appender::non_blocking(file)
        },
    };

    let filter = EnvFilter::try_new(&config.level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .context("failed to parse log level from config or env")?;

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_timer(ChronoUtc::rfc_3339())
        .with_ansi(false)
        .with_target(config.is_show_target)
        .with_line_number(config.is_show_line)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
        .context("failed to set the global default subscriber")?;

    Ok(guard)
}
