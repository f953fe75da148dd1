// -*- coding: utf-8 -*-
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{self as ah, Context as _};
use std::{
    fs::{create_dir_all, OpenOptions},
    path::Path,
    sync::Arc,
};
use tracing_subscriber::{fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

/// Initialize logging to stdout and the append-only log file.
///
/// Uses the `RUST_LOG` environment variable if set, otherwise the
/// given `level`. Must be called exactly once at startup.
pub fn init_logging(level: &str, log_file: &Path) -> ah::Result<()> {
    if let Some(dir) = log_file.parent() {
        create_dir_all(dir).context("Create log directory")?;
    }
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(log_file)
        .context("Open log file")?;

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).context("Parse log level")?,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Arc::new(file)),
        )
        .init();

    Ok(())
}

// vim: ts=4 sw=4 expandtab
