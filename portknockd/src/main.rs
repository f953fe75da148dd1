// -*- coding: utf-8 -*-
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

#![forbid(unsafe_code)]

#[cfg(not(any(target_os = "linux", target_os = "android")))]
std::compile_error!("portknockd does not support non-Linux platforms.");

mod dispatch;
mod engine;
mod expiry;
mod firewall;
mod logging;

use crate::{
    dispatch::capture_loop,
    engine::KnockEngine,
    expiry::ExpiryQueue,
    firewall::nftables::NftFirewall,
    logging::init_logging,
};
use anyhow::{self as ah, format_err as err, Context as _};
use clap::Parser;
use portknock_conf::Config;
use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    runtime,
    signal::unix::{signal, SignalKind},
    sync::Mutex,
    task, time,
};
use tracing::{info, warn};

/// Interval of the grant expiry maintenance task.
const EXPIRY_MAINTAIN_PERIOD: Duration = Duration::from_millis(1000);

/// The engine type used by the daemon.
pub type Engine = KnockEngine<NftFirewall>;

#[derive(Parser, Debug, Clone)]
struct Opts {
    /// Override the default path to the configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level filter (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path of the append-only log file.
    #[arg(long, default_value = "/var/log/portknock/app.log")]
    log_file: PathBuf,
}

impl Opts {
    pub fn get_config(&self) -> PathBuf {
        if let Some(config) = &self.config {
            config.clone()
        } else {
            Config::default_path()
        }
    }
}

async fn async_main(opts: Arc<Opts>) -> ah::Result<()> {
    // Bootstrap and load the configuration file.
    let conf_path = opts.get_config();
    Config::ensure_exists(&conf_path)?;
    let conf = Config::load(&conf_path).context("Configuration file")?;
    info!(
        "Loaded {} service(s) from {}",
        conf.services.len(),
        conf_path.display()
    );

    // Initialize access to the firewall.
    let fw = Arc::new(Mutex::new(NftFirewall::new().await?));

    let expiry = Arc::new(ExpiryQueue::new());

    // Set up chains, block rules, whitelists and the state engine of
    // every service, grouped by capture interface.
    let mut by_interface: HashMap<String, Vec<Arc<Engine>>> = HashMap::new();
    for service in &conf.services {
        let chain = {
            let mut fw_locked = fw.lock().await;
            let chain = fw_locked.create_allow_chain(&service.name, service.allow_port)?;
            fw_locked.add_block(&service.name, service.allow_port)?;
            chain
        };
        let engine = Arc::new(KnockEngine::new(
            service.clone(),
            chain,
            Arc::clone(&fw),
            Arc::clone(&expiry),
        ));
        engine.grant_whitelist().await;
        info!(
            "Service '{}' on {}: knock sequence {:?}, protected port {}",
            service.name, service.interface, service.knock_ports, service.allow_port
        );
        by_interface
            .entry(service.interface.clone())
            .or_default()
            .push(engine);
    }

    // Task: Grant expiry maintenance.
    task::spawn({
        let fw = Arc::clone(&fw);
        let expiry = Arc::clone(&expiry);

        async move {
            let mut interval = time::interval(EXPIRY_MAINTAIN_PERIOD);
            loop {
                interval.tick().await;
                expiry.maintain(&fw).await;
            }
        }
    });

    // Task per interface: blocking capture loop.
    // A failing capture only takes down its own interface.
    let handle = runtime::Handle::current();
    for (interface, engines) in by_interface {
        let handle = handle.clone();
        task::spawn_blocking(move || {
            if let Err(e) = capture_loop(&interface, engines, handle) {
                warn!("capture: {interface}: {e:#}; listener stopped");
            }
        });
    }

    // Register unix signal handlers.
    let mut sigterm = signal(SignalKind::terminate()).unwrap();
    let mut sigint = signal(SignalKind::interrupt()).unwrap();
    let mut sighup = signal(SignalKind::hangup()).unwrap();

    // Task: Main loop.
    //
    // No firewall cleanup on the way out: the last committed state
    // stays behind until the operator or a reboot clears it.
    let exitcode;
    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM: Terminating.");
                exitcode = Ok(());
                break;
            }
            _ = sigint.recv() => {
                exitcode = Err(err!("Interrupted by SIGINT."));
                break;
            }
            _ = sighup.recv() => {
                info!("SIGHUP: Reloading is not supported. Please restart portknockd instead.");
            }
        }
    }

    exitcode
}

fn main() -> ah::Result<()> {
    let opts = Arc::new(Opts::parse());

    init_logging(&opts.log_level, &opts.log_file)?;

    runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Tokio runtime builder")?
        .block_on(async_main(opts))
}

// vim: ts=4 sw=4 expandtab
