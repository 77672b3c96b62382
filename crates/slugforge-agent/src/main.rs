// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Slugforge build agent binary.
//!
//! Invoked by the bootstrap script with a single argument: the
//! controller's `/conn/{id}` call-back URL. Exits 0 on a successful
//! build, 1 otherwise.

use std::os::fd::AsRawFd;
use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, error, warn};

use slugforge_agent::{build, dial};

/// Slugforge build agent
#[derive(Parser, Debug)]
struct Opt {
    /// Controller call-back URL (`http://<controller>/conn/<token>`)
    connect_url: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opt = Opt::parse();

    // The attach session that typed the bootstrap is not the build
    // channel. Ignore its hangup and point stdio at /dev/null so its
    // teardown cannot touch this process.
    ignore_sighup();
    if let Err(e) = detach_stdio() {
        warn!("could not detach stdio: {e}");
    }

    // The bootstrap loader is a one-shot payload; remove it.
    if let Ok(exe) = std::env::current_exe()
        && let Err(e) = std::fs::remove_file(&exe)
    {
        warn!(path = %exe.display(), "could not unlink agent binary: {e}");
    }

    let mut conn = match dial::connect(&opt.connect_url).await {
        Ok(conn) => conn,
        Err(e) => {
            // Nowhere to report this; the controller will time out.
            error!("failed to dial controller: {e}");
            return ExitCode::FAILURE;
        }
    };

    match build::run(&mut conn).await {
        Ok(()) => {
            debug!("build complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("build failed: {e}");
            build::report_failure(&mut conn, &e).await;
            ExitCode::FAILURE
        }
    }
}

/// Keep SIGHUP from killing the agent when the attach session closes.
fn ignore_sighup() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(mut hangups) => {
            tokio::spawn(async move {
                loop {
                    hangups.recv().await;
                    debug!("ignoring SIGHUP");
                }
            });
        }
        Err(e) => warn!("could not install SIGHUP handler: {e}"),
    }
}

/// Remap stdin/stdout/stderr to /dev/null.
fn detach_stdio() -> std::io::Result<()> {
    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for target in 0..=2 {
        nix::unistd::dup2(devnull.as_raw_fd(), target)?;
    }
    Ok(())
}
