// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address.
    pub listen_addr: SocketAddr,
    /// Platform API base URL, trailing slash stripped.
    pub api_url: String,
    /// Base URL workers use to reach this controller.
    pub public_url: String,
    /// Maximum accepted source tarball size in bytes.
    pub max_tar_size: u64,
    /// How long a push waits for its agent to call back.
    pub match_timeout: Duration,
    /// Explicit path to the agent binary, overriding discovery.
    pub agent_path: Option<PathBuf>,
    /// Skip certificate verification on the attach channel (test rigs).
    pub attach_insecure_tls: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `PORT`: HTTP listen port (default: 8000)
    /// - `HEROKU_API_URL`: platform API base URL (default: `https://api.heroku.com`)
    /// - `PUBLIC_URL`: controller base URL as seen from workers
    ///   (default: `http://<hostname>:<PORT>`)
    /// - `MAX_TAR_SIZE`: source tarball cap in bytes (default: 2000000)
    /// - `MATCH_TIMEOUT`: agent call-back timeout in seconds (default: 15)
    /// - `AGENT_PATH`: explicit agent binary path
    /// - `ATTACH_INSECURE_TLS`: skip attach-channel cert checks (default: false)
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "8000".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("PORT", "must be a valid port number"))?;

        let api_url = std::env::var("HEROKU_API_URL")
            .unwrap_or_else(|_| "https://api.heroku.com".to_string())
            .trim_end_matches('/')
            .to_string();

        let public_url = match std::env::var("PUBLIC_URL") {
            Ok(url) => url.trim_end_matches('/').to_string(),
            Err(_) => format!("http://{}:{}", local_hostname(), port),
        };

        let max_tar_size: u64 = std::env::var("MAX_TAR_SIZE")
            .unwrap_or_else(|_| "2000000".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("MAX_TAR_SIZE", "must be a byte count"))?;

        let match_timeout_secs: u64 = std::env::var("MATCH_TIMEOUT")
            .unwrap_or_else(|_| "15".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("MATCH_TIMEOUT", "must be a number of seconds"))?;

        let agent_path = std::env::var("AGENT_PATH").ok().map(PathBuf::from);

        let attach_insecure_tls = std::env::var("ATTACH_INSECURE_TLS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            api_url,
            public_url,
            max_tar_size,
            match_timeout: Duration::from_secs(match_timeout_secs),
            agent_path,
            attach_insecure_tls,
        })
    }
}

fn local_hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
