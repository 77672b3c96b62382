// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Call-back dial to the controller.
//!
//! The agent makes one HTTP request to its `/conn/{id}` URL and
//! upgrades the connection out of HTTP; the upgraded stream then
//! carries the framed build protocol.

use reqwest::StatusCode;
use reqwest::header::{CONNECTION, UPGRADE};
use thiserror::Error;
use tracing::debug;

/// Upgrade protocol token, matched by the controller.
pub const BUILD_PROTOCOL: &str = "slugforge-build";

#[derive(Debug, Error)]
pub enum DialError {
    #[error("dial failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("controller refused upgrade: {0}")]
    Refused(StatusCode),
}

/// Dial `connect_url` and return the raw build channel.
pub async fn connect(connect_url: &str) -> Result<reqwest::Upgraded, DialError> {
    debug!(url = %connect_url, "dialing controller");
    let resp = reqwest::Client::new()
        .get(connect_url)
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, BUILD_PROTOCOL)
        .send()
        .await?;

    if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(DialError::Refused(resp.status()));
    }
    Ok(resp.upgrade().await?)
}
