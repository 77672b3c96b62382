// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the platform client.

use thiserror::Error;

/// Errors from PaaS calls, the blob store, or the attach channel.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PlatformError {
    /// Transport-level HTTP failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered outside the 2xx range.
    #[error("bad status: {status} for {path}")]
    BadStatus {
        status: reqwest::StatusCode,
        path: String,
    },

    /// The blob store refused the slug PUT.
    #[error("bad slug put status: {0}")]
    BadPutStatus(reqwest::StatusCode),

    /// An attach or signed URL did not parse.
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// TLS setup or handshake failure on the attach channel.
    #[error("attach tls error: {0}")]
    Tls(String),

    /// Raw socket failure on the attach channel.
    #[error("attach io error: {0}")]
    Io(#[from] std::io::Error),
}
