// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the push pipeline.
//!
//! Only errors that occur before the streaming response starts live
//! here; once the log stream is open, failures are reported as
//! plain-text lines on it instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use slugforge_platform::PlatformError;

/// Failures before the build log stream is committed.
#[derive(Debug, Error)]
pub enum PushError {
    /// Missing or unparseable Basic credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Request body exceeds the configured cap.
    #[error("too big")]
    TooLarge,

    /// The platform refused or failed to allocate a worker.
    #[error("allocation failed: {0}")]
    Allocation(#[source] PlatformError),

    /// The attach channel to the worker could not be established.
    #[error("attach failed: {0}")]
    Attach(#[source] PlatformError),

    /// Writing the bootstrap script to the worker failed.
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[source] std::io::Error),

    /// Spooling the client tarball failed.
    #[error("spool failed: {0}")]
    Spool(#[source] std::io::Error),
}

impl IntoResponse for PushError {
    fn into_response(self) -> Response {
        match self {
            PushError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "unauthorized\n").into_response()
            }
            PushError::TooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, "too big\n").into_response()
            }
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("internal error\n{other}\n"),
            )
                .into_response(),
        }
    }
}
