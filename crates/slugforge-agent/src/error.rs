// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the build agent.
//!
//! Display strings double as the user-facing failure lines written to
//! the build channel, so they are worded for the pushing developer,
//! not for a log file.

use thiserror::Error;

use slugforge_protocol::FrameError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuildError {
    /// `BUILDPACK_URL` is unset.
    #[error("no BUILDPACK_URL")]
    NoBuildpackUrl,

    /// `git clone` of the buildpack failed.
    #[error("failed to fetch buildpack")]
    BuildpackFetch,

    /// `git checkout` of the requested ref failed.
    #[error("failed to check out ref: {0}")]
    BuildpackRef(String),

    /// The buildpack's compile program exited non-zero.
    #[error("buildpack failed: exit status {0}")]
    CompileFailed(i32),

    /// `Procfile` was absent from the built tree.
    #[error("could not read Procfile")]
    MissingProcfile,

    /// The controller sent something out of order.
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    /// Local filesystem or subprocess failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// Whether the failure line should be prefixed with the generic
    /// `internal error` wording rather than shown as-is.
    pub fn is_internal(&self) -> bool {
        matches!(self, BuildError::Protocol(_) | BuildError::Io(_))
    }
}
