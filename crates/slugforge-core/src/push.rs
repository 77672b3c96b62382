// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The push entry point.
//!
//! Everything up to the first byte of the build log happens here:
//! authentication, the size cap, worker allocation, the attach dial,
//! waiter registration and the bootstrap/spool overlap. Once those
//! succeed the handler commits a streaming 200 and hands off to
//! [`crate::build::run`], after which failures are reported on the
//! stream instead of as HTTP statuses.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{info, instrument};

use crate::build::{self, AttachDrain, BuildContext, LogSink};
use crate::error::PushError;
use crate::server::{AppState, basic_auth_password};
use crate::{bootstrap, rendezvous};
use slugforge_platform::dial_attach;

/// Placeholder command for the attached worker; the bootstrap script
/// typed into its stdin does the real work.
const WORKER_COMMAND: &str = "/bin/bash # app build";

/// `POST /push/{app}`.
#[instrument(skip(state, headers, body), fields(app = %app))]
pub async fn handle_push(
    State(state): State<AppState>,
    Path(app): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, PushError> {
    let key = basic_auth_password(&headers).ok_or(PushError::Unauthorized)?;

    if let Some(length) = content_length(&headers)
        && length > state.config.max_tar_size
    {
        return Err(PushError::TooLarge);
    }

    let worker = state
        .platform
        .create_worker(&key, &app, WORKER_COMMAND)
        .await
        .map_err(PushError::Allocation)?;
    info!(worker = %worker.name, "worker allocated");

    let attach = dial_attach(&worker.attach_url, state.config.attach_insecure_tls)
        .await
        .map_err(PushError::Attach)?;

    let waiter = state.matcher.register(rendezvous::waiter_token());
    let script = bootstrap::render(
        &state.config.public_url,
        state.agent.digest_hex(),
        waiter.id(),
    );

    // Type the bootstrap into the worker while the client tarball
    // spools to disk; both must finish before the log stream starts.
    let inject = bootstrap::inject(attach, &script);
    let spool = spool_body(body, state.config.max_tar_size);
    let (attach, (source, source_size)) = match tokio::join!(inject, spool) {
        (_, Err(SpoolError::TooLarge)) => return Err(PushError::TooLarge),
        (_, Err(SpoolError::Io(e))) => return Err(PushError::Spool(e)),
        (Err(e), _) => return Err(PushError::Bootstrap(e)),
        (Ok(attach), Ok(spooled)) => (attach, spooled),
    };
    info!(waiter = %waiter.id(), source_size, "bootstrap sent, source spooled");

    let (log, body_stream) = LogSink::channel();
    let ctx = BuildContext {
        app,
        key,
        worker_name: worker.name,
        waiter,
        source,
        source_size,
        platform: state.platform.clone(),
        match_timeout: state.config.match_timeout,
        attach_drain: AttachDrain::spawn(attach),
    };
    tokio::spawn(build::run(ctx, log));

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body_stream),
    )
        .into_response())
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

#[derive(Debug)]
enum SpoolError {
    TooLarge,
    Io(std::io::Error),
}

/// Spool the request body into an unlinked temp file, enforcing the
/// size cap as bytes arrive. The file is rewound before returning.
async fn spool_body(body: Body, cap: u64) -> Result<(tokio::fs::File, u64), SpoolError> {
    let mut file =
        tokio::fs::File::from_std(tempfile::tempfile().map_err(SpoolError::Io)?);
    let mut total: u64 = 0;

    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| SpoolError::Io(std::io::Error::other(e)))?;
        total += chunk.len() as u64;
        if total > cap {
            return Err(SpoolError::TooLarge);
        }
        file.write_all(&chunk).await.map_err(SpoolError::Io)?;
    }
    file.flush().await.map_err(SpoolError::Io)?;
    file.rewind().await.map_err(SpoolError::Io)?;
    Ok((file, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spool_body_caps_chunked_input() {
        let body = Body::from(vec![0u8; 1000]);
        let result = spool_body(body, 999).await;
        assert!(matches!(result, Err(SpoolError::TooLarge)));
    }

    #[tokio::test]
    async fn spool_body_rewinds() {
        use tokio::io::AsyncReadExt;

        let body = Body::from(&b"tar bytes"[..]);
        let (mut file, size) = spool_body(body, 1024).await.unwrap();
        assert_eq!(size, 9);

        let mut contents = Vec::new();
        file.read_to_end(&mut contents).await.unwrap();
        assert_eq!(contents, b"tar bytes");
    }

    #[test]
    fn content_length_parses() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, "1234".parse().unwrap());
        assert_eq!(content_length(&headers), Some(1234));
        assert_eq!(content_length(&HeaderMap::new()), None);
    }
}
