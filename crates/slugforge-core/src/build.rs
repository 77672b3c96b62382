// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Controller side of the build choreography.
//!
//! Once the push handler has committed its streaming response, one
//! spawned task per build runs the ordered exchange with the agent:
//!
//! 1. write the slug-destination URL (reserved, empty)
//! 2. write the source tarball
//! 3. read user log frames, relaying each to the client
//! 4. read the status frame
//! 5. on success: read the slug, then the Procfile
//!
//! then uploads the slug and finalizes the release. Every failure
//! after the stream starts is reported as a plain-text line; nothing
//! here can turn into an HTTP error anymore.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use futures::channel::mpsc;
use tokio::io::{AsyncRead, AsyncSeekExt};
use tracing::{debug, error, warn};

use crate::procfile;
use crate::rendezvous::{AgentStream, WaitError, Waiter};
use slugforge_platform::{AttachStream, PlatformClient, PlatformError, ReleaseRequest};
use slugforge_protocol::{
    BuildStatus, FrameType, copy_frame, read_file_frame, read_frame, write_frame,
};

/// Reserved protocol slot: the slug-destination URL the agent may one
/// day upload to directly. Always empty today.
const SLUG_URL_RESERVED: &[u8] = b"";

/// Everything one build needs after the response stream is committed.
pub struct BuildContext {
    pub app: String,
    pub key: String,
    pub worker_name: String,
    pub waiter: Waiter,
    pub source: tokio::fs::File,
    pub source_size: u64,
    pub platform: Arc<PlatformClient>,
    pub match_timeout: Duration,
    /// Keeps the worker's attach channel drained and alive for the
    /// duration of the build.
    pub attach_drain: AttachDrain,
}

/// Background task that drains the worker's attach output. Dropping
/// the guard aborts the task, which closes the attach channel.
pub struct AttachDrain(tokio::task::JoinHandle<()>);

impl AttachDrain {
    pub fn spawn(mut attach: AttachStream) -> Self {
        Self(tokio::spawn(async move {
            let _ = tokio::io::copy(&mut attach, &mut tokio::io::sink()).await;
        }))
    }
}

impl Drop for AttachDrain {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Sender half of the client's streaming response body. Each line is
/// flushed to the client as its own chunk.
pub struct LogSink {
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
}

/// The HTTP client went away; the build should wind down.
#[derive(Debug)]
pub struct ClientGone;

impl LogSink {
    pub fn channel() -> (Self, mpsc::Receiver<Result<Bytes, Infallible>>) {
        let (tx, rx) = mpsc::channel(32);
        (Self { tx }, rx)
    }

    /// Send one newline-terminated line.
    pub async fn line(&mut self, text: impl AsRef<str>) -> Result<(), ClientGone> {
        let mut line = text.as_ref().to_string();
        line.push('\n');
        self.chunk(Bytes::from(line)).await
    }

    /// Send raw bytes (agent log output is already line-framed).
    pub async fn chunk(&mut self, bytes: Bytes) -> Result<(), ClientGone> {
        self.tx.send(Ok(bytes)).await.map_err(|_| ClientGone)
    }
}

/// Run one build to completion, reporting progress on `log`.
pub async fn run(ctx: BuildContext, mut log: LogSink) {
    let worker = ctx.worker_name.clone();
    if let Err(ClientGone) = drive(ctx, &mut log).await {
        debug!(worker = %worker, "client disconnected, abandoning build");
    }
}

async fn drive(ctx: BuildContext, log: &mut LogSink) -> Result<(), ClientGone> {
    let BuildContext {
        app,
        key,
        worker_name,
        waiter,
        source,
        source_size,
        platform,
        match_timeout,
        attach_drain: _attach_drain,
    } = ctx;

    log.line(format!("started build worker {worker_name}")).await?;
    log.line("waiting for worker").await?;

    let conn = match waiter.wait(match_timeout).await {
        Ok(conn) => conn,
        Err(WaitError::Timeout) => {
            warn!(worker = %worker_name, "worker did not call back in time");
            log.line("timeout").await?;
            return Ok(());
        }
        Err(WaitError::Closed) => {
            error!("matcher unavailable");
            log.line("internal error").await?;
            return Ok(());
        }
    };
    log.line("connected").await?;

    let Some((slug, slug_size, procfile)) = exchange(conn, source, source_size, log).await?
    else {
        log.line("error").await?;
        return Ok(());
    };

    log.line(format!("got slug {slug_size} bytes")).await?;
    log.line("releasing").await?;
    match publish(&platform, &key, &app, slug, slug_size, &procfile).await {
        Ok(name) => log.line(format!("done, release {name}")).await?,
        Err(e) => log.line(format!("release err {e}")).await?,
    }
    Ok(())
}

/// The framed exchange with the agent. Returns `None` when the build
/// failed; the failure has already been written to `log`.
async fn exchange(
    mut conn: AgentStream,
    mut source: tokio::fs::File,
    source_size: u64,
    log: &mut LogSink,
) -> Result<Option<(tokio::fs::File, u64, Bytes)>, ClientGone> {
    if let Err(e) = write_frame(&mut conn, FrameType::File, SLUG_URL_RESERVED).await {
        error!("write slug url: {e}");
        log.line("could not write slug url").await?;
        log.line("internal error").await?;
        return Ok(None);
    }

    if let Err(e) = copy_frame(&mut conn, FrameType::File, &mut source, source_size).await {
        error!("send source: {e}");
        log.line("internal error").await?;
        return Ok(None);
    }

    let mut frame = match read_frame(&mut conn).await {
        Ok(frame) => frame,
        Err(e) => {
            error!("read frame: {e}");
            log.line("internal error").await?;
            return Ok(None);
        }
    };

    log.line("starting build").await?;
    while frame.frame_type == FrameType::User {
        log.chunk(frame.payload).await?;
        frame = match read_frame(&mut conn).await {
            Ok(frame) => frame,
            Err(e) => {
                error!("read frame: {e}");
                log.line("\ninternal error").await?;
                return Ok(None);
            }
        };
    }

    let status = match frame.status() {
        Ok(status) => status,
        Err(e) => {
            error!("expected status frame: {e}");
            log.line("\ninternal error").await?;
            return Ok(None);
        }
    };
    if status == BuildStatus::Failure {
        log.line("\nbuild failed").await?;
        return Ok(None);
    }
    log.line("build ok").await?;

    let (slug, slug_size) = {
        let mut slug_reader = match read_file_frame(&mut conn).await {
            Ok(reader) => reader,
            Err(e) => {
                error!("read slug: {e}");
                log.line("internal error").await?;
                return Ok(None);
            }
        };
        match spool(&mut slug_reader).await {
            Ok(spooled) => spooled,
            Err(e) => {
                error!("spool slug: {e}");
                log.line("internal error").await?;
                return Ok(None);
            }
        }
    };

    let procfile = match read_frame(&mut conn).await {
        Ok(frame) if frame.frame_type == FrameType::File => frame.payload,
        Ok(frame) => {
            error!("expected procfile file frame, got {:?}", frame.frame_type);
            log.line("internal error").await?;
            return Ok(None);
        }
        Err(e) => {
            error!("read procfile: {e}");
            log.line("internal error").await?;
            return Ok(None);
        }
    };

    Ok(Some((slug, slug_size, procfile)))
}

/// Upload the slug and finalize the release; returns the release name.
async fn publish(
    platform: &PlatformClient,
    key: &str,
    app: &str,
    slug: tokio::fs::File,
    slug_size: u64,
    procfile: &[u8],
) -> Result<String, PlatformError> {
    let slot = platform.release_slot(key, app).await?;
    platform.put_slug(&slot.slug_put_url, slug, slug_size).await?;
    let release = ReleaseRequest::new(slot.slug_put_key, procfile::parse(procfile));
    let created = platform.create_release(key, app, &release).await?;
    Ok(created.release)
}

/// Read all of `reader` into an unlinked temporary file, rewound and
/// ready for a length-prefixed send or upload.
pub async fn spool<R>(reader: &mut R) -> std::io::Result<(tokio::fs::File, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut file = tokio::fs::File::from_std(tempfile::tempfile()?);
    let size = tokio::io::copy(reader, &mut file).await?;
    file.rewind().await?;
    Ok((file, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn spool_round_trips_and_reports_size() {
        let data = vec![42u8; 4096];
        let (mut file, size) = spool(&mut data.as_slice()).await.unwrap();
        assert_eq!(size, 4096);

        let mut back = Vec::new();
        file.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn log_sink_lines_are_newline_terminated() {
        let (mut log, mut rx) = LogSink::channel();
        log.line("hello").await.unwrap();
        drop(log);

        use futures::StreamExt;
        let chunk = rx.next().await.unwrap().unwrap();
        assert_eq!(chunk.as_ref(), b"hello\n");
        assert!(rx.next().await.is_none());
    }
}
