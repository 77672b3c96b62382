// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The agent side of the build choreography.
//!
//! Mirror image of the controller's exchange:
//!
//! 1. read the slug-destination URL (reserved slot, ignored)
//! 2. read the source tarball
//! 3. write user messages while extracting, fetching the buildpack
//!    and compiling
//! 4. write the status
//! 5. on success: write the slug, then the Procfile
//!
//! then drain the connection until the controller closes it, so the
//! process never exits while the peer is still reading.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::Command;
use tracing::{debug, info};

use crate::buildpack;
use crate::error::BuildError;
use crate::slug;
use slugforge_protocol::{
    BuildStatus, FrameError, FrameType, LineFramer, copy_frame, read_file_frame, read_frame,
    write_frame, write_status, write_user,
};

pub const BUILD_DIR: &str = "/tmp/build";
pub const CACHE_DIR: &str = "/tmp/cache";
pub const BUILDPACK_DIR: &str = "/tmp/bp";

/// Run the whole agent choreography over `conn`.
///
/// On error the caller reports the failure on the same connection;
/// contextual user messages have already been written by then.
pub async fn run<C>(conn: &mut C) -> Result<(), BuildError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    // Slug-destination URL: a reserved slot, retained for forward
    // compatibility and ignored.
    let url_frame = read_frame(conn).await?;
    if url_frame.frame_type != FrameType::File {
        return Err(BuildError::Protocol(FrameError::UnexpectedType(
            url_frame.frame_type,
        )));
    }

    let source = {
        let mut reader = read_file_frame(conn).await?;
        spool(&mut reader).await?
    };
    write_user(conn, "read tarball\n").await?;

    extract(source, Path::new(BUILD_DIR)).await?;
    write_user(conn, "extracted\n").await?;

    tokio::fs::create_dir_all(CACHE_DIR).await?;

    let buildpack = buildpack::from_env()?;
    write_user(conn, "fetching buildpack\n").await?;
    write_user(conn, &format!("{}\n", buildpack.clone_url)).await?;
    buildpack::clone_into(&buildpack, Path::new(BUILDPACK_DIR)).await?;
    if let Some(reference) = &buildpack.reference {
        write_user(conn, &format!("git checkout {reference}\n")).await?;
        buildpack::checkout(Path::new(BUILDPACK_DIR), reference).await?;
    }

    // A pushed tree sometimes carries its own repository; the slug
    // must not.
    remove_git_dir(Path::new(BUILD_DIR)).await?;

    write_user(conn, "compiling\n").await?;
    compile(conn).await?;
    write_user(conn, "buildpack done\n").await?;

    write_user(conn, "entar\n").await?;
    let (mut slug_file, slug_size) = slug::package(Path::new(BUILD_DIR)).await?;
    write_user(conn, "slug built\n").await?;
    write_user(conn, &format!("slug {slug_size} bytes\n")).await?;

    // The Procfile must exist before success is announced; an empty
    // one is fine.
    let procfile = tokio::fs::read(format!("{BUILD_DIR}/Procfile"))
        .await
        .map_err(|_| BuildError::MissingProcfile)?;

    info!(slug_size, "build succeeded, shipping slug");
    write_status(conn, BuildStatus::Success).await?;
    copy_frame(conn, FrameType::File, &mut slug_file, slug_size).await?;
    write_frame(conn, FrameType::File, &procfile).await?;

    drain(conn).await;
    Ok(())
}

/// Report a failed build on the channel, then wait for the peer to
/// hang up. Best-effort: the connection may already be gone.
pub async fn report_failure<C>(conn: &mut C, err: &BuildError)
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    if err.is_internal() {
        let _ = write_user(conn, &format!("{err}\n")).await;
        let _ = write_user(conn, "internal error\n").await;
    } else {
        let _ = write_user(conn, &format!("{err}\n")).await;
    }
    let _ = write_status(conn, BuildStatus::Failure).await;
    drain(conn).await;
}

/// Consume the connection until the controller closes it.
async fn drain<C>(conn: &mut C)
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let _ = tokio::io::copy(conn, &mut tokio::io::sink()).await;
}

/// Read all of `reader` into an unlinked temporary file, rewound.
async fn spool<R>(reader: &mut R) -> std::io::Result<tokio::fs::File>
where
    R: AsyncRead + Unpin,
{
    use tokio::io::AsyncSeekExt;

    let mut file = tokio::fs::File::from_std(tempfile::tempfile()?);
    tokio::io::copy(reader, &mut file).await?;
    file.rewind().await?;
    Ok(file)
}

/// Unpack the source tarball into `dir`.
async fn extract(source: tokio::fs::File, dir: &Path) -> Result<(), BuildError> {
    tokio::fs::create_dir_all(dir).await?;
    let std_file = source.into_std().await;
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut archive = tar::Archive::new(std_file);
        archive.unpack(dir)
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(())
}

async fn remove_git_dir(build_dir: &Path) -> Result<(), BuildError> {
    let git_dir = build_dir.join(".git");
    match tokio::fs::remove_dir_all(&git_dir).await {
        Ok(()) => {
            debug!(path = %git_dir.display(), "removed vendored .git");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Run `bin/compile <build> <cache>`, framing every line of its
/// merged stdout/stderr as a user message.
async fn compile<C>(conn: &mut C) -> Result<(), BuildError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let mut child = Command::new(format!("{BUILDPACK_DIR}/bin/compile"))
        .arg(BUILD_DIR)
        .arg(CACHE_DIR)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdout = child.stdout.take().ok_or_else(|| {
        BuildError::Io(std::io::Error::other("compile stdout not captured"))
    })?;
    let mut stderr = child.stderr.take().ok_or_else(|| {
        BuildError::Io(std::io::Error::other("compile stderr not captured"))
    })?;

    // One framer, one loop: both pipes merge into a single ordered
    // stream of line frames.
    let mut framer = LineFramer::new(&mut *conn, FrameType::User);
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];
    let mut out_done = false;
    let mut err_done = false;
    while !(out_done && err_done) {
        tokio::select! {
            read = stdout.read(&mut out_buf), if !out_done => {
                let n = read?;
                if n == 0 {
                    out_done = true;
                } else {
                    framer.write(&out_buf[..n]).await?;
                }
            }
            read = stderr.read(&mut err_buf), if !err_done => {
                let n = read?;
                if n == 0 {
                    err_done = true;
                } else {
                    framer.write(&err_buf[..n]).await?;
                }
            }
        }
    }
    framer.finish();

    let status = child.wait().await?;
    if !status.success() {
        return Err(BuildError::CompileFailed(status.code().unwrap_or(-1)));
    }
    Ok(())
}
