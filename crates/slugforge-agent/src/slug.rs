// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Slug packaging.
//!
//! The built tree is packed into a gzipped tar whose entries are all
//! prefixed `./app`, carrying permission bits only — no ownership, no
//! timestamps. The archive is written to an unlinked temp file so its
//! size is known before it goes on the wire.

use std::io::{Seek, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;

/// Archive prefix every slug entry lives under.
const APP_PREFIX: &str = "./app";

/// Package `build_dir` into a gzipped slug tar; returns the rewound
/// archive and its size.
pub async fn package(build_dir: &Path) -> std::io::Result<(tokio::fs::File, u64)> {
    let build_dir = build_dir.to_path_buf();
    let file = tokio::task::spawn_blocking(move || package_blocking(&build_dir))
        .await
        .map_err(std::io::Error::other)??;
    let size = file.metadata()?.len();
    Ok((tokio::fs::File::from_std(file), size))
}

fn package_blocking(build_dir: &Path) -> std::io::Result<std::fs::File> {
    let file = tempfile::tempfile()?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    append_dir_entry(&mut builder, build_dir, Path::new(APP_PREFIX))?;
    append_tree(&mut builder, build_dir, Path::new(APP_PREFIX))?;

    let encoder = builder.into_inner()?;
    let mut file = encoder.finish()?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

fn append_tree<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    prefix: &Path,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        let name = prefix.join(entry.file_name());
        if metadata.is_dir() {
            append_dir_entry(builder, &entry.path(), &name)?;
            append_tree(builder, &entry.path(), &name)?;
        } else if metadata.is_file() {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(metadata.permissions().mode() & 0o777);
            header.set_size(metadata.len());
            builder.append_data(&mut header, &name, std::fs::File::open(entry.path())?)?;
        }
        // Sockets, fifos and dangling symlinks have no place in a slug.
    }
    Ok(())
}

fn append_dir_entry<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    name: &Path,
) -> std::io::Result<()> {
    let metadata = std::fs::metadata(dir)?;
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_mode(metadata.permissions().mode() & 0o777);
    header.set_size(0);
    builder.append_data(&mut header, name, std::io::empty())
}
