// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Buildpack acquisition.
//!
//! `BUILDPACK_URL` is a git URL with an optional `#ref` fragment: the
//! fragment is stripped before cloning and checked out afterwards.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use url::Url;

use crate::error::BuildError;

/// A buildpack source: where to clone from and which ref to pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buildpack {
    pub clone_url: String,
    pub reference: Option<String>,
}

/// Read the buildpack location from `BUILDPACK_URL`.
pub fn from_env() -> Result<Buildpack, BuildError> {
    match std::env::var("BUILDPACK_URL") {
        Ok(raw) if !raw.is_empty() => Ok(parse(&raw)),
        _ => Err(BuildError::NoBuildpackUrl),
    }
}

/// Split an optional `#ref` fragment off a buildpack URL. URLs that
/// do not parse are passed to git untouched.
pub fn parse(raw: &str) -> Buildpack {
    if let Ok(url) = Url::parse(raw)
        && let Some(fragment) = url.fragment()
        && !fragment.is_empty()
    {
        let clone_url = raw[..raw.len() - fragment.len() - 1].to_string();
        return Buildpack {
            clone_url,
            reference: Some(fragment.to_string()),
        };
    }
    Buildpack {
        clone_url: raw.to_string(),
        reference: None,
    }
}

/// Clone the buildpack into `dir`. The ref checkout is separate so
/// the caller can announce it on the build channel first.
pub async fn clone_into(buildpack: &Buildpack, dir: &Path) -> Result<(), BuildError> {
    let status = Command::new("git")
        .arg("clone")
        .arg(&buildpack.clone_url)
        .arg(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if !status.success() {
        return Err(BuildError::BuildpackFetch);
    }
    Ok(())
}

/// Check out `reference` inside an already-cloned buildpack.
pub async fn checkout(dir: &Path, reference: &str) -> Result<(), BuildError> {
    let status = Command::new("git")
        .arg("checkout")
        .arg(reference)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if !status.success() {
        return Err(BuildError::BuildpackRef(reference.to_string()));
    }
    Ok(())
}
