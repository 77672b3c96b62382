// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The embedded agent binary and its digest.
//!
//! The bootstrap script running on a worker downloads `/builder` and
//! verifies its SHA-1 against the digest baked into the script, so a
//! truncated or tampered download never executes. Binary and digest
//! are read once at startup and immutable afterwards.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::info;

/// File name of the agent executable, as shipped next to the
/// controller binary or on `PATH`.
pub const AGENT_EXECUTABLE: &str = "slugforge-agent";

#[derive(Debug, Error)]
pub enum AgentBinaryError {
    #[error("agent binary `{AGENT_EXECUTABLE}` not found next to the controller or on PATH")]
    NotFound,

    #[error("failed to read agent binary {path}: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },
}

/// The agent executable held in memory for the process lifetime.
#[derive(Debug)]
pub struct AgentBinary {
    bytes: Bytes,
    digest_hex: String,
}

impl AgentBinary {
    /// Read the agent binary from `explicit` if given, otherwise from
    /// next to the current executable, otherwise from `PATH`.
    pub fn load(explicit: Option<&Path>) -> Result<Self, AgentBinaryError> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => locate().ok_or(AgentBinaryError::NotFound)?,
        };
        let bytes = std::fs::read(&path).map_err(|source| AgentBinaryError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;

        let digest = Sha1::digest(&bytes);
        let digest_hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();

        info!(path = %path.display(), size = bytes.len(), digest = %digest_hex, "agent binary loaded");
        Ok(Self {
            bytes: Bytes::from(bytes),
            digest_hex,
        })
    }

    /// The raw executable, cheap to clone.
    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    /// Lowercase hex SHA-1 of the executable.
    pub fn digest_hex(&self) -> &str {
        &self.digest_hex
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn locate() -> Option<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        let sibling = exe.with_file_name(AGENT_EXECUTABLE);
        if sibling.is_file() {
            return Some(sibling);
        }
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(AGENT_EXECUTABLE))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_computes_sha1() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"agent bytes").unwrap();
        file.flush().unwrap();

        let agent = AgentBinary::load(Some(file.path())).unwrap();
        assert_eq!(agent.bytes().as_ref(), b"agent bytes");
        // sha1("agent bytes")
        assert_eq!(agent.digest_hex(), "b429b7860c2fd8352cf7e35f0614a735d9287a06");
        assert_eq!(agent.digest_hex().len(), 40);
    }

    #[test]
    fn missing_explicit_path_is_unreadable() {
        let err = AgentBinary::load(Some(Path::new("/nonexistent/agent"))).unwrap_err();
        assert!(matches!(err, AgentBinaryError::Unreadable { .. }));
    }
}
