// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bootstrap script injected into a freshly allocated worker.
//!
//! The worker is started with a plain shell as its command; the
//! controller then types this script into its stdin over the attach
//! channel. The script downloads the agent binary from the
//! controller, verifies its SHA-1 against the digest rendered into
//! the script, and execs it with the call-back URL. The script is
//! never echoed to the pushing client.

use tokio::io::AsyncWriteExt;

use slugforge_platform::AttachStream;

/// Render the bootstrap script.
///
/// `public_url` is the controller base URL as reachable from the
/// worker; `digest_hex` is the SHA-1 of the agent binary served at
/// `/builder`; `token` is the waiter id the agent dials back with.
pub fn render(public_url: &str, digest_hex: &str, token: &str) -> String {
    format!(
        "\nset -e\n\
         curl -s -o/tmp/slugforge-agent {public_url}/builder\n\
         printf \"%s  %s\" {digest_hex} /tmp/slugforge-agent >/tmp/slugforge-agent.sha1\n\
         sha1sum --status -c /tmp/slugforge-agent.sha1\n\
         chmod +x /tmp/slugforge-agent\n\
         exec /tmp/slugforge-agent {public_url}/conn/{token}\n"
    )
}

/// Write the script to the worker's stdio and hand the stream back.
pub async fn inject(mut attach: AttachStream, script: &str) -> std::io::Result<AttachStream> {
    attach.write_all(script.as_bytes()).await?;
    attach.flush().await?;
    Ok(attach)
}
