// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Procfile parsing.
//!
//! A Procfile is a text blob of `name: command` lines. Lines without a
//! colon are skipped; duplicate names take the last value.

use std::collections::BTreeMap;

/// Parse Procfile bytes into a process-type map.
///
/// The command is whitespace-trimmed; the name is taken verbatim.
/// Invalid UTF-8 lines are skipped along with the malformed ones.
pub fn parse(bytes: &[u8]) -> BTreeMap<String, String> {
    let mut types = BTreeMap::new();
    for line in bytes.split(|&b| b == b'\n') {
        let Ok(line) = std::str::from_utf8(line) else {
            continue;
        };
        if let Some((name, command)) = line.split_once(':') {
            types.insert(name.to_string(), command.trim().to_string());
        }
    }
    types
}
