// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire types for the PaaS REST API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Response to an attached one-off worker allocation.
#[derive(Debug, Clone, Deserialize)]
pub struct AttachedWorker {
    /// Process name assigned by the platform (e.g. `run.1`).
    pub name: String,
    /// Rendezvous endpoint for the worker's stdio.
    pub attach_url: String,
}

/// A signed slot for uploading one slug.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseSlot {
    /// Signed blob-store URL to PUT the slug to.
    pub slug_put_url: String,
    /// Key identifying the uploaded blob in the release POST.
    pub slug_put_key: String,
}

/// Body of the release-finalizing POST.
///
/// The platform requires the fixed fields alongside the per-build
/// `slug_put_key` and `process_types`.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseRequest {
    pub slug_put_key: String,
    pub process_types: BTreeMap<String, String>,
    pub release_descr: String,
    pub head: String,
    pub addons: Vec<String>,
    pub language_pack: String,
    pub run_deploy_hooks: bool,
    pub slug_version: u32,
    pub stack: String,
}

impl ReleaseRequest {
    /// A release body with the platform's fixed fields filled in.
    pub fn new(slug_put_key: String, process_types: BTreeMap<String, String>) -> Self {
        Self {
            slug_put_key,
            process_types,
            release_descr: "slugforge build".to_string(),
            head: "HEAD".to_string(),
            addons: Vec::new(),
            language_pack: "unknown".to_string(),
            run_deploy_hooks: true,
            slug_version: 2,
            stack: "cedar".to_string(),
        }
    }
}

/// Response to the release POST.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedRelease {
    /// Human-readable release name (e.g. `v42`).
    pub release: String,
}
