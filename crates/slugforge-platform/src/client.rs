// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! REST client for the PaaS API and the blob store.

use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument};

use crate::error::PlatformError;
use crate::types::{AttachedWorker, CreatedRelease, ReleaseRequest, ReleaseSlot};

const ACCEPT_HEADER: &str = "application/vnd.heroku+json; version=3";
const USER_AGENT: &str = "slugforge";

/// Client for the platform REST API.
///
/// Authentication is HTTP Basic with an empty user and the caller's
/// API key as the password; the key travels with each call rather than
/// with the client, since it belongs to the push request.
pub struct PlatformClient {
    http: reqwest::Client,
    api_url: String,
}

impl PlatformClient {
    /// Create a client against `api_url` (no trailing slash).
    pub fn new(api_url: impl Into<String>) -> Result<Self, PlatformError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.into(),
        })
    }

    /// Allocate an attached one-off worker running `command` on `app`.
    #[instrument(skip(self, key))]
    pub async fn create_worker(
        &self,
        key: &str,
        app: &str,
        command: &str,
    ) -> Result<AttachedWorker, PlatformError> {
        let path = format!("/apps/{app}/dynos");
        self.post_json(
            key,
            &path,
            &serde_json::json!({
                "command": command,
                "attach": true,
            }),
        )
        .await
    }

    /// Obtain a signed slug upload slot for `app`.
    #[instrument(skip(self, key))]
    pub async fn release_slot(&self, key: &str, app: &str) -> Result<ReleaseSlot, PlatformError> {
        let path = format!("/apps/{app}/releases/new");
        self.get_json(key, &path).await
    }

    /// Finalize a release on `app`.
    #[instrument(skip(self, key, release))]
    pub async fn create_release(
        &self,
        key: &str,
        app: &str,
        release: &ReleaseRequest,
    ) -> Result<CreatedRelease, PlatformError> {
        let path = format!("/apps/{app}/releases");
        self.post_json(key, &path, release).await
    }

    /// PUT the slug to its signed blob-store URL.
    ///
    /// The file's descriptor points at an unlinked temp file; the size
    /// is passed explicitly so the request carries a Content-Length
    /// rather than chunked encoding, which blob stores refuse.
    #[instrument(skip(self, slug))]
    pub async fn put_slug(
        &self,
        url: &str,
        slug: tokio::fs::File,
        size: u64,
    ) -> Result<(), PlatformError> {
        let body = reqwest::Body::wrap_stream(ReaderStream::new(slug));
        let resp = self
            .http
            .put(url)
            .header(CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PlatformError::BadPutStatus(status));
        }
        debug!(size, "slug uploaded");
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
        path: &str,
    ) -> Result<T, PlatformError> {
        let resp = self
            .http
            .get(format!("{}{}", self.api_url, path))
            .basic_auth("", Some(key))
            .header(ACCEPT, ACCEPT_HEADER)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await?;
        Self::decode(resp, path).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        key: &str,
        path: &str,
        body: &B,
    ) -> Result<T, PlatformError> {
        let resp = self
            .http
            .post(format!("{}{}", self.api_url, path))
            .basic_auth("", Some(key))
            .header(ACCEPT, ACCEPT_HEADER)
            .json(body)
            .send()
            .await?;
        Self::decode(resp, path).await
    }

    async fn decode<T: DeserializeOwned>(
        resp: reqwest::Response,
        path: &str,
    ) -> Result<T, PlatformError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(PlatformError::BadStatus {
                status,
                path: path.to_string(),
            });
        }
        Ok(resp.json().await?)
    }
}

impl std::fmt::Debug for PlatformClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformClient")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}
