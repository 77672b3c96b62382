// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end push scenarios: controller + mock PaaS + scripted agent
//! over real sockets.

mod common;

use std::time::Duration;

use common::{AgentBehavior, Harness, TEST_AGENT_BYTES};

const MATCH_TIMEOUT: Duration = Duration::from_secs(5);

async fn push(
    harness: &Harness,
    body: Vec<u8>,
    key: Option<&str>,
) -> (reqwest::StatusCode, String) {
    let client = reqwest::Client::new();
    let mut req = client
        .post(format!("{}/push/myapp", harness.base_url))
        .body(body);
    if let Some(key) = key {
        req = req.basic_auth("", Some(key));
    }
    let resp = req.send().await.unwrap();
    let status = resp.status();
    let text = resp.text().await.unwrap();
    (status, text)
}

#[tokio::test]
async fn happy_path_builds_and_releases() {
    let slug = b"\x1f\x8b fake slug bytes".to_vec();
    let harness = Harness::start(
        AgentBehavior::Succeed {
            logs: vec!["read tarball\n", "compiling\n", "buildpack done\n"],
            slug: slug.clone(),
            procfile: b"web: ./run\n".to_vec(),
        },
        MATCH_TIMEOUT,
    )
    .await;

    let source = vec![0xa5u8; 1024];
    let (status, text) = push(&harness, source.clone(), Some("api-key")).await;

    assert_eq!(status, reqwest::StatusCode::OK);
    assert!(text.contains("started build worker run.9"), "log: {text}");
    assert!(text.contains("waiting for worker"));
    assert!(text.contains("connected"));
    assert!(text.contains("starting build"));
    assert!(text.contains("compiling\n"));
    assert!(text.contains("build ok"));
    assert!(text.contains(&format!("got slug {} bytes", slug.len())));
    assert!(text.contains("releasing"));
    let last = text.trim_end().lines().last().unwrap();
    assert_eq!(last, "done, release v7");

    // The bootstrap script is never echoed to the client.
    assert!(!text.contains("sha1sum"));
    assert!(!text.contains("/conn/"));

    let rec = harness.recorded.lock().unwrap();
    assert_eq!(rec.dyno_creates.len(), 1);
    assert_eq!(rec.dyno_creates[0]["attach"], true);
    assert_eq!(rec.agent_sources.len(), 1);
    assert_eq!(rec.agent_sources[0], source);
    assert_eq!(rec.slug_puts.len(), 1);
    assert_eq!(rec.slug_puts[0], slug);
    assert_eq!(rec.releases.len(), 1);
    assert_eq!(
        rec.releases[0]["process_types"],
        serde_json::json!({"web": "./run"})
    );
    assert_eq!(rec.releases[0]["slug_put_key"], "key-1");
}

#[tokio::test]
async fn bootstrap_script_carries_digest_and_token() {
    let harness = Harness::start(
        AgentBehavior::Succeed {
            logs: vec![],
            slug: b"s".to_vec(),
            procfile: Vec::new(),
        },
        MATCH_TIMEOUT,
    )
    .await;

    push(&harness, vec![1u8; 64], Some("k")).await;

    let rec = harness.recorded.lock().unwrap();
    assert_eq!(rec.bootstrap_scripts.len(), 1);
    let script = &rec.bootstrap_scripts[0];

    use sha1::{Digest, Sha1};
    let digest: String = Sha1::digest(TEST_AGENT_BYTES)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    assert!(script.contains("set -e"));
    assert!(script.contains(&digest), "script lacks agent digest");
    assert!(script.contains(&format!("{}/builder", harness.base_url)));
    assert!(script.contains(&format!("{}/conn/", harness.base_url)));
}

#[tokio::test]
async fn timeout_when_agent_never_dials() {
    let harness = Harness::start(AgentBehavior::Silent, Duration::from_millis(300)).await;

    let (status, text) = push(&harness, vec![1u8; 128], Some("k")).await;

    assert_eq!(status, reqwest::StatusCode::OK);
    assert!(text.contains("waiting for worker"));
    assert!(text.contains("timeout\n"), "log: {text}");
    assert!(!text.contains("connected"));

    // The waiter was cancelled; the matcher map is empty again.
    assert_eq!(harness.state.matcher.pending().await, 0);

    // Nothing was published.
    let rec = harness.recorded.lock().unwrap();
    assert!(rec.releases.is_empty());
    assert!(rec.slug_puts.is_empty());
}

#[tokio::test]
async fn failed_compile_reports_and_skips_release() {
    let harness = Harness::start(
        AgentBehavior::Fail {
            logs: vec!["boom\n"],
        },
        MATCH_TIMEOUT,
    )
    .await;

    let (status, text) = push(&harness, vec![2u8; 256], Some("k")).await;

    assert_eq!(status, reqwest::StatusCode::OK);
    let boom = text.find("boom").expect("compile output relayed");
    let failed = text.find("build failed").expect("failure reported");
    assert!(boom < failed, "output precedes verdict: {text}");

    let rec = harness.recorded.lock().unwrap();
    assert!(rec.releases.is_empty());
    assert!(rec.slug_puts.is_empty());
}

#[tokio::test]
async fn oversize_body_rejected_before_allocation() {
    let harness = Harness::start(AgentBehavior::Silent, MATCH_TIMEOUT).await;

    let (status, _text) = push(&harness, vec![0u8; 2_000_001], Some("k")).await;

    assert_eq!(status, reqwest::StatusCode::PAYLOAD_TOO_LARGE);
    assert!(harness.recorded.lock().unwrap().dyno_creates.is_empty());
}

#[tokio::test]
async fn missing_auth_rejected_before_allocation() {
    let harness = Harness::start(AgentBehavior::Silent, MATCH_TIMEOUT).await;

    let (status, _text) = push(&harness, vec![0u8; 16], None).await;

    assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED);
    assert!(harness.recorded.lock().unwrap().dyno_creates.is_empty());
}

#[tokio::test]
async fn builder_route_serves_agent_binary() {
    let harness = Harness::start(AgentBehavior::Silent, MATCH_TIMEOUT).await;

    let resp = reqwest::get(format!("{}/builder", harness.base_url))
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(
        resp.headers()["content-type"],
        "application/octet-stream"
    );
    assert_eq!(resp.bytes().await.unwrap().as_ref(), TEST_AGENT_BYTES);
}
