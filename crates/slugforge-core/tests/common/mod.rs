// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared harness for controller end-to-end tests.
//!
//! Stands up the controller in-process together with a mock PaaS, a
//! mock attach endpoint (plain TCP) and a scripted agent that speaks
//! the real framed protocol over a real `/conn/{id}` upgrade dial.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use slugforge_core::agent_binary::AgentBinary;
use slugforge_core::server::AppState;
use slugforge_core::{Config, rendezvous, router};
use slugforge_platform::PlatformClient;
use slugforge_protocol::{
    BuildStatus, FrameType, copy_frame, read_file_frame, read_frame, write_frame, write_status,
    write_user,
};

/// How the scripted agent behaves once bootstrapped.
#[derive(Clone)]
pub enum AgentBehavior {
    /// Speak the whole protocol and finish successfully.
    Succeed {
        logs: Vec<&'static str>,
        slug: Vec<u8>,
        procfile: Vec<u8>,
    },
    /// Emit logs, then report a failed build.
    Fail { logs: Vec<&'static str> },
    /// Never dial back (worker bootstrap went nowhere).
    Silent,
}

/// Everything the mock collaborators observed.
#[derive(Default)]
pub struct Recorded {
    pub dyno_creates: Vec<serde_json::Value>,
    pub releases: Vec<serde_json::Value>,
    pub slug_puts: Vec<Vec<u8>>,
    pub agent_sources: Vec<Vec<u8>>,
    pub bootstrap_scripts: Vec<String>,
}

pub struct Harness {
    pub base_url: String,
    pub state: AppState,
    pub recorded: Arc<Mutex<Recorded>>,
    // Held for the harness lifetime; the controller reads it at startup.
    _agent_file: tempfile::NamedTempFile,
}

pub const TEST_AGENT_BYTES: &[u8] = b"#!/bin/sh\nexit 7\n";

impl Harness {
    pub async fn start(behavior: AgentBehavior, match_timeout: Duration) -> Self {
        let recorded = Arc::new(Mutex::new(Recorded::default()));

        // Controller listener first; its address feeds the config and
        // tells the scripted agent where to dial back.
        let controller_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", controller_listener.local_addr().unwrap());

        let attach_addr = spawn_attach_endpoint(behavior, base_url.clone(), recorded.clone()).await;
        let paas_url = spawn_mock_paas(attach_addr, recorded.clone()).await;

        let mut agent_file = tempfile::NamedTempFile::new().unwrap();
        agent_file.write_all(TEST_AGENT_BYTES).unwrap();
        agent_file.flush().unwrap();
        let agent = AgentBinary::load(Some(agent_file.path())).unwrap();

        let config = Config {
            listen_addr: controller_listener.local_addr().unwrap(),
            api_url: paas_url,
            public_url: base_url.clone(),
            max_tar_size: 2_000_000,
            match_timeout,
            agent_path: None,
            attach_insecure_tls: false,
        };

        let platform = Arc::new(PlatformClient::new(config.api_url.clone()).unwrap());
        let state = AppState {
            config: Arc::new(config),
            agent: Arc::new(agent),
            matcher: rendezvous::spawn(),
            platform,
        };

        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(controller_listener, app).await.unwrap();
        });

        Self {
            base_url,
            state,
            recorded,
            _agent_file: agent_file,
        }
    }
}

/// The attach endpoint: accepts the controller's rendezvous dial,
/// acknowledges, then consumes the bootstrap script. When the script
/// arrives it extracts the call-back token and launches the scripted
/// agent.
async fn spawn_attach_endpoint(
    behavior: AgentBehavior,
    controller_url: String,
    recorded: Arc<Mutex<Recorded>>,
) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let behavior = behavior.clone();
            let controller_url = controller_url.clone();
            let recorded = recorded.clone();
            tokio::spawn(async move {
                // Rendezvous handshake: secret line in, ack line out.
                if read_line(&mut sock).await.is_err() {
                    return;
                }
                let _ = sock.write_all(b"ok\n").await;

                // The bootstrap script follows on the same stream.
                let script = read_until_exec_line(&mut sock).await;
                let token = extract_token(&script);
                recorded.lock().unwrap().bootstrap_scripts.push(script);

                if let (Some(token), false) =
                    (token, matches!(behavior, AgentBehavior::Silent))
                {
                    let conn = dial_conn(&controller_url, &token).await;
                    run_agent(conn, behavior, recorded).await;
                }

                // Worker stdio stays open until the controller drops it.
                let _ = tokio::io::copy(&mut sock, &mut tokio::io::sink()).await;
            });
        }
    });

    addr
}

async fn read_line<S: AsyncRead + Unpin>(sock: &mut S) -> std::io::Result<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        sock.read_exact(&mut byte).await?;
        line.push(byte[0]);
        if byte[0] == b'\n' {
            return Ok(line);
        }
    }
}

/// Read script text until the `exec` line (the script's last line)
/// has fully arrived.
async fn read_until_exec_line<S: AsyncRead + Unpin>(sock: &mut S) -> String {
    let mut script = String::new();
    let mut buf = [0u8; 512];
    loop {
        let n = sock.read(&mut buf).await.unwrap();
        if n == 0 {
            return script;
        }
        script.push_str(&String::from_utf8_lossy(&buf[..n]));
        if let Some(idx) = script.find("exec ")
            && script[idx..].contains('\n')
        {
            return script;
        }
    }
}

fn extract_token(script: &str) -> Option<String> {
    let idx = script.find("/conn/")?;
    let token: String = script[idx + "/conn/".len()..]
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    (!token.is_empty()).then_some(token)
}

/// Dial the controller's `/conn/{id}` route with a real HTTP upgrade.
async fn dial_conn(controller_url: &str, token: &str) -> reqwest::Upgraded {
    let resp = reqwest::Client::new()
        .get(format!("{controller_url}/conn/{token}"))
        .header(reqwest::header::CONNECTION, "upgrade")
        .header(reqwest::header::UPGRADE, "slugforge-build")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::SWITCHING_PROTOCOLS);
    resp.upgrade().await.unwrap()
}

/// The agent side of the framed protocol, scripted.
async fn run_agent<S>(mut conn: S, behavior: AgentBehavior, recorded: Arc<Mutex<Recorded>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Slug-destination URL (reserved, empty today).
    let url_frame = read_frame(&mut conn).await.unwrap();
    assert_eq!(url_frame.frame_type, FrameType::File);

    // Source tarball.
    let mut source = Vec::new();
    read_file_frame(&mut conn)
        .await
        .unwrap()
        .read_to_end(&mut source)
        .await
        .unwrap();
    recorded.lock().unwrap().agent_sources.push(source);

    match behavior {
        AgentBehavior::Succeed {
            logs,
            slug,
            procfile,
        } => {
            for line in logs {
                write_user(&mut conn, line).await.unwrap();
            }
            write_status(&mut conn, BuildStatus::Success).await.unwrap();
            copy_frame(
                &mut conn,
                FrameType::File,
                &mut slug.as_slice(),
                slug.len() as u64,
            )
            .await
            .unwrap();
            write_frame(&mut conn, FrameType::File, &procfile)
                .await
                .unwrap();
        }
        AgentBehavior::Fail { logs } => {
            for line in logs {
                write_user(&mut conn, line).await.unwrap();
            }
            write_status(&mut conn, BuildStatus::Failure).await.unwrap();
        }
        AgentBehavior::Silent => unreachable!("silent agents never dial"),
    }

    // Wait for the controller to finish reading and close.
    let _ = tokio::io::copy(&mut conn, &mut tokio::io::sink()).await;
}

/// Mock PaaS: dyno allocation, release slot, release creation, and
/// the blob store's slug PUT.
async fn spawn_mock_paas(
    attach_addr: std::net::SocketAddr,
    recorded: Arc<Mutex<Recorded>>,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base = format!("http://{addr}");
    let put_base = base.clone();

    let app = Router::new()
        .route(
            "/apps/{app}/dynos",
            post(
                move |State(rec): State<Arc<Mutex<Recorded>>>,
                      Json(body): Json<serde_json::Value>| async move {
                    rec.lock().unwrap().dyno_creates.push(body);
                    Json(serde_json::json!({
                        "name": "run.9",
                        "attach_url": format!("tcp://{attach_addr}/attach-secret"),
                    }))
                },
            ),
        )
        .route(
            "/apps/{app}/releases/new",
            get(move || async move {
                Json(serde_json::json!({
                    "slug_put_url": format!("{put_base}/slug-put/key-1"),
                    "slug_put_key": "key-1",
                }))
            }),
        )
        .route(
            "/apps/{app}/releases",
            post(
                |State(rec): State<Arc<Mutex<Recorded>>>,
                 Path(_app): Path<String>,
                 Json(body): Json<serde_json::Value>| async move {
                    rec.lock().unwrap().releases.push(body);
                    Json(serde_json::json!({ "release": "v7" }))
                },
            ),
        )
        .route(
            "/slug-put/{key}",
            put(
                |State(rec): State<Arc<Mutex<Recorded>>>, body: axum::body::Bytes| async move {
                    rec.lock().unwrap().slug_puts.push(body.to_vec());
                    StatusCode::CREATED
                },
            ),
        )
        .with_state(recorded);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    base
}
