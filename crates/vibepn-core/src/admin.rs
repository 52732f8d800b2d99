//! Admin socket
//!
//! Local Unix-socket request/response server. Each connection carries one
//! JSON request `{"cmd": "..."}` and receives one JSON response
//! `{"status", "output", "error"}` under a 2-second deadline.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{info, warn};

use vibepn_net::{AnnouncedRoute, ControlMessage};

use crate::config::Config;
use crate::engine::Context;
use crate::error::CoreResult;

/// Per-connection deadline.
const ADMIN_TIMEOUT: Duration = Duration::from_secs(2);

/// An admin request.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandRequest {
    pub cmd: String,
}

/// An admin response.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn ok(output: Value) -> Self {
        Self {
            status: "ok".to_string(),
            output: Some(output),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            output: None,
            error: Some(message.into()),
        }
    }
}

/// Bind the admin socket (mode 0600, stale file removed) and serve
/// connections until the process exits.
pub fn spawn(ctx: Arc<Context>) -> CoreResult<tokio::task::JoinHandle<()>> {
    let path = ctx.admin_socket.clone();
    let _ = std::fs::remove_file(&path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = tokio::net::UnixListener::bind(&path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)) {
            warn!(error = %e, "failed to set admin socket permissions");
        }
    }
    info!(path = %path.display(), "admin socket listening");

    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(handle_connection(ctx.clone(), stream));
                }
                Err(e) => {
                    warn!(error = %e, "admin accept error");
                }
            }
        }
    }))
}

async fn handle_connection(ctx: Arc<Context>, mut stream: UnixStream) {
    let outcome = tokio::time::timeout(ADMIN_TIMEOUT, async {
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await?;

        let (response, shutdown) = match serde_json::from_slice::<CommandRequest>(&buf[..n]) {
            Ok(request) => {
                info!(cmd = %request.cmd, "admin command");
                handle_command(&ctx, &request.cmd).await
            }
            Err(e) => (CommandResponse::error(format!("malformed request: {e}")), false),
        };

        let mut data = serde_json::to_vec(&response).unwrap_or_default();
        data.push(b'\n');
        stream.write_all(&data).await?;
        Ok::<bool, std::io::Error>(shutdown)
    })
    .await;

    match outcome {
        Ok(Ok(true)) => {
            ctx.registry.disconnect_all().await;
            ctx.trigger_shutdown();
        }
        Ok(Ok(false)) => {}
        Ok(Err(e)) => warn!(error = %e, "admin connection error"),
        Err(_) => warn!("admin connection timed out"),
    }
}

/// Execute one admin command. The boolean asks the caller to shut the
/// process down after the response is written.
pub async fn handle_command(ctx: &Context, cmd: &str) -> (CommandResponse, bool) {
    match cmd {
        "status" => {
            let output = json!({
                "uptime": format_uptime(ctx.uptime()),
                "peers": ctx.liveness.list().len(),
                "routes": ctx.routes.all().len(),
            });
            (CommandResponse::ok(output), false)
        }

        "peers" => {
            let peers: Vec<Value> = ctx
                .liveness
                .list()
                .into_iter()
                .map(|p| {
                    json!({
                        "id": p.id.as_str(),
                        "last_seen": p.last_seen.to_rfc3339(),
                    })
                })
                .collect();
            (CommandResponse::ok(Value::Array(peers)), false)
        }

        "routes" => {
            let routes: Vec<Value> = ctx
                .routes
                .all()
                .into_iter()
                .map(|r| {
                    json!({
                        "network": r.network,
                        "prefix": r.prefix,
                        "peer": r.peer.as_str(),
                        "metric": r.metric,
                        "expires": r.expires_at.map(|t| t.to_rfc3339()),
                    })
                })
                .collect();
            (CommandResponse::ok(Value::Array(routes)), false)
        }

        "reload" => (reload(ctx).await, false),

        "goodbye" => (
            CommandResponse::ok(json!({ "message": "sent goodbye to all peers" })),
            true,
        ),

        other => {
            warn!(cmd = other, "unknown admin command");
            (CommandResponse::error(format!("unknown command: {other}")), false)
        }
    }
}

/// Re-read the configuration, replace the network snapshot, purge routes
/// attributed to this node, and re-announce every exported network to
/// every connected peer. Interfaces, the listener, and the peer set stay
/// untouched.
async fn reload(ctx: &Context) -> CommandResponse {
    let config = match Config::load(&ctx.config_path) {
        Ok(config) => config,
        Err(e) => return CommandResponse::error(format!("failed to reload config: {e}")),
    };
    if let Err(e) = config.validate() {
        return CommandResponse::error(e.to_string());
    }

    ctx.replace_networks(config.networks.clone());
    ctx.routes.remove_by_peer(ctx.identity.peer_id());

    for (network, net_config) in &config.networks {
        if !net_config.export {
            continue;
        }
        let message = ControlMessage::Announce {
            network: network.clone(),
            routes: vec![AnnouncedRoute {
                prefix: net_config.prefix.clone(),
                metric: 1,
            }],
        };
        for (peer, session) in ctx.registry.all() {
            if let Err(e) = session.send_control(&message).await {
                warn!(peer = %peer, network = %network, error = %e, "failed to re-announce route");
            }
        }
    }

    CommandResponse::ok(json!({
        "message": "config validated, reloaded, and routes re-announced"
    }))
}

fn format_uptime(uptime: Duration) -> String {
    humantime::format_duration(Duration::from_secs(uptime.as_secs())).to_string()
}
