//! VibePN admin client
//!
//! Talks to the daemon's admin socket: one JSON request, one JSON
//! response per connection.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Admin client for the VibePN daemon
#[derive(Parser)]
#[command(name = "vibepnctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Admin socket path
    #[arg(short, long, default_value = "/var/run/vibepn.sock")]
    socket: PathBuf,

    /// Output raw JSON instead of formatted text
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show uptime and peer/route counts
    Status,
    /// List live peers
    Peers,
    /// List learned routes
    Routes,
    /// Reload the daemon configuration and re-announce exported networks
    Reload,
    /// Disconnect every peer and stop the daemon
    Goodbye,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Status => "status",
            Command::Peers => "peers",
            Command::Routes => "routes",
            Command::Reload => "reload",
            Command::Goodbye => "goodbye",
        }
    }
}

#[derive(Serialize)]
struct CommandRequest<'a> {
    cmd: &'a str,
}

#[derive(Deserialize)]
struct CommandResponse {
    status: String,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cmd = cli.command.name();

    let mut stream = UnixStream::connect(&cli.socket)
        .await
        .with_context(|| format!("failed to connect to {}", cli.socket.display()))?;

    let request = serde_json::to_vec(&CommandRequest { cmd })?;
    stream.write_all(&request).await.context("failed to send request")?;

    let mut raw = Vec::new();
    stream
        .read_to_end(&mut raw)
        .await
        .context("failed to read response")?;

    let response: CommandResponse =
        serde_json::from_slice(&raw).context("failed to parse response")?;

    if response.status != "ok" {
        bail!(response.error.unwrap_or_else(|| "daemon reported an error".to_string()));
    }

    let output = response.output.unwrap_or(Value::Null);
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    print_output(cmd, &output);
    Ok(())
}

fn print_output(cmd: &str, output: &Value) {
    match cmd {
        "status" => {
            println!("Uptime: {}", field(output, "uptime"));
            println!("Peers:  {}", field(output, "peers"));
            println!("Routes: {}", field(output, "routes"));
        }
        "peers" => {
            for peer in output.as_array().into_iter().flatten() {
                println!(
                    "Peer: {} (last seen: {})",
                    field(peer, "id"),
                    field(peer, "last_seen")
                );
            }
        }
        "routes" => {
            for route in output.as_array().into_iter().flatten() {
                println!(
                    "Net: {:<10} Prefix: {:<18} Peer: {:<16} Metric: {} Expires: {}",
                    field(route, "network"),
                    field(route, "prefix"),
                    short_peer(route),
                    field(route, "metric"),
                    field(route, "expires"),
                );
            }
        }
        _ => {
            if let Some(message) = output.get("message").and_then(Value::as_str) {
                println!("{message}");
            } else {
                println!("OK");
            }
        }
    }
}

fn field(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "-".to_string(),
        Some(other) => other.to_string(),
    }
}

fn short_peer(route: &Value) -> String {
    let peer = field(route, "peer");
    peer.chars().take(16).collect()
}
