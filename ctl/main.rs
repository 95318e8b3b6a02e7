#![forbid(unsafe_code)]

//! `tensorwatch-ctl`: local CLI companion for `tensorwatch`.
//!
//! Connects to the IPC socket and sends JSON commands to the server.

use std::io::{BufRead, BufReader, Write};

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

/// Environment variable holding the server's IPC auth token.
const AUTH_TOKEN_ENV: &str = "TENSORWATCH_IPC_TOKEN";

#[derive(Debug, Parser)]
#[command(
    name = "tensorwatch-ctl",
    about = "Local CLI for the tensorwatch debugger",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match server's `ipc_name` config).
    #[arg(long, default_value = "tensorwatch")]
    ipc_name: String,

    /// Shared-secret auth token; falls back to `TENSORWATCH_IPC_TOKEN`.
    #[arg(long)]
    auth_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List sessions.
    List,

    /// Show the status of a session.
    Status {
        /// Session ID.
        session: String,
    },

    /// Print the graph of one device.
    Graph {
        /// Session ID.
        session: String,
        /// Device ID.
        device: String,
    },

    /// Print one tensor record (or its statistics if evicted).
    Tensor {
        /// Session ID.
        session: String,
        /// Device-local node name.
        node: String,
        /// Training step.
        #[arg(long)]
        step: u64,
        /// Output slot.
        #[arg(long, default_value_t = 0)]
        output: u32,
        /// Device holding the node, when the name is ambiguous.
        #[arg(long)]
        device: Option<String>,
    },

    /// Compare a tensor of the paused step with its previous step.
    Compare {
        /// Session ID.
        session: String,
        /// Device-local node name.
        node: String,
        /// Training step.
        #[arg(long)]
        step: u64,
        /// Output slot.
        #[arg(long, default_value_t = 0)]
        output: u32,
        /// Device holding the node, when the name is ambiguous.
        #[arg(long)]
        device: Option<String>,
        /// Fraction of the largest difference treated as zero.
        #[arg(long, default_value_t = 0.0)]
        tolerance: f64,
    },

    /// List watchpoint hits.
    Hits {
        /// Session ID.
        session: String,
        /// Only hits of this step.
        #[arg(long)]
        step: Option<u64>,
    },

    /// Re-evaluate every watchpoint against the paused step.
    Recheck {
        /// Session ID.
        session: String,
    },

    /// Drop every recorded hit.
    ClearHits {
        /// Session ID.
        session: String,
    },

    /// Print the execution order of a step.
    History {
        /// Session ID.
        session: String,
        /// Training step.
        step: u64,
    },

    /// List registered watchpoints.
    Watchpoints {
        /// Session ID.
        session: String,
    },

    /// Resume a paused run.
    Continue {
        /// Session ID.
        session: String,
    },

    /// Pause a running process.
    Pause {
        /// Session ID.
        session: String,
    },

    /// Run to the node after `--node` (default: the last executed node).
    Step {
        /// Session ID.
        session: String,
        /// Reference node.
        #[arg(long)]
        node: Option<String>,
        /// Device of the reference node.
        #[arg(long)]
        device: Option<String>,
    },

    /// Register a watchpoint.
    Watch {
        /// Session ID.
        session: String,
        /// Node-name glob; repeat for several.
        #[arg(long = "pattern", required = true)]
        patterns: Vec<String>,
        /// Condition as JSON, e.g. `{"kind":"has_nan"}`.
        #[arg(long)]
        condition: String,
        /// Register disabled.
        #[arg(long)]
        disabled: bool,
    },

    /// Remove a watchpoint.
    Unwatch {
        /// Session ID.
        session: String,
        /// Watchpoint ID.
        id: u32,
    },

    /// Enable or disable a watchpoint.
    Toggle {
        /// Session ID.
        session: String,
        /// Watchpoint ID.
        id: u32,
        /// New state: `true` or `false`.
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },

    /// Ask the training process to stop.
    Terminate {
        /// Session ID.
        session: String,
    },

    /// Close a session and drop its caches.
    Close {
        /// Session ID.
        session: String,
    },
}

#[allow(clippy::too_many_lines)]
fn build_request(command: &Command) -> Result<serde_json::Value, String> {
    let request = match command {
        Command::List => serde_json::json!({ "command": "list" }),
        Command::Status { session } => {
            serde_json::json!({ "command": "status", "session": session })
        }
        Command::Graph { session, device } => {
            serde_json::json!({ "command": "graph", "session": session, "device": device })
        }
        Command::Tensor {
            session,
            node,
            step,
            output,
            device,
        } => serde_json::json!({
            "command": "tensor",
            "session": session,
            "node": node,
            "step": step,
            "output_index": output,
            "device": device,
        }),
        Command::Compare {
            session,
            node,
            step,
            output,
            device,
            tolerance,
        } => serde_json::json!({
            "command": "compare",
            "session": session,
            "node": node,
            "step": step,
            "output_index": output,
            "device": device,
            "tolerance": tolerance,
        }),
        Command::Recheck { session } => {
            serde_json::json!({ "command": "recheck", "session": session })
        }
        Command::Hits { session, step } => {
            serde_json::json!({ "command": "hits", "session": session, "step": step })
        }
        Command::ClearHits { session } => {
            serde_json::json!({ "command": "clear_hits", "session": session })
        }
        Command::History { session, step } => {
            serde_json::json!({ "command": "history", "session": session, "step": step })
        }
        Command::Watchpoints { session } => {
            serde_json::json!({ "command": "watchpoints", "session": session })
        }
        Command::Continue { session } => {
            serde_json::json!({ "command": "continue", "session": session })
        }
        Command::Pause { session } => {
            serde_json::json!({ "command": "pause", "session": session })
        }
        Command::Step {
            session,
            node,
            device,
        } => serde_json::json!({
            "command": "step",
            "session": session,
            "node": node,
            "device": device,
        }),
        Command::Watch {
            session,
            patterns,
            condition,
            disabled,
        } => {
            let condition: serde_json::Value = serde_json::from_str(condition)
                .map_err(|err| format!("--condition is not valid JSON: {err}"))?;
            serde_json::json!({
                "command": "watch",
                "session": session,
                "patterns": patterns,
                "condition": condition,
                "enabled": !disabled,
            })
        }
        Command::Unwatch { session, id } => {
            serde_json::json!({ "command": "unwatch", "session": session, "id": id })
        }
        Command::Toggle {
            session,
            id,
            enabled,
        } => serde_json::json!({
            "command": "toggle",
            "session": session,
            "id": id,
            "enabled": enabled,
        }),
        Command::Terminate { session } => {
            serde_json::json!({ "command": "terminate", "session": session })
        }
        Command::Close { session } => {
            serde_json::json!({ "command": "close", "session": session })
        }
    };
    Ok(request)
}

fn main() {
    let args = Cli::parse();

    let mut request_json = match build_request(&args.command) {
        Ok(request) => request,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(2);
        }
    };
    let auth_token = args
        .auth_token
        .clone()
        .or_else(|| std::env::var(AUTH_TOKEN_ENV).ok());
    if let Some(token) = auth_token {
        request_json["auth_token"] = serde_json::Value::String(token);
    }

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj
                    .get("ok")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if ok {
                    match obj.get("data") {
                        Some(serde_json::Value::Null) | None => println!("OK"),
                        Some(data) => {
                            println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                        }
                    }
                } else {
                    let error = obj.get("error");
                    let kind = error
                        .and_then(|e| e.get("kind"))
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("unknown");
                    let message = error
                        .and_then(|e| e.get("message"))
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("unknown error");
                    eprintln!("Error ({kind}): {message}");
                    std::process::exit(1);
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to server: {err}");
            eprintln!("Is tensorwatch running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: serde_json::Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
