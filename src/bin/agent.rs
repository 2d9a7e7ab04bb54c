//! ezvpn agent: dials the gateway from inside the private network and
//! exposes a local port that tunnels to the remote SOCKS5 engine.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use ezvpn::agent::Agent;
use ezvpn::{Error, AGENT_CANCEL_WAIT};

#[derive(Parser, Debug)]
#[command(name = "ezvpn-agent", version, about = "ezvpn tunnel agent")]
struct Args {
    /// Authentication key
    #[arg(long, default_value = "xxx")]
    auth: String,

    /// Enable TLS between agent and server
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    tls: bool,

    /// Trusted CA file
    #[arg(long, default_value = "ca.pem")]
    ca: PathBuf,

    /// Agent certificate file
    #[arg(long, default_value = "agent.pem")]
    cert: PathBuf,

    /// Agent key file
    #[arg(long, default_value = "agent-key.pem")]
    key: PathBuf,

    /// Lock file guarding against a second instance
    #[arg(long, default_value = "agent.lock")]
    lock: PathBuf,

    /// Local listen address
    #[arg(long, default_value = "0.0.0.0:16116")]
    local: String,

    /// Server address
    #[arg(long, default_value = "127.0.0.1:8443")]
    server: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "debug")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .with_target(false)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            warn!("agent run error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    if another_instance_running(&args.lock) {
        bail!("another instance of the program is already running");
    }
    std::fs::write(&args.lock, std::process::id().to_string())
        .with_context(|| format!("error creating lock file {}", args.lock.display()))?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let agent = Agent {
        auth_key: args.auth,
        server_address: args.server,
        enable_tls: args.tls,
        ca_file: args.ca,
        cert_file: args.cert,
        key_file: args.key,
        local_address: args.local,
    };

    let result = agent.start(cancel).await;
    let _ = std::fs::remove_file(&args.lock);

    match result {
        Err(Error::Canceled) => {
            warn!("agent canceled, waiting for open tunnels to stop...");
            tokio::time::sleep(AGENT_CANCEL_WAIT).await;
            Ok(())
        }
        other => other.map_err(Into::into),
    }
}

/// True when the lock file names a PID that is still alive.
fn another_instance_running(lock: &Path) -> bool {
    let Ok(contents) = std::fs::read_to_string(lock) else {
        return false;
    };
    let Ok(pid) = contents.trim().parse::<i32>() else {
        return false;
    };
    process_alive(pid)
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    // Signal 0 probes for existence without touching the process.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    false
}
