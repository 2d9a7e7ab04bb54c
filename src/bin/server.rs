//! ezvpn server: the public gateway. Accepts agent registrations over
//! (mutual-TLS) WebSockets and bridges tunneled streams to the SOCKS5
//! engine, which it can also run inline.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use ezvpn::server::registry::Registry;
use ezvpn::server::{Server, ServerTls};
use ezvpn::socks::{SocksAddr, SocksServer};

#[derive(Parser, Debug)]
#[command(name = "ezvpn-server", version, about = "ezvpn tunnel server")]
struct Args {
    /// Enable TLS between agent and server
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    tls: bool,

    /// Control address to listen on
    #[arg(long, default_value = "0.0.0.0:8443")]
    listen: String,

    /// Allowed-agents config file
    #[arg(long, default_value = "config/allowed-agents.yml")]
    config: PathBuf,

    /// Trusted CA file
    #[arg(long, default_value = "ca.pem")]
    ca: PathBuf,

    /// Server certificate file
    #[arg(long, default_value = "server.pem")]
    cert: PathBuf,

    /// Server key file
    #[arg(long, default_value = "server-key.pem")]
    key: PathBuf,

    /// Run the inline socks server
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    withsocks: bool,

    /// SOCKS endpoint: a unix socket path for the inline engine, or a tcp
    /// host:port for an external one
    #[arg(long, default_value = "socks.sock")]
    socksaddr: String,

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
            error!("server error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let registry = Arc::new(Registry::load(&args.config)?);
    Arc::clone(&registry).watch(args.config.clone(), cancel.child_token());

    let socks_address = SocksAddr::parse(&args.socksaddr);

    if args.withsocks {
        let socks = SocksServer::new(socks_address.clone());
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = socks.run(cancel).await {
                warn!("socks server error: {e}");
            }
        });
    }

    let tls = args.tls.then(|| ServerTls {
        ca_file: args.ca,
        cert_file: args.cert,
        key_file: args.key,
    });

    let server = Server::new(args.listen, tls, socks_address, registry);
    server.run(cancel).await.map_err(Into::into)
}
