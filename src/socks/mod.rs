//! Minimal SOCKS5 responder: NoAuth negotiation and CONNECT only.
//!
//! The listener is pluggable — a TCP bind when the engine runs standalone, a
//! Unix socket when it is embedded in the gateway process. Each accepted
//! connection walks `AwaitGreeting → AwaitRequest → Proxying → Closed`;
//! anything malformed gets the appropriate reply code and a closed
//! connection, without disturbing other sessions.

pub mod request;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::relay;
use crate::socks::request::{
    send_reply, AddrSpec, Request, CMD_CONNECT, NO_ACCEPTABLE_METHODS, NO_AUTH_REQUIRED,
    REPLY_ADDR_TYPE_NOT_SUPPORTED, REPLY_COMMAND_NOT_SUPPORTED, REPLY_HOST_UNREACHABLE,
    REPLY_SUCCESS, SOCKS5_VERSION,
};
use crate::{NET_DIAL_TIMEOUT, TUNNEL_POOL_SIZE};

/// Where the engine listens, and where the gateway dials it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksAddr {
    /// `host:port`
    Tcp(String),
    /// Local IPC socket path
    Unix(PathBuf),
}

impl SocksAddr {
    /// A value containing `:` is a TCP address, anything else a socket path.
    pub fn parse(s: &str) -> Self {
        if s.contains(':') {
            SocksAddr::Tcp(s.to_string())
        } else {
            SocksAddr::Unix(PathBuf::from(s))
        }
    }
}

impl fmt::Display for SocksAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksAddr::Tcp(addr) => write!(f, "{addr}"),
            SocksAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// The SOCKS5 engine.
pub struct SocksServer {
    listen: SocksAddr,
    pool: Arc<Semaphore>,
}

impl SocksServer {
    pub fn new(listen: SocksAddr) -> Self {
        Self { listen, pool: Arc::new(Semaphore::new(TUNNEL_POOL_SIZE)) }
    }

    /// Accept and serve connections until cancellation or a listener error.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        match &self.listen {
            SocksAddr::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await?;
                info!("socks server running on: {addr}");
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        accepted = listener.accept() => {
                            let (conn, peer) = accepted?;
                            let remote = Some(AddrSpec::from_socket_addr(peer));
                            self.spawn_service(conn, remote, &cancel).await;
                        }
                    }
                }
            }
            #[cfg(unix)]
            SocksAddr::Unix(path) => {
                // A previous run may have left the socket file behind.
                if path.exists() {
                    tokio::fs::remove_file(path).await?;
                }
                let listener = tokio::net::UnixListener::bind(path)?;
                info!("socks server running on: {}", path.display());
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        accepted = listener.accept() => {
                            let (conn, _) = accepted?;
                            self.spawn_service(conn, None, &cancel).await;
                        }
                    }
                }
            }
            #[cfg(not(unix))]
            SocksAddr::Unix(path) => Err(Error::config(format!(
                "unix socket listener is not supported on this platform: {}",
                path.display()
            ))),
        }
    }

    async fn spawn_service<S>(&self, conn: S, remote: Option<AddrSpec>, cancel: &CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Ok(permit) = Arc::clone(&self.pool).acquire_owned().await else {
            return;
        };
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            let _permit = permit;
            let peer = remote
                .as_ref()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "local".to_string());
            if let Err(e) = service(conn, remote, cancel).await {
                debug!("socks session from {peer} ended: {e}");
            }
        });
    }
}

/// Serve one client connection through the full state machine.
pub async fn service<S>(
    mut conn: S,
    remote: Option<AddrSpec>,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer = remote
        .as_ref()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "local".to_string());

    if let Err(e) = handle_auth(&mut conn).await {
        warn!("auth failed from {peer}: {e}");
        return Err(e);
    }

    let request = match Request::parse(&mut conn, remote).await {
        Ok(r) => r,
        Err(e) => {
            warn!("failed to parse request from {peer}: {e}");
            let _ = send_reply(&mut conn, REPLY_ADDR_TYPE_NOT_SUPPORTED, None).await;
            return Err(e);
        }
    };

    match request.command {
        CMD_CONNECT => handle_connect(conn, request, &peer, cancel).await,
        cmd => {
            send_reply(&mut conn, REPLY_COMMAND_NOT_SUPPORTED, None).await?;
            warn!("unsupported command {cmd:#04x} from {peer}, target: {}", request.dest);
            Err(Error::UnsupportedCommand(cmd))
        }
    }
}

/// Method negotiation. NoAuth is the only method on offer.
async fn handle_auth<S>(conn: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = conn
        .read_u8()
        .await
        .map_err(|e| Error::protocol(format!("failed to get version byte: {e}")))?;
    if version != SOCKS5_VERSION {
        return Err(Error::protocol(format!("unsupported socks version: {version:#04x}")));
    }

    let n_methods = conn
        .read_u8()
        .await
        .map_err(|e| Error::protocol(format!("failed to get nmethods byte: {e}")))?;

    let mut methods = vec![0u8; n_methods as usize];
    conn.read_exact(&mut methods)
        .await
        .map_err(|e| Error::protocol(format!("failed to get methods bytes: {e}")))?;

    if methods.contains(&NO_AUTH_REQUIRED) {
        conn.write_all(&[SOCKS5_VERSION, NO_AUTH_REQUIRED]).await?;
        Ok(())
    } else {
        conn.write_all(&[SOCKS5_VERSION, NO_ACCEPTABLE_METHODS]).await?;
        Err(Error::protocol("no acceptable methods"))
    }
}

/// CONNECT: dial the destination, report the bound address, start pumping.
async fn handle_connect<S>(
    mut conn: S,
    request: Request,
    peer: &str,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let target = match time::timeout(NET_DIAL_TIMEOUT, TcpStream::connect(request.dest.dial_addr()))
        .await
    {
        Ok(Ok(target)) => target,
        Ok(Err(e)) => {
            let _ = send_reply(&mut conn, REPLY_HOST_UNREACHABLE, None).await;
            warn!("target unreachable, client: {peer}, target: {}: {e}", request.dest);
            return Err(e.into());
        }
        Err(_) => {
            let _ = send_reply(&mut conn, REPLY_HOST_UNREACHABLE, None).await;
            warn!("target dial timed out, client: {peer}, target: {}", request.dest);
            return Err(Error::Timeout("connect to target"));
        }
    };

    let bound = AddrSpec::from_socket_addr(target.local_addr()?);
    send_reply(&mut conn, REPLY_SUCCESS, Some(&bound)).await?;

    debug!("proxying {peer} -> {}", request.dest);
    relay::pump(conn, target, cancel).await
}
