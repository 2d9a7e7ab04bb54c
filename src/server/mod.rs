//! Gateway runtime: the public side of a tunnel.
//!
//! One HTTPS endpoint, `GET /register/{key}`. A valid key (and, with TLS, an
//! approved client-certificate CN) upgrades to a WebSocket that carries the
//! server side of a mux session; every stream the agent opens is bridged to
//! the configured SOCKS5 endpoint.

pub mod registry;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as UpgradeRequest, Response as UpgradeResponse,
};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::mux::{MuxConfig, MuxSession, MuxStream};
use crate::server::registry::Registry;
use crate::socks::SocksAddr;
use crate::{relay, tls};
use crate::{NET_DIAL_TIMEOUT, TUNNEL_POOL_SIZE};

/// TLS material for the gateway listener.
#[derive(Debug, Clone)]
pub struct ServerTls {
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// The gateway.
pub struct Server {
    listen_address: String,
    tls: Option<ServerTls>,
    socks_address: SocksAddr,
    registry: Arc<Registry>,
    pool: Arc<Semaphore>,
}

impl Server {
    pub fn new(
        listen_address: impl Into<String>,
        tls: Option<ServerTls>,
        socks_address: SocksAddr,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            listen_address: listen_address.into(),
            tls,
            socks_address,
            registry,
            pool: Arc::new(Semaphore::new(TUNNEL_POOL_SIZE)),
        }
    }

    /// Accept tunnel connections until cancellation.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let acceptor = match &self.tls {
            Some(cfg) => {
                let config = tls::server_config(&cfg.ca_file, &cfg.cert_file, &cfg.key_file)?;
                Some(TlsAcceptor::from(Arc::new(config)))
            }
            None => None,
        };

        let listener = TcpListener::bind(&self.listen_address).await?;
        info!("ezvpn server is running on: {}", self.listen_address);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (conn, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept error: {e}");
                            continue;
                        }
                    };

                    let acceptor = acceptor.clone();
                    let registry = Arc::clone(&self.registry);
                    let socks_address = self.socks_address.clone();
                    let pool = Arc::clone(&self.pool);
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(conn, peer, acceptor, registry, socks_address, pool, cancel)
                                .await
                        {
                            debug!("connection from {peer} ended: {e}");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    conn: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    registry: Arc<Registry>,
    socks_address: SocksAddr,
    pool: Arc<Semaphore>,
    cancel: CancellationToken,
) -> Result<()> {
    match acceptor {
        Some(acceptor) => {
            let stream = acceptor
                .accept(conn)
                .await
                .map_err(|e| Error::tls(format!("tls accept from {peer} failed: {e}")))?;

            // The verifier already required a CA-signed client certificate;
            // a missing CN simply never matches any approved list.
            let peer_cn = {
                let (_, connection) = stream.get_ref();
                connection
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .and_then(tls::peer_common_name)
                    .unwrap_or_default()
            };
            serve_session(stream, peer, Some(peer_cn), registry, socks_address, pool, cancel).await
        }
        None => serve_session(conn, peer, None, registry, socks_address, pool, cancel).await,
    }
}

/// Route + authenticate the upgrade request, then run the mux session.
async fn serve_session<S>(
    stream: S,
    peer: SocketAddr,
    peer_cn: Option<String>,
    registry: Arc<Registry>,
    socks_address: SocksAddr,
    pool: Arc<Semaphore>,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut authorized = None;
    let mut rejected_key = String::new();

    let callback = |request: &UpgradeRequest, response: UpgradeResponse| {
        let Some(key) = request.uri().path().strip_prefix("/register/") else {
            return Err(not_found());
        };
        match registry.authorize(key, peer_cn.as_deref()) {
            Some(agent) => {
                authorized = Some(agent);
                Ok(response)
            }
            None => {
                rejected_key = key.to_string();
                Err(unauthorized(key))
            }
        }
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    let Some(agent) = authorized else {
        return Err(Error::Unauthorized(rejected_key));
    };
    info!("agent {}@{} registered", agent.name, peer);

    let session = MuxSession::server(ws, MuxConfig::default(), peer.to_string());
    let result = stream_loop(&session, &socks_address, &pool, &cancel).await;
    session.close(result.as_ref().err().map(|e| e.to_string()));
    result
}

/// Bridge each accepted stream to the SOCKS endpoint. Per-stream failures
/// are isolated; the session survives them.
async fn stream_loop(
    session: &MuxSession,
    socks_address: &SocksAddr,
    pool: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            stream = session.accept_stream() => stream?,
        };

        let Ok(permit) = Arc::clone(pool).acquire_owned().await else {
            continue;
        };
        let socks_address = socks_address.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            let _permit = permit;
            let id = stream.id();
            if let Err(e) = bridge(stream, &socks_address, cancel).await {
                warn!("stream {id}: {e}");
            }
        });
    }
}

/// Dial the SOCKS endpoint and pump one stream through it.
async fn bridge(stream: MuxStream, socks_address: &SocksAddr, cancel: CancellationToken) -> Result<()> {
    match socks_address {
        SocksAddr::Tcp(addr) => {
            let conn = time::timeout(NET_DIAL_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| Error::Timeout("dial socks server"))??;
            relay::pump(stream, conn, cancel).await
        }
        #[cfg(unix)]
        SocksAddr::Unix(path) => {
            let conn = time::timeout(NET_DIAL_TIMEOUT, tokio::net::UnixStream::connect(path))
                .await
                .map_err(|_| Error::Timeout("dial socks server"))??;
            relay::pump(stream, conn, cancel).await
        }
        #[cfg(not(unix))]
        SocksAddr::Unix(path) => Err(Error::config(format!(
            "unix socket dialing is not supported on this platform: {}",
            path.display()
        ))),
    }
}

fn unauthorized(key: &str) -> ErrorResponse {
    let body = serde_json::json!({
        "error": format!("failed to register: invalid auth key({key}) or cert CN"),
    })
    .to_string();
    let mut response = ErrorResponse::new(Some(body));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::server::registry::{AllowedAgent, AllowedAgents};
    use crate::socks::SocksServer;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite::Error as WsError;

    fn test_registry() -> Arc<Registry> {
        Arc::new(
            Registry::from_agents(AllowedAgents {
                agents: vec![AllowedAgent {
                    name: "a".into(),
                    auth_key: "k".into(),
                    approved_cns: vec!["-".into()],
                }],
            })
            .unwrap(),
        )
    }

    fn spawn_gateway(listen: &str, socks: SocksAddr, cancel: &CancellationToken) {
        let server = Server::new(listen, None, socks, test_registry());
        let cancel = cancel.child_token();
        tokio::spawn(async move { server.run(cancel).await });
    }

    fn test_agent(server: &str, local: &str) -> Agent {
        Agent {
            auth_key: "k".into(),
            server_address: server.into(),
            enable_tls: false,
            ca_file: "ca.pem".into(),
            cert_file: "agent.pem".into(),
            key_file: "agent-key.pem".into(),
            local_address: local.into(),
        }
    }

    async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn connect_retry(addr: &str) -> TcpStream {
        for _ in 0..100 {
            if let Ok(conn) = TcpStream::connect(addr).await {
                return conn;
            }
            time::sleep(Duration::from_millis(50)).await;
        }
        panic!("nothing came up on {addr}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_end_to_end_happy_path() {
        let cancel = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("s.sock");

        let socks = SocksServer::new(SocksAddr::Unix(sock_path.clone()));
        {
            let cancel = cancel.child_token();
            tokio::spawn(async move { socks.run(cancel).await });
        }

        spawn_gateway("127.0.0.1:18443", SocksAddr::Unix(sock_path), &cancel);

        let agent = test_agent("127.0.0.1:18443", "127.0.0.1:19000");
        {
            let cancel = cancel.child_token();
            tokio::spawn(async move { agent.start(cancel).await });
        }

        let echo = spawn_echo().await;
        let mut client = connect_retry("127.0.0.1:19000").await;

        // SOCKS5 greeting through the whole chain.
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        // CONNECT to the echo target.
        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&echo.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);

        // Bytes survive the full client → agent → gateway → socks → target
        // path in order.
        client.write_all(b"round trip").await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"round trip");

        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bad_auth_key_gets_401() {
        let cancel = CancellationToken::new();
        spawn_gateway("127.0.0.1:18444", SocksAddr::Tcp("127.0.0.1:1".into()), &cancel);

        // Let the listener come up.
        connect_retry("127.0.0.1:18444").await;

        let result =
            tokio_tungstenite::connect_async("ws://127.0.0.1:18444/register/wrong").await;
        match result {
            Err(WsError::Http(response)) => {
                assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
                let body = String::from_utf8(response.into_body().unwrap_or_default()).unwrap();
                assert!(body.contains("invalid auth key(wrong)"), "body: {body}");
            }
            other => panic!("expected http 401, got {other:?}"),
        }
        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unknown_path_gets_404() {
        let cancel = CancellationToken::new();
        spawn_gateway("127.0.0.1:18445", SocksAddr::Tcp("127.0.0.1:1".into()), &cancel);

        connect_retry("127.0.0.1:18445").await;

        let result = tokio_tungstenite::connect_async("ws://127.0.0.1:18445/metrics").await;
        match result {
            Err(WsError::Http(response)) => {
                assert_eq!(response.status(), StatusCode::NOT_FOUND);
            }
            other => panic!("expected http 404, got {other:?}"),
        }
        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancellation_stops_agent() {
        let cancel = CancellationToken::new();
        spawn_gateway("127.0.0.1:18446", SocksAddr::Tcp("127.0.0.1:1".into()), &cancel);

        let agent = test_agent("127.0.0.1:18446", "127.0.0.1:19001");
        let agent_cancel = cancel.child_token();
        let handle = tokio::spawn(async move { agent.start(agent_cancel).await });

        // Wait for the agent's local listener, then cancel everything.
        connect_retry("127.0.0.1:19001").await;
        cancel.cancel();

        let result = time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("agent did not stop within the cancel grace")
            .unwrap();
        assert!(matches!(result, Err(Error::Canceled)));
    }
}
