//! Agent runtime: the outbound side of a tunnel.
//!
//! The agent keeps exactly one live session to the gateway, re-establishing
//! it after recoverable failures, and carries every accepted local TCP
//! connection over a freshly-opened mux stream:
//!
//! ```text
//! (socks client) <--tcp--> Agent <--mux stream--> Gateway <---> socks server
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::mux::{MuxConfig, MuxSession};
use crate::{relay, tls};
use crate::{
    AGENT_HEADER_NAME, AGENT_HEADER_VALUE, AGENT_RETRY_INTERVAL, KEEP_ALIVE_INTERVAL,
    TUNNEL_POOL_SIZE, WS_HANDSHAKE_TIMEOUT,
};

/// Tunnels local socks streams to the gateway.
#[derive(Debug, Clone)]
pub struct Agent {
    pub auth_key: String,
    pub server_address: String,
    pub enable_tls: bool,
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub local_address: String,
}

impl Agent {
    /// Run the agent until cancellation (or until a register round succeeds
    /// terminally, which the caller surfaces).
    ///
    /// Every error except cancellation is recoverable: log it, wait the
    /// fixed retry interval, register again.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let tls_config = if self.enable_tls {
            Some(Arc::new(tls::client_config(
                &self.ca_file,
                &self.cert_file,
                &self.key_file,
            )?))
        } else {
            None
        };
        let pool = Arc::new(Semaphore::new(TUNNEL_POOL_SIZE));

        loop {
            let err = match self.register(tls_config.clone(), &pool, &cancel).await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_recoverable() => return Err(e),
                Err(e) => e,
            };
            warn!("agent error {err:?} - recovering...");

            // TODO: retry with exponential backoff instead of a fixed tick
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                _ = time::sleep(AGENT_RETRY_INTERVAL) => {}
            }
        }
    }

    /// One register round: dial the gateway, bind the local listener, run
    /// the session until it breaks.
    async fn register(
        &self,
        tls_config: Option<Arc<rustls::ClientConfig>>,
        pool: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let scheme = if self.enable_tls { "wss" } else { "ws" };
        let url = format!("{scheme}://{}/register/{}", self.server_address, self.auth_key);

        let mut request = url.into_client_request()?;
        request
            .headers_mut()
            .insert(AGENT_HEADER_NAME, HeaderValue::from_static(AGENT_HEADER_VALUE));

        let connector = tls_config.map(Connector::Rustls);
        let upgrade = connect_async_tls_with_config(request, None, false, connector);
        let (ws, _response) = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled),
            outcome = time::timeout(WS_HANDSHAKE_TIMEOUT, upgrade) => match outcome {
                Ok(Ok(pair)) => pair,
                Ok(Err(WsError::Http(response))) => {
                    warn!("handshake failed with status {}", response.status());
                    return Err(WsError::Http(response).into());
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(Error::Timeout("websocket handshake")),
            },
        };

        let listener = TcpListener::bind(&self.local_address).await?;
        info!("listening on: {}", self.local_address);

        let session = MuxSession::client(ws, MuxConfig::default(), self.server_address.clone());
        let result = self.supervise(&session, listener, pool, cancel).await;
        session.close(None);
        result
    }

    /// Two duties under one session: watch mux liveness, and accept local
    /// connections onto new streams. The first error from either duty ends
    /// the session; a stream-open failure for one connection does not.
    async fn supervise(
        &self,
        session: &MuxSession,
        listener: TcpListener,
        pool: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut health = time::interval(KEEP_ALIVE_INTERVAL);
        health.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                _ = health.tick() => {
                    if session.is_closed() {
                        return Err(Error::BrokenSession);
                    }
                }
                accepted = listener.accept() => {
                    let (conn, peer) = accepted?;
                    let stream = match session.open_stream().await {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!("error open a new stream: {e}");
                            continue;
                        }
                    };

                    let Ok(permit) = Arc::clone(pool).acquire_owned().await else {
                        continue;
                    };
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        let _permit = permit;
                        debug!("tunneling local connection from {peer}");
                        match relay::pump(conn, stream, cancel).await {
                            Ok(()) => debug!("client {peer} closed normally"),
                            Err(e) => warn!("tunneling error from {peer}: {e}"),
                        }
                    });
                }
            }
        }
    }
}
