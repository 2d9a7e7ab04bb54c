//! The bidirectional proxy pump.
//!
//! [`pump`] moves bytes between two endpoints until one direction ends or
//! errors, then forces the other direction shut and reports. Benign
//! terminations (EOF, peer-closed pipes, cancellation-induced closes) are
//! logged and swallowed; anything else propagates to the caller, which owns
//! the decision to tear the session down.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::BUFFER_SIZE;

/// Bridge `a` and `b` until either direction finishes.
///
/// Two copy tasks (uplink `a`→`b`, downlink `b`→`a`) each own a
/// [`BUFFER_SIZE`] buffer and report into a 2-slot channel. The first task to
/// finish — EOF, error, or ambient cancel — forces the other one shut, and
/// both are joined before this returns. Ordering between the two directions
/// is not guaranteed and not required.
pub async fn pump<A, B>(a: A, b: B, cancel: CancellationToken) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let local = cancel.child_token();
    let (report_tx, mut report_rx) = mpsc::channel::<io::Result<()>>(2);

    let uplink = tokio::spawn(copy_half(a_read, b_write, local.clone(), report_tx.clone()));
    let downlink = tokio::spawn(copy_half(b_read, a_write, local.clone(), report_tx));

    let mut result = Ok(());
    for _ in 0..2 {
        let Some(report) = report_rx.recv().await else {
            break;
        };
        match report {
            Ok(()) => {}
            Err(e) if is_benign(&e) => {
                tracing::debug!("closed by peer: {e}");
            }
            Err(e) => {
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
        // First report in: the other half must come down too.
        local.cancel();
    }

    let _ = uplink.await;
    let _ = downlink.await;
    result
}

/// Copy one direction, then shut the destination down so the peer half
/// cascades to a close.
async fn copy_half<R, W>(
    mut src: ReadHalf<R>,
    mut dst: WriteHalf<W>,
    cancel: CancellationToken,
    report: mpsc::Sender<io::Result<()>>,
) where
    R: AsyncRead + Send + 'static,
    W: AsyncWrite + Send + 'static,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            read = src.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    if let Err(e) = dst.write_all(&buf[..n]).await {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e),
            },
        }
    };

    let _ = dst.shutdown().await;
    let _ = report.send(result).await;
}

/// Whether an I/O error is a normal way for a proxied connection to end.
///
/// Peer-closed pipes and resets happen on every cancel and on every remote
/// hang-up; they end the session but are not failures.
pub fn is_benign(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_pump_bidirectional() {
        let (mut left, inner_left) = duplex(256);
        let (inner_right, mut right) = duplex(256);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pump(inner_left, inner_right, cancel));

        left.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        right.write_all(b"pong").await.unwrap();
        left.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing one outer end drives the pump to completion.
        drop(left);
        handle.await.unwrap().unwrap();

        let n = right.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_pump_cancellation() {
        let (mut left, inner_left) = duplex(256);
        let (inner_right, mut right) = duplex(256);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pump(inner_left, inner_right, cancel.clone()));

        left.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        right.read_exact(&mut buf).await.unwrap();

        cancel.cancel();
        handle.await.unwrap().unwrap();

        // Both outer endpoints observe the shutdown as EOF.
        assert_eq!(left.read(&mut buf).await.unwrap(), 0);
        assert_eq!(right.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pump_large_transfer_preserves_bytes() {
        let (mut left, inner_left) = duplex(512);
        let (inner_right, mut right) = duplex(512);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pump(inner_left, inner_right, cancel));

        // Several times the copy buffer, to exercise chunking.
        let payload: Vec<u8> = (0..BUFFER_SIZE * 4).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            left.write_all(&payload).await.unwrap();
            left.shutdown().await.unwrap();
            left
        });

        let mut received = Vec::new();
        right.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        writer.await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_benign_classification() {
        assert!(is_benign(&io::Error::new(io::ErrorKind::BrokenPipe, "x")));
        assert!(is_benign(&io::Error::new(io::ErrorKind::ConnectionReset, "x")));
        assert!(!is_benign(&io::Error::new(io::ErrorKind::ConnectionAborted, "x")));
        assert!(!is_benign(&io::Error::new(io::ErrorKind::TimedOut, "x")));
    }
}
