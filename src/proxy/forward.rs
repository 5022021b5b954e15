//! Bidirectional byte relay between two live streams

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::error::Result;

pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// How one copy direction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Source reached end of stream
    Eof,
    /// No progress within the idle timeout
    Idle,
    /// The peer reset or abandoned the connection
    PeerClosed,
    /// The other direction ended abnormally
    Aborted,
}

/// Relay bytes between `a` and `b` until both directions have ended.
///
/// One direction runs on a spawned task and the other on the caller's; the
/// call returns only after joining both. Each direction applies
/// `idle_timeout` to every read and write. A clean end of stream half-closes
/// the destination and lets the other direction drain. A timeout or peer
/// reset ends that direction silently and stops the other one. Any other I/O
/// error stops both and is returned.
///
/// Returns the byte counts `(a -> b, b -> a)`.
#[instrument(skip(a, b))]
pub async fn forward<A, B>(
    a: A,
    b: B,
    idle_timeout: Duration,
    buffer_size: usize,
) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let (upstream_done, upstream_abort) = oneshot::channel();
    let (downstream_done, downstream_abort) = oneshot::channel();

    let upstream = tokio::spawn(copy_until_closed(
        a_read,
        b_write,
        idle_timeout,
        buffer_size,
        upstream_done,
        downstream_abort,
    ));
    let received = copy_until_closed(
        b_read,
        a_write,
        idle_timeout,
        buffer_size,
        downstream_done,
        upstream_abort,
    )
    .await;
    let sent = upstream
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    let sent = sent?;
    let received = received?;
    debug!(bytes_sent = sent, bytes_received = received, "Forwarding finished");
    Ok((sent, received))
}

/// Copy `reader` into `writer` until end of stream, idle timeout or error.
///
/// `done` fires when this direction ends abnormally; `abort` fires when the
/// other one does. Dropping `done` without sending marks a clean end.
async fn copy_until_closed<R, W>(
    mut reader: R,
    mut writer: W,
    idle_timeout: Duration,
    buffer_size: usize,
    done: oneshot::Sender<()>,
    mut abort: oneshot::Receiver<()>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(buffer_size.max(1));
    let mut total = 0u64;
    let mut watching = true;

    let outcome: io::Result<Exit> = loop {
        buf.clear();

        let read = tokio::select! {
            biased;
            signal = &mut abort, if watching => match signal {
                Ok(()) => break Ok(Exit::Aborted),
                Err(_) => {
                    watching = false;
                    continue;
                }
            },
            read = timeout(idle_timeout, reader.read_buf(&mut buf)) => read,
        };

        match read {
            Err(_) => break Ok(Exit::Idle),
            Ok(Ok(0)) => break Ok(Exit::Eof),
            Ok(Ok(_)) => {}
            Ok(Err(e)) if is_peer_close(&e) => break Ok(Exit::PeerClosed),
            Ok(Err(e)) => break Err(e),
        }

        match timeout(idle_timeout, writer.write_all(&buf)).await {
            Err(_) => break Ok(Exit::Idle),
            Ok(Ok(())) => total += buf.len() as u64,
            Ok(Err(e)) if is_peer_close(&e) => break Ok(Exit::PeerClosed),
            Ok(Err(e)) => break Err(e),
        }
    };

    // Errors closing an already-closed stream are expected here.
    let _ = timeout(idle_timeout, writer.shutdown()).await;

    match outcome {
        Ok(Exit::Eof) => Ok(total),
        Ok(exit) => {
            debug!("Copy ended after {} bytes: {:?}", total, exit);
            let _ = done.send(());
            Ok(total)
        }
        Err(e) => {
            let _ = done.send(());
            Err(e)
        }
    }
}

/// Errors that mean the peer went away rather than something broke
fn is_peer_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
