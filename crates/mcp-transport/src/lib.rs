//! Owns the serial line to the motor-control bus and enforces the
//! single-flight request/reply discipline described in spec §4.2: at most
//! one MCP exchange may be outstanding on the bus at any instant, and every
//! exchange is bounded by a timeout.
//!
//! The transport is generic over its byte stream so it can be driven by a
//! real serial port (`tokio_serial::SerialStream`, via [`BusTransport::open`])
//! or, in tests, by an in-memory duplex pipe standing in for the device.

use std::time::Duration;

use bytes::BytesMut;
use mcp_protocol::{decode_reply, FrameError, Reply, FRAME_LEN};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout as tokio_timeout;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, warn};

/// Default per-exchange reply timeout (spec §4.2).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);
/// Minimum wait observed between the end of one exchange and the start of
/// the next, to let the device recover (spec §4.2 point 5).
pub const INTER_COMMAND_SPACING: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("serial transport closed")]
    TransportClosed,
}

struct Inner<S> {
    /// `None` once the connection has been observed to fail; every
    /// subsequent exchange then fails fast with `TransportClosed`.
    stream: Option<S>,
    rx_buf: BytesMut,
}

/// The shared serial bus. Cloning is not provided: share via `Arc`.
pub struct BusTransport<S> {
    inner: Mutex<Inner<S>>,
}

impl BusTransport<tokio_serial::SerialStream> {
    /// Open the real serial device at `path` (8N1, the configured baud rate).
    pub fn open(path: &str, baud: u32) -> Result<Self, std::io::Error> {
        let stream = tokio_serial::new(path, baud).open_native_async()?;
        Ok(Self::from_stream(stream))
    }
}

impl<S> BusTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn from_stream(stream: S) -> Self {
        Self {
            inner: Mutex::new(Inner {
                stream: Some(stream),
                rx_buf: BytesMut::with_capacity(FRAME_LEN * 2),
            }),
        }
    }

    /// Run one request/reply exchange with exclusive access to the bus.
    ///
    /// Holds the bus mutex for the whole exchange — write, wait-for-reply,
    /// and the post-exchange spacing sleep — so the next call cannot start
    /// writing until this one has fully settled. That single critical
    /// section is what makes single-flight and inter-command spacing
    /// structural properties rather than conventions callers must honor.
    pub async fn exchange(
        &self,
        request: [u8; FRAME_LEN],
        expected_addr: u8,
        expected_opcode: u8,
        timeout: Duration,
    ) -> Result<Reply, TransportError> {
        let mut guard = self.inner.lock().await;

        let Inner { stream, rx_buf } = &mut *guard;
        let stream = stream.as_mut().ok_or(TransportError::TransportClosed)?;

        // Any bytes left over from a prior timed-out or short exchange are
        // stale by the time a new request goes out.
        rx_buf.clear();

        if stream.write_all(&request).await.is_err() {
            guard.stream = None;
            return Err(TransportError::TransportClosed);
        }
        if stream.flush().await.is_err() {
            guard.stream = None;
            return Err(TransportError::TransportClosed);
        }

        let read_result = tokio_timeout(timeout, read_one_frame(stream, rx_buf)).await;

        let frame = match read_result {
            Err(_elapsed) => {
                debug!(addr = expected_addr, opcode = expected_opcode, ?timeout, "mcp exchange timed out");
                return Err(TransportError::Timeout(timeout));
            }
            Ok(Err(())) => {
                guard.stream = None;
                return Err(TransportError::TransportClosed);
            }
            Ok(Ok(frame)) => frame,
        };

        let reply = decode_reply(&frame, expected_addr, expected_opcode);
        if let Err(err) = &reply {
            warn!(addr = expected_addr, opcode = expected_opcode, %err, "mcp reply rejected");
        }

        tokio::time::sleep(INTER_COMMAND_SPACING).await;

        Ok(reply?)
    }
}

/// Accumulate bytes into `rx_buf` until a full frame is available, then
/// split it off. Bytes beyond the frame are left in `rx_buf` for whatever
/// exchange runs next (and are discarded at that exchange's start).
async fn read_one_frame<S: AsyncRead + Unpin>(
    stream: &mut S,
    rx_buf: &mut BytesMut,
) -> Result<[u8; FRAME_LEN], ()> {
    let mut chunk = [0u8; 64];
    while rx_buf.len() < FRAME_LEN {
        let n = stream.read(&mut chunk).await.map_err(|_| ())?;
        if n == 0 {
            return Err(());
        }
        rx_buf.extend_from_slice(&chunk[..n]);
    }
    let frame_bytes = rx_buf.split_to(FRAME_LEN);
    let mut frame = [0u8; FRAME_LEN];
    frame.copy_from_slice(&frame_bytes);
    Ok(frame)
}
