//! RTP datagram socket presented as a sequential byte source.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use livetuner_protocol::{RTP_HEADER_SIZE, TS_PAYLOAD_SIZE};
use log::{debug, trace};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Receive buffer size. Larger than any datagram a device sends.
const RECV_BUFFER_SIZE: usize = 8192;

/// Errors from reading the datagram stream.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Requested range does not fit the destination buffer.
    #[error("Invalid read range: offset {offset} + count {count} exceeds buffer of {len} bytes")]
    InvalidArgument {
        offset: usize,
        count: usize,
        len: usize,
    },

    /// The adapter was disposed.
    #[error("Packet stream has been disposed")]
    Disposed,

    /// The cancellation token fired while waiting for data.
    #[error("Read cancelled")]
    Cancelled,

    /// Datagram shorter than the RTP header.
    #[error("Malformed datagram: {0} bytes is shorter than the {RTP_HEADER_SIZE}-byte header")]
    MalformedDatagram(usize),

    /// No datagram arrived within the configured idle timeout.
    #[error("No datagram received for {0:?}")]
    Idle(Duration),

    /// The source reported end of stream.
    #[error("Stream source ended")]
    Ended,

    /// Socket failure.
    #[error("Socket error: {0}")]
    Io(#[from] io::Error),
}

impl StreamError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamError::Cancelled)
    }
}

/// A forward-only byte producer the relay can pull chunks from.
pub trait ByteSource: Send {
    /// Read at least one byte into `buf`, waiting if nothing is available.
    ///
    /// `Ok(0)` means the source has ended.
    fn read_chunk<'a>(
        &'a mut self,
        buf: &'a mut [u8],
        cancel: &'a CancellationToken,
    ) -> impl Future<Output = Result<usize, StreamError>> + Send + 'a;
}

/// Wraps a UDP socket carrying RTP datagrams and yields the concatenated
/// payloads with headers stripped.
///
/// Payload bytes that do not fit the caller's request are kept and returned
/// first by the next read, so requests need not be multiples of
/// [`TS_PAYLOAD_SIZE`].
pub struct PacketStreamAdapter {
    socket: Option<UdpSocket>,
    datagram: Box<[u8]>,
    remainder: BytesMut,
    /// Failure hit after payload was already handed out; reported by the next read.
    pending_error: Option<StreamError>,
    idle_timeout: Option<Duration>,
    datagrams_received: u64,
    bytes_received: u64,
}

impl PacketStreamAdapter {
    /// Wrap an already bound socket.
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket: Some(socket),
            datagram: vec![0u8; RECV_BUFFER_SIZE].into_boxed_slice(),
            remainder: BytesMut::with_capacity(TS_PAYLOAD_SIZE),
            pending_error: None,
            idle_timeout: None,
            datagrams_received: 0,
            bytes_received: 0,
        }
    }

    /// Bind a socket on `addr` and wrap it.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::new(UdpSocket::bind(addr).await?))
    }

    /// Fail reads with [`StreamError::Idle`] when no datagram arrives in time.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, StreamError> {
        let socket = self.socket.as_ref().ok_or(StreamError::Disposed)?;
        Ok(socket.local_addr()?)
    }

    /// Close the socket. Later reads fail with [`StreamError::Disposed`].
    pub fn dispose(&mut self) {
        if self.socket.take().is_some() {
            debug!(
                "[PacketStream] disposed after {} datagrams ({} bytes)",
                self.datagrams_received, self.bytes_received
            );
        }
        self.remainder.clear();
        self.pending_error = None;
    }

    pub fn is_disposed(&self) -> bool {
        self.socket.is_none()
    }

    pub fn datagrams_received(&self) -> u64 {
        self.datagrams_received
    }

    /// Payload bytes received, headers excluded.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Fill exactly `buf[offset..offset + count]` with payload bytes.
    ///
    /// Awaits as many datagrams as needed. Returns `count`.
    pub async fn read_sequential(
        &mut self,
        buf: &mut [u8],
        offset: usize,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<usize, StreamError> {
        let end = offset
            .checked_add(count)
            .filter(|&end| end <= buf.len())
            .ok_or(StreamError::InvalidArgument {
                offset,
                count,
                len: buf.len(),
            })?;
        if self.is_disposed() {
            return Err(StreamError::Disposed);
        }

        let dest = &mut buf[offset..end];
        let mut filled = self.take_remainder(dest);
        if filled < count {
            if let Some(e) = self.pending_error.take() {
                return Err(e);
            }
        }
        while filled < count {
            let payload_len = self.recv_datagram(cancel).await?;
            filled += self.place_payload(&mut dest[filled..], payload_len);
        }
        Ok(count)
    }

    /// Copy buffered remainder bytes into `dest`.
    fn take_remainder(&mut self, dest: &mut [u8]) -> usize {
        let n = dest.len().min(self.remainder.len());
        dest[..n].copy_from_slice(&self.remainder[..n]);
        self.remainder.advance(n);
        n
    }

    /// Copy the payload of the last received datagram, keeping what doesn't fit.
    fn place_payload(&mut self, dest: &mut [u8], payload_len: usize) -> usize {
        let payload = &self.datagram[RTP_HEADER_SIZE..RTP_HEADER_SIZE + payload_len];
        let n = dest.len().min(payload_len);
        dest[..n].copy_from_slice(&payload[..n]);
        if n < payload_len {
            self.remainder.extend_from_slice(&payload[n..]);
        }
        n
    }

    /// Wait for the next datagram. Returns its payload length.
    async fn recv_datagram(&mut self, cancel: &CancellationToken) -> Result<usize, StreamError> {
        let socket = self.socket.as_ref().ok_or(StreamError::Disposed)?;
        let datagram = &mut self.datagram;
        let idle_timeout = self.idle_timeout;

        let recv = async {
            match idle_timeout {
                Some(timeout) => tokio::time::timeout(timeout, socket.recv(datagram))
                    .await
                    .map_err(|_| StreamError::Idle(timeout))?
                    .map_err(StreamError::from),
                None => socket.recv(datagram).await.map_err(StreamError::from),
            }
        };

        let len = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamError::Cancelled),
            result = recv => result?,
        };
        self.accept_datagram(len)
    }

    /// Take a datagram that is already queued, without waiting.
    fn try_recv_datagram(&mut self) -> Result<Option<usize>, StreamError> {
        let socket = self.socket.as_ref().ok_or(StreamError::Disposed)?;
        match socket.try_recv(&mut self.datagram) {
            Ok(len) => self.accept_datagram(len).map(Some),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn accept_datagram(&mut self, len: usize) -> Result<usize, StreamError> {
        if len < RTP_HEADER_SIZE {
            return Err(StreamError::MalformedDatagram(len));
        }
        let payload_len = len - RTP_HEADER_SIZE;
        self.datagrams_received += 1;
        self.bytes_received += payload_len as u64;
        trace!("[PacketStream] datagram {} bytes", len);
        Ok(payload_len)
    }
}

impl ByteSource for PacketStreamAdapter {
    /// Waits for one datagram, then drains whatever is already queued until
    /// `buf` is full.
    fn read_chunk<'a>(
        &'a mut self,
        buf: &'a mut [u8],
        cancel: &'a CancellationToken,
    ) -> impl Future<Output = Result<usize, StreamError>> + Send + 'a {
        async move {
            if self.is_disposed() {
                return Err(StreamError::Disposed);
            }
            if buf.is_empty() {
                return Ok(0);
            }

            let mut filled = self.take_remainder(buf);
            if filled == 0 {
                if let Some(e) = self.pending_error.take() {
                    return Err(e);
                }
            }
            while filled == 0 {
                let payload_len = self.recv_datagram(cancel).await?;
                filled += self.place_payload(&mut buf[filled..], payload_len);
            }
            while filled < buf.len() {
                match self.try_recv_datagram() {
                    Ok(Some(payload_len)) => {
                        filled += self.place_payload(&mut buf[filled..], payload_len)
                    }
                    Ok(None) => break,
                    Err(e) => {
                        trace!("[PacketStream] deferring {} behind {} bytes", e, filled);
                        self.pending_error = Some(e);
                        break;
                    }
                }
            }
            Ok(filled)
        }
    }
}
