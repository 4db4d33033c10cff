//! Tuner control client.
//!
//! Every operation opens a short-lived TCP connection to the device control
//! port, exchanges GET/SET packets and closes it again. No connection is held
//! between calls.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::BytesMut;
use livetuner_protocol::{
    decode_control_message, decode_header, encode_control_message, tuner_variable,
    ControlMessage, ProtocolError, TunerCommand,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::tuner::session::MAX_TUNER_COUNT;

/// Errors from the tuner control exchange.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The control port could not be reached.
    #[error("Cannot reach tuner control port {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// I/O failure on an established control connection.
    #[error("Control connection error: {0}")]
    Io(#[from] io::Error),

    /// The device sent a packet that could not be decoded.
    #[error("Control protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The device refused a SET request.
    #[error("Tuner rejected {name}: {message}")]
    Rejected { name: String, message: String },

    /// The reply did not belong to the request.
    #[error("Unexpected reply for {expected}: {actual:?}")]
    UnexpectedReply {
        expected: String,
        actual: ControlMessage,
    },

    /// Every tuner on the device is locked by someone else.
    #[error("No free tuner among {0}")]
    NoTunerAvailable(u32),

    /// Request/reply did not complete in time.
    #[error("Control request timed out after {0:?}")]
    Timeout(Duration),

    /// The cancellation token fired.
    #[error("Control request cancelled")]
    Cancelled,
}

/// Default bound for one control request/reply exchange.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Tuner claimed by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActiveTuner {
    index: u32,
    lockkey: u32,
}

/// Issues start/stop commands to one tuner device.
pub struct TunerCommandClient {
    control_addr: SocketAddr,
    control_timeout: Duration,
    active: Mutex<Option<ActiveTuner>>,
}

impl TunerCommandClient {
    /// Create a client for the device control endpoint at `control_addr`.
    pub fn new(control_addr: SocketAddr, control_timeout: Duration) -> Self {
        Self {
            control_addr,
            control_timeout,
            active: Mutex::new(None),
        }
    }

    /// Device control endpoint.
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// Index of the tuner currently claimed, if any.
    pub fn active_tuner(&self) -> Option<u32> {
        self.active.lock().map(|a| a.index)
    }

    /// Tell the device to stream `feed_locator` to `local_address:local_port`.
    ///
    /// Returns once the device accepted the target; it does not wait for the
    /// first datagram. A tuner already held by this client is reused with its
    /// existing lock key, otherwise tuners are tried in order until one can be
    /// locked. Returns the tuner index.
    pub async fn start_streaming(
        &self,
        local_address: IpAddr,
        local_port: u16,
        feed_locator: &str,
        tuner_count: u32,
        cancel: &CancellationToken,
    ) -> Result<u32, CommandError> {
        let tuner_count = tuner_count.clamp(1, MAX_TUNER_COUNT);
        let command = TunerCommand::Start {
            feed_locator: feed_locator.to_string(),
            target_address: local_address,
            target_port: local_port,
            tuner_count,
        };

        let mut conn = ControlConnection::open(self.control_addr, self.control_timeout, cancel).await?;

        let held = *self.active.lock();
        let fresh_key = rand::thread_rng().gen_range(1..=u32::MAX);
        let mut candidates = Vec::with_capacity(tuner_count as usize);
        if let Some(active) = held {
            candidates.push((active, true));
        }
        candidates.extend(
            (0..tuner_count)
                .filter(|&i| held.map_or(true, |a| a.index != i))
                .map(|index| {
                    (
                        ActiveTuner {
                            index,
                            lockkey: fresh_key,
                        },
                        false,
                    )
                }),
        );

        for (candidate, is_held) in candidates {
            let lock_var = tuner_variable(candidate.index, "lockkey");
            let claim = if is_held {
                ControlMessage::set(lock_var, candidate.lockkey.to_string(), Some(candidate.lockkey))
            } else {
                ControlMessage::claim_lockkey(candidate.index, candidate.lockkey)
            };

            // Recorded before the reply so an interrupted claim is still released by stop.
            *self.active.lock() = Some(candidate);
            match conn.set(&claim, cancel).await {
                Ok(_) => {}
                Err(CommandError::Rejected { message, .. }) => {
                    debug!("[Command] tuner{} unavailable: {}", candidate.index, message);
                    *self.active.lock() = None;
                    continue;
                }
                Err(e) => return Err(e),
            }

            for request in command.requests(candidate.index, candidate.lockkey) {
                conn.set(&request, cancel).await?;
            }

            info!(
                "[Command] tuner{} on {} streaming {} to {}:{}",
                candidate.index, self.control_addr, feed_locator, local_address, local_port
            );
            return Ok(candidate.index);
        }

        Err(CommandError::NoTunerAvailable(tuner_count))
    }

    /// Stop delivery and release the claimed tuner.
    ///
    /// Best effort: failures are logged, never returned. Does nothing when no
    /// tuner is held, so repeated calls send at most one stop.
    pub async fn stop_streaming(&self) {
        let Some(active) = self.active.lock().take() else {
            debug!("[Command] stop requested but no tuner is held");
            return;
        };

        // The session token is already cancelled during teardown.
        let never = CancellationToken::new();
        let result = async {
            let mut conn = ControlConnection::open(self.control_addr, self.control_timeout, &never).await?;
            for request in TunerCommand::Stop.requests(active.index, active.lockkey) {
                conn.set(&request, &never).await?;
            }
            Ok::<(), CommandError>(())
        }
        .await;

        match result {
            Ok(()) => info!("[Command] tuner{} on {} released", active.index, self.control_addr),
            Err(e) => warn!(
                "[Command] Failed to stop tuner{} on {}: {}",
                active.index, self.control_addr, e
            ),
        }
    }
}

/// Local address the device can route datagrams back to.
///
/// Opens a throwaway connection to the control port and reads the address the
/// OS bound locally, which may differ from the first enumerated interface.
pub async fn resolve_local_address(
    control_addr: SocketAddr,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<IpAddr, CommandError> {
    let stream = connect(control_addr, timeout, cancel).await?;
    let local = stream.local_addr()?;
    Ok(local.ip())
}

async fn connect(
    addr: SocketAddr,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<TcpStream, CommandError> {
    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(CommandError::Cancelled),
        result = tokio::time::timeout(timeout, TcpStream::connect(addr)) => match result {
            Err(_) => return Err(CommandError::Timeout(timeout)),
            Ok(Err(source)) => return Err(CommandError::Connect { addr, source }),
            Ok(Ok(stream)) => stream,
        },
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// One control connection with its receive buffer.
struct ControlConnection {
    stream: TcpStream,
    buf: BytesMut,
    timeout: Duration,
}

impl ControlConnection {
    async fn open(
        addr: SocketAddr,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self, CommandError> {
        Ok(Self {
            stream: connect(addr, timeout, cancel).await?,
            buf: BytesMut::with_capacity(1024),
            timeout,
        })
    }

    /// Send a SET request and check the reply. Returns the value echoed back.
    async fn set(
        &mut self,
        request: &ControlMessage,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, CommandError> {
        let timeout = self.timeout;
        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CommandError::Cancelled),
            result = tokio::time::timeout(timeout, self.exchange(request)) => {
                result.map_err(|_| CommandError::Timeout(timeout))??
            }
        };

        match reply {
            ControlMessage::GetSetReply { name, error: Some(message), .. } => {
                Err(CommandError::Rejected { name, message })
            }
            ControlMessage::GetSetReply { ref name, ref value, .. } if name == request.name() => {
                debug!("[Command] {} = {:?}", name, value);
                Ok(value.clone())
            }
            actual => Err(CommandError::UnexpectedReply {
                expected: request.name().to_string(),
                actual,
            }),
        }
    }

    async fn exchange(&mut self, request: &ControlMessage) -> Result<ControlMessage, CommandError> {
        let frame = encode_control_message(request)?;
        self.stream.write_all(&frame).await?;

        loop {
            if let Some(header) = decode_header(&self.buf)? {
                let frame_len = header.frame_len();
                if self.buf.len() >= frame_len {
                    let frame = self.buf.split_to(frame_len);
                    return Ok(decode_control_message(&header, &frame)?);
                }
            }

            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(CommandError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "tuner closed the control connection",
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTuner;
    use std::net::Ipv4Addr;

    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn set_names(requests: &[ControlMessage]) -> Vec<String> {
        requests.iter().map(|r| r.name().to_string()).collect()
    }

    #[tokio::test]
    async fn test_start_claims_first_free_tuner() {
        let tuner = FakeTuner::start(&[]).await;
        let client = TunerCommandClient::new(tuner.control_addr, DEFAULT_CONTROL_TIMEOUT);
        let cancel = CancellationToken::new();

        let index = client
            .start_streaming(LOCAL, 5004, "ch5", 2, &cancel)
            .await
            .unwrap();
        assert_eq!(index, 0);
        assert_eq!(client.active_tuner(), Some(0));

        let requests = tuner.requests();
        assert_eq!(
            set_names(&requests),
            vec!["/tuner0/lockkey", "/tuner0/channel", "/tuner0/target"]
        );
        match &requests[2] {
            ControlMessage::GetSetRequest { value, lockkey, .. } => {
                assert_eq!(value.as_deref(), Some("rtp://127.0.0.1:5004"));
                assert!(lockkey.is_some());
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_busy_tuner_falls_over() {
        let tuner = FakeTuner::start(&[0]).await;
        let client = TunerCommandClient::new(tuner.control_addr, DEFAULT_CONTROL_TIMEOUT);

        let index = client
            .start_streaming(LOCAL, 5004, "ch7-2", 2, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(index, 1);
        assert_eq!(
            set_names(&tuner.requests()),
            vec![
                "/tuner0/lockkey",
                "/tuner1/lockkey",
                "/tuner1/channel",
                "/tuner1/program",
                "/tuner1/target"
            ]
        );
    }

    #[tokio::test]
    async fn test_all_tuners_busy() {
        let tuner = FakeTuner::start(&[0, 1]).await;
        let client = TunerCommandClient::new(tuner.control_addr, DEFAULT_CONTROL_TIMEOUT);

        let result = client
            .start_streaming(LOCAL, 5004, "ch5", 2, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(CommandError::NoTunerAvailable(2))));
        assert_eq!(client.active_tuner(), None);
    }

    #[tokio::test]
    async fn test_restart_reuses_held_tuner() {
        let tuner = FakeTuner::start(&[]).await;
        let client = TunerCommandClient::new(tuner.control_addr, DEFAULT_CONTROL_TIMEOUT);
        let cancel = CancellationToken::new();

        client.start_streaming(LOCAL, 5004, "ch5", 2, &cancel).await.unwrap();
        client.start_streaming(LOCAL, 5004, "ch5", 2, &cancel).await.unwrap();

        let requests = tuner.requests();
        assert_eq!(tuner.count_sets("/tuner0/target", None), 2);
        let keys: Vec<Option<u32>> = requests
            .iter()
            .filter(|r| r.name() == "/tuner0/target")
            .map(|r| match r {
                ControlMessage::GetSetRequest { lockkey, .. } => *lockkey,
                _ => None,
            })
            .collect();
        assert_eq!(keys[0], keys[1]);
    }

    #[tokio::test]
    async fn test_stop_sent_once() {
        let tuner = FakeTuner::start(&[]).await;
        let client = TunerCommandClient::new(tuner.control_addr, DEFAULT_CONTROL_TIMEOUT);

        client
            .start_streaming(LOCAL, 5004, "ch5", 1, &CancellationToken::new())
            .await
            .unwrap();
        client.stop_streaming().await;
        client.stop_streaming().await;

        assert_eq!(tuner.count_sets("/tuner0/target", Some("none")), 1);
        assert_eq!(tuner.count_sets("/tuner0/lockkey", Some("none")), 1);
        assert_eq!(client.active_tuner(), None);
    }

    #[tokio::test]
    async fn test_stop_failure_is_swallowed() {
        let addr = crate::testing::unused_tcp_addr().await;
        let client = TunerCommandClient::new(addr, Duration::from_secs(1));
        *client.active.lock() = Some(ActiveTuner {
            index: 0,
            lockkey: 42,
        });

        tokio::time::timeout(Duration::from_secs(3), client.stop_streaming())
            .await
            .expect("stop blocked on an unreachable tuner");
        assert_eq!(client.active_tuner(), None);
    }

    #[tokio::test]
    async fn test_interrupted_claim_is_still_held() {
        // accepts requests but never answers them
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 512];
                    while matches!(socket.read(&mut buf).await, Ok(n) if n > 0) {}
                });
            }
        });

        let client = TunerCommandClient::new(addr, DEFAULT_CONTROL_TIMEOUT);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = client.start_streaming(LOCAL, 5004, "ch5", 2, &cancel).await;
        assert!(matches!(result, Err(CommandError::Cancelled)));
        assert_eq!(client.active_tuner(), Some(0));
    }

    #[tokio::test]
    async fn test_tuner_count_is_bounded() {
        let busy: Vec<u32> = (0..MAX_TUNER_COUNT).collect();
        let tuner = FakeTuner::start(&busy).await;
        let client = TunerCommandClient::new(tuner.control_addr, DEFAULT_CONTROL_TIMEOUT);

        let result = client
            .start_streaming(LOCAL, 5004, "ch5", u32::MAX, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(CommandError::NoTunerAvailable(MAX_TUNER_COUNT))));
        let claims = tuner
            .requests()
            .iter()
            .filter(|r| r.name().ends_with("/lockkey"))
            .count();
        assert_eq!(claims, MAX_TUNER_COUNT as usize);
    }

    #[tokio::test]
    async fn test_resolve_local_address() {
        let tuner = FakeTuner::start(&[]).await;
        let ip = resolve_local_address(tuner.control_addr, DEFAULT_CONTROL_TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ip, LOCAL);
    }

    #[tokio::test]
    async fn test_unreachable_control_port() {
        let addr = crate::testing::unused_tcp_addr().await;
        let result =
            resolve_local_address(addr, DEFAULT_CONTROL_TIMEOUT, &CancellationToken::new()).await;
        assert!(matches!(result, Err(CommandError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_before_connect() {
        let tuner = FakeTuner::start(&[]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let client = TunerCommandClient::new(tuner.control_addr, DEFAULT_CONTROL_TIMEOUT);
        let result = client.start_streaming(LOCAL, 5004, "ch5", 1, &cancel).await;
        assert!(matches!(result, Err(CommandError::Cancelled)));
    }
}
