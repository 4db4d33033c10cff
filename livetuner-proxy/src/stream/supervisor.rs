//! Session supervisor: owns the tuner, the datagram socket and the relay for
//! one live feed, and keeps the feed alive across transient failures.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::stream::packet::{PacketStreamAdapter, StreamError};
use crate::stream::relay::{ConsumerHandle, MulticastRelay, RelayConfig, RelayError};
use crate::tuner::command::{
    resolve_local_address, CommandError, TunerCommandClient, DEFAULT_CONTROL_TIMEOUT,
};
use crate::tuner::session::{SessionState, StreamSession};

/// Supervisor tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Bound for each control request/reply.
    pub control_timeout: Duration,
    /// Pause before re-issuing the start command after a failure.
    pub reconnect_delay: Duration,
    /// Give up after this many failed generations in a row. `None` retries forever.
    pub max_consecutive_failures: Option<u32>,
    /// Treat the feed as stalled when no datagram arrives for this long.
    pub datagram_timeout: Option<Duration>,
    pub relay: RelayConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            reconnect_delay: Duration::from_secs(1),
            max_consecutive_failures: None,
            datagram_timeout: None,
            relay: RelayConfig::default(),
        }
    }
}

/// Session-level errors.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Operation not allowed in the current state.
    #[error("Session is {0}")]
    InvalidState(SessionState),

    /// The local datagram socket could not be bound.
    #[error("Cannot bind datagram socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    /// The session closed before any data flowed.
    #[error("Session closed before any data was received")]
    NoData,

    /// The circuit breaker tripped.
    #[error("Giving up after {0} consecutive failures")]
    TooManyFailures(u32),

    /// The caller cancelled the open.
    #[error("Open cancelled")]
    Cancelled,

    #[error(transparent)]
    Relay(#[from] RelayError),
}

type OpenResult = Result<(), SessionError>;

struct Inner {
    session: StreamSession,
    config: SupervisorConfig,
    state: Mutex<SessionState>,
    client: TunerCommandClient,
    relay: Arc<MulticastRelay>,
    cancel: CancellationToken,
    done_tx: watch::Sender<bool>,
}

/// Drives one [`StreamSession`] from open to close.
///
/// Each generation resolves the local address, binds a datagram socket, tells
/// the tuner to stream to it and pumps the datagrams into the relay. A failure
/// before the first byte is fatal and reported by [`open`](Self::open); later
/// failures start a new generation after `reconnect_delay`, invisibly to
/// attached consumers apart from the bytes lost in the gap.
pub struct StreamSupervisor {
    inner: Arc<Inner>,
    done_rx: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSupervisor {
    /// Create an idle supervisor for `session`. Nothing happens until [`open`](Self::open).
    pub fn new(session: StreamSession, config: SupervisorConfig) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        let client = TunerCommandClient::new(session.control_addr(), config.control_timeout);
        let relay = MulticastRelay::new(config.relay);
        Self {
            inner: Arc::new(Inner {
                session,
                config,
                state: Mutex::new(SessionState::Idle),
                client,
                relay,
                cancel: CancellationToken::new(),
                done_tx,
            }),
            done_rx,
            task: Mutex::new(None),
        }
    }

    /// Start the feed. Resolves once the first byte has been relayed.
    ///
    /// When `cancel` fires first the session is closed and
    /// [`SessionError::Cancelled`] returned.
    pub async fn open(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        {
            let mut state = self.inner.state.lock();
            if *state != SessionState::Idle {
                return Err(SessionError::InvalidState(*state));
            }
            *state = SessionState::Opening;
        }
        info!(
            "[Session {}] opening {} on {} ({} tuners)",
            self.inner.session.id,
            self.inner.session.feed_locator,
            self.inner.session.control_addr(),
            self.inner.session.tuner_count
        );

        let (open_tx, open_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        *self.task.lock() = Some(tokio::spawn(inner.supervise(open_tx)));

        tokio::select! {
            biased;
            result = open_rx => result.unwrap_or(Err(SessionError::NoData)),
            _ = cancel.cancelled() => {
                debug!("[Session {}] open cancelled by caller", self.inner.session.id);
                self.close().await;
                Err(SessionError::Cancelled)
            }
        }
    }

    /// Stop the feed and wait until every resource is released. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == SessionState::Idle {
                *state = SessionState::Closed;
                drop(state);
                self.inner.relay.close();
                let _ = self.inner.done_tx.send(true);
                return;
            }
        }

        self.inner.cancel.cancel();
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|done| *done).await;

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Register a consumer starting at the current position of the feed.
    pub fn attach_consumer(&self) -> Result<ConsumerHandle, SessionError> {
        Ok(self.inner.relay.attach_consumer()?)
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn session(&self) -> &StreamSession {
        &self.inner.session
    }

    pub fn relay(&self) -> &Arc<MulticastRelay> {
        &self.inner.relay
    }

    /// Wait until the session reaches `Closed`, whatever the cause.
    pub async fn closed(&self) {
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|done| *done).await;
    }
}

impl Drop for StreamSupervisor {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    async fn supervise(self: Arc<Self>, open_tx: oneshot::Sender<OpenResult>) {
        let mut open_tx = Some(open_tx);
        let mut generation = 0u32;
        let mut failures = 0u32;

        let outcome = loop {
            generation += 1;
            let published = self.relay.bytes_published();
            let result = self.run_generation(generation, &mut open_tx).await;

            if self.cancel.is_cancelled() {
                break Ok(());
            }
            let Err(e) = result else {
                break Ok(());
            };
            if open_tx.is_some() {
                break Err(e);
            }

            if self.relay.bytes_published() > published {
                failures = 0;
            }
            failures += 1;
            if let Some(max) = self.config.max_consecutive_failures {
                if failures >= max {
                    break Err(SessionError::TooManyFailures(failures));
                }
            }

            warn!(
                "[Session {}] generation {} failed: {}, reconnecting in {:?}",
                self.session.id, generation, e, self.config.reconnect_delay
            );
            self.set_state(SessionState::Reconnecting);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        };

        if let Err(e) = &outcome {
            error!("[Session {}] stream failed: {}", self.session.id, e);
        }
        self.teardown(open_tx, outcome).await;
    }

    /// One start command plus the relay run it feeds.
    async fn run_generation(
        &self,
        generation: u32,
        open_tx: &mut Option<oneshot::Sender<OpenResult>>,
    ) -> Result<(), SessionError> {
        let control_addr = self.session.control_addr();
        let local_ip =
            resolve_local_address(control_addr, self.config.control_timeout, &self.cancel).await?;

        let bind_addr = self.session.local_bind_addr();
        let mut adapter = PacketStreamAdapter::bind(bind_addr)
            .await
            .map_err(|source| SessionError::Bind {
                addr: bind_addr,
                source,
            })?
            .with_idle_timeout(self.config.datagram_timeout);
        let local_port = adapter.local_addr()?.port();

        let tuner = self
            .client
            .start_streaming(
                local_ip,
                local_port,
                &self.session.feed_locator,
                self.session.tuner_count,
                &self.cancel,
            )
            .await?;
        debug!(
            "[Session {}] generation {} on tuner{}, receiving on {}:{}",
            self.session.id, generation, tuner, local_ip, local_port
        );

        let on_first_byte = || {
            self.set_state(SessionState::Streaming);
            match open_tx.take() {
                Some(tx) => {
                    info!("[Session {}] streaming", self.session.id);
                    let _ = tx.send(Ok(()));
                }
                None => info!(
                    "[Session {}] reconnected (generation {})",
                    self.session.id, generation
                ),
            }
        };

        let result = self
            .relay
            .run_until_cancelled(&mut adapter, on_first_byte, &self.cancel)
            .await;
        debug!(
            "[Session {}] generation {} received {} datagrams",
            self.session.id,
            generation,
            adapter.datagrams_received()
        );
        adapter.dispose();

        Ok(result?)
    }

    async fn teardown(&self, open_tx: Option<oneshot::Sender<OpenResult>>, outcome: OpenResult) {
        self.set_state(SessionState::Closing);
        self.client.stop_streaming().await;
        self.relay.close();
        self.set_state(SessionState::Closed);

        if let Some(tx) = open_tx {
            let result = match outcome {
                Ok(()) => Err(SessionError::NoData),
                Err(e) => Err(e),
            };
            let _ = tx.send(result);
        }
        info!("[Session {}] closed", self.session.id);
        let _ = self.done_tx.send(true);
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        // Teardown owns the terminal states.
        if state.is_terminating() && !next.is_terminating() {
            return;
        }
        if *state != next {
            debug!("[Session {}] {} -> {}", self.session.id, *state, next);
            *state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{payload, FakeTuner};
    use std::net::{IpAddr, Ipv4Addr};

    fn session_for(tuner: &FakeTuner) -> StreamSession {
        StreamSession::new(
            "s1",
            "channel-5",
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            0,
            "ch5",
            2,
        )
        .with_control_port(tuner.control_addr.port())
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            reconnect_delay: Duration::from_millis(50),
            ..SupervisorConfig::default()
        }
    }

    fn spawn_open(
        supervisor: &Arc<StreamSupervisor>,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<(), SessionError>> {
        let supervisor = Arc::clone(supervisor);
        tokio::spawn(async move { supervisor.open(&cancel).await })
    }

    async fn read_exact(consumer: &mut ConsumerHandle, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < len {
            let chunk = tokio::time::timeout(Duration::from_secs(5), consumer.read_chunk())
                .await
                .expect("consumer starved")
                .unwrap()
                .expect("unexpected end of stream");
            out.extend_from_slice(&chunk);
        }
        out
    }

    async fn wait_for_state(supervisor: &StreamSupervisor, expected: SessionState) {
        for _ in 0..100 {
            if supervisor.state() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("state is {}, expected {}", supervisor.state(), expected);
    }

    #[tokio::test]
    async fn test_end_to_end_three_payloads() {
        let mut tuner = FakeTuner::start(&[]).await;
        let supervisor = Arc::new(StreamSupervisor::new(session_for(&tuner), fast_config()));
        let opener = spawn_open(&supervisor, CancellationToken::new());

        let target = tuner.next_target().await;
        let frames: Vec<Vec<u8>> = (0..3).map(payload).collect();
        for frame in &frames {
            tuner.send_payload(target, frame).await;
        }

        tokio::time::timeout(Duration::from_secs(5), opener)
            .await
            .expect("open did not resolve")
            .unwrap()
            .unwrap();
        assert_eq!(supervisor.state(), SessionState::Streaming);

        let mut consumer = supervisor.attach_consumer().unwrap();
        let received = read_exact(&mut consumer, 3948).await;
        assert_eq!(received, frames.concat());

        assert_eq!(tuner.count_sets("/tuner0/channel", Some("auto:5")), 1);
        assert_eq!(
            tuner.count_sets("/tuner0/target", Some(format!("rtp://{}", target).as_str())),
            1
        );

        supervisor.close().await;
        assert_eq!(supervisor.state(), SessionState::Closed);
        assert_eq!(tuner.count_sets("/tuner0/target", Some("none")), 1);
        assert!(consumer.read_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_before_data_fails_open() {
        let mut tuner = FakeTuner::start(&[]).await;
        let supervisor = Arc::new(StreamSupervisor::new(session_for(&tuner), fast_config()));
        let opener = spawn_open(&supervisor, CancellationToken::new());

        tuner.next_target().await;
        supervisor.close().await;

        let result = opener.await.unwrap();
        assert!(matches!(result, Err(SessionError::NoData)));
        assert_eq!(supervisor.state(), SessionState::Closed);
        assert_eq!(tuner.count_sets("/tuner0/lockkey", Some("none")), 1);
    }

    #[tokio::test]
    async fn test_unreachable_tuner_is_fatal() {
        let addr = crate::testing::unused_tcp_addr().await;
        let session = StreamSession::new("s1", "channel-5", addr.ip(), 0, "ch5", 1)
            .with_control_port(addr.port());
        let supervisor = StreamSupervisor::new(session, fast_config());

        let result = supervisor.open(&CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(SessionError::Command(CommandError::Connect { .. }))
        ));
        supervisor.closed().await;
        assert_eq!(supervisor.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_all_tuners_busy_is_fatal() {
        let tuner = FakeTuner::start(&[0, 1]).await;
        let supervisor = StreamSupervisor::new(session_for(&tuner), fast_config());

        let result = supervisor.open(&CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(SessionError::Command(CommandError::NoTunerAvailable(2)))
        ));
        assert_eq!(tuner.count_starts(), 0);
    }

    #[tokio::test]
    async fn test_reconnects_after_stream_failure() {
        let mut tuner = FakeTuner::start(&[]).await;
        let supervisor = Arc::new(StreamSupervisor::new(session_for(&tuner), fast_config()));
        let opener = spawn_open(&supervisor, CancellationToken::new());

        let first = tuner.next_target().await;
        tuner.send_payload(first, &payload(1)).await;
        opener.await.unwrap().unwrap();
        let mut consumer = supervisor.attach_consumer().unwrap();
        assert_eq!(read_exact(&mut consumer, 1316).await, payload(1));

        tuner.send_raw(first, &[0x80, 0x21, 0x00]).await;
        let second = tuner.next_target().await;
        tuner.send_payload(second, &payload(2)).await;

        assert_eq!(read_exact(&mut consumer, 1316).await, payload(2));
        wait_for_state(&supervisor, SessionState::Streaming).await;
        assert_eq!(tuner.count_starts(), 2);
        // the held tuner is reclaimed, not released in between
        assert_eq!(tuner.count_sets("/tuner0/lockkey", Some("none")), 0);

        supervisor.close().await;
        assert_eq!(tuner.count_sets("/tuner0/lockkey", Some("none")), 1);
    }

    #[tokio::test]
    async fn test_bad_first_datagram_is_fatal() {
        let mut tuner = FakeTuner::start(&[]).await;
        let supervisor = Arc::new(StreamSupervisor::new(session_for(&tuner), fast_config()));
        let opener = spawn_open(&supervisor, CancellationToken::new());

        let target = tuner.next_target().await;
        tuner.send_raw(target, &[0x80, 0x21, 0x00]).await;

        let result = tokio::time::timeout(Duration::from_secs(5), opener)
            .await
            .expect("open did not resolve")
            .unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Stream(StreamError::MalformedDatagram(3)))
        ));
        assert_eq!(supervisor.state(), SessionState::Closed);
        // no retry once the first generation failed
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(tuner.count_starts(), 1);
        assert_eq!(tuner.count_sets("/tuner0/lockkey", Some("none")), 1);
    }

    #[tokio::test]
    async fn test_silent_feed_reconnects() {
        let mut tuner = FakeTuner::start(&[]).await;
        let config = SupervisorConfig {
            datagram_timeout: Some(Duration::from_millis(300)),
            ..fast_config()
        };
        let supervisor = Arc::new(StreamSupervisor::new(session_for(&tuner), config));
        let opener = spawn_open(&supervisor, CancellationToken::new());

        let first = tuner.next_target().await;
        tuner.send_payload(first, &payload(1)).await;
        opener.await.unwrap().unwrap();
        let mut consumer = supervisor.attach_consumer().unwrap();
        read_exact(&mut consumer, 1316).await;

        // nothing more is sent, so the idle timeout starts a new generation
        let second = tuner.next_target().await;
        assert!(tuner.count_starts() >= 2);

        tuner.send_payload(second, &payload(2)).await;
        assert_eq!(read_exact(&mut consumer, 1316).await, payload(2));

        supervisor.close().await;
        assert_eq!(supervisor.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_breaker_closes_session() {
        let mut tuner = FakeTuner::start(&[]).await;
        let config = SupervisorConfig {
            max_consecutive_failures: Some(1),
            ..fast_config()
        };
        let supervisor = Arc::new(StreamSupervisor::new(session_for(&tuner), config));
        let opener = spawn_open(&supervisor, CancellationToken::new());

        let target = tuner.next_target().await;
        tuner.send_payload(target, &payload(1)).await;
        opener.await.unwrap().unwrap();
        let mut consumer = supervisor.attach_consumer().unwrap();
        read_exact(&mut consumer, 1316).await;

        tuner.send_raw(target, &[0u8; 4]).await;
        tokio::time::timeout(Duration::from_secs(5), supervisor.closed())
            .await
            .expect("session still running");
        assert_eq!(supervisor.state(), SessionState::Closed);
        assert!(consumer.read_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut tuner = FakeTuner::start(&[]).await;
        let supervisor = Arc::new(StreamSupervisor::new(session_for(&tuner), fast_config()));
        let opener = spawn_open(&supervisor, CancellationToken::new());

        let target = tuner.next_target().await;
        tuner.send_payload(target, &payload(0)).await;
        opener.await.unwrap().unwrap();

        supervisor.close().await;
        supervisor.close().await;
        assert_eq!(tuner.count_sets("/tuner0/target", Some("none")), 1);

        let reopened = supervisor.open(&CancellationToken::new()).await;
        assert!(matches!(
            reopened,
            Err(SessionError::InvalidState(SessionState::Closed))
        ));
        assert!(matches!(
            supervisor.attach_consumer(),
            Err(SessionError::Relay(RelayError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_close_before_open() {
        let tuner = FakeTuner::start(&[]).await;
        let supervisor = StreamSupervisor::new(session_for(&tuner), fast_config());

        supervisor.close().await;
        assert_eq!(supervisor.state(), SessionState::Closed);
        assert!(tuner.requests().is_empty());
        assert!(matches!(
            supervisor.open(&CancellationToken::new()).await,
            Err(SessionError::InvalidState(SessionState::Closed))
        ));
    }

    #[tokio::test]
    async fn test_caller_cancels_open() {
        let mut tuner = FakeTuner::start(&[]).await;
        let supervisor = Arc::new(StreamSupervisor::new(session_for(&tuner), fast_config()));
        let cancel = CancellationToken::new();
        let opener = spawn_open(&supervisor, cancel.clone());

        tuner.next_target().await;
        cancel.cancel();

        let result = opener.await.unwrap();
        assert!(matches!(result, Err(SessionError::Cancelled)));
        assert_eq!(supervisor.state(), SessionState::Closed);
        assert_eq!(tuner.count_sets("/tuner0/target", Some("none")), 1);
    }
}
