//! In-process fake tuner device for tests.
//!
//! Answers GET/SET control packets on a loopback TCP port, records every
//! request and reports each `target` it is asked to stream to. Datagrams are
//! sent explicitly by the test through [`FakeTuner::send_payload`].

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use livetuner_protocol::{
    decode_control_message, decode_header, encode_control_message, ControlMessage,
    RTP_HEADER_SIZE, TS_PAYLOAD_SIZE,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

pub(crate) struct FakeTuner {
    pub control_addr: SocketAddr,
    requests: Arc<Mutex<Vec<ControlMessage>>>,
    targets: mpsc::UnboundedReceiver<SocketAddr>,
    sender: UdpSocket,
    sequence: Mutex<u16>,
}

impl FakeTuner {
    /// Start a fake device whose `busy` tuners refuse lock keys.
    pub async fn start(busy: &[u32]) -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let control_addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (target_tx, targets) = mpsc::unbounded_channel();
        let busy: Arc<HashSet<u32>> = Arc::new(busy.iter().copied().collect());

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let recorded = Arc::clone(&recorded);
                let target_tx = target_tx.clone();
                let busy = Arc::clone(&busy);
                tokio::spawn(serve_control(socket, recorded, target_tx, busy));
            }
        });

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();

        Self {
            control_addr,
            requests,
            targets,
            sender,
            sequence: Mutex::new(0),
        }
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<ControlMessage> {
        self.requests.lock().clone()
    }

    /// Number of SET requests for `name`, optionally with a specific value.
    pub fn count_sets(&self, name: &str, value: Option<&str>) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| match r {
                ControlMessage::GetSetRequest { name: n, value: v, .. } => {
                    n == name && v.is_some() && (value.is_none() || v.as_deref() == value)
                }
                _ => false,
            })
            .count()
    }

    /// Number of start directives (`target` set to an `rtp://` URL).
    pub fn count_starts(&self) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| match r {
                ControlMessage::GetSetRequest { name, value: Some(v), .. } => {
                    name.ends_with("/target") && v.starts_with("rtp://")
                }
                _ => false,
            })
            .count()
    }

    /// Wait for the next `rtp://` target the device was told to stream to.
    pub async fn next_target(&mut self) -> SocketAddr {
        tokio::time::timeout(Duration::from_secs(5), self.targets.recv())
            .await
            .expect("no start command within 5s")
            .expect("fake tuner stopped")
    }

    /// Send one RTP datagram carrying `payload`.
    pub async fn send_payload(&self, target: SocketAddr, payload: &[u8]) {
        let seq = {
            let mut seq = self.sequence.lock();
            *seq = seq.wrapping_add(1);
            *seq
        };
        let mut datagram = Vec::with_capacity(RTP_HEADER_SIZE + payload.len());
        datagram.extend_from_slice(&[0x80, 0x21]);
        datagram.extend_from_slice(&seq.to_be_bytes());
        datagram.extend_from_slice(&[0u8; RTP_HEADER_SIZE - 4]);
        datagram.extend_from_slice(payload);
        self.send_raw(target, &datagram).await;
    }

    /// Send raw bytes without an RTP header.
    pub async fn send_raw(&self, target: SocketAddr, datagram: &[u8]) {
        self.sender.send_to(datagram, target).await.unwrap();
    }
}

/// A recognisable full-size payload.
pub(crate) fn payload(seed: u8) -> Vec<u8> {
    (0..TS_PAYLOAD_SIZE)
        .map(|i| seed.wrapping_mul(31).wrapping_add(i as u8))
        .collect()
}

/// A loopback TCP address nothing listens on.
pub(crate) async fn unused_tcp_addr() -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn tuner_index(name: &str) -> Option<u32> {
    name.strip_prefix("/tuner")?.split('/').next()?.parse().ok()
}

async fn serve_control(
    mut socket: TcpStream,
    recorded: Arc<Mutex<Vec<ControlMessage>>>,
    target_tx: mpsc::UnboundedSender<SocketAddr>,
    busy: Arc<HashSet<u32>>,
) {
    let mut buf = BytesMut::new();
    loop {
        let header = match decode_header(&buf) {
            Ok(Some(h)) if buf.len() >= h.frame_len() => h,
            Ok(_) => match socket.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            },
            Err(_) => return,
        };
        let frame = buf.split_to(header.frame_len());
        let Ok(request) = decode_control_message(&header, &frame) else {
            return;
        };
        recorded.lock().push(request.clone());

        let ControlMessage::GetSetRequest { name, value, .. } = request else {
            return;
        };

        let refused = name.ends_with("/lockkey")
            && value.as_deref() != Some("none")
            && tuner_index(&name).map_or(false, |i| busy.contains(&i));

        let reply = if refused {
            ControlMessage::GetSetReply {
                name,
                value: None,
                error: Some("ERROR: resource locked by 10.0.0.2".to_string()),
            }
        } else {
            if name.ends_with("/target") {
                if let Some(addr) = value
                    .as_deref()
                    .and_then(|v| v.strip_prefix("rtp://"))
                    .and_then(|v| v.parse::<SocketAddr>().ok())
                {
                    let _ = target_tx.send(addr);
                }
            }
            ControlMessage::GetSetReply {
                name,
                value,
                error: None,
            }
        };

        let encoded = encode_control_message(&reply).unwrap();
        if socket.write_all(&encoded).await.is_err() {
            return;
        }
    }
}
