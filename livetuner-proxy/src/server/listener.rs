//! TCP listener that hands every connection the live stream.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::stream::{RelayError, StreamSupervisor};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

/// Accepts TCP connections and streams the relay output to each of them.
pub struct Server {
    config: ServerConfig,
    supervisor: Arc<StreamSupervisor>,
    permits: Arc<Semaphore>,
}

impl Server {
    /// Create a new server streaming `supervisor`'s feed.
    pub fn new(config: ServerConfig, supervisor: Arc<StreamSupervisor>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_connections));
        Self {
            config,
            supervisor,
            permits,
        }
    }

    /// Bind and serve until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!("Server listening on {}", listener.local_addr()?);
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) {
        let mut connection_count = 0u64;

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, addr)) => {
                    connection_count += 1;
                    let conn_id = connection_count;

                    let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                        warn!(
                            "[Conn {}] Rejecting {}: {} connections already open",
                            conn_id, addr, self.config.max_connections
                        );
                        drop(socket);
                        continue;
                    };

                    info!("[Conn {}] New connection from {}", conn_id, addr);
                    let supervisor = Arc::clone(&self.supervisor);
                    let shutdown = shutdown.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, conn_id, supervisor, shutdown).await {
                            debug!("[Conn {}] Connection ended: {}", conn_id, e);
                        }
                        info!("[Conn {}] Connection closed", conn_id);
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }

        info!("Server stopped after {} connections", connection_count);
    }

    pub fn supervisor(&self) -> &Arc<StreamSupervisor> {
        &self.supervisor
    }
}

/// Stream the relay into one client until either side ends.
async fn handle_connection(
    mut socket: TcpStream,
    conn_id: u64,
    supervisor: Arc<StreamSupervisor>,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    socket.set_nodelay(true).map_err(RelayError::Sink)?;

    let mut consumer = supervisor.relay().attach_consumer()?;
    debug!("[Conn {}] attached as consumer {}", conn_id, consumer.id());

    let copied = tokio::select! {
        _ = shutdown.cancelled() => None,
        result = consumer.copy_to(&mut socket) => Some(result?),
    };
    if let Some(bytes) = copied {
        info!("[Conn {}] {} bytes sent", conn_id, bytes);
    }

    let _ = socket.shutdown().await;
    Ok(())
}
