//! Command channel transport server
//!
//! One task per connection owns the receive loop; a sibling writer task drains
//! the client's [`SendMailbox`]. Connection lifecycle and received payloads are
//! reported as [`ServerEvent`]s on a single channel consumed by the owner.
//!
//! ```text
//! accept ──► [TLS handshake] ──► Connected ──► receive loop ──► Disconnected
//!                                   │
//!                                   └── writer task (one send in flight)
//! ```
//!
//! If the listener fails while the server is running it is rebound after
//! `restart_delay`. Stopping the server cancels every connection; queued sends
//! are abandoned.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use gateway_codec::{PayloadFramer, DEFAULT_MARKER};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::metrics::TransportMetrics;
use super::receive::{PayloadReceiver, ReceiveCursor};
use super::send_queue::{run_writer, SendCompletion, SendMailbox};
use super::tls::CertificateFingerprint;
use crate::error::{Result, TransportError};

/// Transport server configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub bind_address: SocketAddr,
    /// Frame every payload with `marker || u32 LE length`
    pub payload_aware: bool,
    pub marker: Vec<u8>,
    /// Largest payload accepted from a client
    pub max_payload_size: usize,
    /// `None` leaves the send queue unbounded
    pub max_send_queue_size: Option<usize>,
    pub restart_delay: Duration,
    pub handshake_timeout: Duration,
    pub nodelay: bool,
    /// Read chunk size
    pub receive_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6165),
            payload_aware: true,
            marker: DEFAULT_MARKER.to_vec(),
            max_payload_size: 1024 * 1024,
            max_send_queue_size: None,
            restart_delay: Duration::from_millis(2000),
            handshake_timeout: Duration::from_secs(15),
            nodelay: true,
            receive_buffer_size: 8192,
        }
    }
}

/// Lifecycle and data notifications raised by the server
#[derive(Debug)]
pub enum ServerEvent {
    Started {
        local_addr: SocketAddr,
    },
    Stopped,
    ClientConnected {
        client_id: Uuid,
        remote_addr: SocketAddr,
        certificate: Option<CertificateFingerprint>,
    },
    ClientDisconnected {
        client_id: Uuid,
    },
    PayloadReceived {
        client_id: Uuid,
        payload: Bytes,
    },
    ReceiveError {
        client_id: Uuid,
        error: TransportError,
    },
    SendError {
        client_id: Uuid,
        error: TransportError,
    },
    ListenerError {
        error: TransportError,
    },
}

struct ClientHandle {
    sequence: u64,
    remote_addr: SocketAddr,
    mailbox: Arc<SendMailbox>,
    cancel: CancellationToken,
    cursor: Mutex<ReceiveCursor>,
}

struct ServerShared {
    config: TransportConfig,
    framer: PayloadFramer,
    tls: Option<TlsAcceptor>,
    clients: DashMap<Uuid, Arc<ClientHandle>>,
    next_sequence: AtomicU64,
    events: mpsc::UnboundedSender<ServerEvent>,
    metrics: TransportMetrics,
    running: AtomicBool,
    shutdown: Mutex<Option<CancellationToken>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// TCP or TLS command channel server
#[derive(Clone)]
pub struct TransportServer {
    shared: Arc<ServerShared>,
}

impl TransportServer {
    /// Creates a stopped server and the receiver for its events.
    pub fn new(
        config: TransportConfig,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let framer = PayloadFramer::new(&config.marker);
        let shared = Arc::new(ServerShared {
            config,
            framer,
            tls: tls.map(TlsAcceptor::from),
            clients: DashMap::new(),
            next_sequence: AtomicU64::new(0),
            events,
            metrics: TransportMetrics::new(),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            local_addr: Mutex::new(None),
        });
        (Self { shared }, receiver)
    }

    /// Binds the listener and starts accepting clients.
    pub async fn start(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr().filter(|_| self.is_running()) {
            return Ok(addr);
        }

        let listener = TcpListener::bind(self.shared.config.bind_address)
            .await
            .map_err(|e| {
                TransportError::network_with_source(
                    format!("failed to bind {}", self.shared.config.bind_address),
                    e,
                )
            })?;
        let local_addr = listener.local_addr()?;

        let token = CancellationToken::new();
        *self.shared.shutdown.lock() = Some(token.clone());
        *self.shared.local_addr.lock() = Some(local_addr);
        self.shared.running.store(true, Ordering::Release);

        info!(
            %local_addr,
            tls = self.shared.tls.is_some(),
            payload_aware = self.shared.config.payload_aware,
            "🚀 Command channel listening"
        );
        self.shared.emit(ServerEvent::Started { local_addr });

        tokio::spawn(supervise_listener(self.shared.clone(), listener, token));
        Ok(local_addr)
    }

    /// Stops accepting and forcibly disconnects every client.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(token) = self.shared.shutdown.lock().take() {
            token.cancel();
        }
        for client in self.shared.clients.iter() {
            client.cancel.cancel();
        }
        info!("Command channel stopped");
        self.shared.emit(ServerEvent::Stopped);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    pub fn metrics(&self) -> &TransportMetrics {
        &self.shared.metrics
    }

    pub fn payload_aware(&self) -> bool {
        self.shared.config.payload_aware
    }

    /// Queues `data` for `client_id`, framing it first in payload-aware mode.
    ///
    /// Fails immediately with `ResourceExhausted` when the client's bounded
    /// queue overflowed; the queue has then already been cleared.
    pub fn send(&self, client_id: Uuid, data: &[u8]) -> Result<SendCompletion> {
        let client = self
            .shared
            .clients
            .get(&client_id)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::ClientNotFound { client_id })?;

        let framed = if self.shared.config.payload_aware {
            self.shared.framer.frame(data)
        } else {
            Bytes::copy_from_slice(data)
        };

        client.mailbox.enqueue(framed).map_err(|err| {
            if matches!(err, TransportError::ResourceExhausted { .. }) {
                self.shared.metrics.record_queue_overflow();
            }
            err
        })
    }

    /// Connected client IDs in connection order
    pub fn client_ids(&self) -> Vec<Uuid> {
        let mut clients: Vec<(u64, Uuid)> = self
            .shared
            .clients
            .iter()
            .map(|entry| (entry.value().sequence, *entry.key()))
            .collect();
        clients.sort_unstable();
        clients.into_iter().map(|(_, id)| id).collect()
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.len()
    }

    pub fn is_connected(&self, client_id: &Uuid) -> bool {
        self.shared.clients.contains_key(client_id)
    }

    pub fn remote_addr(&self, client_id: &Uuid) -> Option<SocketAddr> {
        self.shared.clients.get(client_id).map(|c| c.remote_addr)
    }

    /// Tears the connection down; the disconnect event follows asynchronously.
    pub fn disconnect(&self, client_id: &Uuid) -> bool {
        match self.shared.clients.get(client_id) {
            Some(client) => {
                client.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Copies bytes from the client's last delivered payload at its read cursor.
    pub fn read(&self, client_id: &Uuid, out: &mut [u8]) -> Result<usize> {
        let client = self
            .shared
            .clients
            .get(client_id)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::ClientNotFound {
                client_id: *client_id,
            })?;
        let read = client.cursor.lock().read(out);
        Ok(read)
    }
}

impl ServerShared {
    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr, cancel: CancellationToken) {
        let _ = stream.set_nodelay(self.config.nodelay);

        match self.tls.clone() {
            None => self.run_client(stream, remote_addr, None, cancel).await,
            Some(acceptor) => {
                let handshake = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = tokio::time::timeout(self.config.handshake_timeout, acceptor.accept(stream)) => result,
                };
                match handshake {
                    Ok(Ok(tls)) => {
                        let certificate = tls
                            .get_ref()
                            .1
                            .peer_certificates()
                            .and_then(|chain| chain.first())
                            .map(|cert| CertificateFingerprint::of(cert.as_ref()));
                        self.run_client(tls, remote_addr, certificate, cancel).await;
                    }
                    Ok(Err(e)) => {
                        warn!(remote = %remote_addr, error = %e, "TLS handshake failed");
                        self.metrics.record_error();
                    }
                    Err(_) => {
                        warn!(
                            remote = %remote_addr,
                            timeout_ms = self.config.handshake_timeout.as_millis() as u64,
                            "TLS handshake timed out"
                        );
                        self.metrics.record_error();
                    }
                }
            }
        }
    }

    async fn run_client<S>(
        self: Arc<Self>,
        stream: S,
        remote_addr: SocketAddr,
        certificate: Option<CertificateFingerprint>,
        cancel: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let client_id = Uuid::new_v4();
        let (reader, writer) = tokio::io::split(stream);
        let mailbox = SendMailbox::new(client_id, self.config.max_send_queue_size);
        let handle = Arc::new(ClientHandle {
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            mailbox: mailbox.clone(),
            cancel: cancel.clone(),
            cursor: Mutex::new(ReceiveCursor::default()),
        });
        self.clients.insert(client_id, handle.clone());
        self.metrics.record_connection();

        info!(client = %client_id, remote = %remote_addr, "Client connected");
        self.emit(ServerEvent::ClientConnected {
            client_id,
            remote_addr,
            certificate,
        });

        let writer_task = {
            let metrics = self.metrics.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = run_writer(mailbox, writer, metrics, cancel.clone()).await;
                if result.is_err() {
                    cancel.cancel();
                }
                result
            })
        };

        if let Err(error) = self.receive_loop(client_id, reader, &handle, &cancel).await {
            self.metrics.record_error();
            if error.is_disconnect() {
                debug!(client = %client_id, %error, "Client connection reset");
            } else {
                warn!(client = %client_id, %error, "Receive failed, terminating connection");
                self.emit(ServerEvent::ReceiveError { client_id, error });
            }
        }
        cancel.cancel();

        match writer_task.await {
            Ok(Err(error)) => self.emit(ServerEvent::SendError { client_id, error }),
            Err(join_error) => error!(client = %client_id, %join_error, "Writer task failed"),
            Ok(Ok(())) => {}
        }

        self.clients.remove(&client_id);
        info!(client = %client_id, remote = %remote_addr, "Client disconnected");
        self.emit(ServerEvent::ClientDisconnected { client_id });
    }

    async fn receive_loop<R>(
        &self,
        client_id: Uuid,
        mut reader: R,
        handle: &ClientHandle,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut scratch = vec![0u8; self.config.receive_buffer_size.max(1)];
        let mut receiver = self
            .config
            .payload_aware
            .then(|| PayloadReceiver::new(self.framer.clone(), self.config.max_payload_size));

        loop {
            let want = match &receiver {
                Some(rx) => rx.bytes_needed().min(scratch.len()),
                None => scratch.len(),
            };

            let read = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                read = reader.read(&mut scratch[..want]) => read?,
            };
            if read == 0 {
                return Ok(());
            }

            let payloads = match receiver.as_mut() {
                Some(rx) => rx.feed(&scratch[..read])?,
                None => vec![Bytes::copy_from_slice(&scratch[..read])],
            };
            for payload in payloads {
                self.metrics.record_receive(payload.len());
                handle.cursor.lock().load(payload.clone());
                self.emit(ServerEvent::PayloadReceived { client_id, payload });
            }
        }
    }
}

async fn accept_loop(shared: &Arc<ServerShared>, listener: &TcpListener, token: &CancellationToken) -> Result<()> {
    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        debug!(remote = %remote_addr, "Accepted connection");
        tokio::spawn(shared.clone().serve_connection(stream, remote_addr, token.child_token()));
    }
}

async fn supervise_listener(shared: Arc<ServerShared>, listener: TcpListener, token: CancellationToken) {
    let mut listener = Some(listener);
    loop {
        if let Some(active) = listener.take() {
            match accept_loop(&shared, &active, &token).await {
                Ok(()) => return,
                Err(error) => {
                    error!(%error, "Listener stopped unexpectedly");
                    shared.emit(ServerEvent::ListenerError { error });
                }
            }
        }

        let delay = shared.config.restart_delay;
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let address = (*shared.local_addr.lock()).unwrap_or(shared.config.bind_address);
        match TcpListener::bind(address).await {
            Ok(rebound) => {
                info!(%address, "Listener restarted");
                listener = Some(rebound);
            }
            Err(e) => warn!(%address, error = %e, "Listener restart failed, retrying"),
        }
    }
}
