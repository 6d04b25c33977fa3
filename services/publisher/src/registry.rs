//! Client connection registry
//!
//! One [`ClientConnection`] per accepted socket, holding everything the
//! session protocol knows about that client. The registry is a concurrent map
//! touched from the dispatch task, per-client command workers and timers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gateway_codec::{
    encode_response, DataPacketFlags, OperationalModes, ServerCommand, ServerResponse, TextEncoding,
};
use gateway_network::{SendCompletion, TransportError, TransportServer, UdpDataChannel};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cipher::CipherState;
use crate::counters::LifetimeCounters;
use crate::error::{PublisherError, Result};
use crate::subscription::{PacketSink, Subscription};

/// Who a connection was authenticated as
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriberIdentity {
    pub id: Uuid,
    pub acronym: String,
    pub name: String,
}

#[derive(Debug, Default)]
struct ConnectionState {
    subscriber: Option<SubscriberIdentity>,
    subscriber_info: Option<String>,
    shared_secret: Option<String>,
    authenticated: bool,
    subscribed: bool,
    modes: OperationalModes,
}

/// Structured view of one connection for administrative listings
#[derive(Debug, Clone, Serialize)]
pub struct ClientSummary {
    pub client_id: Uuid,
    pub connection_id: String,
    pub subscriber: Option<SubscriberIdentity>,
    pub subscriber_info: Option<String>,
    pub authenticated: bool,
    pub subscribed: bool,
    pub connected_at: DateTime<Utc>,
    pub signals: usize,
}

pub struct ClientConnection {
    client_id: Uuid,
    sequence: u64,
    connection_id: String,
    remote_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    transport: TransportServer,
    state: RwLock<ConnectionState>,
    cipher: CipherState,
    data_channel: RwLock<Option<Arc<UdpDataChannel>>>,
    subscription: Mutex<Option<Arc<Subscription>>>,
    counters: Arc<LifetimeCounters>,
    runtime: Option<Handle>,
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("client_id", &self.client_id)
            .field("connection_id", &self.connection_id)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl ClientConnection {
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Display identifier, the remote endpoint
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn subscriber(&self) -> Option<SubscriberIdentity> {
        self.state.read().subscriber.clone()
    }

    /// Subscriber id, or nil before identification
    pub fn subscriber_id(&self) -> Uuid {
        self.state.read().subscriber.as_ref().map_or(Uuid::nil(), |s| s.id)
    }

    pub fn set_subscriber(&self, subscriber: SubscriberIdentity, shared_secret: Option<String>) {
        let mut state = self.state.write();
        state.subscriber = Some(subscriber);
        state.shared_secret = shared_secret.filter(|secret| !secret.is_empty());
    }

    pub fn shared_secret(&self) -> Option<String> {
        self.state.read().shared_secret.clone()
    }

    pub fn subscriber_info(&self) -> Option<String> {
        self.state.read().subscriber_info.clone()
    }

    pub fn set_subscriber_info(&self, info: Option<String>) {
        self.state.write().subscriber_info = info;
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().authenticated
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.state.write().authenticated = authenticated;
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.read().subscribed
    }

    pub fn set_subscribed(&self, subscribed: bool) {
        self.state.write().subscribed = subscribed;
    }

    pub fn modes(&self) -> OperationalModes {
        self.state.read().modes
    }

    pub fn set_modes(&self, modes: OperationalModes) {
        self.state.write().modes = modes;
    }

    pub fn encoding(&self) -> TextEncoding {
        self.modes().encoding()
    }

    pub fn cipher(&self) -> &CipherState {
        &self.cipher
    }

    pub fn set_data_channel(&self, channel: Option<Arc<UdpDataChannel>>) {
        *self.data_channel.write() = channel;
    }

    pub fn subscription(&self) -> Option<Arc<Subscription>> {
        self.subscription.lock().clone()
    }

    /// Replaces the subscription slot, returning the previous occupant.
    pub fn replace_subscription(&self, subscription: Option<Arc<Subscription>>) -> Option<Arc<Subscription>> {
        std::mem::replace(&mut *self.subscription.lock(), subscription)
    }

    /// Sends a Succeeded or Failed status with text in the client's encoding.
    pub fn send_status(&self, response: ServerResponse, command: ServerCommand, message: &str) -> Result<()> {
        let payload = self.encoding().encode(message);
        self.send_response(response, command, &payload)
    }

    pub fn summary(&self) -> ClientSummary {
        let state = self.state.read();
        ClientSummary {
            client_id: self.client_id,
            connection_id: self.connection_id.clone(),
            subscriber: state.subscriber.clone(),
            subscriber_info: state.subscriber_info.clone(),
            authenticated: state.authenticated,
            subscribed: state.subscribed,
            connected_at: self.connected_at,
            signals: self.subscription().map_or(0, |s| s.signal_cache().len()),
        }
    }

    fn seal_data_packet(&self, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(keys) = self.cipher.snapshot() else {
            return Ok(None);
        };
        let Some((&flags, body)) = payload.split_first() else {
            return Ok(None);
        };
        let (index, sealed) = keys.encrypt(body)?;
        let mut flags = DataPacketFlags::from_bits_retain(flags);
        flags.set(DataPacketFlags::CIPHER_INDEX, index == 1);

        let mut out = BytesMut::with_capacity(1 + sealed.len());
        out.extend_from_slice(&[flags.bits()]);
        out.extend_from_slice(&sealed);
        Ok(Some(out.to_vec()))
    }
}

impl PacketSink for ClientConnection {
    fn send_response(&self, response: ServerResponse, command: ServerCommand, payload: &[u8]) -> Result<()> {
        let sealed = if response == ServerResponse::DataPacket {
            self.seal_data_packet(payload)?
        } else {
            None
        };
        let packet = encode_response(response, command, sealed.as_deref().unwrap_or(payload));

        if response.prefers_data_channel() {
            let channel = self.data_channel.read().clone();
            if let Some(channel) = channel {
                channel.send(&packet)?;
                self.counters.record_bytes_sent(packet.len());
                return Ok(());
            }
        }

        match self.transport.send(self.client_id, &packet) {
            Ok(completion) => {
                match &self.runtime {
                    Some(runtime) => {
                        runtime.spawn(settle_send(
                            completion,
                            self.counters.clone(),
                            self.client_id,
                            response,
                            packet.len(),
                        ));
                    }
                    None => self.counters.record_bytes_sent(packet.len()),
                }
                Ok(())
            }
            Err(e) => {
                warn!(
                    client = %self.client_id,
                    response = ?response,
                    error = %e,
                    "Failed to send response packet to client"
                );
                Err(e.into())
            }
        }
    }
}

/// Counts a queued packet once written; reports packets shed from the queue.
async fn settle_send(
    completion: SendCompletion,
    counters: Arc<LifetimeCounters>,
    client_id: Uuid,
    response: ServerResponse,
    bytes: usize,
) {
    match completion.await {
        Ok(Ok(())) => counters.record_bytes_sent(bytes),
        Ok(Err(TransportError::QueueCleared { reason, .. })) => {
            counters.record_discarded_packet();
            warn!(client = %client_id, response = ?response, %reason, "Queued packet discarded before sending");
        }
        Ok(Err(e)) => debug!(client = %client_id, response = ?response, error = %e, "Queued packet not sent"),
        Err(_) => debug!(client = %client_id, response = ?response, "Send completion dropped"),
    }
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<Uuid, Arc<ClientConnection>>,
    next_sequence: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers the connection for a newly accepted client.
    pub fn register(
        &self,
        client_id: Uuid,
        remote_addr: SocketAddr,
        transport: TransportServer,
        counters: Arc<LifetimeCounters>,
    ) -> Arc<ClientConnection> {
        let connection = Arc::new(ClientConnection {
            client_id,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            connection_id: remote_addr.to_string(),
            remote_addr,
            connected_at: Utc::now(),
            transport,
            state: RwLock::new(ConnectionState::default()),
            cipher: CipherState::default(),
            data_channel: RwLock::new(None),
            subscription: Mutex::new(None),
            counters,
            runtime: Handle::try_current().ok(),
        });
        self.clients.insert(client_id, connection.clone());
        debug!(client = %client_id, remote = %remote_addr, "Client registered");
        connection
    }

    pub fn get(&self, client_id: &Uuid) -> Option<Arc<ClientConnection>> {
        self.clients.get(client_id).map(|entry| entry.value().clone())
    }

    pub fn lookup(&self, client_id: &Uuid) -> Result<Arc<ClientConnection>> {
        self.get(client_id)
            .ok_or(PublisherError::ClientNotFound { client_id: *client_id })
    }

    pub fn remove(&self, client_id: &Uuid) -> Option<Arc<ClientConnection>> {
        self.clients.remove(client_id).map(|(_, connection)| connection)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// All connections in the order they were accepted
    pub fn ordered(&self) -> Vec<Arc<ClientConnection>> {
        let mut connections: Vec<_> = self.clients.iter().map(|entry| entry.value().clone()).collect();
        connections.sort_by_key(|connection| connection.sequence);
        connections
    }

    pub fn by_index(&self, index: usize) -> Result<Arc<ClientConnection>> {
        self.ordered()
            .into_iter()
            .nth(index)
            .ok_or(PublisherError::ClientIndexOutOfRange { index })
    }

    pub fn by_subscriber(&self, subscriber_id: &Uuid) -> Vec<Arc<ClientConnection>> {
        self.ordered()
            .into_iter()
            .filter(|connection| connection.subscriber_id() == *subscriber_id)
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.ordered()
            .iter()
            .filter_map(|connection| connection.subscription())
            .collect()
    }
}
