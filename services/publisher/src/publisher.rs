//! Data publisher server context
//!
//! [`DataPublisher`] is constructed explicitly and owns every shared piece of
//! publisher state: the transport, the client registry, routing, notifications,
//! the catalog and the timers. Transport events are consumed by a single
//! dispatch task which feeds each client's payloads to that client's own
//! command worker, so commands from one client are handled in order while
//! different clients proceed in parallel.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use gateway_codec::{Measurement, ServerCommand, ServerResponse, SignalIndexCache, SignalReference};
use gateway_config::{PublisherConfig, SecurityMode};
use gateway_network::{
    CertificateFingerprint, MetricsSnapshot, ServerEvent, TlsSettings, TransportConfig,
    TransportServer, TrustStore,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog::{CatalogHandle, RightsSource, SecurityCatalog};
use crate::cipher::seal_with_secret;
use crate::counters::{LifetimeCounters, LifetimeSnapshot};
use crate::engine;
use crate::error::{PublisherError, Result};
use crate::events::{PublisherEvent, EVENT_CHANNEL_CAPACITY};
use crate::metadata::{InMemoryMetadata, MetadataSource};
use crate::notifications::{encode_notify, stamp_message, NotificationStore};
use crate::registry::{ClientConnection, ClientRegistry, ClientSummary, SubscriberIdentity};
use crate::subscription::{PacketSink, RoutingTable};

const MIN_RETRANSMISSION_CHECK: Duration = Duration::from_millis(100);

pub(crate) struct PublisherContext {
    pub(crate) config: PublisherConfig,
    pub(crate) transport: TransportServer,
    transport_events: Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
    pub(crate) registry: ClientRegistry,
    pub(crate) catalog: CatalogHandle,
    pub(crate) metadata: Arc<dyn MetadataSource>,
    pub(crate) notifications: NotificationStore,
    pub(crate) routing: RoutingTable,
    pub(crate) counters: Arc<LifetimeCounters>,
    trust_store: TrustStore,
    events: broadcast::Sender<PublisherEvent>,
    workers: DashMap<Uuid, mpsc::UnboundedSender<Bytes>>,
    shutdown: CancellationToken,
}

/// Gateway data publisher
#[derive(Clone)]
pub struct DataPublisher {
    ctx: Arc<PublisherContext>,
}

impl DataPublisher {
    /// Builds a publisher serving metadata from `catalog`.
    pub fn new(config: PublisherConfig, catalog: SecurityCatalog) -> Result<Self> {
        let handle = CatalogHandle::new(catalog);
        let metadata = Arc::new(InMemoryMetadata::new(handle.clone()));
        Self::with_metadata_source(config, handle, metadata)
    }

    pub fn with_metadata_source(
        config: PublisherConfig,
        catalog: CatalogHandle,
        metadata: Arc<dyn MetadataSource>,
    ) -> Result<Self> {
        let config = config.normalized();
        config
            .validate()
            .map_err(|e| PublisherError::configuration(e.to_string()))?;

        let trust_store = TrustStore::new();
        trust_store.replace(catalog.current().trusted_fingerprints());

        let tls = match config.security_mode {
            SecurityMode::Tls => {
                let (Some(certificate), Some(private_key)) =
                    (config.tls.certificate.as_deref(), config.tls.private_key.as_deref())
                else {
                    return Err(PublisherError::configuration(
                        "TLS security mode requires a certificate and private key",
                    ));
                };
                let settings = TlsSettings::from_pem_files(
                    certificate,
                    private_key,
                    config.tls.require_client_certificate,
                    trust_store.clone(),
                )?;
                Some(settings.server_config()?)
            }
            SecurityMode::None | SecurityMode::Gateway => None,
        };

        let transport_config = TransportConfig {
            bind_address: config.listen_address,
            payload_aware: config.payload_aware,
            marker: config.payload_marker.clone(),
            max_payload_size: config.max_payload_size,
            max_send_queue_size: config.max_send_queue_size,
            restart_delay: config.command_channel_restart_delay(),
            ..TransportConfig::default()
        };
        let (transport, transport_events) = TransportServer::new(transport_config, tls);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let ctx = PublisherContext {
            notifications: NotificationStore::new(config.notifications_file()),
            config,
            transport,
            transport_events: Mutex::new(Some(transport_events)),
            registry: ClientRegistry::new(),
            catalog,
            metadata,
            routing: RoutingTable::new(),
            counters: Arc::new(LifetimeCounters::default()),
            trust_store,
            events,
            workers: DashMap::new(),
            shutdown: CancellationToken::new(),
        };
        Ok(Self { ctx: Arc::new(ctx) })
    }

    /// Starts the command channel and background tasks; returns the bound address.
    ///
    /// A publisher runs once; call [`stop`](Self::stop) to shut it down for good.
    pub async fn start(&self) -> Result<SocketAddr> {
        let ctx = &self.ctx;
        let receiver = ctx
            .transport_events
            .lock()
            .take()
            .ok_or_else(|| PublisherError::configuration("publisher has already been started"))?;

        let catalog = ctx.catalog.current();
        let known: HashSet<Uuid> = catalog.subscribers.iter().map(|s| s.id).collect();
        match ctx.notifications.load(&known) {
            Ok(count) if count > 0 => info!(count, "Loaded pending notifications"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to load notifications"),
        }

        let local_addr = ctx.transport.start().await?;
        tokio::spawn(dispatch(ctx.clone(), receiver));

        if ctx.encryption_enabled() {
            tokio::spawn(rotate_keys_periodically(ctx.clone()));
        }
        tokio::spawn(retransmit_periodically(ctx.clone()));

        info!(
            name = %ctx.config.name,
            %local_addr,
            security = ?ctx.config.security_mode,
            authentication = ctx.config.require_authentication,
            encryption = ctx.encryption_enabled(),
            "Data publisher started"
        );
        Ok(local_addr)
    }

    /// Stops timers, subscriptions and the command channel.
    pub fn stop(&self) {
        let ctx = &self.ctx;
        if ctx.shutdown.is_cancelled() {
            return;
        }
        ctx.shutdown.cancel();
        for connection in ctx.registry.ordered() {
            if let Some(subscription) = connection.replace_subscription(None) {
                subscription.stop();
            }
        }
        ctx.workers.clear();
        ctx.transport.stop();
        info!(name = %ctx.config.name, "Data publisher stopped");
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ctx.transport.local_addr()
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.ctx.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PublisherEvent> {
        self.ctx.events.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.ctx.registry.len()
    }

    /// Human-readable indexed list of connected clients.
    pub fn enumerate_clients(&self) -> String {
        let mut listing = String::from("\nIndexed subscriber connection list:\n\n");
        for (index, summary) in self.client_summaries().iter().enumerate() {
            let acronym = summary
                .subscriber
                .as_ref()
                .map_or("unidentified", |s| s.acronym.as_str());
            listing.push_str(&format!(
                "{index:>5}: {} - {}{}{}\n",
                summary.connection_id,
                acronym,
                if summary.authenticated { ", authenticated" } else { "" },
                if summary.subscribed {
                    format!(", subscribed to {} signals", summary.signals)
                } else {
                    String::new()
                },
            ));
        }
        listing
    }

    pub fn client_summaries(&self) -> Vec<ClientSummary> {
        self.ctx.registry.ordered().iter().map(|c| c.summary()).collect()
    }

    /// `(subscriber id, connected, status text)` for a subscriber.
    pub fn get_subscriber_status(&self, subscriber_id: Uuid) -> (Uuid, bool, String) {
        match self.ctx.registry.by_subscriber(&subscriber_id).first() {
            Some(connection) => {
                let summary = connection.summary();
                let status = format!(
                    "Connected from {} since {}; authenticated: {}; subscribed to {} signals",
                    summary.connection_id,
                    summary.connected_at.format("%Y-%m-%d %H:%M:%S"),
                    summary.authenticated,
                    summary.signals,
                );
                (subscriber_id, true, status)
            }
            None => (subscriber_id, false, "Subscriber is not connected.".to_string()),
        }
    }

    /// Subscriber info string of the client at `client_index`.
    pub fn get_subscriber_info(&self, client_index: usize) -> Option<String> {
        self.ctx
            .registry
            .by_index(client_index)
            .ok()
            .and_then(|connection| connection.subscriber_info())
    }

    /// Pushes fresh cipher keys to the client at `client_index`.
    pub fn rotate_cipher_keys(&self, client_index: usize) -> Result<()> {
        let connection = self.ctx.registry.by_index(client_index)?;
        self.ctx.rotate_client_keys(&connection)
    }

    /// Queues a stamped notification for every subscriber and pushes it to
    /// authenticated connections. Returns the notification hash.
    pub fn send_notification(&self, message: &str) -> Result<i32> {
        self.ctx.send_notification(message)
    }

    pub fn reset_lifetime_counters(&self) {
        self.ctx.counters.reset();
        self.ctx.transport.metrics().reset();
        info!("Lifetime counters reset");
    }

    pub fn lifetime_counters(&self) -> LifetimeSnapshot {
        self.ctx.counters.snapshot()
    }

    pub fn transport_metrics(&self) -> MetricsSnapshot {
        self.ctx.transport.metrics().snapshot()
    }

    /// Recomputes authorized signals of every subscription.
    pub async fn update_rights(&self) {
        self.ctx.update_rights().await;
    }

    /// Installs a new catalog, refreshes the TLS trust store and subscriber rights.
    pub async fn update_catalog(&self, catalog: SecurityCatalog) {
        self.ctx.trust_store.replace(catalog.trusted_fingerprints());
        self.ctx.catalog.replace(catalog);
        self.ctx.update_rights().await;
    }

    /// Routes measurements to subscribed clients; returns how many were queued.
    pub fn publish(&self, measurements: &[Measurement]) -> usize {
        let mut queued = 0;
        for (client_id, batch) in self.ctx.routing.route(measurements) {
            let Some(subscription) = self
                .ctx
                .registry
                .get(&client_id)
                .and_then(|connection| connection.subscription())
            else {
                continue;
            };
            let count = batch.len();
            if subscription.queue(batch) {
                queued += count;
            }
        }
        queued
    }

    /// Sends a buffer block to every client subscribed to `signal_id`.
    pub fn publish_buffer_block(&self, signal_id: Uuid, data: &[u8]) -> Result<usize> {
        let mut sent = 0;
        for client_id in self.ctx.routing.clients_for(&signal_id) {
            let Some(subscription) = self
                .ctx
                .registry
                .get(&client_id)
                .and_then(|connection| connection.subscription())
            else {
                continue;
            };
            if subscription.publish_buffer_block(&signal_id, data)?.is_some() {
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Announces that the input source finished processing.
    pub fn signal_processing_complete(&self, source: &str) {
        self.ctx.emit(PublisherEvent::ProcessingComplete {
            source: source.to_string(),
        });
        for connection in self.ctx.registry.ordered() {
            if !connection.is_subscribed() {
                continue;
            }
            let payload = connection.encoding().encode(source);
            if let Err(e) = connection.send_response(
                ServerResponse::ProcessingComplete,
                ServerCommand::Subscribe,
                &payload,
            ) {
                debug!(client = %connection.client_id(), error = %e, "ProcessingComplete not delivered");
            }
        }
        info!(source, "Processing completed");
    }
}

impl PublisherContext {
    /// Payload encryption needs authenticated subscribers to key against.
    pub(crate) fn encryption_enabled(&self) -> bool {
        self.config.encrypt_payload && self.config.require_authentication
    }

    pub(crate) fn emit(&self, event: PublisherEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn status(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{message}");
        self.emit(PublisherEvent::status(message));
    }

    pub(crate) fn process_exception(&self, message: impl Into<String>) {
        let message = message.into();
        error!("{message}");
        self.emit(PublisherEvent::exception(message));
    }

    /// Index cache of the requested signals `subscriber_id` may receive.
    pub(crate) fn authorized_cache(
        &self,
        subscriber_id: Uuid,
        requested: &[SignalReference],
        rights: &dyn RightsSource,
    ) -> SignalIndexCache {
        if !self.config.require_authentication {
            return SignalIndexCache::from_signals(subscriber_id, requested.iter().cloned(), Vec::new());
        }
        let (authorized, unauthorized): (Vec<&SignalReference>, Vec<&SignalReference>) = requested
            .iter()
            .partition(|signal| rights.has_rights(subscriber_id, signal.signal_id));
        if !unauthorized.is_empty() {
            debug!(
                subscriber = %subscriber_id,
                count = unauthorized.len(),
                "Excluded unauthorized signals from subscription"
            );
        }
        SignalIndexCache::from_signals(
            subscriber_id,
            authorized.into_iter().cloned(),
            unauthorized.into_iter().map(|s| s.signal_id).collect(),
        )
    }

    pub(crate) async fn recalculate_routing(&self) {
        self.routing.recalculate(self.registry.subscriptions()).await;
    }

    /// Issues a new key pair to `connection`, then switches it over.
    pub(crate) fn rotate_client_keys(&self, connection: &ClientConnection) -> Result<()> {
        connection.cipher().rotate(|keys| {
            let mut payload = keys.encode_update();
            if let Some(secret) = connection.shared_secret() {
                payload = seal_with_secret(&secret, &payload)?;
            }
            connection.send_response(
                ServerResponse::UpdateCipherKeys,
                ServerCommand::RotateCipherKeys,
                &payload,
            )
        })?;
        debug!(client = %connection.client_id(), "Cipher keys rotated");
        Ok(())
    }

    pub(crate) fn send_pending_notifications(&self, connection: &ClientConnection) {
        let subscriber_id = connection.subscriber_id();
        for (hash, text) in self.notifications.pending(&subscriber_id) {
            let payload = encode_notify(hash, &text, connection.encoding());
            if let Err(e) = connection.send_response(ServerResponse::Notify, ServerCommand::Subscribe, &payload) {
                warn!(client = %connection.client_id(), error = %e, "Failed to send notification");
                break;
            }
        }
    }

    fn send_notification(&self, message: &str) -> Result<i32> {
        let text = stamp_message(message, Utc::now());
        let subscribers: Vec<Uuid> = self
            .catalog
            .current()
            .subscribers
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.id)
            .collect();
        let hash = self.notifications.add_for_all(subscribers, &text)?;

        for connection in self.registry.ordered() {
            if !connection.is_authenticated() {
                continue;
            }
            let payload = encode_notify(hash, &text, connection.encoding());
            if let Err(e) = connection.send_response(ServerResponse::Notify, ServerCommand::Subscribe, &payload) {
                warn!(client = %connection.client_id(), error = %e, "Failed to send notification");
            }
        }
        self.status(format!("Notification sent: {message}"));
        Ok(hash)
    }

    pub(crate) async fn update_rights(&self) {
        if !self.config.require_authentication {
            return;
        }
        let catalog = self.catalog.current();
        for connection in self.registry.ordered() {
            let Some(subscription) = connection.subscription() else {
                continue;
            };
            let requested = subscription.requested_signals();
            let cache = self.authorized_cache(connection.subscriber_id(), &requested, catalog.as_ref());
            let count = cache.len();
            if !subscription.set_signals(requested, cache) {
                continue;
            }
            let result = engine::send_signal_index_cache(self, &connection, &subscription.signal_cache())
                .and_then(|_| {
                    connection.send_status(
                        ServerResponse::Succeeded,
                        ServerCommand::Subscribe,
                        &format!(
                            "Update to authorized signals caused subscription to change. Now subscribed to {count} signals."
                        ),
                    )
                });
            if let Err(e) = result {
                warn!(client = %connection.client_id(), error = %e, "Failed to announce rights change");
            }
        }
        self.recalculate_routing().await;
    }

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::Started { local_addr } => debug!(%local_addr, "Command channel started"),
            ServerEvent::Stopped => debug!("Command channel stopped"),
            ServerEvent::ClientConnected {
                client_id,
                remote_addr,
                certificate,
            } => self.client_connected(client_id, remote_addr, certificate),
            ServerEvent::ClientDisconnected { client_id } => self.client_disconnected(client_id).await,
            ServerEvent::PayloadReceived { client_id, payload } => {
                let delivered = self
                    .workers
                    .get(&client_id)
                    .is_some_and(|worker| worker.send(payload).is_ok());
                if !delivered {
                    debug!(client = %client_id, "Dropped payload for client without a command worker");
                }
            }
            ServerEvent::ReceiveError { client_id, error } => {
                warn!(client = %client_id, error = %error, "Client receive failed")
            }
            ServerEvent::SendError { client_id, error } => {
                warn!(client = %client_id, error = %error, "Client send failed")
            }
            ServerEvent::ListenerError { error } => {
                self.process_exception(format!("Command channel listener failed: {error}"))
            }
        }
    }

    fn client_connected(
        self: &Arc<Self>,
        client_id: Uuid,
        remote_addr: SocketAddr,
        certificate: Option<CertificateFingerprint>,
    ) {
        let connection = self.registry.register(
            client_id,
            remote_addr,
            self.transport.clone(),
            self.counters.clone(),
        );

        if self.config.security_mode == SecurityMode::Tls {
            let catalog = self.catalog.current();
            match certificate.as_ref().and_then(|f| catalog.subscriber_by_fingerprint(f)) {
                Some(subscriber) => {
                    connection.set_subscriber(
                        SubscriberIdentity {
                            id: subscriber.id,
                            acronym: subscriber.acronym.clone(),
                            name: subscriber.name.clone(),
                        },
                        None,
                    );
                    connection.set_authenticated(true);
                    self.status(format!(
                        "Subscriber \"{}\" {} connected with a trusted certificate.",
                        subscriber.acronym,
                        connection.connection_id()
                    ));
                }
                None => warn!(
                    client = %client_id,
                    remote = %remote_addr,
                    "No subscriber is registered for the client certificate"
                ),
            }
        }

        let (worker, inbox) = mpsc::unbounded_channel();
        self.workers.insert(client_id, worker);
        tokio::spawn(command_worker(self.clone(), connection.clone(), inbox));

        self.status(format!("Client connected to command channel from {remote_addr}."));
        if connection.is_authenticated() {
            self.send_pending_notifications(&connection);
        }
    }

    async fn client_disconnected(&self, client_id: Uuid) {
        self.workers.remove(&client_id);
        let Some(connection) = self.registry.remove(&client_id) else {
            return;
        };
        if let Some(subscription) = connection.replace_subscription(None) {
            subscription.stop();
        }
        connection.set_data_channel(None);
        connection.cipher().clear();
        self.recalculate_routing().await;
        self.status(format!(
            "Client {} disconnected from command channel.",
            connection.connection_id()
        ));
    }
}

async fn dispatch(ctx: Arc<PublisherContext>, mut events: mpsc::UnboundedReceiver<ServerEvent>) {
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => ctx.handle_server_event(event).await,
                None => break,
            },
        }
    }
    debug!("Publisher dispatch task exited");
}

async fn command_worker(
    ctx: Arc<PublisherContext>,
    connection: Arc<ClientConnection>,
    mut inbox: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(payload) = inbox.recv().await {
        engine::handle_command(&ctx, &connection, payload).await;
    }
    debug!(client = %connection.client_id(), "Command worker exited");
}

async fn rotate_keys_periodically(ctx: Arc<PublisherContext>) {
    let period = ctx.config.cipher_key_rotation_period();
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer.tick().await;

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = timer.tick() => {
                for connection in ctx.registry.ordered() {
                    if !connection.is_authenticated() {
                        continue;
                    }
                    if let Err(e) = ctx.rotate_client_keys(&connection) {
                        warn!(client = %connection.client_id(), error = %e, "Scheduled cipher key rotation failed");
                    }
                }
            }
        }
    }
}

async fn retransmit_periodically(ctx: Arc<PublisherContext>) {
    let timeout = ctx.config.buffer_block_retransmission_timeout();
    let mut timer = interval((timeout / 2).max(MIN_RETRANSMISSION_CHECK));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = timer.tick() => {
                for subscription in ctx.registry.subscriptions() {
                    let resent = subscription.retransmit_expired(timeout);
                    if resent > 0 {
                        debug!(client = %subscription.client_id(), resent, "Buffer blocks retransmitted");
                    }
                }
            }
        }
    }
}
