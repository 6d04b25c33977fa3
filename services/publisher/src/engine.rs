//! Session protocol engine
//!
//! Interprets one command payload (`[command][body]`) for one connection.
//! Every failure a command can hit is answered with a Failed status; nothing
//! here can end the client's command worker or affect other clients.
//!
//! Gating: DefineOperationalModes and Authenticate are always handled. When
//! authentication is required, every other known command from an
//! unauthenticated connection is refused.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use gateway_codec::compression::gzip;
use gateway_codec::connection_string::parse_list;
use gateway_codec::{
    ConnectionSettings, MetadataSet, MetadataTable, OperationalModes, ServerCommand, ServerResponse,
    SignalIndexCache, SignalReference,
};
use gateway_config::SecurityMode;
use gateway_network::UdpDataChannel;
use tracing::{debug, info, warn};

use crate::catalog::RightsSource;
use crate::cipher::open_auth_token;
use crate::error::Result;
use crate::events::PublisherEvent;
use crate::publisher::PublisherContext;
use crate::registry::{ClientConnection, SubscriberIdentity};
use crate::subscription::{
    PacketSink, Subscription, SubscriptionMode, SubscriptionSettings, DEFAULT_LAG_TIME,
};

const SUBSCRIBE_SYNCHRONIZED: u8 = 0x01;
const SUBSCRIBE_COMPACT: u8 = 0x02;

const MIN_AUTH_TOKEN: i32 = 16;
const MAX_AUTH_TOKEN: i32 = 256;

/// Handles one command payload received from `connection`.
pub(crate) async fn handle_command(
    ctx: &Arc<PublisherContext>,
    connection: &Arc<ClientConnection>,
    payload: Bytes,
) {
    let Some((&code, body)) = payload.split_first() else {
        warn!(client = %connection.client_id(), "Received empty command payload");
        return;
    };
    let command = ServerCommand::from_byte(code);
    debug!(client = %connection.client_id(), %command, bytes = body.len(), "Command received");

    if let Err(e) = dispatch(ctx, connection, command, body).await {
        ctx.process_exception(format!(
            "Failed to process {} request from {}: {e}",
            command.name(),
            connection.connection_id()
        ));
        let message = format!("Failed to process {} request due to exception: {e}", command.name());
        if let Err(send_error) = connection.send_status(ServerResponse::Failed, command, &message) {
            debug!(client = %connection.client_id(), error = %send_error, "Failure response not delivered");
        }
    }
}

async fn dispatch(
    ctx: &Arc<PublisherContext>,
    connection: &Arc<ClientConnection>,
    command: ServerCommand,
    body: &[u8],
) -> Result<()> {
    match command {
        ServerCommand::DefineOperationalModes => {
            define_operational_modes(connection, body);
            return Ok(());
        }
        ServerCommand::Authenticate => return authenticate(ctx, connection, body),
        ServerCommand::Unknown(code) => {
            let message = format!("Client sent an unrecognized server command: 0x{code:02X}");
            warn!(client = %connection.client_id(), "{message}");
            return connection.send_status(ServerResponse::Failed, command, &message);
        }
        _ => {}
    }

    if ctx.config.require_authentication && !connection.is_authenticated() {
        let message = format!("Subscriber not authenticated - {} request denied.", command.name());
        warn!(client = %connection.client_id(), "{message}");
        return connection.send_status(ServerResponse::Failed, command, &message);
    }

    match command {
        ServerCommand::Subscribe => subscribe(ctx, connection, body).await,
        ServerCommand::Unsubscribe => unsubscribe(ctx, connection).await,
        ServerCommand::MetadataRefresh => metadata_refresh(ctx, connection).await,
        ServerCommand::RotateCipherKeys => rotate_cipher_keys(ctx, connection),
        ServerCommand::UpdateProcessingInterval => update_processing_interval(connection, body),
        ServerCommand::ConfirmNotification => {
            confirm_notification(ctx, connection, body);
            Ok(())
        }
        ServerCommand::ConfirmBufferBlock => {
            confirm_buffer_block(connection, body);
            Ok(())
        }
        ServerCommand::DefineOperationalModes | ServerCommand::Authenticate | ServerCommand::Unknown(_) => Ok(()),
    }
}

fn read_i32(body: &[u8]) -> Option<i32> {
    (body.len() >= 4).then(|| (&body[..4]).get_i32())
}

fn read_u32(body: &[u8]) -> Option<u32> {
    (body.len() >= 4).then(|| (&body[..4]).get_u32())
}

fn define_operational_modes(connection: &ClientConnection, body: &[u8]) {
    let Some(raw) = read_u32(body) else {
        warn!(client = %connection.client_id(), "Not enough buffer was provided to define operational modes");
        return;
    };
    let modes = OperationalModes::from_wire(raw);
    if modes.version() != 0 {
        warn!(
            client = %connection.client_id(),
            version = modes.version(),
            "Client requested an unsupported protocol version, continuing with version 0 semantics"
        );
    }
    connection.set_modes(modes);
    debug!(
        client = %connection.client_id(),
        modes = format_args!("0x{raw:08X}"),
        encoding = modes.encoding().name(),
        "Operational modes defined"
    );
}

fn authenticate(ctx: &PublisherContext, connection: &ClientConnection, body: &[u8]) -> Result<()> {
    let command = ServerCommand::Authenticate;
    let fail = |message: &str| {
        warn!(client = %connection.client_id(), "{message}");
        connection.send_status(ServerResponse::Failed, command, message)
    };

    if ctx.config.security_mode == SecurityMode::Tls {
        return fail("WARNING: Received authentication request from client while running in TLS mode.");
    }

    connection.set_authenticated(false);
    let conn = connection.connection_id();
    let catalog = ctx.catalog.current();
    let Some(subscriber) = catalog.subscriber_by_ip(connection.remote_addr().ip()) else {
        return fail(&format!(
            "No subscriber is registered for {conn}, cannot authenticate connection - Authenticate request denied."
        ));
    };

    let Some(length) = read_i32(body) else {
        return fail("Not enough buffer was provided to parse client request.");
    };
    if !(MIN_AUTH_TOKEN..=MAX_AUTH_TOKEN).contains(&length) {
        return fail(&format!(
            "Received request packet with an unexpected size from {conn} - Authenticate request denied."
        ));
    }
    let Some(token) = body.get(4..4 + length as usize) else {
        return fail("Not enough buffer was provided to parse client request.");
    };

    let matched = match open_auth_token(&subscriber.shared_secret, token, connection.encoding()) {
        Ok(key) => key == subscriber.auth_key,
        Err(e) => {
            debug!(client = %connection.client_id(), error = %e, "Authentication token did not decrypt");
            false
        }
    };
    if !matched {
        return fail("Subscriber authentication failed - Authenticate request denied.");
    }

    let name = if subscriber.name.is_empty() {
        subscriber.acronym.clone()
    } else {
        subscriber.name.clone()
    };
    connection.set_subscriber(
        SubscriberIdentity {
            id: subscriber.id,
            acronym: subscriber.acronym.clone(),
            name: name.clone(),
        },
        Some(subscriber.shared_secret.clone()),
    );
    connection.set_authenticated(true);

    let message = format!("Registered subscriber \"{name}\" {conn} was successfully authenticated.");
    connection.send_status(ServerResponse::Succeeded, command, &message)?;
    ctx.status(message);
    ctx.send_pending_notifications(connection);
    Ok(())
}

async fn subscribe(ctx: &Arc<PublisherContext>, connection: &Arc<ClientConnection>, body: &[u8]) -> Result<()> {
    let command = ServerCommand::Subscribe;
    let fail = |message: &str| {
        warn!(client = %connection.client_id(), "{message}");
        connection.send_status(ServerResponse::Failed, command, message)
    };

    if body.len() < 5 {
        return fail("Not enough buffer was provided to parse client data subscription.");
    }
    let flags = body[0];
    let synchronized = flags & SUBSCRIBE_SYNCHRONIZED != 0;
    let compact = flags & SUBSCRIBE_COMPACT != 0;

    if synchronized && !ctx.config.allow_synchronized_subscription {
        return fail(
            "Client request for remotely synchronized data subscription was denied. Data publisher is currently configured to deny synchronized subscriptions.",
        );
    }

    let length = (&body[1..5]).get_i32();
    if length <= 0 {
        return fail("Cannot initialize client data subscription without a connection string.");
    }
    let Some(text) = body.get(5..5 + length as usize) else {
        return fail("Not enough buffer was provided to parse client data subscription.");
    };

    let mode = if synchronized {
        SubscriptionMode::Synchronized
    } else {
        SubscriptionMode::Unsynchronized
    };

    match establish_subscription(ctx, connection, mode, compact, text).await {
        Ok(()) => Ok(()),
        Err(e) => fail(&format!(
            "Failed to process client data subscription due to exception: {e}"
        )),
    }
}

async fn establish_subscription(
    ctx: &Arc<PublisherContext>,
    connection: &Arc<ClientConnection>,
    mode: SubscriptionMode,
    compact: bool,
    text: &[u8],
) -> Result<()> {
    let encoding = connection.encoding();
    let settings = ConnectionSettings::parse(&encoding.decode(text)?)?;
    let modes = connection.modes();

    let keys = settings.get("inputMeasurementKeys").map(parse_list).unwrap_or_default();
    let processing_interval = settings.get_parsed::<i32>("processingInterval")?.unwrap_or(-1);
    let use_base_time_offsets =
        ctx.config.use_base_time_offsets && settings.get_bool("useBaseTimeOffsets").unwrap_or(false);
    let lag_time = match settings.get_parsed::<f64>("lagTime")? {
        Some(seconds) if seconds.is_finite() && seconds >= 0.0 => Duration::from_secs_f64(seconds),
        _ => DEFAULT_LAG_TIME,
    };
    let data_channel_port = match settings.get_nested("dataChannel")? {
        Some(nested) => nested.get_parsed::<u16>("port")?,
        None => None,
    };
    let compression_strength = (ctx.config.allow_payload_compression
        && modes.gzip_enabled_for(OperationalModes::COMPRESS_PAYLOAD_DATA))
    .then(|| ctx.config.gzip_level());

    let subscription_settings = SubscriptionSettings {
        compact,
        compression_strength,
        processing_interval,
        use_base_time_offsets,
        lag_time,
    };

    let subscription = match connection.subscription() {
        Some(existing) if existing.mode() == mode => {
            existing.reconfigure(subscription_settings);
            existing
        }
        previous => {
            if let Some(previous) = previous {
                previous.stop();
                debug!(client = %connection.client_id(), from = previous.mode().name(), to = mode.name(), "Subscription mode changed");
            }
            let sink: Arc<dyn PacketSink> = connection.clone();
            let created = Subscription::new(
                connection.client_id(),
                mode,
                subscription_settings,
                sink,
                ctx.counters.clone(),
            );
            connection.replace_subscription(Some(created.clone()));
            created
        }
    };

    let catalog = ctx.catalog.current();
    let requested: Vec<SignalReference> = catalog
        .resolve_keys(&keys)
        .into_iter()
        .map(|record| SignalReference {
            signal_id: record.signal_id,
            source: record.source.clone(),
            id: record.id,
        })
        .collect();
    let cache = ctx.authorized_cache(connection.subscriber_id(), &requested, catalog.as_ref());
    let signal_count = cache.len();
    subscription.set_signals(requested, cache);

    match data_channel_port {
        Some(port) => {
            let target = SocketAddr::new(connection.remote_addr().ip(), port);
            let channel = UdpDataChannel::connect(target, ctx.transport.metrics().clone()).await?;
            connection.set_data_channel(Some(Arc::new(channel)));
        }
        None => connection.set_data_channel(None),
    }

    connection.set_subscriber_info(settings.get("assemblyInfo").map(str::to_string));
    connection.set_subscribed(true);

    let format = if compact { "compact" } else { "full" };
    let message = if keys.is_empty() {
        format!(
            "Client subscribed as {format} {}, but no signals were specified. Make sure \"inputMeasurementKeys\" setting is properly defined.",
            mode.name()
        )
    } else {
        format!("Client subscribed as {format} {} with {signal_count} signals.", mode.name())
    };

    connection.send_status(ServerResponse::Succeeded, ServerCommand::Subscribe, &message)?;
    send_signal_index_cache(ctx, connection, &subscription.signal_cache())?;
    subscription.start();
    ctx.recalculate_routing().await;

    if connection.is_authenticated() && ctx.encryption_enabled() {
        ctx.rotate_client_keys(connection)?;
    }

    ctx.emit(PublisherEvent::ClientConnected {
        subscriber_id: connection.subscriber_id(),
        connection_id: connection.connection_id().to_string(),
        subscriber_info: connection.subscriber_info(),
    });
    info!(client = %connection.client_id(), "{message}");
    Ok(())
}

/// Serializes and pushes the connection's signal index cache.
pub(crate) fn send_signal_index_cache(
    ctx: &PublisherContext,
    connection: &ClientConnection,
    cache: &SignalIndexCache,
) -> Result<()> {
    let modes = connection.modes();
    let image = if modes.uses_common_serialization() {
        cache.to_binary_image(modes.encoding())
    } else {
        cache.to_native()?
    };
    let payload = if modes.gzip_enabled_for(OperationalModes::COMPRESS_SIGNAL_INDEX_CACHE) {
        gzip(&image, ctx.config.gzip_level())?
    } else {
        image
    };
    connection.send_response(
        ServerResponse::UpdateSignalIndexCache,
        ServerCommand::Subscribe,
        &payload,
    )
}

async fn unsubscribe(ctx: &PublisherContext, connection: &ClientConnection) -> Result<()> {
    if let Some(subscription) = connection.replace_subscription(None) {
        subscription.stop();
    }
    connection.set_subscribed(false);
    connection.set_data_channel(None);
    ctx.recalculate_routing().await;
    connection.send_status(ServerResponse::Succeeded, ServerCommand::Unsubscribe, "Client unsubscribed.")?;
    info!(client = %connection.client_id(), "Client unsubscribed");
    Ok(())
}

async fn metadata_refresh(ctx: &PublisherContext, connection: &ClientConnection) -> Result<()> {
    let command = ServerCommand::MetadataRefresh;
    match build_metadata(ctx, connection).await {
        Ok(payload) => {
            connection.send_response(ServerResponse::Succeeded, command, &payload)?;
            debug!(client = %connection.client_id(), bytes = payload.len(), "Metadata transferred");
            Ok(())
        }
        Err(e) => {
            let message = format!("Failed to transfer meta-data due to exception: {e}");
            warn!(client = %connection.client_id(), "{message}");
            connection.send_status(ServerResponse::Failed, command, &message)
        }
    }
}

async fn build_metadata(ctx: &PublisherContext, connection: &ClientConnection) -> Result<Vec<u8>> {
    let catalog = ctx.catalog.current();
    let subscriber_id = connection.subscriber_id();
    let mut set = MetadataSet::default();

    for expression in ctx.config.metadata_expressions() {
        let mut table = match ctx.metadata.query(&expression).await {
            Ok(table) => table,
            Err(e) => {
                warn!(expression = %expression, error = %e, "Skipping metadata expression");
                continue;
            }
        };
        filter_metadata(ctx, &mut table, subscriber_id, catalog.as_ref());
        set.tables.push(table);
    }

    let modes = connection.modes();
    let image = if modes.uses_common_serialization() {
        set.to_binary_image(modes.encoding())
    } else {
        set.to_native()?
    };
    if modes.gzip_enabled_for(OperationalModes::COMPRESS_METADATA) {
        Ok(gzip(&image, ctx.config.gzip_level())?)
    } else {
        Ok(image)
    }
}

/// Keeps local-node rows unless the database is shared, and authorized signal rows.
fn filter_metadata(
    ctx: &PublisherContext,
    table: &mut MetadataTable,
    subscriber_id: uuid::Uuid,
    rights: &dyn RightsSource,
) {
    if !ctx.config.shared_database {
        if let Some(column) = table.column_index("NodeID") {
            let node_id = ctx.config.node_id;
            table.retain_rows(|row| row[column].as_guid() == Some(node_id));
        }
    }
    if ctx.config.require_authentication {
        if let Some(column) = table.column_index("SignalID") {
            table.retain_rows(|row| {
                row[column]
                    .as_guid()
                    .is_some_and(|signal_id| rights.has_rights(subscriber_id, signal_id))
            });
        }
    }
}

fn rotate_cipher_keys(ctx: &PublisherContext, connection: &ClientConnection) -> Result<()> {
    ctx.rotate_client_keys(connection)?;
    connection.send_status(
        ServerResponse::Succeeded,
        ServerCommand::RotateCipherKeys,
        "New cipher keys rotated.",
    )
}

fn update_processing_interval(connection: &ClientConnection, body: &[u8]) -> Result<()> {
    let command = ServerCommand::UpdateProcessingInterval;
    let Some(interval) = read_i32(body) else {
        return connection.send_status(
            ServerResponse::Failed,
            command,
            "Not enough buffer was provided to update client processing interval.",
        );
    };
    let Some(subscription) = connection.subscription() else {
        return connection.send_status(
            ServerResponse::Failed,
            command,
            "Client subscription was not available, could not update processing interval.",
        );
    };
    subscription.set_processing_interval(interval);
    let message = format!("New processing interval of {interval} assigned.");
    info!(client = %connection.client_id(), "{message}");
    connection.send_status(ServerResponse::Succeeded, command, &message)
}

fn confirm_notification(ctx: &PublisherContext, connection: &ClientConnection, body: &[u8]) {
    let Some(hash) = read_i32(body) else {
        warn!(client = %connection.client_id(), "Not enough buffer was provided to confirm notification");
        return;
    };
    match ctx.notifications.confirm(&connection.subscriber_id(), hash) {
        Ok(true) => debug!(client = %connection.client_id(), hash, "Notification confirmed"),
        Ok(false) => warn!(client = %connection.client_id(), hash, "Confirmed notification was not found"),
        Err(e) => warn!(client = %connection.client_id(), error = %e, "Failed to persist notifications"),
    }
}

fn confirm_buffer_block(connection: &ClientConnection, body: &[u8]) {
    let Some(sequence) = read_u32(body) else {
        warn!(client = %connection.client_id(), "Not enough buffer was provided to confirm buffer block");
        return;
    };
    match connection.subscription() {
        Some(subscription) => {
            if !subscription.confirm_buffer_block(sequence) {
                debug!(client = %connection.client_id(), sequence, "Buffer block was already confirmed");
            }
        }
        None => warn!(client = %connection.client_id(), sequence, "Buffer block confirmed without a subscription"),
    }
}
