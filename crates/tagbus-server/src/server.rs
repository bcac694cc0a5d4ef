//! Tag bus WebSocket server implementation.
//!
//! This module provides the WebSocket transport that handles:
//! - Client connections
//! - Hello message on connect
//! - subscribeTag / unsubscribeTag / app_call requests with acks
//! - tagChanged delivery
//! - Subscription teardown on disconnect

use std::net::SocketAddr;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use tagbus_core::config::DEFAULT_PORT;
use tagbus_core::{BusError, ClientId, ConnectionKind, SubscriptionHandle, TagChanged};
use tagbus_protocol::{
    decode_client_message, encode_server_message, AckMessage, ClientMessage, CodecError,
    HelloMessage, ServerMessage,
};

use crate::bus::BusHandle;
use crate::subscription::Delivery;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Errors raised by the WebSocket transport.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Configuration for the WebSocket server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server name sent in Hello message.
    pub name: String,
    /// Version sent in Hello message.
    pub version: String,
    /// Address to bind to.
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "tagbus".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
        }
    }
}

/// The tag bus WebSocket server.
pub struct TagBusServer {
    config: ServerConfig,
    bus: BusHandle,
}

impl TagBusServer {
    /// Create a server that serves `bus` with the given configuration.
    pub fn new(config: ServerConfig, bus: BusHandle) -> Self {
        Self { config, bus }
    }

    /// Run the server, listening for WebSocket connections.
    pub async fn run(self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Tag bus server listening on {}", self.config.bind_addr);

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let config = self.config.clone();
                    let bus = self.bus.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, config, bus).await {
                            error!("Connection error from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: ServerConfig,
    bus: BusHandle,
) -> Result<(), ServerError> {
    info!("New connection from {}", addr);

    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, ws_rx) = ws_stream.split();

    let client = bus
        .connect(ConnectionKind::Remote {
            peer: addr.to_string(),
        })
        .await?;

    // Send Hello message
    let hello = HelloMessage::new(&config.name, &config.version, client.to_string());
    let hello_msg = encode_server_message(&ServerMessage::Hello(hello))?;

    let result = match ws_tx.send(Message::Text(hello_msg)).await {
        Ok(()) => {
            debug!("Sent Hello to {}", addr);
            serve_client(addr, client, &bus, &mut ws_tx, ws_rx).await
        }
        Err(e) => Err(e.into()),
    };

    // Subscriptions go away with the connection, however it ended.
    bus.disconnect(client);
    result
}

async fn serve_client(
    addr: SocketAddr,
    client: ClientId,
    bus: &BusHandle,
    ws_tx: &mut WsSink,
    mut ws_rx: futures::stream::SplitStream<WebSocketStream<TcpStream>>,
) -> Result<(), ServerError> {
    let (changes_tx, mut changes_rx) = mpsc::unbounded_channel::<TagChanged>();

    loop {
        tokio::select! {
            // Handle incoming messages from client
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_client_message(&text, client, bus, &changes_tx, ws_tx).await {
                            warn!("Error handling message from {}: {}", addr, e);
                            if matches!(e, ServerError::WebSocket(_) | ServerError::Bus(BusError::Closed)) {
                                return Err(e);
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("Ignoring message from {}: {}", addr, CodecError::BinaryFrame);
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} closed connection", addr);
                        return Ok(());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_tx.send(Message::Pong(data)).await?;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", addr, e);
                        return Ok(());
                    }
                    None => {
                        info!("Client {} disconnected", addr);
                        return Ok(());
                    }
                    _ => {} // Ignore other message types
                }
            }

            // Forward changes delivered by the bus
            change = changes_rx.recv() => {
                let Some(change) = change else {
                    return Ok(());
                };
                let msg = encode_server_message(&ServerMessage::tag_changed(&change))?;
                if let Err(e) = ws_tx.send(Message::Text(msg)).await {
                    error!("Failed to send tagChanged to {}: {}", addr, e);
                    return Ok(());
                }
            }
        }
    }
}

/// Handle a message received from a client.
///
/// The ack is written before returning, so replayed values queued by a
/// subscribe always follow it on the socket.
async fn handle_client_message(
    text: &str,
    client: ClientId,
    bus: &BusHandle,
    changes_tx: &mpsc::UnboundedSender<TagChanged>,
    ws_tx: &mut WsSink,
) -> Result<(), ServerError> {
    let msg = decode_client_message(text)?;

    let ack = match msg {
        ClientMessage::SubscribeTag { tagid, ack_id } => {
            let handle = bus
                .subscribe(client, &tagid, Delivery::Channel(changes_tx.clone()))
                .await?;
            ack_id.map(|id| AckMessage::subscribed(id, handle))
        }
        ClientMessage::UnsubscribeTag {
            tagid,
            handle,
            ack_id,
        } => {
            match SubscriptionHandle::parse(&handle) {
                Some(parsed) => {
                    bus.unsubscribe(client, parsed).await?;
                }
                None => debug!("Unsubscribe from {} with unknown handle {}", tagid, handle),
            }
            ack_id.map(|id| AckMessage::unsubscribed(id, &handle))
        }
        ClientMessage::AppCall { name, data, ack_id } => {
            let result = bus.app_call(&name, data).await;
            ack_id.map(|id| AckMessage::call_result(id, &result))
        }
    };

    if let Some(ack) = ack {
        let msg = encode_server_message(&ServerMessage::Ack(ack))?;
        ws_tx.send(Message::Text(msg)).await?;
    }

    Ok(())
}
