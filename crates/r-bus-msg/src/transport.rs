//! ---
//! bus_section: "02-messaging-ipc-data-model"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Bus client and protocol layers over a retained pub/sub transport."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Result;

/// Message as delivered by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Full topic.
    pub topic: String,
    /// Raw payload; empty means tombstone.
    pub payload: Bytes,
    /// Set when replayed from the retained store on subscribe.
    pub retained: bool,
}

impl BusMessage {
    /// Whether the payload is empty.
    pub fn is_tombstone(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Message the broker publishes on unclean connection loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    /// Will topic.
    pub topic: String,
    /// Will payload.
    pub payload: Bytes,
    /// Whether the will is retained.
    pub retain: bool,
}

/// Parameters of a transport connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Client identifier; reused identifiers take over the older session.
    pub client_id: String,
    /// Optional last will.
    pub will: Option<LastWill>,
}

/// Inbound transport activity, consumed in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A published or retained message.
    Message(BusMessage),
    /// Subscription to the pattern acknowledged; retained matches precede it.
    SubAck(String),
    /// Connection lost.
    Closed,
}

/// Outbound half of an open connection.
pub trait Session: Send + Sync {
    /// Publish a payload; an empty retained payload deletes the retained entry.
    fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()>;
    /// Request a subscription; completion is signalled by [`TransportEvent::SubAck`].
    fn subscribe(&self, pattern: &str) -> Result<()>;
    /// Drop a subscription.
    fn unsubscribe(&self, pattern: &str) -> Result<()>;
    /// Disconnect cleanly without publishing the last will.
    fn close(&self) -> Result<()>;
    /// Whether the transport still holds the connection. Turns false as soon
    /// as the link drops, before [`TransportEvent::Closed`] is consumed.
    fn is_open(&self) -> bool;
}

/// Open connection: outbound session plus inbound event stream.
pub struct TransportLink {
    /// Outbound operations.
    pub session: Arc<dyn Session>,
    /// Inbound events.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Transport abstraction used by the bus client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection.
    async fn open(&self, options: ConnectOptions) -> Result<TransportLink>;
    /// Human-readable transport name for logging/metrics.
    fn name(&self) -> &'static str;
}
