//! ---
//! bus_section: "02-messaging-ipc-data-model"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Bus client and protocol layers over a retained pub/sub transport."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Connection management, presence, retained metadata, RPC and component
//! channels built on a retained publish/subscribe transport.

use std::time::Duration;

pub mod broker;
pub mod channels;
pub mod client;
pub mod logging;
pub mod metadata;
pub mod presence;
pub mod rpc;
pub mod topic;
pub mod transport;

/// Shared result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors surfaced by the bus layers.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Publish attempted while offline with offline queueing disabled.
    #[error("client is offline")]
    Offline,
    /// Transport level failure.
    #[error("connection error: {0}")]
    Connection(String),
    /// A handler is already registered for the member.
    #[error("member '{member}' of component '{component}' already has a handler")]
    DuplicateMember {
        /// Member name.
        member: String,
        /// Component id.
        component: String,
    },
    /// An RPC service is already registered at the address.
    #[error("rpc service '{address}' is already registered")]
    DuplicateService {
        /// Service address.
        address: String,
    },
    /// Metadata path absent from a remote view.
    #[error("instance '{instance}' has no metadata at '{path}'")]
    UnknownPath {
        /// Remote instance.
        instance: String,
        /// Metadata path.
        path: String,
    },
    /// No RPC service registered at the address.
    #[error("rpc service '{address}' is not registered")]
    UnknownService {
        /// Service address.
        address: String,
    },
    /// No reply arrived within the call timeout.
    #[error("rpc call to '{address}' on '{topic}' timed out after {timeout:?}")]
    RpcTimeout {
        /// Service address.
        address: String,
        /// Request topic.
        topic: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// The remote service answered with an error envelope.
    #[error("remote service failed: {message}")]
    RpcRemote {
        /// Remote error message.
        message: String,
        /// Remote error chain.
        stacktrace: String,
    },
    /// A value did not satisfy its declared type.
    #[error(transparent)]
    TypeValidation(#[from] r_bus_types::TypeValidationError),
    /// Payload codec failure.
    #[error(transparent)]
    Codec(#[from] r_bus_types::CodecError),
    /// JSON conversion failure.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub use broker::InMemoryBroker;
pub use channels::{LocalComponentChannel, RemoteComponentChannel};
pub use client::{Client, ClientEvent, Subscription};
pub use logging::{log_message, MessageDirection, MessagingMetrics, MessagingMetricsExporter};
pub use metadata::{MetadataStore, RemoteView, ViewChange};
pub use presence::{Presence, PresenceEvent};
pub use rpc::{RemoteFault, RpcClient, RpcRequest, RpcResponse, RpcServer, RpcService};
pub use transport::{
    BusMessage, ConnectOptions, LastWill, Session, Transport, TransportEvent, TransportLink,
};
