//! # EMI
//!
//! A reliable, multiplexed transport over UDP.
//!
//! EMI carries many independent message channels over one connection, each
//! with its own delivery class:
//!
//! - **Unreliable**: delivered as received
//! - **Unreliable sequenced**: stale arrivals are dropped
//! - **Reliable sequenced**: only the newest message is retransmitted
//! - **Reliable ordered**: every message, exactly once, in order
//!
//! On top of that it detects lost and regained peers through heartbeats, paces
//! outgoing traffic, and establishes peer-to-peer connections between hosts
//! behind NAT through a mediator.
//!
//! ## Feature Flags
//!
//! - `transport` (default): sockets, connections, wire format and P2P
//! - `crypto` (default): rendezvous cookies and handshake authentication
//!
//! ## Modules
//!
//! - [`core`]: constants, channel qualifiers and error types (always included)
//! - [`transport`]: the socket task and connection state machine
//! - [`p2p`]: mediator and rendezvous
//! - [`crypto`]: cookies, shared secrets and handshake tags
//!
//! ## Example Usage
//!
//! ```no_run
//! use eminet::prelude::*;
//!
//! # async fn run() -> Result<(), EmiError> {
//! let config = SocketConfig::builder().accept_connections(true).port(4500).build()?;
//! let (_socket, mut incoming) = EmiSocket::open(config).await?;
//!
//! while let Some(mut conn) = incoming.accept().await {
//!     tokio::spawn(async move {
//!         while let Some(event) = conn.next_event().await {
//!             if let ConnectionEvent::Message { channel, data } = event {
//!                 let _ = conn.send(channel, data).await;
//!             }
//!         }
//!     });
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Transport layer (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

// Rendezvous (rides on the transport)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod p2p;

// Crypto layer (feature-gated)
#[cfg(feature = "crypto")]
#[cfg_attr(docsrs, doc(cfg(feature = "crypto")))]
pub mod crypto;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{
        ChannelQualifier, ChannelType, ConfigError, ConnectError, ConnectionError, EmiError,
        P2pError, Priority, RendezvousFailure,
    };

    #[cfg(feature = "transport")]
    pub use crate::transport::{
        Connecting, ConnectionEvent, ConnectionPhase, DisconnectReason, EmiConnection,
        EmiSocket, Incoming, SocketConfig, SocketConfigBuilder, SystemResolver,
    };

    #[cfg(feature = "transport")]
    pub use crate::p2p::{MediatorConfig, MediatorSocket};

    #[cfg(feature = "crypto")]
    pub use crate::crypto::{Cookie, SharedSecret};
}

// Re-export commonly used items at crate root
pub use core::{ChannelQualifier, ChannelType, EmiError, Priority};

#[cfg(feature = "transport")]
pub use transport::{
    ConnectionEvent, ConnectionPhase, DisconnectReason, EmiConnection, EmiSocket, SocketConfig,
};

#[cfg(feature = "transport")]
pub use p2p::{MediatorConfig, MediatorSocket};
