//! EMI - Transport Layer
//!
//! Reliable, multiplexed connections over a single UDP socket:
//!
//! - **Wire format**: [`Packet`], [`Message`] and their flag types
//! - **Connection state machine**: [`Connection`], a sans-IO machine driven by
//!   explicit timestamps
//! - **Reliability**: per-channel sender and receiver buffers, RTT estimation
//!   ([`RttEstimator`]), retransmission backoff and congestion control
//!   ([`CongestionController`])
//! - **Socket task**: [`EmiSocket`] owns the UDP socket and every connection on
//!   it; applications hold [`EmiConnection`] handles
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------+
//! |   EmiConnection handles (application)     |
//! +-------------------------------------------+
//! |   EmiSocket task: demux, timers, pacing   |  <- endpoint
//! +-------------------------------------------+
//! |   Connection: handshake, channels, acks   |  <- connection, buffers
//! +-------------------------------------------+
//! |   Packet / Message codec                  |  <- frame
//! +-------------------------------------------+
//! |                  UDP                      |
//! +-------------------------------------------+
//! ```

mod buffers;
mod config;
mod connection;
mod endpoint;
mod frame;
mod handle;
mod pacing;
mod resolve;
mod socket;
mod timing;

pub use buffers::{ReceiverBuffer, SenderBuffer, seq_gt, seq_le};
pub use config::{ConnectionParams, MAX_MTU, SocketConfig, SocketConfigBuilder};
pub use connection::{
    Connection, ConnectionEvent, ConnectionKind, ConnectionPhase, DisconnectReason,
};
pub use endpoint::EmiSocket;
pub use frame::{
    FrameError, Message, MessageFlags, MessageKind, Packet, PacketFlags, PacketHeader,
    is_rendezvous, sizes,
};
pub use handle::{Connecting, ConnectionId, EmiConnection, Incoming};
pub use pacing::{
    CongestionController, Liveness, PacketDropper, RateLimiter, RetransmitController,
};
pub use resolve::{Resolve, SystemResolver};
pub use socket::{DEFAULT_RECV_BUFFER_SIZE, DatagramSocket};
pub use timing::{RttEstimator, TimestampTracker, constants as timing_constants};
