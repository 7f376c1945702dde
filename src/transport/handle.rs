//! Application-facing handles to connections owned by the socket task.
//!
//! Handles never touch connection state directly. Every operation is a
//! [`Command`] sent to the socket task, answered over a oneshot.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use super::connection::{ConnectionEvent, ConnectionPhase, DisconnectReason};
use crate::core::{ChannelQualifier, ConnectError, ConnectionError, P2pError, Priority};
use crate::crypto::{Cookie, SharedSecret};

/// Unique id of a connection within its socket.
pub type ConnectionId = u64;

/// Phase and disconnect reason published by the socket task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Status {
    pub(crate) phase: ConnectionPhase,
    pub(crate) reason: Option<DisconnectReason>,
}

/// Requests from handles to the socket task.
#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        peer: SocketAddr,
        reply: oneshot::Sender<Result<Connecting, ConnectError>>,
    },
    ConnectP2p {
        mediator: SocketAddr,
        cookie: Cookie,
        secret: SharedSecret,
        reply: oneshot::Sender<Result<EmiConnection, P2pError>>,
    },
    Send {
        id: ConnectionId,
        channel: ChannelQualifier,
        priority: Priority,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Flush {
        id: ConnectionId,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Close {
        id: ConnectionId,
        timeout: Option<Duration>,
        reply: oneshot::Sender<()>,
    },
    ForceClose {
        id: ConnectionId,
        reply: oneshot::Sender<()>,
    },
}

/// A connection owned by an [`EmiSocket`](super::EmiSocket).
///
/// Dropping the handle does not close the connection.
#[derive(Debug)]
pub struct EmiConnection {
    id: ConnectionId,
    peer: SocketAddr,
    local_addr: SocketAddr,
    commands: mpsc::Sender<Command>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    status: watch::Receiver<Status>,
}

impl EmiConnection {
    pub(crate) fn new(
        id: ConnectionId,
        peer: SocketAddr,
        local_addr: SocketAddr,
        commands: mpsc::Sender<Command>,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        status: watch::Receiver<Status>,
    ) -> Self {
        Self {
            id,
            peer,
            local_addr,
            commands,
            events,
            status,
        }
    }

    /// Queue `data` on `channel` at the default priority.
    pub async fn send(
        &self,
        channel: ChannelQualifier,
        data: impl Into<Vec<u8>>,
    ) -> Result<(), ConnectionError> {
        self.send_with_priority(channel, Priority::default(), data).await
    }

    /// Queue `data` on `channel` at `priority`.
    pub async fn send_with_priority(
        &self,
        channel: ChannelQualifier,
        priority: Priority,
        data: impl Into<Vec<u8>>,
    ) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Send {
            id: self.id,
            channel,
            priority,
            data: data.into(),
            reply,
        })
        .await?;
        rx.await.unwrap_or(Err(ConnectionError::Closed))
    }

    /// Send queued messages and acknowledgements now instead of at the next tick.
    pub async fn flush(&self) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Flush { id: self.id, reply }).await?;
        rx.await.unwrap_or(Err(ConnectionError::Closed))
    }

    /// Start a graceful close. Pending reliable data is delivered first.
    ///
    /// Returns once the close has started; [`closed`](Self::closed) waits for
    /// it to finish. Closing twice is a no-op.
    pub async fn close(&self) {
        self.close_with(None).await;
    }

    /// Graceful close that turns into [`force_close`](Self::force_close)
    /// after `timeout`.
    pub async fn close_or_force_close(&self, timeout: Duration) {
        self.close_with(Some(timeout)).await;
    }

    /// Close immediately, discarding unsent and unacknowledged data.
    pub async fn force_close(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .request(Command::ForceClose { id: self.id, reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Wait until the connection is closed and return why.
    pub async fn closed(&self) -> DisconnectReason {
        let mut status = self.status.clone();
        let reason = match status.wait_for(|s| s.phase == ConnectionPhase::Closed).await {
            Ok(s) => s.reason,
            Err(_) => None,
        };
        // A vanished socket task force-closed everything.
        reason.unwrap_or(DisconnectReason::ThisHostClosed)
    }

    /// Next event. Returns `None` after `Disconnected` has been delivered.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    /// Next event if one is ready.
    pub fn try_next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.try_recv().ok()
    }

    /// Current phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.status.borrow().phase
    }

    /// Why the connection closed, once it has.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.status.borrow().reason
    }

    /// Established (`Open` or `Lost`).
    pub fn is_open(&self) -> bool {
        matches!(self.phase(), ConnectionPhase::Open | ConnectionPhase::Lost)
    }

    /// Still waiting for the peer to accept.
    pub fn is_opening(&self) -> bool {
        self.phase() == ConnectionPhase::Opening
    }

    /// Connection id, unique within the socket.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Local socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Local port.
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Peer port.
    pub fn remote_port(&self) -> u16 {
        self.peer.port()
    }

    async fn close_with(&self, timeout: Option<Duration>) {
        let (reply, rx) = oneshot::channel();
        let command = Command::Close {
            id: self.id,
            timeout,
            reply,
        };
        if self.request(command).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn request(&self, command: Command) -> Result<(), ConnectionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ConnectionError::Closed)
    }
}

/// An outbound connection waiting for the peer to accept.
#[derive(Debug)]
pub struct Connecting {
    connection: EmiConnection,
    opened: oneshot::Receiver<Result<(), ConnectError>>,
}

impl Connecting {
    pub(crate) fn new(
        connection: EmiConnection,
        opened: oneshot::Receiver<Result<(), ConnectError>>,
    ) -> Self {
        Self { connection, opened }
    }

    /// The connection while it is opening. Closing it cancels the connect.
    pub fn connection(&self) -> &EmiConnection {
        &self.connection
    }

    /// Wait for the connect to complete.
    pub async fn established(self) -> Result<EmiConnection, ConnectError> {
        match self.opened.await {
            Ok(Ok(())) => Ok(self.connection),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ConnectError::SocketClosed),
        }
    }
}

/// Stream of connections accepted by a listening socket.
#[derive(Debug)]
pub struct Incoming {
    rx: mpsc::Receiver<EmiConnection>,
}

impl Incoming {
    pub(crate) fn new(rx: mpsc::Receiver<EmiConnection>) -> Self {
        Self { rx }
    }

    /// Next accepted connection. Returns `None` once the socket is closed.
    pub async fn accept(&mut self) -> Option<EmiConnection> {
        self.rx.recv().await
    }
}
