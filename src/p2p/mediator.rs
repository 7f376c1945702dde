//! Rendezvous mediator.
//!
//! The mediator never carries application data. It mints cookies and shared
//! secrets, pairs the two registrants of a session and tells each the other's
//! inner and outer endpoints.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, trace, warn};

use super::message::RendezvousMessage;
use crate::core::{COOKIE_NONCE_SIZE, COOKIE_RESOLUTION, CryptoError, EmiError, RendezvousFailure};
use crate::crypto::{Cookie, CookieMint, SIDE_SHARED, SharedSecret};
use crate::transport::{DEFAULT_RECV_BUFFER_SIZE, DatagramSocket};

/// How long a session is remembered after its last registration. Covers the
/// cookie lifetime so a consumed cookie stays consumed.
pub const SESSION_LIFETIME: Duration = Duration::from_secs(2 * COOKIE_RESOLUTION.as_secs());

/// Mediator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediatorConfig {
    /// Local address to bind to.
    pub address: IpAddr,
    /// Local port to bind to. Zero picks an ephemeral port.
    pub port: u16,
    /// How long sessions are remembered.
    pub session_lifetime: Duration,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            session_lifetime: SESSION_LIFETIME,
        }
    }
}

impl MediatorConfig {
    /// Set the bind address.
    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = address;
        self
    }

    /// Set the bind port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Registrant {
    outer: SocketAddr,
    inner: SocketAddr,
    side: u8,
}

#[derive(Debug, Clone, Copy)]
enum Session {
    Waiting(Registrant),
    Matched([Registrant; 2]),
}

#[derive(Debug)]
struct Entry {
    session: Session,
    expires_at: Instant,
}

/// Session table of a mediator.
#[derive(Debug)]
pub struct MediatorState {
    mint: Arc<CookieMint>,
    sessions: HashMap<[u8; COOKIE_NONCE_SIZE], Entry>,
    lifetime: Duration,
}

impl MediatorState {
    /// Create an empty table verifying cookies with `mint`.
    pub fn new(mint: Arc<CookieMint>, lifetime: Duration) -> Self {
        Self {
            mint,
            sessions: HashMap::new(),
            lifetime,
        }
    }

    /// Sessions currently remembered.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is remembered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Handle a registration from `from`. Returns the replies to send.
    pub fn handle_register(
        &mut self,
        cookie: &Cookie,
        inner: SocketAddr,
        from: SocketAddr,
        unix_secs: u64,
        now: Instant,
    ) -> Vec<(SocketAddr, RendezvousMessage)> {
        let session = *cookie.nonce();
        if !self.mint.verify(cookie, unix_secs) {
            trace!(%from, "invalid cookie");
            return vec![(
                from,
                RendezvousMessage::Rejected {
                    session,
                    reason: RendezvousFailure::InvalidCookie,
                },
            )];
        }
        let registrant = Registrant {
            outer: from,
            inner,
            side: cookie.side(),
        };
        let expires_at = now + self.lifetime;

        let Some(entry) = self.sessions.get_mut(&session) else {
            debug!(%from, "session opened");
            self.sessions.insert(
                session,
                Entry {
                    session: Session::Waiting(registrant),
                    expires_at,
                },
            );
            return vec![(from, RendezvousMessage::Waiting { session })];
        };

        let current = entry.session;
        match current {
            Session::Waiting(first) if first.outer == from || same_side(&first, &registrant) => {
                // Retry, or the same side coming back from a new address.
                entry.session = Session::Waiting(registrant);
                entry.expires_at = expires_at;
                vec![(from, RendezvousMessage::Waiting { session })]
            }
            Session::Waiting(first) => {
                debug!(first = %first.outer, second = %from, "session matched");
                let pair = [first, registrant];
                entry.session = Session::Matched(pair);
                entry.expires_at = expires_at;
                vec![
                    (pair[0].outer, matched(session, 0, &pair)),
                    (pair[1].outer, matched(session, 1, &pair)),
                ]
            }
            Session::Matched(pair) => match pair.iter().position(|r| r.outer == from) {
                Some(role) => vec![(from, matched(session, role, &pair))],
                None => {
                    trace!(%from, "cookie already consumed");
                    vec![(
                        from,
                        RendezvousMessage::Rejected {
                            session,
                            reason: RendezvousFailure::CookieConsumed,
                        },
                    )]
                }
            },
        }
    }

    /// Forget sessions past their lifetime.
    pub fn expire(&mut self, now: Instant) {
        self.sessions.retain(|_, entry| entry.expires_at > now);
    }
}

fn same_side(a: &Registrant, b: &Registrant) -> bool {
    a.side != SIDE_SHARED && a.side == b.side
}

fn matched(session: [u8; COOKIE_NONCE_SIZE], role: usize, pair: &[Registrant; 2]) -> RendezvousMessage {
    let other = &pair[1 - role];
    RendezvousMessage::Matched {
        session,
        role: role as u8,
        your_outer: pair[role].outer,
        peer_inner: other.inner,
        peer_outer: other.outer,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// A running mediator.
///
/// Dropping it stops the task.
#[derive(Debug)]
pub struct MediatorSocket {
    mint: Arc<CookieMint>,
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MediatorSocket {
    /// Bind and start a mediator with a fresh server secret.
    pub async fn open(config: MediatorConfig) -> Result<Self, EmiError> {
        let socket = DatagramSocket::bind(SocketAddr::new(config.address, config.port)).await?;
        let local_addr = socket.local_addr()?;
        let mint = Arc::new(CookieMint::generate());
        let state = MediatorState::new(Arc::clone(&mint), config.session_lifetime);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(run(socket, state, shutdown_rx));
        debug!(%local_addr, "mediator open");

        Ok(Self {
            mint,
            local_addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Address peers register with.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Mint a cookie both peers present.
    pub fn generate_cookie(&self) -> Result<Cookie, CryptoError> {
        self.mint.mint(unix_now())
    }

    /// Mint a cookie pair, one for each peer.
    pub fn generate_cookie_pair(&self) -> Result<(Cookie, Cookie), CryptoError> {
        self.mint.mint_pair(unix_now())
    }

    /// Generate a shared secret for the two peers.
    pub fn generate_shared_secret(&self) -> SharedSecret {
        SharedSecret::generate()
    }

    /// Stop the mediator.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MediatorSocket {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run(socket: DatagramSocket, mut state: MediatorState, mut shutdown_rx: oneshot::Receiver<()>) {
    let mut buf = vec![0u8; DEFAULT_RECV_BUFFER_SIZE];
    let mut sweep = interval(COOKIE_RESOLUTION / 10);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = sweep.tick() => state.expire(Instant::now()),
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "mediator receive failed");
                        continue;
                    }
                };
                let replies = match RendezvousMessage::decode(&buf[..len]) {
                    Ok(RendezvousMessage::Register { cookie, inner }) => {
                        state.handle_register(&cookie, inner, from, unix_now(), Instant::now())
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        trace!(%from, error = %e, "dropping datagram");
                        continue;
                    }
                };
                for (to, reply) in replies {
                    if let Err(e) = socket.send_to(&reply.encode(), to).await {
                        warn!(%to, error = %e, "mediator send failed");
                    }
                }
            }
        }
    }
    debug!(sessions = state.len(), "mediator closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW_SECS: u64 = 1_700_000_000;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn new_state() -> (MediatorState, Arc<CookieMint>) {
        let mint = Arc::new(CookieMint::from_secret([1; 32]));
        (MediatorState::new(Arc::clone(&mint), SESSION_LIFETIME), mint)
    }

    #[test]
    fn test_pairs_two_registrants() {
        let (mut state, mint) = new_state();
        let now = Instant::now();
        let cookie = mint.mint(NOW_SECS).unwrap();
        let a = addr("1.1.1.1:100");
        let b = addr("2.2.2.2:200");

        let replies = state.handle_register(&cookie, addr("10.0.0.1:100"), a, NOW_SECS, now);
        assert_eq!(replies.len(), 1);
        assert!(matches!(replies[0].1, RendezvousMessage::Waiting { .. }));

        let replies = state.handle_register(&cookie, addr("10.0.0.2:200"), b, NOW_SECS, now);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].0, a);
        assert_eq!(
            replies[0].1,
            RendezvousMessage::Matched {
                session: *cookie.nonce(),
                role: 0,
                your_outer: a,
                peer_inner: addr("10.0.0.2:200"),
                peer_outer: b,
            }
        );
        assert_eq!(replies[1].0, b);
        assert!(matches!(
            replies[1].1,
            RendezvousMessage::Matched { role: 1, peer_outer, .. } if peer_outer == a
        ));
    }

    #[test]
    fn test_repeated_register_is_idempotent() {
        let (mut state, mint) = new_state();
        let now = Instant::now();
        let cookie = mint.mint(NOW_SECS).unwrap();
        let a = addr("1.1.1.1:100");
        let b = addr("2.2.2.2:200");
        state.handle_register(&cookie, a, a, NOW_SECS, now);
        state.handle_register(&cookie, a, a, NOW_SECS, now);
        state.handle_register(&cookie, b, b, NOW_SECS, now);

        // A lost Matched is resent on retry, to the retrying peer only.
        let replies = state.handle_register(&cookie, b, b, NOW_SECS, now);
        assert_eq!(replies.len(), 1);
        assert!(matches!(
            replies[0].1,
            RendezvousMessage::Matched { role: 1, .. }
        ));
    }

    #[test]
    fn test_consumed_cookie_rejected() {
        let (mut state, mint) = new_state();
        let now = Instant::now();
        let cookie = mint.mint(NOW_SECS).unwrap();
        state.handle_register(&cookie, addr("1.1.1.1:1"), addr("1.1.1.1:1"), NOW_SECS, now);
        state.handle_register(&cookie, addr("2.2.2.2:2"), addr("2.2.2.2:2"), NOW_SECS, now);

        let intruder = addr("3.3.3.3:3");
        let replies = state.handle_register(&cookie, intruder, intruder, NOW_SECS, now);
        assert_eq!(
            replies,
            vec![(
                intruder,
                RendezvousMessage::Rejected {
                    session: *cookie.nonce(),
                    reason: RendezvousFailure::CookieConsumed,
                }
            )]
        );
    }

    #[test]
    fn test_invalid_and_expired_cookies() {
        let (mut state, _) = new_state();
        let now = Instant::now();
        let foreign = CookieMint::from_secret([2; 32]).mint(NOW_SECS).unwrap();
        let a = addr("1.1.1.1:1");
        let replies = state.handle_register(&foreign, a, a, NOW_SECS, now);
        assert!(matches!(
            replies[0].1,
            RendezvousMessage::Rejected {
                reason: RendezvousFailure::InvalidCookie,
                ..
            }
        ));

        let (mut state, mint) = new_state();
        let old = mint.mint(NOW_SECS - 3 * COOKIE_RESOLUTION.as_secs()).unwrap();
        let replies = state.handle_register(&old, a, a, NOW_SECS, now);
        assert!(matches!(
            replies[0].1,
            RendezvousMessage::Rejected {
                reason: RendezvousFailure::InvalidCookie,
                ..
            }
        ));
        assert!(state.is_empty());
    }

    #[test]
    fn test_cookie_pair_sides() {
        let (mut state, mint) = new_state();
        let now = Instant::now();
        let (first, second) = mint.mint_pair(NOW_SECS).unwrap();
        let a = addr("1.1.1.1:1");
        let a_moved = addr("1.1.1.1:9");
        let b = addr("2.2.2.2:2");
        state.handle_register(&first, a, a, NOW_SECS, now);
        // Same side from a new port replaces the registration.
        let replies = state.handle_register(&first, a_moved, a_moved, NOW_SECS, now);
        assert!(matches!(replies[0].1, RendezvousMessage::Waiting { .. }));

        let replies = state.handle_register(&second, b, b, NOW_SECS, now);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].0, a_moved);
    }

    #[test]
    fn test_sessions_expire() {
        let (mut state, mint) = new_state();
        let now = Instant::now();
        let cookie = mint.mint(NOW_SECS).unwrap();
        let a = addr("1.1.1.1:1");
        state.handle_register(&cookie, a, a, NOW_SECS, now);
        state.expire(now + SESSION_LIFETIME / 2);
        assert_eq!(state.len(), 1);
        state.expire(now + SESSION_LIFETIME);
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_mediator_socket_answers_register() {
        let mediator = MediatorSocket::open(
            MediatorConfig::default().with_address(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        )
        .await
        .unwrap();
        let cookie = mediator.generate_cookie().unwrap();
        assert_eq!(cookie.side(), SIDE_SHARED);

        let peer = DatagramSocket::bind(addr("127.0.0.1:0")).await.unwrap();
        let inner = peer.local_addr().unwrap();
        let register = RendezvousMessage::Register { cookie, inner };
        peer.send_to(&register.encode(), mediator.local_addr())
            .await
            .unwrap();

        let mut buf = [0u8; 256];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(from, mediator.local_addr());
        assert!(matches!(
            RendezvousMessage::decode(&buf[..len]).unwrap(),
            RendezvousMessage::Waiting { .. }
        ));
    }
}
