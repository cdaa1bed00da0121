//! Socket reservations for servers that bind their own listeners.
//!
//! Prosody and friends create their own sockets and have no way to adopt an
//! inherited file descriptor. To hand them a free port we bind a probe
//! listener, read back the address the OS picked and close the probe again so
//! the server can bind the same port when it starts. Something else on the
//! machine could claim the port in between; that race is accepted.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use crate::config::HarnessConfig;
use crate::error::FixtureError;

/// What a reserved socket is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Client-to-server (c2s) connections.
    Client,
    /// Server-to-server (s2s) connections.
    Server,
    /// External component connections (XEP-0114).
    Component,
    /// Plain HTTP (BOSH, websocket upgrade, uploads).
    Http,
    /// HTTP over TLS.
    Https,
}

impl Role {
    /// Every role, in the order reservations are probed at startup.
    pub const ALL: [Role; 5] = [
        Role::Client,
        Role::Server,
        Role::Component,
        Role::Http,
        Role::Https,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "c2s",
            Role::Server => "s2s",
            Role::Component => "component",
            Role::Http => "http",
            Role::Https => "https",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport a reservation is made on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Unix,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
            Transport::Unix => f.write_str("unix"),
        }
    }
}

/// Address recorded by a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReservedAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl ReservedAddr {
    /// The reserved TCP port, if this is a TCP reservation.
    pub fn port(&self) -> Option<u16> {
        match self {
            ReservedAddr::Tcp(addr) => Some(addr.port()),
            ReservedAddr::Unix(_) => None,
        }
    }

    /// Address to dial. Wildcard binds are dialed on loopback.
    pub fn dial_target(&self) -> ReservedAddr {
        match self {
            ReservedAddr::Tcp(addr) if addr.ip().is_unspecified() => {
                let ip = match addr.ip() {
                    IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                    IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
                };
                ReservedAddr::Tcp(SocketAddr::new(ip, addr.port()))
            }
            other => other.clone(),
        }
    }
}

impl fmt::Display for ReservedAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReservedAddr::Tcp(addr) => write!(f, "{addr}"),
            ReservedAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A socket address set aside for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    role: Role,
    transport: Transport,
    addr: ReservedAddr,
}

impl Reservation {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn addr(&self) -> &ReservedAddr {
        &self.addr
    }

    /// Shorthand for `addr().port()`.
    pub fn port(&self) -> Option<u16> {
        self.addr.port()
    }
}

/// One write-once slot per [`Role`].
#[derive(Debug, Default)]
pub(crate) struct Sockets {
    client: Option<Reservation>,
    server: Option<Reservation>,
    component: Option<Reservation>,
    http: Option<Reservation>,
    https: Option<Reservation>,
}

impl Sockets {
    pub(crate) fn get(&self, role: Role) -> Option<&Reservation> {
        match role {
            Role::Client => self.client.as_ref(),
            Role::Server => self.server.as_ref(),
            Role::Component => self.component.as_ref(),
            Role::Http => self.http.as_ref(),
            Role::Https => self.https.as_ref(),
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<Reservation> {
        match role {
            Role::Client => &mut self.client,
            Role::Server => &mut self.server,
            Role::Component => &mut self.component,
            Role::Http => &mut self.http,
            Role::Https => &mut self.https,
        }
    }

    /// Return the reservation for `role`, probing for one on first use.
    ///
    /// Once a role has a reservation, later calls return it unchanged and
    /// ignore `transport` and `addr` entirely.
    pub(crate) fn reserve(
        &mut self,
        role: Role,
        transport: Transport,
        addr: &str,
        base_dir: &Path,
    ) -> Result<&Reservation, FixtureError> {
        let slot = self.slot_mut(role);
        let reservation = match slot.take() {
            Some(existing) => existing,
            None => {
                let reserved = probe(transport, addr, base_dir).map_err(|source| {
                    FixtureError::Reserve {
                        role,
                        transport,
                        addr: addr.to_string(),
                        source,
                    }
                })?;
                debug!(%role, %transport, addr = %reserved, "Reserved socket");
                Reservation {
                    role,
                    transport,
                    addr: reserved,
                }
            }
        };
        Ok(slot.insert(reservation))
    }

    /// Reservations in [`Role::ALL`] order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Reservation> {
        Role::ALL.into_iter().filter_map(move |role| self.get(role))
    }
}

/// Bind a listener, note its address and close it again.
fn probe(transport: Transport, addr: &str, base_dir: &Path) -> io::Result<ReservedAddr> {
    match transport {
        Transport::Tcp => {
            let listener = std::net::TcpListener::bind(addr)?;
            let local = listener.local_addr()?;
            drop(listener);
            Ok(ReservedAddr::Tcp(local))
        }
        Transport::Unix => {
            let path = base_dir.join(addr);
            let listener = std::os::unix::net::UnixListener::bind(&path)?;
            drop(listener);
            // The socket file outlives the listener and would make the
            // server's own bind fail with EADDRINUSE.
            std::fs::remove_file(&path)?;
            Ok(ReservedAddr::Unix(path))
        }
    }
}

/// Raw, protocol-agnostic connection to a reserved socket.
#[derive(Debug)]
pub enum Conn {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// Open a connection to `addr`.
pub async fn dial(addr: &ReservedAddr) -> io::Result<Conn> {
    match addr.dial_target() {
        ReservedAddr::Tcp(addr) => TcpStream::connect(addr).await.map(Conn::Tcp),
        ReservedAddr::Unix(path) => UnixStream::connect(path).await.map(Conn::Unix),
    }
}

/// Dial `reservation` until it accepts a connection or the budget runs out.
pub(crate) async fn wait_live(
    reservation: &Reservation,
    config: &HarnessConfig,
) -> Result<(), FixtureError> {
    let attempts = config.socket_poll_attempts.max(1);
    let mut last_error = String::from("connection was never attempted");

    for attempt in 1..=attempts {
        match tokio::time::timeout(config.connect_timeout, dial(&reservation.addr)).await {
            Ok(Ok(_conn)) => {
                debug!(
                    role = %reservation.role,
                    addr = %reservation.addr,
                    attempt,
                    "Socket is live"
                );
                return Ok(());
            }
            Ok(Err(error)) => last_error = error.to_string(),
            Err(_) => {
                last_error = format!("connect timed out after {:?}", config.connect_timeout)
            }
        }
        if attempt < attempts {
            tokio::time::sleep(config.socket_poll_interval).await;
        }
    }

    Err(FixtureError::SocketTimeout {
        role: reservation.role,
        addr: reservation.addr.to_string(),
        attempts,
        last_error,
    })
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Conn::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Conn::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_flush(cx),
            Conn::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Conn::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_reservation_is_idempotent_per_role() {
        let dir = tempfile::tempdir().unwrap();
        let mut sockets = Sockets::default();

        let first = sockets
            .reserve(Role::Client, Transport::Tcp, "127.0.0.1:0", dir.path())
            .unwrap()
            .clone();
        // A second probe on this address would fail; getting the old
        // reservation back proves no listener was opened.
        let second = sockets
            .reserve(Role::Client, Transport::Unix, "/nonexistent/dir/sock", dir.path())
            .unwrap()
            .clone();

        assert_eq!(first, second);
        assert_eq!(second.transport(), Transport::Tcp);
        assert_ne!(first.port(), Some(0));
    }

    #[test]
    fn test_roles_are_reserved_independently() {
        let dir = tempfile::tempdir().unwrap();
        let mut sockets = Sockets::default();
        let c2s = sockets
            .reserve(Role::Client, Transport::Tcp, "127.0.0.1:0", dir.path())
            .unwrap()
            .clone();
        let s2s = sockets
            .reserve(Role::Server, Transport::Tcp, "127.0.0.1:0", dir.path())
            .unwrap()
            .clone();

        assert_ne!(c2s.port(), s2s.port());
        assert!(sockets.get(Role::Component).is_none());
        let roles: Vec<_> = sockets.iter().map(|r| r.role()).collect();
        assert_eq!(roles, vec![Role::Client, Role::Server]);
    }

    #[test]
    fn test_probe_releases_port() {
        let dir = tempfile::tempdir().unwrap();
        let mut sockets = Sockets::default();
        let reservation = sockets
            .reserve(Role::Client, Transport::Tcp, "127.0.0.1:0", dir.path())
            .unwrap();
        let ReservedAddr::Tcp(addr) = reservation.addr() else {
            panic!("expected a TCP reservation");
        };
        std::net::TcpListener::bind(addr).expect("reserved port should be free again");
    }

    #[test]
    fn test_unix_reservation_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sockets = Sockets::default();
        let reservation = sockets
            .reserve(Role::Component, Transport::Unix, "component.sock", dir.path())
            .unwrap();

        let expected = dir.path().join("component.sock");
        assert_eq!(reservation.addr(), &ReservedAddr::Unix(expected.clone()));
        assert!(!expected.exists());
        assert_eq!(reservation.port(), None);
    }

    #[test]
    fn test_failed_probe_leaves_slot_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut sockets = Sockets::default();
        let err = sockets
            .reserve(Role::Server, Transport::Tcp, "not an address", dir.path())
            .unwrap_err();
        assert!(matches!(err, FixtureError::Reserve { role: Role::Server, .. }));
        assert!(sockets.get(Role::Server).is_none());
    }

    #[test]
    fn test_wildcard_dials_loopback() {
        let addr = ReservedAddr::Tcp("0.0.0.0:5222".parse().unwrap());
        assert_eq!(
            addr.dial_target(),
            ReservedAddr::Tcp("127.0.0.1:5222".parse().unwrap())
        );
        let addr = ReservedAddr::Tcp("[::]:5269".parse().unwrap());
        assert_eq!(
            addr.dial_target(),
            ReservedAddr::Tcp("[::1]:5269".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_wait_live_succeeds_once_bound() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let reservation = Reservation {
            role: Role::Client,
            transport: Transport::Tcp,
            addr: ReservedAddr::Tcp(listener.local_addr().unwrap()),
        };
        wait_live(&reservation, &HarnessConfig::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_live_gives_up_after_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut sockets = Sockets::default();
        let reservation = sockets
            .reserve(Role::Client, Transport::Tcp, "127.0.0.1:0", dir.path())
            .unwrap()
            .clone();
        let config = HarnessConfig {
            socket_poll_attempts: 3,
            socket_poll_interval: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(100),
        };

        let err = wait_live(&reservation, &config).await.unwrap_err();
        match err {
            FixtureError::SocketTimeout { attempts, role, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(role, Role::Client);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
