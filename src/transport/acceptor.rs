//! # Acceptor
//!
//! Listens for inbound connections and starts one server session per
//! accepted socket, re-arming immediately so a slow handshake never holds
//! up the next accept.
//!
//! IPv4 always listens on the configured address. IPv6 is probed once at
//! bind time and, when available, gets its own v6-only listener and accept
//! loop on the same port; an unavailable family is skipped with a warning.
//!
//! Shutting the acceptor down stops the accept loops only. Sessions that
//! were already handed out keep running.

use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::NetworkConfig;
use crate::error::Result;
use crate::protocol::handshake::AuthModuleFactory;
use crate::protocol::message::{LogoutReason, Message};
use crate::transport::server::{AcceptedSession, ServerSessions};
use crate::utils::metrics::global_metrics;

/// Pause after a failed accept so a persistent error (EMFILE) does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

const LISTEN_BACKLOG: i32 = 1024;

/// Occupies one connection slot until dropped
struct Slot {
    active: Arc<AtomicUsize>,
}

impl Slot {
    fn claim(active: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()
            .map(|_| Self {
                active: Arc::clone(active),
            })
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// State shared by the accept loops of both families
#[derive(Clone)]
struct AcceptShared {
    sessions: ServerSessions,
    active: Arc<AtomicUsize>,
    max_connections: usize,
    accepted: mpsc::UnboundedSender<AcceptedSession>,
}

/// Running listener set
pub struct Acceptor {
    local_addrs: Vec<SocketAddr>,
    active: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

impl Acceptor {
    /// Binds the configured listeners and starts accepting.
    ///
    /// Accepted sessions arrive on the returned receiver. Dropping the
    /// receiver does not stop accepting.
    ///
    /// # Errors
    /// Fails when the IPv4 listener cannot bind. IPv6 failures are logged
    /// and skipped.
    #[instrument(skip_all, fields(address = %config.server.address, port = config.server.port))]
    pub async fn bind(
        config: &NetworkConfig,
        auth: Option<AuthModuleFactory>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AcceptedSession>)> {
        let v4 = TcpListener::bind(SocketAddrV4::new(config.server.address, config.server.port)).await?;
        let port = v4.local_addr()?.port();
        let mut listeners = vec![v4];

        if config.server.enable_ipv6 {
            if ipv6_available().await {
                let any = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
                match bind_v6_only(any) {
                    Ok(v6) => listeners.push(v6),
                    Err(e) => warn!(error = %e, "IPv6 listener not started"),
                }
            } else {
                warn!("IPv6 unavailable on this host, listening on IPv4 only");
            }
        }

        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let active = Arc::new(AtomicUsize::new(0));
        let shared = AcceptShared {
            sessions: ServerSessions::new(config, auth),
            active: Arc::clone(&active),
            max_connections: config.server.max_connections,
            accepted: accepted_tx,
        };

        let mut local_addrs = Vec::with_capacity(listeners.len());
        let mut loops = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let addr = listener.local_addr()?;
            info!(address = %addr, "listening");
            local_addrs.push(addr);
            loops.push(tokio::spawn(accept_loop(
                listener,
                shared.clone(),
                shutdown_rx.clone(),
            )));
        }

        Ok((
            Self {
                local_addrs,
                active,
                shutdown,
                loops,
            },
            accepted_rx,
        ))
    }

    /// Bound addresses, IPv4 first
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Sessions currently holding a connection slot
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Stops accepting and waits for the accept loops to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for accept in self.loops {
            if let Err(e) = accept.await {
                error!(error = %e, "accept loop ended abnormally");
            }
        }
        info!("acceptor stopped");
        global_metrics().log_metrics();
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("local_addrs", &self.local_addrs)
            .field("active", &self.active_connections())
            .finish()
    }
}

/// Binds an IPv6 listener that leaves IPv4 to the other instance
fn bind_v6_only(addr: SocketAddrV6) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V6(addr).into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

async fn ipv6_available() -> bool {
    TcpListener::bind(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 0, 0, 0))
        .await
        .is_ok()
}

async fn accept_loop(
    listener: TcpListener,
    shared: AcceptShared,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("accept loop shutting down");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => admit(&shared, stream, peer),
                Err(e) => {
                    global_metrics().connection_error();
                    error!(error = %e, "error accepting connection");
                    if back_off(&mut shutdown).await {
                        debug!("accept loop shutting down");
                        return;
                    }
                }
            },
        }
    }
}

/// Waits out [`ACCEPT_BACKOFF`]; true when shutdown arrived first
async fn back_off(shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => false,
    }
}

fn admit(shared: &AcceptShared, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "TCP_NODELAY not set");
    }

    let Some(slot) = Slot::claim(&shared.active, shared.max_connections) else {
        warn!(peer = %peer, limit = shared.max_connections, "server full, rejecting connection");
        global_metrics().connection_rejected();
        tokio::spawn(reject(stream, LogoutReason::ServerFull));
        return;
    };

    debug!(peer = %peer, "connection accepted");
    let session = shared.sessions.spawn_guarded(stream, peer, slot);
    if shared.accepted.send(session).is_err() {
        debug!(peer = %peer, "no owner listening for accepted sessions");
    }
}

/// Tells the peer why and closes, without starting a session
async fn reject(mut stream: TcpStream, reason: LogoutReason) {
    let frame = match Message::Logout(reason).to_frame() {
        Ok(frame) => frame.to_bytes(),
        Err(e) => {
            error!(error = %e, "logout frame not encoded");
            return;
        }
    };
    if let Err(e) = stream.write_all(&frame).await {
        debug!(error = %e, "rejection not delivered");
        return;
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn slots_respect_the_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let first = Slot::claim(&active, 2).unwrap();
        let _second = Slot::claim(&active, 2).unwrap();
        assert!(Slot::claim(&active, 2).is_none());
        drop(first);
        assert!(Slot::claim(&active, 2).is_some());
        assert_eq!(active.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.server.address = std::net::Ipv4Addr::LOCALHOST;
            c.server.port = 0;
            c.server.enable_ipv6 = false;
        });
        let (acceptor, _sessions) = Acceptor::bind(&config, None).await.unwrap();
        let addr = acceptor.local_addrs()[0];
        assert_eq!(acceptor.local_addrs().len(), 1);

        acceptor.shutdown().await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn default_config_listens_on_both_families() {
        let config = NetworkConfig::default_with_overrides(|c| c.server.port = 0);
        let (acceptor, mut sessions) = Acceptor::bind(&config, None).await.unwrap();
        let port = acceptor.local_addrs()[0].port();

        if !ipv6_available().await {
            assert_eq!(acceptor.local_addrs().len(), 1);
            acceptor.shutdown().await;
            return;
        }

        assert_eq!(acceptor.local_addrs().len(), 2);
        assert!(acceptor.local_addrs()[1].is_ipv6());
        assert_eq!(acceptor.local_addrs()[1].port(), port);

        let _v6 = TcpStream::connect((Ipv6Addr::LOCALHOST, port)).await.unwrap();
        let accepted = sessions.recv().await.unwrap();
        assert!(accepted.peer.is_ipv6());

        let _v4 = TcpStream::connect((std::net::Ipv4Addr::LOCALHOST, port))
            .await
            .unwrap();
        let accepted = sessions.recv().await.unwrap();
        assert!(accepted.peer.is_ipv4());

        acceptor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_accept_backs_off() {
        let (_tx, mut rx) = watch::channel(false);
        let started = tokio::time::Instant::now();
        assert!(!back_off(&mut rx).await);
        assert!(started.elapsed() >= ACCEPT_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cuts_back_off_short() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        let started = tokio::time::Instant::now();
        assert!(back_off(&mut rx).await);
        assert!(started.elapsed() < ACCEPT_BACKOFF);
    }
}
