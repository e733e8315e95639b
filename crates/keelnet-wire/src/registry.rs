//! Connection registry: accepts inbound sessions and tracks live connections.
//!
//! The [`Registry`] is an explicit, cloneable context object with a
//! start/stop lifecycle. While started it runs one accept loop per listening
//! socket (IPv4 wildcard and, when enabled, IPv6 wildcard on the same port),
//! turns each accepted socket into a [`Connection`] sharing the registry's
//! processing modules, and keeps it in a live set until it is removed.
//!
//! Tracked connections report write failures, disconnects and goodbyes on a
//! channel; a reaper task turns those reports into [`Registry::remove_client`]
//! calls. Subscribers see [`RegistryEvent`]s for every addition and removal.

use crate::config::WireConfig;
use crate::connection::{Connection, RemovalSender};
use crate::error::WireError;
use crate::message::Message;
use crate::module::ProcessingModule;

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveReason {
    /// Removed by the server.
    Forced,
    /// The client said goodbye.
    ClientRequest,
    /// The socket failed or the peer went away.
    Disconnect,
}

/// Membership change notifications.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    ClientAdded(Connection),
    ClientRemoved {
        connection: Connection,
        reason: RemoveReason,
    },
}

/// Server-side set of live connections.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: WireConfig,
    /// Serializes start/stop.
    running: tokio::sync::Mutex<Option<Running>>,
    started: AtomicBool,
    clients: RwLock<Vec<Connection>>,
    events: broadcast::Sender<RegistryEvent>,
}

struct Running {
    port: u16,
    local_addrs: Vec<SocketAddr>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    removals: RemovalSender,
}

impl Registry {
    pub fn new(config: WireConfig) -> Self {
        let (events, _) = broadcast::channel(config.server.event_capacity.max(1));
        Self {
            inner: Arc::new(RegistryInner {
                config,
                running: tokio::sync::Mutex::new(None),
                started: AtomicBool::new(false),
                clients: RwLock::new(Vec::new()),
                events,
            }),
        }
    }

    /// Bind the listeners and start accepting. Returns the bound port.
    ///
    /// Port 0 picks an ephemeral port (shared by both listeners). Calling
    /// `start` on a started registry does nothing and returns its port.
    pub async fn start(
        &self,
        port: u16,
        modules: Vec<Arc<dyn ProcessingModule>>,
    ) -> Result<u16, WireError> {
        let mut running = self.inner.running.lock().await;
        if let Some(state) = running.as_ref() {
            return Ok(state.port);
        }

        let v4 = bind_listener(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
        let port = v4.local_addr()?.port();
        let mut listeners = vec![v4];
        if self.inner.config.server.dual_stack {
            match bind_listener(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))) {
                Ok(v6) => listeners.push(v6),
                Err(e) => warn!(port, error = %e, "IPv6 listener unavailable, serving IPv4 only"),
            }
        }

        let local_addrs = listeners
            .iter()
            .map(|l| l.local_addr())
            .collect::<Result<Vec<_>, _>>()?;

        let modules: Arc<[Arc<dyn ProcessingModule>]> = modules.into();
        let (shutdown, _) = watch::channel(false);
        let (removals, removal_rx) = mpsc::unbounded_channel();
        self.inner.started.store(true, Ordering::SeqCst);

        let mut tasks = Vec::with_capacity(listeners.len() + 1);
        for (listener, &addr) in listeners.into_iter().zip(&local_addrs) {
            info!("Listening on {}", addr);
            tasks.push(tokio::spawn(accept_loop(
                listener,
                addr,
                self.clone(),
                Arc::clone(&modules),
                shutdown.subscribe(),
                removals.clone(),
            )));
        }
        tasks.push(tokio::spawn(reap_loop(
            self.clone(),
            removal_rx,
            shutdown.subscribe(),
        )));

        *running = Some(Running {
            port,
            local_addrs,
            shutdown,
            tasks,
            removals,
        });
        Ok(port)
    }

    /// Stop accepting, dispose every tracked connection and clear the set.
    /// Does nothing if not started.
    pub async fn stop(&self) {
        let mut running = self.inner.running.lock().await;
        let Some(state) = running.take() else {
            return;
        };

        let drained = {
            let mut clients = self.inner.clients.write().unwrap_or_else(|e| e.into_inner());
            self.inner.started.store(false, Ordering::SeqCst);
            std::mem::take(&mut *clients)
        };

        let _ = state.shutdown.send(true);
        for task in state.tasks {
            let _ = task.await;
        }
        for conn in &drained {
            conn.dispose().await;
        }
        info!(
            port = state.port,
            disposed = drained.len(),
            "Registry stopped"
        );
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Bound port while started.
    pub async fn port(&self) -> Option<u16> {
        self.inner.running.lock().await.as_ref().map(|r| r.port)
    }

    /// Addresses of the active listeners.
    pub async fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .running
            .lock()
            .await
            .as_ref()
            .map(|r| r.local_addrs.clone())
            .unwrap_or_default()
    }

    /// Snapshot of the live connections.
    pub fn clients(&self) -> Vec<Connection> {
        self.inner
            .clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn client_count(&self) -> usize {
        self.inner
            .clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Subscribe to client added/removed events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    /// Track an outbound connection as if it had been accepted.
    ///
    /// Tracking a member again is a no-op. A connection tracked by another
    /// registry fails with [`WireError::AlreadyTracked`].
    pub async fn track(&self, connection: Connection) -> Result<(), WireError> {
        if !connection.is_connected() {
            return Err(WireError::NotConnected);
        }
        let removals = {
            let running = self.inner.running.lock().await;
            running
                .as_ref()
                .map(|r| r.removals.clone())
                .ok_or(WireError::NotStarted)?
        };
        self.add_client(connection, &removals).await
    }

    /// Admit a connection to the live set. A connection already in the set
    /// is left alone; one that reports to another registry is refused.
    async fn add_client(
        &self,
        connection: Connection,
        removals: &RemovalSender,
    ) -> Result<(), WireError> {
        {
            let mut clients = self.inner.clients.write().unwrap_or_else(|e| e.into_inner());
            if !self.is_started() {
                return Err(WireError::NotStarted);
            }
            if clients.contains(&connection) {
                debug!(conn = connection.id(), "Client already tracked");
                return Ok(());
            }
            if !connection.attach_removal(removals.clone()) {
                return Err(WireError::AlreadyTracked);
            }
            clients.push(connection.clone());
        }

        info!(
            conn = connection.id(),
            peer = %connection.peer_addr(),
            "Client added"
        );
        let _ = self.inner.events.send(RegistryEvent::ClientAdded(connection));
        Ok(())
    }

    /// Dispose a connection, drop it from the set and announce the removal.
    ///
    /// Only the call that actually removes the member raises an event.
    pub async fn remove_client(&self, connection: &Connection, reason: RemoveReason) {
        connection.dispose().await;

        let removed = {
            let mut clients = self.inner.clients.write().unwrap_or_else(|e| e.into_inner());
            let before = clients.len();
            clients.retain(|c| c != connection);
            clients.len() != before
        };

        if removed {
            info!(
                conn = connection.id(),
                peer = %connection.peer_addr(),
                reason = ?reason,
                "Client removed"
            );
            let _ = self.inner.events.send(RegistryEvent::ClientRemoved {
                connection: connection.clone(),
                reason,
            });
        }
    }

    /// Send a message to every tracked connection.
    ///
    /// Requests are rejected: there is no way to collect their responses.
    pub async fn broadcast(&self, message: impl Into<Message>) -> Result<(), WireError> {
        self.broadcast_inner(message.into(), false).await
    }

    /// Send a message, encrypted, to every tracked connection that has a
    /// session cipher. The others are skipped.
    ///
    /// Both broadcasts return once every copy is written or has failed; a
    /// stalled peer holds that up for at most its write timeout.
    pub async fn broadcast_encrypted(&self, message: impl Into<Message>) -> Result<(), WireError> {
        self.broadcast_inner(message.into(), true).await
    }

    async fn broadcast_inner(&self, message: Message, encrypted: bool) -> Result<(), WireError> {
        if message.is_request() {
            return Err(WireError::InvalidBroadcast(
                "a request cannot be broadcast because its responses cannot be collected".into(),
            ));
        }

        // One task per connection: a peer that stops reading only delays
        // its own copy. Reverse order, since a failed send may remove its
        // connection from the set.
        let mut handles = Vec::new();
        for conn in self.clients().into_iter().rev() {
            if encrypted && !conn.has_encrypted_connection() {
                continue;
            }
            let message = message.clone();
            handles.push(tokio::spawn(async move {
                let result = if encrypted {
                    conn.send_encrypted(message).await
                } else {
                    conn.send(message).await
                };
                (conn.id(), result)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((_, Ok(()))) => {}
                Ok((conn, Err(e))) => debug!(conn, error = %e, "Broadcast skipped connection"),
                Err(e) => warn!(error = %e, "Broadcast task failed"),
            }
        }
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(WireConfig::default())
    }
}

/// Bind a listening socket. IPv6 sockets are v6-only so that they can share
/// the port with the IPv4 listener.
fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

/// Internal accept loop, one per listener.
async fn accept_loop(
    listener: TcpListener,
    addr: SocketAddr,
    registry: Registry,
    modules: Arc<[Arc<dyn ProcessingModule>]>,
    mut shutdown: watch::Receiver<bool>,
    removals: RemovalSender,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    let config = registry.inner.config.connection.clone();
                    match Connection::start(stream, Arc::clone(&modules), config) {
                        Ok(conn) => {
                            if let Err(e) = registry.add_client(conn.clone(), &removals).await {
                                debug!(peer = %peer, error = %e, "Dropping new client");
                                conn.dispose().await;
                            }
                        }
                        Err(e) => warn!(peer = %peer, error = %e, "Failed to set up connection"),
                    }
                }
                Err(e) => {
                    error!("Accept error on {}: {}", addr, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    debug!("Accept loop on {} stopped", addr);
}

/// Turns removal reports from tracked connections into removals.
async fn reap_loop(
    registry: Registry,
    mut removals: mpsc::UnboundedReceiver<(Connection, RemoveReason)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            next = removals.recv() => match next {
                Some((conn, reason)) => registry.remove_client(&conn, reason).await,
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::message::{Notification, PingRequest, Request};

    fn ipv4_only() -> WireConfig {
        let mut config = WireConfig::default();
        config.server.dual_stack = false;
        config
    }

    async fn next_event(rx: &mut broadcast::Receiver<RegistryEvent>) -> RegistryEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event expected")
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let registry = Registry::new(ipv4_only());
        assert!(!registry.is_started());
        assert!(registry.port().await.is_none());

        let port = registry.start(0, Vec::new()).await.unwrap();
        assert_ne!(port, 0);
        assert!(registry.is_started());
        assert_eq!(registry.start(0, Vec::new()).await.unwrap(), port);
        assert_eq!(registry.local_addrs().await.len(), 1);

        registry.stop().await;
        assert!(!registry.is_started());
        assert!(registry.local_addrs().await.is_empty());
        // Second stop is a no-op
        registry.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_rejects_request() {
        let registry = Registry::new(ipv4_only());
        let err = registry
            .broadcast(Request::new(PingRequest::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::InvalidBroadcast(_)));
        let err = registry
            .broadcast_encrypted(Request::new(PingRequest::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::InvalidBroadcast(_)));
        assert!(registry.broadcast(Notification::Goodbye).await.is_ok());
    }

    #[tokio::test]
    async fn test_track_requires_started_registry() {
        let server = Registry::new(ipv4_only());
        let port = server.start(0, Vec::new()).await.unwrap();
        let outbound =
            Connection::connect_with("127.0.0.1", port, Vec::new(), ConnectionConfig::default())
                .await
                .unwrap();

        let other = Registry::new(ipv4_only());
        assert!(matches!(
            other.track(outbound.clone()).await,
            Err(WireError::NotStarted)
        ));

        other.start(0, Vec::new()).await.unwrap();
        other.track(outbound.clone()).await.unwrap();
        assert_eq!(other.client_count(), 1);

        other.stop().await;
        assert!(!outbound.is_connected());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_track_is_idempotent_and_exclusive() {
        let server = Registry::new(ipv4_only());
        let port = server.start(0, Vec::new()).await.unwrap();
        let outbound =
            Connection::connect_with("127.0.0.1", port, Vec::new(), ConnectionConfig::default())
                .await
                .unwrap();

        let first = Registry::new(ipv4_only());
        let mut events = first.subscribe();
        first.start(0, Vec::new()).await.unwrap();
        first.track(outbound.clone()).await.unwrap();
        first.track(outbound.clone()).await.unwrap();
        assert_eq!(first.client_count(), 1);
        assert!(matches!(
            next_event(&mut events).await,
            RegistryEvent::ClientAdded(conn) if conn == outbound
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());

        let second = Registry::new(ipv4_only());
        second.start(0, Vec::new()).await.unwrap();
        assert!(matches!(
            second.track(outbound.clone()).await,
            Err(WireError::AlreadyTracked)
        ));
        assert_eq!(second.client_count(), 0);
        assert!(outbound.is_connected());

        second.stop().await;
        first.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_remove_client_announces_once() {
        let registry = Registry::new(ipv4_only());
        let mut events = registry.subscribe();
        let port = registry.start(0, Vec::new()).await.unwrap();

        let client = Connection::connect("127.0.0.1", port, Vec::new())
            .await
            .unwrap();
        let server_side = match next_event(&mut events).await {
            RegistryEvent::ClientAdded(conn) => conn,
            other => panic!("Expected ClientAdded, got {other:?}"),
        };
        assert_eq!(registry.clients(), vec![server_side.clone()]);

        registry
            .remove_client(&server_side, RemoveReason::Forced)
            .await;
        registry
            .remove_client(&server_side, RemoveReason::Forced)
            .await;

        match next_event(&mut events).await {
            RegistryEvent::ClientRemoved { connection, reason } => {
                assert_eq!(connection, server_side);
                assert_eq!(reason, RemoveReason::Forced);
            }
            other => panic!("Expected ClientRemoved, got {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(registry.client_count(), 0);

        client.dispose().await;
        registry.stop().await;
    }
}
