//! Connection: one TCP session with framing, optional encryption and
//! request/response correlation.
//!
//! A [`Connection`] owns its socket. The read half belongs to a dedicated
//! receive task that blocks on the next frame; the write half sits behind an
//! async mutex so that one frame is written completely before the next one
//! starts. Responses go into a [`ReplyBuffer`] and wake any waiting
//! [`request`](Connection::request); every other message is handed to the
//! processing modules on its own task.
//!
//! Handles are cheap to clone. A connection lives until [`dispose`] or
//! [`close`] is called, the peer goes away, or a tracking [`Registry`]
//! removes it.
//!
//! [`dispose`]: Connection::dispose
//! [`close`]: Connection::close
//! [`Registry`]: crate::registry::Registry

use crate::config::ConnectionConfig;
use crate::crypto::{KeyPair, PublicKey, SessionCipher};
use crate::error::WireError;
use crate::message::*;
use crate::module::{dispatch, ProcessingModule};
use crate::registry::RemoveReason;
use crate::reply::{ReplyBuffer, ReplyType};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

/// Process-unique connection identifier.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Channel a tracked connection uses to ask its registry for removal.
pub(crate) type RemovalSender = mpsc::UnboundedSender<(Connection, RemoveReason)>;

/// Observable lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket established, plaintext only.
    Open,
    /// A session cipher is installed.
    Encrypted,
    /// Terminal.
    Disposed,
}

/// A live peer-to-peer session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    config: ConnectionConfig,
    /// Send critical section. `None` once disposed.
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    cipher: RwLock<Option<Arc<SessionCipher>>>,
    replies: Mutex<ReplyBuffer>,
    reply_signal: Notify,
    modules: Arc<[Arc<dyn ProcessingModule>]>,
    disposed: AtomicBool,
    /// Flips to `true` on dispose; aborts an in-flight write.
    closed: watch::Sender<bool>,
    shutdown: Notify,
    removal: OnceLock<RemovalSender>,
}

impl Connection {
    /// Connect to `host:port` with the default configuration.
    pub async fn connect(
        host: &str,
        port: u16,
        modules: Vec<Arc<dyn ProcessingModule>>,
    ) -> Result<Self, WireError> {
        Self::connect_with(host, port, modules, ConnectionConfig::default()).await
    }

    /// Connect to `host:port`, trying each resolved address in turn, and
    /// start the receive loop.
    pub async fn connect_with(
        host: &str,
        port: u16,
        modules: Vec<Arc<dyn ProcessingModule>>,
        config: ConnectionConfig,
    ) -> Result<Self, WireError> {
        debug!("Connecting to {}:{}", host, port);
        let stream = TcpStream::connect((host, port)).await?;
        Self::start(stream, modules.into(), config)
    }

    /// Wrap an already-accepted socket and start the receive loop.
    pub fn from_stream(
        stream: TcpStream,
        modules: Vec<Arc<dyn ProcessingModule>>,
        config: ConnectionConfig,
    ) -> Result<Self, WireError> {
        Self::start(stream, modules.into(), config)
    }

    pub(crate) fn start(
        stream: TcpStream,
        modules: Arc<[Arc<dyn ProcessingModule>]>,
        config: ConnectionConfig,
    ) -> Result<Self, WireError> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let replies = ReplyBuffer::new(config.reply_retention(), config.max_buffered_replies);
        let (closed, _) = watch::channel(false);
        let conn = Self {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                peer_addr,
                local_addr,
                config,
                writer: tokio::sync::Mutex::new(Some(writer)),
                cipher: RwLock::new(None),
                replies: Mutex::new(replies),
                reply_signal: Notify::new(),
                modules,
                disposed: AtomicBool::new(false),
                closed,
                shutdown: Notify::new(),
                removal: OnceLock::new(),
            }),
        };

        debug!(conn = conn.id(), peer = %peer_addr, "Connection open");
        tokio::spawn(receive_loop(conn.clone(), reader));
        Ok(conn)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_connected(&self) -> bool {
        !self.is_disposed()
    }

    pub fn has_encrypted_connection(&self) -> bool {
        self.cipher().is_some()
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_disposed() {
            ConnectionState::Disposed
        } else if self.has_encrypted_connection() {
            ConnectionState::Encrypted
        } else {
            ConnectionState::Open
        }
    }

    fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    fn cipher(&self) -> Option<Arc<SessionCipher>> {
        self.inner
            .cipher
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_cipher(&self, cipher: SessionCipher) {
        let mut slot = self.inner.cipher.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(cipher));
    }

    /// Route I/O failures on this connection to a registry's reaper.
    pub(crate) fn attach_removal(&self, removal: RemovalSender) -> bool {
        self.inner.removal.set(removal).is_ok()
    }

    fn report_removal(&self, reason: RemoveReason) {
        if let Some(removal) = self.inner.removal.get() {
            let _ = removal.send((self.clone(), reason));
        }
    }

    /// Send using the current encryption state: encrypted iff a session
    /// cipher is installed.
    pub async fn send(&self, message: impl Into<Message>) -> Result<(), WireError> {
        let encrypted = self.has_encrypted_connection();
        self.send_with(message.into(), encrypted).await
    }

    /// Send inside an encrypted envelope.
    pub async fn send_encrypted(&self, message: impl Into<Message>) -> Result<(), WireError> {
        self.send_with(message.into(), true).await
    }

    /// Write one frame, optionally wrapped in an encrypted envelope.
    ///
    /// Fails fast when the connection is disposed, when encryption is
    /// requested without a cipher, or when the frame exceeds
    /// `max_message_size`. A write failure is logged and reported to the
    /// tracking registry, and the call still returns `Ok(())`. A write that
    /// stalls past `write_timeout_ms` is treated the same way and also
    /// disposes the connection; a write in progress when the connection is
    /// disposed returns [`WireError::NotConnected`].
    pub async fn send_with(&self, message: Message, encrypted: bool) -> Result<(), WireError> {
        let mut guard = self.lock_writer().await?;
        let cipher = if encrypted {
            Some(self.cipher().ok_or(WireError::EncryptionNotEstablished)?)
        } else {
            None
        };
        self.write_locked(&mut guard, message, cipher.as_deref())
            .await
    }

    /// Take the writer lock, giving up as soon as the connection is disposed.
    async fn lock_writer(
        &self,
    ) -> Result<tokio::sync::MutexGuard<'_, Option<OwnedWriteHalf>>, WireError> {
        let mut closed = self.inner.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(WireError::NotConnected);
        }
        tokio::select! {
            _ = closed.changed() => Err(WireError::NotConnected),
            guard = self.inner.writer.lock() => Ok(guard),
        }
    }

    /// Write one frame while the caller holds the writer lock.
    async fn write_locked(
        &self,
        guard: &mut Option<OwnedWriteHalf>,
        message: Message,
        cipher: Option<&SessionCipher>,
    ) -> Result<(), WireError> {
        let mut closed = self.inner.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(WireError::NotConnected);
        }
        let writer = guard.as_mut().ok_or(WireError::NotConnected)?;

        let frame = match cipher {
            Some(cipher) => Message::Encrypted(cipher.seal(&message)?),
            None => message,
        };
        let bytes = encode_message(&frame, self.inner.config.max_message_size)?;

        let write = tokio::time::timeout(
            self.inner.config.write_timeout(),
            write_frame(writer, &bytes),
        );
        let result = tokio::select! {
            _ = closed.changed() => return Err(WireError::NotConnected),
            result = write => result,
        };

        match result {
            Ok(Ok(())) => {
                debug!(conn = self.id(), kind = frame.kind(), len = bytes.len(), "Frame sent");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(conn = self.id(), peer = %self.peer_addr(), error = %e, "Write failed");
                self.report_removal(RemoveReason::Disconnect);
                Ok(())
            }
            Err(_) => {
                warn!(
                    conn = self.id(),
                    peer = %self.peer_addr(),
                    timeout_ms = self.inner.config.write_timeout_ms,
                    "Write stalled, dropping connection"
                );
                // A partial frame is on the wire; the stream cannot be reused.
                drop(guard.take());
                if self.mark_disposed() {
                    self.report_removal(RemoveReason::Disconnect);
                }
                Ok(())
            }
        }
    }

    /// Send a request and wait for its typed reply, using the current
    /// encryption state and the configured timeout.
    ///
    /// `Ok(None)` means no matching reply arrived in time.
    pub async fn request<R: ReplyType>(
        &self,
        body: impl Into<RequestBody>,
    ) -> Result<Option<R>, WireError> {
        let encrypted = self.has_encrypted_connection();
        let wait = self.inner.config.request_timeout();
        self.request_with(Request::new(body), encrypted, wait).await
    }

    pub async fn request_encrypted<R: ReplyType>(
        &self,
        body: impl Into<RequestBody>,
    ) -> Result<Option<R>, WireError> {
        let wait = self.inner.config.request_timeout();
        self.request_with(Request::new(body), true, wait).await
    }

    /// Send `request` and wait up to `wait` for a response with the same id
    /// whose body matches `R`.
    ///
    /// Returns `Ok(None)` on timeout or if the connection is disposed while
    /// waiting. A reply arriving later stays buffered.
    pub async fn request_with<R: ReplyType>(
        &self,
        request: Request,
        encrypted: bool,
        wait: Duration,
    ) -> Result<Option<R>, WireError> {
        let id = request.id;
        self.send_with(Message::Request(request), encrypted).await?;
        Ok(self.wait_for_reply(&id, wait).await)
    }

    async fn wait_for_reply<R: ReplyType>(&self, id: &RequestId, wait: Duration) -> Option<R> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Register interest before checking so a push in between is not missed.
            let notified = self.inner.reply_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(reply) = self.take_reply::<R>(id) {
                return Some(reply);
            }
            if self.is_disposed() {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!(conn = self.id(), request_id = %id, "Request timed out");
                return None;
            }
        }
    }

    fn take_reply<R: ReplyType>(&self, id: &RequestId) -> Option<R> {
        self.inner
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take::<R>(id)
    }

    /// Run the key-exchange handshake as initiator.
    ///
    /// Returns `Ok(true)` once a session cipher shared with the peer is
    /// installed, `Ok(false)` if the peer rejected the exchange or did not
    /// answer in time. The previous encryption state is kept on failure.
    pub async fn initiate_encryption(&self) -> Result<bool, WireError> {
        if self.is_disposed() {
            return Err(WireError::NotConnected);
        }
        let asymmetric_key_bits = self.inner.config.asymmetric_key_bits;
        let symmetric_key_bits = self.inner.config.symmetric_key_bits;

        let keypair =
            tokio::task::spawn_blocking(move || KeyPair::generate(asymmetric_key_bits as usize))
                .await
                .map_err(|e| WireError::Crypto(format!("key generation task failed: {e}")))??;

        let request = KeyExchangeRequest {
            asymmetric_key_bits,
            symmetric_key_bits,
            public_exponent: keypair.public_exponent(),
            public_modulus: keypair.public_modulus(),
        };
        let encrypted = self.has_encrypted_connection();
        let wait = self.inner.config.request_timeout();
        let response: Option<KeyExchangeResponse> = self
            .request_with(Request::new(request), encrypted, wait)
            .await?;

        match response {
            Some(response) if response.accepted => {
                let cipher = keypair
                    .decrypt(&response.encrypted_symmetric_key)
                    .and_then(|key| {
                        let iv = keypair.decrypt(&response.encrypted_symmetric_iv)?;
                        SessionCipher::new(&key, &iv)
                    });
                match cipher {
                    Ok(cipher) => {
                        info!(
                            conn = self.id(),
                            peer = %self.peer_addr(),
                            key_bits = cipher.key_bits(),
                            "Encryption established"
                        );
                        self.set_cipher(cipher);
                        Ok(true)
                    }
                    Err(e) => {
                        warn!(conn = self.id(), error = %e, "Unusable key exchange response");
                        Ok(false)
                    }
                }
            }
            Some(_) => {
                info!(conn = self.id(), "Key exchange rejected by peer");
                Ok(false)
            }
            None => {
                warn!(conn = self.id(), "Key exchange timed out");
                Ok(false)
            }
        }
    }

    /// Responder side of the handshake: generate a session key, send it
    /// encrypted under the requester's public key, then adopt it.
    ///
    /// The reply travels under the encryption state that existed before the
    /// exchange, so the initiator can still read it. The new cipher is
    /// installed before the reply is written: the first encrypted frame the
    /// initiator sends can only follow the reply.
    pub(crate) async fn respond_to_key_exchange(
        &self,
        id: RequestId,
        request: &KeyExchangeRequest,
    ) -> Result<(), WireError> {
        let prepared = PublicKey::from_components(&request.public_modulus, &request.public_exponent)
            .and_then(|public| {
                let cipher = SessionCipher::generate(request.symmetric_key_bits)?;
                let response = KeyExchangeResponse {
                    accepted: true,
                    encrypted_symmetric_key: public.encrypt(cipher.key())?,
                    encrypted_symmetric_iv: public.encrypt(cipher.iv())?,
                };
                Ok((cipher, response))
            });

        match prepared {
            Ok((cipher, response)) => {
                let key_bits = cipher.key_bits();
                let mut guard = self.lock_writer().await?;
                let previous = self.cipher();
                self.set_cipher(cipher);
                self.write_locked(
                    &mut guard,
                    Response::new(id, response).into(),
                    previous.as_deref(),
                )
                .await?;
                info!(
                    conn = self.id(),
                    peer = %self.peer_addr(),
                    key_bits,
                    "Accepted key exchange"
                );
            }
            Err(e) => {
                warn!(conn = self.id(), error = %e, "Rejecting key exchange");
                self.send(Response::new(id, KeyExchangeResponse::rejected()))
                    .await?;
            }
        }
        Ok(())
    }

    /// Tell the peer we are leaving, then dispose.
    pub async fn close(&self) {
        if self.is_disposed() {
            return;
        }
        if let Err(e) = self.send(Notification::Goodbye).await {
            debug!(conn = self.id(), error = %e, "Goodbye not sent");
        }
        self.dispose().await;
    }

    /// Shut the socket down and stop the receive loop. Idempotent.
    ///
    /// Pending request waits return `None`; later sends fail with
    /// [`WireError::NotConnected`].
    pub async fn dispose(&self) {
        if !self.mark_disposed() {
            return;
        }

        // Any in-flight write has been told to abort, so the lock frees up.
        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
        debug!(conn = self.id(), peer = %self.peer_addr(), "Connection disposed");
    }

    /// Flag the connection disposed and wake everything waiting on it.
    /// Returns `false` if it already was.
    fn mark_disposed(&self) -> bool {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.closed.send_replace(true);
        self.inner.shutdown.notify_one();
        self.inner.reply_signal.notify_waiters();
        true
    }

    /// Dispose after a detected failure and notify the tracking registry.
    async fn lost(&self, reason: RemoveReason) {
        if self.is_disposed() {
            return;
        }
        self.dispose().await;
        self.report_removal(reason);
    }

    /// Handle one inbound frame. Returns `false` when the loop should stop.
    async fn handle_inbound(&self, message: Message) -> bool {
        let message = match message {
            Message::Encrypted(envelope) => {
                let Some(cipher) = self.cipher() else {
                    debug!(conn = self.id(), "Dropping encrypted frame: no session cipher");
                    return true;
                };
                match cipher.open(&envelope) {
                    Ok(inner) => inner,
                    Err(e) => {
                        warn!(conn = self.id(), error = %e, "Dropping undecryptable frame");
                        return true;
                    }
                }
            }
            other => other,
        };

        match message {
            Message::Response(response) => {
                self.inner
                    .replies
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(response);
                self.inner.reply_signal.notify_waiters();
            }
            Message::Notification(Notification::Goodbye) => {
                debug!(conn = self.id(), peer = %self.peer_addr(), "Peer closed the session");
                self.lost(RemoveReason::ClientRequest).await;
                return false;
            }
            Message::Encrypted(_) => {
                warn!(conn = self.id(), "Dropping nested encrypted envelope");
            }
            other => {
                debug!(conn = self.id(), kind = other.kind(), "Dispatching to modules");
                let conn = self.clone();
                tokio::spawn(async move {
                    let modules = Arc::clone(&conn.inner.modules);
                    dispatch(&other, &conn, &modules).await;
                });
            }
        }
        true
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("peer_addr", &self.peer_addr())
            .field("state", &self.state())
            .finish()
    }
}

/// Per-connection read loop. Blocks on the next frame until the peer goes
/// away or the connection is disposed.
async fn receive_loop(conn: Connection, mut reader: OwnedReadHalf) {
    let max_size = conn.inner.config.max_message_size;
    loop {
        if conn.is_disposed() {
            break;
        }
        let result = tokio::select! {
            _ = conn.inner.shutdown.notified() => break,
            result = read_message(&mut reader, max_size) => result,
        };

        match result {
            Ok(message) => {
                if !conn.handle_inbound(message).await {
                    break;
                }
            }
            Err(WireError::Json(e)) => {
                // The length prefix was honored, so the stream is still in sync.
                warn!(conn = conn.id(), error = %e, "Dropping malformed frame");
            }
            Err(WireError::ConnectionClosed) => {
                debug!(conn = conn.id(), peer = %conn.peer_addr(), "Peer disconnected");
                conn.lost(RemoveReason::Disconnect).await;
                break;
            }
            Err(e) => {
                warn!(conn = conn.id(), peer = %conn.peer_addr(), error = %e, "Receive failed");
                conn.lost(RemoveReason::Disconnect).await;
                break;
            }
        }
    }
    debug!(conn = conn.id(), "Receive loop ended");
}

/// Write a framed message (4-byte length + JSON).
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), WireError> {
    let bytes = encode_message(msg, MAX_MESSAGE_SIZE)?;
    write_frame(writer, &bytes).await?;
    Ok(())
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Read a framed message (4-byte length + JSON).
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: u32,
) -> Result<Message, WireError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > max_size {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    let msg = decode_message(&body)?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::time::Instant;
    use tokio::net::TcpListener;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            asymmetric_key_bits: 1024,
            request_timeout_ms: 5000,
            ..Default::default()
        }
    }

    /// A connection whose peer is a bare socket driven by the test.
    async fn raw_peer() -> (Connection, OwnedReadHalf, OwnedWriteHalf) {
        raw_peer_with(test_config()).await
    }

    async fn raw_peer_with(config: ConnectionConfig) -> (Connection, OwnedReadHalf, OwnedWriteHalf) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (client, accepted) = tokio::join!(
            Connection::connect_with("127.0.0.1", port, Vec::new(), config),
            listener.accept()
        );
        let (stream, _) = accepted.unwrap();
        let (reader, writer) = stream.into_split();
        (client.unwrap(), reader, writer)
    }

    #[tokio::test]
    async fn test_frames_plain_then_encrypted() {
        let (client, mut reader, mut writer) = raw_peer().await;

        client
            .send(Notification::custom("before", serde_json::json!(1)))
            .await
            .unwrap();
        let frame = read_message(&mut reader, MAX_MESSAGE_SIZE).await.unwrap();
        assert!(matches!(frame, Message::Notification(_)));
        assert_eq!(client.state(), ConnectionState::Open);

        let initiator = client.clone();
        let handshake = tokio::spawn(async move { initiator.initiate_encryption().await });

        // Play the responder by hand
        let (id, request) = match read_message(&mut reader, MAX_MESSAGE_SIZE).await.unwrap() {
            Message::Request(Request {
                id,
                body: RequestBody::KeyExchange(request),
            }) => (id, request),
            other => panic!("Expected KeyExchange request, got {other:?}"),
        };
        assert_eq!(request.asymmetric_key_bits, 1024);
        assert_eq!(request.symmetric_key_bits, 256);
        let public =
            PublicKey::from_components(&request.public_modulus, &request.public_exponent).unwrap();
        let session = SessionCipher::generate(request.symmetric_key_bits).unwrap();
        let response = Response::new(
            id,
            KeyExchangeResponse {
                accepted: true,
                encrypted_symmetric_key: public.encrypt(session.key()).unwrap(),
                encrypted_symmetric_iv: public.encrypt(session.iv()).unwrap(),
            },
        );
        write_message(&mut writer, &response.into()).await.unwrap();

        assert!(handshake.await.unwrap().unwrap());
        assert!(client.has_encrypted_connection());
        assert_eq!(client.state(), ConnectionState::Encrypted);

        client
            .send(Notification::custom("after", serde_json::json!(2)))
            .await
            .unwrap();
        match read_message(&mut reader, MAX_MESSAGE_SIZE).await.unwrap() {
            Message::Encrypted(envelope) => {
                let inner = session.open(&envelope).unwrap();
                assert_eq!(
                    inner,
                    Message::Notification(Notification::custom("after", serde_json::json!(2)))
                );
            }
            other => panic!("Expected encrypted frame, got {other:?}"),
        }

        // Plaintext can still be forced
        client
            .send_with(Notification::Goodbye.into(), false)
            .await
            .unwrap();
        let frame = read_message(&mut reader, MAX_MESSAGE_SIZE).await.unwrap();
        assert_eq!(frame, Message::Notification(Notification::Goodbye));
    }

    #[tokio::test]
    async fn test_rejected_key_exchange_keeps_plaintext() {
        let (client, mut reader, mut writer) = raw_peer().await;
        let initiator = client.clone();
        let handshake = tokio::spawn(async move { initiator.initiate_encryption().await });

        let id = match read_message(&mut reader, MAX_MESSAGE_SIZE).await.unwrap() {
            Message::Request(request) => request.id,
            other => panic!("Expected request, got {other:?}"),
        };
        let response = Response::new(id, KeyExchangeResponse::rejected());
        write_message(&mut writer, &response.into()).await.unwrap();

        assert!(!handshake.await.unwrap().unwrap());
        assert!(!client.has_encrypted_connection());
    }

    #[tokio::test]
    async fn test_encrypted_send_without_cipher_fails() {
        let (client, _reader, _writer) = raw_peer().await;
        let err = client
            .send_encrypted(Notification::Goodbye)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::EncryptionNotEstablished));
    }

    #[tokio::test]
    async fn test_send_after_dispose_fails() {
        let (client, _reader, _writer) = raw_peer().await;
        client.dispose().await;
        assert_eq!(client.state(), ConnectionState::Disposed);
        assert!(!client.is_connected());

        let err = client.send(Notification::Goodbye).await.unwrap_err();
        assert!(matches!(err, WireError::NotConnected));
        let err = client
            .request::<PingResponse>(PingRequest::now())
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::NotConnected));
        assert!(matches!(
            client.initiate_encryption().await,
            Err(WireError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_request_times_out_without_responder() {
        let (client, _reader, _writer) = raw_peer().await;
        let started = Instant::now();
        let reply: Option<PingResponse> = client
            .request_with(
                Request::new(PingRequest::now()),
                false,
                Duration::from_millis(200),
            )
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert!(reply.is_none());
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_dispose_wakes_pending_request() {
        let (client, _reader, _writer) = raw_peer().await;
        let waiter = client.clone();
        let pending = tokio::spawn(async move {
            waiter
                .request_with::<PingResponse>(
                    Request::new(PingRequest::now()),
                    false,
                    Duration::from_secs(30),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        client.dispose().await;

        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("waiter must not hang after dispose")
            .unwrap();
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_requests_answered_out_of_order() {
        let (client, mut reader, mut writer) = raw_peer().await;

        let first = Request::new(CustomRequest::new("job", serde_json::json!(1)));
        let second = Request::new(CustomRequest::new("job", serde_json::json!(2)));
        let (first_id, second_id) = (first.id, second.id);

        let c1 = client.clone();
        let c2 = client.clone();
        let wait = Duration::from_secs(5);
        let t1 = tokio::spawn(async move {
            c1.request_with::<CustomResponse>(first, false, wait).await
        });
        let t2 = tokio::spawn(async move {
            c2.request_with::<CustomResponse>(second, false, wait).await
        });

        for _ in 0..2 {
            read_message(&mut reader, MAX_MESSAGE_SIZE).await.unwrap();
        }
        // Answer the second request first
        for (id, value) in [(second_id, 2), (first_id, 1)] {
            let response = Response::new(
                id,
                CustomResponse {
                    name: "job".to_string(),
                    payload: serde_json::json!(value * 10),
                },
            );
            write_message(&mut writer, &response.into()).await.unwrap();
        }

        let r1 = t1.await.unwrap().unwrap().unwrap();
        let r2 = t2.await.unwrap().unwrap().unwrap();
        assert_eq!(r1.payload, serde_json::json!(10));
        assert_eq!(r2.payload, serde_json::json!(20));
    }

    #[tokio::test]
    async fn test_bad_frames_do_not_stop_receive_loop() {
        let (_client, mut reader, mut writer) = raw_peer().await;

        // Malformed JSON body with a valid length prefix
        let garbage = b"{not json";
        writer
            .write_all(&(garbage.len() as u32).to_be_bytes())
            .await
            .unwrap();
        writer.write_all(garbage).await.unwrap();

        // Envelope the client cannot open (no cipher yet)
        let stranger = SessionCipher::generate(256).unwrap();
        let envelope = stranger
            .seal(&Message::Notification(Notification::Goodbye))
            .unwrap();
        write_message(&mut writer, &envelope.into()).await.unwrap();

        // The built-in ping responder must still answer
        let timestamp = Utc.timestamp_opt(12, 0).unwrap();
        let ping = Request::new(PingRequest { timestamp });
        let ping_id = ping.id;
        write_message(&mut writer, &ping.into()).await.unwrap();

        match read_message(&mut reader, MAX_MESSAGE_SIZE).await.unwrap() {
            Message::Response(Response {
                id,
                body: ResponseBody::Ping(pong),
            }) => {
                assert_eq!(id, ping_id);
                assert_eq!(pong.timestamp, timestamp);
            }
            other => panic!("Expected Pong, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_close_disposes_connection() {
        let (client, reader, writer) = raw_peer().await;
        drop(reader);
        drop(writer);

        let deadline = Instant::now() + Duration::from_secs(2);
        while client.is_connected() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(client.state(), ConnectionState::Disposed);
    }

    /// Far more than loopback socket buffers absorb, so a write to a peer
    /// that never reads cannot complete.
    fn bulk_notification() -> Notification {
        Notification::custom("bulk", serde_json::json!("x".repeat(32 * 1024 * 1024)))
    }

    fn bulk_config() -> ConnectionConfig {
        ConnectionConfig {
            max_message_size: 64 * 1024 * 1024,
            ..test_config()
        }
    }

    #[tokio::test]
    async fn test_dispose_interrupts_stalled_write() {
        // The raw peer never reads
        let (client, _reader, _writer) = raw_peer_with(bulk_config()).await;
        let sender = client.clone();
        let stalled = tokio::spawn(async move { sender.send(bulk_notification()).await });
        tokio::time::sleep(Duration::from_millis(200)).await;

        tokio::time::timeout(Duration::from_secs(2), client.dispose())
            .await
            .expect("dispose must not wait for a stalled write");
        let result = tokio::time::timeout(Duration::from_secs(2), stalled)
            .await
            .expect("stalled send must return once disposed")
            .unwrap();
        assert!(matches!(result, Err(WireError::NotConnected)));

        let later = tokio::time::timeout(
            Duration::from_secs(2),
            client.send(Notification::Goodbye),
        )
        .await
        .expect("send after dispose must fail fast");
        assert!(matches!(later, Err(WireError::NotConnected)));
    }

    #[tokio::test]
    async fn test_queued_send_released_by_dispose() {
        let (client, _reader, _writer) = raw_peer_with(bulk_config()).await;
        let first = client.clone();
        let _stalled = tokio::spawn(async move { first.send(bulk_notification()).await });
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Waits behind the stalled write for the writer lock
        let second = client.clone();
        let queued = tokio::spawn(async move { second.send(Notification::Goodbye).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.dispose().await;
        let result = tokio::time::timeout(Duration::from_secs(2), queued)
            .await
            .expect("queued send must return once disposed")
            .unwrap();
        assert!(matches!(result, Err(WireError::NotConnected)));
    }

    #[tokio::test]
    async fn test_stalled_write_times_out_and_disposes() {
        let config = ConnectionConfig {
            write_timeout_ms: 300,
            ..bulk_config()
        };
        let (client, _reader, _writer) = raw_peer_with(config).await;

        let result = tokio::time::timeout(Duration::from_secs(5), client.send(bulk_notification()))
            .await
            .expect("write timeout must bound the send");
        assert!(result.is_ok());
        assert_eq!(client.state(), ConnectionState::Disposed);
    }

    #[tokio::test]
    async fn test_write_failure_reports_disconnect() {
        let (client, _reader, _writer) = raw_peer().await;
        let (removals, mut reports) = mpsc::unbounded_channel();
        assert!(client.attach_removal(removals.clone()));
        assert!(!client.attach_removal(removals));

        // Close our sending side so the next write hits EPIPE
        {
            let guard = client.inner.writer.lock().await;
            let stream: &TcpStream = guard.as_ref().unwrap().as_ref();
            socket2::SockRef::from(stream)
                .shutdown(std::net::Shutdown::Write)
                .unwrap();
        }

        let result = client
            .send(Notification::custom("lost", serde_json::json!(1)))
            .await;
        assert!(result.is_ok());

        let (reported, reason) = tokio::time::timeout(Duration::from_secs(2), reports.recv())
            .await
            .expect("write failure must be reported")
            .unwrap();
        assert_eq!(reported, client);
        assert_eq!(reason, RemoveReason::Disconnect);
    }

    #[tokio::test]
    async fn test_oversized_send_is_refused_before_writing() {
        let config = ConnectionConfig {
            max_message_size: 1024,
            ..test_config()
        };
        let (client, mut reader, _writer) = raw_peer_with(config).await;

        let big = Notification::custom("big", serde_json::json!("x".repeat(2048)));
        let err = client.send(big).await.unwrap_err();
        assert!(matches!(err, WireError::MessageTooLarge { max: 1024, .. }));
        assert!(client.is_connected());

        // Nothing of the refused frame reached the wire
        let small = Notification::custom("small", serde_json::json!(1));
        client.send(small.clone()).await.unwrap();
        let frame = read_message(&mut reader, MAX_MESSAGE_SIZE).await.unwrap();
        assert_eq!(frame, Message::Notification(small));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        b.write_all(&(1024u32).to_be_bytes()).await.unwrap();
        let err = read_message(&mut a, 512).await.unwrap_err();
        assert!(matches!(
            err,
            WireError::MessageTooLarge { size: 1024, max: 512 }
        ));
    }
}
