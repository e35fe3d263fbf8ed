//! A Minecraft connection between the proxy and either a player or a
//! backend server.
//!
//! Each connection owns one long-running read task; all packet handling for
//! the connection runs sequentially on that task, which is what gives the
//! session handlers their in-order delivery guarantee. Writes go through an
//! async mutex so the frame encoder only ever has a single writer.

use crate::protocol::{
    codec::{EncryptionKey, FrameDecoder, FrameEncoder},
    packet::{KeepAlive, Packet},
    registry,
    version::MINECRAFT_1_7_2,
    Decoder, Direction, Encoder, ProtoContext, ProtocolVersion, State,
};
use anyhow::anyhow;
use async_trait::async_trait;
use futures::FutureExt;
use std::{
    any::Any,
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

/// Delay before retrying a transiently failed read.
const READ_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Indicates a connection is already closed.
#[derive(Debug, thiserror::Error)]
#[error("connection is closed")]
pub struct ClosedError;

/// What kind of client is on the other end, as determined during the
/// handshake.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionType {
    Undetermined,
    Vanilla,
    LegacyForge,
}

/// A packet the registry does not know in the connection's current state.
/// Carried as the raw frame payload (id varint + body) so it can be
/// forwarded verbatim.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub id: i32,
    pub payload: Vec<u8>,
}

/// Handles received packets for the associated connection.
///
/// Since connections transition between states, packets need to be handled
/// differently over time; this behaviour is divided between session
/// handlers. A connection holds at most one handler.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// Called when the connection becomes managed by this handler.
    async fn activated(&self) {}
    /// Called when the connection is no longer managed by this handler.
    async fn deactivated(&self) {}
    /// Called with each decoded packet, in wire order.
    async fn handle_packet(&self, packet: Packet);
    /// Called with packets unknown in the current state. The default drops
    /// them.
    async fn handle_unknown_packet(&self, _frame: RawFrame) {}
    /// Called exactly once when the connection is closing.
    async fn disconnected(&self) {}

    /// Downcast support, so peers can reach a concrete handler.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct PacketReader {
    stream: Box<dyn AsyncRead + Send + Unpin>,
    decoder: FrameDecoder,
    chunk: Box<[u8; 8192]>,
}

struct PacketWriter {
    stream: Box<dyn AsyncWrite + Send + Unpin>,
    encoder: FrameEncoder,
    /// Frames buffered until the next flush.
    pending: Vec<u8>,
}

/// Timeouts and codec settings a connection is built with.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionSettings {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub compression_level: u32,
}

impl ConnectionSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            read_timeout: config.read_timeout(),
            write_timeout: config.connection_timeout(),
            compression_level: config.compression.level,
        }
    }
}

#[cfg(test)]
impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            compression_level: 6,
        }
    }
}

pub struct Connection {
    remote_addr: SocketAddr,
    /// Direction of the packets this connection reads. The connection to a
    /// player reads server-bound packets; a backend connection reads
    /// client-bound packets.
    direction: Direction,

    reader: Mutex<PacketReader>,
    writer: Mutex<PacketWriter>,

    protocol: RwLock<ProtocolVersion>,
    state: RwLock<State>,
    conn_type: RwLock<ConnectionType>,
    session_handler: Mutex<Option<Arc<dyn SessionHandler>>>,

    closed: AtomicBool,
    known_disconnect: AtomicBool,
    close_once: Mutex<bool>,
    cancel: CancellationToken,

    read_timeout: Duration,
    write_timeout: Duration,
}

impl Connection {
    pub fn new(
        read: Box<dyn AsyncRead + Send + Unpin>,
        write: Box<dyn AsyncWrite + Send + Unpin>,
        remote_addr: SocketAddr,
        direction: Direction,
        settings: ConnectionSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote_addr,
            direction,
            reader: Mutex::new(PacketReader {
                stream: read,
                decoder: FrameDecoder::new(),
                chunk: Box::new([0; 8192]),
            }),
            writer: Mutex::new(PacketWriter {
                stream: write,
                encoder: FrameEncoder::new(settings.compression_level),
                pending: Vec::new(),
            }),
            protocol: RwLock::new(MINECRAFT_1_7_2),
            state: RwLock::new(State::Handshake),
            conn_type: RwLock::new(ConnectionType::Undetermined),
            session_handler: Mutex::new(None),
            closed: AtomicBool::new(false),
            known_disconnect: AtomicBool::new(false),
            close_once: Mutex::new(false),
            cancel: CancellationToken::new(),
            read_timeout: settings.read_timeout,
            write_timeout: settings.write_timeout,
        })
    }

    pub fn from_stream(
        stream: TcpStream,
        direction: Direction,
        settings: ConnectionSettings,
    ) -> anyhow::Result<Arc<Self>> {
        let remote_addr = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        Ok(Self::new(
            Box::new(read),
            Box::new(write),
            remote_addr,
            direction,
            settings,
        ))
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn protocol(&self) -> ProtocolVersion {
        *self.protocol.read().unwrap()
    }

    /// Sets the protocol version. The registry lookups on both the read and
    /// write paths observe the single stored value, so decode and encode
    /// switch together.
    pub fn set_protocol(&self, protocol: ProtocolVersion) {
        *self.protocol.write().unwrap() = protocol;
    }

    pub fn state(&self) -> State {
        *self.state.read().unwrap()
    }

    pub fn set_state(&self, state: State) {
        *self.state.write().unwrap() = state;
    }

    pub fn conn_type(&self) -> ConnectionType {
        *self.conn_type.read().unwrap()
    }

    pub fn set_conn_type(&self, conn_type: ConnectionType) {
        *self.conn_type.write().unwrap() = conn_type;
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn known_disconnect(&self) -> bool {
        self.known_disconnect.load(Ordering::SeqCst)
    }

    /// Cancelled when the connection closes. Commands derive their
    /// invocation context from this.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn session_handler(&self) -> Option<Arc<dyn SessionHandler>> {
        self.session_handler.lock().await.clone()
    }

    /// Installs a new session handler: `deactivated` runs on the old
    /// handler and the new one is installed under the handler lock, then
    /// `activated` runs. Activation may write packets, and a failed write
    /// closes the connection, which needs the handler lock again.
    pub async fn set_session_handler(&self, handler: Arc<dyn SessionHandler>) {
        {
            let mut slot = self.session_handler.lock().await;
            if let Some(old) = slot.take() {
                old.deactivated().await;
            }
            *slot = Some(Arc::clone(&handler));
        }
        handler.activated().await;
    }

    /// Sets the compression threshold on both codec halves. The caller is
    /// responsible for sending the SetCompression packet beforehand.
    pub async fn set_compression_threshold(&self, threshold: i32) {
        tracing::debug!(threshold, "set compression threshold");
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;
        reader.decoder.set_compression_threshold(threshold);
        writer.encoder.set_compression_threshold(threshold);
    }

    /// Enables AES/CFB8 encryption keyed by the negotiated shared secret.
    /// All subsequent I/O in both directions is encrypted transparently.
    pub async fn enable_encryption(&self, secret: &[u8]) -> anyhow::Result<()> {
        let key = EncryptionKey::from_secret(secret)?;
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;
        reader.decoder.enable_encryption(key);
        writer.encoder.enable_encryption(key);
        Ok(())
    }

    /// Encodes `packet` into the write buffer and flushes.
    ///
    /// The connection will be closed on any error encountered.
    pub async fn write_packet(&self, packet: &Packet) -> anyhow::Result<()> {
        if self.closed() {
            return Err(ClosedError.into());
        }
        let result = async {
            self.buffer_packet_locked(packet).await?;
            self.flush_locked().await
        }
        .await;
        self.close_on_err(result).await
    }

    /// Encodes `packet` into the write buffer without flushing.
    pub async fn buffer_packet(&self, packet: &Packet) -> anyhow::Result<()> {
        if self.closed() {
            return Err(ClosedError.into());
        }
        let result = self.buffer_packet_locked(packet).await;
        self.close_on_err(result).await
    }

    /// Buffers a raw payload (packet id + data), framing it for this
    /// connection's codec settings.
    pub async fn buffer_payload(&self, payload: &[u8]) -> anyhow::Result<()> {
        if self.closed() {
            return Err(ClosedError.into());
        }
        let result = async {
            let mut writer = self.writer.lock().await;
            let PacketWriter {
                encoder, pending, ..
            } = &mut *writer;
            encoder.encode_frame(payload, pending)
        }
        .await;
        self.close_on_err(result).await
    }

    /// Writes a raw payload and flushes.
    pub async fn write_payload(&self, payload: &[u8]) -> anyhow::Result<()> {
        if self.closed() {
            return Err(ClosedError.into());
        }
        let result = async {
            {
                let mut writer = self.writer.lock().await;
                let PacketWriter {
                    encoder, pending, ..
                } = &mut *writer;
                encoder.encode_frame(payload, pending)?;
            }
            self.flush_locked().await
        }
        .await;
        self.close_on_err(result).await
    }

    /// Writes the buffered frames to the socket under the write deadline.
    pub async fn flush(&self) -> anyhow::Result<()> {
        if self.closed() {
            return Err(ClosedError.into());
        }
        let result = self.flush_locked().await;
        self.close_on_err(result).await
    }

    async fn buffer_packet_locked(&self, packet: &Packet) -> anyhow::Result<()> {
        let state = self.state();
        let ctx = ProtoContext {
            version: self.protocol(),
            direction: self.direction.opposite(),
        };
        let id = registry::packet_id(state, ctx.direction, packet.kind(), ctx.version)
            .ok_or_else(|| {
                anyhow!(
                    "packet {} is not registered for {:?} {:?} on {}",
                    packet.as_ref(),
                    state,
                    ctx.direction,
                    ctx.version
                )
            })?;

        let mut payload = Vec::new();
        let mut enc = Encoder::new(&mut payload);
        enc.write_var_int(id);
        packet.encode(&mut enc, &ctx);

        let mut writer = self.writer.lock().await;
        let PacketWriter {
            encoder, pending, ..
        } = &mut *writer;
        encoder.encode_frame(&payload, pending)
    }

    async fn flush_locked(&self) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        let pending = std::mem::take(&mut writer.pending);
        if pending.is_empty() {
            return Ok(());
        }
        timeout(self.write_timeout, async {
            writer.stream.write_all(&pending).await?;
            writer.stream.flush().await
        })
        .await
        .map_err(|_| anyhow!("write deadline exceeded"))??;
        Ok(())
    }

    async fn close_on_err(&self, result: anyhow::Result<()>) -> anyhow::Result<()> {
        if let Err(err) = &result {
            if !err.is::<ClosedError>() {
                tracing::debug!(error = %err, remote = %self.remote_addr, "error writing packet, closing connection");
            }
            let _ = self.close().await;
        }
        result
    }

    /// Sends a synthetic keep-alive if the connection is in Play state.
    /// Used for idle prevention.
    pub async fn send_keep_alive(&self) -> anyhow::Result<()> {
        if self.state() == State::Play {
            return self
                .write_packet(&Packet::KeepAlive(KeepAlive {
                    random_id: rand::random::<u64>() as i64,
                }))
                .await;
        }
        Ok(())
    }

    /// Closes the connection, if not already, and runs `disconnected()` on
    /// the current session handler. Safe to call multiple times; subsequent
    /// calls report [`ClosedError`].
    pub async fn close(&self) -> anyhow::Result<()> {
        self.close_known(true).await
    }

    /// Closes after writing `packet`, marking the disconnect as initiated by
    /// the proxy.
    pub async fn close_with(&self, packet: &Packet) -> anyhow::Result<()> {
        if self.closed() {
            return Err(ClosedError.into());
        }
        self.known_disconnect.store(true, Ordering::SeqCst);
        let _ = self.write_packet(packet).await;
        self.close().await
    }

    pub(crate) async fn close_known(&self, mark_known: bool) -> anyhow::Result<()> {
        // Re-entrant closes happen when a handler's disconnected() callback
        // ends up closing its own connection again; they must not block on
        // the in-progress close.
        if self.closed() {
            return Err(ClosedError.into());
        }
        let mut once = self.close_once.lock().await;
        if *once {
            return Err(ClosedError.into());
        }
        *once = true;

        if mark_known {
            self.known_disconnect.store(true, Ordering::SeqCst);
        }
        self.cancel.cancel();
        self.closed.store(true, Ordering::SeqCst);
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.stream.shutdown().await;
        }

        let handler = self.session_handler.lock().await.take();
        if let Some(handler) = handler {
            handler.disconnected().await;
        }
        Ok(())
    }

    async fn next_frame(&self) -> anyhow::Result<Vec<u8>> {
        let mut reader = self.reader.lock().await;
        loop {
            if let Some(frame) = reader.decoder.next_frame()? {
                return Ok(frame);
            }
            let PacketReader {
                stream,
                decoder,
                chunk,
            } = &mut *reader;
            let n = stream.read(&mut chunk[..]).await?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            decoder.give_data(&mut chunk[..n]);
        }
    }

    async fn dispatch(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        let mut dec = Decoder::new(&payload);
        let id = dec.read_var_int()?;
        let ctx = ProtoContext {
            version: self.protocol(),
            direction: self.direction,
        };
        let state = self.state();

        let Some(handler) = self.session_handler().await else {
            return Ok(());
        };

        match registry::packet_kind(state, self.direction, id, ctx.version) {
            Some(kind) => {
                let packet = Packet::decode(kind, &mut dec, &ctx)?;
                if !dec.is_finished() {
                    tracing::warn!(
                        packet = packet.as_ref(),
                        left = dec.remaining(),
                        "decoder left bytes after packet"
                    );
                }
                handler.handle_packet(packet).await;
            }
            None => {
                drop(dec);
                handler.handle_unknown_packet(RawFrame { id, payload }).await;
            }
        }
        Ok(())
    }

    /// The main task of this connection: reads packets and passes them to
    /// the current session handler until cancellation or an unrecoverable
    /// error. The connection is closed on return.
    pub async fn read_loop(self: Arc<Self>) {
        loop {
            if self.closed() {
                break;
            }
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = timeout(self.read_timeout, self.next_frame()) => result,
            };
            let payload = match frame {
                Err(_) => {
                    tracing::debug!(remote = %self.remote_addr, "read timeout exceeded");
                    break;
                }
                Ok(Err(err)) => {
                    if is_transient(&err) {
                        sleep(READ_RETRY_DELAY).await;
                        continue;
                    }
                    tracing::debug!(error = %err, remote = %self.remote_addr, "error reading next packet, closing connection");
                    break;
                }
                Ok(Ok(payload)) => payload,
            };

            match AssertUnwindSafe(self.dispatch(payload)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::debug!(error = %err, remote = %self.remote_addr, "error decoding packet, closing connection");
                    break;
                }
                Err(_) => {
                    tracing::error!(remote = %self.remote_addr, "recovered from panic in read loop");
                    break;
                }
            }
        }
        let _ = self.close_known(false).await;
    }
}

fn is_transient(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .map(|io| {
            matches!(
                io.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
            )
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{Chat, CHAT_MESSAGE};
    use crate::protocol::version::MINECRAFT_1_16;
    use crate::testutil::{pipe_pair, Recording};
    use uuid::Uuid;

    #[tokio::test]
    async fn packets_flow_in_wire_order() {
        let (proxy_side, peer_side) =
            pipe_pair(Direction::ServerBound, MINECRAFT_1_16, State::Play);
        let handler = Recording::new();
        proxy_side
            .set_session_handler(handler.clone() as Arc<dyn SessionHandler>)
            .await;
        let loop_task = tokio::spawn(proxy_side.clone().read_loop());

        peer_side
            .write_packet(&Packet::KeepAlive(KeepAlive { random_id: 7 }))
            .await
            .unwrap();
        peer_side
            .write_packet(&Packet::Chat(Chat {
                message: "hi".into(),
                message_type: CHAT_MESSAGE,
                sender: Uuid::nil(),
            }))
            .await
            .unwrap();
        peer_side.close().await.unwrap();
        loop_task.await.unwrap();

        let packets = handler.packets.lock().unwrap();
        assert_eq!(packets.len(), 2);
        assert!(matches!(packets[0], Packet::KeepAlive(KeepAlive { random_id: 7 })));
        assert!(matches!(&packets[1], Packet::Chat(c) if c.message == "hi"));
    }

    #[tokio::test]
    async fn unknown_packets_reach_handler_with_raw_payload() {
        let (proxy_side, peer_side) =
            pipe_pair(Direction::ServerBound, MINECRAFT_1_16, State::Play);
        let handler = Recording::new();
        proxy_side
            .set_session_handler(handler.clone() as Arc<dyn SessionHandler>)
            .await;
        let loop_task = tokio::spawn(proxy_side.clone().read_loop());

        // 0x55 is not registered in Play for any version.
        peer_side.write_payload(&[0x55, 0xAB, 0xCD]).await.unwrap();
        peer_side.close().await.unwrap();
        loop_task.await.unwrap();

        let unknown = handler.unknown.lock().unwrap();
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].id, 0x55);
        assert_eq!(unknown[0].payload, vec![0x55, 0xAB, 0xCD]);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_disconnects_once() {
        let (proxy_side, _peer_side) =
            pipe_pair(Direction::ServerBound, MINECRAFT_1_16, State::Play);
        let handler = Recording::new();
        proxy_side
            .set_session_handler(handler.clone() as Arc<dyn SessionHandler>)
            .await;

        proxy_side.close().await.unwrap();
        assert!(proxy_side.close().await.is_err());
        assert!(proxy_side.closed());
        assert!(proxy_side.known_disconnect());
        assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);

        assert!(proxy_side
            .write_packet(&Packet::KeepAlive(KeepAlive { random_id: 1 }))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn handler_swap_runs_deactivate_then_activate() {
        let (proxy_side, _peer_side) =
            pipe_pair(Direction::ServerBound, MINECRAFT_1_16, State::Play);
        let first = Recording::new();
        let second = Recording::new();
        proxy_side
            .set_session_handler(first.clone() as Arc<dyn SessionHandler>)
            .await;
        proxy_side
            .set_session_handler(second.clone() as Arc<dyn SessionHandler>)
            .await;

        assert_eq!(
            *first.lifecycle.lock().unwrap(),
            vec!["activated", "deactivated"]
        );
        assert_eq!(*second.lifecycle.lock().unwrap(), vec!["activated"]);
    }

    #[tokio::test]
    async fn eof_closes_and_fires_disconnected() {
        let (proxy_side, peer_side) =
            pipe_pair(Direction::ServerBound, MINECRAFT_1_16, State::Play);
        let handler = Recording::new();
        proxy_side
            .set_session_handler(handler.clone() as Arc<dyn SessionHandler>)
            .await;
        let loop_task = tokio::spawn(proxy_side.clone().read_loop());
        peer_side.close().await.unwrap();
        loop_task.await.unwrap();
        assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);
        // The close came from the read loop, not the proxy.
        assert!(!proxy_side.known_disconnect());
    }
}
