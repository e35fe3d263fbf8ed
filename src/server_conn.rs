//! The transient binding between a player and one backend server: one per
//! connection attempt, promoted to the player's current server when the
//! join ceremony completes.

use crate::{
    connection::{Connection, ConnectionSettings},
    forge::{self, BackendPhase},
    player::ConnectedPlayer,
    protocol::{
        packet::{Handshake, LoginStart, Packet},
        Direction, State,
    },
    proxy::RegisteredServer,
    session_backend::BackendLoginSessionHandler,
};
use anyhow::{bail, Context};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::{net::TcpStream, sync::oneshot, time::timeout};

/// How a backend connection attempt resolved.
#[derive(Debug, Clone)]
pub enum JoinResult {
    /// The switch ceremony completed and the connection was promoted.
    Success,
    /// The backend refused the player, with the JSON reason it sent.
    Disconnected(String),
}

pub struct ServerConnection {
    player: Arc<ConnectedPlayer>,
    server: RegisteredServer,
    conn: RwLock<Option<Arc<Connection>>>,
    phase: RwLock<BackendPhase>,
    /// Id of the last keep-alive relayed from this backend to the client.
    pub(crate) last_ping_id: AtomicI64,
    /// Wall-clock millisecond the last keep-alive was relayed.
    pub(crate) last_ping_sent: AtomicI64,
    gracefully_closed: AtomicBool,
    join_signal: Mutex<Option<oneshot::Sender<JoinResult>>>,
}

pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl ServerConnection {
    pub fn server(&self) -> &RegisteredServer {
        &self.server
    }

    pub fn player(&self) -> &Arc<ConnectedPlayer> {
        &self.player
    }

    /// The backend connection, absent until the dial succeeds.
    pub fn conn(&self) -> Option<Arc<Connection>> {
        self.conn.read().unwrap().clone()
    }

    pub fn active(&self) -> bool {
        self.conn().map_or(false, |conn| !conn.closed())
    }

    pub fn phase(&self) -> BackendPhase {
        *self.phase.read().unwrap()
    }

    pub(crate) fn set_phase(&self, phase: BackendPhase) {
        *self.phase.write().unwrap() = phase;
    }

    pub(crate) fn gracefully_closed(&self) -> bool {
        self.gracefully_closed.load(Ordering::SeqCst)
    }

    /// Records that a keep-alive with `id` was relayed to the client just
    /// now. Touched from the keep-alive fast path, hence lock free.
    pub(crate) fn record_ping_relay(&self, id: i64) {
        self.last_ping_id.store(id, Ordering::SeqCst);
        self.last_ping_sent.store(unix_millis(), Ordering::SeqCst);
    }

    /// Opens a connection to `server` on behalf of `player` and drives it
    /// until the join ceremony resolves.
    pub async fn connect(
        player: &Arc<ConnectedPlayer>,
        server: RegisteredServer,
    ) -> anyhow::Result<JoinResult> {
        if player.connection_in_flight().is_some() {
            bail!("already connecting to a server");
        }

        let (join_tx, join_rx) = oneshot::channel();
        let server_conn = Arc::new(ServerConnection {
            player: Arc::clone(player),
            server: server.clone(),
            conn: RwLock::new(None),
            phase: RwLock::new(player.connection().conn_type().initial_backend_phase()),
            last_ping_id: AtomicI64::new(-1),
            last_ping_sent: AtomicI64::new(0),
            gracefully_closed: AtomicBool::new(false),
            join_signal: Mutex::new(Some(join_tx)),
        });
        player.set_in_flight(Some(Arc::clone(&server_conn)));

        // Forge handshake traffic must reach the new backend from now on,
        // and the client's FML state machine must be rewound so the
        // handshake can replay against it.
        if let Some(current) = player.current_server() {
            current.set_phase(current.phase().on_depart_for_new_server());
            player.send_legacy_forge_handshake_reset().await;
        }

        let result = server_conn.establish(join_rx).await;
        if !matches!(result, Ok(JoinResult::Success)) {
            server_conn.disconnect().await;
            player.set_in_flight(None);
        }
        result
    }

    async fn establish(
        self: &Arc<Self>,
        join_rx: oneshot::Receiver<JoinResult>,
    ) -> anyhow::Result<JoinResult> {
        let player = &self.player;
        let config = player.proxy().config();
        let connect_timeout = config.connection_timeout();

        let stream = timeout(connect_timeout, TcpStream::connect(self.server.addr))
            .await
            .context("backend dial timed out")?
            .with_context(|| format!("dialing backend {}", self.server.name))?;
        stream.set_nodelay(true).ok();

        let conn = Connection::from_stream(
            stream,
            Direction::ClientBound,
            ConnectionSettings::from_config(config),
        )?;
        conn.set_protocol(player.protocol());
        conn.set_conn_type(player.connection().conn_type());
        *self.conn.write().unwrap() = Some(Arc::clone(&conn));

        // A legacy Forge backend learns about the modded client through the
        // handshake hostname marker, like it would from a direct join.
        let mut server_address = self.server.addr.ip().to_string();
        if player.connection().conn_type() == crate::connection::ConnectionType::LegacyForge {
            server_address.push_str(forge::HANDSHAKE_HOSTNAME_TOKEN);
        }

        conn.write_packet(&Packet::Handshake(Handshake {
            protocol_version: player.protocol().0,
            server_address,
            port: self.server.addr.port(),
            next_status: 2,
        }))
        .await?;
        conn.set_state(State::Login);
        conn.write_packet(&Packet::LoginStart(LoginStart {
            username: player.username().to_owned(),
        }))
        .await?;

        conn.set_session_handler(Arc::new(BackendLoginSessionHandler::new(Arc::clone(self))))
            .await;
        tokio::spawn(Arc::clone(&conn).read_loop());

        match timeout(connect_timeout, join_rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => bail!("backend connection lost before join completed"),
            Err(_) => bail!("backend join timed out"),
        }
    }

    /// Promotes this connection to the player's current server. The prior
    /// backend is disconnected first.
    pub(crate) async fn complete_join(self: &Arc<Self>) {
        if let Some(prior) = self.player.current_server() {
            if !Arc::ptr_eq(&prior, self) {
                prior.disconnect().await;
            }
        }
        self.player.set_connected_server(Some(Arc::clone(self)));
        self.player.set_in_flight(None);
        tracing::info!(
            player = %self.player,
            server = %self.server.name,
            "player connected to server"
        );
        self.send_join_result(JoinResult::Success);
    }

    pub(crate) fn send_join_result(&self, result: JoinResult) {
        if let Some(tx) = self.join_signal.lock().unwrap().take() {
            let _ = tx.send(result);
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(
        player: Arc<ConnectedPlayer>,
        server: RegisteredServer,
        conn: Arc<Connection>,
        phase: BackendPhase,
    ) -> Arc<Self> {
        Arc::new(Self {
            player,
            server,
            conn: RwLock::new(Some(conn)),
            phase: RwLock::new(phase),
            last_ping_id: AtomicI64::new(-1),
            last_ping_sent: AtomicI64::new(0),
            gracefully_closed: AtomicBool::new(false),
            join_signal: Mutex::new(None),
        })
    }

    /// Closes the backend connection without triggering failover.
    pub async fn disconnect(&self) {
        self.gracefully_closed.store(true, Ordering::SeqCst);
        let conn = self.conn.write().unwrap().take();
        if let Some(conn) = conn {
            let _ = conn.close().await;
        }
    }
}
