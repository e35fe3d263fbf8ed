//! Process-wide proxy state: the player registry, the registered server
//! catalog, the channel registrar, and the accept loop.

use crate::{
    command::CommandRegistry,
    component::Component,
    config::Config,
    connection::{Connection, ConnectionSettings},
    event::EventBus,
    player::ConnectedPlayer,
    protocol::{plugin, version::MINECRAFT_1_13, Direction, ProtocolVersion},
    session_handshake::HandshakeSessionHandler,
};
use anyhow::Context;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, RwLock},
};
use tokio::{net::TcpListener, sync::Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A backend server known to the proxy.
#[derive(Debug, Clone)]
pub struct RegisteredServer {
    pub name: String,
    pub addr: SocketAddr,
}

/// A plugin channel the proxy listens on, with its modern identifier and the
/// pre-1.13 name if it has one.
#[derive(Debug, Clone)]
pub struct ChannelIdentifier {
    pub id: String,
    pub legacy_id: Option<String>,
}

/// The channels the proxy itself has registered, advertised to clients on
/// join and consulted when routing plugin messages to events.
#[derive(Default)]
pub struct ChannelRegistrar {
    channels: RwLock<Vec<ChannelIdentifier>>,
}

impl ChannelRegistrar {
    pub fn register(&self, identifier: ChannelIdentifier) -> anyhow::Result<()> {
        if !plugin::valid_identifier(&identifier.id) {
            anyhow::bail!("invalid channel identifier {:?}", identifier.id);
        }
        self.channels.write().unwrap().push(identifier);
        Ok(())
    }

    /// Channel names for a REGISTER aimed at the given protocol version.
    pub fn channels_for_protocol(&self, version: ProtocolVersion) -> Vec<String> {
        self.channels
            .read()
            .unwrap()
            .iter()
            .filter_map(|c| {
                if version >= MINECRAFT_1_13 {
                    Some(c.id.clone())
                } else {
                    c.legacy_id.clone()
                }
            })
            .collect()
    }

    /// Looks a wire channel name up, matching either form.
    pub fn from_id(&self, channel: &str) -> Option<ChannelIdentifier> {
        self.channels
            .read()
            .unwrap()
            .iter()
            .find(|c| c.id == channel || c.legacy_id.as_deref() == Some(channel))
            .cloned()
    }
}

pub struct Proxy {
    config: Config,
    event: Arc<EventBus>,
    commands: CommandRegistry,
    channel_registrar: ChannelRegistrar,
    servers: RwLock<HashMap<String, RegisteredServer>>,
    players: Mutex<HashMap<Uuid, Arc<ConnectedPlayer>>>,
    shutdown: CancellationToken,
}

impl Proxy {
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let mut servers = HashMap::new();
        for (name, addr) in &config.servers {
            let addr: SocketAddr = addr
                .parse()
                .with_context(|| format!("invalid address for server {name:?}"))?;
            servers.insert(
                name.clone(),
                RegisteredServer {
                    name: name.clone(),
                    addr,
                },
            );
        }
        Ok(Arc::new(Self {
            config,
            event: Arc::new(EventBus::new()),
            commands: CommandRegistry::new(),
            channel_registrar: ChannelRegistrar::default(),
            servers: RwLock::new(servers),
            players: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn event(&self) -> &Arc<EventBus> {
        &self.event
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    pub fn channel_registrar(&self) -> &ChannelRegistrar {
        &self.channel_registrar
    }

    /// Looks up a registered server by name.
    pub fn server(&self, name: &str) -> Option<RegisteredServer> {
        self.servers.read().unwrap().get(name).cloned()
    }

    pub fn register_server(&self, server: RegisteredServer) {
        self.servers
            .write()
            .unwrap()
            .insert(server.name.clone(), server);
    }

    pub fn unregister_server(&self, name: &str) -> Option<RegisteredServer> {
        self.servers.write().unwrap().remove(name)
    }

    pub async fn player(&self, id: Uuid) -> Option<Arc<ConnectedPlayer>> {
        self.players.lock().await.get(&id).cloned()
    }

    pub async fn player_count(&self) -> usize {
        self.players.lock().await.len()
    }

    pub async fn players(&self) -> Vec<Arc<ConnectedPlayer>> {
        self.players.lock().await.values().cloned().collect()
    }

    /// Registers a freshly logged-in player. An incumbent with the same
    /// profile is flagged and closed before the new player takes its place.
    pub async fn register_connection(&self, player: &Arc<ConnectedPlayer>) {
        loop {
            let existing = self.players.lock().await.get(&player.id()).cloned();
            match existing {
                Some(existing) => {
                    existing
                        .disconnect_due_to_duplicate_connection
                        .store(true, std::sync::atomic::Ordering::SeqCst);
                    existing
                        .disconnect(&Component::text(
                            "You are already connected to this proxy!",
                        ))
                        .await;
                    // Teardown unregisters the incumbent; check again.
                    let mut players = self.players.lock().await;
                    if let Some(still) = players.get(&player.id()) {
                        if Arc::ptr_eq(still, &existing) {
                            players.remove(&player.id());
                        }
                    }
                }
                None => {
                    self.players
                        .lock()
                        .await
                        .insert(player.id(), Arc::clone(player));
                    return;
                }
            }
        }
    }

    /// Removes the player from the registry. Returns false when the player
    /// was never registered or was already replaced by a newer login.
    pub async fn unregister_connection(&self, player: &Arc<ConnectedPlayer>) -> bool {
        let mut players = self.players.lock().await;
        match players.get(&player.id()) {
            Some(existing) if Arc::ptr_eq(existing, player) => {
                players.remove(&player.id());
                true
            }
            _ => false,
        }
    }

    /// Binds the configured address and accepts client connections until
    /// shutdown.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.bind)
            .await
            .with_context(|| format!("binding {}", self.config.bind))?;
        tracing::info!(bind = %self.config.bind, "proxy listening");
        self.serve(listener).await
    }

    /// Accepts client connections from an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            let (stream, remote) = match accepted {
                Ok(x) => x,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to accept connection");
                    continue;
                }
            };
            tracing::debug!(remote = %remote, "accepted connection");
            stream.set_nodelay(true).ok();

            let conn = match Connection::from_stream(
                stream,
                Direction::ServerBound,
                ConnectionSettings::from_config(&self.config),
            ) {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to set up connection");
                    continue;
                }
            };
            conn.set_session_handler(Arc::new(HandshakeSessionHandler::new(
                Arc::clone(&conn),
                Arc::clone(&self),
            )))
            .await;
            tokio::spawn(conn.read_loop());
        }
    }

    /// Stops accepting and disconnects every player with `reason`.
    pub async fn shutdown(&self, reason: Component) {
        self.shutdown.cancel();
        let players = self.players().await;
        tracing::info!(count = players.len(), "shutting down, disconnecting players");
        for player in players {
            player.disconnect(&reason).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_player, test_proxy};

    #[test]
    fn channel_registrar_picks_name_by_era() {
        let registrar = ChannelRegistrar::default();
        registrar
            .register(ChannelIdentifier {
                id: "velocity:main".into(),
                legacy_id: Some("Velocity".into()),
            })
            .unwrap();
        registrar
            .register(ChannelIdentifier {
                id: "acme:modern_only".into(),
                legacy_id: None,
            })
            .unwrap();

        let modern = registrar.channels_for_protocol(crate::protocol::version::MINECRAFT_1_16);
        assert_eq!(modern, vec!["velocity:main", "acme:modern_only"]);

        let legacy = registrar.channels_for_protocol(crate::protocol::version::MINECRAFT_1_12_2);
        assert_eq!(legacy, vec!["Velocity"]);

        assert!(registrar.from_id("Velocity").is_some());
        assert!(registrar.from_id("velocity:main").is_some());
        assert!(registrar.from_id("other:chan").is_none());

        assert!(registrar
            .register(ChannelIdentifier {
                id: "NotValid".into(),
                legacy_id: None,
            })
            .is_err());
    }

    #[tokio::test]
    async fn duplicate_login_evicts_incumbent() {
        let proxy = test_proxy();
        let (first, _peer1) = test_player(&proxy, "Steve");
        let (second, _peer2) = test_player(&proxy, "Steve");
        assert_eq!(first.id(), second.id());

        proxy.register_connection(&first).await;
        assert_eq!(proxy.player_count().await, 1);

        proxy.register_connection(&second).await;
        assert_eq!(proxy.player_count().await, 1);
        assert!(Arc::ptr_eq(&proxy.player(second.id()).await.unwrap(), &second));

        // The incumbent was flagged and closed.
        assert!(first
            .disconnect_due_to_duplicate_connection
            .load(std::sync::atomic::Ordering::SeqCst));
        assert!(!first.active());
        assert!(second.active());
    }

    #[tokio::test]
    async fn unregister_is_conditional_on_identity() {
        let proxy = test_proxy();
        let (first, _peer1) = test_player(&proxy, "Steve");
        let (second, _peer2) = test_player(&proxy, "Steve");

        proxy.register_connection(&second).await;
        // `first` was never registered; unregistering it must not remove the
        // newer player.
        assert!(!proxy.unregister_connection(&first).await);
        assert_eq!(proxy.player_count().await, 1);
        assert!(proxy.unregister_connection(&second).await);
        assert_eq!(proxy.player_count().await, 0);
    }
}
