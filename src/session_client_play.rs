//! Handles communication with the connected Minecraft client during Play.
//! This is effectively the nerve center that joins backend servers with
//! players.

use crate::{
    command::{extract, CommandContext},
    connection::{Connection, RawFrame, SessionHandler},
    event::{CommandExecuteEvent, PlayerChatEvent, PluginMessageEvent},
    forge::BackendPhase,
    player::ConnectedPlayer,
    protocol::{
        packet::{
            Chat, JoinGame, KeepAlive, Packet, PluginMessage, Respawn, Title, CHAT_MESSAGE,
            MAX_SERVERBOUND_MESSAGE_LENGTH,
        },
        plugin,
        version::{MINECRAFT_1_16, MINECRAFT_1_8},
        State,
    },
    proxy::Proxy,
    server_conn::{unix_millis, ServerConnection},
};
use async_trait::async_trait;
use std::{
    any::Any,
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use uuid::Uuid;

pub struct ClientPlaySessionHandler {
    player: Arc<ConnectedPlayer>,
    spawned: AtomicBool,
    /// Plugin messages that raced ahead of the switch ceremony, drained to
    /// the new backend in FIFO order. Only touched on the client's read
    /// task.
    login_plugin_messages: Mutex<VecDeque<PluginMessage>>,
}

impl ClientPlaySessionHandler {
    pub fn new(player: Arc<ConnectedPlayer>) -> Arc<Self> {
        Arc::new(Self {
            player,
            spawned: AtomicBool::new(false),
            login_plugin_messages: Mutex::new(VecDeque::new()),
        })
    }

    fn proxy(&self) -> &Arc<Proxy> {
        self.player.proxy()
    }

    /// The backend connection, if one is attached and its handshake phase
    /// allows general packet forwarding.
    fn can_forward(&self) -> Option<Arc<Connection>> {
        let server_conn = self.player.current_server()?;
        let conn = server_conn.conn()?;
        server_conn.phase().considered_complete().then_some(conn)
    }

    async fn forward_to_server(&self, packet: &Packet) {
        if let Some(backend) = self.can_forward() {
            let _ = backend.write_packet(packet).await;
        }
    }

    async fn handle_keep_alive(&self, packet: KeepAlive) {
        let Some(server_conn) = self.player.current_server() else {
            return;
        };
        // A reply that does not match the last relayed id is stale, usually
        // from before a server switch. Dropped without forwarding.
        if packet.random_id != server_conn.last_ping_id.load(Ordering::SeqCst) {
            return;
        }
        let Some(backend) = server_conn.conn() else {
            return;
        };
        let last_sent = server_conn.last_ping_sent.load(Ordering::SeqCst);
        let elapsed = (unix_millis() - last_sent).max(0);
        self.player.set_ping(Duration::from_millis(elapsed as u64));
        if backend
            .write_packet(&Packet::KeepAlive(packet))
            .await
            .is_ok()
        {
            server_conn
                .last_ping_sent
                .store(unix_millis(), Ordering::SeqCst);
        }
    }

    async fn handle_chat(&self, packet: Chat) {
        let Some(server_conn) = self.player.current_server() else {
            return;
        };
        let Some(backend) = server_conn.conn() else {
            return;
        };

        if let Some(commandline) = packet.message.strip_prefix('/') {
            let commandline = commandline.trim().to_owned();
            let mut event =
                CommandExecuteEvent::new(Arc::clone(&self.player), commandline.clone());
            self.proxy().event().fire(&mut event);
            if !event.allowed() || !self.player.active() {
                return;
            }

            let (command, args) = extract(&commandline);
            if self.proxy().commands().has(command) {
                tracing::info!(player = %self.player, command = %commandline, "executing command");
                let ctx = CommandContext {
                    source: Arc::clone(&self.player),
                    args,
                    cancel: self.player.connection().cancellation().child_token(),
                };
                if let Err(err) = self.proxy().commands().invoke(command, ctx).await {
                    tracing::error!(command = %commandline, error = %err, "error invoking command");
                }
                return;
            }
            // Proxy command not registered, forward to the server.
        } else {
            let mut event =
                PlayerChatEvent::new(Arc::clone(&self.player), packet.message.clone());
            self.proxy().event().fire(&mut event);
            if !event.allowed() || !self.player.active() {
                return;
            }
            tracing::debug!(player = %self.player, message = %packet.message, "chat");
        }

        // Over-long messages must never leave the proxy.
        if packet.message.chars().count() > MAX_SERVERBOUND_MESSAGE_LENGTH {
            return;
        }
        let _ = backend
            .write_packet(&Packet::Chat(Chat {
                message: packet.message,
                message_type: CHAT_MESSAGE,
                sender: Uuid::nil(),
            }))
            .await;
    }

    async fn handle_plugin_message(&self, packet: PluginMessage) {
        let player = &self.player;
        let Some(server_conn) = player.current_server() else {
            return;
        };
        let Some(backend) = server_conn.conn() else {
            return;
        };

        if backend.state() != State::Play {
            tracing::warn!(
                channel = %packet.channel,
                "plugin message received while backend was not ready, discarded"
            );
        } else if plugin::is_register(&packet) {
            if backend
                .write_packet(&Packet::PluginMessage(packet.clone()))
                .await
                .is_ok()
            {
                player.add_known_channels(plugin::channels(&packet));
            }
        } else if plugin::is_unregister(&packet) {
            if backend
                .write_packet(&Packet::PluginMessage(packet.clone()))
                .await
                .is_ok()
            {
                player.remove_known_channels(plugin::channels(&packet).iter());
            }
        } else if plugin::is_brand(&packet) {
            let _ = backend
                .write_packet(&Packet::PluginMessage(plugin::rewrite_brand(
                    &packet,
                    player.protocol(),
                )))
                .await;
        } else {
            let server_conn_phase = server_conn.phase();
            if server_conn_phase == BackendPhase::InTransition {
                // The current server must be bypassed while switching, so
                // the new backend observes the Forge handshake.
                if let Some(in_flight) = player.connection_in_flight() {
                    player.phase().handle(player, &in_flight, &packet).await;
                }
                return;
            }

            let player_phase = player.phase();
            if player_phase.handle(player, &server_conn, &packet).await {
                if player.phase().considered_complete() {
                    self.flush_queued_messages().await;
                }
                return;
            }
            if player_phase.considered_complete() && server_conn_phase.considered_complete() {
                let Some(_identifier) = self.proxy().channel_registrar().from_id(&packet.channel)
                else {
                    let _ = backend.write_packet(&Packet::PluginMessage(packet)).await;
                    return;
                };
                let channel = packet.channel.clone();
                let event =
                    PluginMessageEvent::new(Arc::clone(player), channel.clone(), packet.data);
                self.proxy().event().fire_parallel(event, move |event| async move {
                    if event.allowed() {
                        let _ = backend
                            .write_packet(&Packet::PluginMessage(PluginMessage {
                                channel,
                                data: event.data,
                            }))
                            .await;
                    }
                });
                return;
            }
            // The client is sending messages too early, primarily caused by
            // mods racing the FML handshake. Queue them until the handshake
            // completes or the next JoinGame is relayed, whichever is first.
            self.login_plugin_messages.lock().unwrap().push_back(packet);
        }
    }

    /// Immediately sends any queued plugin messages to the current backend.
    pub(crate) async fn flush_queued_messages(&self) {
        let Some(server_conn) = self.player.current_server() else {
            return;
        };
        let Some(backend) = server_conn.conn() else {
            return;
        };
        loop {
            let message = self.login_plugin_messages.lock().unwrap().pop_front();
            let Some(message) = message else { break };
            let _ = backend
                .buffer_packet(&Packet::PluginMessage(message))
                .await;
        }
        let _ = backend.flush().await;
    }

    #[cfg(test)]
    pub(crate) fn queue_login_plugin_message(&self, message: PluginMessage) {
        self.login_plugin_messages.lock().unwrap().push_back(message);
    }

    /// Runs the client side of the server switch: relays JoinGame, emits the
    /// Respawn compensation, re-registers channels with the new backend,
    /// drains queued messages, clears titles, and promotes `destination` on
    /// success. Any buffer or flush error aborts the switch.
    pub(crate) async fn handle_backend_join_game(
        &self,
        join_game: &JoinGame,
        destination: &Arc<ServerConnection>,
    ) -> bool {
        let Some(server_mc) = destination.conn() else {
            return false;
        };
        let player = &self.player;
        let player_version = player.protocol();

        if self
            .spawned
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // Nothing special to do with regards to spawning the player.
            if player
                .connection()
                .buffer_packet(&Packet::JoinGame(join_game.clone()))
                .await
                .is_err()
            {
                return false;
            }
            // Required for legacy Forge.
            player.phase().on_first_join(player);
        } else {
            // The client accepts a second JoinGame to reload the world,
            // which works around the need to rewrite entity ids, then a
            // Respawn moves it into the right dimension.
            if player
                .connection()
                .buffer_packet(&Packet::JoinGame(join_game.clone()))
                .await
                .is_err()
            {
                return false;
            }

            let mut respawn = Respawn {
                dimension: 0,
                partial_hashed_seed: join_game.partial_hashed_seed,
                difficulty: join_game.difficulty,
                gamemode: join_game.gamemode,
                level_type: join_game.level_type.clone().unwrap_or_default(),
                should_keep_player_data: false,
                dimension_info: join_game.dimension_info.clone(),
                previous_gamemode: join_game.previous_gamemode,
                current_dimension_data: join_game.current_dimension_data.clone(),
            };

            // Below 1.16 the client only reloads on an actual dimension
            // change, so a detour respawn comes first.
            if player_version < MINECRAFT_1_16 {
                if join_game.dimension == 0 {
                    respawn.dimension = -1;
                }
                if player
                    .connection()
                    .buffer_packet(&Packet::Respawn(respawn.clone()))
                    .await
                    .is_err()
                {
                    return false;
                }
            }

            respawn.dimension = join_game.dimension;
            if player
                .connection()
                .buffer_packet(&Packet::Respawn(respawn))
                .await
                .is_err()
            {
                return false;
            }
        }

        // Tell the new backend about the client's plugin message channels.
        let server_version = server_mc.protocol();
        let known_channels = player.known_channels();
        if !known_channels.is_empty() {
            let channels_packet =
                plugin::construct_channels_packet(server_version, known_channels.iter());
            if server_mc
                .buffer_packet(&Packet::PluginMessage(channels_packet))
                .await
                .is_err()
            {
                return false;
            }
        }

        // If plugin messages were queued during login or the FML handshake,
        // send them now.
        loop {
            let message = self.login_plugin_messages.lock().unwrap().pop_front();
            let Some(message) = message else { break };
            if server_mc
                .buffer_packet(&Packet::PluginMessage(message))
                .await
                .is_err()
            {
                return false;
            }
        }

        // Clear any title from the previous server.
        if player_version >= MINECRAFT_1_8
            && player
                .connection()
                .buffer_packet(&Packet::Title(Title::reset()))
                .await
                .is_err()
        {
            return false;
        }

        if player.connection().flush().await.is_err() || server_mc.flush().await.is_err() {
            return false;
        }
        destination.complete_join().await;
        true
    }
}

#[async_trait]
impl SessionHandler for ClientPlaySessionHandler {
    async fn activated(&self) {
        let version = self.player.protocol();
        let channels = self
            .proxy()
            .channel_registrar()
            .channels_for_protocol(version);
        if !channels.is_empty() {
            let register = plugin::construct_channels_packet(version, channels.iter());
            let _ = self
                .player
                .connection()
                .write_packet(&Packet::PluginMessage(register))
                .await;
            self.player.add_known_channels(channels);
        }
    }

    async fn deactivated(&self) {
        self.login_plugin_messages.lock().unwrap().clear();
    }

    async fn handle_packet(&self, packet: Packet) {
        match packet {
            Packet::KeepAlive(p) => self.handle_keep_alive(p).await,
            Packet::Chat(p) => self.handle_chat(p).await,
            Packet::PluginMessage(p) => self.handle_plugin_message(p).await,
            Packet::ClientSettings(p) => {
                self.player.set_settings(p.clone());
                self.forward_to_server(&Packet::ClientSettings(p)).await;
            }
            other => self.forward_to_server(&other).await,
        }
    }

    async fn handle_unknown_packet(&self, frame: RawFrame) {
        if let Some(backend) = self.can_forward() {
            let _ = backend.write_payload(&frame.payload).await;
        }
    }

    async fn disconnected(&self) {
        self.player.teardown().await;
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
