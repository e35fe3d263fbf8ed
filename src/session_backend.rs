//! Session handlers owning the proxy-to-backend side of a player's
//! connection: the minimal backend login, the transition window around a
//! server switch, and steady-state play.

use crate::{
    component::Component,
    connection::{RawFrame, SessionHandler},
    player::ConnectedPlayer,
    protocol::{
        packet::{Disconnect, JoinGame, Packet, PluginMessage},
        State,
    },
    server_conn::{JoinResult, ServerConnection},
    session_client_play::ClientPlaySessionHandler,
};
use async_trait::async_trait;
use std::{any::Any, sync::Arc};

async fn client_play_handler(
    player: &Arc<ConnectedPlayer>,
) -> Option<Arc<ClientPlaySessionHandler>> {
    let handler = player.connection().session_handler().await?;
    handler.as_any_arc().downcast::<ClientPlaySessionHandler>().ok()
}

fn kick_reason(server_name: &str, reason_json: &str) -> Component {
    let reason = serde_json::from_str::<Component>(reason_json)
        .map(|c| c.plain())
        .unwrap_or_else(|_| reason_json.to_owned());
    Component::colored(format!("Kicked from {server_name}: {reason}"), "red")
}

/// Drives the offline-mode login with a backend until LoginSuccess.
pub struct BackendLoginSessionHandler {
    server_conn: Arc<ServerConnection>,
}

impl BackendLoginSessionHandler {
    pub fn new(server_conn: Arc<ServerConnection>) -> Self {
        Self { server_conn }
    }
}

#[async_trait]
impl SessionHandler for BackendLoginSessionHandler {
    async fn handle_packet(&self, packet: Packet) {
        let Some(conn) = self.server_conn.conn() else {
            return;
        };
        match packet {
            Packet::Disconnect(d) => {
                self.server_conn
                    .send_join_result(JoinResult::Disconnected(d.reason));
                let _ = conn.close().await;
            }
            Packet::EncryptionRequest(_) => {
                // The backend runs in online mode; the proxy cannot complete
                // Mojang authentication on its behalf.
                self.server_conn.send_join_result(JoinResult::Disconnected(
                    "backend requested encryption; it must run in offline mode behind the proxy"
                        .to_owned(),
                ));
                let _ = conn.close().await;
            }
            Packet::SetCompression(p) => {
                conn.set_compression_threshold(p.threshold).await;
            }
            Packet::LoginSuccess(_) => {
                conn.set_state(State::Play);
                conn.set_session_handler(Arc::new(BackendTransitionSessionHandler {
                    server_conn: Arc::clone(&self.server_conn),
                    player: Arc::clone(self.server_conn.player()),
                }))
                .await;
            }
            other => {
                tracing::debug!(packet = other.as_ref(), "unexpected packet during backend login");
            }
        }
    }

    async fn disconnected(&self) {
        self.server_conn
            .send_join_result(JoinResult::Disconnected("connection lost".to_owned()));
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Owns the backend socket between LoginSuccess and the JoinGame that
/// completes the switch. Game packets are not forwarded in this window; the
/// client is still talking to its previous server.
pub struct BackendTransitionSessionHandler {
    server_conn: Arc<ServerConnection>,
    player: Arc<ConnectedPlayer>,
}

impl BackendTransitionSessionHandler {
    pub fn new(server_conn: Arc<ServerConnection>, player: Arc<ConnectedPlayer>) -> Self {
        Self {
            server_conn,
            player,
        }
    }
}

#[async_trait]
impl SessionHandler for BackendTransitionSessionHandler {
    async fn handle_packet(&self, packet: Packet) {
        let Some(conn) = self.server_conn.conn() else {
            return;
        };
        match packet {
            Packet::KeepAlive(p) => {
                // The client is not wired up yet, so the proxy answers.
                let _ = conn.write_packet(&Packet::KeepAlive(p)).await;
            }
            Packet::Disconnect(d) => {
                self.server_conn
                    .send_join_result(JoinResult::Disconnected(d.reason));
                let _ = conn.close().await;
            }
            Packet::PluginMessage(p) => {
                // Only the Forge handshake may cross to the client here.
                self.server_conn
                    .phase()
                    .handle(&self.server_conn, &self.player, &p)
                    .await;
            }
            Packet::JoinGame(p) => {
                self.handle_join_game(p).await;
            }
            other => {
                tracing::debug!(
                    packet = other.as_ref(),
                    "dropping packet received during server transition"
                );
            }
        }
    }

    async fn disconnected(&self) {
        self.server_conn.send_join_result(JoinResult::Disconnected(
            "connection lost during transition".to_owned(),
        ));
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl BackendTransitionSessionHandler {
    async fn handle_join_game(&self, join_game: JoinGame) {
        let Some(conn) = self.server_conn.conn() else {
            return;
        };
        let Some(client_handler) = client_play_handler(&self.player).await else {
            self.server_conn.send_join_result(JoinResult::Disconnected(
                "client is not in play state".to_owned(),
            ));
            let _ = conn.close().await;
            return;
        };

        if client_handler
            .handle_backend_join_game(&join_game, &self.server_conn)
            .await
        {
            // The switch is complete; this connection now relays play
            // traffic.
            conn.set_session_handler(Arc::new(BackendPlaySessionHandler {
                server_conn: Arc::clone(&self.server_conn),
                player: Arc::clone(&self.player),
            }))
            .await;
        } else {
            self.server_conn.send_join_result(JoinResult::Disconnected(
                "failed to complete server switch".to_owned(),
            ));
            self.server_conn.disconnect().await;
        }
    }
}

/// Relays packets from the backend to the client during steady-state play.
pub struct BackendPlaySessionHandler {
    server_conn: Arc<ServerConnection>,
    player: Arc<ConnectedPlayer>,
}

impl BackendPlaySessionHandler {
    pub(crate) fn new(
        server_conn: Arc<ServerConnection>,
        player: Arc<ConnectedPlayer>,
    ) -> Self {
        Self {
            server_conn,
            player,
        }
    }

    async fn handle_plugin_message(&self, packet: PluginMessage) {
        if self
            .server_conn
            .phase()
            .handle(&self.server_conn, &self.player, &packet)
            .await
        {
            return;
        }

        let version = self.player.protocol();
        if !self.player.can_forward_plugin_message(version, &packet) {
            // Unknown channel for this client; not delivered, no event.
            return;
        }

        if self
            .player
            .proxy()
            .channel_registrar()
            .from_id(&packet.channel)
            .is_some()
        {
            let client = Arc::clone(self.player.connection());
            let channel = packet.channel.clone();
            let event = crate::event::PluginMessageEvent::new(
                Arc::clone(&self.player),
                channel.clone(),
                packet.data,
            );
            self.player
                .proxy()
                .event()
                .fire_parallel(event, move |event| async move {
                    if event.allowed() {
                        let _ = client
                            .write_packet(&Packet::PluginMessage(PluginMessage {
                                channel,
                                data: event.data,
                            }))
                            .await;
                    }
                });
            return;
        }

        let _ = self
            .player
            .connection()
            .write_packet(&Packet::PluginMessage(packet))
            .await;
    }

    async fn handle_disconnect(&self, packet: Disconnect) {
        let server_name = self.server_conn.server().name.clone();
        tracing::info!(
            player = %self.player,
            server = %server_name,
            "backend disconnected player"
        );
        self.server_conn.disconnect().await;
        self.player
            .handle_backend_crash(
                self.server_conn.server(),
                kick_reason(&server_name, &packet.reason),
            )
            .await;
    }
}

#[async_trait]
impl SessionHandler for BackendPlaySessionHandler {
    async fn handle_packet(&self, packet: Packet) {
        match packet {
            Packet::KeepAlive(p) => {
                self.server_conn.record_ping_relay(p.random_id);
                let _ = self
                    .player
                    .connection()
                    .write_packet(&Packet::KeepAlive(p))
                    .await;
            }
            Packet::Disconnect(p) => self.handle_disconnect(p).await,
            Packet::PluginMessage(p) => self.handle_plugin_message(p).await,
            Packet::JoinGame(p) => {
                // The backend moved the player to a new world; run the same
                // compensation the cross-server switch uses.
                if let Some(client_handler) = client_play_handler(&self.player).await {
                    client_handler
                        .handle_backend_join_game(&p, &self.server_conn)
                        .await;
                }
            }
            other => {
                let _ = self.player.connection().write_packet(&other).await;
            }
        }
    }

    async fn handle_unknown_packet(&self, frame: RawFrame) {
        let _ = self.player.connection().write_payload(&frame.payload).await;
    }

    async fn disconnected(&self) {
        if self.server_conn.gracefully_closed() {
            return;
        }
        if !self.player.active() {
            return;
        }
        tracing::warn!(
            player = %self.player,
            server = %self.server_conn.server().name,
            "unexpectedly lost connection to server"
        );
        self.player
            .handle_backend_crash(
                self.server_conn.server(),
                Component::colored(
                    format!(
                        "Lost connection to {}, no fallback server available.",
                        self.server_conn.server().name
                    ),
                    "red",
                ),
            )
            .await;
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::SessionHandler,
        forge::BackendPhase,
        protocol::packet::KeepAlive,
        testutil::{test_backend, test_player, test_proxy, wait_until, Recording},
    };
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test]
    async fn unknown_backend_channel_is_not_delivered() {
        let proxy = test_proxy();
        let (player, client_peer) = test_player(&proxy, "Steve");
        let client = Recording::attach(&client_peer).await;
        let (server_conn, _backend_peer) = test_backend(&player, "lobby", BackendPhase::Vanilla);
        let handler =
            BackendPlaySessionHandler::new(Arc::clone(&server_conn), Arc::clone(&player));

        handler
            .handle_packet(Packet::PluginMessage(PluginMessage {
                channel: "acme:telemetry".to_owned(),
                data: vec![0x01],
            }))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.packet_count(), 0);

        // Internal channels always pass.
        handler
            .handle_packet(Packet::PluginMessage(PluginMessage {
                channel: "minecraft:brand".to_owned(),
                data: b"\x07vanilla".to_vec(),
            }))
            .await;
        assert!(wait_until(|| client.packet_count() == 1).await);

        // Once the client registers the channel, it passes too.
        player.add_known_channels(["acme:telemetry".to_owned()]);
        handler
            .handle_packet(Packet::PluginMessage(PluginMessage {
                channel: "acme:telemetry".to_owned(),
                data: vec![0x01],
            }))
            .await;
        assert!(wait_until(|| client.packet_count() == 2).await);
    }

    #[tokio::test]
    async fn keep_alive_relay_records_ping_bookkeeping() {
        let proxy = test_proxy();
        let (player, client_peer) = test_player(&proxy, "Steve");
        let client = Recording::attach(&client_peer).await;
        let (server_conn, _backend_peer) = test_backend(&player, "lobby", BackendPhase::Vanilla);
        let handler =
            BackendPlaySessionHandler::new(Arc::clone(&server_conn), Arc::clone(&player));

        handler
            .handle_packet(Packet::KeepAlive(KeepAlive { random_id: 99 }))
            .await;
        assert_eq!(server_conn.last_ping_id.load(Ordering::SeqCst), 99);
        assert!(server_conn.last_ping_sent.load(Ordering::SeqCst) > 0);
        assert!(wait_until(|| client.packet_count() == 1).await);
    }

    #[tokio::test]
    async fn game_packets_are_relayed_to_the_client() {
        let proxy = test_proxy();
        let (player, client_peer) = test_player(&proxy, "Steve");
        let client = Recording::attach(&client_peer).await;
        let (server_conn, _backend_peer) = test_backend(&player, "lobby", BackendPhase::Vanilla);
        let handler =
            BackendPlaySessionHandler::new(Arc::clone(&server_conn), Arc::clone(&player));

        handler
            .handle_packet(Packet::Chat(crate::protocol::packet::Chat {
                message: "{\"text\":\"hello\"}".to_owned(),
                message_type: 1,
                sender: uuid::Uuid::nil(),
            }))
            .await;
        handler
            .handle_unknown_packet(crate::connection::RawFrame {
                id: 0x55,
                payload: vec![0x55, 0xAA],
            })
            .await;
        assert!(wait_until(|| client.packet_count() == 1).await);
        assert!(wait_until(|| client.unknown.lock().unwrap().len() == 1).await);
    }

    #[tokio::test]
    async fn transition_handler_completes_switch_on_join_game() {
        let proxy = test_proxy();
        let (player, client_peer) = test_player(&proxy, "Steve");
        let client = Recording::attach(&client_peer).await;

        let play_handler =
            crate::session_client_play::ClientPlaySessionHandler::new(Arc::clone(&player));
        player
            .connection()
            .set_session_handler(play_handler as Arc<dyn SessionHandler>)
            .await;

        let (server_conn, _backend_peer) = test_backend(&player, "hub", BackendPhase::Vanilla);
        let handler = BackendTransitionSessionHandler::new(
            Arc::clone(&server_conn),
            Arc::clone(&player),
        );

        let join_game = JoinGame {
            entity_id: 1,
            gamemode: 0,
            previous_gamemode: -1,
            dimension_registry: Some(vec![0]),
            current_dimension_data: Some(vec![0]),
            dimension_info: Some(crate::protocol::packet::DimensionInfo {
                registry_identifier: "minecraft:overworld".to_owned(),
                level_name: "minecraft:overworld".to_owned(),
                is_flat: false,
                is_debug: false,
            }),
            max_players: 20,
            view_distance: 10,
            ..Default::default()
        };
        handler.handle_packet(Packet::JoinGame(join_game)).await;

        assert!(wait_until(|| client.packet_count() >= 2).await);
        assert!(player
            .current_server()
            .map_or(false, |s| Arc::ptr_eq(&s, &server_conn)));

        // The backend socket is now owned by the play handler.
        let installed = server_conn
            .conn()
            .unwrap()
            .session_handler()
            .await
            .unwrap();
        assert!(installed
            .as_any_arc()
            .downcast::<BackendPlaySessionHandler>()
            .is_ok());
    }

    #[tokio::test]
    async fn backend_login_walks_to_transition_on_success() {
        let proxy = test_proxy();
        let (player, _client_peer) = test_player(&proxy, "Steve");
        let (server_conn, _backend_peer) = test_backend(&player, "lobby", BackendPhase::Vanilla);
        let conn = server_conn.conn().unwrap();
        conn.set_state(crate::protocol::State::Login);

        let handler = BackendLoginSessionHandler::new(Arc::clone(&server_conn));
        handler
            .handle_packet(Packet::SetCompression(
                crate::protocol::packet::SetCompression { threshold: 256 },
            ))
            .await;
        handler
            .handle_packet(Packet::LoginSuccess(crate::protocol::packet::LoginSuccess {
                uuid: player.id(),
                username: player.username().to_owned(),
            }))
            .await;

        assert_eq!(conn.state(), crate::protocol::State::Play);
        let installed = conn.session_handler().await.unwrap();
        assert!(installed
            .as_any_arc()
            .downcast::<BackendTransitionSessionHandler>()
            .is_ok());
    }
}
