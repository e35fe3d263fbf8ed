//! A connected Minecraft player: the durable identity bound to a client
//! connection, and the public API other code uses to talk to it.

use crate::{
    component::Component,
    connection::Connection,
    event::{DisconnectEvent, LoginStatus, PlayerSettingsChangedEvent},
    forge::{self, ClientConnectionPhase, ModInfo},
    protocol::{
        packet::{
            Chat, ClientSettings, Disconnect, Packet, PluginMessage, ResourcePackRequest, Title,
            CHAT_MESSAGE, MAX_SERVERBOUND_MESSAGE_LENGTH, SYSTEM_MESSAGE,
        },
        plugin,
        version::{ProtocolVersion, MINECRAFT_1_11, MINECRAFT_1_12_2},
    },
    proxy::{Proxy, RegisteredServer},
    server_conn::ServerConnection,
};
use serde_json::json;
use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};
use uuid::Uuid;

/// An authenticated (or offline-mode) player identity. Immutable for the
/// lifetime of the player.
#[derive(Debug, Clone)]
pub struct GameProfile {
    pub id: Uuid,
    pub name: String,
    pub properties: Vec<ProfileProperty>,
}

#[derive(Debug, Clone)]
pub struct ProfileProperty {
    pub name: String,
    pub value: String,
    pub signature: Option<String>,
}

impl GameProfile {
    /// The offline-mode profile for a username, with the name-derived UUID
    /// vanilla servers expect.
    pub fn offline(name: impl Into<String>) -> Self {
        let name = name.into();
        let id = Uuid::new_v3(
            &Uuid::NAMESPACE_OID,
            format!("OfflinePlayer:{name}").as_bytes(),
        );
        Self {
            id,
            name,
            properties: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("player has no backend server connection yet")]
    NoBackendConnection,
    #[error("server bound chat message can not exceed {MAX_SERVERBOUND_MESSAGE_LENGTH} characters")]
    TooLongChatMessage,
    #[error("resource pack hash length must be 20 bytes")]
    InvalidHashLength,
    #[error(transparent)]
    Connection(#[from] anyhow::Error),
}

/// Where a proxy-sent message is displayed on the client.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessagePosition {
    Chat,
    System,
    ActionBar,
}

struct PlayerState {
    connected_server: Option<Arc<ServerConnection>>,
    conn_in_flight: Option<Arc<ServerConnection>>,
    settings: Option<ClientSettings>,
    mod_info: Option<ModInfo>,
    conn_phase: ClientConnectionPhase,
    /// Names of servers to try if disconnected from the previous one.
    servers_to_try: Vec<String>,
    try_index: usize,
}

pub struct ConnectedPlayer {
    conn: Arc<Connection>,
    proxy: Arc<Proxy>,
    profile: GameProfile,
    virtual_host: Option<String>,
    online_mode: bool,
    /// Last measured ping in milliseconds, -1 while unknown.
    ping: AtomicI64,
    /// Set when another connection logs in with the same profile and this
    /// one is being evicted.
    pub(crate) disconnect_due_to_duplicate_connection: AtomicBool,
    plugin_channels: RwLock<HashSet<String>>,
    state: RwLock<PlayerState>,
}

impl ConnectedPlayer {
    pub fn new(
        conn: Arc<Connection>,
        proxy: Arc<Proxy>,
        profile: GameProfile,
        virtual_host: Option<String>,
        online_mode: bool,
    ) -> Arc<Self> {
        let conn_phase = conn.conn_type().initial_client_phase();
        Arc::new(Self {
            conn,
            proxy,
            profile,
            virtual_host,
            online_mode,
            ping: AtomicI64::new(-1),
            disconnect_due_to_duplicate_connection: AtomicBool::new(false),
            plugin_channels: RwLock::new(HashSet::new()),
            state: RwLock::new(PlayerState {
                connected_server: None,
                conn_in_flight: None,
                settings: None,
                mod_info: None,
                conn_phase,
                servers_to_try: Vec::new(),
                try_index: 0,
            }),
        })
    }

    pub fn username(&self) -> &str {
        &self.profile.name
    }

    pub fn id(&self) -> Uuid {
        self.profile.id
    }

    pub fn profile(&self) -> &GameProfile {
        &self.profile
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    pub fn virtual_host(&self) -> Option<&str> {
        self.virtual_host.as_deref()
    }

    pub fn online_mode(&self) -> bool {
        self.online_mode
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.conn.protocol()
    }

    pub fn active(&self) -> bool {
        !self.conn.closed()
    }

    /// The player's measured ping, or `None` while unknown.
    pub fn ping(&self) -> Option<Duration> {
        let millis = self.ping.load(Ordering::Relaxed);
        (millis >= 0).then(|| Duration::from_millis(millis as u64))
    }

    pub(crate) fn set_ping(&self, ping: Duration) {
        self.ping
            .store(ping.as_millis().min(i64::MAX as u128) as i64, Ordering::Relaxed);
    }

    /// The backend connection the player is on, genuinely absent while
    /// switching or before the first join completes.
    pub fn current_server(&self) -> Option<Arc<ServerConnection>> {
        self.state.read().unwrap().connected_server.clone()
    }

    pub fn connection_in_flight(&self) -> Option<Arc<ServerConnection>> {
        self.state.read().unwrap().conn_in_flight.clone()
    }

    pub(crate) fn set_connected_server(&self, server: Option<Arc<ServerConnection>>) {
        self.state.write().unwrap().connected_server = server;
    }

    pub(crate) fn set_in_flight(&self, server: Option<Arc<ServerConnection>>) {
        self.state.write().unwrap().conn_in_flight = server;
    }

    pub fn phase(&self) -> ClientConnectionPhase {
        self.state.read().unwrap().conn_phase
    }

    pub(crate) fn set_phase(&self, phase: ClientConnectionPhase) {
        self.state.write().unwrap().conn_phase = phase;
    }

    pub fn mod_info(&self) -> Option<ModInfo> {
        self.state.read().unwrap().mod_info.clone()
    }

    pub fn set_mod_info(&self, mod_info: ModInfo) {
        self.state.write().unwrap().mod_info = Some(mod_info);
    }

    /// The player's client settings, or the protocol defaults if none were
    /// received yet.
    pub fn settings(&self) -> ClientSettings {
        self.state
            .read()
            .unwrap()
            .settings
            .clone()
            .unwrap_or(ClientSettings {
                locale: "en_US".to_owned(),
                view_distance: 10,
                chat_visibility: 0,
                chat_colors: true,
                skin_parts: 0x7f,
                main_hand: 1,
            })
    }

    /// Replaces the settings and announces the change without blocking the
    /// caller's read loop.
    pub(crate) fn set_settings(self: &Arc<Self>, settings: ClientSettings) {
        self.state.write().unwrap().settings = Some(settings.clone());
        self.proxy.event().fire_parallel(
            PlayerSettingsChangedEvent {
                player: Arc::clone(self),
                settings,
            },
            |_| async {},
        );
    }

    /// Snapshot of the plugin channels the client has advertised.
    pub fn known_channels(&self) -> HashSet<String> {
        self.plugin_channels.read().unwrap().clone()
    }

    pub fn knows_channel(&self, channel: &str) -> bool {
        self.plugin_channels.read().unwrap().contains(channel)
    }

    pub(crate) fn add_known_channels<I: IntoIterator<Item = String>>(&self, channels: I) {
        self.plugin_channels.write().unwrap().extend(channels);
    }

    pub(crate) fn remove_known_channels<'a, I: IntoIterator<Item = &'a String>>(
        &self,
        channels: I,
    ) {
        let mut known = self.plugin_channels.write().unwrap();
        for channel in channels {
            known.remove(channel);
        }
    }

    /// Whether a plugin message from the backend may be forwarded to this
    /// client. Internal Minecraft and Forge channels always pass; anything
    /// else must be a known channel.
    pub fn can_forward_plugin_message(
        &self,
        version: ProtocolVersion,
        message: &PluginMessage,
    ) -> bool {
        let minecraft_or_fml = if version <= MINECRAFT_1_12_2 {
            message.channel.starts_with("MC|")
                || message.channel.starts_with(forge::LEGACY_HANDSHAKE_CHANNEL)
                || plugin::is_legacy_register(message)
                || plugin::is_legacy_unregister(message)
        } else {
            message.channel.starts_with("minecraft:")
        };
        minecraft_or_fml || self.knows_channel(&message.channel)
    }

    fn ensure_backend_connection(&self) -> Option<Arc<Connection>> {
        self.state
            .read()
            .unwrap()
            .connected_server
            .as_ref()
            .and_then(|server| server.conn())
    }

    /// Sends chat input onto the player's current server as if they typed it
    /// into the client chat box.
    pub async fn spoof_chat_input(&self, input: &str) -> Result<(), PlayerError> {
        if input.chars().count() > MAX_SERVERBOUND_MESSAGE_LENGTH {
            return Err(PlayerError::TooLongChatMessage);
        }
        let backend = self
            .ensure_backend_connection()
            .ok_or(PlayerError::NoBackendConnection)?;
        backend
            .write_packet(&Packet::Chat(Chat {
                message: input.to_owned(),
                message_type: CHAT_MESSAGE,
                sender: Uuid::nil(),
            }))
            .await?;
        Ok(())
    }

    /// Sends a resource pack request without a hash.
    pub async fn send_resource_pack(&self, url: &str) -> Result<(), PlayerError> {
        self.conn
            .write_packet(&Packet::ResourcePackRequest(ResourcePackRequest {
                url: url.to_owned(),
                hash: String::new(),
            }))
            .await?;
        Ok(())
    }

    /// Sends a resource pack request with the pack's 20-byte SHA-1 hash.
    pub async fn send_resource_pack_with_hash(
        &self,
        url: &str,
        sha1_hash: &[u8],
    ) -> Result<(), PlayerError> {
        if sha1_hash.len() != 20 {
            return Err(PlayerError::InvalidHashLength);
        }
        let hash: String = sha1_hash.iter().map(|b| format!("{b:02x}")).collect();
        self.conn
            .write_packet(&Packet::ResourcePackRequest(ResourcePackRequest {
                url: url.to_owned(),
                hash,
            }))
            .await?;
        Ok(())
    }

    /// Sends a plugin message to the client.
    pub async fn send_plugin_message(
        &self,
        channel: &str,
        data: Vec<u8>,
    ) -> Result<(), PlayerError> {
        self.conn
            .write_packet(&Packet::PluginMessage(PluginMessage {
                channel: channel.to_owned(),
                data,
            }))
            .await?;
        Ok(())
    }

    pub async fn send_message(&self, message: &Component) -> Result<(), PlayerError> {
        self.send_message_position(message, MessagePosition::Chat)
            .await
    }

    /// Sends a message at the given screen position. Action bars need the
    /// Title packet on 1.11+ and a legacy-encoded Chat packet before that.
    pub async fn send_message_position(
        &self,
        message: &Component,
        position: MessagePosition,
    ) -> Result<(), PlayerError> {
        let message_json = match position {
            MessagePosition::ActionBar => {
                if self.protocol() >= MINECRAFT_1_11 {
                    self.conn
                        .write_packet(&Packet::Title(Title::action_bar(message.json())))
                        .await?;
                    return Ok(());
                }
                json!({ "text": message.legacy() }).to_string()
            }
            _ => message.json(),
        };

        self.conn
            .write_packet(&Packet::Chat(Chat {
                message: message_json,
                message_type: match position {
                    MessagePosition::System => SYSTEM_MESSAGE,
                    _ => CHAT_MESSAGE,
                },
                sender: Uuid::nil(),
            }))
            .await?;
        Ok(())
    }

    /// Disconnects the player with a reason. Further calls on this player
    /// are undefined once this returns.
    pub async fn disconnect(&self, reason: &Component) {
        if !self.active() {
            return;
        }
        let result = self
            .conn
            .close_with(&Packet::Disconnect(Disconnect {
                reason: reason.json(),
            }))
            .await;
        if result.is_ok() {
            tracing::info!(player = %self, reason = %reason.plain(), "player has disconnected");
        }
    }

    pub(crate) async fn send_legacy_forge_handshake_reset(self: &Arc<Self>) {
        self.phase().reset_connection_phase(self).await;
    }

    /// Finds another server to attempt to log into after an unexpected
    /// disconnect. `just_failed` is skipped in addition to the player's
    /// current and in-flight servers. May return `None` if exhausted.
    pub fn next_server_to_try(
        &self,
        just_failed: Option<&RegisteredServer>,
    ) -> Option<RegisteredServer> {
        let mut state = self.state.write().unwrap();
        if state.servers_to_try.is_empty() {
            if let Some(virtual_host) = &self.virtual_host {
                state.servers_to_try = self
                    .proxy
                    .config()
                    .forced_hosts
                    .get(virtual_host)
                    .cloned()
                    .unwrap_or_default();
            }
        }
        if state.servers_to_try.is_empty() {
            state.servers_to_try = self.proxy.config().attempt_connection_order.clone();
        }

        let same_name = |server: &Option<Arc<ServerConnection>>, name: &str| {
            server
                .as_ref()
                .map_or(false, |s| s.server().name == name)
        };

        for i in state.try_index..state.servers_to_try.len() {
            let to_try = state.servers_to_try[i].clone();
            if same_name(&state.connected_server, &to_try)
                || same_name(&state.conn_in_flight, &to_try)
                || just_failed.map_or(false, |s| s.name == to_try)
            {
                continue;
            }
            state.try_index = i;
            if let Some(server) = self.proxy.server(&to_try) {
                return Some(server);
            }
        }
        None
    }

    /// The player's connection is closed at this point; tear down any
    /// backend connections and report the disconnect.
    pub(crate) async fn teardown(self: &Arc<Self>) {
        let (in_flight, connected) = {
            let state = self.state.read().unwrap();
            (state.conn_in_flight.clone(), state.connected_server.clone())
        };
        if let Some(in_flight) = in_flight {
            in_flight.disconnect().await;
        }
        if let Some(connected) = connected {
            connected.disconnect().await;
        }

        let login_status = if self.proxy.unregister_connection(self).await {
            if self
                .disconnect_due_to_duplicate_connection
                .load(Ordering::SeqCst)
            {
                LoginStatus::ConflictingLogin
            } else {
                LoginStatus::SuccessfulLogin
            }
        } else if self.conn.known_disconnect() {
            LoginStatus::CanceledByProxy
        } else {
            LoginStatus::CanceledByUser
        };

        self.proxy.event().fire(&mut DisconnectEvent {
            player: Arc::clone(self),
            login_status,
        });
    }

    /// Finds a fallback server and connects to it after losing `failed`.
    /// Disconnects the player with `reason` when no fallback is left.
    pub(crate) async fn handle_backend_crash(
        self: &Arc<Self>,
        failed: &RegisteredServer,
        reason: Component,
    ) {
        let mut failed = failed.clone();
        loop {
            if !self.active() {
                return;
            }
            let Some(next) = self.next_server_to_try(Some(&failed)) else {
                self.disconnect(&reason).await;
                return;
            };
            tracing::info!(player = %self, server = %next.name, "trying fallback server");
            match ServerConnection::connect(self, next.clone()).await {
                Ok(crate::server_conn::JoinResult::Success) => return,
                Ok(crate::server_conn::JoinResult::Disconnected(why)) => {
                    tracing::warn!(player = %self, server = %next.name, reason = %why, "fallback server rejected player");
                    failed = next;
                }
                Err(err) => {
                    tracing::warn!(player = %self, server = %next.name, error = %err, "failed to connect to fallback server");
                    failed = next;
                }
            }
        }
    }
}

impl fmt::Display for ConnectedPlayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.profile.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_player, test_proxy};

    #[test]
    fn offline_profile_uuid_is_stable() {
        let a = GameProfile::offline("Steve");
        let b = GameProfile::offline("Steve");
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, GameProfile::offline("Alex").id);
    }

    #[tokio::test]
    async fn register_unregister_roundtrip_leaves_channels_unchanged() {
        let proxy = test_proxy();
        let (player, _peer) = test_player(&proxy, "Steve");
        let before = player.known_channels();

        let channels = vec!["acme:one".to_owned(), "acme:two".to_owned()];
        player.add_known_channels(channels.clone());
        assert!(player.knows_channel("acme:one"));
        player.remove_known_channels(channels.iter());
        assert_eq!(player.known_channels(), before);
    }

    #[tokio::test]
    async fn plugin_message_whitelist_by_era() {
        let proxy = test_proxy();
        let (player, _peer) = test_player(&proxy, "Steve");

        let msg = |channel: &str| PluginMessage {
            channel: channel.to_owned(),
            data: Vec::new(),
        };

        // Modern era: only the minecraft namespace and known channels pass.
        assert!(player.can_forward_plugin_message(
            crate::protocol::version::MINECRAFT_1_16,
            &msg("minecraft:brand")
        ));
        assert!(!player.can_forward_plugin_message(
            crate::protocol::version::MINECRAFT_1_16,
            &msg("acme:telemetry")
        ));
        player.add_known_channels(["acme:telemetry".to_owned()]);
        assert!(player.can_forward_plugin_message(
            crate::protocol::version::MINECRAFT_1_16,
            &msg("acme:telemetry")
        ));

        // Legacy era: MC| and FML|HS prefixes and legacy register frames.
        assert!(player
            .can_forward_plugin_message(MINECRAFT_1_12_2, &msg("MC|Brand")));
        assert!(player
            .can_forward_plugin_message(MINECRAFT_1_12_2, &msg("FML|HS")));
        assert!(player
            .can_forward_plugin_message(MINECRAFT_1_12_2, &msg("REGISTER")));
        assert!(!player
            .can_forward_plugin_message(MINECRAFT_1_12_2, &msg("custom")));
    }

    #[tokio::test]
    async fn spoof_chat_rejects_long_messages_before_backend_lookup() {
        let proxy = test_proxy();
        let (player, _peer) = test_player(&proxy, "Steve");
        let long: String = "a".repeat(MAX_SERVERBOUND_MESSAGE_LENGTH + 1);
        assert!(matches!(
            player.spoof_chat_input(&long).await,
            Err(PlayerError::TooLongChatMessage)
        ));
        // At the limit the next failure is the missing backend, meaning the
        // length check passed.
        let ok: String = "a".repeat(MAX_SERVERBOUND_MESSAGE_LENGTH);
        assert!(matches!(
            player.spoof_chat_input(&ok).await,
            Err(PlayerError::NoBackendConnection)
        ));
    }

    #[tokio::test]
    async fn resource_pack_hash_must_be_20_bytes() {
        let proxy = test_proxy();
        let (player, _peer) = test_player(&proxy, "Steve");
        assert!(matches!(
            player
                .send_resource_pack_with_hash("https://example.com/pack.zip", &[0u8; 19])
                .await,
            Err(PlayerError::InvalidHashLength)
        ));
    }

    #[tokio::test]
    async fn action_bar_uses_legacy_chat_below_1_11() {
        use crate::protocol::packet::{TitleAction, CHAT_MESSAGE};
        use crate::testutil::{test_player_at, wait_until, Recording};

        let proxy = test_proxy();

        // 1.10 and older: legacy-rendered text wrapped in a Chat packet.
        let (player, peer) = test_player_at(&proxy, "Steve", crate::protocol::version::MINECRAFT_1_9);
        let client = Recording::attach(&peer).await;
        player
            .send_message_position(
                &Component::colored("low health", "red"),
                MessagePosition::ActionBar,
            )
            .await
            .unwrap();
        assert!(wait_until(|| client.packet_count() == 1).await);
        {
            let packets = client.packets.lock().unwrap();
            let Packet::Chat(chat) = &packets[0] else {
                panic!("expected chat");
            };
            assert_eq!(chat.message, "{\"text\":\"§clow health\"}");
            assert_eq!(chat.message_type, CHAT_MESSAGE);
            assert_eq!(chat.sender, Uuid::nil());
        }

        // 1.11+: the Title packet's action-bar action.
        let (player, peer) =
            test_player_at(&proxy, "Alex", crate::protocol::version::MINECRAFT_1_11);
        let client = Recording::attach(&peer).await;
        player
            .send_message_position(
                &Component::text("low health"),
                MessagePosition::ActionBar,
            )
            .await
            .unwrap();
        assert!(wait_until(|| client.packet_count() == 1).await);
        let packets = client.packets.lock().unwrap();
        let Packet::Title(title) = &packets[0] else {
            panic!("expected title");
        };
        assert_eq!(title.action, TitleAction::SetActionBar);
        assert_eq!(title.component.as_deref(), Some("{\"text\":\"low health\"}"));
    }

    #[tokio::test]
    async fn ping_sentinel_reads_as_unknown() {
        let proxy = test_proxy();
        let (player, _peer) = test_player(&proxy, "Steve");
        assert_eq!(player.ping(), None);
        player.set_ping(Duration::from_millis(42));
        assert_eq!(player.ping(), Some(Duration::from_millis(42)));
    }
}
