//! Legacy Forge (FML) handshake support.
//!
//! Modded 1.7-1.12 clients run a plugin-message handshake after JoinGame.
//! The proxy tracks it with two state machines, one per direction, so it can
//! rewind the client's FML state and replay the handshake when the player
//! switches backends.

use crate::{
    connection::ConnectionType,
    player::ConnectedPlayer,
    protocol::{packet::Packet, packet::PluginMessage, Decoder},
    server_conn::ServerConnection,
};
use std::sync::Arc;

/// Channel the legacy FML handshake runs on.
pub const LEGACY_HANDSHAKE_CHANNEL: &str = "FML|HS";

/// Marker a Forge client appends to the handshake server address.
pub const HANDSHAKE_HOSTNAME_TOKEN: &str = "\0FML\0";

pub const DISCRIMINATOR_SERVER_HELLO: u8 = 0;
pub const DISCRIMINATOR_CLIENT_HELLO: u8 = 1;
pub const DISCRIMINATOR_MOD_LIST: u8 = 2;
pub const DISCRIMINATOR_REGISTRY_DATA: u8 = 3;
pub const DISCRIMINATOR_ACK: u8 = 0xFF;
pub const DISCRIMINATOR_RESET: u8 = 0xFE;

/// Mods a client announced in its FML mod list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModInfo {
    pub mod_type: String,
    pub mods: Vec<ModEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModEntry {
    pub id: String,
    pub version: String,
}

/// Whether the handshake address carries the Forge marker.
pub fn is_forge_handshake_address(server_address: &str) -> bool {
    server_address.contains(HANDSHAKE_HOSTNAME_TOKEN)
}

/// Strips any forwarding/FML suffixes from the dialled hostname.
pub fn clean_virtual_host(server_address: &str) -> &str {
    server_address.split('\0').next().unwrap_or(server_address)
}

/// The packet that rewinds a Forge client's handshake state machine.
pub fn reset_packet() -> PluginMessage {
    PluginMessage {
        channel: LEGACY_HANDSHAKE_CHANNEL.to_owned(),
        data: vec![DISCRIMINATOR_RESET, 0],
    }
}

/// Parses an FML mod-list payload (discriminator 2).
pub fn parse_mod_list(data: &[u8]) -> Option<ModInfo> {
    let mut dec = Decoder::new(data);
    if dec.read_u8().ok()? != DISCRIMINATOR_MOD_LIST {
        return None;
    }
    let count = usize::try_from(dec.read_var_int().ok()?).ok()?;
    let mut mods = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        mods.push(ModEntry {
            id: dec.read_string().ok()?.to_owned(),
            version: dec.read_string().ok()?.to_owned(),
        });
    }
    Some(ModInfo {
        mod_type: "FML".to_owned(),
        mods,
    })
}

/// Position of a Forge client's handshake with its current backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClientPhase {
    NotStarted,
    Hello,
    ModList,
    WaitingAck,
    Complete,
}

/// The connection phase stored on a player. Vanilla clients never leave
/// [`ClientConnectionPhase::Vanilla`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClientConnectionPhase {
    Vanilla,
    LegacyForge(ClientPhase),
}

fn next_client_phase(phase: ClientPhase, discriminator: Option<u8>) -> ClientPhase {
    use ClientPhase::*;
    match (phase, discriminator) {
        (NotStarted, Some(DISCRIMINATOR_CLIENT_HELLO)) => Hello,
        (Hello, Some(DISCRIMINATOR_MOD_LIST)) => ModList,
        (ModList, Some(DISCRIMINATOR_ACK)) => WaitingAck,
        (WaitingAck, Some(DISCRIMINATOR_ACK)) => Complete,
        _ => phase,
    }
}

impl ClientConnectionPhase {
    pub fn considered_complete(self) -> bool {
        matches!(
            self,
            ClientConnectionPhase::Vanilla
                | ClientConnectionPhase::LegacyForge(ClientPhase::Complete)
        )
    }

    /// Handles a plugin message travelling from the client towards `target`.
    /// Returns whether the message was consumed by the handshake machine.
    /// Consumed messages are forwarded to the target backend so it can
    /// observe the handshake.
    pub async fn handle(
        self,
        player: &Arc<ConnectedPlayer>,
        target: &Arc<ServerConnection>,
        message: &PluginMessage,
    ) -> bool {
        let ClientConnectionPhase::LegacyForge(phase) = self else {
            return false;
        };
        if message.channel != LEGACY_HANDSHAKE_CHANNEL {
            return false;
        }

        let discriminator = message.data.first().copied();
        if discriminator == Some(DISCRIMINATOR_MOD_LIST) {
            if let Some(info) = parse_mod_list(&message.data) {
                player.set_mod_info(info);
            }
        }
        player.set_phase(ClientConnectionPhase::LegacyForge(next_client_phase(
            phase,
            discriminator,
        )));

        if let Some(conn) = target.conn() {
            let _ = conn
                .write_packet(&Packet::PluginMessage(message.clone()))
                .await;
        }
        true
    }

    /// Hook run when the first JoinGame of the session flows to the client.
    /// The handshake is about to run for the first time, so there is no
    /// client state to rewind.
    pub fn on_first_join(self, _player: &Arc<ConnectedPlayer>) {}

    /// Issues the FML reset packet and re-arms the state machine, so the
    /// handshake can be replayed against the next backend.
    pub async fn reset_connection_phase(self, player: &Arc<ConnectedPlayer>) {
        match self {
            ClientConnectionPhase::Vanilla => {}
            ClientConnectionPhase::LegacyForge(ClientPhase::Complete) => {
                let _ = player
                    .connection()
                    .write_packet(&Packet::PluginMessage(reset_packet()))
                    .await;
                player.set_phase(ClientConnectionPhase::LegacyForge(ClientPhase::NotStarted));
            }
            ClientConnectionPhase::LegacyForge(_) => {
                player.set_phase(ClientConnectionPhase::LegacyForge(ClientPhase::NotStarted));
            }
        }
    }
}

/// Position of the handshake between the proxy and one backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackendPhase {
    /// Backend for a vanilla client; no handshake will ever run.
    Vanilla,
    NotStarted,
    Hello,
    ModList,
    WaitingAck,
    Complete,
    /// The player is being moved to another backend; handshake traffic must
    /// go to the in-flight connection instead.
    InTransition,
}

fn next_backend_phase(phase: BackendPhase, discriminator: Option<u8>) -> BackendPhase {
    use BackendPhase::*;
    match (phase, discriminator) {
        (NotStarted, Some(DISCRIMINATOR_SERVER_HELLO)) => Hello,
        (Hello, Some(DISCRIMINATOR_MOD_LIST)) => ModList,
        (ModList, Some(DISCRIMINATOR_REGISTRY_DATA)) => WaitingAck,
        (WaitingAck, Some(DISCRIMINATOR_REGISTRY_DATA)) => WaitingAck,
        (WaitingAck, Some(DISCRIMINATOR_ACK)) => Complete,
        _ => phase,
    }
}

impl BackendPhase {
    pub fn considered_complete(self) -> bool {
        matches!(self, BackendPhase::Vanilla | BackendPhase::Complete)
    }

    /// Handles a plugin message travelling from the backend to the client.
    /// Returns whether the message was consumed by the handshake machine.
    pub async fn handle(
        self,
        server_conn: &Arc<ServerConnection>,
        player: &Arc<ConnectedPlayer>,
        message: &PluginMessage,
    ) -> bool {
        if self == BackendPhase::Vanilla || message.channel != LEGACY_HANDSHAKE_CHANNEL {
            return false;
        }

        let discriminator = message.data.first().copied();
        server_conn.set_phase(next_backend_phase(self, discriminator));

        let _ = player
            .connection()
            .write_packet(&Packet::PluginMessage(message.clone()))
            .await;
        true
    }

    /// Phase to adopt when the player departs for a new backend.
    pub fn on_depart_for_new_server(self) -> BackendPhase {
        match self {
            BackendPhase::Vanilla => BackendPhase::Vanilla,
            _ => BackendPhase::InTransition,
        }
    }
}

impl ConnectionType {
    pub fn initial_client_phase(self) -> ClientConnectionPhase {
        match self {
            ConnectionType::LegacyForge => {
                ClientConnectionPhase::LegacyForge(ClientPhase::NotStarted)
            }
            _ => ClientConnectionPhase::Vanilla,
        }
    }

    pub fn initial_backend_phase(self) -> BackendPhase {
        match self {
            ConnectionType::LegacyForge => BackendPhase::NotStarted,
            _ => BackendPhase::Vanilla,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_marker_detection() {
        assert!(is_forge_handshake_address("mc.example.com\0FML\0"));
        assert!(!is_forge_handshake_address("mc.example.com"));
        assert_eq!(clean_virtual_host("mc.example.com\0FML\0"), "mc.example.com");
    }

    #[test]
    fn client_machine_walks_to_complete() {
        use ClientPhase::*;
        let mut phase = NotStarted;
        for disc in [
            DISCRIMINATOR_CLIENT_HELLO,
            DISCRIMINATOR_MOD_LIST,
            DISCRIMINATOR_ACK,
            DISCRIMINATOR_ACK,
        ] {
            phase = next_client_phase(phase, Some(disc));
        }
        assert_eq!(phase, Complete);
    }

    #[test]
    fn client_machine_ignores_out_of_order_messages() {
        use ClientPhase::*;
        assert_eq!(
            next_client_phase(NotStarted, Some(DISCRIMINATOR_ACK)),
            NotStarted
        );
        assert_eq!(next_client_phase(Hello, None), Hello);
    }

    #[test]
    fn backend_machine_accepts_repeated_registry_data() {
        use BackendPhase::*;
        let mut phase = NotStarted;
        for disc in [
            DISCRIMINATOR_SERVER_HELLO,
            DISCRIMINATOR_MOD_LIST,
            DISCRIMINATOR_REGISTRY_DATA,
            DISCRIMINATOR_REGISTRY_DATA,
            DISCRIMINATOR_REGISTRY_DATA,
            DISCRIMINATOR_ACK,
        ] {
            phase = next_backend_phase(phase, Some(disc));
        }
        assert_eq!(phase, Complete);
        assert!(phase.considered_complete());
    }

    #[test]
    fn departure_puts_forge_phases_in_transition() {
        assert_eq!(
            BackendPhase::Complete.on_depart_for_new_server(),
            BackendPhase::InTransition
        );
        assert_eq!(
            BackendPhase::Vanilla.on_depart_for_new_server(),
            BackendPhase::Vanilla
        );
    }

    #[test]
    fn mod_list_parsing() {
        let mut data = vec![DISCRIMINATOR_MOD_LIST, 2];
        for (id, version) in [("forge", "14.23.5"), ("jei", "4.16")] {
            data.push(id.len() as u8);
            data.extend(id.as_bytes());
            data.push(version.len() as u8);
            data.extend(version.as_bytes());
        }
        let info = parse_mod_list(&data).unwrap();
        assert_eq!(info.mod_type, "FML");
        assert_eq!(info.mods.len(), 2);
        assert_eq!(info.mods[0].id, "forge");
    }

    #[test]
    fn initial_phases_by_connection_type() {
        assert!(ConnectionType::Vanilla
            .initial_client_phase()
            .considered_complete());
        assert!(!ConnectionType::LegacyForge
            .initial_client_phase()
            .considered_complete());
        assert!(ConnectionType::Vanilla
            .initial_backend_phase()
            .considered_complete());
        assert!(!ConnectionType::LegacyForge
            .initial_backend_phase()
            .considered_complete());
    }
}
