//! Packet id tables, keyed by (state, direction, protocol version).
//!
//! Ids are listed as `(minimum version, id)` steps; a lookup picks the last
//! step at or below the requested version. Only packets the proxy decodes in
//! a given direction are registered — everything else flows through as a raw
//! frame.

use crate::protocol::{packet::PacketKind, version::*, Direction, ProtocolVersion, State};

type IdSteps = &'static [(ProtocolVersion, i32)];

/// Resolves the last id step at or below `version`.
fn select(version: ProtocolVersion, steps: IdSteps) -> Option<i32> {
    steps
        .iter()
        .rev()
        .find(|(min, _)| version >= *min)
        .map(|(_, id)| *id)
}

fn mappings(state: State, direction: Direction) -> &'static [(PacketKind, IdSteps)] {
    use Direction::*;
    use PacketKind::*;
    match (state, direction) {
        (State::Handshake, ServerBound) => &[(Handshake, &[(MINECRAFT_1_7_2, 0x00)])],
        (State::Handshake, ClientBound) => &[],
        (State::Status, ServerBound) => &[
            (StatusRequest, &[(MINECRAFT_1_7_2, 0x00)]),
            (StatusPing, &[(MINECRAFT_1_7_2, 0x01)]),
        ],
        (State::Status, ClientBound) => &[
            (StatusResponse, &[(MINECRAFT_1_7_2, 0x00)]),
            (StatusPing, &[(MINECRAFT_1_7_2, 0x01)]),
        ],
        (State::Login, ServerBound) => &[
            (LoginStart, &[(MINECRAFT_1_7_2, 0x00)]),
            (EncryptionResponse, &[(MINECRAFT_1_7_2, 0x01)]),
        ],
        (State::Login, ClientBound) => &[
            (Disconnect, &[(MINECRAFT_1_7_2, 0x00)]),
            (EncryptionRequest, &[(MINECRAFT_1_7_2, 0x01)]),
            (LoginSuccess, &[(MINECRAFT_1_7_2, 0x02)]),
            (SetCompression, &[(MINECRAFT_1_8, 0x03)]),
        ],
        (State::Play, ServerBound) => &[
            (
                KeepAlive,
                &[
                    (MINECRAFT_1_7_2, 0x00),
                    (MINECRAFT_1_9, 0x0B),
                    (MINECRAFT_1_12, 0x0C),
                    (MINECRAFT_1_12_1, 0x0B),
                    (MINECRAFT_1_13, 0x0E),
                    (MINECRAFT_1_14, 0x0F),
                    (MINECRAFT_1_16, 0x10),
                ],
            ),
            (
                Chat,
                &[
                    (MINECRAFT_1_7_2, 0x01),
                    (MINECRAFT_1_9, 0x02),
                    (MINECRAFT_1_12, 0x03),
                    (MINECRAFT_1_12_1, 0x02),
                    (MINECRAFT_1_14, 0x03),
                ],
            ),
            (
                ClientSettings,
                &[
                    (MINECRAFT_1_7_2, 0x15),
                    (MINECRAFT_1_9, 0x04),
                    (MINECRAFT_1_12, 0x05),
                    (MINECRAFT_1_12_1, 0x04),
                    (MINECRAFT_1_14, 0x05),
                ],
            ),
            (
                PluginMessage,
                &[
                    (MINECRAFT_1_7_2, 0x17),
                    (MINECRAFT_1_9, 0x09),
                    (MINECRAFT_1_12, 0x0A),
                    (MINECRAFT_1_12_1, 0x09),
                    (MINECRAFT_1_13, 0x0A),
                    (MINECRAFT_1_14, 0x0B),
                ],
            ),
        ],
        (State::Play, ClientBound) => &[
            (
                KeepAlive,
                &[
                    (MINECRAFT_1_7_2, 0x00),
                    (MINECRAFT_1_9, 0x1F),
                    (MINECRAFT_1_13, 0x21),
                    (MINECRAFT_1_14, 0x20),
                    (MINECRAFT_1_15, 0x21),
                    (MINECRAFT_1_16, 0x20),
                    (MINECRAFT_1_16_2, 0x1F),
                ],
            ),
            (
                JoinGame,
                &[
                    (MINECRAFT_1_7_2, 0x01),
                    (MINECRAFT_1_9, 0x23),
                    (MINECRAFT_1_13, 0x25),
                    (MINECRAFT_1_15, 0x26),
                    (MINECRAFT_1_16, 0x25),
                    (MINECRAFT_1_16_2, 0x24),
                ],
            ),
            (
                Chat,
                &[
                    (MINECRAFT_1_7_2, 0x02),
                    (MINECRAFT_1_9, 0x0F),
                    (MINECRAFT_1_13, 0x0E),
                    (MINECRAFT_1_15, 0x0F),
                    (MINECRAFT_1_16, 0x0E),
                ],
            ),
            (
                Respawn,
                &[
                    (MINECRAFT_1_7_2, 0x07),
                    (MINECRAFT_1_9, 0x33),
                    (MINECRAFT_1_12, 0x34),
                    (MINECRAFT_1_12_1, 0x35),
                    (MINECRAFT_1_13, 0x38),
                    (MINECRAFT_1_14, 0x3A),
                    (MINECRAFT_1_15, 0x3B),
                    (MINECRAFT_1_16, 0x3A),
                    (MINECRAFT_1_16_2, 0x39),
                ],
            ),
            (
                PluginMessage,
                &[
                    (MINECRAFT_1_7_2, 0x3F),
                    (MINECRAFT_1_9, 0x18),
                    (MINECRAFT_1_13, 0x19),
                    (MINECRAFT_1_14, 0x18),
                    (MINECRAFT_1_15, 0x19),
                    (MINECRAFT_1_16, 0x18),
                    (MINECRAFT_1_16_2, 0x17),
                ],
            ),
            (
                Disconnect,
                &[
                    (MINECRAFT_1_7_2, 0x40),
                    (MINECRAFT_1_9, 0x1A),
                    (MINECRAFT_1_13, 0x1B),
                    (MINECRAFT_1_14, 0x1A),
                    (MINECRAFT_1_15, 0x1B),
                    (MINECRAFT_1_16, 0x1A),
                    (MINECRAFT_1_16_2, 0x19),
                ],
            ),
            (
                ResourcePackRequest,
                &[
                    (MINECRAFT_1_8, 0x48),
                    (MINECRAFT_1_9, 0x32),
                    (MINECRAFT_1_12, 0x33),
                    (MINECRAFT_1_12_1, 0x34),
                    (MINECRAFT_1_13, 0x37),
                    (MINECRAFT_1_14, 0x39),
                    (MINECRAFT_1_15, 0x3A),
                    (MINECRAFT_1_16, 0x39),
                    (MINECRAFT_1_16_2, 0x38),
                ],
            ),
            (
                Title,
                &[
                    (MINECRAFT_1_8, 0x45),
                    (MINECRAFT_1_12, 0x47),
                    (MINECRAFT_1_12_1, 0x48),
                    (MINECRAFT_1_13, 0x4B),
                    (MINECRAFT_1_14, 0x4F),
                    (MINECRAFT_1_15, 0x50),
                    (MINECRAFT_1_16, 0x4F),
                ],
            ),
        ],
    }
}

/// The wire id for `kind` in this state/direction/version, or `None` if the
/// packet does not exist there.
pub fn packet_id(
    state: State,
    direction: Direction,
    kind: PacketKind,
    version: ProtocolVersion,
) -> Option<i32> {
    mappings(state, direction)
        .iter()
        .find(|(k, _)| *k == kind)
        .and_then(|(_, steps)| select(version, steps))
}

/// The packet kind registered under `id`, or `None` for an unknown packet.
pub fn packet_kind(
    state: State,
    direction: Direction,
    id: i32,
    version: ProtocolVersion,
) -> Option<PacketKind> {
    mappings(state, direction)
        .iter()
        .find(|(_, steps)| select(version, steps) == Some(id))
        .map(|(k, _)| *k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use Direction::*;
    use PacketKind::*;

    #[test]
    fn keep_alive_ids_track_versions() {
        assert_eq!(
            packet_id(State::Play, ClientBound, KeepAlive, MINECRAFT_1_7_2),
            Some(0x00)
        );
        assert_eq!(
            packet_id(State::Play, ClientBound, KeepAlive, MINECRAFT_1_12_2),
            Some(0x1F)
        );
        assert_eq!(
            packet_id(State::Play, ClientBound, KeepAlive, MINECRAFT_1_16_4),
            Some(0x1F)
        );
        assert_eq!(
            packet_id(State::Play, ServerBound, KeepAlive, MINECRAFT_1_16),
            Some(0x10)
        );
    }

    #[test]
    fn lookups_are_inverse() {
        for version in [
            MINECRAFT_1_7_2,
            MINECRAFT_1_8,
            MINECRAFT_1_12_2,
            MINECRAFT_1_13,
            MINECRAFT_1_16,
            MINECRAFT_1_16_4,
        ] {
            for direction in [ClientBound, ServerBound] {
                for (kind, _) in mappings(State::Play, direction) {
                    if let Some(id) = packet_id(State::Play, direction, *kind, version) {
                        assert_eq!(
                            packet_kind(State::Play, direction, id, version),
                            Some(*kind),
                            "{kind:?} {direction:?} {version}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn set_compression_missing_before_1_8() {
        assert_eq!(
            packet_id(State::Login, ClientBound, SetCompression, MINECRAFT_1_7_2),
            None
        );
        assert_eq!(
            packet_id(State::Login, ClientBound, SetCompression, MINECRAFT_1_8),
            Some(0x03)
        );
    }

    #[test]
    fn unknown_id_yields_none() {
        assert_eq!(
            packet_kind(State::Play, ServerBound, 0x55, MINECRAFT_1_16),
            None
        );
    }
}
