//! Protocol version numbers for the supported Minecraft releases.

use std::fmt;

/// A Minecraft protocol version number, as sent in the Handshake packet.
///
/// Versions are totally ordered by their wire number, which lets callers
/// write `version >= MINECRAFT_1_16` for era checks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(pub i32);

pub const MINECRAFT_1_7_2: ProtocolVersion = ProtocolVersion(4);
pub const MINECRAFT_1_7_6: ProtocolVersion = ProtocolVersion(5);
pub const MINECRAFT_1_8: ProtocolVersion = ProtocolVersion(47);
pub const MINECRAFT_1_9: ProtocolVersion = ProtocolVersion(107);
pub const MINECRAFT_1_11: ProtocolVersion = ProtocolVersion(315);
pub const MINECRAFT_1_12: ProtocolVersion = ProtocolVersion(335);
pub const MINECRAFT_1_12_1: ProtocolVersion = ProtocolVersion(338);
pub const MINECRAFT_1_12_2: ProtocolVersion = ProtocolVersion(340);
pub const MINECRAFT_1_13: ProtocolVersion = ProtocolVersion(393);
pub const MINECRAFT_1_14: ProtocolVersion = ProtocolVersion(477);
pub const MINECRAFT_1_15: ProtocolVersion = ProtocolVersion(573);
pub const MINECRAFT_1_15_2: ProtocolVersion = ProtocolVersion(578);
pub const MINECRAFT_1_16: ProtocolVersion = ProtocolVersion(735);
pub const MINECRAFT_1_16_1: ProtocolVersion = ProtocolVersion(736);
pub const MINECRAFT_1_16_2: ProtocolVersion = ProtocolVersion(751);
pub const MINECRAFT_1_16_4: ProtocolVersion = ProtocolVersion(754);

/// Oldest version the proxy will accept from a client.
pub const MINIMUM_VERSION: ProtocolVersion = MINECRAFT_1_7_2;
/// Newest version the proxy will accept from a client.
pub const MAXIMUM_VERSION: ProtocolVersion = MINECRAFT_1_16_4;

impl ProtocolVersion {
    pub fn supported(self) -> bool {
        (MINIMUM_VERSION..=MAXIMUM_VERSION).contains(&self)
    }

    /// Human-readable release name, best effort.
    pub fn name(self) -> &'static str {
        match self.0 {
            4 => "1.7.2",
            5 => "1.7.6",
            47 => "1.8",
            107 => "1.9",
            315 => "1.11",
            335 => "1.12",
            338 => "1.12.1",
            340 => "1.12.2",
            393 => "1.13",
            477 => "1.14",
            573 => "1.15",
            578 => "1.15.2",
            735 => "1.16",
            736 => "1.16.1",
            751 => "1.16.2",
            754 => "1.16.4",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (protocol {})", self.name(), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering_follows_wire_numbers() {
        assert!(MINECRAFT_1_7_2 < MINECRAFT_1_8);
        assert!(MINECRAFT_1_15_2 < MINECRAFT_1_16);
        assert!(MINECRAFT_1_16_2 >= MINECRAFT_1_16);
    }

    #[test]
    fn supported_range() {
        assert!(MINECRAFT_1_12_2.supported());
        assert!(!ProtocolVersion(3).supported());
        assert!(!ProtocolVersion(755).supported());
    }
}
