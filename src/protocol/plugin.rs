//! Helpers for the plugin-message channels the proxy itself understands:
//! channel registration, the brand channel, and channel name parsing.

use crate::protocol::{
    packet::PluginMessage,
    version::{ProtocolVersion, MINECRAFT_1_13, MINECRAFT_1_8},
    Decoder, Encoder,
};

pub const REGISTER_CHANNEL_LEGACY: &str = "REGISTER";
pub const REGISTER_CHANNEL: &str = "minecraft:register";
pub const UNREGISTER_CHANNEL_LEGACY: &str = "UNREGISTER";
pub const UNREGISTER_CHANNEL: &str = "minecraft:unregister";
pub const BRAND_CHANNEL_LEGACY: &str = "MC|Brand";
pub const BRAND_CHANNEL: &str = "minecraft:brand";

/// Suffix appended to the backend brand so players can tell they are
/// connected through the proxy.
pub const BRAND_SUFFIX: &str = " (via Portcullis)";

/// Whether this message is a channel REGISTER for the given version's
/// naming.
pub fn is_register(message: &PluginMessage) -> bool {
    message.channel == REGISTER_CHANNEL || message.channel == REGISTER_CHANNEL_LEGACY
}

/// Whether this message is a channel UNREGISTER.
pub fn is_unregister(message: &PluginMessage) -> bool {
    message.channel == UNREGISTER_CHANNEL || message.channel == UNREGISTER_CHANNEL_LEGACY
}

/// Whether this message is a legacy (pre-1.13) register frame. Used by the
/// backend-to-client forwarding whitelist.
pub fn is_legacy_register(message: &PluginMessage) -> bool {
    message.channel == REGISTER_CHANNEL_LEGACY
}

pub fn is_legacy_unregister(message: &PluginMessage) -> bool {
    message.channel == UNREGISTER_CHANNEL_LEGACY
}

/// Whether this message carries the server brand.
pub fn is_brand(message: &PluginMessage) -> bool {
    message.channel == BRAND_CHANNEL || message.channel == BRAND_CHANNEL_LEGACY
}

/// Parses the NUL-separated channel list of a REGISTER/UNREGISTER payload.
pub fn channels(message: &PluginMessage) -> Vec<String> {
    if message.data.is_empty() {
        return Vec::new();
    }
    String::from_utf8_lossy(&message.data)
        .split('\0')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Builds a REGISTER message advertising `channels`, using the channel
/// naming of `version`.
pub fn construct_channels_packet<I, S>(version: ProtocolVersion, channels: I) -> PluginMessage
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let channel = if version >= MINECRAFT_1_13 {
        REGISTER_CHANNEL
    } else {
        REGISTER_CHANNEL_LEGACY
    };
    let data = channels
        .into_iter()
        .map(|c| c.as_ref().to_owned())
        .collect::<Vec<_>>()
        .join("\0")
        .into_bytes();
    PluginMessage {
        channel: channel.to_owned(),
        data,
    }
}

/// Rewrites a brand message to append the proxy suffix. The brand payload is
/// a varint-prefixed string since 1.8 and raw bytes before that.
pub fn rewrite_brand(message: &PluginMessage, version: ProtocolVersion) -> PluginMessage {
    let brand = read_brand(&message.data, version);
    let rewritten = format!("{brand}{BRAND_SUFFIX}");

    let mut data = Vec::with_capacity(rewritten.len() + 2);
    if version >= MINECRAFT_1_8 {
        Encoder::new(&mut data).write_string(&rewritten);
    } else {
        data.extend_from_slice(rewritten.as_bytes());
    }
    PluginMessage {
        channel: message.channel.clone(),
        data,
    }
}

fn read_brand(data: &[u8], version: ProtocolVersion) -> String {
    if version >= MINECRAFT_1_8 {
        Decoder::new(data)
            .read_string()
            .map(str::to_owned)
            .unwrap_or_default()
    } else {
        String::from_utf8_lossy(data).into_owned()
    }
}

/// Whether a modern channel identifier is well formed
/// (`namespace:name`, lower case).
pub fn valid_identifier(channel: &str) -> bool {
    let Some((namespace, name)) = channel.split_once(':') else {
        return false;
    };
    let ok = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '_' | '-' | '/'))
    };
    ok(namespace) && ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::version::{MINECRAFT_1_12_2, MINECRAFT_1_16, MINECRAFT_1_7_2};

    #[test]
    fn channel_list_parsing() {
        let msg = PluginMessage {
            channel: REGISTER_CHANNEL.into(),
            data: b"minecraft:brand\0velocity:main".to_vec(),
        };
        assert_eq!(channels(&msg), vec!["minecraft:brand", "velocity:main"]);
        assert!(channels(&PluginMessage {
            channel: REGISTER_CHANNEL.into(),
            data: Vec::new(),
        })
        .is_empty());
    }

    #[test]
    fn construct_uses_version_appropriate_channel() {
        let modern = construct_channels_packet(MINECRAFT_1_16, ["a:b", "c:d"]);
        assert_eq!(modern.channel, REGISTER_CHANNEL);
        assert_eq!(modern.data, b"a:b\0c:d");

        let legacy = construct_channels_packet(MINECRAFT_1_12_2, ["Chan"]);
        assert_eq!(legacy.channel, REGISTER_CHANNEL_LEGACY);
    }

    #[test]
    fn brand_rewrite_appends_suffix() {
        let mut data = Vec::new();
        Encoder::new(&mut data).write_string("vanilla");
        let msg = PluginMessage {
            channel: BRAND_CHANNEL.into(),
            data,
        };
        let out = rewrite_brand(&msg, MINECRAFT_1_16);
        assert_eq!(
            Decoder::new(&out.data).read_string().unwrap(),
            format!("vanilla{BRAND_SUFFIX}")
        );
    }

    #[test]
    fn brand_rewrite_pre_1_8_is_raw() {
        let msg = PluginMessage {
            channel: BRAND_CHANNEL_LEGACY.into(),
            data: b"vanilla".to_vec(),
        };
        let out = rewrite_brand(&msg, MINECRAFT_1_7_2);
        assert_eq!(out.data, format!("vanilla{BRAND_SUFFIX}").into_bytes());
    }

    #[test]
    fn identifier_validation() {
        assert!(valid_identifier("minecraft:brand"));
        assert!(valid_identifier("my_mod:main/channel"));
        assert!(!valid_identifier("REGISTER"));
        assert!(!valid_identifier("Upper:case"));
        assert!(!valid_identifier("empty:"));
    }
}
