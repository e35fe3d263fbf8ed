//! Typed packet kinds the proxy interprets.
//!
//! Only the packets the session core needs to inspect are decoded; every
//! other packet crosses the proxy as a raw frame. Layouts are version
//! dependent, so encode/decode take a [`ProtoContext`] instead of being
//! derived.

use crate::protocol::{
    decoder::{self, Decoder},
    encoder::Encoder,
    version::*,
    Direction, ProtoContext,
};
use uuid::Uuid;

/// Longest chat message a client may send to a server.
pub const MAX_SERVERBOUND_MESSAGE_LENGTH: usize = 256;

/// Chat packet `type` byte values.
pub const CHAT_MESSAGE: u8 = 0;
pub const SYSTEM_MESSAGE: u8 = 1;
pub const GAME_INFO_MESSAGE: u8 = 2;

/// Identifies a packet layout independent of its wire id.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Handshake,
    StatusRequest,
    StatusResponse,
    StatusPing,
    LoginStart,
    EncryptionRequest,
    EncryptionResponse,
    LoginSuccess,
    SetCompression,
    Disconnect,
    KeepAlive,
    Chat,
    ClientSettings,
    PluginMessage,
    JoinGame,
    Respawn,
    ResourcePackRequest,
    Title,
}

/// A decoded packet.
#[derive(Debug, Clone, strum::AsRefStr)]
pub enum Packet {
    Handshake(Handshake),
    StatusRequest(StatusRequest),
    StatusResponse(StatusResponse),
    StatusPing(StatusPing),
    LoginStart(LoginStart),
    EncryptionRequest(EncryptionRequest),
    EncryptionResponse(EncryptionResponse),
    LoginSuccess(LoginSuccess),
    SetCompression(SetCompression),
    Disconnect(Disconnect),
    KeepAlive(KeepAlive),
    Chat(Chat),
    ClientSettings(ClientSettings),
    PluginMessage(PluginMessage),
    JoinGame(JoinGame),
    Respawn(Respawn),
    ResourcePackRequest(ResourcePackRequest),
    Title(Title),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Handshake(_) => PacketKind::Handshake,
            Packet::StatusRequest(_) => PacketKind::StatusRequest,
            Packet::StatusResponse(_) => PacketKind::StatusResponse,
            Packet::StatusPing(_) => PacketKind::StatusPing,
            Packet::LoginStart(_) => PacketKind::LoginStart,
            Packet::EncryptionRequest(_) => PacketKind::EncryptionRequest,
            Packet::EncryptionResponse(_) => PacketKind::EncryptionResponse,
            Packet::LoginSuccess(_) => PacketKind::LoginSuccess,
            Packet::SetCompression(_) => PacketKind::SetCompression,
            Packet::Disconnect(_) => PacketKind::Disconnect,
            Packet::KeepAlive(_) => PacketKind::KeepAlive,
            Packet::Chat(_) => PacketKind::Chat,
            Packet::ClientSettings(_) => PacketKind::ClientSettings,
            Packet::PluginMessage(_) => PacketKind::PluginMessage,
            Packet::JoinGame(_) => PacketKind::JoinGame,
            Packet::Respawn(_) => PacketKind::Respawn,
            Packet::ResourcePackRequest(_) => PacketKind::ResourcePackRequest,
            Packet::Title(_) => PacketKind::Title,
        }
    }

    pub fn encode(&self, enc: &mut Encoder, ctx: &ProtoContext) {
        match self {
            Packet::Handshake(p) => p.encode(enc, ctx),
            Packet::StatusRequest(_) => {}
            Packet::StatusResponse(p) => p.encode(enc, ctx),
            Packet::StatusPing(p) => p.encode(enc, ctx),
            Packet::LoginStart(p) => p.encode(enc, ctx),
            Packet::EncryptionRequest(p) => p.encode(enc, ctx),
            Packet::EncryptionResponse(p) => p.encode(enc, ctx),
            Packet::LoginSuccess(p) => p.encode(enc, ctx),
            Packet::SetCompression(p) => p.encode(enc, ctx),
            Packet::Disconnect(p) => p.encode(enc, ctx),
            Packet::KeepAlive(p) => p.encode(enc, ctx),
            Packet::Chat(p) => p.encode(enc, ctx),
            Packet::ClientSettings(p) => p.encode(enc, ctx),
            Packet::PluginMessage(p) => p.encode(enc, ctx),
            Packet::JoinGame(p) => p.encode(enc, ctx),
            Packet::Respawn(p) => p.encode(enc, ctx),
            Packet::ResourcePackRequest(p) => p.encode(enc, ctx),
            Packet::Title(p) => p.encode(enc, ctx),
        }
    }

    pub fn decode(kind: PacketKind, dec: &mut Decoder, ctx: &ProtoContext) -> decoder::Result<Packet> {
        Ok(match kind {
            PacketKind::Handshake => Packet::Handshake(Handshake::decode(dec, ctx)?),
            PacketKind::StatusRequest => Packet::StatusRequest(StatusRequest),
            PacketKind::StatusResponse => Packet::StatusResponse(StatusResponse::decode(dec, ctx)?),
            PacketKind::StatusPing => Packet::StatusPing(StatusPing::decode(dec, ctx)?),
            PacketKind::LoginStart => Packet::LoginStart(LoginStart::decode(dec, ctx)?),
            PacketKind::EncryptionRequest => {
                Packet::EncryptionRequest(EncryptionRequest::decode(dec, ctx)?)
            }
            PacketKind::EncryptionResponse => {
                Packet::EncryptionResponse(EncryptionResponse::decode(dec, ctx)?)
            }
            PacketKind::LoginSuccess => Packet::LoginSuccess(LoginSuccess::decode(dec, ctx)?),
            PacketKind::SetCompression => Packet::SetCompression(SetCompression::decode(dec, ctx)?),
            PacketKind::Disconnect => Packet::Disconnect(Disconnect::decode(dec, ctx)?),
            PacketKind::KeepAlive => Packet::KeepAlive(KeepAlive::decode(dec, ctx)?),
            PacketKind::Chat => Packet::Chat(Chat::decode(dec, ctx)?),
            PacketKind::ClientSettings => Packet::ClientSettings(ClientSettings::decode(dec, ctx)?),
            PacketKind::PluginMessage => Packet::PluginMessage(PluginMessage::decode(dec, ctx)?),
            PacketKind::JoinGame => Packet::JoinGame(JoinGame::decode(dec, ctx)?),
            PacketKind::Respawn => Packet::Respawn(Respawn::decode(dec, ctx)?),
            PacketKind::ResourcePackRequest => {
                Packet::ResourcePackRequest(ResourcePackRequest::decode(dec, ctx)?)
            }
            PacketKind::Title => Packet::Title(Title::decode(dec, ctx)?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub port: u16,
    pub next_status: i32,
}

impl Handshake {
    fn encode(&self, enc: &mut Encoder, _ctx: &ProtoContext) {
        enc.write_var_int(self.protocol_version);
        enc.write_string(&self.server_address);
        enc.write_u16(self.port);
        enc.write_var_int(self.next_status);
    }

    fn decode(dec: &mut Decoder, _ctx: &ProtoContext) -> decoder::Result<Self> {
        Ok(Self {
            protocol_version: dec.read_var_int()?,
            server_address: dec.read_string()?.to_owned(),
            port: dec.read_u16()?,
            next_status: dec.read_var_int()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StatusRequest;

#[derive(Debug, Clone)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    fn encode(&self, enc: &mut Encoder, _ctx: &ProtoContext) {
        enc.write_string(&self.status);
    }

    fn decode(dec: &mut Decoder, _ctx: &ProtoContext) -> decoder::Result<Self> {
        Ok(Self {
            status: dec.read_string()?.to_owned(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct StatusPing {
    pub payload: i64,
}

impl StatusPing {
    fn encode(&self, enc: &mut Encoder, _ctx: &ProtoContext) {
        enc.write_i64(self.payload);
    }

    fn decode(dec: &mut Decoder, _ctx: &ProtoContext) -> decoder::Result<Self> {
        Ok(Self {
            payload: dec.read_i64()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LoginStart {
    pub username: String,
}

impl LoginStart {
    fn encode(&self, enc: &mut Encoder, _ctx: &ProtoContext) {
        enc.write_string(&self.username);
    }

    fn decode(dec: &mut Decoder, _ctx: &ProtoContext) -> decoder::Result<Self> {
        Ok(Self {
            username: dec.read_string()?.to_owned(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct EncryptionRequest {
    pub server_id: String,
    pub public_key: Vec<u8>,
    pub verify_token: Vec<u8>,
}

impl EncryptionRequest {
    fn encode(&self, enc: &mut Encoder, ctx: &ProtoContext) {
        enc.write_string(&self.server_id);
        if ctx.version >= MINECRAFT_1_8 {
            enc.write_byte_array(&self.public_key);
            enc.write_byte_array(&self.verify_token);
        } else {
            enc.write_short_byte_array(&self.public_key);
            enc.write_short_byte_array(&self.verify_token);
        }
    }

    fn decode(dec: &mut Decoder, ctx: &ProtoContext) -> decoder::Result<Self> {
        let server_id = dec.read_string()?.to_owned();
        let (public_key, verify_token) = if ctx.version >= MINECRAFT_1_8 {
            (dec.read_byte_array()?.to_vec(), dec.read_byte_array()?.to_vec())
        } else {
            (
                dec.read_short_byte_array()?.to_vec(),
                dec.read_short_byte_array()?.to_vec(),
            )
        };
        Ok(Self {
            server_id,
            public_key,
            verify_token,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EncryptionResponse {
    pub shared_secret: Vec<u8>,
    pub verify_token: Vec<u8>,
}

impl EncryptionResponse {
    fn encode(&self, enc: &mut Encoder, ctx: &ProtoContext) {
        if ctx.version >= MINECRAFT_1_8 {
            enc.write_byte_array(&self.shared_secret);
            enc.write_byte_array(&self.verify_token);
        } else {
            enc.write_short_byte_array(&self.shared_secret);
            enc.write_short_byte_array(&self.verify_token);
        }
    }

    fn decode(dec: &mut Decoder, ctx: &ProtoContext) -> decoder::Result<Self> {
        let (shared_secret, verify_token) = if ctx.version >= MINECRAFT_1_8 {
            (dec.read_byte_array()?.to_vec(), dec.read_byte_array()?.to_vec())
        } else {
            (
                dec.read_short_byte_array()?.to_vec(),
                dec.read_short_byte_array()?.to_vec(),
            )
        };
        Ok(Self {
            shared_secret,
            verify_token,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LoginSuccess {
    pub uuid: Uuid,
    pub username: String,
}

impl LoginSuccess {
    fn encode(&self, enc: &mut Encoder, ctx: &ProtoContext) {
        if ctx.version >= MINECRAFT_1_16 {
            enc.write_uuid(self.uuid);
        } else if ctx.version >= MINECRAFT_1_7_6 {
            enc.write_string(&self.uuid.hyphenated().to_string());
        } else {
            enc.write_string(&self.uuid.simple().to_string());
        }
        enc.write_string(&self.username);
    }

    fn decode(dec: &mut Decoder, ctx: &ProtoContext) -> decoder::Result<Self> {
        let uuid = if ctx.version >= MINECRAFT_1_16 {
            dec.read_uuid()?
        } else {
            Uuid::parse_str(dec.read_string()?).unwrap_or(Uuid::nil())
        };
        Ok(Self {
            uuid,
            username: dec.read_string()?.to_owned(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SetCompression {
    pub threshold: i32,
}

impl SetCompression {
    fn encode(&self, enc: &mut Encoder, _ctx: &ProtoContext) {
        enc.write_var_int(self.threshold);
    }

    fn decode(dec: &mut Decoder, _ctx: &ProtoContext) -> decoder::Result<Self> {
        Ok(Self {
            threshold: dec.read_var_int()?,
        })
    }
}

/// Disconnect with a JSON chat component reason. Used in both the Login and
/// Play states, under different ids.
#[derive(Debug, Clone)]
pub struct Disconnect {
    pub reason: String,
}

impl Disconnect {
    fn encode(&self, enc: &mut Encoder, _ctx: &ProtoContext) {
        enc.write_string(&self.reason);
    }

    fn decode(dec: &mut Decoder, _ctx: &ProtoContext) -> decoder::Result<Self> {
        Ok(Self {
            reason: dec.read_string()?.to_owned(),
        })
    }
}

/// Keep-alive with a random id the peer echoes back. The id narrows across
/// protocol history: i64 since 1.12.2, varint since 1.8, i32 before that.
#[derive(Debug, Clone)]
pub struct KeepAlive {
    pub random_id: i64,
}

impl KeepAlive {
    fn encode(&self, enc: &mut Encoder, ctx: &ProtoContext) {
        if ctx.version >= MINECRAFT_1_12_2 {
            enc.write_i64(self.random_id);
        } else if ctx.version >= MINECRAFT_1_8 {
            enc.write_var_int(self.random_id as i32);
        } else {
            enc.write_i32(self.random_id as i32);
        }
    }

    fn decode(dec: &mut Decoder, ctx: &ProtoContext) -> decoder::Result<Self> {
        let random_id = if ctx.version >= MINECRAFT_1_12_2 {
            dec.read_i64()?
        } else if ctx.version >= MINECRAFT_1_8 {
            i64::from(dec.read_var_int()?)
        } else {
            i64::from(dec.read_i32()?)
        };
        Ok(Self { random_id })
    }
}

/// Chat in both directions. Server-bound carries only the message; the
/// client-bound form adds a type byte (1.8+) and the sender UUID (1.16+).
#[derive(Debug, Clone)]
pub struct Chat {
    pub message: String,
    pub message_type: u8,
    pub sender: Uuid,
}

impl Chat {
    fn encode(&self, enc: &mut Encoder, ctx: &ProtoContext) {
        enc.write_string(&self.message);
        if ctx.direction == Direction::ClientBound {
            if ctx.version >= MINECRAFT_1_8 {
                enc.write_u8(self.message_type);
            }
            if ctx.version >= MINECRAFT_1_16 {
                enc.write_uuid(self.sender);
            }
        }
    }

    fn decode(dec: &mut Decoder, ctx: &ProtoContext) -> decoder::Result<Self> {
        let message = dec.read_string()?.to_owned();
        let mut message_type = CHAT_MESSAGE;
        let mut sender = Uuid::nil();
        if ctx.direction == Direction::ClientBound {
            if ctx.version >= MINECRAFT_1_8 {
                message_type = dec.read_u8()?;
            }
            if ctx.version >= MINECRAFT_1_16 {
                sender = dec.read_uuid()?;
            }
        }
        Ok(Self {
            message,
            message_type,
            sender,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub locale: String,
    pub view_distance: i8,
    pub chat_visibility: i32,
    pub chat_colors: bool,
    /// Pre-1.8 clients send a difficulty byte here instead of skin parts.
    pub skin_parts: u8,
    pub main_hand: i32,
}

impl ClientSettings {
    fn encode(&self, enc: &mut Encoder, ctx: &ProtoContext) {
        enc.write_string(&self.locale);
        enc.write_i8(self.view_distance);
        enc.write_var_int(self.chat_visibility);
        enc.write_bool(self.chat_colors);
        if ctx.version < MINECRAFT_1_8 {
            enc.write_u8(0); // difficulty, ignored
            enc.write_bool(self.skin_parts & 0x01 != 0); // show cape
        } else {
            enc.write_u8(self.skin_parts);
            if ctx.version >= MINECRAFT_1_9 {
                enc.write_var_int(self.main_hand);
            }
        }
    }

    fn decode(dec: &mut Decoder, ctx: &ProtoContext) -> decoder::Result<Self> {
        let locale = dec.read_string()?.to_owned();
        let view_distance = dec.read_i8()?;
        let chat_visibility = dec.read_var_int()?;
        let chat_colors = dec.read_bool()?;
        let (skin_parts, main_hand) = if ctx.version < MINECRAFT_1_8 {
            let _difficulty = dec.read_u8()?;
            let show_cape = dec.read_bool()?;
            (if show_cape { 0x01 } else { 0x00 }, 1)
        } else {
            let parts = dec.read_u8()?;
            let hand = if ctx.version >= MINECRAFT_1_9 {
                dec.read_var_int()?
            } else {
                1
            };
            (parts, hand)
        };
        Ok(Self {
            locale,
            view_distance,
            chat_visibility,
            chat_colors,
            skin_parts,
            main_hand,
        })
    }
}

/// A named-channel message. The payload framing changed in 1.8: before that
/// the data carries a length prefix of its own.
#[derive(Debug, Clone)]
pub struct PluginMessage {
    pub channel: String,
    pub data: Vec<u8>,
}

impl PluginMessage {
    fn encode(&self, enc: &mut Encoder, ctx: &ProtoContext) {
        enc.write_string(&self.channel);
        if ctx.version < MINECRAFT_1_8 {
            enc.write_short_byte_array(&self.data);
        } else {
            enc.write_slice(&self.data);
        }
    }

    fn decode(dec: &mut Decoder, ctx: &ProtoContext) -> decoder::Result<Self> {
        let channel = dec.read_string()?.to_owned();
        let data = if ctx.version < MINECRAFT_1_8 {
            dec.read_short_byte_array()?.to_vec()
        } else {
            dec.consume_slice(dec.remaining())?.to_vec()
        };
        Ok(Self { channel, data })
    }
}

/// World identity carried by JoinGame/Respawn on 1.16+.
#[derive(Debug, Clone, Default)]
pub struct DimensionInfo {
    pub registry_identifier: String,
    pub level_name: String,
    pub is_flat: bool,
    pub is_debug: bool,
}

/// The packet that (re)initialises the player's world state.
#[derive(Debug, Clone, Default)]
pub struct JoinGame {
    pub entity_id: i32,
    pub is_hardcore: bool,
    pub gamemode: u8,
    /// Numeric dimension, meaningful below 1.16.
    pub dimension: i32,
    pub partial_hashed_seed: i64,
    pub difficulty: u8,
    pub max_players: i32,
    pub level_type: Option<String>,
    pub view_distance: i32,
    pub reduced_debug_info: bool,
    pub show_respawn_screen: bool,
    pub previous_gamemode: i8,
    pub level_names: Vec<String>,
    /// Raw dimension registry NBT, carried verbatim (1.16+).
    pub dimension_registry: Option<Vec<u8>>,
    /// Raw dimension data NBT, carried verbatim (1.16.2+).
    pub current_dimension_data: Option<Vec<u8>>,
    pub dimension_info: Option<DimensionInfo>,
}

impl JoinGame {
    fn encode(&self, enc: &mut Encoder, ctx: &ProtoContext) {
        let v = ctx.version;
        enc.write_i32(self.entity_id);
        if v >= MINECRAFT_1_16_2 {
            enc.write_bool(self.is_hardcore);
            enc.write_u8(self.gamemode);
        } else {
            enc.write_u8(self.gamemode | if self.is_hardcore { 0x08 } else { 0 });
        }
        let info = self.dimension_info.clone().unwrap_or_default();
        if v >= MINECRAFT_1_16 {
            enc.write_i8(self.previous_gamemode);
            enc.write_string_list(&self.level_names);
            enc.write_slice(self.dimension_registry.as_deref().unwrap_or(&[0]));
            if v >= MINECRAFT_1_16_2 {
                enc.write_slice(self.current_dimension_data.as_deref().unwrap_or(&[0]));
            } else {
                enc.write_string(&info.registry_identifier);
            }
            enc.write_string(&info.level_name);
        } else if v >= MINECRAFT_1_9 {
            enc.write_i32(self.dimension);
        } else {
            enc.write_i8(self.dimension as i8);
        }
        if v < MINECRAFT_1_14 {
            enc.write_u8(self.difficulty);
        }
        if v >= MINECRAFT_1_15 {
            enc.write_i64(self.partial_hashed_seed);
        }
        if v >= MINECRAFT_1_16_2 {
            enc.write_var_int(self.max_players);
        } else {
            enc.write_u8(self.max_players as u8);
        }
        if v < MINECRAFT_1_16 {
            enc.write_string(self.level_type.as_deref().unwrap_or("default"));
        }
        if v >= MINECRAFT_1_14 {
            enc.write_var_int(self.view_distance);
        }
        enc.write_bool(self.reduced_debug_info);
        if v >= MINECRAFT_1_15 {
            enc.write_bool(self.show_respawn_screen);
        }
        if v >= MINECRAFT_1_16 {
            enc.write_bool(info.is_debug);
            enc.write_bool(info.is_flat);
        }
    }

    fn decode(dec: &mut Decoder, ctx: &ProtoContext) -> decoder::Result<Self> {
        let v = ctx.version;
        let mut p = JoinGame {
            entity_id: dec.read_i32()?,
            ..Default::default()
        };
        if v >= MINECRAFT_1_16_2 {
            p.is_hardcore = dec.read_bool()?;
            p.gamemode = dec.read_u8()?;
        } else {
            let raw = dec.read_u8()?;
            p.is_hardcore = raw & 0x08 != 0;
            p.gamemode = raw & !0x08;
        }
        if v >= MINECRAFT_1_16 {
            p.previous_gamemode = dec.read_i8()?;
            p.level_names = dec.read_string_list()?;
            p.dimension_registry = Some(dec.read_raw_nbt()?.to_vec());
            let mut info = DimensionInfo::default();
            if v >= MINECRAFT_1_16_2 {
                p.current_dimension_data = Some(dec.read_raw_nbt()?.to_vec());
            } else {
                info.registry_identifier = dec.read_string()?.to_owned();
            }
            info.level_name = dec.read_string()?.to_owned();
            p.dimension_info = Some(info);
        } else if v >= MINECRAFT_1_9 {
            p.dimension = dec.read_i32()?;
        } else {
            p.dimension = i32::from(dec.read_i8()?);
        }
        if v < MINECRAFT_1_14 {
            p.difficulty = dec.read_u8()?;
        }
        if v >= MINECRAFT_1_15 {
            p.partial_hashed_seed = dec.read_i64()?;
        }
        p.max_players = if v >= MINECRAFT_1_16_2 {
            dec.read_var_int()?
        } else {
            i32::from(dec.read_u8()?)
        };
        if v < MINECRAFT_1_16 {
            p.level_type = Some(dec.read_string()?.to_owned());
        }
        if v >= MINECRAFT_1_14 {
            p.view_distance = dec.read_var_int()?;
        }
        p.reduced_debug_info = dec.read_bool()?;
        if v >= MINECRAFT_1_15 {
            p.show_respawn_screen = dec.read_bool()?;
        }
        if v >= MINECRAFT_1_16 {
            let info = p.dimension_info.get_or_insert_with(Default::default);
            info.is_debug = dec.read_bool()?;
            info.is_flat = dec.read_bool()?;
        }
        Ok(p)
    }
}

/// Mirror of [`JoinGame`] that moves the player between dimensions.
#[derive(Debug, Clone, Default)]
pub struct Respawn {
    pub dimension: i32,
    pub partial_hashed_seed: i64,
    pub difficulty: u8,
    pub gamemode: u8,
    pub level_type: String,
    pub should_keep_player_data: bool,
    pub dimension_info: Option<DimensionInfo>,
    pub previous_gamemode: i8,
    pub current_dimension_data: Option<Vec<u8>>,
}

impl Respawn {
    fn encode(&self, enc: &mut Encoder, ctx: &ProtoContext) {
        let v = ctx.version;
        if v >= MINECRAFT_1_16 {
            let info = self.dimension_info.clone().unwrap_or_default();
            if v >= MINECRAFT_1_16_2 {
                enc.write_slice(self.current_dimension_data.as_deref().unwrap_or(&[0]));
            } else {
                enc.write_string(&info.registry_identifier);
            }
            enc.write_string(&info.level_name);
            enc.write_i64(self.partial_hashed_seed);
            enc.write_u8(self.gamemode);
            enc.write_i8(self.previous_gamemode);
            enc.write_bool(info.is_debug);
            enc.write_bool(info.is_flat);
            enc.write_bool(self.should_keep_player_data);
        } else {
            enc.write_i32(self.dimension);
            if v < MINECRAFT_1_14 {
                enc.write_u8(self.difficulty);
            }
            if v >= MINECRAFT_1_15 {
                enc.write_i64(self.partial_hashed_seed);
            }
            enc.write_u8(self.gamemode);
            enc.write_string(&self.level_type);
        }
    }

    fn decode(dec: &mut Decoder, ctx: &ProtoContext) -> decoder::Result<Self> {
        let v = ctx.version;
        let mut p = Respawn::default();
        if v >= MINECRAFT_1_16 {
            let mut info = DimensionInfo::default();
            if v >= MINECRAFT_1_16_2 {
                p.current_dimension_data = Some(dec.read_raw_nbt()?.to_vec());
            } else {
                info.registry_identifier = dec.read_string()?.to_owned();
            }
            info.level_name = dec.read_string()?.to_owned();
            p.partial_hashed_seed = dec.read_i64()?;
            p.gamemode = dec.read_u8()?;
            p.previous_gamemode = dec.read_i8()?;
            info.is_debug = dec.read_bool()?;
            info.is_flat = dec.read_bool()?;
            p.should_keep_player_data = dec.read_bool()?;
            p.dimension_info = Some(info);
        } else {
            p.dimension = dec.read_i32()?;
            if v < MINECRAFT_1_14 {
                p.difficulty = dec.read_u8()?;
            }
            if v >= MINECRAFT_1_15 {
                p.partial_hashed_seed = dec.read_i64()?;
            }
            p.gamemode = dec.read_u8()?;
            p.level_type = dec.read_string()?.to_owned();
        }
        Ok(p)
    }
}

#[derive(Debug, Clone)]
pub struct ResourcePackRequest {
    pub url: String,
    /// Lower-case hex SHA-1 of the pack, or empty when unknown.
    pub hash: String,
}

impl ResourcePackRequest {
    fn encode(&self, enc: &mut Encoder, _ctx: &ProtoContext) {
        enc.write_string(&self.url);
        enc.write_string(&self.hash);
    }

    fn decode(dec: &mut Decoder, _ctx: &ProtoContext) -> decoder::Result<Self> {
        Ok(Self {
            url: dec.read_string()?.to_owned(),
            hash: dec.read_string()?.to_owned(),
        })
    }
}

/// Title sub-actions. The action-bar variant was inserted in 1.11, shifting
/// the ids of everything after it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TitleAction {
    SetTitle,
    SetSubtitle,
    SetActionBar,
    SetTimes,
    Hide,
    Reset,
}

impl TitleAction {
    pub fn id(self, version: ProtocolVersion) -> i32 {
        let modern = version >= MINECRAFT_1_11;
        match self {
            TitleAction::SetTitle => 0,
            TitleAction::SetSubtitle => 1,
            TitleAction::SetActionBar => 2,
            TitleAction::SetTimes => {
                if modern {
                    3
                } else {
                    2
                }
            }
            TitleAction::Hide => {
                if modern {
                    4
                } else {
                    3
                }
            }
            TitleAction::Reset => {
                if modern {
                    5
                } else {
                    4
                }
            }
        }
    }

    fn from_id(id: i32, version: ProtocolVersion) -> Option<Self> {
        let modern = version >= MINECRAFT_1_11;
        Some(match (id, modern) {
            (0, _) => TitleAction::SetTitle,
            (1, _) => TitleAction::SetSubtitle,
            (2, true) => TitleAction::SetActionBar,
            (2, false) | (3, true) => TitleAction::SetTimes,
            (3, false) | (4, true) => TitleAction::Hide,
            (4, false) | (5, true) => TitleAction::Reset,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Title {
    pub action: TitleAction,
    pub component: Option<String>,
    pub fade_in: i32,
    pub stay: i32,
    pub fade_out: i32,
}

impl Title {
    /// A reset title, used to clear lingering titles after a server switch.
    pub fn reset() -> Self {
        Self {
            action: TitleAction::Reset,
            component: None,
            fade_in: 0,
            stay: 0,
            fade_out: 0,
        }
    }

    /// An action-bar title (1.11+ only).
    pub fn action_bar(component_json: String) -> Self {
        Self {
            action: TitleAction::SetActionBar,
            component: Some(component_json),
            fade_in: 0,
            stay: 0,
            fade_out: 0,
        }
    }

    fn encode(&self, enc: &mut Encoder, ctx: &ProtoContext) {
        enc.write_var_int(self.action.id(ctx.version));
        match self.action {
            TitleAction::SetTitle | TitleAction::SetSubtitle | TitleAction::SetActionBar => {
                enc.write_string(self.component.as_deref().unwrap_or("{\"text\":\"\"}"));
            }
            TitleAction::SetTimes => {
                enc.write_i32(self.fade_in);
                enc.write_i32(self.stay);
                enc.write_i32(self.fade_out);
            }
            TitleAction::Hide | TitleAction::Reset => {}
        }
    }

    fn decode(dec: &mut Decoder, ctx: &ProtoContext) -> decoder::Result<Self> {
        let id = dec.read_var_int()?;
        let action = TitleAction::from_id(id, ctx.version).unwrap_or(TitleAction::Reset);
        let mut p = Title {
            action,
            component: None,
            fade_in: 0,
            stay: 0,
            fade_out: 0,
        };
        match action {
            TitleAction::SetTitle | TitleAction::SetSubtitle | TitleAction::SetActionBar => {
                p.component = Some(dec.read_string()?.to_owned());
            }
            TitleAction::SetTimes => {
                p.fade_in = dec.read_i32()?;
                p.stay = dec.read_i32()?;
                p.fade_out = dec.read_i32()?;
            }
            TitleAction::Hide | TitleAction::Reset => {}
        }
        Ok(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(version: ProtocolVersion, direction: Direction) -> ProtoContext {
        ProtoContext { version, direction }
    }

    fn roundtrip(p: &Packet, c: ProtoContext) -> Packet {
        let mut buf = Vec::new();
        p.encode(&mut Encoder::new(&mut buf), &c);
        let mut dec = Decoder::new(&buf);
        let out = Packet::decode(p.kind(), &mut dec, &c).unwrap();
        assert!(dec.is_finished(), "{} left bytes", p.as_ref());
        out
    }

    #[test]
    fn keep_alive_wire_width_by_version() {
        let p = KeepAlive {
            random_id: 0x1122334455667788,
        };
        let mut buf = Vec::new();
        p.encode(
            &mut Encoder::new(&mut buf),
            &ctx(MINECRAFT_1_16, Direction::ClientBound),
        );
        assert_eq!(buf.len(), 8);

        buf.clear();
        p.encode(
            &mut Encoder::new(&mut buf),
            &ctx(MINECRAFT_1_7_2, Direction::ClientBound),
        );
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn chat_serverbound_has_no_type_or_sender() {
        let c = ctx(MINECRAFT_1_16, Direction::ServerBound);
        let p = Packet::Chat(Chat {
            message: "hello".into(),
            message_type: CHAT_MESSAGE,
            sender: Uuid::nil(),
        });
        let mut buf = Vec::new();
        p.encode(&mut Encoder::new(&mut buf), &c);
        // varint len + "hello", nothing else
        assert_eq!(buf.len(), 6);
        roundtrip(&p, c);
    }

    #[test]
    fn chat_clientbound_carries_sender_on_1_16() {
        let c = ctx(MINECRAFT_1_16, Direction::ClientBound);
        let sender = Uuid::from_u128(42);
        let p = Packet::Chat(Chat {
            message: "hi".into(),
            message_type: SYSTEM_MESSAGE,
            sender,
        });
        match roundtrip(&p, c) {
            Packet::Chat(out) => {
                assert_eq!(out.message_type, SYSTEM_MESSAGE);
                assert_eq!(out.sender, sender);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn join_game_roundtrip_1_12_2() {
        let c = ctx(MINECRAFT_1_12_2, Direction::ClientBound);
        let p = Packet::JoinGame(JoinGame {
            entity_id: 77,
            gamemode: 1,
            dimension: -1,
            difficulty: 2,
            max_players: 20,
            level_type: Some("default".into()),
            ..Default::default()
        });
        match roundtrip(&p, c) {
            Packet::JoinGame(out) => {
                assert_eq!(out.entity_id, 77);
                assert_eq!(out.dimension, -1);
                assert_eq!(out.level_type.as_deref(), Some("default"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn join_game_roundtrip_1_16_carries_raw_registry() {
        let c = ctx(MINECRAFT_1_16, Direction::ClientBound);
        // Minimal empty compound.
        let registry = vec![10, 0, 0, 0];
        let p = Packet::JoinGame(JoinGame {
            entity_id: 1,
            gamemode: 0,
            previous_gamemode: -1,
            level_names: vec!["minecraft:overworld".into()],
            dimension_registry: Some(registry.clone()),
            dimension_info: Some(DimensionInfo {
                registry_identifier: "minecraft:overworld".into(),
                level_name: "minecraft:overworld".into(),
                is_flat: false,
                is_debug: false,
            }),
            max_players: 20,
            view_distance: 10,
            show_respawn_screen: true,
            ..Default::default()
        });
        match roundtrip(&p, c) {
            Packet::JoinGame(out) => {
                assert_eq!(out.dimension_registry.as_deref(), Some(&registry[..]));
                assert_eq!(
                    out.dimension_info.unwrap().registry_identifier,
                    "minecraft:overworld"
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn respawn_roundtrip_1_15_2() {
        let c = ctx(MINECRAFT_1_15_2, Direction::ClientBound);
        let p = Packet::Respawn(Respawn {
            dimension: -1,
            partial_hashed_seed: 0xDEAD,
            gamemode: 0,
            level_type: "default".into(),
            ..Default::default()
        });
        match roundtrip(&p, c) {
            Packet::Respawn(out) => {
                assert_eq!(out.dimension, -1);
                assert_eq!(out.partial_hashed_seed, 0xDEAD);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn plugin_message_legacy_length_prefix() {
        let c = ctx(MINECRAFT_1_7_2, Direction::ServerBound);
        let p = Packet::PluginMessage(PluginMessage {
            channel: "MC|Brand".into(),
            data: b"vanilla".to_vec(),
        });
        match roundtrip(&p, c) {
            Packet::PluginMessage(out) => assert_eq!(out.data, b"vanilla"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn title_reset_id_shifts_at_1_11() {
        assert_eq!(TitleAction::Reset.id(MINECRAFT_1_8), 4);
        assert_eq!(TitleAction::Reset.id(MINECRAFT_1_11), 5);
        assert_eq!(TitleAction::SetActionBar.id(MINECRAFT_1_11), 2);
    }

    #[test]
    fn login_success_uuid_formats() {
        let id = Uuid::from_u128(0x11223344556677889900aabbccddeeff);
        let p = LoginSuccess {
            uuid: id,
            username: "Steve".into(),
        };
        let mut buf = Vec::new();
        p.encode(
            &mut Encoder::new(&mut buf),
            &ctx(MINECRAFT_1_8, Direction::ClientBound),
        );
        let mut dec = Decoder::new(&buf);
        assert_eq!(dec.read_string().unwrap().len(), 36); // dashed

        buf.clear();
        p.encode(
            &mut Encoder::new(&mut buf),
            &ctx(MINECRAFT_1_16, Direction::ClientBound),
        );
        assert_eq!(&buf[..16], id.as_bytes());
    }
}
