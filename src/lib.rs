//! A Minecraft Java Edition proxy core.
//!
//! The proxy terminates client connections, opens backend server
//! connections, and shuttles packets between them while preserving the
//! client's illusion of a single continuous game session across backend
//! switches. Instead of rewriting entity ids, a switch replays JoinGame to
//! the client followed by a compensating Respawn, replays the client's
//! plugin channel registrations against the new backend, and, for legacy
//! Forge clients, rewinds and replays the FML handshake.

pub mod command;
pub mod component;
pub mod config;
pub mod connection;
pub mod event;
pub mod forge;
pub mod player;
pub mod protocol;
pub mod proxy;
pub mod server_conn;
pub mod session_backend;
pub mod session_client_play;
pub mod session_handshake;
pub mod session_login;
