//! Session handlers for the Handshake and Status states.

use crate::{
    component::Component,
    connection::{Connection, ConnectionType, SessionHandler},
    forge,
    protocol::{
        packet::{Disconnect, Handshake, Packet, StatusPing, StatusResponse},
        version::{ProtocolVersion, MAXIMUM_VERSION},
        State,
    },
    proxy::Proxy,
    session_login::LoginSessionHandler,
};
use async_trait::async_trait;
use serde_json::json;
use std::{any::Any, sync::Arc};

pub struct HandshakeSessionHandler {
    conn: Arc<Connection>,
    proxy: Arc<Proxy>,
}

impl HandshakeSessionHandler {
    pub fn new(conn: Arc<Connection>, proxy: Arc<Proxy>) -> Self {
        Self { conn, proxy }
    }

    async fn handle_handshake(&self, handshake: Handshake) {
        let version = ProtocolVersion(handshake.protocol_version);
        self.conn.set_protocol(version);

        match handshake.next_status {
            1 => {
                self.conn.set_state(State::Status);
                self.conn
                    .set_session_handler(Arc::new(StatusSessionHandler {
                        conn: Arc::clone(&self.conn),
                        proxy: Arc::clone(&self.proxy),
                    }))
                    .await;
            }
            2 => {
                let conn_type = if forge::is_forge_handshake_address(&handshake.server_address) {
                    ConnectionType::LegacyForge
                } else {
                    ConnectionType::Vanilla
                };
                self.conn.set_conn_type(conn_type);
                self.conn.set_state(State::Login);

                if !version.supported() {
                    let reason = Component::text("This proxy does not support your client version.");
                    let _ = self
                        .conn
                        .close_with(&Packet::Disconnect(Disconnect {
                            reason: reason.json(),
                        }))
                        .await;
                    return;
                }

                let virtual_host = format!(
                    "{}:{}",
                    forge::clean_virtual_host(&handshake.server_address),
                    handshake.port
                );
                self.conn
                    .set_session_handler(Arc::new(LoginSessionHandler::new(
                        Arc::clone(&self.conn),
                        Arc::clone(&self.proxy),
                        virtual_host,
                    )))
                    .await;
            }
            other => {
                tracing::debug!(next_status = other, "invalid handshake next state");
                let _ = self.conn.close().await;
            }
        }
    }
}

#[async_trait]
impl SessionHandler for HandshakeSessionHandler {
    async fn handle_packet(&self, packet: Packet) {
        match packet {
            Packet::Handshake(h) => self.handle_handshake(h).await,
            other => {
                tracing::debug!(packet = other.as_ref(), "unexpected packet before handshake");
                let _ = self.conn.close().await;
            }
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct StatusSessionHandler {
    conn: Arc<Connection>,
    proxy: Arc<Proxy>,
}

#[async_trait]
impl SessionHandler for StatusSessionHandler {
    async fn handle_packet(&self, packet: Packet) {
        match packet {
            Packet::StatusRequest(_) => {
                let version = self.conn.protocol();
                let advertised = if version.supported() {
                    version
                } else {
                    MAXIMUM_VERSION
                };
                let status = json!({
                    "version": {
                        "name": format!("Portcullis {}", advertised.name()),
                        "protocol": advertised.0,
                    },
                    "players": {
                        "max": self.proxy.config().max_players,
                        "online": self.proxy.player_count().await,
                        "sample": [],
                    },
                    "description": { "text": self.proxy.config().motd },
                });
                let _ = self
                    .conn
                    .write_packet(&Packet::StatusResponse(StatusResponse {
                        status: status.to_string(),
                    }))
                    .await;
            }
            Packet::StatusPing(p) => {
                let _ = self
                    .conn
                    .write_packet(&Packet::StatusPing(StatusPing { payload: p.payload }))
                    .await;
                let _ = self.conn.close().await;
            }
            other => {
                tracing::debug!(packet = other.as_ref(), "unexpected packet during status");
                let _ = self.conn.close().await;
            }
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
