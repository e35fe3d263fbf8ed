//! A minimal offline-mode login session handler.
//!
//! Mojang session authentication is not performed here; the proxy derives
//! the offline profile for the username, finishes the login exchange, and
//! hands the connection to the play session handler.

use crate::{
    component::Component,
    connection::{Connection, SessionHandler},
    player::{ConnectedPlayer, GameProfile},
    protocol::{
        packet::{LoginStart, LoginSuccess, Packet, SetCompression},
        version::MINECRAFT_1_8,
        State,
    },
    proxy::Proxy,
    server_conn::{JoinResult, ServerConnection},
    session_client_play::ClientPlaySessionHandler,
};
use async_trait::async_trait;
use std::{any::Any, sync::Arc};

pub struct LoginSessionHandler {
    conn: Arc<Connection>,
    proxy: Arc<Proxy>,
    virtual_host: String,
}

impl LoginSessionHandler {
    pub fn new(conn: Arc<Connection>, proxy: Arc<Proxy>, virtual_host: String) -> Self {
        Self {
            conn,
            proxy,
            virtual_host,
        }
    }

    async fn handle_login_start(&self, packet: LoginStart) {
        let profile = GameProfile::offline(&packet.username);

        let threshold = self.proxy.config().compression.threshold;
        if threshold >= 0 && self.conn.protocol() >= MINECRAFT_1_8 {
            if self
                .conn
                .write_packet(&Packet::SetCompression(SetCompression { threshold }))
                .await
                .is_err()
            {
                return;
            }
            self.conn.set_compression_threshold(threshold).await;
        }

        if self
            .conn
            .write_packet(&Packet::LoginSuccess(LoginSuccess {
                uuid: profile.id,
                username: profile.name.clone(),
            }))
            .await
            .is_err()
        {
            return;
        }
        self.conn.set_state(State::Play);

        let player = ConnectedPlayer::new(
            Arc::clone(&self.conn),
            Arc::clone(&self.proxy),
            profile,
            Some(self.virtual_host.clone()),
            false,
        );
        self.proxy.register_connection(&player).await;
        tracing::info!(
            player = %player,
            remote = %self.conn.remote_addr(),
            protocol = %self.conn.protocol(),
            "player logged in"
        );

        self.conn
            .set_session_handler(ClientPlaySessionHandler::new(Arc::clone(&player)))
            .await;

        let Some(initial) = player.next_server_to_try(None) else {
            player
                .disconnect(&Component::text("No available servers to connect you to."))
                .await;
            return;
        };

        // The connect attempt must not block this connection's read loop.
        tokio::spawn(async move {
            match ServerConnection::connect(&player, initial.clone()).await {
                Ok(JoinResult::Success) => {}
                Ok(JoinResult::Disconnected(reason)) => {
                    tracing::warn!(player = %player, server = %initial.name, reason = %reason, "initial server rejected player");
                    player
                        .handle_backend_crash(
                            &initial,
                            Component::text("Unable to connect you to a server."),
                        )
                        .await;
                }
                Err(err) => {
                    tracing::warn!(player = %player, server = %initial.name, error = %err, "failed to reach initial server");
                    player
                        .handle_backend_crash(
                            &initial,
                            Component::text("Unable to connect you to a server."),
                        )
                        .await;
                }
            }
        });
    }
}

#[async_trait]
impl SessionHandler for LoginSessionHandler {
    async fn handle_packet(&self, packet: Packet) {
        match packet {
            Packet::LoginStart(p) => self.handle_login_start(p).await,
            other => {
                tracing::debug!(packet = other.as_ref(), "unexpected packet during login");
                let _ = self.conn.close().await;
            }
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
