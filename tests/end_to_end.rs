//! End-to-end tests driving the proxy over real TCP sockets, with a
//! minimal scripted backend server and client on either side.

use anyhow::bail;
use portcullis::{
    config::{CompressionConfig, Config},
    protocol::{
        codec::{FrameDecoder, FrameEncoder},
        packet::{Handshake, JoinGame, LoginStart, LoginSuccess, Packet},
        registry,
        version::{ProtocolVersion, MINECRAFT_1_12_2},
        Decoder, Direction, Encoder, ProtoContext, State,
    },
    proxy::Proxy,
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use uuid::Uuid;

/// A raw protocol endpoint for tests: frames, encodes and decodes packets
/// for one side of a connection.
struct Wire {
    stream: TcpStream,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
    /// Direction of packets this endpoint reads.
    reads: Direction,
    version: ProtocolVersion,
}

impl Wire {
    fn new(stream: TcpStream, reads: Direction, version: ProtocolVersion) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
            encoder: FrameEncoder::new(6),
            reads,
            version,
        }
    }

    /// Reads the next packet known in `state`, skipping unknown frames.
    async fn read_packet(&mut self, state: State) -> anyhow::Result<Packet> {
        loop {
            while let Some(frame) = self.decoder.next_frame()? {
                let mut dec = Decoder::new(&frame);
                let id = dec.read_var_int()?;
                if let Some(kind) = registry::packet_kind(state, self.reads, id, self.version) {
                    let ctx = ProtoContext {
                        version: self.version,
                        direction: self.reads,
                    };
                    return Ok(Packet::decode(kind, &mut dec, &ctx)?);
                }
            }
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                bail!("connection closed");
            }
            self.decoder.give_data(&mut buf[..n]);
        }
    }

    async fn write_packet(&mut self, state: State, packet: &Packet) -> anyhow::Result<()> {
        let direction = self.reads.opposite();
        let id = registry::packet_id(state, direction, packet.kind(), self.version)
            .expect("packet registered");
        let mut payload = Vec::new();
        let mut enc = Encoder::new(&mut payload);
        enc.write_var_int(id);
        packet.encode(
            &mut enc,
            &ProtoContext {
                version: self.version,
                direction,
            },
        );
        let mut out = Vec::new();
        self.encoder.encode_frame(&payload, &mut out)?;
        self.stream.write_all(&out).await?;
        Ok(())
    }
}

/// A scripted vanilla backend: completes offline login and sends a JoinGame
/// with a recognisable dimension, then sits on the connection.
async fn run_backend(listener: TcpListener, dimension: i32) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(async move {
            let _ = serve_backend(stream, dimension).await;
        });
    }
}

async fn serve_backend(stream: TcpStream, dimension: i32) -> anyhow::Result<()> {
    let mut wire = Wire::new(stream, Direction::ServerBound, MINECRAFT_1_12_2);
    let Packet::Handshake(_) = wire.read_packet(State::Handshake).await? else {
        bail!("expected handshake");
    };
    let Packet::LoginStart(login) = wire.read_packet(State::Login).await? else {
        bail!("expected login start");
    };
    wire.write_packet(
        State::Login,
        &Packet::LoginSuccess(LoginSuccess {
            uuid: Uuid::nil(),
            username: login.username,
        }),
    )
    .await?;
    wire.write_packet(
        State::Play,
        &Packet::JoinGame(JoinGame {
            entity_id: 1,
            gamemode: 0,
            dimension,
            difficulty: 1,
            max_players: 20,
            level_type: Some("default".to_owned()),
            ..Default::default()
        }),
    )
    .await?;
    // Hold the connection open, discarding whatever arrives.
    loop {
        let mut buf = [0u8; 4096];
        if wire.stream.read(&mut buf).await? == 0 {
            return Ok(());
        }
    }
}

/// A backend that accepts and immediately hangs up, to provoke failover.
async fn run_flaky_backend(listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => drop(stream),
            Err(_) => return,
        }
    }
}

async fn start_proxy(servers: HashMap<String, String>, order: Vec<String>) -> std::net::SocketAddr {
    let config = Config {
        servers,
        attempt_connection_order: order,
        compression: CompressionConfig {
            threshold: -1,
            level: 6,
        },
        connection_timeout: 2_000,
        ..Config::default()
    };
    let proxy = Proxy::new(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(proxy.serve(listener));
    addr
}

async fn join_as_client(proxy_addr: std::net::SocketAddr) -> anyhow::Result<JoinGame> {
    let stream = TcpStream::connect(proxy_addr).await?;
    let mut wire = Wire::new(stream, Direction::ClientBound, MINECRAFT_1_12_2);
    wire.write_packet(
        State::Handshake,
        &Packet::Handshake(Handshake {
            protocol_version: MINECRAFT_1_12_2.0,
            server_address: "lobby.example".to_owned(),
            port: 25565,
            next_status: 2,
        }),
    )
    .await?;
    wire.write_packet(
        State::Login,
        &Packet::LoginStart(LoginStart {
            username: "Steve".to_owned(),
        }),
    )
    .await?;

    let Packet::LoginSuccess(_) = wire.read_packet(State::Login).await? else {
        bail!("expected login success");
    };
    let Packet::JoinGame(join) = wire.read_packet(State::Play).await? else {
        bail!("expected join game");
    };
    Ok(join)
}

#[tokio::test]
async fn client_joins_first_server_through_proxy() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    tokio::spawn(run_backend(backend, 7));

    let proxy_addr = start_proxy(
        HashMap::from([("lobby".to_owned(), backend_addr.to_string())]),
        vec!["lobby".to_owned()],
    )
    .await;

    let join = timeout(Duration::from_secs(10), join_as_client(proxy_addr))
        .await
        .expect("join timed out")
        .expect("join failed");
    assert_eq!(join.dimension, 7);
}

#[tokio::test]
async fn client_fails_over_to_next_server() {
    let flaky = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let flaky_addr = flaky.local_addr().unwrap();
    tokio::spawn(run_flaky_backend(flaky));

    let healthy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let healthy_addr = healthy.local_addr().unwrap();
    tokio::spawn(run_backend(healthy, 9));

    let proxy_addr = start_proxy(
        HashMap::from([
            ("lobby".to_owned(), flaky_addr.to_string()),
            ("hub".to_owned(), healthy_addr.to_string()),
        ]),
        vec!["lobby".to_owned(), "hub".to_owned()],
    )
    .await;

    let join = timeout(Duration::from_secs(10), join_as_client(proxy_addr))
        .await
        .expect("join timed out")
        .expect("join failed");
    assert_eq!(join.dimension, 9);
}
