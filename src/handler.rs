//! Per-connection protocol state machine: control-stream handshake, TCP/UDP
//! request streams, and UDP datagram relaying.
//!
//! Grounded on `internal/pkg/core/server.go`'s `handleClient`/
//! `handleControlStream` and `server_client.go`'s `serverClient.Run`/
//! `handleStream`/`handleMessage`/`handleTCP`/`handleUDP`.

use crate::congestion::BrutalConfig;
use crate::defrag::Defragger;
use crate::protocol::{self, ClientHello, ClientRequest, RatePair, ServerHello, ServerResponse, UdpMessage};
use crate::registry::{TrafficItem, TrafficTable, UserTable};
use crate::util::{pipe2way, IpMasker};
use bytes::Bytes;
use dashmap::DashMap;
use quinn::Connection;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::UdpSocket;

/// Shared, read-mostly configuration every connection handler needs.
pub struct ConnectionContext {
    pub users: Arc<UserTable>,
    pub traffic: Arc<TrafficTable>,
    pub protocol_timeout: Duration,
    pub configured_send_bps: u64,
    pub configured_recv_bps: u64,
    pub masker: IpMasker,
    pub disable_udp: bool,
}

const QERROR_AUTH: u32 = 0x1000_0001;
const MAX_DATAGRAM_PAYLOAD: usize = 1200;

/// Drives one accepted QUIC connection end to end: handshake, then stream
/// and datagram fan-out until the peer disconnects.
pub async fn handle_connection(conn: Connection, ctx: Arc<ConnectionContext>, brutal: Arc<BrutalConfig>) {
    let remote = conn.remote_address();
    let masked = ctx.masker.mask(&remote);

    let handshake = tokio::time::timeout(ctx.protocol_timeout, run_handshake(&conn, &ctx, &brutal)).await;
    let user_id = match handshake {
        Ok(Ok(user_id)) => user_id,
        Ok(Err(e)) => {
            log::info!("{masked}: handshake failed: {e}");
            conn.close(QERROR_AUTH.into(), b"auth failed");
            return;
        }
        Err(_) => {
            log::info!("{masked}: handshake timed out");
            conn.close(QERROR_AUTH.into(), b"handshake timeout");
            return;
        }
    };

    log::info!("{masked}: connected as user {user_id}");
    let traffic_item = ctx.traffic.get_or_create(user_id);

    let sessions: Arc<DashMap<u32, Arc<UdpSocket>>> = Arc::new(DashMap::new());
    let next_session_id = Arc::new(AtomicU32::new(1));

    if !ctx.disable_udp {
        tokio::spawn(datagram_loop(conn.clone(), sessions.clone(), traffic_item.clone()));
    }

    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                traffic_item.count.add(1);
                let traffic_item = traffic_item.clone();
                let sessions = sessions.clone();
                let next_session_id = next_session_id.clone();
                let conn = conn.clone();
                let disable_udp = ctx.disable_udp;
                tokio::spawn(async move {
                    if let Err(e) = handle_stream(
                        send,
                        recv,
                        &traffic_item,
                        &sessions,
                        &next_session_id,
                        &conn,
                        disable_udp,
                    )
                    .await
                    {
                        log::debug!("stream handler ended: {e}");
                    }
                });
            }
            Err(_) => {
                log::info!("{masked}: disconnected");
                break;
            }
        }
    }
}

async fn run_handshake(
    conn: &Connection,
    ctx: &ConnectionContext,
    brutal: &Arc<BrutalConfig>,
) -> Result<i64, crate::error::ProtocolError> {
    let (mut send, mut recv) = conn
        .accept_bi()
        .await
        .map_err(|_| crate::error::ProtocolError::Truncated)?;

    // Read the version byte and hello body incrementally, not via
    // read_to_end: the control stream stays open past the handshake (the
    // client never finishes its send side), so a read that waits for EOF
    // would hang until protocol_timeout fires.
    let version = recv
        .read_u8()
        .await
        .map_err(|_| crate::error::ProtocolError::Truncated)?;
    if version != protocol::PROTOCOL_VERSION {
        return Err(crate::error::ProtocolError::BadVersion(version, protocol::PROTOCOL_VERSION));
    }
    let hello = ClientHello::read_from(&mut recv).await?;
    if hello.rate.send_bps == 0 || hello.rate.recv_bps == 0 {
        return Err(crate::error::ProtocolError::ZeroRate);
    }

    // Inverted relative to the client: the server's send rate is capped by
    // what the client said it can *receive*, and vice versa. A configured
    // limit of 0 means "unlimited" -- the client's advertised value passes
    // through uncapped, matching the source's `if s.sendBPS > 0 { clamp }`.
    let mut server_send_bps = hello.rate.recv_bps;
    if ctx.configured_send_bps > 0 && server_send_bps > ctx.configured_send_bps {
        server_send_bps = ctx.configured_send_bps;
    }
    let mut server_recv_bps = hello.rate.send_bps;
    if ctx.configured_recv_bps > 0 && server_recv_bps > ctx.configured_recv_bps {
        server_recv_bps = ctx.configured_recv_bps;
    }

    if server_send_bps < crate::config::MIN_SPEED_BPS || server_recv_bps < crate::config::MIN_SPEED_BPS {
        return Err(crate::error::ProtocolError::RateBelowMinimum(server_send_bps.min(server_recv_bps)));
    }

    let (user_id, authed) = ctx.users.auth(&hello.auth);
    if !authed {
        let response = ServerHello {
            ok: false,
            rate: RatePair { send_bps: 0, recv_bps: 0 },
            message: "auth failed".to_string(),
        };
        let mut out = vec![protocol::PROTOCOL_VERSION];
        out.extend(response.encode());
        let _ = send.write_all(&out).await;
        let _ = send.finish();
        return Err(crate::error::ProtocolError::AuthFailed);
    }

    brutal.set_bandwidth_bps(server_send_bps);

    let response = ServerHello {
        ok: true,
        rate: RatePair {
            send_bps: server_send_bps,
            recv_bps: server_recv_bps,
        },
        message: "Welcome".to_string(),
    };
    let mut out = vec![protocol::PROTOCOL_VERSION];
    out.extend(response.encode());
    send.write_all(&out)
        .await
        .map_err(|_| crate::error::ProtocolError::Truncated)?;
    send.finish().ok();

    Ok(user_id)
}

#[allow(clippy::too_many_arguments)]
async fn handle_stream(
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    traffic_item: &Arc<TrafficItem>,
    sessions: &Arc<DashMap<u32, Arc<UdpSocket>>>,
    next_session_id: &Arc<AtomicU32>,
    conn: &Connection,
    disable_udp: bool,
) -> std::io::Result<()> {
    // Only the request frame is decoded here; everything the client writes
    // after it on the same stream is the TCP/UDP payload and must stay on
    // the still-open `recv` for handle_tcp/handle_udp to relay.
    let request = ClientRequest::read_from(&mut recv)
        .await
        .map_err(std::io::Error::other)?;

    if request.udp {
        if disable_udp {
            let resp = ServerResponse::err("UDP disabled");
            send.write_all(&resp.encode()).await?;
            send.finish().ok();
            return Ok(());
        }
        handle_udp(send, recv, sessions, next_session_id, conn, traffic_item).await
    } else {
        handle_tcp(&mut send, &mut recv, &request.host, request.port, traffic_item).await
    }
}

async fn handle_tcp(
    send: &mut quinn::SendStream,
    recv: &mut quinn::RecvStream,
    host: &str,
    port: u16,
    traffic_item: &Arc<TrafficItem>,
) -> std::io::Result<()> {
    let mut target = match tokio::net::TcpStream::connect((host, port)).await {
        Ok(stream) => stream,
        Err(e) => {
            let resp = ServerResponse::err(e.to_string());
            send.write_all(&resp.encode()).await?;
            send.finish().ok();
            return Ok(());
        }
    };

    let resp = ServerResponse::ok(0);
    send.write_all(&resp.encode()).await?;

    let mut quic_stream = QuicDuplex { send, recv };
    let traffic_item = traffic_item.clone();
    pipe2way(&mut quic_stream, &mut target, move |delta| {
        if delta >= 0 {
            traffic_item.up.add(delta as u64);
        } else {
            traffic_item.down.add((-delta) as u64);
        }
    })
    .await
}

/// Adapts a split quinn bidirectional stream to a single `AsyncRead +
/// AsyncWrite` type for `pipe2way`.
struct QuicDuplex<'a> {
    send: &'a mut quinn::SendStream,
    recv: &'a mut quinn::RecvStream,
}

impl<'a> tokio::io::AsyncRead for QuicDuplex<'a> {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut *self.get_mut().recv).poll_read(cx, buf)
    }
}

impl<'a> tokio::io::AsyncWrite for QuicDuplex<'a> {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut *self.get_mut().send).poll_write(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut *self.get_mut().send).poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut *self.get_mut().send).poll_shutdown(cx)
    }
}

async fn handle_udp(
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    sessions: &Arc<DashMap<u32, Arc<UdpSocket>>>,
    next_session_id: &Arc<AtomicU32>,
    conn: &Connection,
    traffic_item: &Arc<TrafficItem>,
) -> std::io::Result<()> {
    let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
    let session_id = next_session_id.fetch_add(1, Ordering::SeqCst);
    sessions.insert(session_id, socket.clone());

    let resp = ServerResponse::ok(session_id);
    send.write_all(&resp.encode()).await?;

    // One reader per session, spawned exactly once at session creation, that
    // forwards every reply datagram back over the QUIC datagram channel.
    tokio::spawn(forward_replies(conn.clone(), socket, session_id, traffic_item.clone()));

    // The stream carries no further application data; it stays open only so
    // the client can signal session teardown by closing it.
    let mut scratch = [0u8; 1];
    loop {
        match recv.read(&mut scratch).await {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }
    sessions.remove(&session_id);
    Ok(())
}

/// Reads connection datagrams, reassembles fragments, and relays completed
/// UDP messages to the matching session socket.
async fn datagram_loop(conn: Connection, sessions: Arc<DashMap<u32, Arc<UdpSocket>>>, traffic_item: Arc<TrafficItem>) {
    let mut defragger = Defragger::new();
    loop {
        let datagram = match conn.read_datagram().await {
            Ok(d) => d,
            Err(_) => return,
        };
        let msg = match UdpMessage::decode(datagram) {
            Ok(m) => m,
            Err(_) => continue,
        };
        let Some(complete) = defragger.feed(msg) else {
            continue;
        };

        traffic_item.up.add(complete.data.len() as u64);

        let Some(socket) = sessions.get(&complete.session_id).map(|s| s.clone()) else {
            continue;
        };
        let target: SocketAddr = match format!("{}:{}", complete.host, complete.port).parse() {
            Ok(addr) => addr,
            Err(_) => match tokio::net::lookup_host((complete.host.as_str(), complete.port)).await {
                Ok(mut addrs) => match addrs.next() {
                    Some(a) => a,
                    None => continue,
                },
                Err(_) => continue,
            },
        };
        let _ = socket.send_to(&complete.data, target).await;
    }
}

async fn forward_replies(conn: Connection, socket: Arc<UdpSocket>, session_id: u32, traffic_item: Arc<TrafficItem>) {
    let mut buf = vec![0u8; 65535];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(_) => return,
        };
        traffic_item.down.add(n as u64);
        let msg_id: u16 = loop {
            let candidate = rand::thread_rng().gen::<u16>();
            if candidate != 0 {
                break candidate;
            }
        };
        let base = UdpMessage {
            session_id,
            host: from.ip().to_string(),
            port: from.port(),
            msg_id: 0,
            frag_count: 1,
            frag_index: 0,
            data: Bytes::copy_from_slice(&buf[..n]),
        };
        let frames = if n <= MAX_DATAGRAM_PAYLOAD {
            vec![base]
        } else {
            protocol::fragment(base, msg_id, MAX_DATAGRAM_PAYLOAD)
        };
        for frame in frames {
            if conn.send_datagram(frame.encode().freeze()).is_err() {
                return;
            }
        }
    }
}
