//! Server acceptor: binds the packet-conn transport, stands up the QUIC
//! listener, and spawns a handler task per accepted connection.
//!
//! Grounded on `internal/pkg/core/server.go`'s `NewServer`/`Serve`, which
//! binds a `net.PacketConn` (via the pktconn factory map), wraps it in a
//! `quic.Listener`, and loops `listener.Accept()` with unbounded
//! per-connection concurrency.

use crate::config::ServerConfig as HysteriaServerConfig;
use crate::congestion::BrutalConfig;
use crate::handler::{self, ConnectionContext};
use crate::registry::{TrafficTable, UserTable};
use crate::util::IpMasker;
use quinn::crypto::rustls::QuicServerConfig;
use std::sync::Arc;
use std::time::Duration;

pub const PROTOCOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the acceptor needs to stand up the endpoint and hand each
/// connection its shared state.
pub struct Server {
    endpoint: quinn::Endpoint,
    ctx: Arc<ConnectionContext>,
    base_transport: quinn::TransportConfig,
    crypto: Arc<QuicServerConfig>,
}

impl Server {
    /// Binds the configured packet-conn transport and builds a quinn
    /// endpoint over it. The per-connection `ServerConfig` (and thus the
    /// per-connection `BrutalConfig`) is built lazily in `serve`, one per
    /// accepted connection.
    pub fn bind(
        cfg: &HysteriaServerConfig,
        tls_config: rustls::ServerConfig,
        users: Arc<UserTable>,
        traffic: Arc<TrafficTable>,
    ) -> std::io::Result<Self> {
        let socket = crate::pktconn::build_socket(cfg.protocol, cfg.obfs.as_deref(), cfg.listen)
            .map_err(std::io::Error::other)?;

        let crypto: Arc<QuicServerConfig> = Arc::new(
            QuicServerConfig::try_from(tls_config).map_err(std::io::Error::other)?,
        );
        let base_transport = crate::keypair::build_transport_config(cfg);

        // A throwaway ServerConfig purely so `Endpoint::new_with_abstract_socket`
        // has something to start with; every accepted connection is handed a
        // fresh per-connection config (with its own `BrutalConfig`) before the
        // handshake is allowed to proceed -- see `serve` below.
        let placeholder_brutal = BrutalConfig::new(cfg.up_bps());
        let initial_config = crate::keypair::build_connection_config(
            crypto.clone(),
            &base_transport,
            placeholder_brutal,
        );

        let runtime = quinn::default_runtime()
            .expect("a tokio runtime must be active when binding the quic endpoint");
        let endpoint = quinn::Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            Some(initial_config),
            socket,
            runtime,
        )?;

        let ctx = Arc::new(ConnectionContext {
            users,
            traffic,
            protocol_timeout: PROTOCOL_TIMEOUT,
            configured_send_bps: cfg.up_bps(),
            configured_recv_bps: cfg.down_bps(),
            masker: IpMasker::new(),
            disable_udp: cfg.disable_udp,
        });

        Ok(Server {
            endpoint,
            ctx,
            base_transport,
            crypto,
        })
    }

    /// Accepts connections until the endpoint is closed, spawning one task
    /// per connection with unbounded fan-out. Returns once `accept()` yields
    /// `None`, i.e. after `shutdown()`/`close()`.
    pub async fn serve(&self) {
        while let Some(incoming) = self.endpoint.accept().await {
            let mut incoming = incoming;
            let brutal = BrutalConfig::new(self.ctx.configured_send_bps);
            let per_conn_config = crate::keypair::build_connection_config(
                self.crypto.clone(),
                &self.base_transport,
                brutal.clone(),
            );
            incoming.set_config(per_conn_config);

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => handler::handle_connection(conn, ctx, brutal).await,
                    Err(e) => log::debug!("connection setup failed: {e}"),
                }
            });
        }
    }

    /// Closes the QUIC listener; in-flight connections are not drained, only
    /// told to go away. The underlying packet-conn closes when its last
    /// reference (held by the endpoint) drops.
    pub fn shutdown(&self) {
        self.endpoint.close(0u32.into(), b"server shutting down");
    }
}
