//! TLS certificate/key loading: reads `cert_file`/`key_file` once at startup
//! and builds the quinn server TLS config from them.
//!
//! Grounded on `internal/pkg/cert.Config.Get`, which loads the pair once and
//! hands back a `tls.Certificate` getter; hot-reload is explicitly out of
//! scope there too.

use crate::config::ServerConfig as HysteriaServerConfig;
use crate::error::ConfigError;
use quinn::crypto::rustls::QuicServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Once;

static INSTALL_CRYPTO_PROVIDER: Once = Once::new();

fn ensure_crypto_provider() {
    INSTALL_CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = File::open(path).map_err(|e| ConfigError::Tls(format!("{}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Tls(format!("invalid certificate in {}: {e}", path.display())))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let file = File::open(path).map_err(|e| ConfigError::Tls(format!("{}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ConfigError::Tls(format!("invalid private key in {}: {e}", path.display())))?
        .ok_or_else(|| ConfigError::Tls(format!("no private key found in {}", path.display())))
}

/// Loads `cert_file`/`key_file` and builds the per-endpoint quinn transport
/// settings (ALPN, window sizes, idle timeout, max concurrent streams,
/// datagram support). The congestion controller factory is deliberately
/// left unset here -- each accepted connection gets its own `BrutalConfig`
/// installed by the acceptor (see `server.rs`), so that negotiating a rate
/// for one client never perturbs another client's pacing.
pub fn load_tls_config(cert_file: &Path, key_file: &Path) -> Result<rustls::ServerConfig, ConfigError> {
    ensure_crypto_provider();
    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::Tls(e.to_string()))?;
    tls_config.alpn_protocols = vec![crate::config::DEFAULT_ALPN.as_bytes().to_vec()];
    tls_config.max_early_data_size = u32::MAX;
    Ok(tls_config)
}

/// Builds the base `quinn::TransportConfig` shared by every connection on
/// this endpoint, from the validated/filled `ServerConfig`.
pub fn build_transport_config(cfg: &HysteriaServerConfig) -> quinn::TransportConfig {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        std::time::Duration::from_secs(crate::config::SERVER_MAX_IDLE_TIMEOUT_SECS)
            .try_into()
            .expect("60s fits in a VarInt"),
    ));
    transport.stream_receive_window(
        (cfg.receive_window_conn as u32).into(),
    );
    transport.receive_window((cfg.receive_window_client as u32).into());
    transport.max_concurrent_bidi_streams((cfg.max_conn_client as u32).into());
    transport.datagram_receive_buffer_size(Some(2 * 1024 * 1024));
    transport.datagram_send_buffer_size(2 * 1024 * 1024);
    if cfg.disable_mtu_discovery {
        transport.mtu_discovery_config(None);
    }
    transport
}

/// Builds a fresh per-connection `quinn::ServerConfig` with `brutal`
/// installed as the congestion controller factory. A new one is produced
/// for every accepted connection (see `server::run`) so that `BrutalConfig`
/// is never shared across clients.
pub fn build_connection_config(
    crypto: std::sync::Arc<QuicServerConfig>,
    base_transport: &quinn::TransportConfig,
    brutal: std::sync::Arc<crate::congestion::BrutalConfig>,
) -> quinn::ServerConfig {
    let mut transport = base_transport.clone();
    transport.congestion_controller_factory(brutal);
    let mut server_config = quinn::ServerConfig::with_crypto(crypto);
    server_config.transport_config(std::sync::Arc::new(transport));
    server_config
}
