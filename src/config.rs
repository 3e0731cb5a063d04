//! Server configuration: CLI/env-sourced settings plus the node-info
//! response from the subscription API, and the validation/defaulting logic
//! grounded on `internal/app/config.go`'s `Check()`/`Fill()`.

use crate::error::ConfigError;
use serde::Deserialize;
use std::net::SocketAddr;

/// Mbps -> bps, matching the source's `mbpsToBps` constant.
pub const MBPS_TO_BPS: u64 = 125_000;
/// Below this, a configured speed is rejected rather than treated as "unlimited".
pub const MIN_SPEED_BPS: u64 = 16_384;

pub const DEFAULT_STREAM_RECEIVE_WINDOW: u64 = 15_728_640;
pub const DEFAULT_CONNECTION_RECEIVE_WINDOW: u64 = 67_108_864;
pub const DEFAULT_MAX_INCOMING_STREAMS: u64 = 1024;
pub const DEFAULT_ALPN: &str = "h3";
pub const SERVER_MAX_IDLE_TIMEOUT_SECS: u64 = 60;

/// Packet-conn transport selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Wechat,
    Faketcp,
}

impl std::str::FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp" | "" => Ok(Protocol::Udp),
            "wechat" | "wechat-video" => Ok(Protocol::Wechat),
            "faketcp" => Ok(Protocol::Faketcp),
            other => Err(ConfigError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Fully resolved server configuration, after `Fill()`/`Check()` have run.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub protocol: Protocol,
    pub cert_file: String,
    pub key_file: String,
    pub up_mbps: u64,
    pub down_mbps: u64,
    pub disable_udp: bool,
    pub obfs: Option<String>,
    pub alpn: String,
    pub receive_window_conn: u64,
    pub receive_window_client: u64,
    pub max_conn_client: i64,
    pub disable_mtu_discovery: bool,
}

impl ServerConfig {
    /// Mirrors the source's `Fill()`: applies defaults for anything left at
    /// its zero value.
    pub fn fill(&mut self) {
        if self.alpn.is_empty() {
            self.alpn = DEFAULT_ALPN.to_string();
        }
        if self.receive_window_conn == 0 {
            self.receive_window_conn = DEFAULT_STREAM_RECEIVE_WINDOW;
        }
        if self.receive_window_client == 0 {
            self.receive_window_client = DEFAULT_CONNECTION_RECEIVE_WINDOW;
        }
        if self.max_conn_client == 0 {
            self.max_conn_client = DEFAULT_MAX_INCOMING_STREAMS as i64;
        }
    }

    /// Mirrors the source's `Check()`: rejects configurations that would
    /// otherwise fail obscurely later (during TLS setup, during the first
    /// handshake, or never, silently misbehaving).
    pub fn check(&self) -> Result<(), ConfigError> {
        if (self.up_mbps != 0 && self.up_mbps * MBPS_TO_BPS < MIN_SPEED_BPS)
            || (self.down_mbps != 0 && self.down_mbps * MBPS_TO_BPS < MIN_SPEED_BPS)
        {
            return Err(ConfigError::InvalidSpeed);
        }
        if self.receive_window_conn != 0 && self.receive_window_conn < 65_536 {
            return Err(ConfigError::InvalidReceiveWindow);
        }
        if self.receive_window_client != 0 && self.receive_window_client < 65_536 {
            return Err(ConfigError::InvalidReceiveWindow);
        }
        if self.max_conn_client < 0 {
            return Err(ConfigError::InvalidMaxConnClient(self.max_conn_client));
        }
        Ok(())
    }

    pub fn up_bps(&self) -> u64 {
        self.up_mbps * MBPS_TO_BPS
    }

    pub fn down_bps(&self) -> u64 {
        self.down_mbps * MBPS_TO_BPS
    }
}

/// The response from `GET /config`. The client/server speed fields are
/// swapped relative to the locally configured `up_mbps`/`down_mbps` --
/// see `apply_node_info` below and spec §4+.L.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
    pub server_port: u16,
    pub up_mbps: u64,
    pub down_mbps: u64,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub disable_udp: bool,
    #[serde(default)]
    pub obfs: Option<String>,
    #[serde(default)]
    pub disable_mtu_discovery: bool,
}

impl ServerConfig {
    /// Builds a fresh, filled, checked `ServerConfig` from a `GET /config`
    /// response: `cert_file`/`key_file` come from local CLI flags, everything
    /// else from the API. Up/down are swapped -- `NodeInfo` describes the
    /// *client's* configured rate, so the server's send rate is the client's
    /// receive rate and vice versa.
    pub fn from_node_info(
        info: &NodeInfo,
        cert_file: String,
        key_file: String,
    ) -> Result<Self, ConfigError> {
        let protocol = info.protocol.parse()?;
        let mut cfg = ServerConfig {
            listen: format!("0.0.0.0:{}", info.server_port)
                .parse()
                .map_err(|_| ConfigError::MissingListen)?,
            protocol,
            cert_file,
            key_file,
            up_mbps: info.down_mbps,
            down_mbps: info.up_mbps,
            disable_udp: info.disable_udp,
            obfs: info.obfs.clone(),
            alpn: String::new(),
            receive_window_conn: 0,
            receive_window_client: 0,
            max_conn_client: 0,
            disable_mtu_discovery: info.disable_mtu_discovery,
        };
        cfg.fill();
        cfg.check()?;
        Ok(cfg)
    }
}

/// Parses a `log_mode` string, rejecting anything but the three supported
/// levels -- matches the source's fatal-on-startup validation in `Before`.
pub fn validate_log_mode(mode: &str) -> Result<&'static str, ConfigError> {
    match mode {
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "error" => Ok("error"),
        other => Err(ConfigError::InvalidLogMode(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ServerConfig {
        ServerConfig {
            listen: "0.0.0.0:443".parse().unwrap(),
            protocol: Protocol::Udp,
            cert_file: "cert.pem".into(),
            key_file: "key.pem".into(),
            up_mbps: 0,
            down_mbps: 0,
            disable_udp: false,
            obfs: None,
            alpn: String::new(),
            receive_window_conn: 0,
            receive_window_client: 0,
            max_conn_client: 0,
            disable_mtu_discovery: false,
        }
    }

    #[test]
    fn fill_applies_defaults() {
        let mut cfg = base_config();
        cfg.fill();
        assert_eq!(cfg.alpn, DEFAULT_ALPN);
        assert_eq!(cfg.receive_window_conn, DEFAULT_STREAM_RECEIVE_WINDOW);
        assert_eq!(cfg.receive_window_client, DEFAULT_CONNECTION_RECEIVE_WINDOW);
        assert_eq!(cfg.max_conn_client, DEFAULT_MAX_INCOMING_STREAMS as i64);
    }

    #[test]
    fn zero_speed_is_unlimited_and_allowed() {
        let cfg = base_config();
        assert!(cfg.check().is_ok());
    }

    #[test]
    fn any_nonzero_whole_mbps_clears_min_speed() {
        // Integer Mbps granularity means 1 Mbps (125_000 bps) already exceeds
        // MIN_SPEED_BPS (16_384); the source has the same property (`up_mbps`
        // is a whole-Mbps int there too), so no positive whole-Mbps value can
        // ever trip this check. Documented here rather than asserted against,
        // since a test expecting rejection at up_mbps=1 would simply be wrong.
        let mut cfg = base_config();
        cfg.up_mbps = 1;
        assert!(cfg.check().is_ok());
    }

    #[test]
    fn node_info_swaps_up_and_down() {
        let info = NodeInfo {
            server_port: 443,
            up_mbps: 100,
            down_mbps: 200,
            protocol: String::new(),
            disable_udp: true,
            obfs: Some("salt".into()),
            disable_mtu_discovery: false,
        };
        let cfg = ServerConfig::from_node_info(&info, "cert.pem".into(), "key.pem".into()).unwrap();
        assert_eq!(cfg.up_mbps, 200);
        assert_eq!(cfg.down_mbps, 100);
        assert!(cfg.disable_udp);
    }

    #[test]
    fn log_mode_rejects_unknown_values() {
        assert!(validate_log_mode("debug").is_ok());
        assert!(validate_log_mode("warn").is_err());
    }
}
