use thiserror::Error;

/// Errors that abort startup before the server ever binds a socket.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing listen address")]
    MissingListen,
    #[error("invalid speed: up/down must be 0 or >= {min} bps", min = crate::config::MIN_SPEED_BPS)]
    InvalidSpeed,
    #[error("invalid receive window size: must be 0 or >= 65536 bytes")]
    InvalidReceiveWindow,
    #[error("invalid max connections per client: {0}")]
    InvalidMaxConnClient(i64),
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("log mode {0} not supported")]
    InvalidLogMode(String),
    #[error("failed to load certificate/key: {0}")]
    Tls(String),
}

/// Errors talking to the subscription service.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Errors decoding/encoding the Hysteria wire protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected end of frame")]
    Truncated,
    #[error("unsupported protocol version {0}, expecting {1:#x}")]
    BadVersion(u8, u8),
    #[error("field exceeds maximum length")]
    FieldTooLong,
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("handshake did not complete within the protocol timeout")]
    HandshakeTimeout,
    #[error("client rate is zero")]
    ZeroRate,
    #[error("negotiated rate {0} bps is below the minimum effective speed")]
    RateBelowMinimum(u64),
    #[error("authentication failed")]
    AuthFailed,
}

/// Errors standing up a packet-conn adapter.
#[derive(Debug, Error)]
pub enum PacketConnError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("packet too short to contain an obfuscation salt")]
    PacketTooShort,
    #[error("packet does not match the expected framing prefix")]
    BadFraming,
    #[error("fake-tcp transport is not supported on this platform")]
    UnsupportedPlatform,
}
