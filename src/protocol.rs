//! Binary framing for the Hysteria control stream, request streams, and
//! UDP-over-QUIC datagrams. All integers are big-endian; all variable-length
//! fields are length-prefixed. See spec §4.E for the exact layout.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// First byte sent on the control stream, before the client hello body.
pub const PROTOCOL_VERSION: u8 = 0x03;

const MAX_HOST_LEN: usize = 255;
const MAX_DATA_LEN: usize = 65535;

fn get_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    if buf.remaining() < 1 {
        return Err(ProtocolError::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::Truncated);
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated);
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, ProtocolError> {
    if buf.remaining() < 8 {
        return Err(ProtocolError::Truncated);
    }
    Ok(buf.get_u64())
}

fn get_string(buf: &mut Bytes, len: usize, max: usize) -> Result<String, ProtocolError> {
    if len > max {
        return Err(ProtocolError::FieldTooLong);
    }
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated);
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

fn get_bytes(buf: &mut Bytes, len: usize, max: usize) -> Result<Bytes, ProtocolError> {
    if len > max {
        return Err(ProtocolError::FieldTooLong);
    }
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated);
    }
    Ok(buf.split_to(len))
}

fn put_string(out: &mut BytesMut, s: &str) {
    out.put_u16(s.len() as u16);
    out.put_slice(s.as_bytes());
}

fn put_bytes(out: &mut BytesMut, b: &[u8]) {
    out.put_u16(b.len() as u16);
    out.put_slice(b);
}

/// Client-advertised send/receive rates, in bytes/sec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePair {
    pub send_bps: u64,
    pub recv_bps: u64,
}

#[derive(Debug, Clone)]
pub struct ClientHello {
    pub rate: RatePair,
    pub auth: String,
}

impl ClientHello {
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(8 + 8 + 2 + self.auth.len());
        out.put_u64(self.rate.send_bps);
        out.put_u64(self.rate.recv_bps);
        put_string(&mut out, &self.auth);
        out
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        let send_bps = get_u64(&mut buf)?;
        let recv_bps = get_u64(&mut buf)?;
        let auth_len = get_u16(&mut buf)? as usize;
        // the auth field carries a UUID string; bound it the same as a host
        // field so a hostile peer can't force an unbounded allocation.
        let auth = get_string(&mut buf, auth_len, MAX_DATA_LEN)?;
        Ok(ClientHello {
            rate: RatePair { send_bps, recv_bps },
            auth,
        })
    }

    /// Reads exactly this frame's bytes off a live stream, one field at a
    /// time, instead of waiting for the peer to finish its send side.
    /// Leaves the stream open for whatever follows (request streams stay
    /// live for the relay; the control stream stays live for the rest of
    /// the session).
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, ProtocolError> {
        let send_bps = r.read_u64().await.map_err(|_| ProtocolError::Truncated)?;
        let recv_bps = r.read_u64().await.map_err(|_| ProtocolError::Truncated)?;
        let auth_len = r.read_u16().await.map_err(|_| ProtocolError::Truncated)? as usize;
        if auth_len > MAX_DATA_LEN {
            return Err(ProtocolError::FieldTooLong);
        }
        let mut auth_buf = vec![0u8; auth_len];
        r.read_exact(&mut auth_buf)
            .await
            .map_err(|_| ProtocolError::Truncated)?;
        let auth = String::from_utf8(auth_buf).map_err(|_| ProtocolError::InvalidUtf8)?;
        Ok(ClientHello {
            rate: RatePair { send_bps, recv_bps },
            auth,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServerHello {
    pub ok: bool,
    pub rate: RatePair,
    pub message: String,
}

impl ServerHello {
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(1 + 16 + 2 + self.message.len());
        out.put_u8(self.ok as u8);
        out.put_u64(self.rate.send_bps);
        out.put_u64(self.rate.recv_bps);
        put_string(&mut out, &self.message);
        out
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        let ok = get_u8(&mut buf)? != 0;
        let send_bps = get_u64(&mut buf)?;
        let recv_bps = get_u64(&mut buf)?;
        let msg_len = get_u16(&mut buf)? as usize;
        let message = get_string(&mut buf, msg_len, MAX_DATA_LEN)?;
        Ok(ServerHello {
            ok,
            rate: RatePair { send_bps, recv_bps },
            message,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub udp: bool,
    pub host: String,
    pub port: u16,
}

impl ClientRequest {
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(1 + 2 + self.host.len() + 2);
        out.put_u8(self.udp as u8);
        put_string(&mut out, &self.host);
        out.put_u16(self.port);
        out
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        let udp = get_u8(&mut buf)? != 0;
        let host_len = get_u16(&mut buf)? as usize;
        if host_len == 0 {
            return Err(ProtocolError::Truncated);
        }
        let host = get_string(&mut buf, host_len, MAX_HOST_LEN)?;
        let port = get_u16(&mut buf)?;
        Ok(ClientRequest { udp, host, port })
    }

    /// Reads exactly this frame's bytes off a live stream and leaves the
    /// rest (the TCP/UDP payload that follows on the same stream) untouched
    /// for the caller to relay.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, ProtocolError> {
        let udp = r.read_u8().await.map_err(|_| ProtocolError::Truncated)? != 0;
        let host_len = r.read_u16().await.map_err(|_| ProtocolError::Truncated)? as usize;
        if host_len == 0 {
            return Err(ProtocolError::Truncated);
        }
        if host_len > MAX_HOST_LEN {
            return Err(ProtocolError::FieldTooLong);
        }
        let mut host_buf = vec![0u8; host_len];
        r.read_exact(&mut host_buf)
            .await
            .map_err(|_| ProtocolError::Truncated)?;
        let host = String::from_utf8(host_buf).map_err(|_| ProtocolError::InvalidUtf8)?;
        let port = r.read_u16().await.map_err(|_| ProtocolError::Truncated)?;
        Ok(ClientRequest { udp, host, port })
    }
}

#[derive(Debug, Clone)]
pub struct ServerResponse {
    pub ok: bool,
    pub udp_session_id: u32,
    pub message: String,
}

impl ServerResponse {
    pub fn ok(udp_session_id: u32) -> Self {
        ServerResponse {
            ok: true,
            udp_session_id,
            message: String::new(),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        ServerResponse {
            ok: false,
            udp_session_id: 0,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(1 + 4 + 2 + self.message.len());
        out.put_u8(self.ok as u8);
        out.put_u32(self.udp_session_id);
        put_string(&mut out, &self.message);
        out
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        let ok = get_u8(&mut buf)? != 0;
        let udp_session_id = get_u32(&mut buf)?;
        let msg_len = get_u16(&mut buf)? as usize;
        let message = get_string(&mut buf, msg_len, MAX_DATA_LEN)?;
        Ok(ServerResponse {
            ok,
            udp_session_id,
            message,
        })
    }
}

/// A UDP-over-QUIC datagram, possibly one fragment of a larger payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpMessage {
    pub session_id: u32,
    pub host: String,
    pub port: u16,
    pub msg_id: u16,
    pub frag_count: u8,
    pub frag_index: u8,
    pub data: Bytes,
}

impl UdpMessage {
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(4 + 2 + self.host.len() + 2 + 2 + 1 + 1 + 2 + self.data.len());
        out.put_u32(self.session_id);
        put_string(&mut out, &self.host);
        out.put_u16(self.port);
        out.put_u16(self.msg_id);
        out.put_u8(self.frag_count);
        out.put_u8(self.frag_index);
        put_bytes(&mut out, &self.data);
        out
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        let session_id = get_u32(&mut buf)?;
        let host_len = get_u16(&mut buf)? as usize;
        let host = get_string(&mut buf, host_len, MAX_HOST_LEN)?;
        let port = get_u16(&mut buf)?;
        let msg_id = get_u16(&mut buf)?;
        let frag_count = get_u8(&mut buf)?;
        let frag_index = get_u8(&mut buf)?;
        let data_len = get_u16(&mut buf)? as usize;
        let data = get_bytes(&mut buf, data_len, MAX_DATA_LEN)?;
        Ok(UdpMessage {
            session_id,
            host,
            port,
            msg_id,
            frag_count,
            frag_index,
            data,
        })
    }
}

/// Splits `msg` (with `frag_count == 1`) into fragments of at most
/// `max_payload` encoded bytes each, assigning a nonzero `msg_id`. Only
/// fragment 0 carries the host/port, matching the source's `fragUDPMessage`.
pub fn fragment(mut msg: UdpMessage, msg_id: u16, max_payload: usize) -> Vec<UdpMessage> {
    debug_assert_ne!(msg_id, 0);
    // Budget for the fixed fields plus the variable-length host on fragment 0;
    // conservative so every fragment's encoded size stays under max_payload.
    let overhead = 4 + 2 + msg.host.len() + 2 + 2 + 1 + 1 + 2;
    let chunk = max_payload.saturating_sub(overhead).max(1);
    let data = std::mem::replace(&mut msg.data, Bytes::new());
    let frag_count = data.len().div_ceil(chunk).max(1) as u8;
    let mut out = Vec::with_capacity(frag_count as usize);
    for (i, piece) in data.chunks(chunk).enumerate() {
        out.push(UdpMessage {
            session_id: msg.session_id,
            host: if i == 0 { msg.host.clone() } else { String::new() },
            port: msg.port,
            msg_id,
            frag_count,
            frag_index: i as u8,
            data: Bytes::copy_from_slice(piece),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_hello_roundtrip() {
        let ch = ClientHello {
            rate: RatePair {
                send_bps: 50_000_000,
                recv_bps: 50_000_000,
            },
            auth: "11111111-1111-1111-1111-111111111111".into(),
        };
        let encoded = ch.encode().freeze();
        let decoded = ClientHello::decode(encoded).unwrap();
        assert_eq!(decoded.rate, ch.rate);
        assert_eq!(decoded.auth, ch.auth);
    }

    #[test]
    fn server_hello_roundtrip() {
        let sh = ServerHello {
            ok: true,
            rate: RatePair {
                send_bps: 10_000_000,
                recv_bps: 10_000_000,
            },
            message: "Welcome".into(),
        };
        let decoded = ServerHello::decode(sh.encode().freeze()).unwrap();
        assert!(decoded.ok);
        assert_eq!(decoded.message, "Welcome");
    }

    #[test]
    fn client_request_roundtrip() {
        let req = ClientRequest {
            udp: false,
            host: "example.test".into(),
            port: 80,
        };
        let decoded = ClientRequest::decode(req.encode().freeze()).unwrap();
        assert_eq!(decoded.host, req.host);
        assert_eq!(decoded.port, 80);
        assert!(!decoded.udp);
    }

    #[test]
    fn client_request_zero_host_len_is_decode_error() {
        let mut out = BytesMut::new();
        out.put_u8(0);
        out.put_u16(0);
        out.put_u16(80);
        assert!(ClientRequest::decode(out.freeze()).is_err());
    }

    #[test]
    fn udp_message_roundtrip() {
        let msg = UdpMessage {
            session_id: 7,
            host: "127.0.0.1".into(),
            port: 53,
            msg_id: 0,
            frag_count: 1,
            frag_index: 0,
            data: Bytes::from_static(b"\x00\x01"),
        };
        let decoded = UdpMessage::decode(msg.encode().freeze()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn fragmentation_reassembles_in_order() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        let msg = UdpMessage {
            session_id: 1,
            host: "10.0.0.1".into(),
            port: 443,
            msg_id: 0,
            frag_count: 1,
            frag_index: 0,
            data: Bytes::from(data.clone()),
        };
        let frags = fragment(msg, 42, 1200);
        assert!(frags.len() > 1);
        let mut reassembled = Vec::new();
        for f in &frags {
            reassembled.extend_from_slice(&f.data);
        }
        assert_eq!(reassembled, data);
        assert_eq!(frags[0].host, "10.0.0.1");
        assert!(frags[1..].iter().all(|f| f.host.is_empty()));
    }

    #[test]
    fn oversized_host_len_is_decode_error() {
        let mut out = BytesMut::new();
        out.put_u32(0);
        out.put_u16(300); // > MAX_HOST_LEN
        out.extend_from_slice(&[0u8; 300]);
        out.put_u16(53);
        out.put_u16(0);
        out.put_u8(1);
        out.put_u8(0);
        out.put_u16(0);
        assert!(matches!(
            UdpMessage::decode(out.freeze()),
            Err(ProtocolError::FieldTooLong)
        ));
    }
}
