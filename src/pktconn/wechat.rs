//! WeChat-video framing: wraps payloads to resemble WeChat's UDP video-call
//! protocol, optionally layering the XOR obfuscator underneath.
//!
//! Grounded on `pktconns.NewServerWeChatConnFunc`, which prefixes a fixed
//! magic/version header before (optionally obfuscated) payload bytes so
//! passive DPI sees what looks like a video-call stream.

use super::xorobfs::XorObfuscator;
use super::Obfuscator;

/// `0xa1 0x17` mirrors the two-byte marker the source's WeChat framing
/// prepends ahead of a sequence counter; the exact value only matters for
/// matching a fixed, recognizable prefix.
const MAGIC: [u8; 2] = [0xa1, 0x17];

#[derive(Debug)]
pub struct WeChatObfuscator {
    inner: Option<XorObfuscator>,
    seq: std::sync::atomic::AtomicU32,
}

impl WeChatObfuscator {
    pub fn new(inner: XorObfuscator) -> Self {
        WeChatObfuscator {
            inner: Some(inner),
            seq: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn plain() -> Self {
        WeChatObfuscator {
            inner: None,
            seq: std::sync::atomic::AtomicU32::new(0),
        }
    }
}

impl Obfuscator for WeChatObfuscator {
    fn encode(&self, plaintext: &[u8]) -> Vec<u8> {
        let payload = match &self.inner {
            Some(xor) => xor.encode(plaintext),
            None => plaintext.to_vec(),
        };
        let seq = self
            .seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let mut out = Vec::with_capacity(MAGIC.len() + 4 + payload.len());
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&seq.to_be_bytes());
        out.extend_from_slice(&payload);
        out
    }

    fn decode(&self, packet: &[u8]) -> Option<Vec<u8>> {
        if packet.len() < MAGIC.len() + 4 || packet[..MAGIC.len()] != MAGIC {
            return None;
        }
        let payload = &packet[MAGIC.len() + 4..];
        match &self.inner {
            Some(xor) => xor.decode(payload),
            None => Some(payload.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_without_xor_layer() {
        let obfs = WeChatObfuscator::plain();
        let wire = obfs.encode(b"hello");
        assert_eq!(obfs.decode(&wire).unwrap(), b"hello");
    }

    #[test]
    fn round_trips_with_xor_layer() {
        let obfs = WeChatObfuscator::new(XorObfuscator::new("pw"));
        let wire = obfs.encode(b"hello");
        assert_eq!(obfs.decode(&wire).unwrap(), b"hello");
    }

    #[test]
    fn rejects_packets_missing_the_magic_prefix() {
        let obfs = WeChatObfuscator::plain();
        assert!(obfs.decode(b"not wechat framed at all").is_none());
    }

    #[test]
    fn sequence_number_increments_per_packet() {
        let obfs = WeChatObfuscator::plain();
        let a = obfs.encode(b"x");
        let b = obfs.encode(b"x");
        assert_ne!(a[2..6], b[2..6]);
    }
}
