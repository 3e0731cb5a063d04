//! Pluggable packet-conn obfuscation, injected beneath quinn's transport the
//! same way the source passes a custom `net.PacketConn` into `quic.Listen`.
//!
//! `ObfuscatedSocket` implements `quinn::AsyncUdpSocket` by wrapping the
//! platform socket quinn's own tokio runtime would have produced and
//! transforming bytes in `try_send`/`poll_recv`. Grounded on
//! `internal/pkg/transport/pktconns/funcs.go`'s
//! `serverPacketConnFuncFactoryMap`, which picks a transport by protocol
//! name and layers an XOR obfuscator on top when a password is configured.

pub mod faketcp;
pub mod udp;
pub mod wechat;
pub mod xorobfs;

use crate::config::Protocol;
use crate::error::PacketConnError;
use quinn::udp::{RecvMeta, Transmit};
use quinn::AsyncUdpSocket;
use std::fmt;
use std::io;
use std::io::IoSliceMut;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// A reversible byte-level transform applied to every outgoing/incoming
/// datagram. Obfuscators may change packet length (e.g. prepending a salt),
/// so `decode` returns an owned buffer rather than transforming in place.
pub trait Obfuscator: Send + Sync + fmt::Debug {
    fn encode(&self, plaintext: &[u8]) -> Vec<u8>;
    /// Returns `None` for a packet that does not match this obfuscator's
    /// framing -- e.g. a stray unobfuscated probe packet.
    fn decode(&self, packet: &[u8]) -> Option<Vec<u8>>;
}

/// Builds the packet-conn transport for `protocol`, wrapping it with an
/// obfuscator when `obfs_password` is set. Mirrors the source's
/// `serverPacketConnFuncFactoryMap` lookup by protocol name.
pub fn build_socket(
    protocol: Protocol,
    obfs_password: Option<&str>,
    bind_addr: SocketAddr,
) -> Result<Arc<dyn AsyncUdpSocket>, PacketConnError> {
    let inner = match protocol {
        Protocol::Udp => udp::bind(bind_addr)?,
        Protocol::Wechat => udp::bind(bind_addr)?,
        Protocol::Faketcp => faketcp::bind(bind_addr)?,
    };

    let obfuscator: Option<Arc<dyn Obfuscator>> = match (protocol, obfs_password) {
        (Protocol::Wechat, Some(pw)) => Some(Arc::new(wechat::WeChatObfuscator::new(
            xorobfs::XorObfuscator::new(pw),
        ))),
        (Protocol::Wechat, None) => Some(Arc::new(wechat::WeChatObfuscator::plain())),
        (_, Some(pw)) => Some(Arc::new(xorobfs::XorObfuscator::new(pw))),
        (_, None) => None,
    };

    Ok(match obfuscator {
        Some(obfs) => Arc::new(ObfuscatedSocket::new(inner, obfs)),
        None => inner,
    })
}

/// Wraps an inner `AsyncUdpSocket`, applying `obfuscator` to the wire bytes
/// of every send/receive.
struct ObfuscatedSocket {
    inner: Arc<dyn AsyncUdpSocket>,
    obfuscator: Arc<dyn Obfuscator>,
}

impl fmt::Debug for ObfuscatedSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObfuscatedSocket").finish_non_exhaustive()
    }
}

impl ObfuscatedSocket {
    fn new(inner: Arc<dyn AsyncUdpSocket>, obfuscator: Arc<dyn Obfuscator>) -> Self {
        ObfuscatedSocket { inner, obfuscator }
    }
}

impl AsyncUdpSocket for ObfuscatedSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn quinn::UdpPoller>> {
        self.inner.clone().create_io_poller()
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        let encoded = self.obfuscator.encode(&transmit.contents);
        let wrapped = Transmit {
            destination: transmit.destination,
            ecn: transmit.ecn,
            contents: &encoded,
            segment_size: None,
            src_ip: transmit.src_ip,
        };
        self.inner.try_send(&wrapped)
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        // Obfuscation changes packet length, so receive into scratch buffers
        // sized like the caller's, decode, then copy the plaintext back.
        let mut scratch: Vec<Vec<u8>> = bufs.iter().map(|b| vec![0u8; b.len()]).collect();
        let mut scratch_slices: Vec<IoSliceMut> =
            scratch.iter_mut().map(|v| IoSliceMut::new(v)).collect();
        let n = match self.inner.poll_recv(cx, &mut scratch_slices, meta) {
            Poll::Ready(Ok(n)) => n,
            other => return other,
        };
        // Decoded packets must land contiguously from index 0: quinn only
        // looks at the first `out` slots of `bufs`/`meta`. A packet that
        // fails to decode is dropped, which would otherwise leave a gap.
        let mut out = 0;
        for i in 0..n {
            let raw = &scratch[i][..meta[i].len];
            if let Some(plain) = self.obfuscator.decode(raw) {
                let len = plain.len().min(bufs[out].len());
                bufs[out][..len].copy_from_slice(&plain[..len]);
                meta[out].len = len;
                meta[out].stride = len;
                if out != i {
                    meta[out].addr = meta[i].addr;
                    meta[out].ecn = meta[i].ecn;
                    meta[out].dst_ip = meta[i].dst_ip;
                }
                out += 1;
            }
        }
        Poll::Ready(Ok(out))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn may_fragment(&self) -> bool {
        false
    }

    fn max_transmit_segments(&self) -> usize {
        1
    }

    fn max_receive_segments(&self) -> usize {
        1
    }
}
