//! Small shared helpers: address masking for logs, and the bidirectional
//! byte-counted copy used to relay a TCP stream.
//!
//! Grounded on `internal/pkg/utils`'s `IPMasker`/`Pipe2Way`, which the
//! source's connect/disconnect/tcp/udp logging hooks and `handleTCP` call
//! respectively.

use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Masks the low-order bits of a client address before it ever reaches a
/// log line, the way `defaultIPMasker` anonymizes addresses passed to the
/// connect/disconnect/error hooks.
pub struct IpMasker {
    v4_bits: u8,
    v6_bits: u8,
}

impl IpMasker {
    /// Masks the last octet of IPv4 addresses and the last 80 bits of IPv6
    /// addresses, matching the source's default masker.
    pub fn new() -> Self {
        IpMasker { v4_bits: 8, v6_bits: 80 }
    }

    pub fn mask(&self, addr: &SocketAddr) -> String {
        match addr.ip() {
            std::net::IpAddr::V4(ip) => {
                let mut octets = ip.octets();
                mask_trailing_bits(&mut octets, self.v4_bits);
                format!("{}.{}.{}.{}:{}", octets[0], octets[1], octets[2], octets[3], addr.port())
            }
            std::net::IpAddr::V6(ip) => {
                let mut segments = ip.octets();
                mask_trailing_bits(&mut segments, self.v6_bits);
                let masked = std::net::Ipv6Addr::from(segments);
                format!("[{}]:{}", masked, addr.port())
            }
        }
    }
}

impl Default for IpMasker {
    fn default() -> Self {
        Self::new()
    }
}

fn mask_trailing_bits(bytes: &mut [u8], bits: u8) {
    let mut remaining = bits as usize;
    for byte in bytes.iter_mut().rev() {
        if remaining == 0 {
            break;
        }
        if remaining >= 8 {
            *byte = 0;
            remaining -= 8;
        } else {
            *byte &= !((1u16 << remaining) - 1) as u8;
            remaining = 0;
        }
    }
}

/// Copies bytes in both directions between `local` (a QUIC stream) and
/// `remote` (the dialed TCP socket) until either side's read returns EOF,
/// invoking `on_bytes` for each chunk relayed with a signed delta: positive
/// for upload (`local` -> `remote`), negative for download.
pub async fn pipe2way<L, R>(
    local: &mut L,
    remote: &mut R,
    mut on_bytes: impl FnMut(i64) + Send,
) -> std::io::Result<()>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);
    let mut buf_up = [0u8; 16 * 1024];
    let mut buf_down = [0u8; 16 * 1024];

    loop {
        tokio::select! {
            result = local_read.read(&mut buf_up) => {
                let n = result?;
                if n == 0 {
                    break;
                }
                remote_write.write_all(&buf_up[..n]).await?;
                on_bytes(n as i64);
            }
            result = remote_read.read(&mut buf_down) => {
                let n = result?;
                if n == 0 {
                    break;
                }
                local_write.write_all(&buf_down[..n]).await?;
                on_bytes(-(n as i64));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::duplex;

    #[test]
    fn masks_last_octet_of_ipv4() {
        let masker = IpMasker::new();
        let addr: SocketAddr = "203.0.113.42:8080".parse().unwrap();
        assert_eq!(masker.mask(&addr), "203.0.113.0:8080");
    }

    #[test]
    fn masks_trailing_bits_of_ipv6() {
        let masker = IpMasker::new();
        let addr: SocketAddr = "[2001:db8:1234:5678:9abc:def0:1234:5678]:443".parse().unwrap();
        let masked = masker.mask(&addr);
        assert!(masked.starts_with("[2001:db8:"));
    }

    #[tokio::test]
    async fn pipe2way_relays_both_directions_and_reports_signed_deltas() {
        let (mut local, mut local_peer) = duplex(1024);
        let (mut remote, mut remote_peer) = duplex(1024);

        let deltas = Arc::new(Mutex::new(Vec::new()));
        let deltas_in_task = deltas.clone();
        let relay = tokio::spawn(async move {
            pipe2way(&mut local, &mut remote, move |d| {
                deltas_in_task.lock().unwrap().push(d);
            })
            .await
        });

        local_peer.write_all(b"upload-bytes").await.unwrap();
        let mut buf = [0u8; 64];
        let n = remote_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"upload-bytes");

        remote_peer.write_all(b"download").await.unwrap();
        let n = local_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"download");

        drop(local_peer);
        drop(remote_peer);
        relay.await.unwrap().unwrap();

        let recorded = deltas.lock().unwrap().clone();
        assert!(recorded.contains(&12i64));
        assert!(recorded.contains(&-8i64));
    }
}
