//! Plain UDP transport: the baseline `AsyncUdpSocket`, unobfuscated.
//!
//! Grounded on `pktconns.NewServerUDPConnFunc`, which just does
//! `net.ListenUDP` and returns it as-is.

use crate::error::PacketConnError;
use quinn::AsyncUdpSocket;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

/// Binds a plain UDP socket and hands it to quinn's tokio runtime to get
/// back a fully functional `AsyncUdpSocket` (GSO/GRO detection, non-blocking
/// setup, etc. all handled by the runtime the way the rest of quinn does).
pub fn bind(addr: SocketAddr) -> Result<Arc<dyn AsyncUdpSocket>, PacketConnError> {
    let socket = UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    let runtime = quinn::default_runtime()
        .expect("a tokio runtime must be active when binding the packet-conn socket");
    Ok(runtime.wrap_udp_socket(socket)?.into())
}
