//! Helpers for driving TLS/DTLS handshakes between two in-process
//! endpoints over loopback UDP.

use evnet::{Result, TlsContext, TlsMethod};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, UdpSocket};

/// A connected UDP socket as a byte transport; each read is one datagram.
pub struct UdpChannel {
    sock: UdpSocket,
}

impl UdpChannel {
    pub fn new(sock: UdpSocket) -> UdpChannel {
        UdpChannel { sock }
    }
}

impl Read for UdpChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.sock.recv(buf)
    }
}

impl Write for UdpChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sock.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Two loopback UDP sockets connected to each other.
///
/// `server_port` 0 picks an ephemeral server port; passing the port from a
/// previous pair rebinds the same server address, which keeps the peer
/// address stable across reconnects.
pub fn udp_pair(server_port: u16) -> io::Result<(UdpChannel, SocketAddr, UdpChannel, SocketAddr)> {
    let server = UdpSocket::bind(("127.0.0.1", server_port))?;
    let client = UdpSocket::bind("127.0.0.1:0")?;
    let server_addr = server.local_addr()?;
    let client_addr = client.local_addr()?;

    server.connect(client_addr)?;
    client.connect(server_addr)?;

    Ok((
        UdpChannel::new(server),
        server_addr,
        UdpChannel::new(client),
        client_addr,
    ))
}

/// DTLS server context with a fresh self-signed credential.
pub fn dtls_server_context(cn: &str) -> Result<TlsContext> {
    let mut ctx = TlsContext::new(TlsMethod::Dtls)?;
    ctx.set_selfsigned(cn)?;
    Ok(ctx)
}

/// DTLS client context; server verification stays at the default-off peer
/// policy so self-signed test credentials are accepted.
pub fn dtls_client_context() -> Result<TlsContext> {
    TlsContext::new(TlsMethod::Dtls)
}
