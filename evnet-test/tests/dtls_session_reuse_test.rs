//! DTLS session resumption against the same peer address.
//!
//! First handshake populates the client context's session cache through the
//! library's new-session callback; reconnecting to the same server address
//! installs the cached session and completes an abbreviated handshake.

use evnet::tls::TlsConnection;
use evnet::HandshakeStatus;
use evnet_test::tls_pair::{dtls_client_context, dtls_server_context, udp_pair};
use std::thread;

#[test]
fn reconnect_to_same_peer_resumes_session() {
    evnet_test::init_logging();

    let mut server_ctx = dtls_server_context("resume-server").unwrap();
    server_ctx.set_session_reuse(true).unwrap();

    let mut client_ctx = dtls_client_context().unwrap();
    client_ctx.set_session_reuse(true).unwrap();

    // First connection: full handshake.
    let (server_chan, server_addr, client_chan, client_addr) = udp_pair(0).unwrap();

    let server = thread::spawn(move || {
        let mut conn = TlsConnection::server(&mut server_ctx, server_chan, client_addr).unwrap();
        assert_eq!(conn.handshake().unwrap(), HandshakeStatus::Complete);
        (server_ctx, conn.session_reused())
    });

    let mut conn1 = TlsConnection::client(&mut client_ctx, client_chan, server_addr).unwrap();
    // Empty cache on the first connect; still OK.
    conn1.reuse_session().unwrap();
    assert_eq!(conn1.handshake().unwrap(), HandshakeStatus::Complete);
    assert!(!conn1.session_reused(), "first handshake cannot be resumed");

    let (mut server_ctx, server_reused) = server.join().unwrap();
    assert!(!server_reused);
    drop(conn1);

    // Second connection to the same server address.
    let (server_chan, server_addr2, client_chan, client_addr2) =
        udp_pair(server_addr.port()).unwrap();
    assert_eq!(server_addr2, server_addr, "peer address must be stable");

    let server = thread::spawn(move || {
        let mut conn = TlsConnection::server(&mut server_ctx, server_chan, client_addr2).unwrap();
        assert_eq!(conn.handshake().unwrap(), HandshakeStatus::Complete);
        conn.session_reused()
    });

    let mut conn2 = TlsConnection::client(&mut client_ctx, client_chan, server_addr).unwrap();
    conn2.reuse_session().unwrap();
    assert_eq!(conn2.handshake().unwrap(), HandshakeStatus::Complete);

    assert!(conn2.session_reused(), "second handshake must resume");
    assert!(server.join().unwrap(), "server side must see the resumption");

    // Manual capture back into the cache keeps the invariant of at most one
    // entry per peer.
    conn2.update_sessions().unwrap();
}
