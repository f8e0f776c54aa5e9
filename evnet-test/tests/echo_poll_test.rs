//! TCP echo over the POLL backend.
//!
//! A client on a second thread sends "hello" and reads it back while the
//! reactor dispatches on the main thread. During the echo two descriptors
//! are attached (listener + connection); after both sides close, none are.

use evnet::{PollMethod, Reactor};
use evnet_test::echo::EchoServer;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

#[test]
fn tcp_echo_over_poll() {
    evnet_test::init_logging();

    let reactor = Reactor::new();
    reactor.set_method(PollMethod::Poll).unwrap();
    assert_eq!(reactor.method(), Some(PollMethod::Poll));

    let server = EchoServer::start(&reactor, |_, _| {}).unwrap();
    let addr = server.addr;
    println!("echo server on {addr}");

    let re = reactor.clone();
    let client = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        stream.write_all(b"hello").unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        // Stop the loop; the closing stream wakes the reactor out of its
        // wait so cancellation is observed.
        re.cancel();
        drop(stream);
    });

    reactor.run().unwrap();
    client.join().unwrap();

    let stats = server.stats();
    println!("stats: {stats:?}");
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.bytes_echoed, 5);
    assert_eq!(stats.max_active, 2, "listener + connection during echo");

    server.stop();
    assert_eq!(reactor.active_count(), 0);
}
