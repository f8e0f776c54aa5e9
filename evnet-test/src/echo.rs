//! TCP echo server driven by an evnet reactor.
//!
//! The listener and every accepted connection are registered with the
//! reactor; all echo work happens in read-event handlers on the owner
//! thread. Used by the end-to-end tests to observe dispatch, registry
//! counts and live backend switching.

use evnet::{FdFlags, Reactor, Result};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

/// Counters the echo handlers maintain while the reactor runs.
#[derive(Debug, Default, Clone)]
pub struct EchoStats {
    /// Connections accepted.
    pub connections: u64,
    /// Bytes read and written back.
    pub bytes_echoed: u64,
    /// Highest attached-descriptor count observed from inside a handler.
    pub max_active: usize,
}

/// A listening echo server bound to 127.0.0.1 on an ephemeral port.
pub struct EchoServer {
    reactor: Arc<Reactor>,
    listener_fd: RawFd,
    pub addr: SocketAddr,
    stats: Arc<Mutex<EchoStats>>,
}

impl EchoServer {
    /// Bind a listener and register it with the reactor for READ events.
    ///
    /// `on_echo` runs after every echoed payload, still on the owner
    /// thread, and may drive the reactor (switch methods, cancel, ...).
    pub fn start<F>(reactor: &Arc<Reactor>, on_echo: F) -> Result<EchoServer>
    where
        F: Fn(&Arc<Reactor>, u64) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let listener_fd = listener.as_raw_fd();

        let stats = Arc::new(Mutex::new(EchoStats::default()));
        let on_echo: Arc<dyn Fn(&Arc<Reactor>, u64) + Send + Sync> = Arc::new(on_echo);

        let re = reactor.clone();
        let st = stats.clone();
        reactor.attach(listener_fd, FdFlags::READ, move |_flags| loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "echo: accepted");
                    st.lock().unwrap().connections += 1;
                    if let Err(e) = attach_client(&re, stream, &st, &on_echo) {
                        tracing::warn!(error = %e, "echo: client attach failed");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "echo: accept failed");
                    break;
                }
            }
        })?;

        Ok(EchoServer {
            reactor: reactor.clone(),
            listener_fd,
            addr,
            stats,
        })
    }

    pub fn stats(&self) -> EchoStats {
        self.stats.lock().unwrap().clone()
    }

    /// Detach the listener; accepted connections detach themselves on EOF.
    pub fn stop(&self) {
        let _ = self.reactor.detach(self.listener_fd);
    }
}

fn attach_client(
    reactor: &Arc<Reactor>,
    stream: TcpStream,
    stats: &Arc<Mutex<EchoStats>>,
    on_echo: &Arc<dyn Fn(&Arc<Reactor>, u64) + Send + Sync>,
) -> Result<()> {
    stream.set_nonblocking(true)?;
    let fd = stream.as_raw_fd();
    let stream = Mutex::new(stream);

    let re = reactor.clone();
    let st = stats.clone();
    let on_echo = on_echo.clone();

    reactor.attach(fd, FdFlags::READ, move |_flags| {
        let mut buf = [0u8; 4096];
        let mut echoed = 0u64;
        {
            let mut stream = stream.lock().unwrap();
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => {
                        drop(stream);
                        let _ = re.detach(fd);
                        return;
                    }
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).is_err() {
                            drop(stream);
                            let _ = re.detach(fd);
                            return;
                        }
                        echoed += n as u64;
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        tracing::debug!(fd, error = %e, "echo: read failed");
                        drop(stream);
                        let _ = re.detach(fd);
                        return;
                    }
                }
            }
        }

        if echoed > 0 {
            let active = re.active_count();
            {
                let mut st = st.lock().unwrap();
                st.bytes_echoed += echoed;
                if active > st.max_active {
                    st.max_active = active;
                }
            }
            on_echo(&re, echoed);
        }
    })
}
