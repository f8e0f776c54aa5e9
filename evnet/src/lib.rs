//! evnet: an event-driven networking runtime core.
//!
//! The crate provides:
//!
//! - a per-thread [`Reactor`] multiplexing descriptors over interchangeable
//!   poll backends (select/poll/epoll/kqueue) with an integrated timer list,
//! - a thread context store ([`thread`]) binding reactors to threads with a
//!   process-global fallback,
//! - [`TlsContext`]/[`TlsConnection`] for TLS and DTLS session management
//!   with peer-keyed session reuse and DTLS-SRTP keying export.

pub mod error;
pub mod poll;
pub mod reactor;
pub mod tls;

// The external-lock slot takes a parking_lot mutex; re-export the crate so
// applications name the same type.
pub use parking_lot;

pub use error::{Error, Result};
pub use poll::{FdFlags, PollMethod};
pub use reactor::thread;
pub use reactor::{jiffies, FdHandler, Reactor, ReactorGuard, TimerKey};
pub use tls::{
    FingerprintAlg, HandshakeStatus, KeyType, SrtpKeyInfo, SrtpSuite, TlsConnection, TlsContext,
    TlsMethod, TlsVersion,
};
