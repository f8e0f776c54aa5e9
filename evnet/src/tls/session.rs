//! Peer-keyed TLS session cache.
//!
//! One entry per peer address; the entry owns the session blob. The library
//! signals removals through the context's remove callback, which locates the
//! entry by session identity. Addresses compare bit-exactly (family, address
//! bytes, port, scope id), so only an identical peer can hit an entry.

use crate::error::{Error, Result};
use foreign_types::{ForeignType, ForeignTypeRef};
use openssl::ssl::{SslSession, SslSessionRef};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;

pub(crate) struct SessionCache {
    entries: Mutex<HashMap<SocketAddr, SslSession>>,
}

impl SessionCache {
    pub(crate) fn new() -> SessionCache {
        SessionCache {
            entries: Mutex::new(HashMap::with_capacity(256)),
        }
    }

    /// Insert a session for a peer, displacing any prior entry.
    ///
    /// Sessions the library reports as non-resumable are rejected; caching
    /// them would only produce failed resumption attempts later.
    pub(crate) fn insert(&self, peer: SocketAddr, session: SslSession) -> Result<()> {
        if !is_resumable(&session) {
            return Err(Error::BadArgument);
        }

        tracing::trace!(%peer, "caching session");
        self.entries.lock().insert(peer, session);
        Ok(())
    }

    /// Exact peer-address lookup; the returned handle shares the blob.
    pub(crate) fn lookup(&self, peer: &SocketAddr) -> Option<SslSession> {
        self.entries.lock().get(peer).map(|s| clone_session(s))
    }

    /// Drop the entry whose session identity matches, if any.
    pub(crate) fn remove_by_id(&self, id: &[u8]) {
        self.entries.lock().retain(|peer, session| {
            let stale = session.id() == id;
            if stale {
                tracing::trace!(%peer, "evicting session");
            }
            !stale
        });
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Resumability test the high-level binding does not expose.
fn is_resumable(session: &SslSessionRef) -> bool {
    unsafe { super::ffi_shim::SSL_SESSION_is_resumable(session.as_ptr()) == 1 }
}

/// New owned handle to the same session blob.
pub(crate) fn clone_session(session: &SslSessionRef) -> SslSession {
    unsafe {
        openssl_sys::SSL_SESSION_up_ref(session.as_ptr());
        SslSession::from_ptr(session.as_ptr())
    }
}
