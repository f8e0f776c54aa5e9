//! TLS/DTLS context and connection management with session reuse.
//!
//! A [`TlsContext`] is a credential container: certificate and private key,
//! trust material, verification policy, cipher list, protocol bounds and
//! SRTP profiles, plus a peer-keyed session cache for resumption. Contexts
//! are configured first and freeze their library configuration when the
//! first connection is created; connections reference the context's session
//! cache and outlive neither it nor the context.

mod cert;
mod ffi_shim;
mod session;
mod srtp;

pub use cert::FingerprintAlg;
pub use srtp::{SrtpKeyInfo, SrtpSuite};

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use openssl::ec::{EcGroup, EcKey};
use openssl::ex_data::Index;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::{
    Ssl, SslContext, SslContextBuilder, SslContextRef, SslFiletype, SslMethod, SslRef,
    SslSessionCacheMode, SslStream, SslVerifyMode, SslVersion,
};
use openssl::x509::verify::X509CheckFlags;
use openssl::x509::{X509Crl, X509VerifyResult, X509};
use session::SessionCache;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

/// Handshake transport method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMethod {
    /// Stream TLS over a reliable transport.
    Tls,
    /// Datagram TLS.
    Dtls,
}

/// Protocol version bound for [`TlsContext::set_min_proto_version`] and
/// [`TlsContext::set_max_proto_version`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls1_0,
    Tls1_1,
    Tls1_2,
    Tls1_3,
    Dtls1_0,
    Dtls1_2,
}

impl TlsVersion {
    fn to_ssl(self) -> SslVersion {
        match self {
            TlsVersion::Tls1_0 => SslVersion::TLS1,
            TlsVersion::Tls1_1 => SslVersion::TLS1_1,
            TlsVersion::Tls1_2 => SslVersion::TLS1_2,
            TlsVersion::Tls1_3 => SslVersion::TLS1_3,
            TlsVersion::Dtls1_0 => SslVersion::DTLS1,
            TlsVersion::Dtls1_2 => SslVersion::DTLS1_2,
        }
    }
}

/// Private key encoding tag for DER credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa,
    Ec,
}

/// Handshake progress for nonblocking transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Complete,
    WantRead,
    WantWrite,
}

/// Per-connection data the session callbacks need: who the peer is and
/// which cache to feed.
struct ConnData {
    peer: SocketAddr,
    cache: Arc<SessionCache>,
}

static CONN_INDEX: Lazy<Index<Ssl, ConnData>> =
    Lazy::new(|| Ssl::new_ex_index().expect("ssl ex-data index"));

static CTX_CACHE_INDEX: Lazy<Index<SslContext, Arc<SessionCache>>> =
    Lazy::new(|| SslContext::new_ex_index().expect("ssl-ctx ex-data index"));

/// TLS credential container and session-cache owner.
pub struct TlsContext {
    // Exactly one of builder/ctx is set: builder until the first connection
    // freezes the configuration, ctx afterwards.
    builder: Option<SslContextBuilder>,
    ctx: Option<SslContext>,
    method: TlsMethod,
    cert: Option<X509>,
    /// Retained for the key-decryption callback's lifetime.
    password: Option<String>,
    verify_server: bool,
    reuse_enabled: bool,
    cache: Arc<SessionCache>,
}

impl TlsContext {
    /// Allocate a context for the given method.
    pub fn new(method: TlsMethod) -> Result<TlsContext> {
        let ssl_method = match method {
            TlsMethod::Tls => SslMethod::tls(),
            TlsMethod::Dtls => SslMethod::dtls(),
        };

        let mut builder = SslContext::builder(ssl_method)?;

        // NSS-format key logging, same trigger the rest of the TLS
        // ecosystem honors.
        if let Some(path) = std::env::var_os("SSLKEYLOGFILE") {
            builder.set_keylog_callback(move |_ssl, line| {
                if let Ok(mut f) = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                {
                    let _ = writeln!(f, "{}", line);
                }
            });
        }

        Ok(TlsContext {
            builder: Some(builder),
            ctx: None,
            method,
            cert: None,
            password: None,
            verify_server: true,
            reuse_enabled: false,
            cache: Arc::new(SessionCache::new()),
        })
    }

    /// Allocate a context and load a PEM credential file, decrypting the
    /// key with `password` when given.
    pub fn with_keyfile(
        method: TlsMethod,
        keyfile: &Path,
        password: Option<&str>,
    ) -> Result<TlsContext> {
        let mut tls = TlsContext::new(method)?;
        tls.password = password.map(str::to_owned);

        let builder = tls.builder_mut()?;
        builder.set_certificate_chain_file(keyfile).map_err(|e| {
            tracing::warn!(keyfile = %keyfile.display(), error = %e, "cannot read certificate file");
            Error::BadArgument
        })?;

        match tls.password.clone() {
            Some(pwd) => {
                let pem = std::fs::read(keyfile)?;
                let key = PKey::private_key_from_pem_passphrase(&pem, pwd.as_bytes())
                    .map_err(|e| {
                        tracing::warn!(keyfile = %keyfile.display(), error = %e, "cannot decrypt key file");
                        Error::BadArgument
                    })?;
                tls.builder_mut()?.set_private_key(&key)?;
            }
            None => {
                tls.builder_mut()?
                    .set_private_key_file(keyfile, SslFiletype::PEM)
                    .map_err(|e| {
                        tracing::warn!(keyfile = %keyfile.display(), error = %e, "cannot read key file");
                        Error::BadArgument
                    })?;
            }
        }

        Ok(tls)
    }

    pub fn method(&self) -> TlsMethod {
        self.method
    }

    fn builder_mut(&mut self) -> Result<&mut SslContextBuilder> {
        // Frozen once the first connection was created.
        self.builder.as_mut().ok_or(Error::BadArgument)
    }

    /// Backend context handle; freezes the configuration on first use.
    pub fn ssl_context(&mut self) -> Result<&SslContextRef> {
        if let Some(builder) = self.builder.take() {
            self.ctx = Some(builder.build());
        }
        self.ctx.as_deref().ok_or(Error::BadArgument)
    }

    /// Trust CA certificates from a PEM file.
    pub fn add_ca_file(&mut self, cafile: &Path) -> Result<()> {
        self.builder_mut()?.set_ca_file(cafile).map_err(|e| {
            tracing::warn!(cafile = %cafile.display(), error = %e, "cannot read CA file");
            Error::NotFound
        })
    }

    /// Trust every PEM certificate found directly under a directory.
    pub fn add_ca_path(&mut self, capath: &Path) -> Result<()> {
        if !capath.is_dir() {
            tracing::warn!(capath = %capath.display(), "CA path is not a directory");
            return Err(Error::NotADirectory);
        }

        let store = self.builder_mut()?.cert_store_mut();
        let mut loaded = 0usize;
        for entry in std::fs::read_dir(capath)? {
            let path = entry?.path();
            let Ok(pem) = std::fs::read(&path) else {
                continue;
            };
            let Ok(ca) = X509::from_pem(&pem) else {
                continue;
            };
            store.add_cert(ca).map_err(|_| Error::BadArgument)?;
            loaded += 1;
        }

        tracing::debug!(capath = %capath.display(), loaded, "CA directory loaded");
        Ok(())
    }

    /// Trust a CA certificate given as PEM text.
    pub fn add_ca_pem(&mut self, pem: &str) -> Result<()> {
        let ca = X509::from_pem(pem.as_bytes()).map_err(|e| {
            tracing::warn!(error = %e, "cannot read CA pem");
            Error::BadFormat
        })?;

        self.builder_mut()?
            .cert_store_mut()
            .add_cert(ca)
            .map_err(|_| Error::BadArgument)
    }

    /// Trust a CRL given as PEM text.
    pub fn add_crl_pem(&mut self, pem: &str) -> Result<()> {
        use foreign_types::{ForeignType, ForeignTypeRef};

        let crl = X509Crl::from_pem(pem.as_bytes()).map_err(|e| {
            tracing::warn!(error = %e, "cannot read CRL pem");
            Error::BadFormat
        })?;

        let store = self.builder_mut()?.cert_store_mut();
        // The store builder has no high-level CRL insert.
        let rc = unsafe { crate::tls::ffi_shim::X509_STORE_add_crl(store.as_ptr(), crl.as_ptr()) };
        if rc != 1 {
            let e = openssl::error::ErrorStack::get();
            tracing::warn!(error = %e, "cannot add CRL");
            return Err(Error::BadArgument);
        }
        Ok(())
    }

    /// Restrict acceptable peer certificates to an X.509 purpose given by
    /// its short name, e.g. `sslserver`.
    pub fn set_verify_purpose(&mut self, purpose: &str) -> Result<()> {
        use foreign_types::ForeignTypeRef;

        let sname = std::ffi::CString::new(purpose).map_err(|_| Error::BadArgument)?;

        // Short name -> purpose index -> purpose object -> purpose id; the
        // high-level binding does not cover the purpose table.
        let id = unsafe {
            let idx = openssl_sys::X509_PURPOSE_get_by_sname(sname.as_ptr() as _);
            if idx < 0 {
                return Err(Error::BadArgument);
            }
            let obj = openssl_sys::X509_PURPOSE_get0(idx);
            if obj.is_null() {
                return Err(Error::BadArgument);
            }
            openssl_sys::X509_PURPOSE_get_id(obj as _)
        };

        let param = self.builder_mut()?.verify_param_mut();
        let rc = unsafe { openssl_sys::X509_VERIFY_PARAM_set_purpose(param.as_ptr(), id) };
        if rc != 1 {
            let e = openssl::error::ErrorStack::get();
            tracing::warn!(purpose, error = %e, "set purpose failed");
            return Err(Error::BadArgument);
        }
        Ok(())
    }

    /// Install a pre-parsed certificate and private key, dropping any prior
    /// credential.
    pub fn set_certificate(&mut self, cert: X509, key: PKey<Private>) -> Result<()> {
        let builder = self.builder_mut()?;
        builder.set_certificate(&cert)?;
        builder.set_private_key(&key).map_err(|e| {
            tracing::warn!(error = %e, "use private key failed");
            Error::Tls(e)
        })?;

        self.cert = Some(cert);
        Ok(())
    }

    /// Install a credential from PEM text; the key is read from `cert_pem`
    /// when no separate key text is given.
    pub fn set_certificate_pem(&mut self, cert_pem: &str, key_pem: Option<&str>) -> Result<()> {
        let key_pem = key_pem.unwrap_or(cert_pem);

        let cert = X509::from_pem(cert_pem.as_bytes()).map_err(|_| Error::BadFormat)?;
        let key = PKey::private_key_from_pem(key_pem.as_bytes()).map_err(|_| Error::BadFormat)?;

        self.set_certificate(cert, key)
    }

    /// Install a credential from DER bytes with the key encoding named by
    /// `keytype`.
    pub fn set_certificate_der(
        &mut self,
        keytype: KeyType,
        cert_der: &[u8],
        key_der: &[u8],
    ) -> Result<()> {
        let cert = X509::from_der(cert_der).map_err(|_| Error::BadFormat)?;
        let key = match keytype {
            KeyType::Rsa => {
                let rsa = Rsa::private_key_from_der(key_der).map_err(|_| Error::BadFormat)?;
                PKey::from_rsa(rsa)?
            }
            KeyType::Ec => {
                let ec = EcKey::private_key_from_der(key_der).map_err(|_| Error::BadFormat)?;
                PKey::from_ec_key(ec)?
            }
        };

        self.set_certificate(cert, key)
    }

    /// Generate and install a self-signed RSA-2048 certificate.
    pub fn set_selfsigned(&mut self, cn: &str) -> Result<()> {
        self.set_selfsigned_rsa(cn, 2048)
    }

    /// Generate and install a self-signed RSA certificate with the chosen
    /// modulus size.
    pub fn set_selfsigned_rsa(&mut self, cn: &str, bits: u32) -> Result<()> {
        let rsa = Rsa::generate(bits)?;
        let key = PKey::from_rsa(rsa)?;
        let cert = cert::generate_selfsigned(cn, &key)?;
        self.set_certificate(cert, key)
    }

    /// Generate and install a self-signed EC certificate on a named curve.
    pub fn set_selfsigned_ec(&mut self, cn: &str, curve: &str) -> Result<()> {
        let nid = cert::curve_nid(curve).ok_or(Error::NotSupported)?;
        let group = EcGroup::from_curve_name(nid)?;
        let ec = EcKey::generate(&group)?;
        let key = PKey::from_ec_key(ec)?;
        let cert = cert::generate_selfsigned(cn, &key)?;
        self.set_certificate(cert, key)
    }

    /// Request a certificate from connecting clients and accept any peer;
    /// identity is checked elsewhere, e.g. by fingerprint in DTLS-SRTP.
    pub fn set_verify_client(&mut self) -> Result<()> {
        let builder = self.builder_mut()?;
        builder.set_verify_depth(0);
        builder.set_verify_callback(SslVerifyMode::PEER, |_preverified, _ctx| true);
        Ok(())
    }

    /// Disable per-connection server verification for this context.
    pub fn disable_verify_server(&mut self) {
        self.verify_server = false;
    }

    /// Ordered cipher list.
    pub fn set_ciphers<I, S>(&mut self, ciphers: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = ciphers
            .into_iter()
            .map(|c| c.as_ref().to_owned())
            .collect::<Vec<_>>()
            .join(":");
        if joined.is_empty() {
            return Err(Error::BadArgument);
        }

        self.builder_mut()?.set_cipher_list(&joined).map_err(|e| {
            tracing::warn!(ciphers = %joined, error = %e, "cipher list rejected");
            Error::Protocol
        })
    }

    pub fn set_min_proto_version(&mut self, version: TlsVersion) -> Result<()> {
        self.builder_mut()?
            .set_min_proto_version(Some(version.to_ssl()))
            .map_err(|_| Error::Permission)
    }

    pub fn set_max_proto_version(&mut self, version: TlsVersion) -> Result<()> {
        self.builder_mut()?
            .set_max_proto_version(Some(version.to_ssl()))
            .map_err(|_| Error::Permission)
    }

    /// SRTP profiles offered in the handshake, ":"-separated in preference
    /// order, e.g. `SRTP_AES128_CM_SHA1_80:SRTP_AES128_CM_SHA1_32`.
    pub fn set_srtp_profiles(&mut self, profiles: &str) -> Result<()> {
        self.builder_mut()?
            .set_tlsext_use_srtp(profiles)
            .map_err(|e| {
                tracing::warn!(profiles, error = %e, "srtp profiles rejected");
                Error::NotSupported
            })
    }

    /// Fingerprint of the local certificate.
    pub fn fingerprint(&self, alg: FingerprintAlg, out: &mut [u8]) -> Result<usize> {
        let cert = self.cert.as_ref().ok_or(Error::BadArgument)?;
        cert::fingerprint(cert, alg, out)
    }

    /// Issuer of the local certificate in RFC 2253 form.
    pub fn issuer(&self) -> Result<String> {
        let cert = self.cert.as_ref().ok_or(Error::NotFound)?;
        cert::name_rfc2253(cert.issuer_name())
    }

    /// Subject of the local certificate in RFC 2253 form.
    pub fn subject(&self) -> Result<String> {
        let cert = self.cert.as_ref().ok_or(Error::NotFound)?;
        cert::name_rfc2253(cert.subject_name())
    }

    /// Enable or disable session reuse. When enabled, completed handshakes
    /// feed the per-context cache through the library's new-session
    /// callback, and the remove callback evicts by session identity.
    pub fn set_session_reuse(&mut self, enabled: bool) -> Result<()> {
        self.reuse_enabled = enabled;

        let cache = self.cache.clone();
        let builder = self.builder_mut()?;
        builder.set_session_cache_mode(if enabled {
            SslSessionCacheMode::BOTH
        } else {
            SslSessionCacheMode::OFF
        });

        if !enabled {
            return Ok(());
        }

        builder.set_ex_data(*CTX_CACHE_INDEX, cache);

        builder.set_new_session_callback(|ssl, sess| {
            let Some(data) = ssl.ex_data(*CONN_INDEX) else {
                tracing::warn!("new session without connection data");
                return;
            };
            let peer = data.peer;
            let cache = data.cache.clone();
            if let Err(e) = cache.insert(peer, sess) {
                tracing::debug!(%peer, error = %e, "session not cached");
            }
        });

        builder.set_remove_session_callback(|ctx, sess| {
            let Some(cache) = ctx.ex_data(*CTX_CACHE_INDEX) else {
                tracing::warn!("session removal without cache");
                return;
            };
            cache.remove_by_id(sess.id());
        });

        Ok(())
    }

    pub fn session_reuse_enabled(&self) -> bool {
        self.reuse_enabled
    }
}

enum ConnState<S> {
    /// Configured but not yet handshaking; pre-handshake setters apply here.
    Setup { ssl: Ssl, stream: S, client: bool },
    /// Handshake started or complete.
    Active(SslStream<S>),
    /// A failed state transition; the connection is unusable.
    Dead,
}

/// One TLS/DTLS connection over a byte transport.
pub struct TlsConnection<S> {
    state: ConnState<S>,
    peer: SocketAddr,
    cache: Arc<SessionCache>,
    reuse_enabled: bool,
    verify_server: bool,
}

impl<S: Read + Write> TlsConnection<S> {
    /// Client-side connection to `peer` over `stream`.
    pub fn client(ctx: &mut TlsContext, stream: S, peer: SocketAddr) -> Result<TlsConnection<S>> {
        TlsConnection::new(ctx, stream, peer, true)
    }

    /// Server-side connection from `peer` over `stream`.
    pub fn server(ctx: &mut TlsContext, stream: S, peer: SocketAddr) -> Result<TlsConnection<S>> {
        TlsConnection::new(ctx, stream, peer, false)
    }

    fn new(ctx: &mut TlsContext, stream: S, peer: SocketAddr, client: bool) -> Result<TlsConnection<S>> {
        let reuse_enabled = ctx.reuse_enabled;
        let verify_server = ctx.verify_server;
        let cache = ctx.cache.clone();

        let ssl_ctx = ctx.ssl_context()?;
        let mut ssl = Ssl::new(ssl_ctx)?;
        ssl.set_ex_data(
            *CONN_INDEX,
            ConnData {
                peer,
                cache: cache.clone(),
            },
        );

        Ok(TlsConnection {
            state: ConnState::Setup { ssl, stream, client },
            peer,
            cache,
            reuse_enabled,
            verify_server,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn ssl(&self) -> Result<&SslRef> {
        match &self.state {
            ConnState::Setup { ssl, .. } => Ok(ssl),
            ConnState::Active(stream) => Ok(stream.ssl()),
            ConnState::Dead => Err(Error::BadArgument),
        }
    }

    /// Enable server certificate and hostname verification for this
    /// connection. A hostname adds SNI and strict matching with partial
    /// wildcards disabled; a literal IP address only enables verification.
    ///
    /// No-op when the context has server verification disabled.
    pub fn set_verify_server(&mut self, host: &str) -> Result<()> {
        if !self.verify_server {
            return Ok(());
        }

        let ConnState::Setup { ssl, .. } = &mut self.state else {
            return Err(Error::BadArgument);
        };

        if host.parse::<std::net::IpAddr>().is_err() {
            let param = ssl.param_mut();
            param.set_hostflags(X509CheckFlags::NO_PARTIAL_WILDCARDS);
            param.set_host(host).map_err(|e| {
                tracing::warn!(host, error = %e, "set host failed");
                Error::Protocol
            })?;
            ssl.set_hostname(host).map_err(|e| {
                tracing::warn!(host, error = %e, "set SNI hostname failed");
                Error::Protocol
            })?;
        }

        ssl.set_verify(SslVerifyMode::PEER);
        Ok(())
    }

    /// Install a cached session for this connection's peer, if one exists.
    /// Must run before the handshake to produce an abbreviated one.
    pub fn reuse_session(&mut self) -> Result<()> {
        if !self.reuse_enabled {
            return Ok(());
        }

        let ConnState::Setup { ssl, .. } = &mut self.state else {
            return Err(Error::BadArgument);
        };

        if let Some(sess) = self.cache.lookup(&self.peer) {
            // The session stays owned by the cache entry; the connection
            // only takes a reference for the handshake.
            unsafe {
                ssl.set_session(&sess).map_err(|e| {
                    tracing::warn!(peer = %self.peer, error = %e, "set session failed");
                    Error::Tls(e)
                })?;
            }
        }

        Ok(())
    }

    /// Drive the handshake. Returns `WantRead`/`WantWrite` on nonblocking
    /// transports; call again once the transport is ready.
    pub fn handshake(&mut self) -> Result<HandshakeStatus> {
        let mut stream = match std::mem::replace(&mut self.state, ConnState::Dead) {
            ConnState::Setup { mut ssl, stream, client } => {
                if client {
                    ssl.set_connect_state();
                } else {
                    ssl.set_accept_state();
                }
                SslStream::new(ssl, stream)?
            }
            ConnState::Active(stream) => stream,
            ConnState::Dead => return Err(Error::BadArgument),
        };

        let res = stream.do_handshake();
        self.state = ConnState::Active(stream);

        match res {
            Ok(()) => Ok(HandshakeStatus::Complete),
            Err(e) if e.code() == openssl::ssl::ErrorCode::WANT_READ => Ok(HandshakeStatus::WantRead),
            Err(e) if e.code() == openssl::ssl::ErrorCode::WANT_WRITE => {
                Ok(HandshakeStatus::WantWrite)
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "handshake failed");
                Err(Error::Protocol)
            }
        }
    }

    /// Whether the current handshake used a cached session.
    pub fn session_reused(&self) -> bool {
        self.ssl().map(SslRef::session_reused).unwrap_or(false)
    }

    /// Capture the connection's current session into the cache.
    pub fn update_sessions(&self) -> Result<()> {
        let ssl = self.ssl()?;
        let sess = ssl.session().ok_or(Error::BadArgument)?;
        self.cache.insert(self.peer, session::clone_session(sess))
    }

    /// Fingerprint of the peer certificate.
    pub fn peer_fingerprint(&self, alg: FingerprintAlg, out: &mut [u8]) -> Result<usize> {
        let cert = self.ssl()?.peer_certificate().ok_or(Error::NotFound)?;
        cert::fingerprint(&cert, alg, out)
    }

    /// Common name of the peer certificate.
    pub fn peer_common_name(&self) -> Result<String> {
        let cert = self.ssl()?.peer_certificate().ok_or(Error::NotFound)?;
        let entry = cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .ok_or(Error::NotFound)?;
        Ok(entry.data().as_utf8()?.to_string())
    }

    /// Result of peer certificate verification.
    pub fn peer_verify(&self) -> Result<()> {
        if self.ssl()?.verify_result() != X509VerifyResult::OK {
            return Err(Error::AuthFailure);
        }
        Ok(())
    }

    /// Negotiated SRTP suite and keying material.
    pub fn srtp_keyinfo(&self) -> Result<SrtpKeyInfo> {
        srtp::keyinfo(self.ssl()?)
    }

    /// Name of the negotiated cipher.
    pub fn cipher_name(&self) -> Option<String> {
        self.ssl()
            .ok()
            .and_then(SslRef::current_cipher)
            .map(|c| c.name().to_string())
    }

    /// Shared reference to the transport.
    pub fn get_ref(&self) -> Option<&S> {
        match &self.state {
            ConnState::Setup { stream, .. } => Some(stream),
            ConnState::Active(ssl_stream) => Some(ssl_stream.get_ref()),
            ConnState::Dead => None,
        }
    }
}

impl<S: Read + Write> Read for TlsConnection<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.state {
            ConnState::Active(stream) => stream.read(buf),
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "handshake not started",
            )),
        }
    }
}

impl<S: Read + Write> Write for TlsConnection<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.state {
            ConnState::Active(stream) => stream.write(buf),
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "handshake not started",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.state {
            ConnState::Active(stream) => stream.flush(),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn peer() -> SocketAddr {
        "10.0.0.1:5061".parse().unwrap()
    }

    #[test]
    fn selfsigned_context_round_trip() {
        let mut tls = TlsContext::new(TlsMethod::Tls).unwrap();
        tls.set_selfsigned("x").unwrap();

        let subject = tls.subject().unwrap();
        assert!(subject.contains("CN=x"));
        assert_eq!(tls.subject().unwrap(), tls.issuer().unwrap());

        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        assert_eq!(tls.fingerprint(FingerprintAlg::Sha256, &mut a).unwrap(), 32);
        assert_eq!(tls.fingerprint(FingerprintAlg::Sha256, &mut b).unwrap(), 32);
        assert_eq!(a, b);

        let mut short = [0u8; 8];
        assert!(matches!(
            tls.fingerprint(FingerprintAlg::Sha256, &mut short),
            Err(Error::Overflow)
        ));
    }

    #[test]
    fn fingerprint_without_credential_fails() {
        let tls = TlsContext::new(TlsMethod::Tls).unwrap();
        let mut out = [0u8; 32];
        assert!(matches!(
            tls.fingerprint(FingerprintAlg::Sha256, &mut out),
            Err(Error::BadArgument)
        ));
    }

    #[test]
    fn ec_credential_installs() {
        let mut tls = TlsContext::new(TlsMethod::Dtls).unwrap();
        tls.set_selfsigned_ec("ec-host", "prime256v1").unwrap();
        assert!(tls.subject().unwrap().contains("CN=ec-host"));

        let mut tls2 = TlsContext::new(TlsMethod::Dtls).unwrap();
        assert!(matches!(
            tls2.set_selfsigned_ec("ec-host", "bogus-curve"),
            Err(Error::NotSupported)
        ));
    }

    #[test]
    fn pem_credential_round_trip() {
        let mut source = TlsContext::new(TlsMethod::Tls).unwrap();
        source.set_selfsigned("pem-host").unwrap();
        let cert_pem = String::from_utf8(source.cert.as_ref().unwrap().to_pem().unwrap()).unwrap();

        let mut tls = TlsContext::new(TlsMethod::Tls).unwrap();
        assert!(matches!(
            tls.set_certificate_pem("not a pem", None),
            Err(Error::BadFormat)
        ));
        // Cert-only text has no key to read.
        assert!(tls.set_certificate_pem(&cert_pem, None).is_err());

        tls.add_ca_pem(&cert_pem).unwrap();
    }

    #[test]
    fn settings_freeze_after_first_connection() {
        let mut tls = TlsContext::new(TlsMethod::Tls).unwrap();
        tls.set_ciphers(["DEFAULT"]).unwrap();
        tls.set_min_proto_version(TlsVersion::Tls1_2).unwrap();
        tls.set_max_proto_version(TlsVersion::Tls1_3).unwrap();

        let _ = tls.ssl_context().unwrap();
        assert!(matches!(tls.set_ciphers(["DEFAULT"]), Err(Error::BadArgument)));
        assert!(matches!(
            tls.set_session_reuse(true),
            Err(Error::BadArgument)
        ));
    }

    #[test]
    fn verify_purpose_by_short_name() {
        let mut tls = TlsContext::new(TlsMethod::Tls).unwrap();
        tls.set_verify_purpose("sslserver").unwrap();
        assert!(matches!(
            tls.set_verify_purpose("not-a-purpose"),
            Err(Error::BadArgument)
        ));
    }

    #[test]
    fn crl_requires_pem() {
        let mut tls = TlsContext::new(TlsMethod::Tls).unwrap();
        assert!(matches!(tls.add_crl_pem("garbage"), Err(Error::BadFormat)));
    }

    #[test]
    fn ca_path_must_be_directory() {
        let mut tls = TlsContext::new(TlsMethod::Tls).unwrap();
        assert!(matches!(
            tls.add_ca_path(Path::new("/definitely/not/here")),
            Err(Error::NotADirectory)
        ));
    }

    #[test]
    fn connection_setup_state_machine() {
        let mut tls = TlsContext::new(TlsMethod::Tls).unwrap();
        tls.set_selfsigned("conn-test").unwrap();
        tls.set_session_reuse(true).unwrap();

        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();

        let mut conn = TlsConnection::client(&mut tls, a, peer()).unwrap();
        conn.set_verify_server("example.com").unwrap();
        // Empty cache: nothing to install, still OK.
        conn.reuse_session().unwrap();
        assert!(!conn.session_reused());

        // Nonblocking with a silent peer: the client writes its hello and
        // then wants to read.
        assert_eq!(conn.handshake().unwrap(), HandshakeStatus::WantRead);
        // Pre-handshake setters are now rejected.
        assert!(conn.reuse_session().is_err());
    }

    #[test]
    fn keyfile_constructor_loads_credential() {
        // Certificate followed by the private key, the usual bundle layout.
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let cert = cert::generate_selfsigned("keyfile-host", &key).unwrap();
        let mut bundle = cert.to_pem().unwrap();
        bundle.extend_from_slice(&key.private_key_to_pem_pkcs8().unwrap());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cred.pem");
        std::fs::write(&path, &bundle).unwrap();

        let tls = TlsContext::with_keyfile(TlsMethod::Tls, &path, None).unwrap();
        assert_eq!(tls.method(), TlsMethod::Tls);

        assert!(matches!(
            TlsContext::with_keyfile(TlsMethod::Tls, Path::new("/no/such/file"), None),
            Err(Error::BadArgument)
        ));
    }
}
