//! Bindings for OpenSSL functions not exposed by the `openssl-sys` version
//! this crate depends on. Both symbols are present in linked libssl/libcrypto.

use libc::c_int;
use openssl_sys::{SSL_SESSION, X509_CRL, X509_STORE};

extern "C" {
    pub(crate) fn SSL_SESSION_is_resumable(session: *const SSL_SESSION) -> c_int;
    pub(crate) fn X509_STORE_add_crl(store: *mut X509_STORE, crl: *mut X509_CRL) -> c_int;
}
