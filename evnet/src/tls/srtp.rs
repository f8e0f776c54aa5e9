//! SRTP keying-material export for DTLS-SRTP.
//!
//! After the handshake, keys are derived from the TLS master secret with the
//! fixed extractor label and empty context, then split as client-key,
//! server-key, client-salt, server-salt. Key and salt sizes follow from the
//! negotiated protection profile.

use crate::error::{Error, Result};
use openssl::srtp::SrtpProfileId;
use openssl::ssl::SslRef;

const EXTRACTOR_LABEL: &str = "EXTRACTOR-dtls_srtp";

/// Negotiated SRTP protection suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtpSuite {
    AesCm128HmacSha1_80,
    AesCm128HmacSha1_32,
    Aes128Gcm,
    Aes256Gcm,
}

impl SrtpSuite {
    pub fn name(self) -> &'static str {
        match self {
            SrtpSuite::AesCm128HmacSha1_80 => "AES_CM_128_HMAC_SHA1_80",
            SrtpSuite::AesCm128HmacSha1_32 => "AES_CM_128_HMAC_SHA1_32",
            SrtpSuite::Aes128Gcm => "AES_128_GCM",
            SrtpSuite::Aes256Gcm => "AES_256_GCM",
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            SrtpSuite::AesCm128HmacSha1_80 | SrtpSuite::AesCm128HmacSha1_32 => 16,
            SrtpSuite::Aes128Gcm => 16,
            SrtpSuite::Aes256Gcm => 32,
        }
    }

    pub fn salt_len(self) -> usize {
        match self {
            SrtpSuite::AesCm128HmacSha1_80 | SrtpSuite::AesCm128HmacSha1_32 => 14,
            SrtpSuite::Aes128Gcm | SrtpSuite::Aes256Gcm => 12,
        }
    }
}

/// Keying material for one DTLS-SRTP association.
///
/// Each side's material is `key || salt`, `key_len + salt_len` bytes.
#[derive(Debug, Clone)]
pub struct SrtpKeyInfo {
    pub suite: SrtpSuite,
    pub client_material: Vec<u8>,
    pub server_material: Vec<u8>,
}

pub(crate) fn keyinfo(ssl: &SslRef) -> Result<SrtpKeyInfo> {
    let profile = ssl.selected_srtp_profile().ok_or(Error::NotFound)?;
    let id = profile.id();

    let suite = if id == SrtpProfileId::SRTP_AES128_CM_SHA1_80 {
        SrtpSuite::AesCm128HmacSha1_80
    } else if id == SrtpProfileId::SRTP_AES128_CM_SHA1_32 {
        SrtpSuite::AesCm128HmacSha1_32
    } else if id == SrtpProfileId::SRTP_AEAD_AES_128_GCM {
        SrtpSuite::Aes128Gcm
    } else if id == SrtpProfileId::SRTP_AEAD_AES_256_GCM {
        SrtpSuite::Aes256Gcm
    } else {
        return Err(Error::NotSupported);
    };

    let key_len = suite.key_len();
    let salt_len = suite.salt_len();
    let size = key_len + salt_len;

    // Layout: client_key || server_key || client_salt || server_salt.
    let mut keymat = vec![0u8; 2 * size];
    ssl.export_keying_material(&mut keymat, EXTRACTOR_LABEL, None)
        .map_err(|e| {
            tracing::warn!(error = %e, "srtp key export failed");
            Error::NotFound
        })?;

    let mut client_material = Vec::with_capacity(size);
    client_material.extend_from_slice(&keymat[..key_len]);
    client_material.extend_from_slice(&keymat[2 * key_len..2 * key_len + salt_len]);

    let mut server_material = Vec::with_capacity(size);
    server_material.extend_from_slice(&keymat[key_len..2 * key_len]);
    server_material.extend_from_slice(&keymat[2 * key_len + salt_len..]);

    Ok(SrtpKeyInfo {
        suite,
        client_material,
        server_material,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suite_sizes_follow_profile() {
        assert_eq!(SrtpSuite::AesCm128HmacSha1_80.key_len(), 16);
        assert_eq!(SrtpSuite::AesCm128HmacSha1_80.salt_len(), 14);
        assert_eq!(SrtpSuite::AesCm128HmacSha1_32.key_len(), 16);
        assert_eq!(SrtpSuite::AesCm128HmacSha1_32.salt_len(), 14);
        assert_eq!(SrtpSuite::Aes128Gcm.key_len(), 16);
        assert_eq!(SrtpSuite::Aes128Gcm.salt_len(), 12);
        assert_eq!(SrtpSuite::Aes256Gcm.key_len(), 32);
        assert_eq!(SrtpSuite::Aes256Gcm.salt_len(), 12);
    }

    #[test]
    fn suite_names_match_srtp_registry() {
        assert_eq!(SrtpSuite::AesCm128HmacSha1_80.name(), "AES_CM_128_HMAC_SHA1_80");
        assert_eq!(SrtpSuite::Aes256Gcm.name(), "AES_256_GCM");
    }
}
