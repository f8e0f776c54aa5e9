//! Certificate helpers: self-signed generation, fingerprints, name
//! rendering.

use crate::error::{Error, Result};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKeyRef, Private};
use openssl::x509::{X509NameBuilder, X509NameRef, X509Ref, X509};
use std::time::SystemTime;

/// Certificate digest algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintAlg {
    Sha1,
    Sha256,
}

impl FingerprintAlg {
    pub fn digest_len(self) -> usize {
        match self {
            FingerprintAlg::Sha1 => 20,
            FingerprintAlg::Sha256 => 32,
        }
    }

    fn message_digest(self) -> MessageDigest {
        match self {
            FingerprintAlg::Sha1 => MessageDigest::sha1(),
            FingerprintAlg::Sha256 => MessageDigest::sha256(),
        }
    }
}

/// Build a self-signed X.509 v3 certificate for `key`.
///
/// Subject and issuer carry a single CN attribute; validity runs from one
/// year ago to ten years ahead; the serial is a random 32-bit number; the
/// signature is SHA-256.
pub(crate) fn generate_selfsigned(cn: &str, key: &PKeyRef<Private>) -> Result<X509> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", cn).map_err(|e| {
        tracing::warn!(cn, error = %e, "invalid common name");
        Error::BadArgument
    })?;
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;

    let mut serial_bytes = [0u8; 4];
    openssl::rand::rand_bytes(&mut serial_bytes)?;
    let serial = BigNum::from_u32(u32::from_be_bytes(serial_bytes))?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;

    builder.set_issuer_name(&name)?;
    builder.set_subject_name(&name)?;

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let not_before = Asn1Time::from_unix(now - 3600 * 24 * 365)?;
    let not_after = Asn1Time::from_unix(now + 3600 * 24 * 365 * 10)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    builder.set_pubkey(key)?;
    builder.sign(key, MessageDigest::sha256())?;

    Ok(builder.build())
}

/// Known named curves for EC credentials.
pub(crate) fn curve_nid(name: &str) -> Option<Nid> {
    match name {
        "prime256v1" | "P-256" => Some(Nid::X9_62_PRIME256V1),
        "secp384r1" | "P-384" => Some(Nid::SECP384R1),
        "secp521r1" | "P-521" => Some(Nid::SECP521R1),
        "secp256k1" => Some(Nid::SECP256K1),
        _ => None,
    }
}

/// Digest a certificate into `out`.
///
/// A buffer smaller than the digest yields `Overflow` and leaves `out`
/// untouched.
pub(crate) fn fingerprint(cert: &X509Ref, alg: FingerprintAlg, out: &mut [u8]) -> Result<usize> {
    if out.len() < alg.digest_len() {
        return Err(Error::Overflow);
    }

    let digest = cert.digest(alg.message_digest())?;
    out[..digest.len()].copy_from_slice(&digest);
    Ok(digest.len())
}

/// Render an X.509 name in RFC 2253 form.
///
/// RFC 2253 lists RDNs most-specific first, the reverse of the certificate
/// encoding order.
pub(crate) fn name_rfc2253(name: &X509NameRef) -> Result<String> {
    let mut parts = Vec::new();
    for entry in name.entries() {
        let key = entry
            .object()
            .nid()
            .short_name()
            .map_err(|_| Error::NotSupported)?;
        let value = entry.data().as_utf8()?;
        parts.push(format!("{}={}", key, escape_rfc2253(&value)));
    }
    parts.reverse();
    Ok(parts.join(","))
}

fn escape_rfc2253(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let mut out = String::with_capacity(value.len());
    for (i, &c) in chars.iter().enumerate() {
        let special = matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';')
            || (i == 0 && (c == '#' || c == ' '))
            || (i + 1 == chars.len() && c == ' ');
        if special {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;

    fn test_key() -> PKey<Private> {
        PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
    }

    #[test]
    fn selfsigned_subject_round_trip() {
        let key = test_key();
        let cert = generate_selfsigned("x", &key).unwrap();

        let subject = name_rfc2253(cert.subject_name()).unwrap();
        assert!(subject.contains("CN=x"), "subject was {subject}");
        // Self-signed: issuer equals subject.
        assert_eq!(subject, name_rfc2253(cert.issuer_name()).unwrap());
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let key = test_key();
        let cert = generate_selfsigned("fp-test", &key).unwrap();

        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        assert_eq!(fingerprint(&cert, FingerprintAlg::Sha256, &mut a).unwrap(), 32);
        assert_eq!(fingerprint(&cert, FingerprintAlg::Sha256, &mut b).unwrap(), 32);
        assert_eq!(a, b);

        let mut sha1 = [0u8; 20];
        assert_eq!(fingerprint(&cert, FingerprintAlg::Sha1, &mut sha1).unwrap(), 20);
    }

    #[test]
    fn short_buffer_is_untouched() {
        let key = test_key();
        let cert = generate_selfsigned("short", &key).unwrap();

        let mut out = [0xaau8; 16];
        assert!(matches!(
            fingerprint(&cert, FingerprintAlg::Sha256, &mut out),
            Err(Error::Overflow)
        ));
        assert_eq!(out, [0xaau8; 16]);
    }

    #[test]
    fn rfc2253_escapes_specials() {
        assert_eq!(escape_rfc2253("a,b"), "a\\,b");
        assert_eq!(escape_rfc2253("#lead"), "\\#lead");
        assert_eq!(escape_rfc2253("trail "), "trail\\ ");
        assert_eq!(escape_rfc2253("plain"), "plain");
    }

    #[test]
    fn known_curves_resolve() {
        assert_eq!(curve_nid("prime256v1"), Some(Nid::X9_62_PRIME256V1));
        assert_eq!(curve_nid("secp384r1"), Some(Nid::SECP384R1));
        assert_eq!(curve_nid("nonesuch"), None);
    }
}
