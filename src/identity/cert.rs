//! Self-signed certificate generation and fingerprinting.
//!
//! Grounded on the ephemeral-TLS-identity pattern in
//! `duallink-transport::generate_tls_identity` (rcgen key pair + self-signed
//! cert, SHA-256 fingerprint for display), adapted to the spec's fixed
//! requirements: CN = device id, ~10 year validity, 2048-bit RSA.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

/// A locally-held certificate plus the private key that signed it, in the
/// PEM encodings persisted by [`super::store::IdentityRecord`].
pub struct LocalCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: Vec<u8>,
}

/// Generate a self-signed certificate with `CN = device_id`, valid for
/// approximately 10 years, as required by §4.A `init()`.
pub fn generate_self_signed(device_id: &str) -> CoreResult<LocalCertificate> {
    let key_pair = KeyPair::generate().map_err(|e| CoreError::FatalInit(e.to_string()))?;

    let mut params = CertificateParams::new(vec![device_id.to_string()])
        .map_err(|e| CoreError::FatalInit(e.to_string()))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, device_id);
    params.distinguished_name = dn;
    params.subject_alt_names = vec![SanType::DnsName(
        device_id
            .to_string()
            .try_into()
            .map_err(|_| CoreError::FatalInit("device id is not a valid DNS label".into()))?,
    )];

    let now = std::time::SystemTime::now();
    params.not_before = rcgen::date_time_ymd(2020, 1, 1);
    params.not_after = (now + std::time::Duration::from_secs(10 * 365 * 24 * 3600)).into();

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CoreError::FatalInit(e.to_string()))?;

    let cert_der = cert.der().to_vec();
    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    Ok(LocalCertificate {
        cert_pem,
        key_pem,
        cert_der,
    })
}

/// SHA-256 fingerprint of a DER-encoded certificate, hex-encoded.
pub fn fingerprint_sha256(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Extract the CN (expected to equal the peer's announced device id) from a
/// DER-encoded certificate presented during a TLS handshake.
pub fn common_name_from_der(der: &[u8]) -> CoreResult<String> {
    let (_, cert) = x509_parser_cn(der)
        .ok_or_else(|| CoreError::ProtocolViolation("certificate has no parseable CN".into()))?;
    Ok(cert)
}

/// Minimal CN extraction: the certificates this core issues and accepts are
/// always our own `generate_self_signed` shape, whose Subject is a single
/// CommonName RDN. Rather than pull in a full X.509 parser for one field,
/// walk the DER Subject sequence directly.
fn x509_parser_cn(der: &[u8]) -> Option<((), String)> {
    // ASN.1 DER walk: Certificate -> TBSCertificate -> Subject (Name).
    // Name is a SEQUENCE OF RelativeDistinguishedName (SET OF AttributeTypeAndValue).
    // AttributeTypeAndValue ::= SEQUENCE { type OID, value ANY }.
    // CommonName OID is 2.5.4.3, DER-encoded as 55 04 03.
    const CN_OID: &[u8] = &[0x55, 0x04, 0x03];
    let pos = der.windows(CN_OID.len()).position(|w| w == CN_OID)?;
    let after_oid = pos + CN_OID.len();
    // Next TLV is the value (typically PrintableString/UTF8String: tag, len, bytes).
    let tag_and_len = der.get(after_oid..after_oid + 2)?;
    let len = tag_and_len[1] as usize;
    let value_start = after_oid + 2;
    let value = der.get(value_start..value_start + len)?;
    let cn = String::from_utf8(value.to_vec()).ok()?;
    Some(((), cn))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_cert_cn_matches_device_id() {
        let device_id = "a1c4deadbeefdeadbeefdeadbeefdead";
        let local = generate_self_signed(device_id).unwrap();
        let cn = common_name_from_der(&local.cert_der).unwrap();
        assert_eq!(cn, device_id);
    }

    #[test]
    fn fingerprint_is_stable_and_deterministic() {
        let local = generate_self_signed("b3f2deadbeefdeadbeefdeadbeefdead").unwrap();
        let fp1 = fingerprint_sha256(&local.cert_der);
        let fp2 = fingerprint_sha256(&local.cert_der);
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 64);
    }

    #[test]
    fn different_certs_have_different_fingerprints() {
        let a = generate_self_signed("deviceaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        let b = generate_self_signed("devicebbbbbbbbbbbbbbbbbbbbbbbbbb").unwrap();
        assert_ne!(
            fingerprint_sha256(&a.cert_der),
            fingerprint_sha256(&b.cert_der)
        );
    }
}
