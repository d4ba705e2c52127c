use observatory_core::KeyType;
use thiserror::Error;
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
const OID_RSASSA_PSS: &str = "1.2.840.113549.1.1.10";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_DSA: &str = "1.2.840.10040.4.1";
const OID_DH_PUBLIC_NUMBER: &str = "1.2.840.10046.2.1";
const OID_DH_KEY_AGREEMENT: &str = "1.2.840.113549.1.3.1";

/// Named curves by the content octets of their OID.
const NAMED_CURVES: &[(&[u8], u32)] = &[
    (&[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07], 256), // prime256v1
    (&[0x2B, 0x81, 0x04, 0x00, 0x22], 384),                   // secp384r1
    (&[0x2B, 0x81, 0x04, 0x00, 0x23], 521),                   // secp521r1
    (&[0x2B, 0x81, 0x04, 0x00, 0x0A], 256),                   // secp256k1
    (&[0x2B, 0x81, 0x04, 0x00, 0x21], 224),                   // secp224r1
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifyError {
    #[error("unsupported public key algorithm {0}")]
    UnsupportedKeyAlgorithm(String),
    #[error("certificate DER could not be decoded")]
    Undecodable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInfo {
    pub key_type: KeyType,
    pub bit_length: u32,
}

/// Maps a certificate to its public-key family and size.
pub trait CertificateClassifier {
    fn classify(&self, der: &[u8]) -> Result<KeyInfo, ClassifyError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct X509Classifier;

impl CertificateClassifier for X509Classifier {
    fn classify(&self, der: &[u8]) -> Result<KeyInfo, ClassifyError> {
        let (_, cert) = X509Certificate::from_der(der).map_err(|_| ClassifyError::Undecodable)?;
        classify_spki(cert.public_key())
    }
}

fn classify_spki(spki: &SubjectPublicKeyInfo<'_>) -> Result<KeyInfo, ClassifyError> {
    let oid = spki.algorithm.algorithm.to_id_string();
    let params: Option<&[u8]> = spki.algorithm.parameters.as_ref().map(|p| p.data.as_ref());
    let public_value: &[u8] = spki.subject_public_key.data.as_ref();
    let (key_type, bits) = match oid.as_str() {
        OID_RSA_ENCRYPTION | OID_RSASSA_PSS => match spki.parsed() {
            Ok(PublicKey::RSA(rsa)) => (KeyType::Rsa, rsa.key_size() as u32),
            _ => return Err(ClassifyError::Undecodable),
        },
        OID_EC_PUBLIC_KEY => {
            let named = params.and_then(|p| NAMED_CURVES.iter().find(|(curve, _)| *curve == p).map(|(_, bits)| *bits));
            let bits = match (named, spki.parsed()) {
                (Some(bits), _) => bits,
                (None, Ok(PublicKey::EC(point))) => point.key_size() as u32,
                (None, _) => return Err(ClassifyError::Undecodable),
            };
            (KeyType::Ec, bits)
        }
        OID_DSA => (KeyType::Dsa, prime_bits(params, public_value)?),
        OID_DH_PUBLIC_NUMBER | OID_DH_KEY_AGREEMENT => (KeyType::Dh, prime_bits(params, public_value)?),
        _ => return Err(ClassifyError::UnsupportedKeyAlgorithm(oid)),
    };
    Ok(KeyInfo { key_type, bit_length: bits })
}

/// Size of `p`, the first INTEGER of the domain parameters, falling back to
/// the public value when parameters are inherited.
fn prime_bits(params: Option<&[u8]>, public_value: &[u8]) -> Result<u32, ClassifyError> {
    params
        .and_then(der_integer_bits)
        .or_else(|| der_integer_bits(public_value))
        .ok_or(ClassifyError::Undecodable)
}

/// Significant bits of the DER INTEGER at the start of `der`.
fn der_integer_bits(der: &[u8]) -> Option<u32> {
    if *der.first()? != 0x02 {
        return None;
    }
    let first_len = *der.get(1)?;
    let (len, start) = if first_len & 0x80 == 0 {
        (usize::from(first_len), 2)
    } else {
        let n = usize::from(first_len & 0x7F);
        if n == 0 || n > 4 {
            return None;
        }
        let len = der.get(2..2 + n)?.iter().fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
        (len, 2 + n)
    };
    let value = der.get(start..start + len)?;
    let significant = value.iter().position(|b| *b != 0).map(|i| &value[i..])?;
    let bits = (significant.len() - 1) * 8 + (8 - significant[0].leading_zeros() as usize);
    u32::try_from(bits).ok()
}
