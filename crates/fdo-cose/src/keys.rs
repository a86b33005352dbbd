//! Signing keys and verification-key decoding.
//!
//! [`SignKey`] holds the private half for the key types the FDO registry
//! fixes (ECDSA P-256/P-384, RSA PKCS#1 v1.5, RSA-PSS). [`VerifyKey`] is
//! its public counterpart, decodable from every wire encoding of the
//! [`PublicKey`] union: X.509 SPKI, COSE_Key, X5CHAIN, and the raw RSA
//! modulus/exponent form.

use coset::iana::EnumI64;
use coset::{iana, CborSerializable, CoseKeyBuilder, Label};
use p256::pkcs8::{DecodePublicKey as _, EncodePublicKey as _};
use rand::rngs::OsRng;
use rsa::pkcs8::DecodePublicKey as _;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde_bytes::ByteBuf;
use sha2::Sha256;
use x509_parser::prelude::FromDer;

use fdo_types::{DeviceCertChain, KeyEncoding, KeyType, PublicKey};

use crate::{CoseError, Result};

/// A private signing key for COSE_Sign1 structures.
pub enum SignKey {
    /// ECDSA over P-256 (ES256).
    Es256(p256::ecdsa::SigningKey),
    /// ECDSA over P-384 (ES384).
    Es384(p384::ecdsa::SigningKey),
    /// RSA PKCS#1 v1.5 with SHA-256 (RS256). Also used for the
    /// restricted 2048-bit manufacturing key type.
    RsaPkcs(Box<RsaPrivateKey>),
    /// RSA-PSS with SHA-256 (PS256).
    RsaPss(Box<RsaPrivateKey>),
}

impl SignKey {
    /// Generate a fresh ES256 key.
    pub fn generate_es256() -> Self {
        SignKey::Es256(p256::ecdsa::SigningKey::random(&mut OsRng))
    }

    /// Generate a fresh ES384 key.
    pub fn generate_es384() -> Self {
        SignKey::Es384(p384::ecdsa::SigningKey::random(&mut OsRng))
    }

    /// Load an ES256 key from a PKCS#8 DER blob (device attestation
    /// keys, provisioning tools).
    pub fn es256_from_pkcs8_der(der: &[u8]) -> Result<Self> {
        use p256::pkcs8::DecodePrivateKey as _;
        p256::ecdsa::SigningKey::from_pkcs8_der(der)
            .map(SignKey::Es256)
            .map_err(|e| CoseError::InvalidKey(e.to_string()))
    }

    /// FDO key type of this key.
    pub fn key_type(&self) -> KeyType {
        match self {
            SignKey::Es256(_) => KeyType::SecP256,
            SignKey::Es384(_) => KeyType::SecP384,
            SignKey::RsaPkcs(_) => KeyType::RsaPkcs,
            SignKey::RsaPss(_) => KeyType::RsaPss,
        }
    }

    /// COSE algorithm for the Sign1 protected header.
    pub fn cose_alg(&self) -> iana::Algorithm {
        match self {
            SignKey::Es256(_) => iana::Algorithm::ES256,
            SignKey::Es384(_) => iana::Algorithm::ES384,
            SignKey::RsaPkcs(_) => iana::Algorithm::RS256,
            SignKey::RsaPss(_) => iana::Algorithm::PS256,
        }
    }

    /// Sign raw bytes (a COSE `Sig_structure`).
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            SignKey::Es256(key) => {
                let sig: p256::ecdsa::Signature = key.sign(data);
                Ok(sig.to_bytes().to_vec())
            }
            SignKey::Es384(key) => {
                let sig: p384::ecdsa::Signature = key.sign(data);
                Ok(sig.to_bytes().to_vec())
            }
            SignKey::RsaPkcs(key) => {
                let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new((**key).clone());
                Ok(signer.sign(data).to_vec())
            }
            SignKey::RsaPss(key) => {
                let signer = rsa::pss::BlindedSigningKey::<Sha256>::new((**key).clone());
                Ok(signer.sign_with_rng(&mut OsRng, data).to_vec())
            }
        }
    }

    /// The wire public key for this signing key in the given encoding.
    ///
    /// X.509 SPKI is supported for every key type; COSE_Key for the EC
    /// types; the raw modulus/exponent form for the RSA types.
    pub fn public_key(&self, enc: KeyEncoding) -> Result<PublicKey> {
        let body = match (self, enc) {
            (SignKey::Es256(key), KeyEncoding::X509) => key
                .verifying_key()
                .to_public_key_der()
                .map_err(|e| CoseError::InvalidKey(e.to_string()))?
                .into_vec(),
            (SignKey::Es384(key), KeyEncoding::X509) => key
                .verifying_key()
                .to_public_key_der()
                .map_err(|e| CoseError::InvalidKey(e.to_string()))?
                .into_vec(),
            (SignKey::RsaPkcs(key) | SignKey::RsaPss(key), KeyEncoding::X509) => {
                RsaPublicKey::from(&**key)
                    .to_public_key_der()
                    .map_err(|e| CoseError::InvalidKey(e.to_string()))?
                    .into_vec()
            }
            (SignKey::Es256(key), KeyEncoding::CoseKey) => {
                let point = key.verifying_key().to_encoded_point(false);
                let x = point.x().map(|x| x.to_vec()).unwrap_or_default();
                let y = point.y().map(|y| y.to_vec()).unwrap_or_default();
                CoseKeyBuilder::new_ec2_pub_key(iana::EllipticCurve::P_256, x, y)
                    .build()
                    .to_vec()?
            }
            (SignKey::Es384(key), KeyEncoding::CoseKey) => {
                let point = key.verifying_key().to_encoded_point(false);
                let x = point.x().map(|x| x.to_vec()).unwrap_or_default();
                let y = point.y().map(|y| y.to_vec()).unwrap_or_default();
                CoseKeyBuilder::new_ec2_pub_key(iana::EllipticCurve::P_384, x, y)
                    .build()
                    .to_vec()?
            }
            (SignKey::RsaPkcs(key) | SignKey::RsaPss(key), KeyEncoding::Crypto) => {
                let public = RsaPublicKey::from(&**key);
                fdo_cbor::to_vec(&(
                    ByteBuf::from(public.n().to_bytes_be()),
                    ByteBuf::from(public.e().to_bytes_be()),
                ))?
            }
            _ => {
                return Err(CoseError::InvalidKey(format!(
                    "unsupported encoding {enc:?} for key type {:?}",
                    self.key_type()
                )))
            }
        };
        Ok(PublicKey::new(self.key_type(), enc, body))
    }

    /// The public verifier for this key.
    pub fn verifier(&self) -> VerifyKey {
        match self {
            SignKey::Es256(key) => VerifyKey::Es256(*key.verifying_key()),
            SignKey::Es384(key) => VerifyKey::Es384(*key.verifying_key()),
            SignKey::RsaPkcs(key) => VerifyKey::RsaPkcs(RsaPublicKey::from(&**key)),
            SignKey::RsaPss(key) => VerifyKey::RsaPss(RsaPublicKey::from(&**key)),
        }
    }
}

/// A public verification key decoded from the wire union.
#[derive(Clone, Debug)]
pub enum VerifyKey {
    Es256(p256::ecdsa::VerifyingKey),
    Es384(p384::ecdsa::VerifyingKey),
    RsaPkcs(RsaPublicKey),
    RsaPss(RsaPublicKey),
}

impl VerifyKey {
    /// Decode the wire public-key union into a concrete verifier.
    pub fn from_public_key(pk: &PublicKey) -> Result<Self> {
        let spki: Vec<u8> = match pk.enc {
            KeyEncoding::X509 => pk.body.to_vec(),
            KeyEncoding::X5Chain => {
                let certs: Vec<ByteBuf> = fdo_cbor::from_slice(&pk.body)?;
                let leaf = certs
                    .first()
                    .ok_or_else(|| CoseError::InvalidKey("empty X5CHAIN".into()))?;
                spki_from_cert(leaf)?
            }
            KeyEncoding::CoseKey => return Self::from_cose_key_body(pk),
            KeyEncoding::Crypto => return Self::from_rsa_crypto_body(pk),
        };
        Self::from_spki(pk.key_type, &spki)
    }

    /// Decode the leaf certificate of a device chain into the device's
    /// attestation verifier.
    pub fn from_cert_chain_leaf(chain: &DeviceCertChain) -> Result<Self> {
        let leaf = chain
            .first()
            .ok_or_else(|| CoseError::InvalidKey("empty certificate chain".into()))?;
        let spki = spki_from_cert(leaf)?;
        // The curve is determined by the SPKI itself; try P-256 first.
        if let Ok(key) = p256::ecdsa::VerifyingKey::from_public_key_der(&spki) {
            return Ok(VerifyKey::Es256(key));
        }
        if let Ok(key) = p384::ecdsa::VerifyingKey::from_public_key_der(&spki) {
            return Ok(VerifyKey::Es384(key));
        }
        if let Ok(key) = RsaPublicKey::from_public_key_der(&spki) {
            return Ok(VerifyKey::RsaPkcs(key));
        }
        Err(CoseError::InvalidKey("unsupported leaf certificate key".into()))
    }

    fn from_spki(key_type: KeyType, spki: &[u8]) -> Result<Self> {
        match key_type {
            KeyType::SecP256 => p256::ecdsa::VerifyingKey::from_public_key_der(spki)
                .map(VerifyKey::Es256)
                .map_err(|e| CoseError::InvalidKey(e.to_string())),
            KeyType::SecP384 => p384::ecdsa::VerifyingKey::from_public_key_der(spki)
                .map(VerifyKey::Es384)
                .map_err(|e| CoseError::InvalidKey(e.to_string())),
            KeyType::Rsa2048Restr | KeyType::RsaPkcs => RsaPublicKey::from_public_key_der(spki)
                .map(VerifyKey::RsaPkcs)
                .map_err(|e| CoseError::InvalidKey(e.to_string())),
            KeyType::RsaPss => RsaPublicKey::from_public_key_der(spki)
                .map(VerifyKey::RsaPss)
                .map_err(|e| CoseError::InvalidKey(e.to_string())),
        }
    }

    fn from_cose_key_body(pk: &PublicKey) -> Result<Self> {
        let cose_key = coset::CoseKey::from_slice(&pk.body)?;
        let x = cose_key_param(&cose_key, -2)?;
        let y = cose_key_param(&cose_key, -3)?;
        match pk.key_type {
            KeyType::SecP256 => {
                let x = p256::FieldBytes::from_exact_iter(x.iter().copied())
                    .ok_or_else(|| CoseError::InvalidKey("bad x coordinate".into()))?;
                let y = p256::FieldBytes::from_exact_iter(y.iter().copied())
                    .ok_or_else(|| CoseError::InvalidKey("bad y coordinate".into()))?;
                let point = p256::EncodedPoint::from_affine_coordinates(&x, &y, false);
                p256::ecdsa::VerifyingKey::from_encoded_point(&point)
                    .map(VerifyKey::Es256)
                    .map_err(|e| CoseError::InvalidKey(e.to_string()))
            }
            KeyType::SecP384 => {
                let x = p384::FieldBytes::from_exact_iter(x.iter().copied())
                    .ok_or_else(|| CoseError::InvalidKey("bad x coordinate".into()))?;
                let y = p384::FieldBytes::from_exact_iter(y.iter().copied())
                    .ok_or_else(|| CoseError::InvalidKey("bad y coordinate".into()))?;
                let point = p384::EncodedPoint::from_affine_coordinates(&x, &y, false);
                p384::ecdsa::VerifyingKey::from_encoded_point(&point)
                    .map(VerifyKey::Es384)
                    .map_err(|e| CoseError::InvalidKey(e.to_string()))
            }
            _ => Err(CoseError::InvalidKey("COSE_Key encoding is EC-only".into())),
        }
    }

    fn from_rsa_crypto_body(pk: &PublicKey) -> Result<Self> {
        if !pk.is_rsa() {
            return Err(CoseError::InvalidKey("crypto encoding is RSA-only".into()));
        }
        let (n, e): (ByteBuf, ByteBuf) = fdo_cbor::from_slice(&pk.body)?;
        let key = RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
            .map_err(|e| CoseError::InvalidKey(e.to_string()))?;
        match pk.key_type {
            KeyType::RsaPss => Ok(VerifyKey::RsaPss(key)),
            _ => Ok(VerifyKey::RsaPkcs(key)),
        }
    }

    /// COSE algorithm this verifier expects in the protected header.
    pub fn cose_alg(&self) -> iana::Algorithm {
        match self {
            VerifyKey::Es256(_) => iana::Algorithm::ES256,
            VerifyKey::Es384(_) => iana::Algorithm::ES384,
            VerifyKey::RsaPkcs(_) => iana::Algorithm::RS256,
            VerifyKey::RsaPss(_) => iana::Algorithm::PS256,
        }
    }

    /// Verify a raw signature over `data`. All failures collapse to
    /// [`CoseError::Verification`].
    pub fn verify(&self, data: &[u8], sig: &[u8]) -> Result<()> {
        match self {
            VerifyKey::Es256(key) => {
                let sig = p256::ecdsa::Signature::from_slice(sig).map_err(|_| CoseError::Verification)?;
                rsa::signature::Verifier::verify(key, data, &sig).map_err(|_| CoseError::Verification)
            }
            VerifyKey::Es384(key) => {
                let sig = p384::ecdsa::Signature::from_slice(sig).map_err(|_| CoseError::Verification)?;
                rsa::signature::Verifier::verify(key, data, &sig).map_err(|_| CoseError::Verification)
            }
            VerifyKey::RsaPkcs(key) => {
                let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key.clone());
                let sig = rsa::pkcs1v15::Signature::try_from(sig).map_err(|_| CoseError::Verification)?;
                verifier.verify(data, &sig).map_err(|_| CoseError::Verification)
            }
            VerifyKey::RsaPss(key) => {
                let verifier = rsa::pss::VerifyingKey::<Sha256>::new(key.clone());
                let sig = rsa::pss::Signature::try_from(sig).map_err(|_| CoseError::Verification)?;
                verifier.verify(data, &sig).map_err(|_| CoseError::Verification)
            }
        }
    }
}

fn cose_key_param(key: &coset::CoseKey, label: i64) -> Result<Vec<u8>> {
    key.params
        .iter()
        .find(|(l, _)| *l == Label::Int(label))
        .and_then(|(_, v)| v.as_bytes().cloned())
        .ok_or_else(|| CoseError::InvalidKey(format!("missing COSE_Key param {label}")))
}

/// Wrap a device certificate chain as an X5CHAIN wire public key,
/// deriving the key type from the leaf.
pub fn x5chain_public_key(chain: &DeviceCertChain) -> Result<PublicKey> {
    let key_type = match VerifyKey::from_cert_chain_leaf(chain)? {
        VerifyKey::Es256(_) => KeyType::SecP256,
        VerifyKey::Es384(_) => KeyType::SecP384,
        VerifyKey::RsaPkcs(_) => KeyType::RsaPkcs,
        VerifyKey::RsaPss(_) => KeyType::RsaPss,
    };
    Ok(PublicKey::new(
        key_type,
        KeyEncoding::X5Chain,
        fdo_cbor::to_vec(chain)?,
    ))
}

fn spki_from_cert(der: &[u8]) -> Result<Vec<u8>> {
    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(der)
        .map_err(|e| CoseError::InvalidKey(e.to_string()))?;
    Ok(cert.public_key().raw.to_vec())
}

/// Keep the iana helper trait in use for algorithm lookups by suite
/// integer.
pub fn algorithm_from_i64(alg: i64) -> Option<iana::Algorithm> {
    iana::Algorithm::from_i64(alg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_es256_sign_verify() {
        let key = SignKey::generate_es256();
        let sig = key.sign(b"structure").expect("sign");
        key.verifier().verify(b"structure", &sig).expect("verify");
    }

    #[test]
    fn test_es256_verify_rejects_tamper() {
        let key = SignKey::generate_es256();
        let mut sig = key.sign(b"structure").expect("sign");
        sig[7] ^= 0x01;
        assert!(key.verifier().verify(b"structure", &sig).is_err());
        let sig = key.sign(b"structure").expect("sign");
        assert!(key.verifier().verify(b"structurf", &sig).is_err());
    }

    #[test]
    fn test_x509_roundtrip_es256() {
        let key = SignKey::generate_es256();
        let pk = key.public_key(KeyEncoding::X509).expect("encode");
        assert_eq!(pk.key_type, KeyType::SecP256);
        let verifier = VerifyKey::from_public_key(&pk).expect("decode");
        let sig = key.sign(b"data").expect("sign");
        verifier.verify(b"data", &sig).expect("verify");
    }

    #[test]
    fn test_cose_key_roundtrip_es384() {
        let key = SignKey::generate_es384();
        let pk = key.public_key(KeyEncoding::CoseKey).expect("encode");
        let verifier = VerifyKey::from_public_key(&pk).expect("decode");
        let sig = key.sign(b"data").expect("sign");
        verifier.verify(b"data", &sig).expect("verify");
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = SignKey::generate_es256();
        let b = SignKey::generate_es256();
        let sig = a.sign(b"data").expect("sign");
        assert!(b.verifier().verify(b"data", &sig).is_err());
    }

    #[test]
    fn test_x5chain_leaf_decoding() {
        let ca = fdo_crypto::cert::ManufacturerCa::generate("Test CA").expect("ca");
        let device = fdo_crypto::cert::DeviceAttestation::generate("sn-1").expect("dev");
        let chain = ca.sign_device_certificate(&device.csr_der).expect("sign");

        let verifier = VerifyKey::from_cert_chain_leaf(&chain).expect("leaf");
        // rcgen generates ECDSA P-256 by default.
        assert!(matches!(verifier, VerifyKey::Es256(_)));
    }
}
