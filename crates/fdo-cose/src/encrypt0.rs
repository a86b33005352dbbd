//! The TO2 encrypted tunnel: `COSE_Encrypt0` sealing and opening.
//!
//! Authenticated-encryption suites produce a bare `Encrypt0` whose AAD is
//! the COSE `Enc_structure`. The encrypt-then-MAC suites produce an inner
//! `Encrypt0` wrapped in a `COSE_Mac0` keyed with the session
//! verification key, covering `["MAC0", protected, aad, ciphertext]`.
//!
//! Opening is failure-uniform: malformed structure, wrong MAC, bad
//! padding, and wrong key all surface as [`CoseError::Verification`], and
//! the responder tears the session down without leaking which step
//! failed.

use coset::iana::EnumI64;
use coset::{
    iana, CborSerializable, CoseEncrypt0, CoseEncrypt0Builder, CoseMac0, CoseMac0Builder,
    EncryptionContext, HeaderBuilder,
};

use fdo_crypto::cipher::{self, CipherSuite, CtrState};
use fdo_crypto::hash;
use fdo_crypto::kdf::SessionKeys;
use fdo_types::HashAlg;

use crate::{CoseError, Result};

/// Seal one tunnel message.
///
/// CTR suites require and advance the sender's persistent counter state.
pub fn seal(
    suite: CipherSuite,
    keys: &SessionKeys,
    ctr: Option<&mut CtrState>,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    if suite.is_ae() {
        seal_ae(suite, keys, plaintext, aad)
    } else {
        seal_etm(suite, keys, ctr, plaintext, aad)
    }
}

/// Open one tunnel message.
pub fn open(suite: CipherSuite, keys: &SessionKeys, data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if suite.is_ae() {
        open_ae(suite, keys, data, aad)
    } else {
        open_etm(suite, keys, data, aad)
    }
}

fn suite_header(suite: CipherSuite, iv: Option<Vec<u8>>) -> Result<coset::Header> {
    let alg = iana::Algorithm::from_i64(suite.cose_alg())
        .ok_or_else(|| CoseError::Format("unregistered cipher algorithm".into()))?;
    let mut builder = HeaderBuilder::new().algorithm(alg);
    if let Some(iv) = iv {
        builder = builder.iv(iv);
    }
    Ok(builder.build())
}

fn seal_ae(suite: CipherSuite, keys: &SessionKeys, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let protected = coset::ProtectedHeader {
        original_data: None,
        header: suite_header(suite, None)?,
    };
    let enc_aad = coset::enc_structure_data(EncryptionContext::CoseEncrypt0, protected.clone(), aad);
    let sealed = cipher::encrypt(suite, keys.sek(), plaintext, &enc_aad, None)?;

    let encrypt0 = CoseEncrypt0Builder::new()
        .protected(protected.header)
        .unprotected(HeaderBuilder::new().iv(sealed.iv).build())
        .ciphertext(sealed.ciphertext)
        .build();
    Ok(encrypt0.to_vec()?)
}

fn open_ae(suite: CipherSuite, keys: &SessionKeys, data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let encrypt0 = CoseEncrypt0::from_slice(data).map_err(|_| CoseError::Verification)?;
    check_alg(&encrypt0.protected.header, suite)?;
    let enc_aad =
        coset::enc_structure_data(EncryptionContext::CoseEncrypt0, encrypt0.protected.clone(), aad);
    let ciphertext = encrypt0.ciphertext.as_deref().ok_or(CoseError::Verification)?;
    let iv = &encrypt0.unprotected.iv;
    cipher::decrypt(suite, keys.sek(), ciphertext, iv, &enc_aad).map_err(|_| CoseError::Verification)
}

fn seal_etm(
    suite: CipherSuite,
    keys: &SessionKeys,
    ctr: Option<&mut CtrState>,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let svk = keys.svk().ok_or(CoseError::Verification)?;
    let sealed = cipher::encrypt(suite, keys.sek(), plaintext, &[], ctr)?;

    let inner = CoseEncrypt0Builder::new()
        .protected(suite_header(suite, None)?)
        .unprotected(HeaderBuilder::new().iv(sealed.iv).build())
        .ciphertext(sealed.ciphertext)
        .build();
    let inner_bytes = inner.to_vec()?;

    let mac_alg = match suite.mac_alg() {
        Some(HashAlg::HmacSha384) => iana::Algorithm::HMAC_384_384,
        _ => iana::Algorithm::HMAC_256_256,
    };
    let mac0 = CoseMac0Builder::new()
        .protected(HeaderBuilder::new().algorithm(mac_alg).build())
        .payload(inner_bytes)
        .try_create_tag(aad, |data| {
            match suite.mac_alg() {
                Some(HashAlg::HmacSha384) => hash::hmac_sha384_raw(svk, data),
                _ => hash::hmac_sha256_raw(svk, data),
            }
            .map_err(CoseError::from)
        })?
        .build();
    Ok(mac0.to_vec()?)
}

fn open_etm(suite: CipherSuite, keys: &SessionKeys, data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let svk = keys.svk().ok_or(CoseError::Verification)?;
    let mac0 = CoseMac0::from_slice(data).map_err(|_| CoseError::Verification)?;
    let mac_alg = suite.mac_alg().ok_or(CoseError::Verification)?;
    mac0.verify_tag(aad, |tag, data| {
        hash::verify_hmac_raw(mac_alg, svk, data, tag).map_err(|_| CoseError::Verification)
    })?;

    let inner_bytes = mac0.payload.as_deref().ok_or(CoseError::Verification)?;
    let inner = CoseEncrypt0::from_slice(inner_bytes).map_err(|_| CoseError::Verification)?;
    check_alg(&inner.protected.header, suite)?;
    let ciphertext = inner.ciphertext.as_deref().ok_or(CoseError::Verification)?;
    cipher::decrypt(suite, keys.sek(), ciphertext, &inner.unprotected.iv, &[])
        .map_err(|_| CoseError::Verification)
}

fn check_alg(header: &coset::Header, suite: CipherSuite) -> Result<()> {
    match &header.alg {
        Some(coset::RegisteredLabelWithPrivate::Assigned(alg)) if alg.to_i64() == suite.cose_alg() => {
            Ok(())
        }
        _ => Err(CoseError::Verification),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys_for(suite: CipherSuite) -> SessionKeys {
        let sek = (0..suite.sek_len() as u8).collect();
        let svk = (0..suite.svk_len() as u8).map(|b| b.wrapping_add(0x80)).collect();
        SessionKeys::from_parts(sek, svk)
    }

    #[test]
    fn test_gcm_tunnel_roundtrip() {
        let keys = keys_for(CipherSuite::A128Gcm);
        let sealed = seal(CipherSuite::A128Gcm, &keys, None, b"service info", b"").expect("seal");
        let plain = open(CipherSuite::A128Gcm, &keys, &sealed, b"").expect("open");
        assert_eq!(plain, b"service info");
    }

    #[test]
    fn test_gcm_tamper_uniform_failure() {
        let keys = keys_for(CipherSuite::A128Gcm);
        let sealed = seal(CipherSuite::A128Gcm, &keys, None, b"service info", b"").expect("seal");
        for i in 0..sealed.len() {
            let mut mutated = sealed.clone();
            mutated[i] ^= 0x01;
            let result = open(CipherSuite::A128Gcm, &keys, &mutated, b"");
            assert!(matches!(result, Err(CoseError::Verification)), "byte {i}");
        }
    }

    #[test]
    fn test_etm_ctr_tunnel_roundtrip() {
        let keys = keys_for(CipherSuite::Aes128Ctr);
        let mut ctr = CtrState::generate();
        let a = seal(CipherSuite::Aes128Ctr, &keys, Some(&mut ctr), b"first", b"").expect("seal");
        let b = seal(CipherSuite::Aes128Ctr, &keys, Some(&mut ctr), b"second", b"").expect("seal");
        assert_eq!(open(CipherSuite::Aes128Ctr, &keys, &a, b"").expect("open"), b"first");
        assert_eq!(open(CipherSuite::Aes128Ctr, &keys, &b, b"").expect("open"), b"second");
    }

    #[test]
    fn test_etm_cbc_tunnel_roundtrip() {
        let keys = keys_for(CipherSuite::Aes256Cbc);
        let sealed = seal(CipherSuite::Aes256Cbc, &keys, None, b"padded message", b"").expect("seal");
        let plain = open(CipherSuite::Aes256Cbc, &keys, &sealed, b"").expect("open");
        assert_eq!(plain, b"padded message");
    }

    #[test]
    fn test_etm_mac_tamper_uniform_failure() {
        let keys = keys_for(CipherSuite::Aes128Cbc);
        let sealed = seal(CipherSuite::Aes128Cbc, &keys, None, b"padded message", b"").expect("seal");
        for i in 0..sealed.len() {
            let mut mutated = sealed.clone();
            mutated[i] ^= 0x01;
            let result = open(CipherSuite::Aes128Cbc, &keys, &mutated, b"");
            assert!(matches!(result, Err(CoseError::Verification)), "byte {i}");
        }
    }

    #[test]
    fn test_wrong_suite_refused() {
        let keys = keys_for(CipherSuite::A128Gcm);
        let sealed = seal(CipherSuite::A128Gcm, &keys, None, b"payload", b"").expect("seal");
        // Opening as A256GCM must fail on the declared algorithm.
        let keys256 = keys_for(CipherSuite::A256Gcm);
        assert!(open(CipherSuite::A256Gcm, &keys256, &sealed, b"").is_err());
    }
}
