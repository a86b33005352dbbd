//! `COSE_Sign1` creation and verification.
//!
//! A [`Sign1`] always carries the exact encoded bytes it was built from
//! or received as; hashing a voucher entry or re-verifying a payload
//! operates on those bytes, never a re-encoding. COSE tag 18 is accepted
//! on decode and not emitted on encode.

use ciborium::value::Value;
use coset::{
    iana, CborSerializable, CoseSign1, CoseSign1Builder, HeaderBuilder, SignatureContext,
    TaggedCborSerializable,
};

use crate::keys::{SignKey, VerifyKey};
use crate::{CoseError, Result};

/// A parsed `COSE_Sign1` together with its exact encoded form.
#[derive(Clone, Debug)]
pub struct Sign1 {
    raw: Vec<u8>,
    inner: CoseSign1,
}

impl Sign1 {
    /// Sign `payload` with `key`, attaching the given unprotected header
    /// values (integer labels). `aad` is the external AAD, empty for
    /// every FDO message.
    pub fn create(
        payload: Vec<u8>,
        key: &SignKey,
        unprotected: Vec<(i64, Value)>,
        aad: &[u8],
    ) -> Result<Self> {
        let protected = HeaderBuilder::new().algorithm(key.cose_alg()).build();
        let mut unprotected_builder = HeaderBuilder::new();
        for (label, value) in unprotected {
            unprotected_builder = unprotected_builder.value(label, value);
        }
        let inner = CoseSign1Builder::new()
            .protected(protected)
            .unprotected(unprotected_builder.build())
            .payload(payload)
            .try_create_signature(aad, |data| key.sign(data))?
            .build();
        let raw = inner.clone().to_vec()?;
        Ok(Self { raw, inner })
    }

    /// Parse received bytes, accepting the tagged (18) and untagged
    /// forms. The input bytes are retained verbatim.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let inner = CoseSign1::from_tagged_slice(data)
            .or_else(|_| CoseSign1::from_slice(data))
            .map_err(|e| CoseError::Format(e.to_string()))?;
        Ok(Self {
            raw: data.to_vec(),
            inner,
        })
    }

    /// The exact encoded bytes of this structure.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Consume into the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.raw
    }

    /// The payload, which FDO messages always carry (nil payloads are an
    /// error here).
    pub fn payload(&self) -> Result<&[u8]> {
        self.inner
            .payload
            .as_deref()
            .ok_or(CoseError::MissingPayload)
    }

    /// An unprotected header value by integer label.
    pub fn unprotected_value(&self, label: i64) -> Option<&Value> {
        self.inner
            .unprotected
            .rest
            .iter()
            .find(|(l, _)| *l == coset::Label::Int(label))
            .map(|(_, v)| v)
    }

    /// Verify the signature over the received `Sig_structure` bytes and
    /// return the payload.
    ///
    /// Fails on unknown critical headers and on any algorithm mismatch
    /// between the protected header and the key.
    pub fn verify(&self, key: &VerifyKey, aad: &[u8]) -> Result<&[u8]> {
        if !self.inner.protected.header.crit.is_empty() {
            return Err(CoseError::UnknownCriticalHeader);
        }
        match &self.inner.protected.header.alg {
            Some(coset::RegisteredLabelWithPrivate::Assigned(alg)) if *alg == key.cose_alg() => {}
            _ => return Err(CoseError::Verification),
        }
        let payload = self.payload()?;
        let data = coset::sig_structure_data(
            SignatureContext::CoseSign1,
            self.inner.protected.clone(),
            None,
            aad,
            payload,
        );
        key.verify(&data, &self.inner.signature)
            .map_err(|_| CoseError::Verification)?;
        self.payload()
    }

    /// The declared signature algorithm, if assigned.
    pub fn alg(&self) -> Option<iana::Algorithm> {
        match &self.inner.protected.header.alg {
            Some(coset::RegisteredLabelWithPrivate::Assigned(alg)) => Some(*alg),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let key = SignKey::generate_es256();
        let sign1 = Sign1::create(b"payload".to_vec(), &key, vec![], b"").expect("create");

        let parsed = Sign1::from_bytes(sign1.as_bytes()).expect("parse");
        let payload = parsed.verify(&key.verifier(), b"").expect("verify");
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_payload_flip_fails() {
        let key = SignKey::generate_es256();
        let sign1 = Sign1::create(b"payload".to_vec(), &key, vec![], b"").expect("create");

        // Flip each byte of the encoding in turn; verification must never
        // succeed with a different payload or signature.
        let original = sign1.as_bytes().to_vec();
        let mut failures = 0;
        for i in 0..original.len() {
            let mut mutated = original.clone();
            mutated[i] ^= 0x01;
            match Sign1::from_bytes(&mutated) {
                Ok(parsed) => {
                    if parsed.verify(&key.verifier(), b"").is_err() {
                        failures += 1;
                    }
                }
                Err(_) => failures += 1,
            }
        }
        assert_eq!(failures, original.len());
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = SignKey::generate_es256();
        let other = SignKey::generate_es256();
        let sign1 = Sign1::create(b"payload".to_vec(), &key, vec![], b"").expect("create");
        assert!(sign1.verify(&other.verifier(), b"").is_err());
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = SignKey::generate_es256();
        let sign1 = Sign1::create(b"payload".to_vec(), &key, vec![], b"aad-a").expect("create");
        assert!(sign1.verify(&key.verifier(), b"aad-b").is_err());
        sign1.verify(&key.verifier(), b"aad-a").expect("verify");
    }

    #[test]
    fn test_unprotected_values_roundtrip() {
        let key = SignKey::generate_es256();
        let sign1 = Sign1::create(
            b"p".to_vec(),
            &key,
            vec![(256, Value::Bytes(vec![1, 2, 3]))],
            b"",
        )
        .expect("create");

        let parsed = Sign1::from_bytes(sign1.as_bytes()).expect("parse");
        assert_eq!(parsed.unprotected_value(256), Some(&Value::Bytes(vec![1, 2, 3])));
        assert_eq!(parsed.unprotected_value(257), None);
        // The unprotected header is not covered by the signature.
        parsed.verify(&key.verifier(), b"").expect("verify");
    }

    #[test]
    fn test_es384_signing() {
        let key = SignKey::generate_es384();
        let sign1 = Sign1::create(b"payload".to_vec(), &key, vec![], b"").expect("create");
        sign1.verify(&key.verifier(), b"").expect("verify");
        assert_eq!(sign1.alg(), Some(iana::Algorithm::ES384));
    }

    #[test]
    fn test_alg_mismatch_fails() {
        let es256 = SignKey::generate_es256();
        let es384 = SignKey::generate_es384();
        let sign1 = Sign1::create(b"payload".to_vec(), &es256, vec![], b"").expect("create");
        // An ES384 verifier must refuse an ES256-signed message outright.
        assert!(sign1.verify(&es384.verifier(), b"").is_err());
    }
}
