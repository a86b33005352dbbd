//! Voucher structure, chain validation, and extension.
//!
//! Wire form (all definite arrays):
//!
//! ```text
//! OwnershipVoucher = [prot_ver, bstr .cbor OvHeader, Hash, CertChain / null, [bstr .cbor entry, ...]]
//! OvHeader         = [prot_ver, guid, rv_info, device_info, mfg_pubkey, cert_chain_hash / null]
//! OvEntryPayload   = [prev_hash, hdr_info_hash, extra / null, owner_pubkey]
//! ```
//!
//! Each entry is a COSE_Sign1 over an `OvEntryPayload`. The chain links:
//! entry 0's `prev_hash` covers `header_bytes ‖ CBOR(header_hmac)` and is
//! signed by the manufacturer key; entry i's `prev_hash` covers the
//! encoded bytes of entry i−1 and is signed by the key entry i−1 named.

use serde::{Deserialize, Serialize};
use tracing::debug;

use fdo_cbor::RawCbor;
use fdo_cose::{Sign1, SignKey, VerifyKey};
use fdo_crypto::hash::{hash_parts, hmac};
use fdo_types::{DeviceCertChain, Guid, Hash, HashAlg, PublicKey, RendezvousInfo, PROTOCOL_VERSION};

use crate::{ChainError, Result, VoucherError};

/// Voucher header, created once during DI and hashed exactly as encoded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OvHeader {
    /// Protocol version (101).
    pub prot_ver: u16,
    /// Device GUID.
    pub guid: Guid,
    /// Rendezvous directives burned in at DI.
    pub rv_info: RendezvousInfo,
    /// Manufacturer-assigned device description.
    pub device_info: String,
    /// Manufacturer public key; the root of the ownership chain.
    pub mfg_pubkey: PublicKey,
    /// Hash over the concatenated device certificate chain, when one was
    /// issued.
    pub cert_chain_hash: Option<Hash>,
}

/// Payload of one ownership entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OvEntryPayload {
    /// Hash of the previous entry (or of header ‖ header HMAC for entry
    /// 0).
    pub prev_hash: Hash,
    /// Hash over `guid ‖ device_info`, binding every entry to the header.
    pub hdr_info_hash: Hash,
    /// Reserved extension slot; always null today.
    pub extra: Option<RawCbor>,
    /// The owner this entry transfers the device to.
    pub owner_pubkey: PublicKey,
}

/// A complete ownership voucher.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OwnershipVoucher {
    /// Protocol version (101).
    pub prot_ver: u16,
    /// Exact encoded header bytes.
    header: RawCbor,
    /// Device HMAC over the header bytes.
    header_hmac: Hash,
    /// Device certificate chain, leaf first.
    cert_chain: Option<DeviceCertChain>,
    /// Exact encoded COSE_Sign1 entries.
    entries: Vec<RawCbor>,
}

impl OwnershipVoucher {
    /// Assemble a fresh voucher at the end of DI. The header bytes are
    /// frozen here and never re-encoded afterwards.
    pub fn new(header: RawCbor, header_hmac: Hash, cert_chain: Option<DeviceCertChain>) -> Self {
        Self {
            prot_ver: PROTOCOL_VERSION,
            header,
            header_hmac,
            cert_chain,
            entries: Vec::new(),
        }
    }

    /// Parse voucher bytes, checking the protocol version.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let voucher: OwnershipVoucher = fdo_cbor::from_slice(data)?;
        if voucher.prot_ver != PROTOCOL_VERSION {
            return Err(VoucherError::VersionMismatch(voucher.prot_ver));
        }
        // The header must decode; entries are checked during validation.
        voucher.header()?;
        Ok(voucher)
    }

    /// Encode for storage or transfer. Header and entry bytes pass
    /// through verbatim.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(fdo_cbor::to_vec(self)?)
    }

    /// Decode the header.
    pub fn header(&self) -> Result<OvHeader> {
        Ok(self.header.decode()?)
    }

    /// Exact encoded header bytes.
    pub fn header_bytes(&self) -> &[u8] {
        self.header.as_slice()
    }

    /// The device HMAC over the header.
    pub fn header_hmac(&self) -> &Hash {
        &self.header_hmac
    }

    /// Device certificate chain, if present.
    pub fn cert_chain(&self) -> Option<&DeviceCertChain> {
        self.cert_chain.as_ref()
    }

    /// Number of ownership entries.
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// Exact encoded bytes of entry `index`.
    pub fn entry(&self, index: usize) -> Option<&RawCbor> {
        self.entries.get(index)
    }

    /// The hash algorithm the chain uses, declared by the header HMAC.
    pub fn hash_alg(&self) -> HashAlg {
        self.header_hmac.alg.base_hash()
    }

    /// The current owner: the key named by the last entry, or the
    /// manufacturer key for an unextended voucher.
    pub fn current_owner_key(&self) -> Result<PublicKey> {
        match self.entries.last() {
            None => Ok(self.header()?.mfg_pubkey),
            Some(entry) => {
                let payload = decode_entry_payload(entry, self.entries.len() - 1)?;
                Ok(payload.owner_pubkey)
            }
        }
    }

    /// Validate the full chain from header to tail.
    ///
    /// `trusted_mfg_roots`, when given, restricts the acceptable
    /// manufacturer keys. Returns the current owner key on success;
    /// partial chains are never accepted.
    pub fn validate_chain(&self, trusted_mfg_roots: Option<&[PublicKey]>) -> Result<PublicKey> {
        let header = self.header()?;
        if let Some(roots) = trusted_mfg_roots {
            if !roots.iter().any(|root| *root == header.mfg_pubkey) {
                return Err(ChainError::UntrustedManufacturer.into());
            }
        }

        let alg = self.hash_alg();
        let hmac_bytes = fdo_cbor::canonical_to_vec(&self.header_hmac)?;
        let mut link = hash_parts(alg, &[self.header.as_slice(), &hmac_bytes]);
        let hdr_info = hash_parts(alg, &[header.guid.as_bytes(), header.device_info.as_bytes()]);
        let mut signer_pk = header.mfg_pubkey;

        for (index, entry) in self.entries.iter().enumerate() {
            let sign1 =
                Sign1::from_bytes(entry.as_slice()).map_err(|_| ChainError::MalformedEntry(index))?;
            let verifier = VerifyKey::from_public_key(&signer_pk)
                .map_err(|_| ChainError::MalformedEntry(index))?;
            let payload_bytes = sign1
                .verify(&verifier, b"")
                .map_err(|_| ChainError::SignatureMismatch(index))?;
            let payload: OvEntryPayload =
                fdo_cbor::from_slice(payload_bytes).map_err(|_| ChainError::MalformedEntry(index))?;

            if payload.prev_hash.alg != alg || payload.hdr_info_hash.alg != alg {
                return Err(ChainError::HashAlgMixed(index).into());
            }
            if !payload.prev_hash.matches(&link) {
                return Err(ChainError::EntryHashMismatch(index).into());
            }
            if !payload.hdr_info_hash.matches(&hdr_info) {
                return Err(ChainError::HeaderInfoMismatch(index).into());
            }

            link = hash_parts(alg, &[entry.as_slice()]);
            signer_pk = payload.owner_pubkey;
        }

        debug!(
            guid = %header.guid,
            entries = self.entries.len(),
            "voucher chain validated"
        );
        Ok(signer_pk)
    }

    /// Extend the voucher to a new owner. `current_owner_signer` must be
    /// the private half of the current tail key; the new entry is signed
    /// with it and freezes its own encoded bytes.
    pub fn extend(&self, current_owner_signer: &SignKey, new_owner: &PublicKey) -> Result<Self> {
        let header = self.header()?;
        let alg = self.hash_alg();

        let prev_hash = match self.entries.last() {
            None => {
                let hmac_bytes = fdo_cbor::canonical_to_vec(&self.header_hmac)?;
                hash_parts(alg, &[self.header.as_slice(), &hmac_bytes])
            }
            Some(entry) => hash_parts(alg, &[entry.as_slice()]),
        };
        let hdr_info = hash_parts(alg, &[header.guid.as_bytes(), header.device_info.as_bytes()]);

        let payload = OvEntryPayload {
            prev_hash,
            hdr_info_hash: hdr_info,
            extra: None,
            owner_pubkey: new_owner.clone(),
        };
        let payload_bytes = fdo_cbor::canonical_to_vec(&payload)?;
        let entry = Sign1::create(payload_bytes, current_owner_signer, vec![], b"")?;

        let mut extended = self.clone();
        extended.entries.push(RawCbor::new(entry.into_bytes()));
        debug!(guid = %header.guid, entries = extended.entries.len(), "voucher extended");
        Ok(extended)
    }

    /// Compute the device header HMAC (manufacturer side, during DI,
    /// when the device delegates HMAC computation; normally the device
    /// sends it in SetHmac).
    pub fn compute_header_hmac(alg: HashAlg, dev_key: &[u8], header_bytes: &[u8]) -> Result<Hash> {
        Ok(hmac(alg, dev_key, header_bytes)?)
    }
}

fn decode_entry_payload(entry: &RawCbor, index: usize) -> Result<OvEntryPayload> {
    let sign1 = Sign1::from_bytes(entry.as_slice()).map_err(|_| ChainError::MalformedEntry(index))?;
    let payload_bytes = sign1.payload().map_err(|_| ChainError::MalformedEntry(index))?;
    let payload: OvEntryPayload =
        fdo_cbor::from_slice(payload_bytes).map_err(|_| ChainError::MalformedEntry(index))?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdo_types::{KeyEncoding, RendezvousInstr, RvVar};

    fn test_voucher(mfg: &SignKey) -> OwnershipVoucher {
        let header = OvHeader {
            prot_ver: PROTOCOL_VERSION,
            guid: Guid::generate(),
            rv_info: vec![vec![RendezvousInstr::new(
                RvVar::Dns,
                fdo_cbor::to_vec(&"rv.example").expect("encode"),
            )]],
            device_info: "test-device".into(),
            mfg_pubkey: mfg.public_key(KeyEncoding::X509).expect("pubkey"),
            cert_chain_hash: None,
        };
        let header_raw = RawCbor::from_serialize(&header).expect("encode header");
        let hmac =
            OwnershipVoucher::compute_header_hmac(HashAlg::Sha256, b"device-secret", header_raw.as_slice())
                .expect("hmac");
        OwnershipVoucher::new(header_raw, hmac, None)
    }

    #[test]
    fn test_unextended_voucher_owner_is_manufacturer() {
        let mfg = SignKey::generate_es256();
        let voucher = test_voucher(&mfg);

        let owner = voucher.validate_chain(None).expect("validate");
        assert_eq!(owner, mfg.public_key(KeyEncoding::X509).expect("pubkey"));
        assert_eq!(voucher.num_entries(), 0);
    }

    #[test]
    fn test_extend_twice_and_validate() {
        let mfg = SignKey::generate_es256();
        let owner1 = SignKey::generate_es256();
        let owner2 = SignKey::generate_es256();

        let v0 = test_voucher(&mfg);
        let v1 = v0
            .extend(&mfg, &owner1.public_key(KeyEncoding::X509).expect("pk"))
            .expect("extend 1");
        let v2 = v1
            .extend(&owner1, &owner2.public_key(KeyEncoding::X509).expect("pk"))
            .expect("extend 2");

        let tail = v2.validate_chain(None).expect("validate");
        assert_eq!(tail, owner2.public_key(KeyEncoding::X509).expect("pk"));
        assert_eq!(v2.num_entries(), 2);
        assert_eq!(v2.current_owner_key().expect("owner"), tail);
    }

    #[test]
    fn test_roundtrip_preserves_exact_bytes() {
        let mfg = SignKey::generate_es256();
        let owner1 = SignKey::generate_es256();
        let v = test_voucher(&mfg)
            .extend(&mfg, &owner1.public_key(KeyEncoding::X509).expect("pk"))
            .expect("extend");

        let bytes = v.to_bytes().expect("encode");
        let parsed = OwnershipVoucher::parse(&bytes).expect("parse");
        assert_eq!(parsed.header_bytes(), v.header_bytes());
        assert_eq!(
            parsed.entry(0).expect("entry").as_slice(),
            v.entry(0).expect("entry").as_slice()
        );
        parsed.validate_chain(None).expect("validate");
        assert_eq!(parsed.to_bytes().expect("encode"), bytes);
    }

    #[test]
    fn test_signature_flip_detected_at_entry_zero() {
        let mfg = SignKey::generate_es256();
        let owner1 = SignKey::generate_es256();
        let v = test_voucher(&mfg)
            .extend(&mfg, &owner1.public_key(KeyEncoding::X509).expect("pk"))
            .expect("extend");

        let mut bytes = v.to_bytes().expect("encode");
        // The ES256 signature is the last 64 bytes of the last entry.
        let len = bytes.len();
        bytes[len - 10] ^= 0x01;
        let tampered = OwnershipVoucher::parse(&bytes).expect("parse");
        let result = tampered.validate_chain(None);
        assert!(matches!(
            result,
            Err(VoucherError::Chain(ChainError::SignatureMismatch(0)))
        ));
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let mfg = SignKey::generate_es256();
        let interloper = SignKey::generate_es256();
        let owner1 = SignKey::generate_es256();

        // Entry 0 signed by a key that is not the manufacturer key.
        let v = test_voucher(&mfg)
            .extend(&interloper, &owner1.public_key(KeyEncoding::X509).expect("pk"))
            .expect("extend");
        assert!(matches!(
            v.validate_chain(None),
            Err(VoucherError::Chain(ChainError::SignatureMismatch(0)))
        ));
    }

    #[test]
    fn test_untrusted_manufacturer_rejected() {
        let mfg = SignKey::generate_es256();
        let other = SignKey::generate_es256();
        let v = test_voucher(&mfg);

        let trusted = [other.public_key(KeyEncoding::X509).expect("pk")];
        assert!(matches!(
            v.validate_chain(Some(&trusted)),
            Err(VoucherError::Chain(ChainError::UntrustedManufacturer))
        ));

        let trusted = [mfg.public_key(KeyEncoding::X509).expect("pk")];
        v.validate_chain(Some(&trusted)).expect("validate");
    }

    #[test]
    fn test_broken_link_rejected() {
        let mfg = SignKey::generate_es256();
        let owner1 = SignKey::generate_es256();
        let owner2 = SignKey::generate_es256();

        let v0 = test_voucher(&mfg);
        let v1 = v0
            .extend(&mfg, &owner1.public_key(KeyEncoding::X509).expect("pk"))
            .expect("extend");
        // Skip owner1: sign the second entry with the manufacturer key
        // again, breaking the signer chain.
        let v2 = v1
            .extend(&mfg, &owner2.public_key(KeyEncoding::X509).expect("pk"))
            .expect("extend");
        assert!(matches!(
            v2.validate_chain(None),
            Err(VoucherError::Chain(ChainError::SignatureMismatch(1)))
        ));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mfg = SignKey::generate_es256();
        let mut v = test_voucher(&mfg);
        v.prot_ver = 100;
        let bytes = v.to_bytes().expect("encode");
        assert!(matches!(
            OwnershipVoucher::parse(&bytes),
            Err(VoucherError::VersionMismatch(100))
        ));
    }
}
