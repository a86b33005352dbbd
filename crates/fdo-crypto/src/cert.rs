//! Device certificate issuance during DI.
//!
//! The device presents a CSR self-signed with its attestation key; the
//! manufacturing service signs a device certificate with its CA and embeds
//! the resulting chain (device cert first, CA last) in the voucher. The
//! chain hash stored in the voucher header covers the concatenated DER
//! certificates.

use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, IsCa, KeyPair,
};
use serde_bytes::ByteBuf;

use fdo_types::{DeviceCertChain, Hash, HashAlg};

use crate::{hash, CryptoError, Result};

/// Manufacturer CA key material, loaded once at process init and
/// read-only afterwards.
pub struct ManufacturerCa {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl ManufacturerCa {
    /// Generate a fresh self-signed CA (tests and first-boot
    /// provisioning).
    pub fn generate(common_name: &str) -> Result<Self> {
        let key = KeyPair::generate().map_err(|e| CryptoError::Certificate(e.to_string()))?;
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params
            .self_signed(&key)
            .map_err(|e| CryptoError::Certificate(e.to_string()))?;
        Ok(Self { cert, key })
    }

    /// Load from a PKCS#8 DER private key, regenerating the CA
    /// certificate deterministically from the stored parameters is the
    /// collaborator's job; here the certificate DER is re-signed from the
    /// same key so the chain stays consistent.
    pub fn from_key_der(common_name: &str, key_der: &[u8]) -> Result<Self> {
        let key = KeyPair::try_from(key_der).map_err(|e| CryptoError::Certificate(e.to_string()))?;
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params
            .self_signed(&key)
            .map_err(|e| CryptoError::Certificate(e.to_string()))?;
        Ok(Self { cert, key })
    }

    /// DER encoding of the CA certificate.
    pub fn cert_der(&self) -> Vec<u8> {
        self.cert.der().to_vec()
    }

    /// Sign a device certificate from the device's CSR and return the
    /// voucher chain `[device_cert, ca_cert]`.
    pub fn sign_device_certificate(&self, csr_der: &[u8]) -> Result<DeviceCertChain> {
        let csr = CertificateSigningRequestParams::from_der(&csr_der.to_vec().into())
            .map_err(|e| CryptoError::Certificate(e.to_string()))?;
        let device_cert = csr
            .signed_by(&self.cert, &self.key)
            .map_err(|e| CryptoError::Certificate(e.to_string()))?;
        Ok(vec![
            ByteBuf::from(device_cert.der().to_vec()),
            ByteBuf::from(self.cert.der().to_vec()),
        ])
    }
}

/// Hash a certificate chain the way the voucher header records it: a
/// digest over the concatenated DER certificates.
pub fn cert_chain_hash(alg: HashAlg, chain: &DeviceCertChain) -> Hash {
    let parts: Vec<&[u8]> = chain.iter().map(|c| c.as_slice()).collect();
    hash::hash_parts(alg, &parts)
}

/// Device-side helper: generate an attestation keypair and a CSR for it.
/// The production device stack lives elsewhere; this exists for the DI
/// responder's tests and for provisioning tools.
pub struct DeviceAttestation {
    /// The device attestation keypair (PKCS#8 DER).
    pub key_der: Vec<u8>,
    /// CSR signed with the attestation key.
    pub csr_der: Vec<u8>,
}

impl DeviceAttestation {
    /// Generate a fresh attestation key and CSR naming the device serial.
    pub fn generate(serial: &str) -> Result<Self> {
        let key = KeyPair::generate().map_err(|e| CryptoError::Certificate(e.to_string()))?;
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, serial);
        params.distinguished_name = dn;
        let csr = params
            .serialize_request(&key)
            .map_err(|e| CryptoError::Certificate(e.to_string()))?;
        Ok(Self {
            key_der: key.serialize_der(),
            csr_der: csr.der().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_device_certificate() {
        let ca = ManufacturerCa::generate("FDO Manufacturing CA").expect("ca");
        let device = DeviceAttestation::generate("serial-0001").expect("device");

        let chain = ca.sign_device_certificate(&device.csr_der).expect("sign");
        assert_eq!(chain.len(), 2);
        assert!(!chain[0].is_empty());
        assert_eq!(chain[1].as_slice(), ca.cert_der().as_slice());
    }

    #[test]
    fn test_chain_hash_is_stable() {
        let ca = ManufacturerCa::generate("FDO Manufacturing CA").expect("ca");
        let device = DeviceAttestation::generate("serial-0002").expect("device");
        let chain = ca.sign_device_certificate(&device.csr_der).expect("sign");

        let a = cert_chain_hash(HashAlg::Sha256, &chain);
        let b = cert_chain_hash(HashAlg::Sha256, &chain);
        assert_eq!(a, b);
        assert_eq!(a.as_bytes().len(), 32);
    }

    #[test]
    fn test_garbage_csr_rejected() {
        let ca = ManufacturerCa::generate("FDO Manufacturing CA").expect("ca");
        assert!(ca.sign_device_certificate(&[0xDE, 0xAD]).is_err());
    }
}
