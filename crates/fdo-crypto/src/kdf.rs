//! Session-key derivation.
//!
//! HKDF over the key-exchange shared secret (which already incorporates
//! both parties' randoms) with the fixed info string
//! `"AutomaticOnboardTunnel"`, using the suite's PRF hash. The output is
//! split into the session encryption key (SEK) and, for the
//! encrypt-then-MAC cipher suites, the session verification key (SVK).
//! Both are zeroed on drop and exist only for the session's lifetime.

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha2::{Sha256, Sha384};
use zeroize::Zeroize;

use fdo_types::HashAlg;

use crate::cipher::CipherSuite;
use crate::kex::{KexSuite, SharedSecret};
use crate::{CryptoError, Result};

/// KDF domain separator.
const KDF_INFO: &[u8] = b"AutomaticOnboardTunnel";

/// Derived session keys. Serializable so the session store can carry them
/// across the request/response turns of one protocol run; zeroed on drop.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionKeys {
    sek: ByteBuf,
    svk: ByteBuf,
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.sek.zeroize();
        self.svk.zeroize();
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKeys(sek {} bytes, svk {} bytes)", self.sek.len(), self.svk.len())
    }
}

impl SessionKeys {
    /// Session encryption key.
    pub fn sek(&self) -> &[u8] {
        &self.sek
    }

    /// Session verification key; empty for authenticated-encryption
    /// suites.
    pub fn svk(&self) -> Option<&[u8]> {
        if self.svk.is_empty() {
            None
        } else {
            Some(&self.svk)
        }
    }

    /// Assemble from raw key material. Exists for tests and for
    /// deployments that derive keys in external hardware.
    pub fn from_parts(sek: Vec<u8>, svk: Vec<u8>) -> Self {
        Self {
            sek: ByteBuf::from(sek),
            svk: ByteBuf::from(svk),
        }
    }
}

/// Derive SEK (and SVK for non-AE suites) for a negotiated suite pair.
pub fn derive_session_keys(
    kex: KexSuite,
    cipher: CipherSuite,
    shared: &SharedSecret,
) -> Result<SessionKeys> {
    let sek_len = cipher.sek_len();
    let svk_len = if cipher.is_ae() { 0 } else { cipher.svk_len() };
    if !cipher.is_ae() && svk_len == 0 {
        // A non-AE suite with no MAC algorithm is a registry error.
        return Err(CryptoError::Kdf);
    }

    let mut okm = vec![0u8; sek_len + svk_len];
    match kex.prf() {
        HashAlg::Sha384 | HashAlg::HmacSha384 => {
            let hk = Hkdf::<Sha384>::new(None, shared.as_bytes());
            hk.expand(KDF_INFO, &mut okm).map_err(|_| CryptoError::Kdf)?;
        }
        _ => {
            let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
            hk.expand(KDF_INFO, &mut okm).map_err(|_| CryptoError::Kdf)?;
        }
    }

    let svk = okm.split_off(sek_len);
    Ok(SessionKeys {
        sek: ByteBuf::from(okm),
        svk: ByteBuf::from(svk),
    })
}
