//! Cipher-suite registry and message encryption primitives.
//!
//! Each suite declares its key lengths, MAC algorithm, PRF, and IV policy:
//!
//! - **GCM/CBC**: fresh random IV per message.
//! - **CTR**: a 12-byte nonce chosen once per side at session start plus a
//!   4-byte big-endian block counter, persisted across messages and
//!   advanced by the number of blocks consumed so keystreams never
//!   overlap. The session is torn down rather than letting the counter
//!   roll over.
//!
//! Decryption failures are uniform: every failure path returns
//! [`CryptoError::Verification`] with no padding or MAC detail, and the
//! caller tears the session down.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use aes::{Aes128, Aes256};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, Payload};
use aes_gcm::{AesGcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use sha2::digest::consts::U12;
use zeroize::Zeroize;

use fdo_types::HashAlg;

use crate::{CryptoError, Result};

type Aes128GcmN12 = AesGcm<Aes128, U12>;
type Aes192GcmN12 = AesGcm<aes::Aes192, U12>;
type Aes256GcmN12 = AesGcm<Aes256, U12>;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes128Ctr32 = ctr::Ctr32BE<Aes128>;
type Aes256Ctr32 = ctr::Ctr32BE<Aes256>;

/// FDO cipher-suite registry. Wire form is the registry integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(i64)]
pub enum CipherSuite {
    /// AES-128-GCM.
    A128Gcm = 1,
    /// AES-192-GCM.
    A192Gcm = 2,
    /// AES-256-GCM.
    A256Gcm = 3,
    /// AES-CCM, 128-bit tag, 128-bit key (registry entry; refused).
    AesCcm16_128_128 = 30,
    /// AES-CCM, 128-bit tag, 256-bit key (registry entry; refused).
    AesCcm16_128_256 = 31,
    /// AES-CCM, 64-bit tag, 128-bit key (registry entry; refused).
    AesCcm64_128_128 = 32,
    /// AES-CCM, 64-bit tag, 256-bit key (registry entry; refused).
    AesCcm64_128_256 = 33,
    /// AES-128-CBC with HMAC-SHA256.
    Aes128Cbc = -17,
    /// AES-128-CTR with HMAC-SHA256.
    Aes128Ctr = -18,
    /// AES-256-CBC with HMAC-SHA384.
    Aes256Cbc = -35,
    /// AES-256-CTR with HMAC-SHA384.
    Aes256Ctr = -36,
}

impl CipherSuite {
    /// Look up a registry integer (negotiation offers arrive as plain
    /// integers).
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(CipherSuite::A128Gcm),
            2 => Some(CipherSuite::A192Gcm),
            3 => Some(CipherSuite::A256Gcm),
            30 => Some(CipherSuite::AesCcm16_128_128),
            31 => Some(CipherSuite::AesCcm16_128_256),
            32 => Some(CipherSuite::AesCcm64_128_128),
            33 => Some(CipherSuite::AesCcm64_128_256),
            -17 => Some(CipherSuite::Aes128Cbc),
            -18 => Some(CipherSuite::Aes128Ctr),
            -35 => Some(CipherSuite::Aes256Cbc),
            -36 => Some(CipherSuite::Aes256Ctr),
            _ => None,
        }
    }

    /// Whether this server implements the suite. Deprecated entries are
    /// refused at negotiation, never silently substituted.
    pub fn implemented(&self) -> bool {
        !matches!(
            self,
            CipherSuite::AesCcm16_128_128
                | CipherSuite::AesCcm16_128_256
                | CipherSuite::AesCcm64_128_128
                | CipherSuite::AesCcm64_128_256
        )
    }

    /// Whether the ciphertext authenticates itself (no companion MAC).
    pub fn is_ae(&self) -> bool {
        matches!(
            self,
            CipherSuite::A128Gcm
                | CipherSuite::A192Gcm
                | CipherSuite::A256Gcm
                | CipherSuite::AesCcm16_128_128
                | CipherSuite::AesCcm16_128_256
                | CipherSuite::AesCcm64_128_128
                | CipherSuite::AesCcm64_128_256
        )
    }

    /// SEK length in bytes.
    pub fn sek_len(&self) -> usize {
        match self {
            CipherSuite::A128Gcm
            | CipherSuite::AesCcm16_128_128
            | CipherSuite::AesCcm64_128_128
            | CipherSuite::Aes128Cbc
            | CipherSuite::Aes128Ctr => 16,
            CipherSuite::A192Gcm => 24,
            CipherSuite::A256Gcm
            | CipherSuite::AesCcm16_128_256
            | CipherSuite::AesCcm64_128_256
            | CipherSuite::Aes256Cbc
            | CipherSuite::Aes256Ctr => 32,
        }
    }

    /// SVK length in bytes (zero for AE suites).
    pub fn svk_len(&self) -> usize {
        match self.mac_alg() {
            Some(HashAlg::HmacSha384) => 48,
            Some(_) => 32,
            None => 0,
        }
    }

    /// Companion MAC algorithm for the encrypt-then-MAC suites.
    pub fn mac_alg(&self) -> Option<HashAlg> {
        match self {
            CipherSuite::Aes128Cbc | CipherSuite::Aes128Ctr => Some(HashAlg::HmacSha256),
            CipherSuite::Aes256Cbc | CipherSuite::Aes256Ctr => Some(HashAlg::HmacSha384),
            _ => None,
        }
    }

    /// COSE algorithm identifier placed in the Encrypt0 protected header.
    pub fn cose_alg(&self) -> i64 {
        *self as i64
    }

    /// IV length in bytes for this suite's encryption primitive.
    pub fn iv_len(&self) -> usize {
        match self {
            CipherSuite::Aes128Cbc | CipherSuite::Aes256Cbc => 16,
            // GCM and CTR (12-byte nonce + 4-byte counter in the block).
            _ => 12,
        }
    }

    /// Whether this suite keeps a persistent CTR counter.
    pub fn uses_ctr_state(&self) -> bool {
        matches!(self, CipherSuite::Aes128Ctr | CipherSuite::Aes256Ctr)
    }
}

/// Per-session, per-direction CTR IV state: fixed 12-byte nonce and the
/// next 4-byte block counter. Serializable session state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CtrState {
    nonce: [u8; 12],
    counter: u32,
}

impl CtrState {
    /// Choose a fresh random nonce with the counter at zero.
    pub fn generate() -> Self {
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        Self { nonce, counter: 0 }
    }

    /// The full 16-byte IV for the next message.
    fn next_iv(&self) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..12].copy_from_slice(&self.nonce);
        iv[12..].copy_from_slice(&self.counter.to_be_bytes());
        iv
    }

    /// Advance past a message of `len` plaintext bytes.
    fn advance(&mut self, len: usize) -> Result<()> {
        let blocks = (len as u64).div_ceil(16).max(1);
        let next = self.counter as u64 + blocks;
        if next > u32::MAX as u64 {
            return Err(CryptoError::IvCounterExhausted);
        }
        self.counter = next as u32;
        Ok(())
    }
}

impl Drop for CtrState {
    fn drop(&mut self) {
        self.nonce.zeroize();
    }
}

/// Output of one message encryption: ciphertext and the IV that must
/// accompany it.
pub struct Sealed {
    /// Ciphertext (including the AEAD tag for AE suites).
    pub ciphertext: Vec<u8>,
    /// The IV carried in the COSE unprotected header.
    pub iv: Vec<u8>,
}

/// Encrypt one message under the suite's IV policy.
///
/// `aad` is the COSE `Enc_structure` for AE suites and ignored otherwise
/// (the companion Mac0 authenticates the ETM suites). For CTR suites the
/// persistent counter state is required and advanced.
pub fn encrypt(
    suite: CipherSuite,
    sek: &[u8],
    plaintext: &[u8],
    aad: &[u8],
    ctr: Option<&mut CtrState>,
) -> Result<Sealed> {
    match suite {
        CipherSuite::A128Gcm => gcm_encrypt::<Aes128GcmN12>(sek, plaintext, aad),
        CipherSuite::A192Gcm => gcm_encrypt::<Aes192GcmN12>(sek, plaintext, aad),
        CipherSuite::A256Gcm => gcm_encrypt::<Aes256GcmN12>(sek, plaintext, aad),
        CipherSuite::Aes128Cbc => cbc_encrypt::<Aes128CbcEnc>(sek, plaintext),
        CipherSuite::Aes256Cbc => cbc_encrypt::<Aes256CbcEnc>(sek, plaintext),
        CipherSuite::Aes128Ctr => {
            let state = ctr.ok_or(CryptoError::Verification)?;
            ctr_apply::<Aes128Ctr32>(sek, plaintext, state)
        }
        CipherSuite::Aes256Ctr => {
            let state = ctr.ok_or(CryptoError::Verification)?;
            ctr_apply::<Aes256Ctr32>(sek, plaintext, state)
        }
        CipherSuite::AesCcm16_128_128
        | CipherSuite::AesCcm16_128_256
        | CipherSuite::AesCcm64_128_128
        | CipherSuite::AesCcm64_128_256 => Err(CryptoError::UnsupportedSuite("AES-CCM")),
    }
}

/// Decrypt one message. Every failure is [`CryptoError::Verification`].
pub fn decrypt(
    suite: CipherSuite,
    sek: &[u8],
    ciphertext: &[u8],
    iv: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    match suite {
        CipherSuite::A128Gcm => gcm_decrypt::<Aes128GcmN12>(sek, ciphertext, iv, aad),
        CipherSuite::A192Gcm => gcm_decrypt::<Aes192GcmN12>(sek, ciphertext, iv, aad),
        CipherSuite::A256Gcm => gcm_decrypt::<Aes256GcmN12>(sek, ciphertext, iv, aad),
        CipherSuite::Aes128Cbc => cbc_decrypt::<Aes128CbcDec>(sek, ciphertext, iv),
        CipherSuite::Aes256Cbc => cbc_decrypt::<Aes256CbcDec>(sek, ciphertext, iv),
        CipherSuite::Aes128Ctr => ctr_unapply::<Aes128Ctr32>(sek, ciphertext, iv),
        CipherSuite::Aes256Ctr => ctr_unapply::<Aes256Ctr32>(sek, ciphertext, iv),
        CipherSuite::AesCcm16_128_128
        | CipherSuite::AesCcm16_128_256
        | CipherSuite::AesCcm64_128_128
        | CipherSuite::AesCcm64_128_256 => Err(CryptoError::UnsupportedSuite("AES-CCM")),
    }
}

fn gcm_encrypt<C>(sek: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Sealed>
where
    C: KeyInit + Aead + AeadCore<NonceSize = U12>,
{
    let cipher = C::new_from_slice(sek).map_err(|_| CryptoError::Verification)?;
    let mut iv = vec![0u8; 12];
    OsRng.fill_bytes(&mut iv);
    let nonce = Nonce::<U12>::from_slice(&iv);
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Verification)?;
    Ok(Sealed { ciphertext, iv })
}

fn gcm_decrypt<C>(sek: &[u8], ciphertext: &[u8], iv: &[u8], aad: &[u8]) -> Result<Vec<u8>>
where
    C: KeyInit + Aead + AeadCore<NonceSize = U12>,
{
    if iv.len() != 12 {
        return Err(CryptoError::Verification);
    }
    let cipher = C::new_from_slice(sek).map_err(|_| CryptoError::Verification)?;
    let nonce = Nonce::<U12>::from_slice(iv);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Verification)
}

fn cbc_encrypt<E>(sek: &[u8], plaintext: &[u8]) -> Result<Sealed>
where
    E: KeyIvInit + BlockEncryptMut,
{
    let mut iv = vec![0u8; 16];
    OsRng.fill_bytes(&mut iv);
    let enc = E::new_from_slices(sek, &iv).map_err(|_| CryptoError::Verification)?;
    let ciphertext = enc.encrypt_padded_vec_mut::<aes::cipher::block_padding::Pkcs7>(plaintext);
    Ok(Sealed { ciphertext, iv })
}

fn cbc_decrypt<D>(sek: &[u8], ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>>
where
    D: KeyIvInit + BlockDecryptMut,
{
    let dec = D::new_from_slices(sek, iv).map_err(|_| CryptoError::Verification)?;
    dec.decrypt_padded_vec_mut::<aes::cipher::block_padding::Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Verification)
}

fn ctr_apply<C>(sek: &[u8], plaintext: &[u8], state: &mut CtrState) -> Result<Sealed>
where
    C: KeyIvInit + StreamCipher,
{
    let iv = state.next_iv();
    state.advance(plaintext.len())?;
    let mut cipher = C::new_from_slices(sek, &iv).map_err(|_| CryptoError::Verification)?;
    let mut out = plaintext.to_vec();
    cipher.apply_keystream(&mut out);
    Ok(Sealed {
        ciphertext: out,
        iv: iv.to_vec(),
    })
}

fn ctr_unapply<C>(sek: &[u8], ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>>
where
    C: KeyIvInit + StreamCipher,
{
    if iv.len() != 16 {
        return Err(CryptoError::Verification);
    }
    let mut cipher = C::new_from_slices(sek, iv).map_err(|_| CryptoError::Verification)?;
    let mut out = ciphertext.to_vec();
    cipher.apply_keystream(&mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(len: usize) -> Vec<u8> {
        (0..len as u8).collect()
    }

    #[test]
    fn test_gcm_roundtrip_all_sizes() {
        for suite in [CipherSuite::A128Gcm, CipherSuite::A192Gcm, CipherSuite::A256Gcm] {
            let sek = key(suite.sek_len());
            let sealed = encrypt(suite, &sek, b"hello device", b"aad", None).expect("encrypt");
            let plain = decrypt(suite, &sek, &sealed.ciphertext, &sealed.iv, b"aad").expect("decrypt");
            assert_eq!(plain, b"hello device");
        }
    }

    #[test]
    fn test_gcm_tamper_fails() {
        let sek = key(16);
        let mut sealed = encrypt(CipherSuite::A128Gcm, &sek, b"payload", b"", None).expect("encrypt");
        sealed.ciphertext[0] ^= 0x01;
        assert!(decrypt(CipherSuite::A128Gcm, &sek, &sealed.ciphertext, &sealed.iv, b"").is_err());
    }

    #[test]
    fn test_gcm_wrong_aad_fails() {
        let sek = key(16);
        let sealed = encrypt(CipherSuite::A128Gcm, &sek, b"payload", b"a", None).expect("encrypt");
        assert!(decrypt(CipherSuite::A128Gcm, &sek, &sealed.ciphertext, &sealed.iv, b"b").is_err());
    }

    #[test]
    fn test_cbc_roundtrip() {
        for suite in [CipherSuite::Aes128Cbc, CipherSuite::Aes256Cbc] {
            let sek = key(suite.sek_len());
            let sealed = encrypt(suite, &sek, b"block padded message", b"", None).expect("encrypt");
            assert_eq!(sealed.iv.len(), 16);
            assert_eq!(sealed.ciphertext.len() % 16, 0);
            let plain = decrypt(suite, &sek, &sealed.ciphertext, &sealed.iv, b"").expect("decrypt");
            assert_eq!(plain, b"block padded message");
        }
    }

    #[test]
    fn test_ctr_roundtrip_and_counter_advances() {
        let sek = key(16);
        let mut state = CtrState::generate();
        assert_eq!(state.counter, 0);

        let sealed = encrypt(CipherSuite::Aes128Ctr, &sek, &[0xAA; 33], b"", Some(&mut state))
            .expect("encrypt");
        // 33 bytes = 3 blocks.
        assert_eq!(state.counter, 3);

        let plain = decrypt(CipherSuite::Aes128Ctr, &sek, &sealed.ciphertext, &sealed.iv, b"")
            .expect("decrypt");
        assert_eq!(plain, vec![0xAA; 33]);
    }

    #[test]
    fn test_ctr_messages_use_disjoint_keystreams() {
        let sek = key(16);
        let mut state = CtrState::generate();
        let a = encrypt(CipherSuite::Aes128Ctr, &sek, &[0u8; 16], b"", Some(&mut state)).expect("a");
        let b = encrypt(CipherSuite::Aes128Ctr, &sek, &[0u8; 16], b"", Some(&mut state)).expect("b");
        // Same plaintext, advancing counter: ciphertexts must differ.
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_ctr_counter_exhaustion() {
        let sek = key(16);
        let mut state = CtrState::generate();
        state.counter = u32::MAX - 1;
        let result = encrypt(CipherSuite::Aes128Ctr, &sek, &[0u8; 64], b"", Some(&mut state));
        assert!(matches!(result, Err(CryptoError::IvCounterExhausted)));
    }

    #[test]
    fn test_ccm_refused() {
        for suite in [
            CipherSuite::AesCcm16_128_128,
            CipherSuite::AesCcm16_128_256,
            CipherSuite::AesCcm64_128_128,
            CipherSuite::AesCcm64_128_256,
        ] {
            assert!(!suite.implemented());
            assert!(matches!(
                encrypt(suite, &key(suite.sek_len()), b"x", b"", None),
                Err(CryptoError::UnsupportedSuite(_))
            ));
        }
    }

    #[test]
    fn test_ccm_registry_values() {
        assert_eq!(CipherSuite::from_i64(30), Some(CipherSuite::AesCcm16_128_128));
        assert_eq!(CipherSuite::from_i64(31), Some(CipherSuite::AesCcm16_128_256));
        assert_eq!(CipherSuite::from_i64(32), Some(CipherSuite::AesCcm64_128_128));
        assert_eq!(CipherSuite::from_i64(33), Some(CipherSuite::AesCcm64_128_256));
    }

    #[test]
    fn test_registry_properties() {
        assert!(CipherSuite::A128Gcm.is_ae());
        assert!(!CipherSuite::Aes128Ctr.is_ae());
        assert_eq!(CipherSuite::Aes256Ctr.mac_alg(), Some(HashAlg::HmacSha384));
        assert_eq!(CipherSuite::A256Gcm.sek_len(), 32);
        assert_eq!(CipherSuite::Aes128Cbc.svk_len(), 32);
    }
}
