//! Key-exchange suites.
//!
//! The owner is party A and the device party B. Each suite defines the
//! party messages and the shared-secret computation; the derived secret
//! then feeds the KDF in [`crate::kdf`]. Both roles are implemented: the
//! TO2 responder plays the owner, and device-side counterparts are needed
//! by tests and by chain-of-trust tooling.
//!
//! ECDH party messages are the concatenation of three 16-bit
//! big-endian-length-prefixed blocks: affine x, affine y, and the party's
//! random. The shared secret is `shx ‖ device_random ‖ owner_random`.
//! ASYMKEX sends the owner random in the clear and the device random
//! RSA-OAEP-encrypted to the owner key; the shared secret is
//! `device_random ‖ owner_random`.
//!
//! `DHKEXid14`/`DHKEXid15` are registry entries only and are refused at
//! negotiation, as are the deprecated CCM cipher suites.

use std::fmt;
use std::str::FromStr;

use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::ByteBuf;
use sha2::Sha256;
use zeroize::Zeroize;

use fdo_types::HashAlg;

use crate::{CryptoError, Result};

/// FDO key-exchange suite registry. Wire form is the suite name string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KexSuite {
    /// 2048-bit MODP Diffie-Hellman (registry entry; refused).
    DhkexId14,
    /// 3072-bit MODP Diffie-Hellman (registry entry; refused).
    DhkexId15,
    /// Ephemeral ECDH on P-256.
    Ecdh256,
    /// Ephemeral ECDH on P-384.
    Ecdh384,
    /// RSA-OAEP key transport, 2048-bit owner key.
    Asymkex2048,
    /// RSA-OAEP key transport, 3072-bit owner key.
    Asymkex3072,
}

/// Random length for the ECDH suites.
const ECDH_RANDOM_LEN: usize = 16;

impl KexSuite {
    /// Wire name.
    pub fn name(&self) -> &'static str {
        match self {
            KexSuite::DhkexId14 => "DHKEXid14",
            KexSuite::DhkexId15 => "DHKEXid15",
            KexSuite::Ecdh256 => "ECDH256",
            KexSuite::Ecdh384 => "ECDH384",
            KexSuite::Asymkex2048 => "ASYMKEX2048",
            KexSuite::Asymkex3072 => "ASYMKEX3072",
        }
    }

    /// Whether this server implements the suite. Unimplemented suites are
    /// refused during negotiation rather than silently substituted.
    pub fn implemented(&self) -> bool {
        !matches!(self, KexSuite::DhkexId14 | KexSuite::DhkexId15)
    }

    /// PRF hash used by the KDF for this suite.
    pub fn prf(&self) -> HashAlg {
        match self {
            KexSuite::Ecdh384 | KexSuite::Asymkex3072 | KexSuite::DhkexId15 => HashAlg::Sha384,
            _ => HashAlg::Sha256,
        }
    }

    /// Device-random length in bytes for the ASYMKEX suites.
    fn asymkex_random_len(&self) -> usize {
        match self {
            KexSuite::Asymkex3072 => 96,
            _ => 32,
        }
    }
}

impl fmt::Display for KexSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KexSuite {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DHKEXid14" => Ok(KexSuite::DhkexId14),
            "DHKEXid15" => Ok(KexSuite::DhkexId15),
            "ECDH256" => Ok(KexSuite::Ecdh256),
            "ECDH384" => Ok(KexSuite::Ecdh384),
            "ASYMKEX2048" => Ok(KexSuite::Asymkex2048),
            "ASYMKEX3072" => Ok(KexSuite::Asymkex3072),
            _ => Err(CryptoError::InvalidKey(format!("unknown kex suite {s:?}"))),
        }
    }
}

impl Serialize for KexSuite {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for KexSuite {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// A derived shared secret; zeroed on drop.
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    /// Raw secret bytes, input keying material for the KDF.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret({} bytes)", self.0.len())
    }
}

/// Owner-side (party A) key-exchange state, held in the session between
/// sending `xA` and receiving `xB`. Serializable so the session store can
/// persist it; zeroed on drop.
#[derive(Clone, Serialize, Deserialize)]
pub struct OwnerKex {
    /// The negotiated suite.
    pub suite: KexSuite,
    /// Ephemeral scalar bytes (empty for ASYMKEX).
    secret: ByteBuf,
    /// The owner random sent inside `xA`.
    random: ByteBuf,
}

impl Drop for OwnerKex {
    fn drop(&mut self) {
        self.secret.zeroize();
        self.random.zeroize();
    }
}

impl fmt::Debug for OwnerKex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerKex({})", self.suite)
    }
}

impl OwnerKex {
    /// Begin a key exchange: generate the ephemeral material and the
    /// party-A message.
    pub fn begin(suite: KexSuite) -> Result<(Self, Vec<u8>)> {
        match suite {
            KexSuite::Ecdh256 => {
                let secret = p256::SecretKey::random(&mut OsRng);
                let random = fresh_random(ECDH_RANDOM_LEN);
                let xa = ecdh_message_p256(&secret.public_key(), &random);
                let state = OwnerKex {
                    suite,
                    secret: ByteBuf::from(secret.to_bytes().to_vec()),
                    random: ByteBuf::from(random),
                };
                Ok((state, xa))
            }
            KexSuite::Ecdh384 => {
                let secret = p384::SecretKey::random(&mut OsRng);
                let random = fresh_random(ECDH_RANDOM_LEN);
                let xa = ecdh_message_p384(&secret.public_key(), &random);
                let state = OwnerKex {
                    suite,
                    secret: ByteBuf::from(secret.to_bytes().to_vec()),
                    random: ByteBuf::from(random),
                };
                Ok((state, xa))
            }
            KexSuite::Asymkex2048 | KexSuite::Asymkex3072 => {
                let random = fresh_random(suite.asymkex_random_len());
                let state = OwnerKex {
                    suite,
                    secret: ByteBuf::new(),
                    random: ByteBuf::from(random.clone()),
                };
                Ok((state, random))
            }
            KexSuite::DhkexId14 | KexSuite::DhkexId15 => {
                Err(CryptoError::UnsupportedSuite(suite.name()))
            }
        }
    }

    /// Complete the exchange with the device's `xB` message.
    ///
    /// The ASYMKEX suites additionally need the owner's RSA decryption
    /// key.
    pub fn finish(&self, xb: &[u8], owner_rsa: Option<&RsaPrivateKey>) -> Result<SharedSecret> {
        match self.suite {
            KexSuite::Ecdh256 => {
                let (their_pk, their_random) = parse_ecdh_message_p256(xb)?;
                let secret = p256::SecretKey::from_slice(&self.secret)
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
                let shx = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), their_pk.as_affine());
                Ok(combine_ecdh(shx.raw_secret_bytes(), &their_random, &self.random))
            }
            KexSuite::Ecdh384 => {
                let (their_pk, their_random) = parse_ecdh_message_p384(xb)?;
                let secret = p384::SecretKey::from_slice(&self.secret)
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
                let shx = p384::ecdh::diffie_hellman(secret.to_nonzero_scalar(), their_pk.as_affine());
                Ok(combine_ecdh(shx.raw_secret_bytes(), &their_random, &self.random))
            }
            KexSuite::Asymkex2048 | KexSuite::Asymkex3072 => {
                let key = owner_rsa.ok_or_else(|| {
                    CryptoError::InvalidKey("ASYMKEX requires the owner RSA key".into())
                })?;
                let device_random = key
                    .decrypt(Oaep::new::<Sha256>(), xb)
                    .map_err(|_| CryptoError::Verification)?;
                let mut shared = device_random;
                shared.extend_from_slice(&self.random);
                Ok(SharedSecret(shared))
            }
            KexSuite::DhkexId14 | KexSuite::DhkexId15 => {
                Err(CryptoError::UnsupportedSuite(self.suite.name()))
            }
        }
    }
}

/// Device-side (party B) response: the `xB` message and the derived
/// shared secret.
pub struct DeviceKex {
    /// Party-B message to send to the owner.
    pub xb: Vec<u8>,
    /// The derived shared secret.
    pub shared: SharedSecret,
}

/// Respond to a party-A message as the device.
///
/// The ASYMKEX suites need the owner's RSA public key (taken from the
/// voucher's current owner entry).
pub fn device_respond(suite: KexSuite, xa: &[u8], owner_rsa: Option<&RsaPublicKey>) -> Result<DeviceKex> {
    match suite {
        KexSuite::Ecdh256 => {
            let (their_pk, their_random) = parse_ecdh_message_p256(xa)?;
            let secret = p256::SecretKey::random(&mut OsRng);
            let random = fresh_random(ECDH_RANDOM_LEN);
            let xb = ecdh_message_p256(&secret.public_key(), &random);
            let shx = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), their_pk.as_affine());
            let shared = combine_ecdh(shx.raw_secret_bytes(), &random, &their_random);
            Ok(DeviceKex { xb, shared })
        }
        KexSuite::Ecdh384 => {
            let (their_pk, their_random) = parse_ecdh_message_p384(xa)?;
            let secret = p384::SecretKey::random(&mut OsRng);
            let random = fresh_random(ECDH_RANDOM_LEN);
            let xb = ecdh_message_p384(&secret.public_key(), &random);
            let shx = p384::ecdh::diffie_hellman(secret.to_nonzero_scalar(), their_pk.as_affine());
            let shared = combine_ecdh(shx.raw_secret_bytes(), &random, &their_random);
            Ok(DeviceKex { xb, shared })
        }
        KexSuite::Asymkex2048 | KexSuite::Asymkex3072 => {
            let key = owner_rsa.ok_or_else(|| {
                CryptoError::InvalidKey("ASYMKEX requires the owner RSA public key".into())
            })?;
            let device_random = fresh_random(suite.asymkex_random_len());
            let xb = key
                .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &device_random)
                .map_err(|_| CryptoError::Verification)?;
            let mut shared = device_random;
            shared.extend_from_slice(xa);
            Ok(DeviceKex {
                xb,
                shared: SharedSecret(shared),
            })
        }
        KexSuite::DhkexId14 | KexSuite::DhkexId15 => Err(CryptoError::UnsupportedSuite(suite.name())),
    }
}

fn fresh_random(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn combine_ecdh(shx: &[u8], device_random: &[u8], owner_random: &[u8]) -> SharedSecret {
    let mut out = Vec::with_capacity(shx.len() + device_random.len() + owner_random.len());
    out.extend_from_slice(shx);
    out.extend_from_slice(device_random);
    out.extend_from_slice(owner_random);
    SharedSecret(out)
}

fn push_block(out: &mut Vec<u8>, block: &[u8]) {
    out.extend_from_slice(&(block.len() as u16).to_be_bytes());
    out.extend_from_slice(block);
}

fn ecdh_message_p256(pk: &p256::PublicKey, random: &[u8]) -> Vec<u8> {
    let point = pk.to_encoded_point(false);
    let mut out = Vec::new();
    push_block(&mut out, point.x().map(|x| x.as_slice()).unwrap_or_default());
    push_block(&mut out, point.y().map(|y| y.as_slice()).unwrap_or_default());
    push_block(&mut out, random);
    out
}

fn ecdh_message_p384(pk: &p384::PublicKey, random: &[u8]) -> Vec<u8> {
    let point = pk.to_encoded_point(false);
    let mut out = Vec::new();
    push_block(&mut out, point.x().map(|x| x.as_slice()).unwrap_or_default());
    push_block(&mut out, point.y().map(|y| y.as_slice()).unwrap_or_default());
    push_block(&mut out, random);
    out
}

fn split_blocks(data: &[u8]) -> Result<Vec<&[u8]>> {
    let mut blocks = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        if rest.len() < 2 {
            return Err(CryptoError::MalformedKexMessage);
        }
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        rest = &rest[2..];
        if rest.len() < len {
            return Err(CryptoError::MalformedKexMessage);
        }
        blocks.push(&rest[..len]);
        rest = &rest[len..];
    }
    Ok(blocks)
}

fn parse_ecdh_message_p256(data: &[u8]) -> Result<(p256::PublicKey, Vec<u8>)> {
    let blocks = split_blocks(data)?;
    if blocks.len() != 3 {
        return Err(CryptoError::MalformedKexMessage);
    }
    let x = p256::FieldBytes::from_exact_iter(blocks[0].iter().copied())
        .ok_or(CryptoError::MalformedKexMessage)?;
    let y = p256::FieldBytes::from_exact_iter(blocks[1].iter().copied())
        .ok_or(CryptoError::MalformedKexMessage)?;
    let point = p256::EncodedPoint::from_affine_coordinates(&x, &y, false);
    let pk = Option::<p256::PublicKey>::from(p256::PublicKey::from_encoded_point(&point))
        .ok_or(CryptoError::MalformedKexMessage)?;
    Ok((pk, blocks[2].to_vec()))
}

fn parse_ecdh_message_p384(data: &[u8]) -> Result<(p384::PublicKey, Vec<u8>)> {
    let blocks = split_blocks(data)?;
    if blocks.len() != 3 {
        return Err(CryptoError::MalformedKexMessage);
    }
    let x = p384::FieldBytes::from_exact_iter(blocks[0].iter().copied())
        .ok_or(CryptoError::MalformedKexMessage)?;
    let y = p384::FieldBytes::from_exact_iter(blocks[1].iter().copied())
        .ok_or(CryptoError::MalformedKexMessage)?;
    let point = p384::EncodedPoint::from_affine_coordinates(&x, &y, false);
    let pk = Option::<p384::PublicKey>::from(p384::PublicKey::from_encoded_point(&point))
        .ok_or(CryptoError::MalformedKexMessage)?;
    Ok((pk, blocks[2].to_vec()))
}
