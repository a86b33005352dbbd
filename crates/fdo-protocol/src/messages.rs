//! All wire message structs and message-number constants.
//!
//! Every message body is a definite CBOR array (the codec encodes these
//! named structs positionally). Opaque COSE structures travel
//! byte-string-wrapped so their exact encodings survive.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use fdo_cbor::{CborBstr, RawCbor};
use fdo_crypto::kex::KexSuite;
use fdo_serviceinfo::Kv;
use fdo_types::{ErrorCode, Guid, Hash, KeyType, Nonce, PublicKey, RendezvousInfo, RvTo2Addr};
use fdo_voucher::OwnershipVoucher;

// ---------------------------------------------------------------------------
// Message type constants
// ---------------------------------------------------------------------------

/// DI.AppStart (device → manufacturer).
pub const MSG_DI_APP_START: u8 = 10;
/// DI.SetCredentials (manufacturer → device).
pub const MSG_DI_SET_CREDENTIALS: u8 = 11;
/// DI.SetHMAC (device → manufacturer).
pub const MSG_DI_SET_HMAC: u8 = 12;
/// DI.Done (manufacturer → device).
pub const MSG_DI_DONE: u8 = 13;

/// TO0.Hello (owner → rendezvous).
pub const MSG_TO0_HELLO: u8 = 20;
/// TO0.HelloAck (rendezvous → owner).
pub const MSG_TO0_HELLO_ACK: u8 = 21;
/// TO0.OwnerSign (owner → rendezvous).
pub const MSG_TO0_OWNER_SIGN: u8 = 22;
/// TO0.AcceptOwner (rendezvous → owner).
pub const MSG_TO0_ACCEPT_OWNER: u8 = 23;

/// TO1.HelloRV (device → rendezvous).
pub const MSG_TO1_HELLO_RV: u8 = 30;
/// TO1.HelloRVAck (rendezvous → device).
pub const MSG_TO1_HELLO_RV_ACK: u8 = 31;
/// TO1.ProveToRV (device → rendezvous).
pub const MSG_TO1_PROVE_TO_RV: u8 = 32;
/// TO1.RVRedirect (rendezvous → device).
pub const MSG_TO1_RV_REDIRECT: u8 = 33;

/// TO2.HelloDevice (device → owner).
pub const MSG_TO2_HELLO_DEVICE: u8 = 60;
/// TO2.ProveOVHdr (owner → device).
pub const MSG_TO2_PROVE_OV_HDR: u8 = 61;
/// TO2.GetOVNextEntry (device → owner).
pub const MSG_TO2_GET_OV_NEXT_ENTRY: u8 = 62;
/// TO2.OVNextEntry (owner → device).
pub const MSG_TO2_OV_NEXT_ENTRY: u8 = 63;
/// TO2.ProveDevice (device → owner).
pub const MSG_TO2_PROVE_DEVICE: u8 = 64;
/// TO2.SetupDevice (owner → device).
pub const MSG_TO2_SETUP_DEVICE: u8 = 65;
/// TO2.DeviceServiceInfoReady (device → owner; first tunnel message).
pub const MSG_TO2_DEVICE_SERVICE_INFO_READY: u8 = 66;
/// TO2.OwnerServiceInfoReady (owner → device).
pub const MSG_TO2_OWNER_SERVICE_INFO_READY: u8 = 67;
/// TO2.DeviceServiceInfo (device → owner).
pub const MSG_TO2_DEVICE_SERVICE_INFO: u8 = 68;
/// TO2.OwnerServiceInfo (owner → device).
pub const MSG_TO2_OWNER_SERVICE_INFO: u8 = 69;
/// TO2.Done (device → owner).
pub const MSG_TO2_DONE: u8 = 70;
/// TO2.Done2 (owner → device; final tunnel message).
pub const MSG_TO2_DONE2: u8 = 71;

/// COSE unprotected-header label carrying the owner's ProveDevice nonce
/// in ProveOVHdr, and the device's SetupDevice nonce in ProveDevice.
pub const CUPH_NONCE: i64 = 256;
/// COSE unprotected-header label carrying the owner public key in
/// ProveOVHdr.
pub const CUPH_OWNER_PUBKEY: i64 = 257;

// ---------------------------------------------------------------------------
// DI
// ---------------------------------------------------------------------------

/// Manufacturing information presented by the device at DI.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceMfgInfo {
    /// Key type the device attests with.
    pub key_type: KeyType,
    /// Device serial number.
    pub serial: String,
    /// Free-form device description recorded in the voucher header.
    pub device_info: String,
    /// CSR (DER) self-signed with the device attestation key.
    pub csr: ByteBuf,
}

/// Message 10.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppStart {
    /// Manufacturing info, byte-string-wrapped.
    pub mfg_info: CborBstr<DeviceMfgInfo>,
}

/// Message 11.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetCredentials {
    /// The assembled voucher header, exact bytes the device must HMAC.
    pub header: RawCbor,
}

/// Message 12.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetHmac {
    /// Device HMAC over the header bytes.
    pub hmac: Hash,
}

/// Message 13.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiDone {}

// ---------------------------------------------------------------------------
// TO0
// ---------------------------------------------------------------------------

/// Message 20.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct To0Hello {}

/// Message 21.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct To0HelloAck {
    /// Nonce the owner must sign into `to0d`.
    pub nonce_to0_sign: Nonce,
}

/// Body of the `to0d` byte string inside OwnerSign.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct To0d {
    /// The complete voucher proving ownership.
    pub voucher: OwnershipVoucher,
    /// Requested blob lifetime in seconds.
    pub wait_seconds: u32,
    /// Echo of the HelloAck nonce.
    pub nonce: Nonce,
}

/// Payload of the owner-signed `To1d` blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct To1dPayload {
    /// Owner TO2 endpoints the device should dial.
    pub rv_addrs: Vec<RvTo2Addr>,
    /// Hash over the encoded `to0d`.
    pub to0d_hash: Hash,
    /// Echo of the HelloAck nonce.
    pub nonce: Nonce,
}

/// Message 22.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OwnerSign {
    /// Voucher, wait request, and nonce, byte-string-wrapped so the
    /// `to0d` hash covers exact bytes.
    pub to0d: CborBstr<To0d>,
    /// COSE_Sign1 by the voucher's current owner over [`To1dPayload`].
    pub to1d: RawCbor,
}

/// Message 23.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcceptOwner {
    /// Granted blob lifetime in seconds.
    pub wait_seconds: u32,
}

// ---------------------------------------------------------------------------
// TO1
// ---------------------------------------------------------------------------

/// Device signature capability descriptor, echoed by the responder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigInfo {
    /// COSE signature algorithm the device attests with.
    pub sg_type: i64,
    /// Algorithm-specific info; empty for plain ECDSA.
    pub info: ByteBuf,
}

impl SigInfo {
    /// Plain ES256 attestation.
    pub fn es256() -> Self {
        Self {
            sg_type: -7,
            info: ByteBuf::new(),
        }
    }
}

/// Message 30.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloRv {
    /// Device GUID to resolve.
    pub guid: Guid,
    /// Device signature capability.
    pub sig_info: SigInfo,
}

/// Message 31.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloRvAck {
    /// Nonce the device must sign.
    pub nonce_to1_proof: Nonce,
    /// Echoed signature capability.
    pub sig_info: SigInfo,
}

/// Message 32: a COSE_Sign1 by the device attestation key whose payload
/// is the CBOR-encoded proof nonce.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProveToRv {
    /// The device's COSE_Sign1 proof.
    pub token: RawCbor,
}

/// Message 33: the stored owner blob, returned byte-identical.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RvRedirect {
    /// Exact `To1d` bytes as the owner uploaded them.
    pub to1d: RawCbor,
}

// ---------------------------------------------------------------------------
// TO2
// ---------------------------------------------------------------------------

/// Message 60.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloDevice {
    /// Largest message the device accepts.
    pub max_device_message_size: u16,
    /// Device GUID.
    pub guid: Guid,
    /// Proof-of-voucher nonce the owner must sign.
    pub nonce_prove_ov: Nonce,
    /// Key-exchange suites in device preference order.
    pub kex_suites: Vec<String>,
    /// Cipher suites in device preference order (registry integers).
    pub cipher_suites: Vec<i64>,
    /// Device signature capability.
    pub sig_info: SigInfo,
}

/// Payload of the ProveOVHdr COSE_Sign1.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProveOvHdrPayload {
    /// Exact voucher header bytes.
    pub header: RawCbor,
    /// Number of ownership entries the device must replay.
    pub num_entries: u16,
    /// The voucher header HMAC.
    pub hmac: Hash,
    /// Echo of the device's proof nonce.
    pub nonce_prove_ov: Nonce,
    /// Echoed signature capability.
    pub sig_info: SigInfo,
    /// Owner key-exchange party-A message.
    pub xa_kex: ByteBuf,
    /// Hash over the received HelloDevice body.
    pub hello_hash: Hash,
    /// Largest message the owner accepts.
    pub max_owner_message_size: u16,
}

/// Message 61: COSE_Sign1 by the voucher's current owner. The
/// unprotected header carries [`CUPH_NONCE`] (the owner's ProveDevice
/// nonce) and [`CUPH_OWNER_PUBKEY`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProveOvHdr {
    /// The owner's signed header proof.
    pub sign1: RawCbor,
}

/// Message 62.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetOvNextEntry {
    /// Entry index, strictly sequential from zero.
    pub entry_num: u16,
}

/// Message 63.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OvNextEntry {
    /// Echoed entry index.
    pub entry_num: u16,
    /// Exact entry bytes.
    pub entry: RawCbor,
}

/// Payload of the ProveDevice COSE_Sign1.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProveDevicePayload {
    /// Echo of the owner's ProveDevice nonce.
    pub nonce_prove_dv: Nonce,
    /// Device key-exchange party-B message.
    pub xb_kex: ByteBuf,
}

/// Message 64: COSE_Sign1 by the device attestation key. The
/// unprotected header carries [`CUPH_NONCE`] with the device's
/// SetupDevice nonce.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProveDevice {
    /// The device's signed proof.
    pub sign1: RawCbor,
}

/// Payload of the SetupDevice COSE_Sign1, signed by the replacement
/// owner key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetupDevicePayload {
    /// Replacement rendezvous directives.
    pub rv_info: RendezvousInfo,
    /// Replacement GUID (fresh, or the original under credential
    /// reuse).
    pub guid: Guid,
    /// Echo of the device's SetupDevice nonce.
    pub nonce_setup_dv: Nonce,
    /// The replacement owner public key.
    pub owner2_pk: PublicKey,
}

/// Message 65.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetupDevice {
    /// The owner's signed replacement credentials.
    pub sign1: RawCbor,
}

/// Message 66 (first encrypted message).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceServiceInfoReady {
    /// HMAC over the replacement header; null under credential reuse.
    pub replacement_hmac: Option<Hash>,
    /// Largest ServiceInfo message the device accepts from the owner.
    pub max_owner_service_info_size: Option<u16>,
}

/// Message 67.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OwnerServiceInfoReady {
    /// Largest ServiceInfo message the owner accepts from the device.
    pub max_device_service_info_size: Option<u16>,
}

/// Message 68.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceServiceInfo {
    /// Whether the device has more to send immediately.
    pub is_more: bool,
    /// This frame's KVs.
    pub service_info: Vec<Kv>,
}

/// Message 69.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OwnerServiceInfo {
    /// Whether the owner has more queued beyond this frame.
    pub is_more: bool,
    /// Whether the owner is finished with ServiceInfo.
    pub is_done: bool,
    /// This frame's KVs.
    pub service_info: Vec<Kv>,
}

/// Message 70.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct To2Done {
    /// Echo of the owner's ProveDevice nonce.
    pub nonce_prove_dv: Nonce,
}

/// Message 71.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct To2Done2 {
    /// Echo of the device's SetupDevice nonce.
    pub nonce_setup_dv: Nonce,
}

// ---------------------------------------------------------------------------
// Error message (255)
// ---------------------------------------------------------------------------

/// Message 255, shared by every protocol. Terminal for the session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorMsg {
    /// Error code from the registry.
    pub code: ErrorCode,
    /// The message type that triggered the error.
    pub prev_msg: u8,
    /// Human-readable summary; never carries crypto sub-reasons.
    pub message: String,
    /// Unix timestamp of the failure.
    pub timestamp: u64,
    /// Correlation id for server-side log lookup.
    pub correlation_id: ByteBuf,
}

/// Parse a kex-suite offer list, keeping only names this server knows.
pub fn parse_kex_offer(names: &[String]) -> Vec<KexSuite> {
    names.iter().filter_map(|n| n.parse().ok()).collect()
}
