//! Per-token session state.
//!
//! One protocol run per bearer token. Everything a responder needs
//! between requests lives here and serializes to CBOR for the session
//! store; nothing is shared across tokens, and the whole record is
//! destroyed on completion, error, or expiry — which is also when the
//! derived session keys cease to exist.

use serde::{Deserialize, Serialize};

use fdo_cbor::RawCbor;
use fdo_crypto::cipher::{CipherSuite, CtrState};
use fdo_crypto::kdf::SessionKeys;
use fdo_crypto::kex::OwnerKex;
use fdo_serviceinfo::{ChunkIn, DevmodAccumulator, ModuleCursor};
use fdo_types::{DeviceCertChain, Guid, Hash, Nonce};

use crate::{ProtocolError, Result};

/// The message the session expects next. Any other message number is an
/// invalid-message error and tears the session down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// DI: waiting for SetHMAC (12).
    DiSetHmac,
    /// TO0: waiting for OwnerSign (22).
    To0OwnerSign,
    /// TO1: waiting for ProveToRV (32).
    To1Prove,
    /// TO2: replaying entries (62) until all are served, then
    /// ProveDevice (64).
    To2Entries,
    /// TO2: waiting for DeviceServiceInfoReady (66).
    To2ServiceInfoReady,
    /// TO2: ServiceInfo loop (68) or Done (70).
    To2ServiceInfo,
}

/// Serializable per-token state.
#[derive(Serialize, Deserialize)]
pub struct Session {
    /// Expected next message.
    pub phase: Phase,
    /// Device GUID this run concerns.
    pub guid: Option<Guid>,

    // --- DI ---
    /// Header bytes handed out in SetCredentials, awaiting the HMAC.
    pub di_header: Option<RawCbor>,
    /// Certificate chain issued for the device.
    pub di_cert_chain: Option<DeviceCertChain>,

    // --- nonces ---
    /// TO0 sign nonce.
    pub nonce_to0_sign: Option<Nonce>,
    /// TO1 proof nonce.
    pub nonce_to1_proof: Option<Nonce>,
    /// TO2 proof-of-voucher nonce (device-chosen).
    pub nonce_prove_ov: Option<Nonce>,
    /// TO2 prove-device nonce (owner-chosen).
    pub nonce_prove_dv: Option<Nonce>,
    /// TO2 setup-device nonce (device-chosen).
    pub nonce_setup_dv: Option<Nonce>,

    // --- negotiated TO2 crypto ---
    /// Owner key-exchange state between ProveOVHdr and ProveDevice.
    pub kex: Option<OwnerKex>,
    /// Negotiated cipher suite.
    pub cipher: Option<CipherSuite>,
    /// Derived SEK/SVK.
    pub session_keys: Option<SessionKeys>,
    /// Owner-side CTR IV state (CTR suites only).
    pub ctr_out: Option<CtrState>,

    // --- TO2 progress ---
    /// Next entry index the device must request.
    pub next_entry: u16,
    /// Total entries in the voucher under replay.
    pub num_entries: u16,
    /// Largest message the device accepts.
    pub max_device_message_size: u16,
    /// Largest ServiceInfo message the device accepts from the owner.
    pub mtu_owner_to_device: u16,
    /// Replacement GUID chosen in SetupDevice.
    pub replacement_guid: Option<Guid>,
    /// Replacement header HMAC supplied by the device.
    pub replacement_hmac: Option<Hash>,
    /// Replacement header bytes (frozen when SetupDevice is built).
    pub replacement_header: Option<RawCbor>,

    // --- ServiceInfo ---
    /// Devmod accumulator.
    pub devmod: DevmodAccumulator,
    /// Reassembly state for incoming device KVs.
    pub chunk_in: ChunkIn,
    /// One cursor per configured owner module.
    pub module_cursors: Vec<ModuleCursor>,
    /// Index of the module currently streaming.
    pub active_module: usize,
    /// Whether every owner module has finished.
    pub modules_done: bool,
    /// Whether the devmod snapshot has been persisted.
    pub devmod_persisted: bool,
}

impl Session {
    /// Fresh session entering the given phase.
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            guid: None,
            di_header: None,
            di_cert_chain: None,
            nonce_to0_sign: None,
            nonce_to1_proof: None,
            nonce_prove_ov: None,
            nonce_prove_dv: None,
            nonce_setup_dv: None,
            kex: None,
            cipher: None,
            session_keys: None,
            ctr_out: None,
            next_entry: 0,
            num_entries: 0,
            max_device_message_size: 1300,
            mtu_owner_to_device: 1300,
            replacement_guid: None,
            replacement_hmac: None,
            replacement_header: None,
            devmod: DevmodAccumulator::new(),
            chunk_in: ChunkIn::new(),
            module_cursors: Vec::new(),
            active_module: 0,
            modules_done: false,
            devmod_persisted: false,
        }
    }

    /// Serialize for the session store.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(fdo_cbor::to_vec(self)?)
    }

    /// Deserialize from the session store.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(fdo_cbor::from_slice(bytes)?)
    }

    /// Check that the incoming message matches the expected phase.
    pub fn expect_phase(&self, wanted: Phase, msg_type: u8) -> Result<()> {
        if self.phase == wanted {
            Ok(())
        } else {
            Err(ProtocolError::InvalidMessage(format!(
                "message {msg_type} out of order (phase {:?})",
                self.phase
            )))
        }
    }

    /// The session GUID, required past the opening message.
    pub fn require_guid(&self) -> Result<Guid> {
        self.guid
            .ok_or_else(|| ProtocolError::Internal("session lost its GUID".into()))
    }
}
