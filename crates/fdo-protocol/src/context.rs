//! Server context: stores, key material, and per-service
//! configuration. Built once at process init by the front-end binary
//! and read-only afterwards.

use std::sync::Arc;
use std::time::SystemTime;

use fdo_cose::SignKey;
use fdo_crypto::cert::ManufacturerCa;
use fdo_serviceinfo::OwnerModule;
use fdo_store::{DevmodStore, RvBlobStore, SessionStore, VoucherStore};
use fdo_types::{HashAlg, PublicKey, RendezvousInfo};
use fdo_voucher::OwnershipVoucher;

use crate::{ProtocolError, Result};

/// Which protocol family a deployment serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Service {
    /// DI (messages 10–13).
    Manufacturing,
    /// TO0 and TO1 (20–33).
    Rendezvous,
    /// TO2 (60–71).
    Owner,
}

/// Signing keys and trust anchors, read-only after process init.
pub struct KeyRing {
    /// Manufacturer signing key (DI, and the root of fresh vouchers).
    pub mfg_key: Option<Arc<SignKey>>,
    /// Current owner signing key (TO0 blob signing, TO2 ProveOVHdr).
    pub owner_key: Option<Arc<SignKey>>,
    /// Replacement owner key for SetupDevice; defaults to `owner_key`.
    pub owner2_key: Option<Arc<SignKey>>,
    /// Manufacturer keys this deployment accepts at voucher ingestion;
    /// `None` accepts any internally consistent chain.
    pub mfg_trust_roots: Option<Vec<PublicKey>>,
}

impl KeyRing {
    /// An empty ring (every service then fails on first use).
    pub fn empty() -> Self {
        Self {
            mfg_key: None,
            owner_key: None,
            owner2_key: None,
            mfg_trust_roots: None,
        }
    }

    /// The manufacturer key or an internal error.
    pub fn require_mfg(&self) -> Result<&SignKey> {
        self.mfg_key
            .as_deref()
            .ok_or_else(|| ProtocolError::Internal("no manufacturer key configured".into()))
    }

    /// The owner key or an internal error.
    pub fn require_owner(&self) -> Result<&SignKey> {
        self.owner_key
            .as_deref()
            .ok_or_else(|| ProtocolError::Internal("no owner key configured".into()))
    }

    /// The replacement owner key (falls back to the owner key).
    pub fn owner2(&self) -> Result<&SignKey> {
        self.owner2_key
            .as_deref()
            .map(Ok)
            .unwrap_or_else(|| self.require_owner())
    }
}

/// Hook run on the freshly assembled voucher before DI persists it,
/// typically to pre-extend it to a first owner.
pub type VoucherHook =
    Arc<dyn Fn(OwnershipVoucher) -> Result<OwnershipVoucher> + Send + Sync>;

/// Manufacturing (DI) configuration.
pub struct DiConfig {
    /// Rendezvous directives burned into new voucher headers.
    pub rv_info: RendezvousInfo,
    /// Hash algorithm for cert-chain hashes on new vouchers.
    pub hash_alg: HashAlg,
    /// Device certificate issuer.
    pub ca: Arc<ManufacturerCa>,
    /// Optional pre-persist hook.
    pub before_voucher_persist: Option<VoucherHook>,
}

/// Rendezvous (TO0) configuration.
pub struct To0Config {
    /// Upper bound on granted blob lifetimes.
    pub max_wait_seconds: u32,
}

impl Default for To0Config {
    fn default() -> Self {
        Self {
            max_wait_seconds: 60 * 60 * 48,
        }
    }
}

/// Owner (TO2) configuration.
pub struct To2Config {
    /// Reuse the device credential instead of replacing it.
    pub reuse_credential: bool,
    /// Rendezvous directives for the replacement header; `None` keeps
    /// the original.
    pub replacement_rv_info: Option<RendezvousInfo>,
    /// Owner ServiceInfo modules, polled in order.
    pub modules: Vec<Arc<dyn OwnerModule>>,
    /// Largest message the owner accepts.
    pub max_message_size: u16,
}

impl Default for To2Config {
    fn default() -> Self {
        Self {
            reuse_credential: false,
            replacement_rv_info: None,
            modules: Vec::new(),
            max_message_size: 1300,
        }
    }
}

/// Everything a responder needs, assembled by the front end.
pub struct ServerContext {
    /// Enabled protocol families.
    pub services: Vec<Service>,
    /// Session rows.
    pub sessions: Arc<dyn SessionStore>,
    /// Voucher rows.
    pub vouchers: Arc<dyn VoucherStore>,
    /// Rendezvous blobs.
    pub rv_blobs: Arc<dyn RvBlobStore>,
    /// Devmod snapshots.
    pub devmods: Arc<dyn DevmodStore>,
    /// Key material.
    pub keys: KeyRing,
    /// DI configuration (manufacturing deployments).
    pub di: Option<DiConfig>,
    /// TO0 configuration.
    pub to0: To0Config,
    /// TO2 configuration (owner deployments).
    pub to2: Option<To2Config>,
    /// Clock, injectable for expiry tests. Returns Unix seconds.
    pub clock: Arc<dyn Fn() -> u64 + Send + Sync>,
}

impl ServerContext {
    /// The wall-clock time in Unix seconds.
    pub fn now(&self) -> u64 {
        (self.clock)()
    }

    /// The default clock.
    pub fn system_clock() -> Arc<dyn Fn() -> u64 + Send + Sync> {
        Arc::new(|| {
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        })
    }

    /// Whether a service is enabled here.
    pub fn serves(&self, service: Service) -> bool {
        self.services.contains(&service)
    }

    /// DI configuration or an internal error.
    pub fn require_di(&self) -> Result<&DiConfig> {
        self.di
            .as_ref()
            .ok_or_else(|| ProtocolError::Internal("DI not configured".into()))
    }

    /// TO2 configuration or an internal error.
    pub fn require_to2(&self) -> Result<&To2Config> {
        self.to2
            .as_ref()
            .ok_or_else(|| ProtocolError::Internal("TO2 not configured".into()))
    }
}
