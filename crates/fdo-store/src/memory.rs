//! In-memory store for tests and single-process deployments.
//!
//! All tables live in mutex-guarded maps. `with_voucher` holds the
//! voucher map's lock for the duration of the closure, which makes
//! per-GUID mutations trivially linearizable.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use fdo_types::Guid;

use crate::{
    DevmodStore, OwnerKeyStore, Result, RvBlob, RvBlobStore, SessionStore, StoreError, Token,
    VoucherStore,
};

/// Default session lifetime.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30);

struct SessionRow {
    state: Vec<u8>,
    expires_at: u64,
}

/// One store implementing every contract.
pub struct MemoryStore {
    session_ttl: u64,
    sessions: Mutex<HashMap<String, SessionRow>>,
    vouchers: Mutex<HashMap<String, Vec<u8>>>,
    rv_blobs: Mutex<HashMap<String, (Vec<u8>, u64)>>,
    devmod: Mutex<HashMap<String, Vec<u8>>>,
    keys: Mutex<HashMap<u8, (Vec<u8>, Vec<u8>)>>,
}

impl MemoryStore {
    /// Create a store with the default 30-second session TTL.
    pub fn new() -> Self {
        Self::with_session_ttl(DEFAULT_SESSION_TTL)
    }

    /// Create a store with an explicit session TTL.
    pub fn with_session_ttl(ttl: Duration) -> Self {
        Self {
            session_ttl: ttl.as_secs(),
            sessions: Mutex::new(HashMap::new()),
            vouchers: Mutex::new(HashMap::new()),
            rv_blobs: Mutex::new(HashMap::new()),
            devmod: Mutex::new(HashMap::new()),
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        // A poisoned lock means another thread panicked while holding it;
        // the maps hold plain data, so continuing is sound.
        match mutex.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, token: &Token, now: u64) -> Result<Vec<u8>> {
        let sessions = self.lock(&self.sessions);
        match sessions.get(token.as_str()) {
            Some(row) if row.expires_at > now => Ok(row.state.clone()),
            _ => Err(StoreError::NotFound("session")),
        }
    }

    fn put(&self, token: &Token, state: Vec<u8>, now: u64) -> Result<()> {
        let mut sessions = self.lock(&self.sessions);
        sessions.insert(
            token.as_str().to_string(),
            SessionRow {
                state,
                expires_at: now + self.session_ttl,
            },
        );
        Ok(())
    }

    fn delete(&self, token: &Token) -> Result<()> {
        self.lock(&self.sessions).remove(token.as_str());
        Ok(())
    }
}

impl VoucherStore for MemoryStore {
    fn insert(&self, guid: &Guid, voucher: &[u8]) -> Result<()> {
        let mut vouchers = self.lock(&self.vouchers);
        if vouchers.contains_key(&guid.to_hex()) {
            return Err(StoreError::Constraint(format!("voucher {guid} already exists")));
        }
        vouchers.insert(guid.to_hex(), voucher.to_vec());
        Ok(())
    }

    fn get(&self, guid: &Guid) -> Result<Vec<u8>> {
        self.lock(&self.vouchers)
            .get(&guid.to_hex())
            .cloned()
            .ok_or(StoreError::NotFound("voucher"))
    }

    fn with_voucher(
        &self,
        guid: &Guid,
        f: &mut dyn FnMut(&mut Vec<u8>) -> Result<()>,
    ) -> Result<()> {
        let mut vouchers = self.lock(&self.vouchers);
        let row = vouchers
            .get_mut(&guid.to_hex())
            .ok_or(StoreError::NotFound("voucher"))?;
        f(row)
    }

    fn replace(&self, old_guid: &Guid, new_guid: &Guid, voucher: &[u8]) -> Result<()> {
        let mut vouchers = self.lock(&self.vouchers);
        vouchers.remove(&old_guid.to_hex());
        vouchers.insert(new_guid.to_hex(), voucher.to_vec());
        Ok(())
    }

    fn remove(&self, guid: &Guid) -> Result<()> {
        self.lock(&self.vouchers).remove(&guid.to_hex());
        Ok(())
    }
}

impl RvBlobStore for MemoryStore {
    fn put_rv_blob(&self, guid: &Guid, blob: &RvBlob, wait_seconds: u32, now: u64) -> Result<()> {
        let encoded =
            fdo_cbor::to_vec(blob).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.lock(&self.rv_blobs)
            .insert(guid.to_hex(), (encoded, now + wait_seconds as u64));
        Ok(())
    }

    fn get_rv_blob(&self, guid: &Guid, now: u64) -> Result<RvBlob> {
        let blobs = self.lock(&self.rv_blobs);
        match blobs.get(&guid.to_hex()) {
            Some((bytes, expires_at)) if *expires_at > now => {
                fdo_cbor::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
            }
            _ => Err(StoreError::NotFound("rendezvous blob")),
        }
    }
}

impl DevmodStore for MemoryStore {
    fn put_devmod(&self, guid: &Guid, devmod_cbor: &[u8]) -> Result<()> {
        self.lock(&self.devmod).insert(guid.to_hex(), devmod_cbor.to_vec());
        Ok(())
    }

    fn get_devmod(&self, guid: &Guid) -> Result<Vec<u8>> {
        self.lock(&self.devmod)
            .get(&guid.to_hex())
            .cloned()
            .ok_or(StoreError::NotFound("devmod"))
    }
}

impl OwnerKeyStore for MemoryStore {
    fn put_key(&self, key_type: u8, pk_bytes: &[u8], priv_ref: &[u8]) -> Result<()> {
        self.lock(&self.keys)
            .insert(key_type, (pk_bytes.to_vec(), priv_ref.to_vec()));
        Ok(())
    }

    fn get_key(&self, key_type: u8) -> Result<(Vec<u8>, Vec<u8>)> {
        self.lock(&self.keys)
            .get(&key_type)
            .cloned()
            .ok_or(StoreError::NotFound("owner key"))
    }
}
