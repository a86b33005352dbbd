//! SQLite-backed store for the three services.
//!
//! One connection behind a mutex; WAL mode, foreign keys, and a busy
//! timeout are configured at open. `with_voucher` wraps the closure in
//! an immediate transaction, which gives the exclusive per-GUID hold the
//! protocol relies on.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use fdo_types::Guid;

use crate::memory::DEFAULT_SESSION_TTL;
use crate::{
    migrations, DevmodStore, OwnerKeyStore, Result, RvBlob, RvBlobStore, SessionStore, StoreError,
    Token, VoucherStore,
};

/// SQLite store implementing every contract.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    session_ttl: u64,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_ttl(path, DEFAULT_SESSION_TTL)
    }

    /// Open with an explicit session TTL.
    pub fn open_with_ttl(path: &Path, session_ttl: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        configure(&conn)?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            session_ttl: session_ttl.as_secs(),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            session_ttl: DEFAULT_SESSION_TTL.as_secs(),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Remove expired session rows. Services run this periodically.
    pub fn prune_sessions(&self, now: u64) -> Result<usize> {
        let conn = self.conn();
        let pruned = conn.execute("DELETE FROM sessions WHERE expires_at <= ?1", [now as i64])?;
        if pruned > 0 {
            debug!(pruned, "pruned expired sessions");
        }
        Ok(pruned)
    }
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

impl SessionStore for SqliteStore {
    fn get(&self, token: &Token, now: u64) -> Result<Vec<u8>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT state_cbor FROM sessions WHERE token = ?1 AND expires_at > ?2",
            params![token.as_str(), now as i64],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?
        .ok_or(StoreError::NotFound("session"))
    }

    fn put(&self, token: &Token, state: Vec<u8>, now: u64) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sessions (token, state_cbor, updated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(token) DO UPDATE
             SET state_cbor = ?2, updated_at = ?3, expires_at = ?4",
            params![
                token.as_str(),
                state,
                now as i64,
                (now + self.session_ttl) as i64
            ],
        )?;
        Ok(())
    }

    fn delete(&self, token: &Token) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM sessions WHERE token = ?1", [token.as_str()])?;
        Ok(())
    }
}

impl VoucherStore for SqliteStore {
    fn insert(&self, guid: &Guid, voucher: &[u8]) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO vouchers (guid, voucher_bytes) VALUES (?1, ?2)",
            params![guid.to_hex(), voucher],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Constraint(format!("voucher {guid} already exists"))
            }
            other => StoreError::Sqlite(other),
        })?;
        Ok(())
    }

    fn get(&self, guid: &Guid) -> Result<Vec<u8>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT voucher_bytes FROM vouchers WHERE guid = ?1",
            [guid.to_hex()],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?
        .ok_or(StoreError::NotFound("voucher"))
    }

    fn with_voucher(
        &self,
        guid: &Guid,
        f: &mut dyn FnMut(&mut Vec<u8>) -> Result<()>,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let mut bytes: Vec<u8> = tx
            .query_row(
                "SELECT voucher_bytes FROM vouchers WHERE guid = ?1",
                [guid.to_hex()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::NotFound("voucher"))?;
        f(&mut bytes)?;
        tx.execute(
            "UPDATE vouchers SET voucher_bytes = ?2 WHERE guid = ?1",
            params![guid.to_hex(), bytes],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn replace(&self, old_guid: &Guid, new_guid: &Guid, voucher: &[u8]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM vouchers WHERE guid = ?1", [old_guid.to_hex()])?;
        tx.execute(
            "INSERT INTO vouchers (guid, voucher_bytes) VALUES (?1, ?2)
             ON CONFLICT(guid) DO UPDATE SET voucher_bytes = ?2",
            params![new_guid.to_hex(), voucher],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, guid: &Guid) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM vouchers WHERE guid = ?1", [guid.to_hex()])?;
        Ok(())
    }
}

impl RvBlobStore for SqliteStore {
    fn put_rv_blob(&self, guid: &Guid, blob: &RvBlob, wait_seconds: u32, now: u64) -> Result<()> {
        let encoded =
            fdo_cbor::to_vec(blob).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO rv_blobs (guid, blob_cbor, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(guid) DO UPDATE SET blob_cbor = ?2, expires_at = ?3",
            params![guid.to_hex(), encoded, (now + wait_seconds as u64) as i64],
        )?;
        Ok(())
    }

    fn get_rv_blob(&self, guid: &Guid, now: u64) -> Result<RvBlob> {
        let conn = self.conn();
        let bytes: Vec<u8> = conn
            .query_row(
                "SELECT blob_cbor FROM rv_blobs WHERE guid = ?1 AND expires_at > ?2",
                params![guid.to_hex(), now as i64],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::NotFound("rendezvous blob"))?;
        fdo_cbor::from_slice(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

impl DevmodStore for SqliteStore {
    fn put_devmod(&self, guid: &Guid, devmod_cbor: &[u8]) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO devmod (guid, devmod_cbor) VALUES (?1, ?2)
             ON CONFLICT(guid) DO UPDATE SET devmod_cbor = ?2",
            params![guid.to_hex(), devmod_cbor],
        )?;
        Ok(())
    }

    fn get_devmod(&self, guid: &Guid) -> Result<Vec<u8>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT devmod_cbor FROM devmod WHERE guid = ?1",
            [guid.to_hex()],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(StoreError::NotFound("devmod"))
    }
}

impl OwnerKeyStore for SqliteStore {
    fn put_key(&self, key_type: u8, pk_bytes: &[u8], priv_ref: &[u8]) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO owner_keys (key_type, pk_bytes, priv_ref) VALUES (?1, ?2, ?3)
             ON CONFLICT(key_type) DO UPDATE SET pk_bytes = ?2, priv_ref = ?3",
            params![key_type, pk_bytes, priv_ref],
        )?;
        Ok(())
    }

    fn get_key(&self, key_type: u8) -> Result<(Vec<u8>, Vec<u8>)> {
        let conn = self.conn();
        conn.query_row(
            "SELECT pk_bytes, priv_ref FROM owner_keys WHERE key_type = ?1",
            [key_type],
            |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?)),
        )
        .optional()?
        .ok_or(StoreError::NotFound("owner key"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_bytes::ByteBuf;

    fn test_store() -> SqliteStore {
        SqliteStore::open_memory().expect("open in-memory store")
    }

    #[test]
    fn test_session_roundtrip_and_expiry() {
        let store = test_store();
        let token = store.new_token();
        store.put(&token, vec![1, 2, 3], 1000).expect("put");
        assert_eq!(SessionStore::get(&store, &token, 1001).expect("get"), vec![1, 2, 3]);
        assert!(SessionStore::get(&store, &token, 1000 + 30).is_err());
        store.delete(&token).expect("delete");
        assert!(SessionStore::get(&store, &token, 1001).is_err());
    }

    #[test]
    fn test_prune_sessions() {
        let store = test_store();
        let token = store.new_token();
        store.put(&token, vec![1], 1000).expect("put");
        assert_eq!(store.prune_sessions(2000).expect("prune"), 1);
        assert_eq!(store.prune_sessions(2000).expect("prune"), 0);
    }

    #[test]
    fn test_voucher_lifecycle() {
        let store = test_store();
        let guid = Guid::generate();
        store.insert(&guid, &[0xAA]).expect("insert");
        assert!(matches!(store.insert(&guid, &[0xBB]), Err(StoreError::Constraint(_))));

        store
            .with_voucher(&guid, &mut |bytes| {
                bytes.push(0xCC);
                Ok(())
            })
            .expect("with_voucher");
        assert_eq!(VoucherStore::get(&store, &guid).expect("get"), vec![0xAA, 0xCC]);

        let new_guid = Guid::generate();
        store.replace(&guid, &new_guid, &[0xDD]).expect("replace");
        assert!(VoucherStore::get(&store, &guid).is_err());
        assert_eq!(VoucherStore::get(&store, &new_guid).expect("get"), vec![0xDD]);
    }

    #[test]
    fn test_rv_blob_roundtrip() {
        let store = test_store();
        let guid = Guid::generate();
        let blob = RvBlob {
            to1d: ByteBuf::from(vec![1, 2, 3]),
            device_pk: fdo_types::PublicKey::new(
                fdo_types::KeyType::SecP256,
                fdo_types::KeyEncoding::X5Chain,
                vec![4],
            ),
        };
        store.put_rv_blob(&guid, &blob, 3600, 1000).expect("put");
        let loaded = store.get_rv_blob(&guid, 2000).expect("get");
        assert_eq!(loaded.to1d, blob.to1d);
        assert!(store.get_rv_blob(&guid, 1000 + 3601).is_err());
    }

    #[test]
    fn test_devmod_roundtrip() {
        let store = test_store();
        let guid = Guid::generate();
        store.put_devmod(&guid, &[5, 6]).expect("put");
        assert_eq!(store.get_devmod(&guid).expect("get"), vec![5, 6]);
        store.put_devmod(&guid, &[7]).expect("replace");
        assert_eq!(store.get_devmod(&guid).expect("get"), vec![7]);
    }

    #[test]
    fn test_owner_key_roundtrip() {
        let store = test_store();
        store.put_key(10, &[1, 2], &[3, 4]).expect("put");
        let (pk, priv_ref) = store.get_key(10).expect("get");
        assert_eq!(pk, vec![1, 2]);
        assert_eq!(priv_ref, vec![3, 4]);
    }
}
