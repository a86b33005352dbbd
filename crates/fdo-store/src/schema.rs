//! SQL schema definitions.

/// Complete schema, version 1.
pub const SCHEMA_V1: &str = r#"
-- ============================================================
-- Protocol sessions (volatile; one row per bearer token)
-- ============================================================

CREATE TABLE IF NOT EXISTS sessions (
    token TEXT PRIMARY KEY,
    state_cbor BLOB NOT NULL,
    updated_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_expiry ON sessions(expires_at);

-- ============================================================
-- Ownership vouchers (exact bytes as received or extended)
-- ============================================================

CREATE TABLE IF NOT EXISTS vouchers (
    guid TEXT PRIMARY KEY,
    voucher_bytes BLOB NOT NULL
);

-- ============================================================
-- Owner rendezvous blobs (at most one per GUID, TTL-bounded)
-- ============================================================

CREATE TABLE IF NOT EXISTS rv_blobs (
    guid TEXT PRIMARY KEY,
    blob_cbor BLOB NOT NULL,
    expires_at INTEGER NOT NULL
);

-- ============================================================
-- Owner and manufacturer keys (read-only after process init)
-- ============================================================

CREATE TABLE IF NOT EXISTS owner_keys (
    key_type INTEGER PRIMARY KEY,
    pk_bytes BLOB NOT NULL,
    priv_ref BLOB NOT NULL
);

-- ============================================================
-- Devmod descriptors reported during TO2
-- ============================================================

CREATE TABLE IF NOT EXISTS devmod (
    guid TEXT PRIMARY KEY,
    devmod_cbor BLOB NOT NULL
);
"#;
