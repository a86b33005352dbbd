//! Schema migrations, tracked through `PRAGMA user_version`.

use rusqlite::Connection;
use tracing::info;

use crate::schema::SCHEMA_V1;
use crate::{Result, StoreError};

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Run any pending migrations.
pub fn run(conn: &Connection) -> Result<()> {
    let version: u32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(StoreError::Sqlite)?;

    if version < 1 {
        conn.execute_batch(SCHEMA_V1)
            .map_err(|e| StoreError::Migration(format!("v1: {e}")))?;
        conn.pragma_update(None, "user_version", 1)
            .map_err(|e| StoreError::Migration(format!("v1 version bump: {e}")))?;
        info!("applied store schema v1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().expect("open");
        run(&conn).expect("first run");
        run(&conn).expect("second run");
        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .expect("version");
        assert_eq!(version, SCHEMA_VERSION);
    }
}
