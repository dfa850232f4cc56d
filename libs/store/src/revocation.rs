//! Revoked-token set: durable rows plus an in-memory cache so the hot-path
//! check during token verification never touches the database.

use std::collections::HashSet;
use std::sync::RwLock;

use crate::db::{Database, StoreError};

pub struct RevocationStore {
    db: Database,
    cache: RwLock<HashSet<String>>,
}

impl RevocationStore {
    /// Open the store and hydrate the cache from the durable set.
    pub fn open(db: Database) -> Result<Self, StoreError> {
        let revoked = db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT jti FROM revoked_tokens")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<HashSet<_>, _>>()?;
            Ok(rows)
        })?;

        Ok(Self {
            db,
            cache: RwLock::new(revoked),
        })
    }

    /// Revocation is permanent; revoking twice is a no-op.
    pub fn revoke(&self, jti: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO revoked_tokens (jti, revoked_at) VALUES (?1, ?2)",
                rusqlite::params![jti, chrono::Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })?;
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(jti.to_string());
        }
        Ok(())
    }

    pub fn is_revoked(&self, jti: &str) -> bool {
        self.cache
            .read()
            .map(|cache| cache.contains(jti))
            .unwrap_or(true)
    }

    pub fn list(&self) -> Result<Vec<(String, String)>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT jti, revoked_at FROM revoked_tokens ORDER BY revoked_at")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}
