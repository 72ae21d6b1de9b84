//! Owns the sole writer handle to the encrypted relational file (§3, §5).
//!
//! `rusqlite::Connection` is `Send` but not `Sync`; we share one connection
//! across async handlers behind a blocking mutex and hop onto a blocking
//! thread for every query, mirroring the `Arc<Mutex<Connection>>` pattern
//! used for the archive worker's SQLite access.

pub mod accounts;
pub mod sessions;
pub mod usage;

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use crate::migrator;

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the encrypted database file, apply the encryption
    /// key pragma, and run all pending migrations.
    pub fn open(db_path: &str, encryption_key: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(db_path)?;
        // The encryption and B-tree internals are library-provided; the
        // core's only contract with them is supplying the key at open time.
        conn.pragma_update(None, "key", encryption_key)?;
        conn.pragma_update(None, "foreign_keys", true)?;

        let results = migrator::run_all(&conn, &migrator::migrations());
        for (name, result) in &results {
            if let migrator::StepResult::Failed(msg) = result {
                return Err(rusqlite::Error::InvalidParameterName(format!(
                    "migration {name} failed: {msg}"
                )));
            }
        }
        info!("datastore schema up to date ({} migrations checked)", results.len());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure with exclusive access to the connection on a blocking
    /// thread. All repository methods are built on top of this.
    pub async fn with_conn<F, T>(&self, f: F) -> rusqlite::Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .expect("db worker thread panicked")
    }

    /// Run a closure with exclusive access and an open transaction,
    /// committing on `Ok` and rolling back on `Err`. Used by the usage
    /// repository's atomic cascading deduction (§4.4).
    pub async fn with_transaction<F, T>(&self, f: F) -> rusqlite::Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            let tx = guard.transaction()?;
            let result = f(&tx)?;
            tx.commit()?;
            Ok(result)
        })
        .await
        .expect("db worker thread panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `:memory:` connections can't exercise file creation or the
    /// reopen-and-migrate-again path; this opens a real file on disk.
    #[tokio::test]
    async fn opens_a_real_file_runs_migrations_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.db");
        let path = path.to_str().unwrap();

        let db = Db::open(path, "test-key").unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO accounts (id, email, plan_name, token_remaining, topup_remaining, status, created_at, updated_at)
                 VALUES ('acct1', 'a@example.com', 'Free', 1000, 0, 1, datetime('now'), datetime('now'))",
                [],
            )
        })
        .await
        .unwrap();
        drop(db);

        assert!(std::path::Path::new(path).exists());

        let reopened = Db::open(path, "test-key").unwrap();
        let email: String = reopened
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT email FROM accounts WHERE id = 'acct1'",
                    [],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        assert_eq!(email, "a@example.com");
    }
}
