//! Ordered, idempotent schema migrations (§4.6).
//!
//! Each migration's `up` step returns [`StepResult::Executed`] or
//! [`StepResult::Skipped`]; a migration that finds its target object already
//! present must short-circuit to `Skipped`. `run_all` invokes each `up` in
//! order and stops at the first failure.

use rusqlite::Connection;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Executed,
    Skipped,
    Failed(String),
}

pub struct Migration {
    pub name: &'static str,
    pub up: fn(&Connection) -> rusqlite::Result<StepResult>,
}

pub fn table_exists(conn: &Connection, name: &str) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1",
        [name],
        |_| Ok(()),
    )
    .is_ok()
}

pub fn column_exists(conn: &Connection, table: &str, column: &str) -> bool {
    let sql = format!("PRAGMA table_info({table})");
    let Ok(mut stmt) = conn.prepare(&sql) else {
        return false;
    };
    let Ok(mut rows) = stmt.query([]) else {
        return false;
    };
    while let Ok(Some(row)) = rows.next() {
        let name: String = row.get_unwrap::<_, String>(1);
        if name == column {
            return true;
        }
    }
    false
}

pub fn index_exists(conn: &Connection, name: &str) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type='index' AND name=?1",
        [name],
        |_| Ok(()),
    )
    .is_ok()
}

pub fn trigger_exists(conn: &Connection, name: &str) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type='trigger' AND name=?1",
        [name],
        |_| Ok(()),
    )
    .is_ok()
}

pub fn table_is_empty(conn: &Connection, table: &str) -> bool {
    let sql = format!("SELECT COUNT(*) FROM {table}");
    conn.query_row(&sql, [], |row| row.get::<_, i64>(0))
        .map(|count| count == 0)
        .unwrap_or(true)
}

pub fn row_exists(conn: &Connection, table: &str, where_clause: &str) -> bool {
    let sql = format!("SELECT 1 FROM {table} WHERE {where_clause} LIMIT 1");
    conn.query_row(&sql, [], |_| Ok(())).is_ok()
}

pub fn run_all(conn: &Connection, migrations: &[Migration]) -> Vec<(&'static str, StepResult)> {
    let mut results = Vec::with_capacity(migrations.len());
    for migration in migrations {
        let outcome = match (migration.up)(conn) {
            Ok(result) => result,
            Err(e) => StepResult::Failed(e.to_string()),
        };
        match &outcome {
            StepResult::Executed => info!("migration {} executed", migration.name),
            StepResult::Skipped => info!("migration {} skipped (already applied)", migration.name),
            StepResult::Failed(msg) => {
                warn!("migration {} failed: {}", migration.name, msg);
                results.push((migration.name, outcome));
                break;
            }
        }
        results.push((migration.name, outcome));
    }
    results
}

pub fn migrations() -> Vec<Migration> {
    vec![
        Migration {
            name: "0001_create_accounts",
            up: |conn| {
                if table_exists(conn, "accounts") {
                    return Ok(StepResult::Skipped);
                }
                conn.execute_batch(
                    "CREATE TABLE accounts (
                        id TEXT PRIMARY KEY,
                        email TEXT UNIQUE NOT NULL,
                        plan_name TEXT NOT NULL,
                        token_remaining INTEGER NOT NULL,
                        topup_remaining INTEGER NOT NULL,
                        status INTEGER NOT NULL,
                        created_at TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    );
                    CREATE INDEX idx_accounts_email ON accounts(email);
                    CREATE INDEX idx_accounts_status ON accounts(status);",
                )?;
                Ok(StepResult::Executed)
            },
        },
        Migration {
            name: "0002_create_api_keys",
            up: |conn| {
                if table_exists(conn, "api_keys") {
                    return Ok(StepResult::Skipped);
                }
                conn.execute_batch(
                    "CREATE TABLE api_keys (
                        key_hash TEXT PRIMARY KEY,
                        account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                        key_indicator TEXT NOT NULL,
                        label TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        expires_at TEXT,
                        last_used_at TEXT
                    );
                    CREATE INDEX idx_api_keys_account_id ON api_keys(account_id);",
                )?;
                Ok(StepResult::Executed)
            },
        },
        Migration {
            name: "0003_create_sessions",
            up: |conn| {
                if table_exists(conn, "sessions") {
                    return Ok(StepResult::Skipped);
                }
                conn.execute_batch(
                    "CREATE TABLE sessions (
                        account_id TEXT NOT NULL,
                        session_id TEXT NOT NULL,
                        kind TEXT NOT NULL CHECK (kind IN ('SESSION', 'CONV')),
                        data TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        PRIMARY KEY (account_id, session_id, kind)
                    );
                    CREATE INDEX idx_sessions_created_at ON sessions(created_at);",
                )?;
                Ok(StepResult::Executed)
            },
        },
        Migration {
            name: "0004_create_usage_metrics",
            up: |conn| {
                if table_exists(conn, "usage_metrics") {
                    return Ok(StepResult::Skipped);
                }
                conn.execute_batch(
                    "CREATE TABLE usage_metrics (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        account_id TEXT NOT NULL,
                        session_id TEXT NOT NULL,
                        provider TEXT NOT NULL,
                        input_tokens INTEGER NOT NULL,
                        output_tokens INTEGER NOT NULL,
                        total_tokens INTEGER NOT NULL,
                        created_at TEXT NOT NULL
                    );
                    CREATE INDEX idx_usage_account ON usage_metrics(account_id);
                    CREATE INDEX idx_usage_provider ON usage_metrics(provider);
                    CREATE INDEX idx_usage_time ON usage_metrics(created_at);
                    CREATE INDEX idx_usage_account_time ON usage_metrics(account_id, created_at);",
                )?;
                Ok(StepResult::Executed)
            },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_all_migrations_twice_skips_the_second_time() {
        let conn = Connection::open_in_memory().unwrap();
        let migs = migrations();

        let first = run_all(&conn, &migs);
        assert!(first.iter().all(|(_, r)| *r == StepResult::Executed));

        let second = run_all(&conn, &migs);
        assert!(second.iter().all(|(_, r)| *r == StepResult::Skipped));
    }

    #[test]
    fn precondition_helpers_see_created_objects() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn, &migrations());
        assert!(table_exists(&conn, "accounts"));
        assert!(column_exists(&conn, "accounts", "token_remaining"));
        assert!(index_exists(&conn, "idx_accounts_email"));
        assert!(table_is_empty(&conn, "accounts"));
        assert!(!trigger_exists(&conn, "nonexistent_trigger"));
    }
}
