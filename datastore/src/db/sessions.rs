//! Session repository (§4.5): session config + conversation blobs keyed by
//! `(account, session, kind)`, with load-by-key join.

use chrono::Utc;
use rusqlite::params;

use super::Db;

pub const KIND_SESSION: &str = "SESSION";
pub const KIND_CONV: &str = "CONV";

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub kind: String,
    pub data: String,
}

/// Result of `load_session_by_key_and_id`: the account's credit columns if
/// the key validated, plus whichever session rows exist (zero, one, or two).
#[derive(Debug, Clone)]
pub struct SessionLoad {
    pub account_id: String,
    pub token_remaining: i64,
    pub topup_remaining: i64,
    pub rows: Vec<SessionRow>,
}

impl Db {
    /// `accounts ⋈ api_keys ⋈ (LEFT JOIN sessions ON same account and given
    /// session_id)`. The LEFT JOIN is mandatory: a valid key with no
    /// session rows must still return the account's credit columns.
    pub async fn load_session_by_key_and_id(
        &self,
        api_key_hash: String,
        session_id: String,
    ) -> rusqlite::Result<Option<SessionLoad>> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT accounts.id, accounts.token_remaining, accounts.topup_remaining,
                        sessions.kind, sessions.data
                 FROM accounts
                 JOIN api_keys ON api_keys.account_id = accounts.id
                 LEFT JOIN sessions
                   ON sessions.account_id = accounts.id AND sessions.session_id = ?1
                 WHERE api_keys.key_hash = ?2
                   AND (api_keys.expires_at IS NULL OR api_keys.expires_at > ?3)",
            )?;

            let mut rows_iter = stmt.query(params![session_id, api_key_hash, now])?;
            let mut account_id: Option<String> = None;
            let mut token_remaining = 0i64;
            let mut topup_remaining = 0i64;
            let mut rows = Vec::new();

            while let Some(row) = rows_iter.next()? {
                account_id = Some(row.get(0)?);
                token_remaining = row.get(1)?;
                topup_remaining = row.get(2)?;
                let kind: Option<String> = row.get(3)?;
                let data: Option<String> = row.get(4)?;
                if let (Some(kind), Some(data)) = (kind, data) {
                    rows.push(SessionRow { kind, data });
                }
            }

            Ok(account_id.map(|account_id| SessionLoad {
                account_id,
                token_remaining,
                topup_remaining,
                rows,
            }))
        })
        .await
    }

    pub async fn upsert_session(
        &self,
        account_id: String,
        session_id: String,
        session_data: String,
    ) -> rusqlite::Result<()> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (account_id, session_id, kind, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(account_id, session_id, kind)
                 DO UPDATE SET data = excluded.data",
                params![account_id, session_id, KIND_SESSION, session_data, now],
            )?;
            Ok(())
        })
        .await
    }

    /// UPSERT that concatenates onto any existing conversation blob.
    pub async fn append_conversation(
        &self,
        account_id: String,
        session_id: String,
        conversation_data: String,
    ) -> rusqlite::Result<()> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (account_id, session_id, kind, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(account_id, session_id, kind)
                 DO UPDATE SET data = data || excluded.data",
                params![account_id, session_id, KIND_CONV, conversation_data, now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn overwrite_conversation(
        &self,
        account_id: String,
        session_id: String,
        content: String,
    ) -> rusqlite::Result<()> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (account_id, session_id, kind, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(account_id, session_id, kind)
                 DO UPDATE SET data = excluded.data",
                params![account_id, session_id, KIND_CONV, content, now],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    fn hash(key: &str) -> String {
        format!("{:x}", Sha256::digest(key.as_bytes()))
    }

    #[tokio::test]
    async fn left_join_returns_account_with_no_session_rows() {
        let db = Db::open(":memory:", "k").unwrap();
        let account = db
            .create_account("a@example.com".into(), None, None, None)
            .await
            .unwrap();
        let (row, _plain) = db
            .create_api_key(account.id.clone(), "default".into(), None)
            .await
            .unwrap();

        let load = db
            .load_session_by_key_and_id(row.key_hash.clone(), "S1".into())
            .await
            .unwrap()
            .expect("valid key must return account row");
        assert_eq!(load.account_id, account.id);
        assert!(load.rows.is_empty());
    }

    #[tokio::test]
    async fn load_returns_both_kinds_when_present() {
        let db = Db::open(":memory:", "k").unwrap();
        let account = db
            .create_account("b@example.com".into(), None, None, None)
            .await
            .unwrap();
        let (row, _plain) = db
            .create_api_key(account.id.clone(), "default".into(), None)
            .await
            .unwrap();

        db.upsert_session(account.id.clone(), "S1".into(), "{}".into())
            .await
            .unwrap();
        db.append_conversation(account.id.clone(), "S1".into(), "user:hi\n".into())
            .await
            .unwrap();

        let load = db
            .load_session_by_key_and_id(row.key_hash, "S1".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(load.rows.len(), 2);
    }

    #[tokio::test]
    async fn append_conversation_concatenates() {
        let db = Db::open(":memory:", "k").unwrap();
        let account = db
            .create_account("c@example.com".into(), None, None, None)
            .await
            .unwrap();
        db.append_conversation(account.id.clone(), "S1".into(), "user:hi\n".into())
            .await
            .unwrap();
        db.append_conversation(account.id.clone(), "S1".into(), "agent:hello\n".into())
            .await
            .unwrap();

        let (_, plain) = db
            .create_api_key(account.id.clone(), "default".into(), None)
            .await
            .unwrap();
        let load = db
            .load_session_by_key_and_id(hash(&plain), "S1".into())
            .await
            .unwrap()
            .unwrap();
        let conv = load.rows.iter().find(|r| r.kind == KIND_CONV).unwrap();
        assert_eq!(conv.data, "user:hi\nagent:hello\n");
    }
}
