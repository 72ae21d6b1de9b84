//! Account repository (§4.3): accounts, hashed API keys, credit columns.

use chrono::Utc;
use rand::RngCore;
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::Db;

pub const API_KEY_PREFIX: &str = "rslive_v1_";

#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub plan_name: String,
    pub token_remaining: i64,
    pub topup_remaining: i64,
    pub status: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRow {
    pub key_hash: String,
    pub account_id: String,
    pub key_indicator: String,
    pub label: String,
    pub created_at: String,
    pub expires_at: Option<String>,
    pub last_used_at: Option<String>,
}

fn default_token_allocation(plan_name: &str) -> i64 {
    match plan_name {
        "Pro" => 50_000,
        "Enterprise" => 500_000,
        _ => 1_000,
    }
}

fn hash_key(plain_key: &str) -> String {
    let digest = Sha256::digest(plain_key.as_bytes());
    hex::encode(digest)
}

/// Exposed for the business service, which needs to hash a presented key
/// before delegating to the session repository's join query.
pub fn hash_key_pub(plain_key: &str) -> String {
    hash_key(plain_key)
}

/// Minimal hex encode so we don't need to pull in a whole `hex` crate just
/// for this; kept private to the module.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        let bytes = bytes.as_ref();
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            write!(out, "{b:02x}").unwrap();
        }
        out
    }
}

impl Db {
    pub async fn create_account(
        &self,
        email: String,
        plan_name: Option<String>,
        token_remaining: Option<i64>,
        topup_remaining: Option<i64>,
    ) -> rusqlite::Result<Account> {
        let plan_name = plan_name.unwrap_or_else(|| "Free".to_string());
        let token_remaining = token_remaining.unwrap_or_else(|| default_token_allocation(&plan_name));
        let topup_remaining = topup_remaining.unwrap_or(0);
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        self.with_conn({
            let id = id.clone();
            let email = email.clone();
            let plan_name = plan_name.clone();
            let now = now.clone();
            move |conn| {
                conn.execute(
                    "INSERT INTO accounts (id, email, plan_name, token_remaining, topup_remaining, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
                    params![id, email, plan_name, token_remaining, topup_remaining, now],
                )?;
                Ok(())
            }
        })
        .await?;

        Ok(Account {
            id,
            email,
            plan_name,
            token_remaining,
            topup_remaining,
            status: 1,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub async fn get_account(&self, id: &str) -> rusqlite::Result<Option<Account>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, email, plan_name, token_remaining, topup_remaining, status, created_at, updated_at
                 FROM accounts WHERE id = ?1",
                params![id],
                row_to_account,
            )
            .optional()
        })
        .await
    }

    pub async fn create_api_key(
        &self,
        account_id: String,
        label: String,
        expires_at: Option<String>,
    ) -> rusqlite::Result<(ApiKeyRow, String)> {
        let mut random_bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut random_bytes);
        let plain_key = format!("{}{}", API_KEY_PREFIX, hex::encode(random_bytes));
        let key_hash = hash_key(&plain_key);
        let label = label.chars().take(30).collect::<String>();
        let key_indicator = key_indicator(&plain_key);
        let now = Utc::now().to_rfc3339();

        self.with_conn({
            let key_hash = key_hash.clone();
            let account_id = account_id.clone();
            let key_indicator = key_indicator.clone();
            let label = label.clone();
            let now = now.clone();
            let expires_at = expires_at.clone();
            move |conn| {
                conn.execute(
                    "INSERT INTO api_keys (key_hash, account_id, key_indicator, label, created_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![key_hash, account_id, key_indicator, label, now, expires_at],
                )?;
                Ok(())
            }
        })
        .await?;

        Ok((
            ApiKeyRow {
                key_hash,
                account_id,
                key_indicator,
                label,
                created_at: now,
                expires_at,
                last_used_at: None,
            },
            plain_key,
        ))
    }

    pub async fn validate_api_key(&self, plain_key: &str) -> rusqlite::Result<Option<ApiKeyRow>> {
        let key_hash = hash_key(plain_key);
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT key_hash, account_id, key_indicator, label, created_at, expires_at, last_used_at
                 FROM api_keys
                 WHERE key_hash = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key_hash, Utc::now().to_rfc3339()],
                row_to_api_key,
            )
            .optional()
        })
        .await
    }

    pub async fn revoke_api_key(&self, key_hash: &str) -> rusqlite::Result<bool> {
        let key_hash = key_hash.to_string();
        let now = Utc::now().to_rfc3339();
        let affected = self
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE api_keys SET expires_at = ?1 WHERE key_hash = ?2",
                    params![now, key_hash],
                )
            })
            .await?;
        Ok(affected > 0)
    }

    pub async fn get_credits(&self, account_id: &str) -> rusqlite::Result<i64> {
        let account = self.get_account(account_id).await?;
        Ok(account
            .map(|a| a.token_remaining + a.topup_remaining)
            .unwrap_or(0))
    }
}

fn key_indicator(plain_key: &str) -> String {
    let chars: Vec<char> = plain_key.chars().collect();
    let prefix: String = chars.iter().take(5).collect();
    let suffix: String = chars.iter().rev().take(5).collect::<Vec<_>>().into_iter().rev().collect();
    format!("{prefix}...{suffix}")
}

fn row_to_account(row: &rusqlite::Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        email: row.get(1)?,
        plan_name: row.get(2)?,
        token_remaining: row.get(3)?,
        topup_remaining: row.get(4)?,
        status: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn row_to_api_key(row: &rusqlite::Row) -> rusqlite::Result<ApiKeyRow> {
    Ok(ApiKeyRow {
        key_hash: row.get(0)?,
        account_id: row.get(1)?,
        key_indicator: row.get(2)?,
        label: row.get(3)?,
        created_at: row.get(4)?,
        expires_at: row.get(5)?,
        last_used_at: row.get(6)?,
    })
}
