//! Usage repository (§4.4): append-only usage log plus atomic cascading
//! credit deduction against the owning account, in one transaction.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::Db;

#[derive(Debug, Clone, Copy)]
pub struct Balances {
    pub token_remaining: i64,
    pub topup_remaining: i64,
}

impl Db {
    /// Insert a usage row and update the account's balances atomically.
    /// Drains `topup_remaining` to zero before touching `token_remaining`,
    /// which may go negative. Fails (and rolls back) if the account is
    /// missing.
    pub async fn insert_usage(
        &self,
        account_id: String,
        session_id: String,
        provider: String,
        input_tokens: i64,
        output_tokens: i64,
    ) -> rusqlite::Result<Balances> {
        let now = Utc::now().to_rfc3339();
        let total_tokens = input_tokens + output_tokens;

        self.with_transaction(move |tx| {
            let current: Option<Balances> = tx
                .query_row(
                    "SELECT token_remaining, topup_remaining FROM accounts WHERE id = ?1",
                    params![account_id],
                    |row| {
                        Ok(Balances {
                            token_remaining: row.get(0)?,
                            topup_remaining: row.get(1)?,
                        })
                    },
                )
                .optional()?;

            let Some(current) = current else {
                return Err(rusqlite::Error::QueryReturnedNoRows);
            };

            let mut remaining = total_tokens;
            let mut topup_remaining = current.topup_remaining;
            if topup_remaining >= remaining {
                topup_remaining -= remaining;
                remaining = 0;
            } else {
                remaining -= topup_remaining;
                topup_remaining = 0;
            }
            let mut token_remaining = current.token_remaining;
            if remaining > 0 {
                token_remaining -= remaining;
            }

            tx.execute(
                "INSERT INTO usage_metrics (account_id, session_id, provider, input_tokens, output_tokens, total_tokens, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![account_id, session_id, provider, input_tokens, output_tokens, total_tokens, now],
            )?;

            tx.execute(
                "UPDATE accounts SET token_remaining = ?1, topup_remaining = ?2, updated_at = ?3 WHERE id = ?4",
                params![token_remaining, topup_remaining, now, account_id],
            )?;

            Ok(Balances {
                token_remaining,
                topup_remaining,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn topup_is_drained_before_subscription_balance() {
        let db = Db::open(":memory:", "k").unwrap();
        let account = db
            .create_account("u@example.com".into(), None, Some(1000), Some(30))
            .await
            .unwrap();

        let balances = db
            .insert_usage(account.id.clone(), "S1".into(), "OPENAI".into(), 10, 20)
            .await
            .unwrap();
        assert_eq!(balances.topup_remaining, 0);
        assert_eq!(balances.token_remaining, 1000);
    }

    #[tokio::test]
    async fn subscription_balance_may_go_negative() {
        let db = Db::open(":memory:", "k").unwrap();
        let account = db
            .create_account("u2@example.com".into(), None, Some(40), Some(0))
            .await
            .unwrap();

        let balances = db
            .insert_usage(account.id.clone(), "S1".into(), "OPENAI".into(), 20, 30)
            .await
            .unwrap();
        assert_eq!(balances.topup_remaining, 0);
        assert_eq!(balances.token_remaining, -10);
    }

    #[tokio::test]
    async fn five_completions_then_flush_matches_scenario_one() {
        let db = Db::open(":memory:", "k").unwrap();
        let account = db
            .create_account("u3@example.com".into(), None, Some(1000), Some(0))
            .await
            .unwrap();

        let balances = db
            .insert_usage(account.id.clone(), "S1".into(), "OPENAI".into(), 50, 100)
            .await
            .unwrap();
        assert_eq!(balances.topup_remaining, 0);
        assert_eq!(balances.token_remaining, 850);
    }
}
