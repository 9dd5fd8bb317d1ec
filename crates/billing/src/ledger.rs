//! Credit Ledger
//!
//! Owns the authoritative per-user credit balance and the append-only
//! transaction log. Every balance mutation goes through one of the atomic
//! operations here; the balance row and its log entry commit together or not
//! at all.
//!
//! Concurrency: debits use a single conditional `UPDATE .. WHERE balance >=
//! amount`, so two simultaneous debits for the same user serialize on the row
//! and can never jointly overdraw. No process-wide locks are held across I/O.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use partlens_shared::{TransactionReason, UserId};

use crate::error::{BillingError, BillingResult};

/// A user's balance as seen by callers.
///
/// Administrative accounts are exempt from credit checks and report
/// `Unlimited` rather than any numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "credits")]
pub enum Balance {
    Credits(i64),
    Unlimited,
}

/// Outcome of a successful debit
#[derive(Debug, Clone, Copy)]
pub struct DebitReceipt {
    pub balance_before: i64,
    pub balance_after: i64,
    /// Exempt accounts debit nothing; no transaction row is written
    pub exempt: bool,
}

/// One row of the append-only ledger log
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub delta: i64,
    pub reason: String,
    pub balance_after: i64,
    pub created_at: OffsetDateTime,
}

/// Service owning all credit balance mutations
#[derive(Clone)]
pub struct CreditLedger {
    pool: PgPool,
}

impl CreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Whether the user bypasses credit accounting entirely
    pub async fn is_exempt(&self, user_id: UserId) -> BillingResult<bool> {
        let row: Option<(String,)> = sqlx::query_as("SELECT role FROM users WHERE id = $1")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;

        Ok(matches!(row, Some((role,)) if role == "admin"))
    }

    /// Side-effect-free balance read
    pub async fn get_balance(&self, user_id: UserId) -> BillingResult<Balance> {
        if self.is_exempt(user_id).await? {
            return Ok(Balance::Unlimited);
        }

        let row: Option<(i64,)> =
            sqlx::query_as("SELECT balance FROM credit_balances WHERE user_id = $1")
                .bind(user_id.0)
                .fetch_optional(&self.pool)
                .await?;

        Ok(Balance::Credits(row.map(|(b,)| b).unwrap_or(0)))
    }

    /// Atomically debit `amount` credits, recording the transaction in the
    /// same unit of work.
    ///
    /// The conditional UPDATE affects zero rows when the balance is short, in
    /// which case nothing is written and `InsufficientCredits` is returned.
    /// Exempt accounts succeed without touching the ledger.
    pub async fn try_debit(&self, user_id: UserId, amount: i64) -> BillingResult<DebitReceipt> {
        if amount <= 0 {
            return Err(BillingError::InvalidRequest(format!(
                "Debit amount must be positive, got {}",
                amount
            )));
        }

        if self.is_exempt(user_id).await? {
            tracing::debug!(user_id = %user_id, "Exempt account, skipping debit");
            return Ok(DebitReceipt {
                balance_before: 0,
                balance_after: 0,
                exempt: true,
            });
        }

        let mut tx = self.pool.begin().await?;

        let updated: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE credit_balances
            SET balance = balance - $2, updated_at = NOW()
            WHERE user_id = $1 AND balance >= $2
            RETURNING balance
            "#,
        )
        .bind(user_id.0)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?;

        let balance_after = match updated {
            Some((b,)) => b,
            None => {
                // Short balance (or no balance row at all): nothing written
                tx.rollback().await?;
                let available = match self.get_balance(user_id).await? {
                    Balance::Credits(b) => b,
                    Balance::Unlimited => 0,
                };
                return Err(BillingError::InsufficientCredits {
                    available,
                    required: amount,
                });
            }
        };

        sqlx::query(
            r#"
            INSERT INTO credit_transactions (id, user_id, delta, reason, balance_after)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id.0)
        .bind(-amount)
        .bind(TransactionReason::AnalysisDebit.to_string())
        .bind(balance_after)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            amount = amount,
            balance_after = balance_after,
            "Debited credits"
        );

        Ok(DebitReceipt {
            balance_before: balance_after + amount,
            balance_after,
            exempt: false,
        })
    }

    /// Grant credits. Always succeeds; creates the balance row on first use.
    pub async fn credit(
        &self,
        user_id: UserId,
        amount: i64,
        reason: TransactionReason,
    ) -> BillingResult<i64> {
        if amount <= 0 {
            return Err(BillingError::InvalidRequest(format!(
                "Credit amount must be positive, got {}",
                amount
            )));
        }

        let mut tx = self.pool.begin().await?;

        let (balance_after,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO credit_balances (user_id, balance, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id) DO UPDATE
                SET balance = credit_balances.balance + $2, updated_at = NOW()
            RETURNING balance
            "#,
        )
        .bind(user_id.0)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO credit_transactions (id, user_id, delta, reason, balance_after)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id.0)
        .bind(amount)
        .bind(reason.to_string())
        .bind(balance_after)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            amount = amount,
            reason = %reason,
            balance_after = balance_after,
            "Credited"
        );

        Ok(balance_after)
    }

    /// Reverse a prior debit.
    ///
    /// The ledger itself does not dedupe refunds; callers guard against
    /// double-refunding a failed job with `analysis_jobs.credit_reserved`.
    /// Exempt accounts refund nothing since they were never debited.
    pub async fn refund(
        &self,
        user_id: UserId,
        amount: i64,
        reason: TransactionReason,
    ) -> BillingResult<()> {
        if self.is_exempt(user_id).await? {
            return Ok(());
        }
        self.credit(user_id, amount, reason).await?;
        Ok(())
    }

    /// Transaction log for a user, newest first
    pub async fn list_transactions(
        &self,
        user_id: UserId,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<CreditTransaction>> {
        let rows: Vec<CreditTransaction> = sqlx::query_as(
            r#"
            SELECT id, user_id, delta, reason, balance_after, created_at
            FROM credit_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id.0)
        .bind(limit.clamp(1, 200))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_serializes_unlimited_as_sentinel() {
        let v = serde_json::to_value(Balance::Unlimited).unwrap();
        assert_eq!(v["kind"], "unlimited");
        let v = serde_json::to_value(Balance::Credits(7)).unwrap();
        assert_eq!(v["credits"], 7);
    }

    #[test]
    fn test_debit_receipt_balance_arithmetic() {
        let r = DebitReceipt {
            balance_before: 5,
            balance_after: 4,
            exempt: false,
        };
        assert_eq!(r.balance_before - r.balance_after, 1);
    }
}
