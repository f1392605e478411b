pub mod limiter;

use crate::db::Db;
use crate::pricing::PricingEngine;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::Row;

/// Observed or estimated token usage for one model call, matching the §9 design
/// note "Ambient SDK metadata → explicit Usage struct": the model-call capability
/// returns this concrete shape, not an untyped metadata bag.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }
}

#[derive(Debug, Clone)]
pub struct TrackParams<'a> {
    pub execution_id: Option<&'a str>,
    pub chat_id: &'a str,
    pub provider: &'a str,
    pub model: &'a str,
    pub api_key_hash: Option<&'a str>,
    pub usage: Usage,
}

#[derive(Debug, Clone)]
pub struct ProvisionalIds {
    pub token_usage_id: String,
    pub billing_ledger_id: String,
}

/// Write-ahead accounting and post-hoc reconciliation of model spend
/// (`spec.md` §4.2). Every operation that writes both tables does so inside a
/// single `sqlx` transaction: either both rows land or neither does.
pub struct TokenLedger<'a> {
    db: &'a Db,
    pricing: PricingEngine<'a>,
}

impl<'a> TokenLedger<'a> {
    pub fn new(db: &'a Db, pricing: PricingEngine<'a>) -> Self {
        Self { db, pricing }
    }

    /// Denormalized project/chat context carried onto the permanent ledger row so
    /// it remains readable after the owning project/chat is deleted.
    async fn ledger_context(&self, chat_id: &str) -> (Option<String>, Option<String>, Option<String>) {
        let row = sqlx::query(
            "SELECT p.id as project_id, p.name as project_name, c.title as chat_title
             FROM chats c JOIN projects p ON p.id = c.project_id WHERE c.id = ?",
        )
        .bind(chat_id)
        .fetch_optional(&self.db.pool)
        .await
        .ok()
        .flatten();
        match row {
            Some(r) => (
                r.try_get::<String, _>("project_id").ok(),
                r.try_get::<String, _>("project_name").ok(),
                r.try_get::<String, _>("chat_title").ok(),
            ),
            None => (None, None, None),
        }
    }

    /// `track`: a fully-observed, non-provisional usage record (`estimated = 0`).
    pub async fn track(&self, params: TrackParams<'_>) -> Result<ProvisionalIds> {
        let cost = self
            .pricing
            .cost_of(
                params.provider,
                params.model,
                params.usage.input_tokens,
                params.usage.output_tokens,
                params.usage.cache_creation_input_tokens,
                params.usage.cache_read_input_tokens,
            )
            .await;
        self.write_pair(&params, cost, false).await
    }

    /// `trackProvisional`: estimates `outputTokens ≈ 0.3 × estimatedInputTokens`
    /// and writes both rows with `estimated = 1` before the model call is made.
    pub async fn track_provisional(
        &self,
        execution_id: &str,
        chat_id: &str,
        provider: &str,
        model: &str,
        api_key_hash: Option<&str>,
        estimated_input_tokens: u64,
    ) -> Result<ProvisionalIds> {
        let estimated_output = (estimated_input_tokens as f64 * 0.3) as u64;
        let usage = Usage {
            input_tokens: estimated_input_tokens,
            output_tokens: estimated_output,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
        };
        let cost = self
            .pricing
            .cost_of(provider, model, usage.input_tokens, usage.output_tokens, 0, 0)
            .await;
        let params = TrackParams {
            execution_id: Some(execution_id),
            chat_id,
            provider,
            model,
            api_key_hash,
            usage,
        };
        self.write_pair(&params, cost, true).await
    }

    async fn write_pair(
        &self,
        params: &TrackParams<'_>,
        cost: f64,
        estimated: bool,
    ) -> Result<ProvisionalIds> {
        let token_usage_id = uuid::Uuid::new_v4().to_string();
        let billing_ledger_id = uuid::Uuid::new_v4().to_string();
        let now = crate::util::now_millis();
        let (project_id, project_name, chat_title) = self.ledger_context(params.chat_id).await;

        let mut tx = self.db.pool.begin().await?;
        sqlx::query(
            "INSERT INTO token_usage (id, execution_id, chat_id, provider, model, api_key_hash,
                input_tokens, output_tokens, cache_creation_input_tokens, cache_read_input_tokens,
                total_tokens, cost_estimate, estimated, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&token_usage_id)
        .bind(params.execution_id)
        .bind(params.chat_id)
        .bind(params.provider)
        .bind(params.model)
        .bind(params.api_key_hash)
        .bind(params.usage.input_tokens as i64)
        .bind(params.usage.output_tokens as i64)
        .bind(params.usage.cache_creation_input_tokens as i64)
        .bind(params.usage.cache_read_input_tokens as i64)
        .bind(params.usage.total_tokens() as i64)
        .bind(cost)
        .bind(estimated as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO billing_ledger (id, execution_id, chat_id, project_id, project_name,
                chat_title, provider, model, api_key_hash, input_tokens, output_tokens,
                cache_creation_input_tokens, cache_read_input_tokens, total_tokens, cost_estimate,
                estimated, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&billing_ledger_id)
        .bind(params.execution_id)
        .bind(params.chat_id)
        .bind(&project_id)
        .bind(&project_name)
        .bind(&chat_title)
        .bind(params.provider)
        .bind(params.model)
        .bind(params.api_key_hash)
        .bind(params.usage.input_tokens as i64)
        .bind(params.usage.output_tokens as i64)
        .bind(params.usage.cache_creation_input_tokens as i64)
        .bind(params.usage.cache_read_input_tokens as i64)
        .bind(params.usage.total_tokens() as i64)
        .bind(cost)
        .bind(estimated as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ProvisionalIds {
            token_usage_id,
            billing_ledger_id,
        })
    }

    /// `finalize`: recomputes cost from the actual observed usage and updates both
    /// rows in one transaction, clearing `estimated`.
    pub async fn finalize(
        &self,
        ids: &ProvisionalIds,
        actual: Usage,
        provider: &str,
        model: &str,
    ) -> Result<()> {
        let cost = self
            .pricing
            .cost_of(
                provider,
                model,
                actual.input_tokens,
                actual.output_tokens,
                actual.cache_creation_input_tokens,
                actual.cache_read_input_tokens,
            )
            .await;
        let mut tx = self.db.pool.begin().await?;
        sqlx::query(
            "UPDATE token_usage SET input_tokens = ?, output_tokens = ?,
                cache_creation_input_tokens = ?, cache_read_input_tokens = ?, total_tokens = ?,
                cost_estimate = ?, estimated = 0
             WHERE id = ?",
        )
        .bind(actual.input_tokens as i64)
        .bind(actual.output_tokens as i64)
        .bind(actual.cache_creation_input_tokens as i64)
        .bind(actual.cache_read_input_tokens as i64)
        .bind(actual.total_tokens() as i64)
        .bind(cost)
        .bind(&ids.token_usage_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE billing_ledger SET input_tokens = ?, output_tokens = ?,
                cache_creation_input_tokens = ?, cache_read_input_tokens = ?, total_tokens = ?,
                cost_estimate = ?, estimated = 0
             WHERE id = ?",
        )
        .bind(actual.input_tokens as i64)
        .bind(actual.output_tokens as i64)
        .bind(actual.cache_creation_input_tokens as i64)
        .bind(actual.cache_read_input_tokens as i64)
        .bind(actual.total_tokens() as i64)
        .bind(cost)
        .bind(&ids.billing_ledger_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// `void`: deletes both rows in one transaction, leaving zero traces.
    pub async fn void(&self, ids: &ProvisionalIds) -> Result<()> {
        let mut tx = self.db.pool.begin().await?;
        sqlx::query("DELETE FROM token_usage WHERE id = ?")
            .bind(&ids.token_usage_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM billing_ledger WHERE id = ?")
            .bind(&ids.billing_ledger_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// `trackBillingOnly`: system calls with no owning execution (e.g. API-key
    /// validation) write only the permanent ledger.
    pub async fn track_billing_only(
        &self,
        chat_id: Option<&str>,
        provider: &str,
        model: &str,
        api_key_hash: Option<&str>,
        usage: Usage,
    ) -> Result<String> {
        let cost = self
            .pricing
            .cost_of(
                provider,
                model,
                usage.input_tokens,
                usage.output_tokens,
                usage.cache_creation_input_tokens,
                usage.cache_read_input_tokens,
            )
            .await;
        let id = uuid::Uuid::new_v4().to_string();
        let now = crate::util::now_millis();
        let (project_id, project_name, chat_title) = match chat_id {
            Some(cid) => self.ledger_context(cid).await,
            None => (None, None, None),
        };
        sqlx::query(
            "INSERT INTO billing_ledger (id, execution_id, chat_id, project_id, project_name,
                chat_title, provider, model, api_key_hash, input_tokens, output_tokens,
                cache_creation_input_tokens, cache_read_input_tokens, total_tokens, cost_estimate,
                estimated, created_at)
             VALUES (?, NULL, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(&id)
        .bind(chat_id)
        .bind(&project_id)
        .bind(&project_name)
        .bind(&chat_title)
        .bind(provider)
        .bind(model)
        .bind(api_key_hash)
        .bind(usage.input_tokens as i64)
        .bind(usage.output_tokens as i64)
        .bind(usage.cache_creation_input_tokens as i64)
        .bind(usage.cache_read_input_tokens as i64)
        .bind(usage.total_tokens() as i64)
        .bind(cost)
        .bind(now)
        .execute(&self.db.pool)
        .await?;
        Ok(id)
    }

    /// Startup sweep: clears `estimated` on every still-provisional row (the
    /// estimate is the best-available record after a crash mid-call). Never
    /// deletes. Returns the count of rows reconciled.
    pub async fn sweep_orphans(&self) -> Result<u64> {
        let token_usage = sqlx::query("UPDATE token_usage SET estimated = 0 WHERE estimated = 1")
            .execute(&self.db.pool)
            .await?
            .rows_affected();
        sqlx::query("UPDATE billing_ledger SET estimated = 0 WHERE estimated = 1")
            .execute(&self.db.pool)
            .await?;
        Ok(token_usage)
    }
}
