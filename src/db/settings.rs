use super::Db;
use anyhow::Result;

/// Typed read-through over `app_settings` (`spec.md` §3, §6). Structured keys
/// partition the namespace: `pipeline.<name>`, `pricing.<model>.<input|output>`,
/// `cache.<provider>.<create|read>`, `agent.<name>.<provider|model|prompt|tools>`,
/// `git.user.<name|email>`, plus the four top-level cost-limit keys.
pub struct SettingsStore<'a> {
    db: &'a Db,
}

impl<'a> SettingsStore<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM app_settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.db.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_raw(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO app_settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM app_settings WHERE key = ?")
            .bind(key)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    /// Parses a numeric tunable, tolerating an absent key or a non-numeric value by
    /// falling back to `default` rather than panicking (`spec.md` §9).
    pub async fn get_numeric(&self, key: &str, default: f64) -> f64 {
        match self.get_raw(key).await {
            Ok(Some(raw)) => raw.trim().parse::<f64>().unwrap_or(default),
            _ => default,
        }
    }

    pub async fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get_raw(key).await {
            Ok(Some(raw)) => match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => default,
            },
            _ => default,
        }
    }

    /// Loads the whole `pipeline.*` namespace into a typed `PipelineConfig`, one
    /// key per field, defaulting each independently.
    pub async fn pipeline_config(&self) -> crate::config::PipelineConfig {
        let d = crate::config::PipelineConfig::default();
        crate::config::PipelineConfig {
            max_build_fix_attempts: self
                .get_numeric("pipeline.maxBuildFixAttempts", d.max_build_fix_attempts as f64)
                .await as u32,
            max_remediation_cycles: self
                .get_numeric(
                    "pipeline.maxRemediationCycles",
                    d.max_remediation_cycles as f64,
                )
                .await as u32,
            build_fix_max_output_tokens: self
                .get_numeric(
                    "pipeline.buildFixMaxOutputTokens",
                    d.build_fix_max_output_tokens as f64,
                )
                .await as u32,
            build_fix_max_tool_steps: self
                .get_numeric(
                    "pipeline.buildFixMaxToolSteps",
                    d.build_fix_max_tool_steps as f64,
                )
                .await as u32,
            default_max_output_tokens: self
                .get_numeric(
                    "pipeline.defaultMaxOutputTokens",
                    d.default_max_output_tokens as f64,
                )
                .await as u32,
            default_max_tool_steps: self
                .get_numeric("pipeline.defaultMaxToolSteps", d.default_max_tool_steps as f64)
                .await as u32,
            build_timeout_ms: self
                .get_numeric("pipeline.buildTimeoutMs", d.build_timeout_ms as f64)
                .await as u64,
            test_timeout_ms: self
                .get_numeric("pipeline.testTimeoutMs", d.test_timeout_ms as f64)
                .await as u64,
            max_test_failures: self
                .get_numeric("pipeline.maxTestFailures", d.max_test_failures as f64)
                .await as u32,
            max_unique_errors: self
                .get_numeric("pipeline.maxUniqueErrors", d.max_unique_errors as f64)
                .await as u32,
            warning_threshold: self
                .get_numeric("pipeline.warningThreshold", d.warning_threshold as f64)
                .await as u32,
            max_versions_retained: self
                .get_numeric("pipeline.maxVersionsRetained", d.max_versions_retained as f64)
                .await as u32,
            max_agent_versions_per_run: self
                .get_numeric(
                    "pipeline.maxAgentVersionsPerRun",
                    d.max_agent_versions_per_run as f64,
                )
                .await as u32,
            max_retries: self.get_numeric("pipeline.maxRetries", d.max_retries as f64).await as u32,
            allow_shell_tools: self
                .get_bool("pipeline.allowShellTools", d.allow_shell_tools)
                .await,
        }
    }

    /// Top-level cost-limit keys; `0` means unlimited (`spec.md` §6, §8).
    pub async fn max_tokens_per_chat(&self) -> f64 {
        self.get_numeric("maxTokensPerChat", 0.0).await
    }

    pub async fn max_cost_per_day(&self) -> f64 {
        self.get_numeric("maxCostPerDay", 0.0).await
    }

    pub async fn max_cost_per_project(&self) -> f64 {
        self.get_numeric("maxCostPerProject", 0.0).await
    }

    pub async fn git_user_name(&self) -> String {
        self.get_raw("git.user.name")
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| "pipeline-core".to_string())
    }

    pub async fn git_user_email(&self) -> String {
        self.get_raw("git.user.email")
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| "pipeline-core@local".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    #[tokio::test]
    async fn numeric_setting_falls_back_on_garbage() {
        let db = Db::connect_memory().await.unwrap();
        let settings = SettingsStore::new(&db);
        settings.set_raw("pipeline.maxRetries", "not-a-number").await.unwrap();
        let cfg = settings.pipeline_config().await;
        assert_eq!(cfg.max_retries, 3);
    }

    #[tokio::test]
    async fn numeric_setting_absent_uses_default() {
        let db = Db::connect_memory().await.unwrap();
        let settings = SettingsStore::new(&db);
        assert_eq!(settings.max_tokens_per_chat().await, 0.0);
    }
}
