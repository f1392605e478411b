use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

pub mod settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    Stopped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Retrying => "retrying",
            ExecutionStatus::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectRow {
    pub id: String,
    pub name: String,
    pub path: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChatRow {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AgentExecutionRow {
    pub id: String,
    pub chat_id: String,
    pub agent_name: String,
    pub status: String,
    pub input: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub retry_count: i64,
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PipelineRunRow {
    pub id: String,
    pub chat_id: String,
    pub intent: String,
    pub scope: String,
    pub user_message: String,
    pub planned_agents: String,
    pub status: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

/// Wraps the single embedded SQLite file the whole process shares (`spec.md` §5):
/// WAL journaling, foreign-key enforcement, writes serialized through transactions.
pub struct Db {
    pub pool: SqlitePool,
}

impl Db {
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn connect_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn insert_project(&self, id: &str, name: &str, path: &str, now: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO projects (id, name, path, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(name)
        .bind(path)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_chat(&self, id: &str, project_id: &str, title: &str, now: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO chats (id, project_id, title, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(project_id)
        .bind(title)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_message(
        &self,
        id: &str,
        chat_id: &str,
        role: Role,
        content: &str,
        agent_name: Option<&str>,
        metadata: Option<&str>,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (id, chat_id, role, content, agent_name, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(chat_id)
        .bind(role.as_str())
        .bind(content)
        .bind(agent_name)
        .bind(metadata)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletes a chat and lets `ON DELETE CASCADE` remove its messages, executions,
    /// operational token rows, and pipeline runs (`spec.md` §8 invariant 4). The
    /// billing ledger has no foreign key to `chats` and is untouched.
    pub async fn delete_chat(&self, chat_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chats WHERE id = ?")
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_execution(&self, id: &str) -> Result<Option<AgentExecutionRow>> {
        let row = sqlx::query_as::<_, AgentExecutionRow>(
            "SELECT id, chat_id, agent_name, status, input, output, error, retry_count,
                    started_at, completed_at
             FROM agent_executions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_executions_for_chat(&self, chat_id: &str) -> Result<Vec<AgentExecutionRow>> {
        let rows = sqlx::query_as::<_, AgentExecutionRow>(
            "SELECT id, chat_id, agent_name, status, input, output, error, retry_count,
                    started_at, completed_at
             FROM agent_executions WHERE chat_id = ? ORDER BY started_at ASC",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_execution(
        &self,
        id: &str,
        chat_id: &str,
        agent_name: &str,
        status: ExecutionStatus,
        input: &str,
        retry_count: i64,
        started_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_executions (id, chat_id, agent_name, status, input, retry_count, started_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(chat_id)
        .bind(agent_name)
        .bind(status.as_str())
        .bind(input)
        .bind(retry_count)
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn complete_execution(
        &self,
        id: &str,
        status: ExecutionStatus,
        output: Option<&str>,
        error: Option<&str>,
        completed_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE agent_executions SET status = ?, output = ?, error = ?, completed_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(output)
        .bind(error)
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_pipeline_run(
        &self,
        id: &str,
        chat_id: &str,
        intent: &str,
        scope: &str,
        user_message: &str,
        planned_agents_json: &str,
        status: RunStatus,
        started_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO pipeline_runs (id, chat_id, intent, scope, user_message, planned_agents,
                status, started_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(chat_id)
        .bind(intent)
        .bind(scope)
        .bind(user_message)
        .bind(planned_agents_json)
        .bind(status.as_str())
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn complete_pipeline_run(&self, id: &str, status: RunStatus, completed_at: i64) -> Result<()> {
        sqlx::query("UPDATE pipeline_runs SET status = ?, completed_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(completed_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cascade_delete_removes_operational_rows_only() {
        let db = Db::connect_memory().await.unwrap();
        db.insert_project("p1", "Proj", "/tmp/p1", 1000).await.unwrap();
        db.insert_chat("c1", "p1", "Chat", 1000).await.unwrap();
        db.insert_message("m1", "c1", Role::User, "hi", None, None, 1000)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO agent_executions (id, chat_id, agent_name, status, input, started_at)
             VALUES ('e1', 'c1', 'research', 'completed', 'in', 1000)",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO token_usage (id, execution_id, chat_id, provider, model, input_tokens,
                output_tokens, total_tokens, cost_estimate, created_at)
             VALUES ('t1', 'e1', 'c1', 'anthropic', 'claude', 10, 5, 15, 0.001, 1000)",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO billing_ledger (id, execution_id, chat_id, project_id, provider, model,
                input_tokens, output_tokens, total_tokens, cost_estimate, created_at)
             VALUES ('t1', 'e1', 'c1', 'p1', 'anthropic', 'claude', 10, 5, 15, 0.001, 1000)",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        db.delete_chat("c1").await.unwrap();

        let messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        let executions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM agent_executions")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        let token_usage: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM token_usage")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        let ledger: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM billing_ledger")
            .fetch_one(&db.pool)
            .await
            .unwrap();

        assert_eq!(messages, 0);
        assert_eq!(executions, 0);
        assert_eq!(token_usage, 0);
        assert_eq!(ledger, 1, "billing ledger must survive chat deletion");
    }
}
