use super::events::{EventBus, PipelineEvent};
use super::merge::MergeContext;
use super::model_call::{ModelCallCapability, ModelCallRequest, ModelCallResult, ToolCall};
use super::plan::AgentNode;
use crate::billing::limiter::CostLimiter;
use crate::billing::{TokenLedger, Usage};
use crate::config::{PipelineConfig, MAX_PROJECT_SOURCE_CHARS};
use crate::db::{Db, ExecutionStatus};
use crate::error::{CoreError, CoreResult};
use crate::pricing::PricingEngine;
use crate::project_source::read_project_source;
use crate::tools::{run_tool, ToolSpec};
use crate::version_store::VersionStore;
use std::collections::HashMap;
use std::path::Path;
use tokio_util::sync::CancellationToken;

const DEV_AGENTS: &[&str] = &["frontend-dev", "backend-dev", "styling-dev"];

fn is_dev_agent(agent_name: &str) -> bool {
    DEV_AGENTS.contains(&agent_name)
}

/// Everything one dispatch step needs that does not change across the run.
pub struct StepContext<'a> {
    pub db: &'a Db,
    pub version_store: &'a VersionStore,
    pub events: &'a EventBus,
    pub model_call: &'a dyn ModelCallCapability,
    pub run_id: &'a str,
    pub chat_id: &'a str,
    pub project_id: &'a str,
    pub project_path: &'a Path,
    pub user_message: &'a str,
    pub config: PipelineConfig,
    pub cancellation: CancellationToken,
}

/// Roughly 4 characters per token, matching the teacher's own prompt-budgeting
/// heuristic for provisioning before an exact count is known (`spec.md` §4.1
/// step 2, "estimate `inputTokens` from prompt length").
fn estimate_input_tokens(system_prompt: &str, user_prompt: &str) -> u64 {
    ((system_prompt.len() + user_prompt.len()) / 4).max(1) as u64
}

fn resolve_agent_model(agent_name: &str) -> (&'static str, &'static str) {
    match agent_name {
        "research" | "code-review" => ("anthropic", "claude-haiku-4"),
        _ => ("anthropic", "claude-sonnet-4"),
    }
}

/// Runs one planned agent through the full seven-step dispatch sequence
/// (`spec.md` §4.1), returning the agent's output text on success. Bounded
/// retries cover `transient_upstream` only; remediation cycles always create
/// a fresh `AgentExecution` row rather than mutating a prior one.
pub async fn dispatch_agent(
    ctx: &StepContext<'_>,
    node: &AgentNode,
    outputs: &HashMap<String, String>,
) -> CoreResult<String> {
    let limiter = CostLimiter::new(ctx.db);
    let chat_admission = limiter.check_per_chat(ctx.chat_id).await.map_err(CoreError::Internal)?;
    if !chat_admission.is_allowed() {
        return Err(CoreError::BudgetExceeded {
            limit_name: "maxTokensPerChat".to_string(),
            limit: limit_of(&chat_admission),
            usage: usage_of(&chat_admission),
        });
    }
    let daily_admission = limiter.check_daily().await.map_err(CoreError::Internal)?;
    if !daily_admission.is_allowed() {
        return Err(CoreError::BudgetExceeded {
            limit_name: "maxCostPerDay".to_string(),
            limit: limit_of(&daily_admission),
            usage: usage_of(&daily_admission),
        });
    }
    let project_admission = limiter
        .check_project(ctx.project_id)
        .await
        .map_err(CoreError::Internal)?;
    if !project_admission.is_allowed() {
        return Err(CoreError::BudgetExceeded {
            limit_name: "maxCostPerProject".to_string(),
            limit: limit_of(&project_admission),
            usage: usage_of(&project_admission),
        });
    }

    let project_source = if node.input_template.contains("transform:project-source") {
        read_project_source(ctx.project_path, MAX_PROJECT_SOURCE_CHARS)
    } else {
        String::new()
    };
    let merge_ctx = MergeContext {
        user_message: ctx.user_message,
        outputs,
        upstream_sources: node.upstream_sources.as_deref(),
    };
    let user_prompt = merge_ctx.resolve_with_project_source(&node.input_template, &project_source);
    let system_prompt = format!("You are the {} agent in a code-generation pipeline.", node.agent_name);
    let (provider, model) = resolve_agent_model(&node.agent_name);

    let output = dispatch_once(ctx, node, provider, model, &system_prompt, &user_prompt, 0).await?;

    if is_dev_agent(&node.agent_name) {
        return run_remediation_cycles(ctx, node, provider, model, &system_prompt, &user_prompt, output).await;
    }
    Ok(output)
}

/// Dispatches one prompt through the admitted retry budget (`max_retries`,
/// `transient_upstream` only), each attempt a fresh `AgentExecution` row. On
/// `Aborted` the provisional ledger rows are left untouched for
/// `sweep_orphans` to reconcile, and the row is marked `stopped` rather than
/// `failed` (`spec.md` §4.1 "Cancellation").
async fn dispatch_once(
    ctx: &StepContext<'_>,
    node: &AgentNode,
    provider: &str,
    model: &str,
    system_prompt: &str,
    user_prompt: &str,
    retry_count_base: i64,
) -> CoreResult<String> {
    let mut attempt: i64 = 0;
    let max_retries = ctx.config.max_retries as i64;
    loop {
        if ctx.cancellation.is_cancelled() {
            return Err(CoreError::Aborted);
        }
        ctx.events.emit(PipelineEvent::AgentStarted {
            run_id: ctx.run_id.to_string(),
            agent_name: node.agent_name.clone(),
        });

        let execution_id = crate::util::new_id();
        ctx.db
            .insert_execution(
                &execution_id,
                ctx.chat_id,
                &node.agent_name,
                ExecutionStatus::Running,
                user_prompt,
                retry_count_base + attempt,
                crate::util::now_millis(),
            )
            .await
            .map_err(CoreError::Internal)?;

        let ledger = TokenLedger::new(ctx.db, PricingEngine::new(crate::db::settings::SettingsStore::new(ctx.db)));
        let estimated_input = estimate_input_tokens(system_prompt, user_prompt);
        let ids = ledger
            .track_provisional(&execution_id, ctx.chat_id, provider, model, None, estimated_input)
            .await
            .map_err(CoreError::Internal)?;

        let call_result = call_model_with_tools(
            ctx,
            provider,
            model,
            system_prompt,
            user_prompt,
            &node_tools(&node.agent_name),
            ctx.config.default_max_output_tokens,
            ctx.config.default_max_tool_steps,
        )
        .await;

        match call_result {
            Ok(result) => {
                // Dedup rule (`spec.md` §4.1 step 3): subtract cache tokens from raw
                // input before recording the finalized usage.
                let actual = Usage {
                    input_tokens: result
                        .usage
                        .input_tokens
                        .saturating_sub(result.usage.cache_creation_input_tokens)
                        .saturating_sub(result.usage.cache_read_input_tokens),
                    output_tokens: result.usage.output_tokens,
                    cache_creation_input_tokens: result.usage.cache_creation_input_tokens,
                    cache_read_input_tokens: result.usage.cache_read_input_tokens,
                };
                ledger
                    .finalize(&ids, actual, provider, model)
                    .await
                    .map_err(CoreError::Internal)?;
                ctx.db
                    .complete_execution(
                        &execution_id,
                        ExecutionStatus::Completed,
                        Some(&result.output_text),
                        None,
                        crate::util::now_millis(),
                    )
                    .await
                    .map_err(CoreError::Internal)?;
                ctx.events.emit(PipelineEvent::AgentCompleted {
                    run_id: ctx.run_id.to_string(),
                    agent_name: node.agent_name.clone(),
                });

                maybe_auto_commit(ctx, &node.agent_name).await;
                return Ok(result.output_text);
            }
            Err(CoreError::Aborted) => {
                ctx.db
                    .complete_execution(
                        &execution_id,
                        ExecutionStatus::Stopped,
                        None,
                        Some("Stopped"),
                        crate::util::now_millis(),
                    )
                    .await
                    .map_err(CoreError::Internal)?;
                return Err(CoreError::Aborted);
            }
            Err(err) => {
                ledger.void(&ids).await.map_err(CoreError::Internal)?;
                ctx.db
                    .complete_execution(
                        &execution_id,
                        ExecutionStatus::Failed,
                        None,
                        Some(&err.to_string()),
                        crate::util::now_millis(),
                    )
                    .await
                    .map_err(CoreError::Internal)?;

                if err.is_retryable() && attempt < max_retries {
                    attempt += 1;
                    continue;
                }
                ctx.events.emit(PipelineEvent::AgentFailed {
                    run_id: ctx.run_id.to_string(),
                    agent_name: node.agent_name.clone(),
                    reason: err.reason(),
                });
                return Err(err);
            }
        }
    }
}

/// After a developer agent completes, detects build/test failures in its
/// output and dispatches up to `max_remediation_cycles` fix-focused retries,
/// each a fresh `AgentExecution` row counted independently of `max_retries`
/// (`spec.md` §4.1 step 6, GLOSSARY "Remediation cycle"). Exhausting the
/// cycle budget without a passing cycle returns the last attempt's output
/// rather than failing the whole run; the build/test agent is expected to
/// surface the unresolved failure to the user in its own text.
async fn run_remediation_cycles(
    ctx: &StepContext<'_>,
    node: &AgentNode,
    provider: &str,
    model: &str,
    system_prompt: &str,
    base_prompt: &str,
    mut output: String,
) -> CoreResult<String> {
    let mut cycle: u32 = 0;
    let Some(mut reason) = detect_build_failure(&output, false) else {
        return Ok(output);
    };
    while cycle < ctx.config.max_remediation_cycles {
        cycle += 1;
        ctx.events.emit(PipelineEvent::RemediationStarted {
            run_id: ctx.run_id.to_string(),
            agent_name: node.agent_name.clone(),
            cycle,
        });

        let fix_prompt = format!(
            "{base_prompt}\n\nThe previous attempt reported a failure: {reason}\nApply a targeted fix and retry."
        );
        output = dispatch_once(
            ctx,
            node,
            provider,
            model,
            system_prompt,
            &fix_prompt,
            cycle as i64 * 1_000,
        )
        .await?;

        match detect_build_failure(&output, true) {
            Some(next_reason) => reason = next_reason,
            None => return Ok(output),
        }
    }
    Ok(output)
}

/// Best-effort auto-commit after a developer agent writes files (`spec.md`
/// §4.1 step 7). Failure here never fails the pipeline.
async fn maybe_auto_commit(ctx: &StepContext<'_>, agent_name: &str) {
    if !is_dev_agent(agent_name) {
        return;
    }
    let _ = ctx
        .version_store
        .auto_commit(
            ctx.project_path,
            &format!("{agent_name} changes"),
            ctx.config.max_versions_retained as usize,
        )
        .await;
}

fn node_tools(agent_name: &str) -> Vec<String> {
    match agent_name {
        "frontend-dev" | "backend-dev" | "styling-dev" => vec![
            "write_file".to_string(),
            "read_file".to_string(),
            "run_shell".to_string(),
        ],
        "research" => vec!["http_fetch".to_string()],
        _ => Vec::new(),
    }
}

/// Maps a model-reported tool name to a concrete sandbox `ToolSpec`
/// (`spec.md` §6 "Tool sandbox"). `write_file`/`read_file` are not sandbox
/// tools: they name the model's own file-authoring capability, resolved by
/// `transform:file-manifest` (`merge.rs`) rather than `run_tool`.
fn tool_spec_for(tool_name: &str) -> Option<ToolSpec> {
    match tool_name {
        "http_fetch" => Some(ToolSpec::Http(crate::tools::http::HttpTool::new("GET", "{{url}}"))),
        "run_script" => Some(ToolSpec::Script(crate::tools::script::ScriptTool::new("{{expression}}"))),
        "run_shell" => Some(ToolSpec::Shell(crate::tools::shell::ShellTool::new("{{command}}"))),
        _ => None,
    }
}

fn tool_call_params(args: &serde_json::Value) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(obj) = args.as_object() {
        for (key, value) in obj {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            params.insert(key.clone(), rendered);
        }
    }
    params
}

fn add_usage(a: Usage, b: Usage) -> Usage {
    Usage {
        input_tokens: a.input_tokens + b.input_tokens,
        output_tokens: a.output_tokens + b.output_tokens,
        cache_creation_input_tokens: a.cache_creation_input_tokens + b.cache_creation_input_tokens,
        cache_read_input_tokens: a.cache_read_input_tokens + b.cache_read_input_tokens,
    }
}

/// Runs the model call to completion, executing any sandbox tool calls it
/// reports and feeding their output back for up to `max_tool_steps` rounds
/// (`spec.md` §4.1 step 3, §6). Usage accumulates across every round so
/// billing reflects the whole tool-use exchange, not just the final call.
#[allow(clippy::too_many_arguments)]
async fn call_model_with_tools(
    ctx: &StepContext<'_>,
    provider: &str,
    model: &str,
    system_prompt: &str,
    initial_prompt: &str,
    tool_names: &[String],
    max_output_tokens: u32,
    max_tool_steps: u32,
) -> CoreResult<ModelCallResult> {
    let mut prompt = initial_prompt.to_string();
    let mut total_usage = Usage::default();
    let mut steps_remaining = max_tool_steps;

    loop {
        let request = ModelCallRequest {
            system_prompt: system_prompt.to_string(),
            user_prompt: prompt.clone(),
            tools: tool_names.to_vec(),
            max_output_tokens,
            max_tool_steps: steps_remaining,
        };
        let result = ctx
            .model_call
            .call(provider, model, request, ctx.cancellation.clone())
            .await?;
        total_usage = add_usage(total_usage, result.usage);

        let sandbox_calls: Vec<&ToolCall> = result
            .tool_calls
            .iter()
            .filter(|tc| tool_spec_for(&tc.tool).is_some())
            .collect();
        if sandbox_calls.is_empty() || steps_remaining == 0 {
            return Ok(ModelCallResult {
                output_text: result.output_text,
                usage: total_usage,
                tool_calls: result.tool_calls,
            });
        }
        if ctx.cancellation.is_cancelled() {
            return Err(CoreError::Aborted);
        }

        let mut appended = String::new();
        for tc in sandbox_calls {
            let spec = tool_spec_for(&tc.tool).expect("filtered above");
            let params = tool_call_params(&tc.args);
            match run_tool(&spec, &params, ctx.config.allow_shell_tools, ctx.project_path).await {
                Ok(outcome) => {
                    appended.push_str(&format!("\n[{} result]\n{}", tc.tool, outcome.stdout));
                    if outcome.truncated {
                        appended.push_str(" (truncated)");
                    }
                    appended.push('\n');
                }
                Err(err) => {
                    appended.push_str(&format!("\n[{} error]\n{}\n", tc.tool, err.reason()));
                }
            }
        }
        prompt.push_str(&appended);
        steps_remaining = steps_remaining.saturating_sub(1);
    }
}

/// Failure markers a build/test-capable developer agent is expected to emit
/// in its output text. Absence of a fail marker means "no failure detected"
/// for the initial check (`spec.md` §4.1 step 6, "if failures are detected");
/// the stricter remediation-cycle pass check additionally requires an
/// explicit pass marker, per the open design note "leave it to the build/test
/// agents to emit a structured pass/fail and treat absence as failure".
const FAIL_MARKERS: &[&str] = &[
    "build failed",
    "compile error",
    "test failed",
    "tests failed",
    "\"status\":\"fail\"",
];
const PASS_MARKERS: &[&str] = &["build succeeded", "tests passed", "\"status\":\"pass\""];

fn detect_build_failure(output: &str, strict: bool) -> Option<String> {
    let lower = output.to_lowercase();
    for marker in FAIL_MARKERS {
        if lower.contains(marker) {
            return Some(format!("detected failure marker: {marker}"));
        }
    }
    if strict && !PASS_MARKERS.iter().any(|m| lower.contains(m)) {
        return Some("no explicit pass marker found".to_string());
    }
    None
}

fn limit_of(admission: &crate::billing::limiter::Admission) -> f64 {
    match admission {
        crate::billing::limiter::Admission::Denied { limit, .. } => *limit,
        crate::billing::limiter::Admission::AllowedWithWarning { limit, .. } => *limit,
        crate::billing::limiter::Admission::Allowed => 0.0,
    }
}

fn usage_of(admission: &crate::billing::limiter::Admission) -> f64 {
    match admission {
        crate::billing::limiter::Admission::Denied { used, .. } => *used,
        crate::billing::limiter::Admission::AllowedWithWarning { used, .. } => *used,
        crate::billing::limiter::Admission::Allowed => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::model_call::ModelCallResult;
    use async_trait::async_trait;

    struct StubModel;

    #[async_trait]
    impl ModelCallCapability for StubModel {
        async fn call(
            &self,
            _provider: &str,
            _model: &str,
            _request: ModelCallRequest,
            _cancellation: CancellationToken,
        ) -> CoreResult<ModelCallResult> {
            Ok(ModelCallResult {
                output_text: "done".to_string(),
                usage: Usage {
                    input_tokens: 100,
                    output_tokens: 20,
                    cache_creation_input_tokens: 0,
                    cache_read_input_tokens: 0,
                },
                tool_calls: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn successful_dispatch_records_completed_execution_and_ledger_row() {
        let db = Db::connect_memory().await.unwrap();
        db.insert_project("p1", "Proj", "/tmp/p1", 1000).await.unwrap();
        db.insert_chat("c1", "p1", "Chat", 1000).await.unwrap();
        let version_store = VersionStore::new();
        let events = EventBus::new();
        let model = StubModel;
        let root = crate::paths::projects_root().join(format!("test-dispatch-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();

        let ctx = StepContext {
            db: &db,
            version_store: &version_store,
            events: &events,
            model_call: &model,
            run_id: "r1",
            chat_id: "c1",
            project_id: "p1",
            project_path: &root,
            user_message: "build a page",
            config: PipelineConfig::default(),
            cancellation: CancellationToken::new(),
        };
        let node = AgentNode::new("research", "{{userMessage}}");
        let outputs = HashMap::new();
        let out = dispatch_agent(&ctx, &node, &outputs).await.unwrap();
        assert_eq!(out, "done");

        let executions = db.list_executions_for_chat("c1").await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, "completed");

        let ledger_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM billing_ledger WHERE estimated = 0")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(ledger_count, 1);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn budget_exceeded_blocks_before_any_model_call() {
        let db = Db::connect_memory().await.unwrap();
        db.insert_project("p1", "Proj", "/tmp/p1", 1000).await.unwrap();
        db.insert_chat("c1", "p1", "Chat", 1000).await.unwrap();
        let settings = crate::db::settings::SettingsStore::new(&db);
        settings.set_raw("maxCostPerProject", "0.0000001").await.unwrap();
        sqlx::query(
            "INSERT INTO billing_ledger (id, chat_id, project_id, provider, model, input_tokens,
                output_tokens, total_tokens, cost_estimate, estimated, created_at)
             VALUES ('b1', 'c1', 'p1', 'anthropic', 'claude', 10, 5, 15, 1.0, 0, 1000)",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let version_store = VersionStore::new();
        let events = EventBus::new();
        let model = StubModel;
        let root = crate::paths::projects_root().join(format!("test-dispatch-budget-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();

        let ctx = StepContext {
            db: &db,
            version_store: &version_store,
            events: &events,
            model_call: &model,
            run_id: "r1",
            chat_id: "c1",
            project_id: "p1",
            project_path: &root,
            user_message: "build a page",
            config: PipelineConfig::default(),
            cancellation: CancellationToken::new(),
        };
        let node = AgentNode::new("research", "{{userMessage}}");
        let outputs = HashMap::new();
        let result = dispatch_agent(&ctx, &node, &outputs).await;
        assert!(matches!(result, Err(CoreError::BudgetExceeded { .. })));

        let executions = db.list_executions_for_chat("c1").await.unwrap();
        assert!(executions.is_empty(), "no execution row should be created when admission fails");

        let _ = std::fs::remove_dir_all(&root);
    }

    struct ToolCallingModel {
        calls: std::sync::atomic::AtomicUsize,
        prompts: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ModelCallCapability for ToolCallingModel {
        async fn call(
            &self,
            _provider: &str,
            _model: &str,
            request: ModelCallRequest,
            _cancellation: CancellationToken,
        ) -> CoreResult<ModelCallResult> {
            self.prompts.lock().unwrap().push(request.user_prompt.clone());
            let call_no = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if call_no == 0 {
                let mut args = serde_json::Map::new();
                args.insert("expression".to_string(), serde_json::Value::String("2+3".to_string()));
                Ok(ModelCallResult {
                    output_text: "working on it".to_string(),
                    usage: Usage {
                        input_tokens: 10,
                        output_tokens: 5,
                        cache_creation_input_tokens: 0,
                        cache_read_input_tokens: 0,
                    },
                    tool_calls: vec![ToolCall {
                        tool: "run_script".to_string(),
                        args: serde_json::Value::Object(args),
                    }],
                })
            } else {
                Ok(ModelCallResult {
                    output_text: "build succeeded".to_string(),
                    usage: Usage {
                        input_tokens: 10,
                        output_tokens: 5,
                        cache_creation_input_tokens: 0,
                        cache_read_input_tokens: 0,
                    },
                    tool_calls: Vec::new(),
                })
            }
        }
    }

    #[tokio::test]
    async fn sandbox_tool_calls_execute_and_feed_back_into_the_next_model_call() {
        let db = Db::connect_memory().await.unwrap();
        db.insert_project("p1", "Proj", "/tmp/p1", 1000).await.unwrap();
        db.insert_chat("c1", "p1", "Chat", 1000).await.unwrap();
        let version_store = VersionStore::new();
        let events = EventBus::new();
        let model = ToolCallingModel {
            calls: std::sync::atomic::AtomicUsize::new(0),
            prompts: std::sync::Mutex::new(Vec::new()),
        };
        let root = crate::paths::projects_root().join(format!("test-dispatch-tools-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();

        let ctx = StepContext {
            db: &db,
            version_store: &version_store,
            events: &events,
            model_call: &model,
            run_id: "r1",
            chat_id: "c1",
            project_id: "p1",
            project_path: &root,
            user_message: "build a page",
            config: PipelineConfig::default(),
            cancellation: CancellationToken::new(),
        };
        let node = AgentNode::new("frontend-dev", "{{userMessage}}");
        let outputs = HashMap::new();
        let out = dispatch_agent(&ctx, &node, &outputs).await.unwrap();
        assert_eq!(out, "build succeeded");
        assert_eq!(model.calls.load(std::sync::atomic::Ordering::SeqCst), 2);

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[1].contains("run_script result"));
        assert!(prompts[1].contains('5'), "tool output should be interpolated back: {}", prompts[1]);

        let _ = std::fs::remove_dir_all(&root);
    }

    struct BuildFailThenPassModel {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ModelCallCapability for BuildFailThenPassModel {
        async fn call(
            &self,
            _provider: &str,
            _model: &str,
            _request: ModelCallRequest,
            _cancellation: CancellationToken,
        ) -> CoreResult<ModelCallResult> {
            let call_no = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let output_text = if call_no == 0 {
                "compile error: missing semicolon".to_string()
            } else {
                "build succeeded".to_string()
            };
            Ok(ModelCallResult {
                output_text,
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    cache_creation_input_tokens: 0,
                    cache_read_input_tokens: 0,
                },
                tool_calls: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn detected_build_failure_triggers_one_remediation_cycle_with_a_fresh_execution_row() {
        let db = Db::connect_memory().await.unwrap();
        db.insert_project("p1", "Proj", "/tmp/p1", 1000).await.unwrap();
        db.insert_chat("c1", "p1", "Chat", 1000).await.unwrap();
        let version_store = VersionStore::new();
        let events = EventBus::new();
        let model = BuildFailThenPassModel {
            calls: std::sync::atomic::AtomicUsize::new(0),
        };
        let root = crate::paths::projects_root().join(format!("test-dispatch-remediate-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();

        let ctx = StepContext {
            db: &db,
            version_store: &version_store,
            events: &events,
            model_call: &model,
            run_id: "r1",
            chat_id: "c1",
            project_id: "p1",
            project_path: &root,
            user_message: "build a page",
            config: PipelineConfig::default(),
            cancellation: CancellationToken::new(),
        };
        let node = AgentNode::new("frontend-dev", "{{userMessage}}");
        let outputs = HashMap::new();
        let out = dispatch_agent(&ctx, &node, &outputs).await.unwrap();
        assert_eq!(out, "build succeeded");

        let executions = db.list_executions_for_chat("c1").await.unwrap();
        assert_eq!(executions.len(), 2, "the remediation cycle must insert a fresh execution row, not mutate the first");
        assert_eq!(executions[0].status, "completed");
        assert_eq!(executions[1].status, "completed");
        assert_ne!(executions[0].id, executions[1].id);

        let _ = std::fs::remove_dir_all(&root);
    }

    struct AbortingModel;

    #[async_trait]
    impl ModelCallCapability for AbortingModel {
        async fn call(
            &self,
            _provider: &str,
            _model: &str,
            _request: ModelCallRequest,
            _cancellation: CancellationToken,
        ) -> CoreResult<ModelCallResult> {
            Err(CoreError::Aborted)
        }
    }

    #[tokio::test]
    async fn aborted_attempt_marks_execution_stopped_and_leaves_ledger_row_estimated() {
        let db = Db::connect_memory().await.unwrap();
        db.insert_project("p1", "Proj", "/tmp/p1", 1000).await.unwrap();
        db.insert_chat("c1", "p1", "Chat", 1000).await.unwrap();
        let version_store = VersionStore::new();
        let events = EventBus::new();
        let model = AbortingModel;
        let root = crate::paths::projects_root().join(format!("test-dispatch-abort-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();

        let ctx = StepContext {
            db: &db,
            version_store: &version_store,
            events: &events,
            model_call: &model,
            run_id: "r1",
            chat_id: "c1",
            project_id: "p1",
            project_path: &root,
            user_message: "build a page",
            config: PipelineConfig::default(),
            cancellation: CancellationToken::new(),
        };
        let node = AgentNode::new("research", "{{userMessage}}");
        let outputs = HashMap::new();
        let result = dispatch_agent(&ctx, &node, &outputs).await;
        assert!(matches!(result, Err(CoreError::Aborted)));

        let executions = db.list_executions_for_chat("c1").await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, "stopped");

        let ledger_estimated: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM billing_ledger WHERE estimated = 1")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(ledger_estimated, 1, "aborted provisional rows are left estimated for sweep_orphans");

        let _ = std::fs::remove_dir_all(&root);
    }
}
