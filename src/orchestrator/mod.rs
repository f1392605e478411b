pub mod dispatch;
pub mod events;
pub mod merge;
pub mod model_call;
pub mod plan;

use crate::db::settings::SettingsStore;
use crate::db::{Db, RunStatus};
use crate::error::{CoreError, CoreResult};
use crate::version_store::VersionStore;
use dispatch::{dispatch_agent, StepContext};
use events::{EventBus, PipelineEvent};
use model_call::ModelCallCapability;
use plan::classify_and_plan;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

/// Parameters for one pipeline run request (`spec.md` §4.1 "Inputs").
pub struct RunParams<'a> {
    pub chat_id: &'a str,
    pub project_id: &'a str,
    pub project_path: &'a std::path::Path,
    pub user_message: &'a str,
    pub classifier_provider: &'a str,
    pub classifier_model: &'a str,
}

/// The result of a completed, failed, or stopped pipeline run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub reason: Option<String>,
    pub outputs: HashMap<String, String>,
}

/// Composes the settings store, cost limiter, token ledger, version store, and
/// dispatch loop into the single entry point a caller (the external HTTP/CRUD
/// layer) uses to run a pipeline (`spec.md` §2 "Orchestrator composes all of
/// the above"). Per-chat runs are serialized via a keyed mutex (`spec.md` §5);
/// `abort_pipeline` flips a per-chat cancellation token the dispatch loop and
/// model-call capability both observe.
pub struct PipelineOrchestrator {
    db: Db,
    version_store: VersionStore,
    events: EventBus,
    chat_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
}

impl PipelineOrchestrator {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            version_store: VersionStore::new(),
            events: EventBus::new(),
            chat_locks: Mutex::new(HashMap::new()),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    fn chat_lock(&self, chat_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.chat_locks.lock().unwrap();
        locks
            .entry(chat_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Reuses a chat's existing token if one was already registered (e.g. by
    /// an `abort_pipeline` call that raced ahead of `run`), so an abort issued
    /// just before a run starts is never silently lost. Never overwrites an
    /// existing entry, cancelled or not.
    fn register_cancellation(&self, chat_id: &str) -> CancellationToken {
        let mut cancellations = self.cancellations.lock().unwrap();
        cancellations.entry(chat_id.to_string()).or_default().clone()
    }

    fn unregister_cancellation(&self, chat_id: &str) {
        self.cancellations.lock().unwrap().remove(chat_id);
    }

    /// Flips the per-chat cancellation token (`spec.md` §4.1 "Cancellation",
    /// §5). Registers a fresh, already-cancelled token if no run is currently
    /// in flight, so an abort issued just before `run` starts still takes
    /// effect.
    pub fn abort_pipeline(&self, chat_id: &str) {
        let mut cancellations = self.cancellations.lock().unwrap();
        let token = cancellations.entry(chat_id.to_string()).or_default();
        token.cancel();
    }

    /// Runs a new pipeline: classifies intent/scope, plans the fixed agent
    /// list, dispatches each node sequentially, and returns the finalized
    /// outcome. A new run for the same chat is blocked until the prior one
    /// reaches a terminal state (`spec.md` §3 "Ordering guarantees").
    pub async fn run(
        &self,
        params: RunParams<'_>,
        model_call: &dyn ModelCallCapability,
    ) -> CoreResult<RunOutcome> {
        let lock = self.chat_lock(params.chat_id);
        let _guard = lock.lock().await;

        let run_id = crate::util::new_id();
        let cancellation = self.register_cancellation(params.chat_id);
        let settings = SettingsStore::new(&self.db);
        let config = settings.pipeline_config().await;

        self.events.emit(PipelineEvent::RunStarted {
            run_id: run_id.clone(),
            chat_id: params.chat_id.to_string(),
        });

        let plan_result = classify_and_plan(
            model_call,
            params.classifier_provider,
            params.classifier_model,
            params.user_message,
            cancellation.clone(),
        )
        .await;

        let (intent, scope, plan) = match plan_result {
            Ok(v) => v,
            Err(err) => {
                self.unregister_cancellation(params.chat_id);
                self.events.emit(PipelineEvent::RunCompleted {
                    run_id: run_id.clone(),
                    status: "failed".to_string(),
                    summary: err.reason(),
                });
                return Err(err);
            }
        };

        let planned_agents_json =
            serde_json::to_string(&plan.iter().map(|n| n.agent_name.clone()).collect::<Vec<_>>())
                .map_err(|e| CoreError::Internal(e.into()))?;
        self.db
            .insert_pipeline_run(
                &run_id,
                params.chat_id,
                intent_str(intent),
                scope_str(scope),
                params.user_message,
                &planned_agents_json,
                RunStatus::Running,
                crate::util::now_millis(),
            )
            .await
            .map_err(CoreError::Internal)?;

        let mut outputs: HashMap<String, String> = HashMap::new();
        let mut failure: Option<CoreError> = None;

        for node in &plan {
            if cancellation.is_cancelled() {
                failure = Some(CoreError::Aborted);
                break;
            }
            let ctx = StepContext {
                db: &self.db,
                version_store: &self.version_store,
                events: &self.events,
                model_call,
                run_id: &run_id,
                chat_id: params.chat_id,
                project_id: params.project_id,
                project_path: params.project_path,
                user_message: params.user_message,
                config,
                cancellation: cancellation.clone(),
            };
            match dispatch_agent(&ctx, node, &outputs).await {
                Ok(output) => {
                    outputs.insert(node.agent_name.clone(), output);
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        self.unregister_cancellation(params.chat_id);
        let (status, reason) = match &failure {
            None => (RunStatus::Completed, None),
            Some(CoreError::Aborted) => (RunStatus::Interrupted, Some("Stopped".to_string())),
            Some(err) => (RunStatus::Failed, Some(err.reason())),
        };
        self.db
            .complete_pipeline_run(&run_id, status, crate::util::now_millis())
            .await
            .map_err(CoreError::Internal)?;
        // Streaming observers see `status: failed, summary: "Stopped"` on abort
        // (`spec.md` §4.1), even though the persisted `PipelineRun.status` is
        // `interrupted` per its own enum (`spec.md` §3).
        let event_status = if matches!(failure, Some(CoreError::Aborted)) {
            "failed".to_string()
        } else {
            status.as_str().to_string()
        };
        self.events.emit(PipelineEvent::RunCompleted {
            run_id: run_id.clone(),
            status: event_status,
            summary: reason.clone().unwrap_or_else(|| "ok".to_string()),
        });

        if let Some(err) = failure {
            if !matches!(err, CoreError::Aborted) {
                return Err(err);
            }
        }
        Ok(RunOutcome {
            run_id,
            status,
            reason,
            outputs,
        })
    }
}

fn intent_str(intent: plan::Intent) -> &'static str {
    match intent {
        plan::Intent::Build => "build",
        plan::Intent::Fix => "fix",
        plan::Intent::Question => "question",
    }
}

fn scope_str(scope: plan::Scope) -> &'static str {
    match scope {
        plan::Scope::Frontend => "frontend",
        plan::Scope::Backend => "backend",
        plan::Scope::Styling => "styling",
        plan::Scope::Full => "full",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::Usage;
    use crate::db::Db;
    use crate::orchestrator::model_call::{ModelCallRequest, ModelCallResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedModel {
        classifier_reply: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelCallCapability for ScriptedModel {
        async fn call(
            &self,
            _provider: &str,
            _model: &str,
            request: ModelCallRequest,
            _cancellation: CancellationToken,
        ) -> CoreResult<ModelCallResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let is_classifier = request.max_output_tokens == crate::config::CLASSIFIER_MAX_OUTPUT_TOKENS;
            let output_text = if is_classifier {
                self.classifier_reply.clone()
            } else {
                "agent output".to_string()
            };
            Ok(ModelCallResult {
                output_text,
                usage: Usage {
                    input_tokens: 50,
                    output_tokens: 10,
                    cache_creation_input_tokens: 0,
                    cache_read_input_tokens: 0,
                },
                tool_calls: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn happy_path_run_completes_with_four_agent_outputs() {
        let db = Db::connect_memory().await.unwrap();
        db.insert_project("p1", "Proj", "/tmp/p1", 1000).await.unwrap();
        db.insert_chat("c1", "p1", "Chat", 1000).await.unwrap();
        let orchestrator = PipelineOrchestrator::new(db);
        let model = ScriptedModel {
            classifier_reply: "build,full".to_string(),
            calls: AtomicUsize::new(0),
        };
        let root = crate::paths::projects_root().join(format!("test-orch-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();

        let outcome = orchestrator
            .run(
                RunParams {
                    chat_id: "c1",
                    project_id: "p1",
                    project_path: &root,
                    user_message: "Build a landing page",
                    classifier_provider: "anthropic",
                    classifier_model: "claude-haiku-4",
                },
                &model,
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.outputs.len(), 4);
        assert!(outcome.outputs.contains_key("frontend-dev"));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn abort_before_dispatch_yields_interrupted_run() {
        let db = Db::connect_memory().await.unwrap();
        db.insert_project("p1", "Proj", "/tmp/p1", 1000).await.unwrap();
        db.insert_chat("c1", "p1", "Chat", 1000).await.unwrap();
        let orchestrator = PipelineOrchestrator::new(db);
        let model = ScriptedModel {
            classifier_reply: "question,full".to_string(),
            calls: AtomicUsize::new(0),
        };
        let root = crate::paths::projects_root().join(format!("test-orch-abort-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();

        orchestrator.abort_pipeline("c1");
        let outcome = orchestrator
            .run(
                RunParams {
                    chat_id: "c1",
                    project_id: "p1",
                    project_path: &root,
                    user_message: "what does this do?",
                    classifier_provider: "anthropic",
                    classifier_model: "claude-haiku-4",
                },
                &model,
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Interrupted);
        assert_eq!(outcome.reason.as_deref(), Some("Stopped"));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn aborted_run_streams_a_failed_run_completed_event_with_stopped_summary() {
        let db = Db::connect_memory().await.unwrap();
        db.insert_project("p1", "Proj", "/tmp/p1", 1000).await.unwrap();
        db.insert_chat("c1", "p1", "Chat", 1000).await.unwrap();
        let orchestrator = PipelineOrchestrator::new(db);
        let mut events = orchestrator.subscribe();
        let model = ScriptedModel {
            classifier_reply: "question,full".to_string(),
            calls: AtomicUsize::new(0),
        };
        let root = crate::paths::projects_root().join(format!("test-orch-abort-event-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();

        orchestrator.abort_pipeline("c1");
        let outcome = orchestrator
            .run(
                RunParams {
                    chat_id: "c1",
                    project_id: "p1",
                    project_path: &root,
                    user_message: "what does this do?",
                    classifier_provider: "anthropic",
                    classifier_model: "claude-haiku-4",
                },
                &model,
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Interrupted);

        let mut saw_run_completed = false;
        while let Ok(event) = events.try_recv() {
            if let PipelineEvent::RunCompleted { status, summary, .. } = event {
                assert_eq!(status, "failed");
                assert_eq!(summary, "Stopped");
                saw_run_completed = true;
            }
        }
        assert!(saw_run_completed, "expected a RunCompleted event on the bus");

        let _ = std::fs::remove_dir_all(&root);
    }
}
