use anyhow::Result;
use clap::{Parser, Subcommand};
use pipeline_core::billing::{TokenLedger, Usage};
use pipeline_core::config::Config;
use pipeline_core::db::settings::SettingsStore;
use pipeline_core::db::Db;
use pipeline_core::orchestrator::model_call::{ModelCallCapability, ModelCallRequest, ModelCallResult};
use pipeline_core::orchestrator::{PipelineOrchestrator, RunParams};
use pipeline_core::pricing::PricingEngine;
use pipeline_core::{logging, paths};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "pipeline-core", version)]
#[command(about = "Pipeline orchestrator, token ledger, and project version store core")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending SQL migrations and exit.
    Migrate,
    /// Run the startup orphan sweep once and report the reconciled count.
    Sweep,
    /// Run one pipeline end-to-end against a scratch project using an
    /// in-memory model-call stub, for manual smoke-testing.
    Demo {
        #[arg(long, default_value = "Build a landing page")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: failed to load config, using defaults: {e}");
        Config::default()
    });
    let _log_dir = logging::setup_tracing_with_settings(logging::LoggingSettings {
        level: config.logging.level.as_deref(),
        directory: config.logging.directory.as_deref(),
        retention_days: config.logging.retention_days,
    })
    .unwrap_or_else(|e| {
        eprintln!("Failed to initialize logging: {e}");
        paths::log_dir()
    });

    let cli = Cli::parse();
    let db = Db::connect(&paths::db_path()).await?;

    match cli.cmd {
        Command::Migrate => {
            db.migrate().await?;
            println!("migrations applied");
        }
        Command::Sweep => {
            db.migrate().await?;
            let settings = SettingsStore::new(&db);
            let ledger = TokenLedger::new(&db, PricingEngine::new(settings));
            let count = ledger.sweep_orphans().await?;
            println!("reconciled {count} orphaned provisional record(s)");
        }
        Command::Demo { message } => {
            db.migrate().await?;
            let project_id = pipeline_core::util::new_id();
            let chat_id = pipeline_core::util::new_id();
            let project_path = paths::projects_root().join(format!("demo-{project_id}"));
            std::fs::create_dir_all(&project_path)?;
            db.insert_project(&project_id, "Demo Project", &project_path.to_string_lossy(), pipeline_core::util::now_millis())
                .await?;
            db.insert_chat(&chat_id, &project_id, "Demo Chat", pipeline_core::util::now_millis())
                .await?;

            let orchestrator = PipelineOrchestrator::new(db);
            let model = DemoModel;
            let outcome = orchestrator
                .run(
                    RunParams {
                        chat_id: &chat_id,
                        project_id: &project_id,
                        project_path: &project_path,
                        user_message: &message,
                        classifier_provider: "anthropic",
                        classifier_model: "claude-haiku-4",
                    },
                    &model,
                )
                .await?;

            println!("run {} finished with status {:?}", outcome.run_id, outcome.status);
            for (agent, output) in &outcome.outputs {
                println!("--- {agent} ---\n{output}\n");
            }
        }
    }

    Ok(())
}

/// A deterministic in-memory stand-in for the external model-call capability
/// (`spec.md` §1 "the core consumes an opaque `ModelCall` capability"), wired
/// only for the `demo` subcommand's manual smoke test.
struct DemoModel;

#[async_trait::async_trait]
impl ModelCallCapability for DemoModel {
    async fn call(
        &self,
        _provider: &str,
        _model: &str,
        request: ModelCallRequest,
        _cancellation: CancellationToken,
    ) -> pipeline_core::CoreResult<ModelCallResult> {
        let is_classifier = request.max_output_tokens == pipeline_core::config::CLASSIFIER_MAX_OUTPUT_TOKENS;
        let output_text = if is_classifier {
            "build,full".to_string()
        } else {
            format!("simulated output for: {}", request.user_prompt.lines().next().unwrap_or(""))
        };
        Ok(ModelCallResult {
            output_text,
            usage: Usage {
                input_tokens: 200,
                output_tokens: 60,
                cache_creation_input_tokens: 0,
                cache_read_input_tokens: 0,
            },
            tool_calls: Vec::new(),
        })
    }
}
