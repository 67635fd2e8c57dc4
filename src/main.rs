//! Council CLI
//!
//! Operational entry points for the council engine:
//!
//! ```bash
//! # Mirror the provider catalog into the unified registry
//! council refresh-models --store ./council-state
//!
//! # Probe the configured council and activate a fresh fail list
//! council probe --store ./council-state
//!
//! # Ask the council a question and print the synthesized answer
//! council ask --store ./council-state "Define eventual consistency"
//!
//! # Export a conversation's audit bundle
//! council export-audit --store ./council-state <conversation-id>
//! ```
//!
//! The gateway API key comes from `OPENROUTER_API_KEY`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use council::config::CouncilSettings;
use council::engine::CouncilEngine;
use council::events::EventBus;
use council::health::HealthManager;
use council::provider::OpenRouterClient;
use council::registry::{ModelRegistry, OpenRouterCatalog};
use council::state::{Board, HumanFeedback, MessageRole, SessionStore};

const DEFAULT_GATEWAY_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Parser, Debug)]
#[command(author, version, about = "Deliberative multi-model council", long_about = None)]
struct Args {
    /// Path to the RocksDB state directory
    #[arg(long, default_value = "./council-state")]
    store: PathBuf,

    /// Path to the council configuration file
    #[arg(long, default_value = "./council.json")]
    config: PathBuf,

    /// Gateway base URL
    #[arg(long, default_value = DEFAULT_GATEWAY_URL)]
    gateway_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch the model catalog and rebuild the unified registry
    RefreshModels,

    /// Probe the configured models and activate a fresh fail list
    Probe,

    /// Run one council deliberation over a query
    Ask {
        /// The question for the council
        query: String,
    },

    /// Export a conversation's audit bundle to a directory
    ExportAudit {
        /// The conversation to export
        conversation_id: String,

        /// Directory the bundle is written under
        #[arg(long, default_value = "./audit-exports")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "council=info".into()),
        )
        .init();

    let args = Args::parse();
    let api_key = || std::env::var("OPENROUTER_API_KEY").context("OPENROUTER_API_KEY is not set");

    let settings = CouncilSettings::load(&args.config)?;
    let store = SessionStore::open(&args.store)?.shared();
    let registry = ModelRegistry::new(store.clone()).shared();

    match args.command {
        Command::RefreshModels => {
            let catalog = OpenRouterCatalog::new(&args.gateway_url, api_key()?)?;
            let report = registry.refresh(&catalog).await?;
            println!(
                "refreshed {} base models into {} unified rows ({} duplicate ids skipped, {} endpoint fetches failed)",
                report.base_models,
                report.unified_rows,
                report.skipped_duplicates,
                report.failed_endpoint_fetches
            );
        }

        Command::Probe => {
            let gateway = Arc::new(OpenRouterClient::new(&args.gateway_url, api_key()?)?);
            let health = HealthManager::new(gateway, registry);

            let mut models = settings.council_models.clone();
            models.push(settings.chairman_model.clone());

            let report = health.probe_all(&models).await?;
            for result in &report.results {
                match (&result.ok, result.latency_ms) {
                    (true, Some(latency)) => println!("ok      {} ({} ms)", result.model_id, latency),
                    _ => println!(
                        "failed  {} ({})",
                        result.model_id,
                        result.error.as_deref().unwrap_or("unknown")
                    ),
                }
            }
            println!(
                "{} of {} failed; fail list {} is now active",
                report.failed_count,
                report.results.len(),
                report.fail_list_id
            );
        }

        Command::Ask { query } => {
            let gateway = Arc::new(OpenRouterClient::new(&args.gateway_url, api_key()?)?);
            let bus = EventBus::new().shared();
            let engine = CouncilEngine::new(store.clone(), bus, registry, gateway)
                .with_title_model(settings.title_model.clone());

            let board = Board::from_settings("cli", &settings);
            let conversation = store.create_conversation(None)?;

            let outcome = engine
                .submit_message(&conversation.id, &board, &query)
                .await?;

            // The run pauses for human review; the CLI approves and ends.
            if let council::engine::RunOutcome::AwaitingHuman { task_index, .. } = outcome {
                engine
                    .submit_human_feedback(
                        &conversation.id,
                        &board,
                        HumanFeedback {
                            continue_discussion: false,
                            feedback: String::new(),
                        },
                        task_index,
                    )
                    .await?;
            }

            let messages = store.conversation_messages(&conversation.id)?;
            let answer = messages
                .iter()
                .rev()
                .find(|m| m.role == MessageRole::Assistant)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            println!("{}", answer);
        }

        Command::ExportAudit {
            conversation_id,
            output,
        } => {
            let bundle = council::audit::export_audit_bundle(&store, &conversation_id, &output)?;
            println!("audit bundle written to {}", bundle.display());
        }
    }

    Ok(())
}
