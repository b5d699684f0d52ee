//! Aegis Gateway daemon — a thin CLI front door over the defense core.
//!
//! Reads one prompt per line from stdin, routes it through the tenant's
//! orchestrator, and prints the resulting decision. Transport (HTTP routes,
//! request framing) is out of scope for this core; this binary exists to
//! exercise it end to end as a minimal line-oriented front door.

use std::path::PathBuf;
use std::sync::Arc;

use aegis_gateway::config::{Config, LlmProvider};
use aegis_gateway::engine::build_engine;
use aegis_gateway::orchestrator::Stage;
use aegis_gateway::tenant::TenantManager;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// Aegis Gateway — multi-tenant prompt-security defense core.
#[derive(Parser, Debug)]
#[command(name = "aegis-gatewayd")]
#[command(about = "Three-layer prompt-security gateway: membrane, intent tracker, self-hardening")]
struct Args {
    /// Which LLM provider backs the intent judge and chat responses.
    #[arg(long, value_enum, default_value_t = LlmProvider::LocalCpu)]
    llm_provider: LlmProvider,

    /// Base URL for the remote chat/embeddings provider.
    #[arg(long, default_value = "https://api.openai.com/v1")]
    llm_base_url: String,

    /// Model name for inference (judge + chat).
    #[arg(long, default_value = "gpt-4o-mini")]
    model_inference: String,

    /// Model name for embeddings.
    #[arg(long, default_value = "text-embedding-3-small")]
    model_embedding: String,

    /// Route embeddings to the local CPU engine while chat stays remote.
    #[arg(long)]
    use_hybrid_embeddings: bool,

    /// Root directory under which per-tenant state lives.
    #[arg(long, default_value = "./memory")]
    base_memory_dir: PathBuf,

    /// Path to the process-wide HITL review queue file.
    #[arg(long, default_value = "./review_queue.json")]
    review_queue_path: PathBuf,

    /// Tenant to route stdin prompts to.
    #[arg(long, default_value = "default")]
    client_id: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("aegis_gateway=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let parallel_layers = args.llm_provider != LlmProvider::LocalCpu;
    let cfg = Config {
        llm_provider: args.llm_provider,
        llm_base_url: args.llm_base_url,
        model_inference: args.model_inference,
        model_embedding: args.model_embedding,
        use_hybrid_embeddings: args.use_hybrid_embeddings,
        base_memory_dir: args.base_memory_dir,
        review_queue_path: args.review_queue_path,
        parallel_layers,
        ..Config::default()
    };

    info!("═══════════════════════════════════════════════════════════════");
    info!("  AEGIS GATEWAY — multi-tenant prompt-security core");
    info!("═══════════════════════════════════════════════════════════════");
    info!("  LLM provider: {}", cfg.llm_provider);
    info!("  Tenant root: {}", cfg.base_memory_dir.display());
    info!("  Parallel layers: {}", cfg.parallel_layers);
    info!("═══════════════════════════════════════════════════════════════");

    let engine = build_engine(&cfg)?;
    let manager = Arc::new(TenantManager::new(cfg, Arc::from(engine)));
    let orchestrator = manager.orchestrator_for(&args.client_id).await?;

    info!("ready, reading prompts from stdin for client '{}'", args.client_id);

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }

        let decision = orchestrator.process(prompt).await;
        match decision.stage {
            Stage::BlockedL1 | Stage::BlockedL2 => {
                error!("═══════════════════════════════════════════════════════════════");
                error!("  BLOCK ({})", decision.stage.as_str());
                error!("  reason: {}", decision.block_reason.as_deref().unwrap_or(""));
                error!("  risk: {}  latency: {:.1}ms", decision.risk_score, decision.latency_ms);
                error!("═══════════════════════════════════════════════════════════════");
            }
            Stage::Error => {
                warn!("ERROR stage, risk={} latency={:.1}ms", decision.risk_score, decision.latency_ms);
            }
            Stage::Success | Stage::Warn => {
                info!(
                    "ALLOW ({}) risk={} latency={:.1}ms",
                    decision.stage.as_str(),
                    decision.risk_score,
                    decision.latency_ms
                );
                println!("{}", decision.response);
            }
        }
    }

    Ok(())
}
