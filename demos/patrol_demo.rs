//! Demo binary: wires a real `PatrolEngine` against in-memory fakes for
//! manual smoke-testing (SPEC_FULL.md §11). Not a production deployment.
//!
//! ```bash
//! cargo run --bin patrol-demo
//! curl localhost:8088/patrol/status
//! curl -N localhost:8088/patrol/stream
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use patrol_engine::alert_reviewer::AlertReviewer;
use patrol_engine::api::{self, ApiState};
use patrol_engine::baseline::ThresholdManager;
use patrol_engine::capabilities::{ChatStreamChunk, PatrolToolCall};
use patrol_engine::circuit_breaker::CircuitBreaker;
use patrol_engine::clock::SystemClock;
use patrol_engine::config::{AutonomyLevel, ConfigSurface, PatrolConfig};
use patrol_engine::dispatcher::RunDispatcher;
use patrol_engine::engine::PatrolEngine;
use patrol_engine::findings::FindingsStore;
use patrol_engine::investigation::InvestigationTrigger;
use patrol_engine::stream::StreamBus;
use patrol_engine::testing::{
    FakeAlertResolver, FakeChatService, FakeFindingsPersistence, FakeGuestProber,
    FakeInvestigationOrchestrator, FakeStateProvider,
};
use patrol_engine::threshold_guard::ThresholdGuard;
use patrol_engine::types::{Category, Finding, NodeInfo, Severity, Snapshot};

#[derive(Parser, Debug)]
#[command(name = "patrol-demo")]
#[command(about = "Smoke-test harness for the patrol control plane")]
struct CliArgs {
    /// HTTP bind address for the demo status/stream endpoints.
    #[arg(long, default_value = "0.0.0.0:8088")]
    addr: String,

    /// Patrol interval in seconds.
    #[arg(long, default_value = "60")]
    interval_secs: u64,
}

fn demo_snapshot() -> Snapshot {
    Snapshot {
        nodes: vec![NodeInfo {
            id: "pve1".into(),
            name: "pve1".into(),
            cpu_fraction: 0.92,
            mem_fraction: 0.55,
            status: "online".into(),
        }],
        ..Snapshot::default()
    }
}

fn demo_chat_script() -> Vec<ChatStreamChunk> {
    let mut finding = Finding::new("pve1", Category::Performance, "cpu-high", Severity::Warning, chrono::Utc::now());
    finding.resource_name = "pve1".into();
    finding.resource_type = "node".into();
    finding.title = "Node CPU usage high".into();
    finding.description = "pve1 is running at 92% CPU, above the warning threshold.".into();
    finding.recommendation = "Investigate the heaviest guests on pve1 or add capacity.".into();
    finding.source = "demo".into();
    vec![
        ChatStreamChunk::Content("Reviewing flagged resources...\n".into()),
        ChatStreamChunk::ToolCall(PatrolToolCall::ReportFinding(Box::new(finding))),
        ChatStreamChunk::Done { input_tokens: 512, output_tokens: 64 },
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    info!("patrol-demo starting");

    let clock = Arc::new(SystemClock);
    let config = ConfigSurface::new(PatrolConfig {
        autonomy_level: AutonomyLevel::Approval,
        interval: Duration::from_secs(args.interval_secs),
        ..PatrolConfig::default()
    });

    let persistence = Arc::new(FakeFindingsPersistence::default());
    let findings = FindingsStore::new(clock.clone(), Some(persistence.clone()));
    let baselines = Arc::new(ThresholdManager::new());
    let guard = Arc::new(ThresholdGuard::new());
    let breaker = Arc::new(CircuitBreaker::new(clock.clone()));
    let stream = Arc::new(StreamBus::new(clock.clone()));
    let state_provider = Arc::new(FakeStateProvider::new(demo_snapshot()));
    let chat = Arc::new(FakeChatService::new(demo_chat_script()));
    let orchestrator = Arc::new(FakeInvestigationOrchestrator::new());
    let alert_resolver = Arc::new(FakeAlertResolver::default());
    let _guest_prober = Arc::new(FakeGuestProber::new());

    let investigation = Arc::new(InvestigationTrigger::new(findings.clone(), orchestrator, clock.clone()));
    let alert_reviewer = Arc::new(AlertReviewer::new(alert_resolver, Some(chat.clone())));

    let dispatcher = Arc::new(RunDispatcher::new(
        findings.clone(),
        baselines,
        guard,
        breaker,
        stream.clone(),
        investigation,
        alert_reviewer,
        state_provider,
        Some(chat),
        Some(persistence),
        config.clone(),
        clock.clone(),
    ));

    let (_config_tx, config_rx) = mpsc::channel(8);
    let engine = Arc::new(PatrolEngine::new(dispatcher, findings.clone(), config, clock, Some(config_rx)));
    engine.start()?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received ctrl-c, shutting down");
        shutdown.cancel();
    });

    let api_state = ApiState { engine: engine.clone(), findings, stream };
    let app = api::router(api_state);
    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    info!(addr = %args.addr, "patrol-demo listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        () = cancel.cancelled() => {}
    }

    engine.stop().await;
    Ok(())
}
