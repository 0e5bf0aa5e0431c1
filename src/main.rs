// =============================================================================
// Meridian Intraday Trader — Main Entry Point
// =============================================================================
//
// Startup order matters: policy first (a bad policy is exit code 1), then the
// tool endpoints (unreachable after the startup wait is also exit code 1),
// then the persistent state rooted at {data_root}/{signature}. Only when all
// of that is up does the orchestrator loop start. Exit code 2 is reserved for
// three consecutive cycle failures, which the service manager answers with a
// restart.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod agent;
mod clock;
mod config;
mod journal;
mod momentum;
mod orchestrator;
mod risk;
mod scanner;
mod tools;
mod types;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::agent::AgentSupervisor;
use crate::clock::{Clock, SessionSchedule, SystemClock};
use crate::config::BotConfig;
use crate::journal::Journal;
use crate::momentum::MomentumStore;
use crate::orchestrator::{ExitStatus, Orchestrator};
use crate::risk::RiskGovernor;
use crate::scanner::Scanner;
use crate::tools::http::{HttpReasoner, HttpToolClient};
use crate::tools::retry::RetryConfig;
use crate::tools::{ToolClient, ToolError};
use crate::types::AccountSnapshot;

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian intraday trader starting up");

    // ── 2. Policy ────────────────────────────────────────────────────────
    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "meridian.json".to_string());
    let mut config = BotConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load policy file; using defaults");
        BotConfig::default()
    });
    config.apply_env_overrides();

    if let Err(e) = config.validate() {
        error!(error = %e, "invalid policy");
        std::process::exit(1);
    }

    info!(
        signature = %config.signature,
        data_root = %config.data_root.display(),
        tools = %config.tools_endpoint,
        "policy validated"
    );

    // ── 3. Shutdown flag & signal listener ───────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_signal_listener(shutdown.clone());

    // ── 4. Tool endpoints (bounded startup wait) ─────────────────────────
    let tools: Arc<dyn ToolClient> =
        Arc::new(HttpToolClient::new(config.tools_endpoint.clone(), &config.agent));

    let account = match wait_for_tools(tools.as_ref(), config.startup_wait_secs, &shutdown).await
    {
        Ok(account) => account,
        Err(e) => {
            error!(error = %e, "tool endpoints unreachable after startup wait");
            std::process::exit(1);
        }
    };
    info!(equity = account.equity, "broker account reachable");

    // ── 5. Persistent state ──────────────────────────────────────────────
    let state_dir = config.state_dir();
    let schedule = SessionSchedule::new(config.eod_flat_at());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let risk = Arc::new(RiskGovernor::load_or_init(
        state_dir.join("risk_management.json"),
        config.risk.clone(),
        schedule.clone(),
        account.equity,
        clock.now(),
    ));

    let store = match MomentumStore::open(&state_dir) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "failed to open momentum databases");
            std::process::exit(1);
        }
    };

    let journal = Journal::new(state_dir);

    // ── 6. Scanner, reasoner, supervisor ─────────────────────────────────
    let scanner = Scanner::new(
        tools.clone(),
        config.scanner.clone(),
        RetryConfig::from_policy(&config.agent),
    );

    let system_prompt = load_strategy_prompt(&config);
    let reasoner = Arc::new(HttpReasoner::new(config.reasoner_endpoint.clone()));
    let supervisor = AgentSupervisor::new(
        reasoner,
        tools.clone(),
        risk.clone(),
        config.agent.clone(),
        system_prompt,
        shutdown.clone(),
    );

    // ── 7. Orchestrator loop ─────────────────────────────────────────────
    let mut orchestrator = Orchestrator::new(
        config,
        schedule,
        clock,
        tools,
        risk,
        store,
        scanner,
        supervisor,
        journal,
        shutdown,
    );

    match orchestrator.run().await {
        ExitStatus::CleanShutdown => {
            info!("Meridian shut down cleanly");
            Ok(())
        }
        ExitStatus::FatalCycleFailures => {
            error!("exiting after repeated cycle failures");
            std::process::exit(2);
        }
    }
}

// ---------------------------------------------------------------------------
// Startup helpers
// ---------------------------------------------------------------------------

/// Probe the broker clock and account until both answer, with backoff, for
/// at most `wait_secs`. A shutdown signal during the wait aborts cleanly.
async fn wait_for_tools(
    tools: &dyn ToolClient,
    wait_secs: u64,
    shutdown: &AtomicBool,
) -> Result<AccountSnapshot> {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(wait_secs);
    let mut delay = std::time::Duration::from_secs(1);

    loop {
        if shutdown.load(Ordering::SeqCst) {
            anyhow::bail!("shutdown requested during startup wait");
        }

        let probe: Result<AccountSnapshot, ToolError> = async {
            tools.market_clock().await?;
            tools.get_account().await
        }
        .await;

        match probe {
            Ok(account) => return Ok(account),
            Err(e) => {
                if std::time::Instant::now() + delay >= deadline {
                    return Err(e).context("startup wait exhausted");
                }
                warn!(error = %e, delay_s = delay.as_secs(), "tool endpoints not ready; retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(std::time::Duration::from_secs(10));
            }
        }
    }
}

/// Read the operator's strategy prompt. The daemon never inspects it; a
/// missing file just means the agent runs with the cycle context alone.
fn load_strategy_prompt(config: &BotConfig) -> String {
    match &config.strategy_prompt_path {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(prompt) => {
                info!(path = %path.display(), bytes = prompt.len(), "strategy prompt loaded");
                prompt
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "strategy prompt unreadable; continuing without");
                String::new()
            }
        },
        None => String::new(),
    }
}

/// Flip the shared flag on SIGINT or SIGTERM. Cooperative sleeps poll it; no
/// other signal surface exists.
fn spawn_signal_listener(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        warn!("shutdown signal received — finishing the current cycle");
        shutdown.store(true, Ordering::SeqCst);
    });
}
