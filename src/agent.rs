// =============================================================================
// Agent Supervisor — one bounded reasoning run per cycle
// =============================================================================
//
// The supervisor owns exactly one reasoning session per invocation. It hands
// the external reasoner a context (session, regime, clock, risk snapshot,
// watchlist, and the operator's strategy prompt), then drives a cooperative
// loop: each iteration the reasoner answers with a tool call, commentary, or
// the terminal signal. Tool calls are dispatched synchronously through the
// capability adapters; their results are appended to the transcript for the
// next iteration.
//
// The supervisor bounds and observes — it never interprets tool semantics.
// Orders are tracked by watching `place_order` receipts go past, nothing
// more. The loop ends on the terminal signal, the step cap, a fatal tool
// error, or cancellation; a cancellation lets the in-flight call finish so
// no order is left half-submitted.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::AgentPolicy;
use crate::momentum::WatchlistEntry;
use crate::risk::{RiskGovernor, RiskStatus};
use crate::tools::retry::{retry_tool, RetryConfig};
use crate::tools::{ToolClient, ToolError, ToolResult};
use crate::types::{
    AccountSnapshot, MarketRegime, OrderRequest, PositionSnapshot, Session, SubmittedOrder,
};

// ---------------------------------------------------------------------------
// Reasoner boundary
// ---------------------------------------------------------------------------

/// One entry in the accumulated transcript shown to the reasoner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// The opening context: the operator's strategy prompt plus the
    /// cycle-specific situation report.
    Context {
        system_prompt: String,
        cycle_prompt: String,
    },
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        name: String,
        result: serde_json::Value,
    },
    ToolFailure {
        name: String,
        error: String,
    },
    Commentary {
        text: String,
    },
}

/// What the reasoner may answer with on each iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStep {
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
    Commentary {
        text: String,
    },
    /// Terminal signal: the reasoner is finished with this cycle.
    Done {
        summary: String,
    },
}

/// The external reasoning loop. The daemon only drives it; the reasoning
/// itself is out of scope.
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn next_step(&self, transcript: &[AgentEvent]) -> ToolResult<AgentStep>;
}

// ---------------------------------------------------------------------------
// Context and outcome
// ---------------------------------------------------------------------------

/// Everything the supervisor surfaces to the reasoner for one cycle.
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub cycle_id: u64,
    pub session: Session,
    pub regime: Option<MarketRegime>,
    /// Exchange-local wall clock, pre-rendered.
    pub exchange_local: String,
    pub risk: RiskStatus,
    pub scan_date: Option<NaiveDate>,
    pub watchlist: Vec<WatchlistEntry>,
}

/// What one reasoning run produced, as observed by the supervisor.
#[derive(Debug, Clone, Default)]
pub struct CycleOutcome {
    pub agent_steps_used: u32,
    pub orders_submitted: Vec<SubmittedOrder>,
    pub orders_filled: Vec<SubmittedOrder>,
    pub errors: Vec<String>,
    pub summary: Option<String>,
    /// The step cap was reached before the terminal signal.
    pub steps_exhausted: bool,
    /// Cancellation interrupted the loop.
    pub cancelled: bool,
    pub final_account: Option<AccountSnapshot>,
    pub final_positions: Vec<PositionSnapshot>,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct AgentSupervisor {
    reasoner: Arc<dyn Reasoner>,
    tools: Arc<dyn ToolClient>,
    /// Position sizing goes through the governor, not the reasoner's own
    /// arithmetic.
    risk: Arc<RiskGovernor>,
    policy: AgentPolicy,
    retry: RetryConfig,
    /// Operator-supplied strategy prompt, injected at startup and never
    /// inspected.
    system_prompt: String,
    shutdown: Arc<AtomicBool>,
}

impl AgentSupervisor {
    pub fn new(
        reasoner: Arc<dyn Reasoner>,
        tools: Arc<dyn ToolClient>,
        risk: Arc<RiskGovernor>,
        policy: AgentPolicy,
        system_prompt: String,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let retry = RetryConfig::from_policy(&policy);
        Self {
            reasoner,
            tools,
            risk,
            policy,
            retry,
            system_prompt,
            shutdown,
        }
    }

    /// Drive one reasoning session to completion.
    pub async fn run_once(&self, ctx: &CycleContext) -> CycleOutcome {
        let mut outcome = CycleOutcome::default();
        let mut transcript = vec![AgentEvent::Context {
            system_prompt: self.system_prompt.clone(),
            cycle_prompt: build_cycle_prompt(ctx),
        }];

        info!(
            cycle_id = ctx.cycle_id,
            session = %ctx.session,
            watchlist = ctx.watchlist.len(),
            "agent run starting"
        );

        loop {
            if outcome.agent_steps_used >= self.policy.max_steps {
                outcome.steps_exhausted = true;
                warn!(
                    cycle_id = ctx.cycle_id,
                    steps = outcome.agent_steps_used,
                    "agent step cap reached"
                );
                break;
            }
            // Observe the flag before starting another step; the in-flight
            // call below always completes once started.
            if self.shutdown.load(Ordering::SeqCst) {
                outcome.cancelled = true;
                info!(cycle_id = ctx.cycle_id, "agent run cancelled");
                break;
            }

            let step = match self.reasoner.next_step(&transcript).await {
                Ok(step) => step,
                Err(e) => {
                    outcome.errors.push(format!("reasoner: {e}"));
                    warn!(cycle_id = ctx.cycle_id, error = %e, "reasoner failed; ending run");
                    break;
                }
            };
            outcome.agent_steps_used += 1;

            match step {
                AgentStep::Done { summary } => {
                    debug!(cycle_id = ctx.cycle_id, "agent signalled done");
                    outcome.summary = Some(summary);
                    break;
                }
                AgentStep::Commentary { text } => {
                    debug!(cycle_id = ctx.cycle_id, commentary = %text, "agent commentary");
                    transcript.push(AgentEvent::Commentary { text });
                }
                AgentStep::ToolCall { name, arguments } => {
                    match self.dispatch(&name, &arguments, &mut outcome).await {
                        Ok(result) => {
                            transcript.push(AgentEvent::ToolCall {
                                name: name.clone(),
                                arguments,
                            });
                            transcript.push(AgentEvent::ToolResult { name, result });
                        }
                        Err(e) => {
                            outcome.errors.push(format!("{name}: {e}"));
                            transcript.push(AgentEvent::ToolCall {
                                name: name.clone(),
                                arguments,
                            });
                            transcript.push(AgentEvent::ToolFailure {
                                name: name.clone(),
                                error: e.to_string(),
                            });
                            if let ToolError::Fatal(_) = e {
                                warn!(
                                    cycle_id = ctx.cycle_id,
                                    tool = %name,
                                    error = %e,
                                    "fatal tool error; ending run"
                                );
                                break;
                            }
                        }
                    }
                }
            }
        }

        // Final account introspection, best-effort.
        if let Ok(account) = self.tools.get_account().await {
            outcome.final_account = Some(account);
        }
        if let Ok(positions) = self.tools.get_positions().await {
            outcome.final_positions = positions;
        }

        info!(
            cycle_id = ctx.cycle_id,
            steps = outcome.agent_steps_used,
            submitted = outcome.orders_submitted.len(),
            filled = outcome.orders_filled.len(),
            errors = outcome.errors.len(),
            "agent run finished"
        );
        outcome
    }

    /// Dispatch one named tool call. Adapter-level retries apply here; the
    /// reasoner sees a single outcome per call.
    async fn dispatch(
        &self,
        name: &str,
        arguments: &serde_json::Value,
        outcome: &mut CycleOutcome,
    ) -> ToolResult<serde_json::Value> {
        let tools = self.tools.clone();
        match name {
            "get_account" => {
                let account = retry_tool(&self.retry, name, || {
                    let tools = tools.clone();
                    async move { tools.get_account().await }
                })
                .await?;
                encode(&account)
            }
            "get_positions" => {
                let positions = retry_tool(&self.retry, name, || {
                    let tools = tools.clone();
                    async move { tools.get_positions().await }
                })
                .await?;
                encode(&positions)
            }
            "get_latest_quote" => {
                let symbol = require_str(arguments, "symbol")?;
                let quote = retry_tool(&self.retry, name, || {
                    let tools = tools.clone();
                    let symbol = symbol.clone();
                    async move { tools.get_latest_quote(&symbol).await }
                })
                .await?;
                encode(&quote)
            }
            "get_daily_bars" => {
                let symbols: Vec<String> = decode_field(arguments, "symbols")?;
                let from: NaiveDate = decode_field(arguments, "from")?;
                let to: NaiveDate = decode_field(arguments, "to")?;
                let bars = retry_tool(&self.retry, name, || {
                    let tools = tools.clone();
                    let symbols = symbols.clone();
                    async move { tools.get_daily_bars(&symbols, from, to).await }
                })
                .await?;
                encode(&bars)
            }
            "place_order" => {
                let req: OrderRequest = serde_json::from_value(arguments.clone())
                    .map_err(|e| ToolError::Fatal(format!("malformed order request: {e}")))?;
                let receipt = retry_tool(&self.retry, name, || {
                    let tools = tools.clone();
                    let req = req.clone();
                    async move { tools.place_order(&req).await }
                })
                .await?;
                let order = SubmittedOrder::from_receipt(&req, &receipt);
                outcome.orders_submitted.push(order.clone());
                if order.is_filled() {
                    outcome.orders_filled.push(order);
                }
                encode(&receipt)
            }
            "close_all_positions" => {
                let cancel_orders = arguments
                    .get("cancel_orders")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                let results = retry_tool(&self.retry, name, || {
                    let tools = tools.clone();
                    async move { tools.close_all_positions(cancel_orders).await }
                })
                .await?;
                encode(&results)
            }
            "compute_indicators" => {
                let symbol = require_str(arguments, "symbol")?;
                let window = arguments
                    .get("window")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(14) as u32;
                retry_tool(&self.retry, name, || {
                    let tools = tools.clone();
                    let symbol = symbol.clone();
                    async move { tools.compute_indicators(&symbol, window).await }
                })
                .await
            }
            "market_clock" => {
                let clock = retry_tool(&self.retry, name, || {
                    let tools = tools.clone();
                    async move { tools.market_clock().await }
                })
                .await?;
                encode(&clock)
            }
            "size_position" => {
                let entry = require_f64(arguments, "entry")?;
                let stop = require_f64(arguments, "stop")?;
                let equity = self.risk.status().current;
                let shares = self
                    .risk
                    .size_position(equity, entry, stop)
                    .map_err(|e| ToolError::Fatal(format!("INVALID_STOP: {e}")))?;
                Ok(json!({ "shares": shares, "equity": equity }))
            }
            other => Err(ToolError::Fatal(format!("unknown tool '{other}'"))),
        }
    }
}

impl std::fmt::Debug for AgentSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSupervisor")
            .field("max_steps", &self.policy.max_steps)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Prompt assembly
// ---------------------------------------------------------------------------

/// Strategy-neutral situation report. The trading strategy itself lives in
/// the operator's system prompt, not here.
fn build_cycle_prompt(ctx: &CycleContext) -> String {
    let watchlist: Vec<serde_json::Value> = ctx
        .watchlist
        .iter()
        .map(|m| {
            json!({
                "symbol": m.symbol,
                "direction": m.direction,
                "rank": m.rank,
                "close": m.close,
                "change_pct": m.change_pct,
                "momentum_score": m.momentum_score,
                "volume": m.volume,
                "indicators": m.indicators,
            })
        })
        .collect();

    json!({
        "cycle_id": ctx.cycle_id,
        "session": ctx.session,
        "exchange_local_time": ctx.exchange_local,
        "regime": ctx.regime,
        "scan_date": ctx.scan_date,
        "risk": {
            "allowed": ctx.risk.allowed,
            "drawdown_pct": ctx.risk.drawdown_pct,
            "month_high_equity": ctx.risk.month_high,
            "current_equity": ctx.risk.current,
        },
        "watchlist": watchlist,
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn encode<T: Serialize>(value: &T) -> ToolResult<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| ToolError::Transient(format!("failed to encode tool result: {e}")))
}

fn require_str(arguments: &serde_json::Value, key: &str) -> ToolResult<String> {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ToolError::Fatal(format!("missing argument '{key}'")))
}

fn require_f64(arguments: &serde_json::Value, key: &str) -> ToolResult<f64> {
    arguments
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| ToolError::Fatal(format!("missing argument '{key}'")))
}

fn decode_field<T: serde::de::DeserializeOwned>(
    arguments: &serde_json::Value,
    key: &str,
) -> ToolResult<T> {
    let value = arguments
        .get(key)
        .ok_or_else(|| ToolError::Fatal(format!("missing argument '{key}'")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| ToolError::Fatal(format!("bad argument '{key}': {e}")))
}
