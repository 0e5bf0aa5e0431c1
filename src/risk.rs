// =============================================================================
// Risk Governor — monthly drawdown gate and position sizing
// =============================================================================
//
// The governor is the single gate every trading-enabling decision passes
// through. It tracks equity against the month's high-water mark and suspends
// trading when the drawdown reaches the monthly limit (default 6 %). A
// suspension never clears on its own within the month: only the calendar
// rolling over, or an explicit operator clear, re-enables trading.
//
// State is persisted to `risk_management.json` after every mutation using an
// atomic tmp + rename write. On startup a missing or corrupt file re-anchors
// the month from current broker equity.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::SessionSchedule;
use crate::config::RiskPolicy;
use crate::types::TradeResult;

/// Suspension reason recorded when the monthly limit trips.
pub const REASON_MONTHLY_DRAWDOWN: &str = "MONTHLY_DRAWDOWN";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SizingError {
    /// Stop distance is zero or negative; the position cannot be sized.
    #[error("invalid stop: entry {entry} stop {stop}")]
    InvalidStop { entry: f64, stop: f64 },
}

// ---------------------------------------------------------------------------
// Persisted state (risk_management.json)
// ---------------------------------------------------------------------------

/// The governor's complete persisted state. Serialized verbatim; all fields
/// carry defaults so an older file never fails to load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    /// Active month in `YYYY-MM`, exchange-local calendar.
    pub month_key: String,
    pub month_start_equity: f64,
    /// High-water equity since the month started. Non-decreasing within a
    /// month.
    pub month_high_equity: f64,
    pub current_equity: f64,
    pub current_drawdown_pct: f64,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub suspension_reason: Option<String>,
    /// Exchange-local day the daily counters belong to.
    #[serde(default)]
    pub day_key: String,
    #[serde(default)]
    pub trade_count_today: u32,
    #[serde(default)]
    pub trades_by_symbol: HashMap<String, u32>,
    #[serde(default)]
    pub consecutive_losses: u32,
    #[serde(default)]
    pub last_trade_results: VecDeque<TradeResult>,
}

impl RiskState {
    fn fresh(month_key: String, day_key: String, equity: f64) -> Self {
        Self {
            month_key,
            month_start_equity: equity,
            month_high_equity: equity,
            current_equity: equity,
            current_drawdown_pct: 0.0,
            suspended: false,
            suspension_reason: None,
            day_key,
            trade_count_today: 0,
            trades_by_symbol: HashMap::new(),
            consecutive_losses: 0,
            last_trade_results: VecDeque::new(),
        }
    }
}

/// Read-only gate answer handed to the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct RiskStatus {
    pub allowed: bool,
    pub reason: Option<String>,
    pub drawdown_pct: f64,
    pub month_high: f64,
    pub current: f64,
}

// ---------------------------------------------------------------------------
// Governor
// ---------------------------------------------------------------------------

pub struct RiskGovernor {
    state: RwLock<RiskState>,
    policy: RiskPolicy,
    path: PathBuf,
    schedule: SessionSchedule,
}

impl RiskGovernor {
    /// Load persisted state from `path`, or initialise from `startup_equity`
    /// when the file is absent or corrupt.
    pub fn load_or_init(
        path: PathBuf,
        policy: RiskPolicy,
        schedule: SessionSchedule,
        startup_equity: f64,
        at: DateTime<Utc>,
    ) -> Self {
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<RiskState>(&content) {
                Ok(state) => {
                    info!(
                        month = %state.month_key,
                        equity = state.current_equity,
                        suspended = state.suspended,
                        "risk state loaded"
                    );
                    state
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "RISK_STATE_REINIT: corrupt risk state; re-anchoring from broker equity"
                    );
                    RiskState::fresh(
                        month_key(&schedule, at),
                        day_key(&schedule, at),
                        startup_equity,
                    )
                }
            },
            Err(_) => {
                info!(
                    path = %path.display(),
                    equity = startup_equity,
                    "RISK_STATE_REINIT: no risk state on disk; initialising from broker equity"
                );
                RiskState::fresh(
                    month_key(&schedule, at),
                    day_key(&schedule, at),
                    startup_equity,
                )
            }
        };

        let governor = Self {
            state: RwLock::new(state),
            policy,
            path,
            schedule,
        };
        // Best-effort persist of the (possibly re-anchored) startup state.
        if let Err(e) = governor.persist() {
            warn!(error = %e, "failed to persist startup risk state");
        }
        governor
    }

    // -------------------------------------------------------------------------
    // Equity tracking
    // -------------------------------------------------------------------------

    /// Record a fresh equity reading: advance the high-water mark, recompute
    /// drawdown, and trip the suspension if the monthly limit is reached.
    ///
    /// A persistence failure is returned to the caller, which must not
    /// advance the cycle counter — the update is retried next tick.
    pub fn update_equity(&self, new_equity: f64, at: DateTime<Utc>) -> Result<()> {
        {
            let mut s = self.state.write();
            s.current_equity = new_equity;
            if new_equity > s.month_high_equity {
                s.month_high_equity = new_equity;
            }
            s.current_drawdown_pct = if s.month_high_equity > 0.0 {
                ((s.month_high_equity - new_equity) / s.month_high_equity * 100.0).max(0.0)
            } else {
                0.0
            };

            if !s.suspended && s.current_drawdown_pct >= self.policy.monthly_limit_pct {
                s.suspended = true;
                s.suspension_reason = Some(REASON_MONTHLY_DRAWDOWN.to_string());
                warn!(
                    drawdown_pct = s.current_drawdown_pct,
                    limit_pct = self.policy.monthly_limit_pct,
                    month_high = s.month_high_equity,
                    equity = new_equity,
                    "monthly drawdown limit reached — trading suspended"
                );
            }

            debug!(
                equity = new_equity,
                month_high = s.month_high_equity,
                drawdown_pct = s.current_drawdown_pct,
                at = %at,
                "equity updated"
            );
        }
        self.persist()
    }

    // -------------------------------------------------------------------------
    // Gate
    // -------------------------------------------------------------------------

    /// Whether a cycle is allowed to trade right now, and why not if not.
    pub fn status(&self) -> RiskStatus {
        let s = self.state.read();
        RiskStatus {
            allowed: !s.suspended,
            reason: s.suspension_reason.clone(),
            drawdown_pct: s.current_drawdown_pct,
            month_high: s.month_high_equity,
            current: s.current_equity,
        }
    }

    // -------------------------------------------------------------------------
    // Position sizing
    // -------------------------------------------------------------------------

    /// Shares for a trade risking `per_trade_risk_pct` of equity between
    /// entry and stop, capped so the position's notional value stays under
    /// `per_trade_value_cap_pct` of equity.
    pub fn size_position(&self, equity: f64, entry: f64, stop: f64) -> Result<u64, SizingError> {
        let stop_distance = (entry - stop).abs();
        if stop_distance <= 0.0 || entry <= 0.0 {
            return Err(SizingError::InvalidStop { entry, stop });
        }

        let by_risk = (equity * self.policy.per_trade_risk_pct / 100.0) / stop_distance;
        let by_value = (equity * self.policy.per_trade_value_cap_pct / 100.0) / entry;
        let shares = by_risk.min(by_value).floor().max(0.0) as u64;

        debug!(equity, entry, stop, shares, "position sized");
        Ok(shares)
    }

    // -------------------------------------------------------------------------
    // Trade recording
    // -------------------------------------------------------------------------

    /// Append a completed trade result: bounded ring, per-symbol day counter,
    /// consecutive-loss tracking.
    pub fn record_trade(&self, result: TradeResult) -> Result<()> {
        {
            let mut s = self.state.write();
            let today = day_key(&self.schedule, result.closed_at);
            if s.day_key != today {
                s.day_key = today;
                s.trade_count_today = 0;
                s.trades_by_symbol.clear();
            }

            s.trade_count_today += 1;
            *s.trades_by_symbol.entry(result.symbol.clone()).or_insert(0) += 1;

            if result.pnl < 0.0 {
                s.consecutive_losses += 1;
            } else {
                s.consecutive_losses = 0;
            }

            s.last_trade_results.push_back(result.clone());
            while s.last_trade_results.len() > self.policy.trade_ring_capacity {
                s.last_trade_results.pop_front();
            }

            debug!(
                symbol = %result.symbol,
                pnl = result.pnl,
                trades_today = s.trade_count_today,
                consecutive_losses = s.consecutive_losses,
                "trade recorded"
            );
        }
        self.persist()
    }

    // -------------------------------------------------------------------------
    // Month rollover
    // -------------------------------------------------------------------------

    /// If the exchange-local month has changed, re-anchor the month to the
    /// current equity, clear any suspension, and reset day counters.
    pub fn reset_if_new_month(&self, at: DateTime<Utc>) -> Result<()> {
        let rolled = {
            let mut s = self.state.write();
            let key = month_key(&self.schedule, at);
            if s.month_key == key {
                false
            } else {
                info!(
                    old_month = %s.month_key,
                    new_month = %key,
                    equity = s.current_equity,
                    "month rolled — re-anchoring risk state"
                );
                s.month_key = key;
                s.month_start_equity = s.current_equity;
                s.month_high_equity = s.current_equity;
                s.current_drawdown_pct = 0.0;
                s.suspended = false;
                s.suspension_reason = None;
                s.day_key = day_key(&self.schedule, at);
                s.trade_count_today = 0;
                s.trades_by_symbol.clear();
                true
            }
        };
        if rolled {
            self.persist()
        } else {
            Ok(())
        }
    }

    // -------------------------------------------------------------------------
    // Operator controls
    // -------------------------------------------------------------------------

    /// Manual halt: suspends trading until `clear_halt` or the month rolls
    /// over. Survives restarts via the persisted state.
    pub fn halt(&self, reason: &str) -> Result<()> {
        {
            let mut s = self.state.write();
            s.suspended = true;
            s.suspension_reason = Some(format!("MANUAL_HALT: {reason}"));
            warn!(reason, "manual halt engaged");
        }
        self.persist()
    }

    /// Clear any suspension, manual or drawdown-based.
    pub fn clear_halt(&self) -> Result<()> {
        {
            let mut s = self.state.write();
            s.suspended = false;
            s.suspension_reason = None;
            info!("suspension cleared by operator");
        }
        self.persist()
    }

    /// Snapshot of the full persisted state (for journaling and tests).
    pub fn snapshot(&self) -> RiskState {
        self.state.read().clone()
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Atomic write: serialize to a temporary sibling file, then rename.
    fn persist(&self) -> Result<()> {
        let content = {
            let s = self.state.read();
            serde_json::to_string_pretty(&*s).context("failed to serialise risk state")?
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename into {}", self.path.display()))?;

        Ok(())
    }
}

impl std::fmt::Debug for RiskGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskGovernor")
            .field("path", &self.path)
            .field("policy", &self.policy)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Calendar keys (exchange-local)
// ---------------------------------------------------------------------------

fn month_key(schedule: &SessionSchedule, at: DateTime<Utc>) -> String {
    schedule.exchange_time(at).format("%Y-%m").to_string()
}

fn day_key(schedule: &SessionSchedule, at: DateTime<Utc>) -> String {
    schedule.exchange_date(at).to_string()
}
