// =============================================================================
// Consumed tool capabilities
// =============================================================================
//
// The daemon does not implement market data, order execution, indicators, or
// the broker clock; it consumes them as named capabilities behind the
// `ToolClient` trait. Adapters translate whatever is on the wire into the
// typed records of `crate::types` and classify every failure into the
// three-way `ToolError` sum so callers switch on the kind instead of
// string-matching.
// =============================================================================

pub mod http;
pub mod retry;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::types::{
    AccountSnapshot, BrokerClock, CloseResult, DailyBar, OrderReceipt, OrderRequest,
    PositionSnapshot, Quote,
};

// ---------------------------------------------------------------------------
// Error sum
// ---------------------------------------------------------------------------

/// Outcome classification for a tool call.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    /// The call failed in a way that may succeed on retry (timeouts, 5xx,
    /// malformed payloads).
    #[error("transient tool failure: {0}")]
    Transient(String),

    /// The endpoint itself is unreachable. Retryable, but at startup this is
    /// the signal that ends the process with exit code 1.
    #[error("tool endpoint unavailable: {0}")]
    Unavailable(String),

    /// The call can never succeed as issued (rejected request, 4xx).
    #[error("fatal tool failure: {0}")]
    Fatal(String),
}

impl ToolError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Unavailable(_))
    }
}

pub type ToolResult<T> = Result<T, ToolError>;

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

/// The eight consumed capabilities, as typed async methods. One production
/// implementation (`http::HttpToolClient`) talks JSON over HTTP; tests plug
/// in hand-rolled mocks.
#[async_trait]
pub trait ToolClient: Send + Sync {
    async fn get_account(&self) -> ToolResult<AccountSnapshot>;

    async fn get_positions(&self) -> ToolResult<Vec<PositionSnapshot>>;

    async fn get_latest_quote(&self, symbol: &str) -> ToolResult<Quote>;

    /// Daily bars per symbol over `[from, to]`, exchange-local dates.
    async fn get_daily_bars(
        &self,
        symbols: &[String],
        from: NaiveDate,
        to: NaiveDate,
    ) -> ToolResult<HashMap<String, Vec<DailyBar>>>;

    async fn place_order(&self, req: &OrderRequest) -> ToolResult<OrderReceipt>;

    async fn close_all_positions(&self, cancel_orders: bool) -> ToolResult<Vec<CloseResult>>;

    /// Technical indicators for one symbol. The payload is opaque to the
    /// daemon; it is attached to watchlist rows and handed to the agent
    /// verbatim.
    async fn compute_indicators(&self, symbol: &str, window: u32)
        -> ToolResult<serde_json::Value>;

    async fn market_clock(&self) -> ToolResult<BrokerClock>;
}
