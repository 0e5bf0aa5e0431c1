// =============================================================================
// HTTP adapters for the consumed capabilities
// =============================================================================
//
// Every capability is a POST of a JSON payload to `{base}/tools/{name}`; the
// response body is decoded straight into the typed records of `crate::types`.
// A payload that fails to decode is a `Transient` failure, not a panic — the
// endpoint may be mid-deploy and the next cycle will see a sane shape again.
//
// Two reqwest clients are held: data calls run under the short timeout,
// order calls under the longer one, per policy.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, instrument};

use crate::agent::{AgentEvent, AgentStep, Reasoner};
use crate::config::AgentPolicy;
use crate::tools::{ToolClient, ToolError, ToolResult};
use crate::types::{
    AccountSnapshot, BrokerClock, CloseResult, DailyBar, OrderReceipt, OrderRequest,
    PositionSnapshot, Quote,
};

/// Timeout for one reasoner step. Reasoning runs much longer than a data
/// fetch, so it gets its own bound rather than the tool-call timeouts.
const REASONER_STEP_TIMEOUT_SECS: u64 = 120;

// ---------------------------------------------------------------------------
// Tool client
// ---------------------------------------------------------------------------

/// JSON-over-HTTP implementation of the capability set.
#[derive(Clone)]
pub struct HttpToolClient {
    base_url: String,
    data_client: reqwest::Client,
    trade_client: reqwest::Client,
}

impl HttpToolClient {
    pub fn new(base_url: impl Into<String>, policy: &AgentPolicy) -> Self {
        let data_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(policy.data_timeout_secs))
            .build()
            .expect("failed to build reqwest client");
        let trade_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(policy.trade_timeout_secs))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            data_client,
            trade_client,
        }
    }

    /// POST `payload` to the named capability and decode the response.
    async fn call<T: DeserializeOwned>(
        &self,
        client: &reqwest::Client,
        name: &str,
        payload: serde_json::Value,
    ) -> ToolResult<T> {
        let url = format!("{}/tools/{}", self.base_url, name);

        let resp = client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| classify_transport_error(name, &e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ToolError::Transient(format!("{name}: failed to read body: {e}")))?;

        if !status.is_success() {
            return Err(classify_status(name, status.as_u16(), &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            ToolError::Transient(format!("{name}: failed to decode response: {e}"))
        })
    }
}

#[async_trait]
impl ToolClient for HttpToolClient {
    #[instrument(skip(self), name = "tools::get_account")]
    async fn get_account(&self) -> ToolResult<AccountSnapshot> {
        let snap: AccountSnapshot = self
            .call(&self.data_client, "get_account", json!({}))
            .await?;
        debug!(equity = snap.equity, "account snapshot retrieved");
        Ok(snap)
    }

    #[instrument(skip(self), name = "tools::get_positions")]
    async fn get_positions(&self) -> ToolResult<Vec<PositionSnapshot>> {
        self.call(&self.data_client, "get_positions", json!({})).await
    }

    #[instrument(skip(self), name = "tools::get_latest_quote")]
    async fn get_latest_quote(&self, symbol: &str) -> ToolResult<Quote> {
        self.call(
            &self.data_client,
            "get_latest_quote",
            json!({ "symbol": symbol }),
        )
        .await
    }

    #[instrument(skip(self, symbols), name = "tools::get_daily_bars")]
    async fn get_daily_bars(
        &self,
        symbols: &[String],
        from: NaiveDate,
        to: NaiveDate,
    ) -> ToolResult<HashMap<String, Vec<DailyBar>>> {
        let bars: HashMap<String, Vec<DailyBar>> = self
            .call(
                &self.data_client,
                "get_daily_bars",
                json!({
                    "symbols": symbols,
                    "from": from.to_string(),
                    "to": to.to_string(),
                }),
            )
            .await?;
        debug!(requested = symbols.len(), returned = bars.len(), "daily bars fetched");
        Ok(bars)
    }

    #[instrument(skip(self, req), fields(symbol = %req.symbol, side = %req.side), name = "tools::place_order")]
    async fn place_order(&self, req: &OrderRequest) -> ToolResult<OrderReceipt> {
        let receipt: OrderReceipt = self
            .call(
                &self.trade_client,
                "place_order",
                serde_json::to_value(req)
                    .map_err(|e| ToolError::Fatal(format!("unencodable order request: {e}")))?,
            )
            .await?;
        debug!(order_id = %receipt.order_id, status = %receipt.status, "order submitted");
        Ok(receipt)
    }

    #[instrument(skip(self), name = "tools::close_all_positions")]
    async fn close_all_positions(&self, cancel_orders: bool) -> ToolResult<Vec<CloseResult>> {
        self.call(
            &self.trade_client,
            "close_all_positions",
            json!({ "cancel_orders": cancel_orders }),
        )
        .await
    }

    #[instrument(skip(self), name = "tools::compute_indicators")]
    async fn compute_indicators(
        &self,
        symbol: &str,
        window: u32,
    ) -> ToolResult<serde_json::Value> {
        self.call(
            &self.data_client,
            "compute_indicators",
            json!({ "symbol": symbol, "window": window }),
        )
        .await
    }

    #[instrument(skip(self), name = "tools::market_clock")]
    async fn market_clock(&self) -> ToolResult<BrokerClock> {
        self.call(&self.data_client, "market_clock", json!({})).await
    }
}

impl std::fmt::Debug for HttpToolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpToolClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Reasoner adapter
// ---------------------------------------------------------------------------

/// HTTP adapter for the external reasoning loop. The accumulated transcript
/// is posted as-is; the endpoint answers with the next step (a tool call,
/// commentary, or the terminal signal).
pub struct HttpReasoner {
    base_url: String,
    client: reqwest::Client,
}

impl HttpReasoner {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REASONER_STEP_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");
        Self {
            base_url: base_url.into(),
            client,
        }
    }
}

#[async_trait]
impl Reasoner for HttpReasoner {
    #[instrument(skip(self, transcript), fields(events = transcript.len()), name = "reasoner::next_step")]
    async fn next_step(&self, transcript: &[AgentEvent]) -> ToolResult<AgentStep> {
        let url = format!("{}/reason", self.base_url);

        let resp = self
            .client
            .post(&url)
            .json(&json!({ "transcript": transcript }))
            .send()
            .await
            .map_err(|e| classify_transport_error("reason", &e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ToolError::Transient(format!("reason: failed to read body: {e}")))?;

        if !status.is_success() {
            return Err(classify_status("reason", status.as_u16(), &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| ToolError::Transient(format!("reason: failed to decode step: {e}")))
    }
}

impl std::fmt::Debug for HttpReasoner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpReasoner")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

fn classify_transport_error(name: &str, err: &reqwest::Error) -> ToolError {
    if err.is_connect() {
        ToolError::Unavailable(format!("{name}: {err}"))
    } else if err.is_timeout() {
        ToolError::Transient(format!("{name}: timed out: {err}"))
    } else {
        ToolError::Transient(format!("{name}: {err}"))
    }
}

fn classify_status(name: &str, status: u16, body: &str) -> ToolError {
    match status {
        408 | 429 | 500..=599 => {
            ToolError::Transient(format!("{name}: HTTP {status}: {body}"))
        }
        _ => ToolError::Fatal(format!("{name}: HTTP {status}: {body}")),
    }
}
