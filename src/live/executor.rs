//! Order execution
//!
//! The engine only changes state after an executor reports a fill, so a
//! failed order leaves the position and round state untouched.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ExchangeConfig;
use crate::error::ExecutionError;
use crate::{Side, Symbol};

type HmacSha256 = Hmac<Sha256>;

/// Binance code for "No need to change margin type"
const MARGIN_TYPE_UNCHANGED: i64 = -4046;

/// Market order for a whole position
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub amount: f64,
    /// Last close the decision was made on
    pub reference_price: f64,
    pub leverage: u32,
    pub reduce_only: bool,
}

impl OrderRequest {
    fn validate(&self) -> Result<(), ExecutionError> {
        if !(self.amount.is_finite() && self.amount > 0.0) {
            return Err(ExecutionError::Rejected(format!(
                "{}: invalid amount {}",
                self.symbol, self.amount
            )));
        }
        if !(self.reference_price.is_finite() && self.reference_price > 0.0) {
            return Err(ExecutionError::Rejected(format!(
                "{}: invalid reference price {}",
                self.symbol, self.reference_price
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub price: f64,
    pub amount: f64,
    pub order_id: String,
}

#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn open(&self, order: &OrderRequest) -> Result<Fill, ExecutionError>;
    async fn close(&self, order: &OrderRequest) -> Result<Fill, ExecutionError>;
}

/// Simulated executor filling every order at its reference price
#[derive(Debug, Default)]
pub struct PaperExecutor {
    next_id: AtomicU64,
}

impl PaperExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn fill(&self, order: &OrderRequest) -> Result<Fill, ExecutionError> {
        order.validate()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "[PAPER] {} {} {:.6} @ {:.6}{}",
            order.side.as_str().to_uppercase(),
            order.symbol,
            order.amount,
            order.reference_price,
            if order.reduce_only { " (reduce-only)" } else { "" }
        );
        Ok(Fill {
            price: order.reference_price,
            amount: order.amount,
            order_id: format!("paper-{}", id),
        })
    }
}

#[async_trait]
impl OrderExecutor for PaperExecutor {
    async fn open(&self, order: &OrderRequest) -> Result<Fill, ExecutionError> {
        self.fill(order)
    }

    async fn close(&self, order: &OrderRequest) -> Result<Fill, ExecutionError> {
        self.fill(order)
    }
}

/// HMAC-SHA256 signature of a query string, hex encoded
pub fn sign_query(secret: &str, query: &str) -> Result<String, ExecutionError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExecutionError::Rejected(format!("invalid API secret: {}", e)))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Format a quantity with at most `precision` decimals, truncating
pub fn format_quantity(amount: f64, precision: u32) -> String {
    let scale = 10f64.powi(precision as i32);
    let truncated = (amount * scale).floor() / scale;
    format!("{:.*}", precision as usize, truncated)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    #[serde(default)]
    avg_price: String,
    #[serde(default)]
    executed_qty: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    quantity_precision: u32,
}

/// Binance USDⓈ-M futures executor. Positions use isolated margin at the
/// configured leverage and are opened and closed with market orders.
pub struct BinanceFuturesExecutor {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
    quantity_precision: Mutex<HashMap<Symbol, u32>>,
    configured_leverage: Mutex<HashMap<Symbol, u32>>,
}

impl BinanceFuturesExecutor {
    pub fn new(config: &ExchangeConfig) -> Result<Self, ExecutionError> {
        let (Some(api_key), Some(api_secret)) = (&config.api_key, &config.api_secret) else {
            return Err(ExecutionError::MissingCredentials);
        };
        if api_key.is_empty() || api_secret.is_empty() {
            return Err(ExecutionError::MissingCredentials);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(BinanceFuturesExecutor {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.clone(),
            api_secret: api_secret.clone(),
            recv_window_ms: config.recv_window_ms,
            quantity_precision: Mutex::new(HashMap::new()),
            configured_leverage: Mutex::new(HashMap::new()),
        })
    }

    async fn signed(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<String, ExecutionError> {
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>();
        query.push(format!("recvWindow={}", self.recv_window_ms));
        query.push(format!("timestamp={}", Utc::now().timestamp_millis()));
        let query = query.join("&");
        let signature = sign_query(&self.api_secret, &query)?;

        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);
        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ExecutionError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn precision(&self, symbol: &Symbol) -> Result<u32, ExecutionError> {
        if let Some(p) = self.quantity_precision.lock().await.get(symbol) {
            return Ok(*p);
        }

        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExecutionError::Api {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let info: ExchangeInfo = response.json().await?;

        let mut cache = self.quantity_precision.lock().await;
        for s in info.symbols {
            cache.insert(Symbol::new(&s.symbol), s.quantity_precision);
        }
        cache
            .get(symbol)
            .copied()
            .ok_or_else(|| ExecutionError::Rejected(format!("unknown futures symbol {}", symbol)))
    }

    /// Isolated margin and leverage, once per symbol and leverage value
    async fn prepare(&self, symbol: &Symbol, leverage: u32) -> Result<(), ExecutionError> {
        if self.configured_leverage.lock().await.get(symbol) == Some(&leverage) {
            return Ok(());
        }

        let margin = self
            .signed(
                Method::POST,
                "/fapi/v1/marginType",
                &[("symbol", symbol.to_string()), ("marginType", "ISOLATED".to_string())],
            )
            .await;
        match margin {
            Ok(_) => debug!("{}: margin type set to ISOLATED", symbol),
            Err(ExecutionError::Api { body, .. })
                if serde_json::from_str::<ApiErrorBody>(&body)
                    .map_or(false, |e| e.code == MARGIN_TYPE_UNCHANGED) => {}
            Err(e) => return Err(e),
        }

        self.signed(
            Method::POST,
            "/fapi/v1/leverage",
            &[("symbol", symbol.to_string()), ("leverage", leverage.to_string())],
        )
        .await?;
        info!("{}: leverage set to {}x", symbol, leverage);

        self.configured_leverage
            .lock()
            .await
            .insert(symbol.clone(), leverage);
        Ok(())
    }

    async fn market_order(&self, order: &OrderRequest) -> Result<Fill, ExecutionError> {
        order.validate()?;
        let precision = self.precision(&order.symbol).await?;
        let quantity = format_quantity(order.amount, precision);
        if quantity.parse::<f64>().map_or(true, |q| q <= 0.0) {
            return Err(ExecutionError::Rejected(format!(
                "{}: amount {} rounds to zero",
                order.symbol, order.amount
            )));
        }

        let mut params = vec![
            ("symbol", order.symbol.to_string()),
            ("side", order.side.as_str().to_uppercase()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        if order.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let body = self.signed(Method::POST, "/fapi/v1/order", &params).await?;
        let response: OrderResponse = serde_json::from_str(&body)
            .map_err(|e| ExecutionError::Rejected(format!("unexpected order response: {}", e)))?;

        let price = response
            .avg_price
            .parse::<f64>()
            .ok()
            .filter(|p| *p > 0.0)
            .unwrap_or_else(|| {
                warn!("{}: no average price in fill, using reference", order.symbol);
                order.reference_price
            });
        let amount = response
            .executed_qty
            .parse::<f64>()
            .ok()
            .filter(|q| *q > 0.0)
            .unwrap_or(order.amount);

        info!(
            "{} {} {:.6} filled @ {:.6} (order {})",
            order.side.as_str().to_uppercase(),
            order.symbol,
            amount,
            price,
            response.order_id
        );
        Ok(Fill {
            price,
            amount,
            order_id: response.order_id.to_string(),
        })
    }
}

#[async_trait]
impl OrderExecutor for BinanceFuturesExecutor {
    async fn open(&self, order: &OrderRequest) -> Result<Fill, ExecutionError> {
        self.prepare(&order.symbol, order.leverage).await?;
        self.market_order(order).await
    }

    async fn close(&self, order: &OrderRequest) -> Result<Fill, ExecutionError> {
        let order = OrderRequest {
            reduce_only: true,
            ..order.clone()
        };
        self.market_order(&order).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(amount: f64) -> OrderRequest {
        OrderRequest {
            symbol: Symbol::new("BTCUSDT"),
            side: Side::Buy,
            amount,
            reference_price: 42_000.0,
            leverage: 5,
            reduce_only: false,
        }
    }

    #[test]
    fn test_sign_known_vector() {
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        let signature =
            sign_query("NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j", query)
                .unwrap();
        assert_eq!(
            signature,
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_format_quantity_truncates() {
        assert_eq!(format_quantity(0.0012345, 3), "0.001");
        assert_eq!(format_quantity(12.0, 0), "12");
        assert_eq!(format_quantity(1.9999, 2), "1.99");
    }

    #[tokio::test]
    async fn test_paper_fills_at_reference() {
        let executor = PaperExecutor::new();
        let fill = executor.open(&order(0.01)).await.unwrap();
        assert_eq!(fill.price, 42_000.0);
        assert_eq!(fill.amount, 0.01);
        assert_eq!(fill.order_id, "paper-1");

        let fill = executor.close(&order(0.01)).await.unwrap();
        assert_eq!(fill.order_id, "paper-2");
    }

    #[tokio::test]
    async fn test_paper_rejects_bad_orders() {
        let executor = PaperExecutor::new();
        assert!(matches!(
            executor.open(&order(0.0)).await,
            Err(ExecutionError::Rejected(_))
        ));
    }

    #[test]
    fn test_binance_requires_credentials() {
        let config = ExchangeConfig::default();
        assert!(matches!(
            BinanceFuturesExecutor::new(&config),
            Err(ExecutionError::MissingCredentials)
        ));
    }
}
