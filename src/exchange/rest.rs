use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;

use super::error::ExchangeError;
use super::retry::RestGate;
use super::{
    ExchangeApi, FillRecord, HistoricalCandle, LimitOrderParams, MarketOrderParams, OrderAck,
};
use crate::models::Instrument;

type HmacSha256 = Hmac<Sha256>;

const API_BASE: &str = "https://api.coinbase.com";
const BROKERAGE: &str = "/api/v3/brokerage";
const FILLS_PAGE_LIMIT: u32 = 100;
const MAX_FILL_PAGES: u32 = 20;

/// Coinbase Advanced Trade REST client
///
/// Every call goes through the shared [`RestGate`] (rps ceiling + bounded
/// retry with jitter). Cloneable; clones share the HTTP pool and the gate.
#[derive(Clone)]
pub struct CoinbaseRest {
    http: Client,
    gate: RestGate,
    api_key: String,
    api_secret: String,
}

impl CoinbaseRest {
    pub fn new(api_key: String, api_secret: String, gate: RestGate) -> Result<Self, ExchangeError> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            gate,
            api_key,
            api_secret,
        })
    }

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let prehash = format!("{timestamp}{method}{path}{body}");
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(prehash.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ExchangeError> {
        let url = format!("{API_BASE}{path}");
        let body_str = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        let timestamp = Utc::now().timestamp().to_string();
        let signature = self.sign(&timestamp, method.as_str(), path, &body_str);

        let mut req = self
            .http
            .request(method, &url)
            .query(query)
            .header("CB-ACCESS-KEY", &self.api_key)
            .header("CB-ACCESS-SIGN", signature)
            .header("CB-ACCESS-TIMESTAMP", timestamp);
        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ExchangeError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let value = resp.json::<serde_json::Value>().await?;
        Ok(value)
    }
}

fn granularity_label(secs: u64) -> &'static str {
    match secs {
        60 => "ONE_MINUTE",
        300 => "FIVE_MINUTE",
        900 => "FIFTEEN_MINUTE",
        1800 => "THIRTY_MINUTE",
        3600 => "ONE_HOUR",
        21600 => "SIX_HOUR",
        86400 => "ONE_DAY",
        _ => "FIVE_MINUTE",
    }
}

fn parse_f64_field(v: &serde_json::Value, key: &str) -> Option<f64> {
    match v.get(key) {
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct FillsPage {
    #[serde(default)]
    fills: Vec<FillRecord>,
    #[serde(default)]
    cursor: Option<String>,
}

#[async_trait]
impl ExchangeApi for CoinbaseRest {
    async fn get_product(&self, product_id: &str) -> Result<Instrument, ExchangeError> {
        let path = format!("{BROKERAGE}/products/{product_id}");
        let body = self
            .gate
            .run("get_product", || {
                self.request(Method::GET, &path, &[], None)
            })
            .await?;

        let price_increment = parse_f64_field(&body, "price_increment")
            .or_else(|| parse_f64_field(&body, "quote_increment"))
            .unwrap_or(0.01);
        let base_increment = parse_f64_field(&body, "base_increment").unwrap_or(1e-8);
        let min_market_base_size =
            parse_f64_field(&body, "base_min_size").unwrap_or(0.0);

        Ok(Instrument {
            product_id: product_id.to_string(),
            price_increment,
            base_increment,
            min_market_base_size,
        })
    }

    async fn get_candles(
        &self,
        product_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity_secs: u64,
    ) -> Result<Vec<HistoricalCandle>, ExchangeError> {
        let path = format!("{BROKERAGE}/products/{product_id}/candles");
        let query = [
            ("start", start.timestamp().to_string()),
            ("end", end.timestamp().to_string()),
            (
                "granularity",
                granularity_label(granularity_secs).to_string(),
            ),
        ];
        let body = self
            .gate
            .run("get_candles", || {
                self.request(Method::GET, &path, &query, None)
            })
            .await?;

        let raw = body
            .get("candles")
            .and_then(|c| c.as_array())
            .ok_or_else(|| ExchangeError::Malformed("candles array missing".to_string()))?;

        let mut out = Vec::with_capacity(raw.len());
        for c in raw {
            let start_secs = match c.get("start") {
                Some(serde_json::Value::String(s)) => s.parse::<i64>().ok(),
                Some(serde_json::Value::Number(n)) => n.as_i64(),
                _ => None,
            };
            let close = parse_f64_field(c, "close");
            match (start_secs.and_then(|s| DateTime::from_timestamp(s, 0)), close) {
                (Some(ts), Some(close)) => out.push(HistoricalCandle { start: ts, close }),
                _ => {
                    // tolerate individual bad rows; a fully-bad payload still
                    // yields an empty window the caller can see
                    tracing::debug!("Skipping unparseable candle row for {}", product_id);
                }
            }
        }
        out.sort_by_key(|c| c.start);
        Ok(out)
    }

    async fn get_available_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let path = format!("{BROKERAGE}/accounts");
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![("limit", "250".to_string())];
            if let Some(c) = &cursor {
                query.push(("cursor", c.clone()));
            }
            let body = self
                .gate
                .run("get_accounts", || {
                    self.request(Method::GET, &path, &query, None)
                })
                .await?;

            if let Some(accounts) = body.get("accounts").and_then(|a| a.as_array()) {
                for acct in accounts {
                    let currency = acct.get("currency").and_then(|c| c.as_str());
                    if currency == Some(asset) {
                        let available = acct
                            .get("available_balance")
                            .and_then(|b| parse_f64_field(b, "value"))
                            .unwrap_or(0.0);
                        return Ok(available);
                    }
                }
            }

            cursor = body
                .get("cursor")
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
                .map(String::from);
            let has_next = body
                .get("has_next")
                .and_then(|h| h.as_bool())
                .unwrap_or(cursor.is_some());
            if !has_next || cursor.is_none() {
                return Ok(0.0);
            }
        }
    }

    async fn submit_limit_order(
        &self,
        params: &LimitOrderParams,
    ) -> Result<OrderAck, ExchangeError> {
        let path = format!("{BROKERAGE}/orders");
        let body = json!({
            "client_order_id": params.client_order_id,
            "product_id": params.product_id,
            "side": params.side.as_str(),
            "order_configuration": {
                "limit_limit_gtc": {
                    "base_size": params.base_size,
                    "limit_price": params.limit_price,
                    "post_only": params.post_only,
                }
            }
        });
        let resp = self
            .gate
            .run("submit_limit_order", || {
                self.request(Method::POST, &path, &[], Some(body.clone()))
            })
            .await?;
        Ok(judge_order_response(&resp))
    }

    async fn submit_market_order(
        &self,
        params: &MarketOrderParams,
    ) -> Result<OrderAck, ExchangeError> {
        let path = format!("{BROKERAGE}/orders");
        let mut ioc = serde_json::Map::new();
        if let Some(q) = &params.quote_size {
            ioc.insert("quote_size".to_string(), json!(q));
        }
        if let Some(b) = &params.base_size {
            ioc.insert("base_size".to_string(), json!(b));
        }
        let body = json!({
            "client_order_id": params.client_order_id,
            "product_id": params.product_id,
            "side": params.side.as_str(),
            "order_configuration": { "market_market_ioc": ioc }
        });
        let resp = self
            .gate
            .run("submit_market_order", || {
                self.request(Method::POST, &path, &[], Some(body.clone()))
            })
            .await?;
        Ok(judge_order_response(&resp))
    }

    async fn get_fills_by_order(&self, order_id: &str) -> Result<Vec<FillRecord>, ExchangeError> {
        let path = format!("{BROKERAGE}/orders/historical/fills");
        let query = [
            ("order_id", order_id.to_string()),
            ("limit", FILLS_PAGE_LIMIT.to_string()),
        ];
        let body = self
            .gate
            .run("get_fills_by_order", || {
                self.request(Method::GET, &path, &query, None)
            })
            .await?;
        let page: FillsPage = serde_json::from_value(body)
            .map_err(|e| ExchangeError::Malformed(format!("fills payload: {e}")))?;
        Ok(page.fills)
    }

    async fn get_fills_by_time(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<FillRecord>, ExchangeError> {
        let path = format!("{BROKERAGE}/orders/historical/fills");
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;

        for _page in 0..MAX_FILL_PAGES {
            let mut query = vec![
                ("start_sequence_timestamp", start.to_rfc3339()),
                ("end_sequence_timestamp", end.to_rfc3339()),
                ("limit", FILLS_PAGE_LIMIT.to_string()),
            ];
            if let Some(c) = &cursor {
                query.push(("cursor", c.clone()));
            }
            let query: Vec<(&str, String)> = query;

            let body = self
                .gate
                .run("get_fills_by_time", || {
                    self.request(Method::GET, &path, &query, None)
                })
                .await?;
            let page: FillsPage = serde_json::from_value(body)
                .map_err(|e| ExchangeError::Malformed(format!("fills payload: {e}")))?;

            all.extend(page.fills);
            cursor = page.cursor.filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
        }

        Ok(all)
    }
}

/// Apply the submission success judgment to a raw order response
///
/// Accepted iff the payload carries a success indicator or an order id and no
/// explicit error payload. Ambiguous/empty responses are failures.
pub fn judge_order_response(resp: &serde_json::Value) -> OrderAck {
    let error = resp
        .get("error_response")
        .filter(|e| !e.is_null())
        .map(|e| e.to_string())
        .or_else(|| {
            resp.get("error")
                .and_then(|e| e.as_str())
                .map(String::from)
        });

    let order_id = resp
        .get("success_response")
        .and_then(|s| s.get("order_id"))
        .and_then(|o| o.as_str())
        .or_else(|| resp.get("order_id").and_then(|o| o.as_str()))
        .map(String::from);

    let success_flag = resp.get("success").and_then(|s| s.as_bool());

    let accepted = error.is_none() && (success_flag == Some(true) || order_id.is_some());

    OrderAck {
        accepted,
        order_id,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_judge_success_with_order_id() {
        let resp = json!({
            "success": true,
            "success_response": { "order_id": "abc-123" }
        });
        let ack = judge_order_response(&resp);
        assert!(ack.accepted);
        assert_eq!(ack.order_id.as_deref(), Some("abc-123"));
    }

    #[test]
    fn test_judge_explicit_error_payload() {
        let resp = json!({
            "success": false,
            "error_response": { "error": "INSUFFICIENT_FUND" }
        });
        let ack = judge_order_response(&resp);
        assert!(!ack.accepted);
        assert!(ack.error.is_some());
    }

    #[test]
    fn test_judge_empty_response_is_failure() {
        let ack = judge_order_response(&json!({}));
        assert!(!ack.accepted);
        assert_eq!(ack.order_id, None);
    }

    #[test]
    fn test_judge_order_id_without_flag() {
        let ack = judge_order_response(&json!({ "order_id": "xyz" }));
        assert!(ack.accepted);
    }

    #[test]
    fn test_granularity_labels() {
        assert_eq!(granularity_label(300), "FIVE_MINUTE");
        assert_eq!(granularity_label(3600), "ONE_HOUR");
    }
}
