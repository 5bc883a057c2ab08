//! HTTP access to the MineGlance API: pool statistics, release metadata,
//! artifact downloads, heartbeat and subscription.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::WalletConfig;
use crate::download::{download_file, ProgressFn};
use crate::error::{AppError, Result};
use crate::platform::Platform;

/// Point-in-time statistics for one wallet.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletStats {
    pub wallet_id: String,
    pub hashrate: f64,
    pub hashrate_unit: String,
    pub workers_online: u32,
    pub workers_offline: u32,
    pub balance: f64,
    pub daily_revenue: f64,
    pub daily_profit: f64,
    pub coin_price: f64,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseInfo {
    pub version: String,
    pub download_url: Option<String>,
    pub release_notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub plan: Option<String>,
    pub billing_type: Option<String>,
    pub subscription_end_date: Option<String>,
}

#[async_trait]
pub trait StatsGateway: Send + Sync {
    async fn fetch_wallet_stats(&self, wallet: &WalletConfig) -> Result<WalletStats>;
}

#[async_trait]
pub trait ReleaseGateway: Send + Sync {
    /// `Ok(None)` means the endpoint has no release info for the platform.
    async fn fetch_latest_release(&self, platform: Platform) -> Result<Option<ReleaseInfo>>;

    async fn download_artifact(
        &self,
        url: &str,
        dest: &Path,
        on_progress: ProgressFn<'_>,
    ) -> Result<u64>;
}

#[async_trait]
pub trait AccountGateway: Send + Sync {
    async fn send_heartbeat(&self, token: &str, install_id: &str, version: &str) -> Result<()>;
    async fn fetch_subscription(&self, token: &str) -> Result<SubscriptionInfo>;
}

pub struct HttpGateway {
    client: Client,
    api_base: String,
    request_timeout: Duration,
}

impl HttpGateway {
    pub fn new(client: Client, api_base: &str) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Timeout for JSON API calls. Artifact downloads are not bound by it.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }
}

#[async_trait]
impl StatsGateway for HttpGateway {
    async fn fetch_wallet_stats(&self, wallet: &WalletConfig) -> Result<WalletStats> {
        let url = self.url("/api/pool-stats");
        let mut body = json!({
            "pool": wallet.pool,
            "coin": wallet.coin,
            "address": wallet.address,
            "power": wallet.power.unwrap_or(0.0),
        });
        if let Some(token) = wallet.api_token.as_deref().filter(|t| !t.is_empty()) {
            body["apiToken"] = Value::String(token.to_string());
        }

        let resp = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(AppError::from)?;

        if !resp.status().is_success() {
            return Err(AppError::network_with_url(
                &url,
                format!("pool-stats returned status {}", resp.status()),
            ));
        }

        let value = resp.json::<Value>().await.map_err(AppError::from)?;
        Ok(parse_wallet_stats(&wallet.id, &value))
    }
}

#[async_trait]
impl ReleaseGateway for HttpGateway {
    async fn fetch_latest_release(&self, platform: Platform) -> Result<Option<ReleaseInfo>> {
        let url = format!("{}?platform={}", self.url("/api/software/latest"), platform.id());
        let resp = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(AppError::from)?;

        if !resp.status().is_success() {
            return Err(AppError::network_with_url(
                &url,
                format!("release endpoint returned status {}", resp.status()),
            ));
        }

        let value = resp.json::<Value>().await.map_err(AppError::from)?;
        Ok(parse_release(&value))
    }

    async fn download_artifact(
        &self,
        url: &str,
        dest: &Path,
        on_progress: ProgressFn<'_>,
    ) -> Result<u64> {
        download_file(&self.client, url, dest, on_progress).await
    }
}

#[async_trait]
impl AccountGateway for HttpGateway {
    async fn send_heartbeat(&self, token: &str, install_id: &str, version: &str) -> Result<()> {
        let url = self.url("/api/instances");
        let resp = self
            .client
            .put(&url)
            .timeout(self.request_timeout)
            .bearer_auth(token)
            .json(&json!({ "instanceId": install_id, "version": version }))
            .send()
            .await
            .map_err(AppError::from)?;

        if !resp.status().is_success() {
            return Err(AppError::network_with_url(
                &url,
                format!("heartbeat returned status {}", resp.status()),
            ));
        }
        Ok(())
    }

    async fn fetch_subscription(&self, token: &str) -> Result<SubscriptionInfo> {
        let url = self.url("/api/dashboard/subscription");
        let resp = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .bearer_auth(token)
            .send()
            .await
            .map_err(AppError::from)?;

        if !resp.status().is_success() {
            return Err(AppError::network_with_url(
                &url,
                format!("subscription returned status {}", resp.status()),
            ));
        }

        let value = resp.json::<Value>().await.map_err(AppError::from)?;
        Ok(parse_subscription(&value))
    }
}

/// Read a non-negative count; anything missing or malformed is `0`.
fn count_field(value: &Value, key: &str) -> u32 {
    match value.get(key) {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f > 0.0).map(|f| f as u64))
            .map(|v| v.min(u64::from(u32::MAX)) as u32)
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse::<u32>().unwrap_or(0),
        _ => 0,
    }
}

fn number_field(value: &Value, key: &str) -> f64 {
    match value.get(key) {
        Some(Value::Number(n)) => n.as_f64().filter(|f| f.is_finite()).unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()).unwrap_or(0.0),
        _ => 0.0,
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Build stats from a best-effort JSON body.
pub fn parse_wallet_stats(wallet_id: &str, value: &Value) -> WalletStats {
    WalletStats {
        wallet_id: wallet_id.to_string(),
        hashrate: number_field(value, "hashrate"),
        hashrate_unit: string_field(value, "hashrateUnit").unwrap_or_else(|| "MH/s".to_string()),
        workers_online: count_field(value, "workersOnline"),
        workers_offline: count_field(value, "workersOffline"),
        balance: number_field(value, "balance"),
        daily_revenue: number_field(value, "dailyRevenue"),
        daily_profit: number_field(value, "dailyProfit"),
        coin_price: number_field(value, "coinPrice"),
        fetched_at: Utc::now(),
    }
}

pub fn parse_release(value: &Value) -> Option<ReleaseInfo> {
    let version = string_field(value, "version")?;
    let release_notes = match value.get("releaseNotes") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => {
            s.lines().map(str::to_string).filter(|l| !l.trim().is_empty()).collect()
        }
        _ => Vec::new(),
    };

    Some(ReleaseInfo {
        version,
        download_url: string_field(value, "downloadUrl"),
        release_notes,
    })
}

pub fn parse_subscription(value: &Value) -> SubscriptionInfo {
    let inner = value.get("subscription").unwrap_or(value);
    SubscriptionInfo {
        plan: string_field(inner, "plan"),
        billing_type: string_field(inner, "billingType"),
        subscription_end_date: string_field(inner, "subscriptionEndDate"),
    }
}
