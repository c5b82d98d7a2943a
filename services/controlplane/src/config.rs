use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SERVICE_NAME: &str = "console";
const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";
const DEFAULT_UPDATES_STREAM: &str = "resource-updates";
const DEFAULT_ERRORS_STREAM: &str = "errors-on-apply";
const DEFAULT_ACK_WAIT_MS: u64 = 30_000;
const DEFAULT_REDELIVER_AFTER_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Memory,
    Nats,
}

impl FromStr for BrokerKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BrokerKind::Memory),
            "nats" => Ok(BrokerKind::Nats),
            other => bail!("unknown broker {other:?}; expected memory or nats"),
        }
    }
}

// Control plane configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    // Metrics and health HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    pub broker: BrokerKind,
    pub nats_url: String,
    // First half of every durable consumer name ("<service>:<feature>").
    pub service_name: String,
    // Stream capturing observed-state updates from agents.
    pub updates_stream: String,
    // Stream capturing apply failures reported by agents.
    pub errors_stream: String,
    pub ack_wait: Duration,
    // Delay before a failed delivery is retried.
    pub redeliver_after: Duration,
    // Delivery attempts before a message is given up on; unset retries forever.
    pub max_deliver: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ControlPlaneConfigOverride {
    metrics_bind: Option<String>,
    broker: Option<String>,
    nats_url: Option<String>,
    service_name: Option<String>,
    updates_stream: Option<String>,
    errors_stream: Option<String>,
    ack_wait_ms: Option<u64>,
    redeliver_after_ms: Option<u64>,
    max_deliver: Option<u64>,
}

impl ControlPlaneConfig {
    pub fn from_env() -> Result<Self> {
        let metrics_bind = std::env::var("TETHER_CP_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse TETHER_CP_METRICS_BIND")?;
        let broker = std::env::var("TETHER_BROKER")
            .unwrap_or_else(|_| "memory".to_string())
            .parse()
            .with_context(|| "parse TETHER_BROKER")?;
        let nats_url =
            std::env::var("TETHER_NATS_URL").unwrap_or_else(|_| DEFAULT_NATS_URL.to_string());
        let service_name = std::env::var("TETHER_SERVICE_NAME")
            .unwrap_or_else(|_| DEFAULT_SERVICE_NAME.to_string());
        let updates_stream = std::env::var("TETHER_UPDATES_STREAM")
            .unwrap_or_else(|_| DEFAULT_UPDATES_STREAM.to_string());
        let errors_stream = std::env::var("TETHER_ERRORS_STREAM")
            .unwrap_or_else(|_| DEFAULT_ERRORS_STREAM.to_string());
        let ack_wait_ms = std::env::var("TETHER_ACK_WAIT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_ACK_WAIT_MS);
        let redeliver_after_ms = std::env::var("TETHER_REDELIVER_AFTER_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_REDELIVER_AFTER_MS);
        let max_deliver = std::env::var("TETHER_MAX_DELIVER")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0);
        Ok(Self {
            metrics_bind,
            broker,
            nats_url,
            service_name,
            updates_stream,
            errors_stream,
            ack_wait: Duration::from_millis(ack_wait_ms),
            redeliver_after: Duration::from_millis(redeliver_after_ms),
            max_deliver,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("TETHER_CP_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read TETHER_CP_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: ControlPlaneConfigOverride = serde_yaml::from_str(contents)
            .with_context(|| "parse control plane config yaml")?;
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.broker {
            self.broker = value.parse().with_context(|| "parse broker")?;
        }
        if let Some(value) = override_cfg.nats_url {
            self.nats_url = value;
        }
        if let Some(value) = override_cfg.service_name {
            self.service_name = value;
        }
        if let Some(value) = override_cfg.updates_stream {
            self.updates_stream = value;
        }
        if let Some(value) = override_cfg.errors_stream {
            self.errors_stream = value;
        }
        if let Some(value) = override_cfg.ack_wait_ms
            && value > 0
        {
            self.ack_wait = Duration::from_millis(value);
        }
        if let Some(value) = override_cfg.redeliver_after_ms
            && value > 0
        {
            self.redeliver_after = Duration::from_millis(value);
        }
        if let Some(value) = override_cfg.max_deliver {
            self.max_deliver = (value > 0).then_some(value);
        }
        Ok(())
    }
}
