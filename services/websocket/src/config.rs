use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";
const DEFAULT_LOGS_STREAM: &str = "logs";

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

/// Where subscription checks are answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthzSource {
    /// IAM service base URL.
    Remote(String),
    /// Static user-permission policy file.
    Policy(PathBuf),
}

// WebSocket server configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    // Client-facing listener (`/ws`).
    pub bind: SocketAddr,
    // Metrics and health HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    pub broker: BrokerKind,
    pub nats_url: String,
    // Stream retaining agent logs for replay subscriptions.
    pub logs_stream: String,
    pub authz: AuthzSource,
}

#[derive(Debug, Default, Deserialize)]
struct WebSocketConfigOverride {
    bind: Option<String>,
    metrics_bind: Option<String>,
    broker: Option<String>,
    nats_url: Option<String>,
    logs_stream: Option<String>,
    iam_url: Option<String>,
    policy: Option<String>,
}

impl WebSocketConfig {
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let override_cfg = match std::env::var("TETHER_WS_CONFIG") {
            Ok(path) => {
                let contents = fs::read_to_string(&path)
                    .with_context(|| format!("read TETHER_WS_CONFIG: {path}"))?;
                let parsed: WebSocketConfigOverride = serde_yaml::from_str(&contents)
                    .with_context(|| "parse websocket config yaml")?;
                Some(parsed)
            }
            Err(_) => None,
        };
        Self::load(override_cfg)
    }

    fn load(override_cfg: Option<WebSocketConfigOverride>) -> Result<Self> {
        let override_cfg = override_cfg.unwrap_or_default();
        let bind = override_cfg
            .bind
            .or_else(|| std::env::var("TETHER_WS_BIND").ok())
            .unwrap_or_else(|| "0.0.0.0:8090".to_string())
            .parse()
            .with_context(|| "parse bind address")?;
        let metrics_bind = override_cfg
            .metrics_bind
            .or_else(|| std::env::var("TETHER_WS_METRICS_BIND").ok())
            .unwrap_or_else(|| "0.0.0.0:8091".to_string())
            .parse()
            .with_context(|| "parse metrics bind address")?;
        let broker = override_cfg
            .broker
            .or_else(|| std::env::var("TETHER_BROKER").ok())
            .unwrap_or_else(|| "memory".to_string())
            .parse()
            .with_context(|| "parse broker")?;
        let nats_url = override_cfg
            .nats_url
            .or_else(|| std::env::var("TETHER_NATS_URL").ok())
            .unwrap_or_else(|| DEFAULT_NATS_URL.to_string());
        let logs_stream = override_cfg
            .logs_stream
            .or_else(|| std::env::var("TETHER_LOGS_STREAM").ok())
            .unwrap_or_else(|| DEFAULT_LOGS_STREAM.to_string());
        // A file that names an authorizer replaces the environment's choice.
        let authz = if override_cfg.iam_url.is_some() || override_cfg.policy.is_some() {
            authz_source(override_cfg.iam_url, override_cfg.policy)?
        } else {
            authz_source(
                std::env::var("TETHER_IAM_URL").ok(),
                std::env::var("TETHER_WS_POLICY").ok(),
            )?
        };
        Ok(Self {
            bind,
            metrics_bind,
            broker,
            nats_url,
            logs_stream,
            authz,
        })
    }
}

fn authz_source(iam_url: Option<String>, policy: Option<String>) -> Result<AuthzSource> {
    match (iam_url, policy) {
        (Some(_), Some(_)) => bail!("set only one of TETHER_IAM_URL and TETHER_WS_POLICY"),
        (Some(url), None) => Ok(AuthzSource::Remote(url)),
        (None, Some(path)) => Ok(AuthzSource::Policy(PathBuf::from(path))),
        (None, None) => bail!("no authorizer configured; set TETHER_IAM_URL or TETHER_WS_POLICY"),
    }
}
