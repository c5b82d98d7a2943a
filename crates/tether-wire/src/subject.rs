//! Broker subject grammar.
//!
//! Every subject is a dot-separated token list. Command, update and error
//! subjects carry `account.<a>.cluster.<c>` so one tenant cluster maps to one
//! dedicated subject; fan-out subjects are built left to right under
//! `res-updates`.
use tether_common::names::{AccountName, ClusterName, EnvironmentName};

pub const AGENT_COMMANDS: &str = "agent-commands";
pub const RESOURCE_UPDATES: &str = "resource-updates";
pub const ERRORS_ON_APPLY: &str = "errors-on-apply";
pub const LOGS: &str = "logs";
pub const RES_UPDATES: &str = "res-updates";

pub fn agent_commands(account: &AccountName, cluster: &ClusterName) -> String {
    format!("{AGENT_COMMANDS}.account.{account}.cluster.{cluster}")
}

pub fn resource_updates(account: &AccountName, cluster: &ClusterName) -> String {
    format!("{RESOURCE_UPDATES}.account.{account}.cluster.{cluster}")
}

pub fn errors_on_apply(account: &AccountName, cluster: &ClusterName) -> String {
    format!("{ERRORS_ON_APPLY}.account.{account}.cluster.{cluster}")
}

pub fn logs(account: &AccountName, cluster: &ClusterName, tracking_id: &str) -> String {
    format!(
        "{LOGS}.account.{account}.cluster.{cluster}.tracking.{}",
        token(tracking_id)
    )
}

/// Filter matching every subject under `root`.
pub fn all_under(root: &str) -> String {
    format!("{root}.>")
}

/// Left-to-right builder for `res-updates.…` fan-out subjects.
///
/// ```
/// use tether_wire::subject::FanoutSubject;
///
/// let subject = FanoutSubject::new()
///     .with("account", Some("acme"))
///     .with("cluster", None)
///     .build();
/// assert_eq!(subject, "res-updates.account.acme.cluster.*");
/// ```
#[derive(Debug, Clone)]
pub struct FanoutSubject {
    tokens: Vec<String>,
}

impl Default for FanoutSubject {
    fn default() -> Self {
        Self::new()
    }
}

impl FanoutSubject {
    pub fn new() -> Self {
        Self {
            tokens: vec![RES_UPDATES.to_string()],
        }
    }

    /// Append `key.value`, or `key.*` when there is no value.
    pub fn with(mut self, key: &str, value: Option<&str>) -> Self {
        self.tokens.push(token(key));
        self.tokens.push(value.map(token).unwrap_or_else(|| "*".to_string()));
        self
    }

    pub fn build(self) -> String {
        self.tokens.join(".")
    }
}

/// Change notification subject for a cluster-scoped resource.
pub fn cluster_change(
    account: &AccountName,
    cluster: &ClusterName,
    kind_and_name: Option<(&str, &str)>,
) -> String {
    let subject = FanoutSubject::new()
        .with("account", Some(account.as_str()))
        .with("cluster", Some(cluster.as_str()));
    match kind_and_name {
        Some((kind, name)) => subject.with(&kind.to_ascii_lowercase(), Some(name)).build(),
        None => subject.build(),
    }
}

/// Change notification subject for an environment-scoped resource.
pub fn environment_change(
    account: &AccountName,
    environment: &EnvironmentName,
    kind: &str,
    name: &str,
) -> String {
    FanoutSubject::new()
        .with("account", Some(account.as_str()))
        .with("environment", Some(environment.as_str()))
        .with(&kind.to_ascii_lowercase(), Some(name))
        .build()
}

// Object names may legally contain dots; they must not split a token.
fn token(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}
