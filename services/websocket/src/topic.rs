//! Client topic grammar for resource-update subscriptions.
//!
//! A topic is a dot-separated list of `key:value` or bare `key` tokens, for
//! example `account:acme.project:proj1`. It expands left to right into a
//! fan-out subject under `res-updates`, with `*` standing in for any token
//! without a value. `account` is mandatory; `project`, when present, selects
//! the project-scoped permission check.
use tether_common::names::{AccountName, ProjectName};
use tether_wire::subject::FanoutSubject;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic is empty")]
    Empty,
    #[error("topic token {0:?} has no key")]
    EmptyKey(String),
    #[error("topic must name an account")]
    MissingAccount,
    #[error("topic names {0} more than once")]
    Repeated(String),
    #[error("invalid {key} in topic: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Parsed topic: the broker subject plus the tenant names used for authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub subject: String,
    pub account: AccountName,
    pub project: Option<ProjectName>,
}

impl Topic {
    pub fn parse(raw: &str) -> Result<Self, TopicError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TopicError::Empty);
        }
        let mut subject = FanoutSubject::new();
        let mut account = None;
        let mut project = None;
        for token in raw.split('.') {
            let (key, value) = match token.split_once(':') {
                Some((key, value)) => (key, Some(value)),
                None => (token, None),
            };
            if key.is_empty() {
                return Err(TopicError::EmptyKey(token.to_string()));
            }
            let value = value.filter(|value| !value.is_empty() && *value != "*");
            match key {
                "account" => {
                    if account.is_some() {
                        return Err(TopicError::Repeated(key.to_string()));
                    }
                    let value = value.ok_or(TopicError::MissingAccount)?;
                    account = Some(AccountName::new(value).map_err(|_| {
                        TopicError::InvalidValue {
                            key: "account",
                            value: value.to_string(),
                        }
                    })?);
                }
                "project" => {
                    if project.is_some() {
                        return Err(TopicError::Repeated(key.to_string()));
                    }
                    if let Some(value) = value {
                        project = Some(ProjectName::new(value).map_err(|_| {
                            TopicError::InvalidValue {
                                key: "project",
                                value: value.to_string(),
                            }
                        })?);
                    }
                }
                _ => {}
            }
            subject = subject.with(key, value);
        }
        let account = account.ok_or(TopicError::MissingAccount)?;
        Ok(Self {
            subject: subject.build(),
            account,
            project,
        })
    }
}
