// Shared names, consumer naming, and ordering guards used across crates.
pub mod guard;
pub mod lifecycle;

pub use guard::{Admission, StalenessGuard, StaleVersion, VersionGate};
pub use lifecycle::Lifecycle;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid {kind}: {value:?}")]
    InvalidName { kind: &'static str, value: String },
    #[error("config error: {0}")]
    Config(String),
}

pub mod names {
    // Strongly typed routing names so account and cluster never get swapped.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;

    // Names end up as single broker subject tokens, so separators and
    // wildcards are rejected up front.
    fn validate(kind: &'static str, value: &str) -> Result<()> {
        let bad = value.is_empty()
            || value
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>'));
        if bad {
            return Err(Error::InvalidName {
                kind,
                value: value.to_string(),
            });
        }
        Ok(())
    }

    macro_rules! name_type {
        ($name:ident, $kind:literal) => {
            #[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            #[serde(try_from = "String", into = "String")]
            pub struct $name(String);

            impl $name {
                pub fn new(value: impl Into<String>) -> Result<Self> {
                    let value = value.into();
                    validate($kind, &value)?;
                    Ok(Self(value))
                }

                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    Self::new(input)
                }
            }

            impl TryFrom<String> for $name {
                type Error = Error;

                fn try_from(value: String) -> Result<Self> {
                    Self::new(value)
                }
            }

            impl From<$name> for String {
                fn from(value: $name) -> String {
                    value.0
                }
            }

            impl AsRef<str> for $name {
                fn as_ref(&self) -> &str {
                    &self.0
                }
            }
        };
    }

    name_type!(AccountName, "account name");
    name_type!(ClusterName, "cluster name");
    name_type!(ProjectName, "project name");
    name_type!(EnvironmentName, "environment name");
}

/// Durable consumer name derived from `(service, feature)`.
///
/// The same inputs always produce the same name, so a restarted process
/// re-attaches to its consumer group instead of creating a new one.
///
/// ```
/// use tether_common::DurableName;
///
/// let name = DurableName::new("console", "resource-updates").expect("name");
/// assert_eq!(name.as_str(), "console:resource-updates");
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DurableName {
    value: String,
}

impl DurableName {
    pub fn new(service: &str, feature: &str) -> Result<Self> {
        for (kind, part) in [("service", service), ("feature", feature)] {
            let bad = part.is_empty()
                || part
                    .chars()
                    .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>' | ':' | '/'));
            if bad {
                return Err(Error::InvalidName {
                    kind,
                    value: part.to_string(),
                });
            }
        }
        Ok(Self {
            value: format!("{service}:{feature}"),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Display for DurableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.value)
    }
}
