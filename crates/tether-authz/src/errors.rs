use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("invalid action: {0}")]
    InvalidAction(String),
    #[error("invalid permission: {0}")]
    InvalidPermission(String),
    #[error("invalid policy file")]
    Policy(#[from] serde_yaml::Error),
    #[error("failed to read policy file {path}")]
    PolicyIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("iam request failed")]
    Remote(#[from] reqwest::Error),
    #[error("iam returned status {0}")]
    RemoteStatus(u16),
}

pub type AuthzResult<T> = Result<T, AuthzError>;
