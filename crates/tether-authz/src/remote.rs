// IAM service client.
use crate::{Action, AuthzError, AuthzResult, Authorizer};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeRequest<'a> {
    user_id: &'a str,
    resource: &'a str,
    action: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthorizeResponse {
    allowed: bool,
}

/// Asks the IAM service `POST {base}/v1/authorize` for every check.
#[derive(Debug, Clone)]
pub struct RemoteAuthorizer {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteAuthorizer {
    pub fn new(base_url: &str) -> AuthzResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/v1/authorize", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl Authorizer for RemoteAuthorizer {
    async fn is_authorized(
        &self,
        user_id: &str,
        resource: &str,
        action: Action,
    ) -> AuthzResult<bool> {
        let request = AuthorizeRequest {
            user_id,
            resource,
            action: action.as_str(),
        };
        let response = self.client.post(&self.endpoint).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%status, user_id, resource, %action, "iam check failed");
            return Err(AuthzError::RemoteStatus(status.as_u16()));
        }
        let body: AuthorizeResponse = response.json().await?;
        Ok(body.allowed)
    }
}
