// Authorization boundary and the static per-user policy implementation.
use crate::{Action, AuthzError, AuthzResult, PermissionMatcher};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// `IsAuthorized(user, resource, action)`.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn is_authorized(&self, user_id: &str, resource: &str, action: Action)
    -> AuthzResult<bool>;
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    users: BTreeMap<String, Vec<String>>,
}

/// Static policy: each user id maps to a list of permission patterns.
///
/// ```
/// use tether_authz::{Action, PolicyAuthorizer};
///
/// let policy = PolicyAuthorizer::from_yaml_str(
///     "users:\n  u1:\n    - account.read:account:acme\n",
/// )
/// .expect("policy");
/// assert!(policy.allows("u1", "account:acme", Action::AccountRead));
/// assert!(!policy.allows("u2", "account:acme", Action::AccountRead));
/// ```
#[derive(Debug, Clone, Default)]
pub struct PolicyAuthorizer {
    users: HashMap<String, PermissionMatcher>,
}

impl PolicyAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, user_id: impl Into<String>, matcher: PermissionMatcher) -> Self {
        self.users.insert(user_id.into(), matcher);
        self
    }

    pub fn from_yaml_str(raw: &str) -> AuthzResult<Self> {
        let file: PolicyFile = serde_yaml::from_str(raw)?;
        let mut users = HashMap::with_capacity(file.users.len());
        for (user, patterns) in file.users {
            users.insert(user, PermissionMatcher::from_strings(&patterns)?);
        }
        Ok(Self { users })
    }

    pub fn load(path: &Path) -> AuthzResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| AuthzError::PolicyIo {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn allows(&self, user_id: &str, resource: &str, action: Action) -> bool {
        self.users
            .get(user_id)
            .is_some_and(|matcher| matcher.allows(action, resource))
    }
}

#[async_trait]
impl Authorizer for PolicyAuthorizer {
    async fn is_authorized(
        &self,
        user_id: &str,
        resource: &str,
        action: Action,
    ) -> AuthzResult<bool> {
        Ok(self.allows(user_id, resource, action))
    }
}
