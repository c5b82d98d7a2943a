//! Permission patterns granted to users.
//!
//! A pattern is `action:resource`, where the resource part may contain `*`
//! globs, e.g. `project.read:project:acme/*`.
use crate::{Action, AuthzError, AuthzResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PermissionPattern {
    pub action: Action,
    pub resource_pattern: String,
}

impl PermissionPattern {
    pub fn new(action: Action, resource_pattern: impl Into<String>) -> Self {
        Self {
            action,
            resource_pattern: resource_pattern.into(),
        }
    }

    pub fn parse(value: &str) -> AuthzResult<Self> {
        value.parse()
    }
}

impl std::str::FromStr for PermissionPattern {
    type Err = AuthzError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        // Resources contain colons too; only the first one separates the action.
        let (action, resource) = value
            .split_once(':')
            .ok_or_else(|| AuthzError::InvalidPermission(value.to_string()))?;
        let action = action
            .parse::<Action>()
            .map_err(|_| AuthzError::InvalidAction(action.to_string()))?;
        if resource.is_empty() {
            return Err(AuthzError::InvalidPermission(value.to_string()));
        }
        Ok(Self::new(action, resource))
    }
}

impl std::fmt::Display for PermissionPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.action, self.resource_pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keeps_colons_in_resource() {
        let parsed = PermissionPattern::parse("project.read:project:acme/*").expect("parse");
        assert_eq!(parsed.action, Action::ProjectRead);
        assert_eq!(parsed.resource_pattern, "project:acme/*");
        assert_eq!(parsed.to_string(), "project.read:project:acme/*");
    }

    #[test]
    fn parse_rejects_missing_resource_and_unknown_action() {
        assert!(matches!(
            PermissionPattern::parse("account.read"),
            Err(AuthzError::InvalidPermission(_))
        ));
        assert!(matches!(
            PermissionPattern::parse("account.read:"),
            Err(AuthzError::InvalidPermission(_))
        ));
        assert!(matches!(
            PermissionPattern::parse("account.delete:account:acme"),
            Err(AuthzError::InvalidAction(_))
        ));
    }
}
