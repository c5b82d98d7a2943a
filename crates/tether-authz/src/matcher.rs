use crate::{Action, AuthzResult, PermissionPattern};

/// Glob match where `*` spans any run of characters, including `/` and `:`.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let pattern = pattern.as_bytes();
    let value = value.as_bytes();
    let (mut p, mut v) = (0usize, 0usize);
    // Last star seen in the pattern and the value position it was tried at.
    let mut backtrack: Option<(usize, usize)> = None;

    while v < value.len() {
        match pattern.get(p) {
            Some(b'*') => {
                backtrack = Some((p, v));
                p += 1;
            }
            Some(c) if *c == value[v] => {
                p += 1;
                v += 1;
            }
            _ => match backtrack {
                Some((star, tried)) => {
                    p = star + 1;
                    v = tried + 1;
                    backtrack = Some((star, tried + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == b'*')
}

/// Set of patterns granted to one principal.
#[derive(Debug, Clone, Default)]
pub struct PermissionMatcher {
    patterns: Vec<PermissionPattern>,
}

impl PermissionMatcher {
    pub fn new(patterns: Vec<PermissionPattern>) -> Self {
        Self { patterns }
    }

    pub fn from_strings(patterns: &[String]) -> AuthzResult<Self> {
        let parsed = patterns
            .iter()
            .map(|pattern| pattern.parse())
            .collect::<AuthzResult<Vec<_>>>()?;
        Ok(Self::new(parsed))
    }

    pub fn allows(&self, action: Action, resource: &str) -> bool {
        self.patterns.iter().any(|pattern| {
            pattern.action == action && wildcard_match(&pattern.resource_pattern, resource)
        })
    }

    pub fn patterns(&self) -> &[PermissionPattern] {
        &self.patterns
    }
}
