// Subject pattern matching: `*` matches one token, a trailing `>` matches one or more.
use crate::{BusError, Result};

pub fn validate_subject(subject: &str) -> Result<()> {
    if subject.is_empty() || subject.split('.').any(|token| token.is_empty()) {
        return Err(BusError::InvalidSubject(subject.to_string()));
    }
    if subject.chars().any(|c| c.is_whitespace() || matches!(c, '*' | '>')) {
        return Err(BusError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(BusError::InvalidSubject(pattern.to_string()));
    }
    let tokens: Vec<&str> = pattern.split('.').collect();
    for (idx, token) in tokens.iter().enumerate() {
        let bad = token.is_empty()
            || token.chars().any(char::is_whitespace)
            || (*token == ">" && idx + 1 != tokens.len())
            || (token.len() > 1 && token.contains(['*', '>']));
        if bad {
            return Err(BusError::InvalidSubject(pattern.to_string()));
        }
    }
    Ok(())
}

/// ```
/// use tether_broker::subject::matches;
///
/// assert!(matches("res-updates.account.*.cluster.>", "res-updates.account.acme.cluster.c1.app.web"));
/// assert!(!matches("res-updates.account.*", "res-updates.account.acme.cluster"));
/// ```
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    for token in pattern.split('.') {
        match token {
            ">" => return subject_tokens.next().is_some(),
            "*" => {
                if subject_tokens.next().is_none() {
                    return false;
                }
            }
            literal => {
                if subject_tokens.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    subject_tokens.next().is_none()
}
