//! Topic validation, wildcard matching and well-known topic names
//!
//! Topics are `/`-separated levels. Subscription filters may use `+` for
//! exactly one level and `#` for zero or more trailing levels (final level
//! only). Published topic names never contain wildcards.

use thiserror::Error;

/// Topic validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic '{0}' contains a NUL character")]
    NulCharacter(String),
    #[error("Wildcards are not allowed in topic names: '{0}'")]
    WildcardInName(String),
    #[error("'#' must be the whole final level of a filter: '{0}'")]
    MisplacedMultiLevel(String),
    #[error("'+' must occupy a whole level of a filter: '{0}'")]
    MisplacedSingleLevel(String),
}

/// Validate a subscription filter
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::Empty);
    }
    if filter.contains('\0') {
        return Err(TopicError::NulCharacter(filter.to_string()));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != last) {
            return Err(TopicError::MisplacedMultiLevel(filter.to_string()));
        }
        if level.contains('+') && *level != "+" {
            return Err(TopicError::MisplacedSingleLevel(filter.to_string()));
        }
    }
    Ok(())
}

/// Validate a concrete topic name used for publishing
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter(topic.to_string()));
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(TopicError::WildcardInName(topic.to_string()));
    }
    Ok(())
}

/// Whether `topic` matches the subscription `filter`
///
/// `a/#` matches `a` itself as well as every descendant.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if filter == topic {
        return true;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Conventional system topic construction
pub struct TopicBuilder;

impl TopicBuilder {
    /// Retained lifecycle status: `system/health/{client_id}`
    pub fn health_topic(client_id: &str) -> String {
        format!("system/health/{client_id}")
    }

    /// Periodic liveness broadcast: `system/keepalive/{client_id}`
    pub fn keepalive_topic(client_id: &str) -> String {
        format!("system/keepalive/{client_id}")
    }
}
