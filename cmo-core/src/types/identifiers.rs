use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// What kind of addressable endpoint an [`AgentId`] names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentIdKind {
    /// A worker or orchestrator agent.
    Agent,
    /// A topic endpoint, used when a message is addressed at a channel.
    Topic,
    /// An infrastructure service (registry, checkpointer, ...).
    Service,
}

impl fmt::Display for AgentIdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentIdKind::Agent => write!(f, "agent"),
            AgentIdKind::Topic => write!(f, "topic"),
            AgentIdKind::Service => write!(f, "service"),
        }
    }
}

/// Identity of a message producer or recipient.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId {
    /// Lowercase alphanumeric identifier with hyphens/underscores.
    pub id: String,
    /// Endpoint kind.
    #[serde(rename = "type")]
    pub kind: AgentIdKind,
}

/// True iff `s` is non-empty and drawn from `[a-z0-9_-]`.
///
/// Tenant and project identifiers share this charset with agent ids.
pub fn is_valid_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

impl AgentId {
    /// An agent endpoint.
    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: AgentIdKind::Agent,
        }
    }

    /// A topic endpoint.
    pub fn topic(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: AgentIdKind::Topic,
        }
    }

    /// A service endpoint.
    pub fn service(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: AgentIdKind::Service,
        }
    }

    /// Validate the identifier charset, reporting `path` on failure.
    pub fn validate(&self, path: &str) -> Result<(), ValidationError> {
        if is_valid_identifier(&self.id) {
            Ok(())
        } else {
            Err(ValidationError::at(
                format!("{path}.id"),
                "must be non-empty [a-z0-9_-]+",
            ))
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_charset() {
        assert!(is_valid_identifier("specialist-sel_2"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("Planner"));
        assert!(!is_valid_identifier("qa.tenant"));
    }

    #[test]
    fn serde_uses_type_field() {
        let id = AgentId::agent("planner");
        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(json["type"], "agent");
        let back: AgentId = serde_json::from_value(json).unwrap();
        assert_eq!(back, id);
    }
}
