use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{is_valid_identifier, ValidationError};

/// Leading segment of every CMO topic.
pub const TOPIC_PREFIX: &str = "qa";
/// Suffix marking a dead-letter stream.
pub const DLQ_SUFFIX: &str = ".dlq";
/// Single-segment wildcard in topic patterns.
pub const WILDCARD: &str = "*";

/// A validated hierarchical topic name,
/// `qa.<tenant>.<project>.<domain>[.<entity>][.<verb>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// The topic string.
    pub fn name(&self) -> &str {
        &self.0
    }

    /// The dead-letter stream paired with this topic.
    pub fn dlq(&self) -> Topic {
        Topic(format!("{}{}", self.0, DLQ_SUFFIX))
    }

    /// Whether this topic is itself a dead-letter stream.
    pub fn is_dlq(&self) -> bool {
        self.0.ends_with(DLQ_SUFFIX)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The components a topic is built from. `build_topic` and `parse_topic`
/// are inverses over this struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicComponents {
    /// Tenant scope, `[a-z0-9_-]+`.
    pub tenant: String,
    /// Project scope, `[a-z0-9_-]+`.
    pub project: String,
    /// Functional domain, e.g. `cmo`, `specialist`, `registry`.
    pub domain: String,
    /// Optional entity within the domain.
    pub entity: Option<String>,
    /// Optional verb on the entity.
    pub verb: Option<String>,
}

impl TopicComponents {
    /// Components with only the mandatory segments.
    pub fn new(
        tenant: impl Into<String>,
        project: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            project: project.into(),
            domain: domain.into(),
            entity: None,
            verb: None,
        }
    }

    /// Add an entity segment.
    pub fn entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    /// Add a verb segment.
    pub fn verb(mut self, verb: impl Into<String>) -> Self {
        self.verb = Some(verb.into());
        self
    }
}

fn check_segment(topic: &str, segment: &str) -> Result<(), ValidationError> {
    if is_valid_identifier(segment) {
        Ok(())
    } else {
        Err(ValidationError::InvalidTopic {
            topic: topic.to_string(),
            problem: format!("segment `{segment}` must be [a-z0-9_-]+"),
        })
    }
}

/// Build a topic from components, validating every segment.
pub fn build_topic(components: &TopicComponents) -> Result<Topic, ValidationError> {
    let mut segments = vec![
        TOPIC_PREFIX.to_string(),
        components.tenant.clone(),
        components.project.clone(),
        components.domain.clone(),
    ];
    if let Some(entity) = &components.entity {
        segments.push(entity.clone());
    }
    if let Some(verb) = &components.verb {
        if components.entity.is_none() {
            return Err(ValidationError::InvalidTopic {
                topic: verb.clone(),
                problem: "verb requires an entity segment".to_string(),
            });
        }
        segments.push(verb.clone());
    }
    let name = segments.join(".");
    for segment in &segments[1..] {
        check_segment(&name, segment)?;
    }
    Ok(Topic(name))
}

/// Parse a topic string back into its components.
pub fn parse_topic(topic: &str) -> Result<TopicComponents, ValidationError> {
    let bare = topic.strip_suffix(DLQ_SUFFIX).unwrap_or(topic);
    let segments: Vec<&str> = bare.split('.').collect();
    if segments.len() < 4 || segments.len() > 6 {
        return Err(ValidationError::InvalidTopic {
            topic: topic.to_string(),
            problem: format!("expected 4-6 segments, found {}", segments.len()),
        });
    }
    if segments[0] != TOPIC_PREFIX {
        return Err(ValidationError::InvalidTopic {
            topic: topic.to_string(),
            problem: format!("must start with `{TOPIC_PREFIX}`"),
        });
    }
    for segment in &segments[1..] {
        check_segment(topic, segment)?;
    }
    Ok(TopicComponents {
        tenant: segments[1].to_string(),
        project: segments[2].to_string(),
        domain: segments[3].to_string(),
        entity: segments.get(4).map(|s| s.to_string()),
        verb: segments.get(5).map(|s| s.to_string()),
    })
}

/// Match a concrete topic against a pattern. `*` matches exactly one
/// segment; every other segment must match literally.
///
/// Matching is reflexive: `matches_topic(t, t)` is always true.
pub fn matches_topic(topic: &str, pattern: &str) -> bool {
    let topic_segments: Vec<&str> = topic.split('.').collect();
    let pattern_segments: Vec<&str> = pattern.split('.').collect();
    if topic_segments.len() != pattern_segments.len() {
        return false;
    }
    topic_segments
        .iter()
        .zip(pattern_segments.iter())
        .all(|(t, p)| *p == WILDCARD || t == p)
}

/// Partition key for broker placement: `tenant:project[:trace_id]`.
///
/// Including the trace id pins every message of a decision cycle onto the
/// same partition, which is what makes per-trace ordering hold.
pub fn partition_key(tenant: &str, project: &str, trace_id: Option<&str>) -> String {
    match trace_id {
        Some(trace) => format!("{tenant}:{project}:{trace}"),
        None => format!("{tenant}:{project}"),
    }
}

/// Well-known topic builders. Kept in one place so producers and consumers
/// can never drift on a topic name.
pub mod well_known {
    use super::{build_topic, Topic, TopicComponents};

    fn build(tenant: &str, project: &str, domain: &str, entity: &str, verb: Option<&str>) -> Topic {
        let mut components = TopicComponents::new(tenant, project, domain).entity(entity);
        if let Some(verb) = verb {
            components = components.verb(verb);
        }
        build_topic(&components).expect("well-known topic segments are valid")
    }

    /// Task invocations addressed at specialists.
    pub fn specialist_invoke(tenant: &str, project: &str) -> Topic {
        build(tenant, project, "specialist", "tasks", Some("invoke"))
    }

    /// Results returned by specialists.
    pub fn specialist_result(tenant: &str, project: &str) -> Topic {
        build(tenant, project, "specialist", "tasks", Some("result"))
    }

    /// Decision notices emitted by the orchestrator.
    pub fn cmo_decisions(tenant: &str, project: &str) -> Topic {
        build(tenant, project, "cmo", "decisions", None)
    }

    /// Escalation notices emitted by the orchestrator.
    pub fn cmo_escalations(tenant: &str, project: &str) -> Topic {
        build(tenant, project, "cmo", "escalations", None)
    }

    /// Registry heartbeat observability stream.
    pub fn registry_heartbeats(tenant: &str, project: &str) -> Topic {
        build(tenant, project, "registry", "heartbeats", None)
    }

    /// Memory events.
    pub fn memory_events(tenant: &str, project: &str) -> Topic {
        build(tenant, project, "memory", "events", None)
    }

    /// Context lookups.
    pub fn context_requests(tenant: &str, project: &str) -> Topic {
        build(tenant, project, "context", "requests", None)
    }

    /// Context lookup responses.
    pub fn context_results(tenant: &str, project: &str) -> Topic {
        build(tenant, project, "context", "results", None)
    }

    /// Ephemeral reply topic for one request/response exchange. Responders
    /// derive the same name from the request's correlation id.
    pub fn replies(tenant: &str, project: &str, correlation_id: &str) -> Topic {
        build(tenant, project, "cmo", "replies", Some(correlation_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn components() -> TopicComponents {
        TopicComponents::new("wesign", "webapp", "cmo")
            .entity("decisions")
            .verb("publish")
    }

    #[test]
    fn build_parse_round_trip() {
        let topic = build_topic(&components()).unwrap();
        assert_eq!(topic.name(), "qa.wesign.webapp.cmo.decisions.publish");
        assert_eq!(parse_topic(topic.name()).unwrap(), components());
    }

    #[test]
    fn parse_without_optional_segments() {
        let parsed = parse_topic("qa.wesign.webapp.registry").unwrap();
        assert_eq!(parsed.entity, None);
        assert_eq!(parsed.verb, None);
    }

    #[test]
    fn rejects_bad_segments() {
        assert!(build_topic(&TopicComponents::new("We$ign", "webapp", "cmo")).is_err());
        assert!(parse_topic("qa.wesign").is_err());
        assert!(parse_topic("mail.wesign.webapp.cmo").is_err());
    }

    #[test]
    fn wildcard_matches_one_segment() {
        assert!(matches_topic(
            "qa.wesign.webapp.cmo.decisions",
            "qa.wesign.*.cmo.decisions"
        ));
        assert!(!matches_topic(
            "qa.wesign.webapp.cmo.decisions",
            "qa.wesign.*.decisions"
        ));
        // Reflexive and monotone under added wildcards.
        let topic = "qa.wesign.webapp.cmo.decisions";
        assert!(matches_topic(topic, topic));
        assert!(matches_topic(topic, "qa.*.*.cmo.decisions"));
    }

    #[test]
    fn dlq_naming() {
        let topic = well_known::cmo_decisions("wesign", "webapp");
        assert_eq!(topic.dlq().name(), "qa.wesign.webapp.cmo.decisions.dlq");
        assert!(topic.dlq().is_dlq());
        assert!(!topic.is_dlq());
        // A DLQ name still parses back to its source components.
        assert_eq!(
            parse_topic(topic.dlq().name()).unwrap(),
            parse_topic(topic.name()).unwrap()
        );
    }

    #[test]
    fn partition_keys() {
        assert_eq!(partition_key("t", "p", None), "t:p");
        assert_eq!(partition_key("t", "p", Some("tr")), "t:p:tr");
    }
}
