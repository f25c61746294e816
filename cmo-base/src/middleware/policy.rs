use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use cmo_core::Envelope;

/// A constraint attached by an `allow_with_caveat` decision.
///
/// Carried end-to-end: the consumer attaches it to the delivery context and
/// the decision engine echoes it into grading-event reasons. The canonical
/// example is `kind = "mask-fields"` with the PII field names listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaveatConstraint {
    /// Constraint discriminator, e.g. `mask-fields`.
    pub kind: String,
    /// Fields the constraint applies to.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Operator-facing note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    /// Deliver unmodified.
    Allow,
    /// Deliver, with a constraint downstream components must honor.
    AllowWithCaveat(CaveatConstraint),
    /// Reject to the DLQ with the reason.
    Deny {
        /// Why the envelope was refused.
        reason: String,
    },
}

/// A wire-level policy.
#[async_trait]
pub trait PolicyGate: Send + Sync + Debug {
    /// Decide what to do with an inbound envelope.
    async fn evaluate(&self, envelope: &Envelope) -> PolicyDecision;
}

/// The baseline policy every deployment carries: an orchestrator serves
/// exactly one tenant/project scope and must refuse traffic from any other,
/// mixed-tenant envelopes included.
#[derive(Debug, Clone)]
pub struct TenantScopePolicy {
    tenant: String,
    project: String,
}

impl TenantScopePolicy {
    /// A policy scoped to one tenant and project.
    pub fn new(tenant: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            project: project.into(),
        }
    }
}

#[async_trait]
impl PolicyGate for TenantScopePolicy {
    async fn evaluate(&self, envelope: &Envelope) -> PolicyDecision {
        if envelope.meta.tenant != self.tenant || envelope.meta.project != self.project {
            return PolicyDecision::Deny {
                reason: format!(
                    "tenant scope mismatch: envelope is {}/{}, this orchestrator serves {}/{}",
                    envelope.meta.tenant, envelope.meta.project, self.tenant, self.project
                ),
            };
        }
        PolicyDecision::Allow
    }
}

/// Chains gates; the first non-allow decision wins, and caveats accumulate
/// onto the final allow.
#[derive(Debug, Default)]
pub struct PolicyChain {
    gates: Vec<Box<dyn PolicyGate>>,
}

impl PolicyChain {
    /// An empty chain, which allows everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a gate.
    pub fn with(mut self, gate: impl PolicyGate + 'static) -> Self {
        self.gates.push(Box::new(gate));
        self
    }

    /// Evaluate all gates in order.
    pub async fn evaluate(&self, envelope: &Envelope) -> PolicyDecision {
        let mut caveat = None;
        for gate in &self.gates {
            match gate.evaluate(envelope).await {
                PolicyDecision::Allow => {}
                PolicyDecision::AllowWithCaveat(constraint) => {
                    // Last caveat wins; a richer merge is not needed until a
                    // second caveat-producing gate exists.
                    caveat = Some(constraint);
                }
                deny @ PolicyDecision::Deny { .. } => return deny,
            }
        }
        match caveat {
            Some(constraint) => PolicyDecision::AllowWithCaveat(constraint),
            None => PolicyDecision::Allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmo_core::{AgentId, MemoryEvent, MessageType};

    fn envelope(tenant: &str, project: &str) -> Envelope {
        Envelope::new(
            MessageType::MemoryEvent,
            AgentId::agent("planner"),
            vec![AgentId::agent("cmo")],
            tenant,
            project,
            &MemoryEvent {
                event: "test".into(),
                data: serde_json::json!({}),
            },
        )
        .unwrap()
    }

    #[derive(Debug)]
    struct MaskingGate;

    #[async_trait]
    impl PolicyGate for MaskingGate {
        async fn evaluate(&self, _envelope: &Envelope) -> PolicyDecision {
            PolicyDecision::AllowWithCaveat(CaveatConstraint {
                kind: "mask-fields".into(),
                fields: vec!["email".into()],
                note: None,
            })
        }
    }

    #[tokio::test]
    async fn scope_policy_denies_foreign_tenants() {
        let policy = TenantScopePolicy::new("wesign", "webapp");
        assert_eq!(
            policy.evaluate(&envelope("wesign", "webapp")).await,
            PolicyDecision::Allow
        );
        assert!(matches!(
            policy.evaluate(&envelope("otherco", "webapp")).await,
            PolicyDecision::Deny { .. }
        ));
        assert!(matches!(
            policy.evaluate(&envelope("wesign", "other")).await,
            PolicyDecision::Deny { .. }
        ));
    }

    #[tokio::test]
    async fn chain_accumulates_caveats_and_short_circuits_denies() {
        let chain = PolicyChain::new()
            .with(TenantScopePolicy::new("wesign", "webapp"))
            .with(MaskingGate);

        match chain.evaluate(&envelope("wesign", "webapp")).await {
            PolicyDecision::AllowWithCaveat(constraint) => {
                assert_eq!(constraint.kind, "mask-fields");
            }
            other => panic!("expected caveat, got {other:?}"),
        }

        assert!(matches!(
            chain.evaluate(&envelope("otherco", "webapp")).await,
            PolicyDecision::Deny { .. }
        ));
    }
}
