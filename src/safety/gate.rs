//! Safety gate - folds classification and policy config into a decision
//!
//! The gate is a pure predicate: it never mutates, never blocks, and never
//! consults anything beyond the classification, the guardrails, and the
//! task allowlist.

use super::classifier::{ActionRecord, Classification};
use crate::config::{GuardrailsConfig, TaskAllowlistConfig};
use crate::intent::model::Intent;

/// Result of gating an action or intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Proceed without human involvement
    Allow,
    /// Queue for human-in-the-loop approval
    ApprovalRequired,
    /// Policy forbids this operation outright
    NotPermitted,
}

impl std::fmt::Display for GateDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::ApprovalRequired => write!(f, "approval_required"),
            Self::NotPermitted => write!(f, "action_not_permitted"),
        }
    }
}

/// Gate one classified action against the guardrails.
pub fn check(action: &ActionRecord, guardrails: &GuardrailsConfig) -> GateDecision {
    check_classification(action.classification, guardrails)
}

/// Gate a bare classification against the guardrails.
pub fn check_classification(
    classification: Classification,
    guardrails: &GuardrailsConfig,
) -> GateDecision {
    match classification {
        Classification::Safe => GateDecision::Allow,
        Classification::Controlled => {
            if !guardrails.allow_controlled {
                GateDecision::NotPermitted
            } else if guardrails.require_approval_for_controlled {
                GateDecision::ApprovalRequired
            } else {
                GateDecision::Allow
            }
        }
        Classification::Dangerous => {
            if guardrails.allow_dangerous {
                GateDecision::ApprovalRequired
            } else {
                GateDecision::NotPermitted
            }
        }
    }
}

/// Outcome of gating an intent, carrying the transition reason to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    pub decision: GateDecision,
    pub reason: &'static str,
}

/// Gate an intent, applying the task-allowlist override: a `controlled`
/// task targeting an allowlisted repository is admitted without approval,
/// and the transition reason records why.
pub fn check_intent(
    intent: &Intent,
    classification: Classification,
    guardrails: &GuardrailsConfig,
    allowlist: &TaskAllowlistConfig,
) -> GateOutcome {
    if classification == Classification::Controlled {
        if let Some(repo) = intent.task_repo() {
            if allowlist.auto_approve_repos.iter().any(|r| r == repo) {
                return GateOutcome {
                    decision: GateDecision::Allow,
                    reason: "auto-approved (allowlisted repo)",
                };
            }
        }
    }

    let decision = check_classification(classification, guardrails);
    let reason = match decision {
        GateDecision::Allow => "auto-approved",
        GateDecision::ApprovalRequired => "approval required",
        GateDecision::NotPermitted => "action not permitted by policy",
    };
    GateOutcome { decision, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::model::{IntentOptions, IntentSource, SourceType};
    use serde_json::Map;

    fn guardrails(controlled: bool, dangerous: bool, approval: bool) -> GuardrailsConfig {
        GuardrailsConfig {
            allow_controlled: controlled,
            allow_dangerous: dangerous,
            require_approval_for_controlled: approval,
        }
    }

    #[test]
    fn test_gate_truth_table() {
        use Classification::*;
        use GateDecision::*;

        // safe is always allowed
        for g in [
            guardrails(false, false, false),
            guardrails(true, true, true),
        ] {
            assert_eq!(check_classification(Safe, &g), Allow);
        }

        assert_eq!(check_classification(Controlled, &guardrails(false, false, false)), NotPermitted);
        assert_eq!(check_classification(Controlled, &guardrails(true, false, false)), Allow);
        assert_eq!(check_classification(Controlled, &guardrails(true, false, true)), ApprovalRequired);
        assert_eq!(check_classification(Dangerous, &guardrails(true, false, true)), NotPermitted);
        assert_eq!(check_classification(Dangerous, &guardrails(true, true, true)), ApprovalRequired);
    }

    #[test]
    fn test_allowlist_bypasses_controlled_approval() {
        let allowlist = TaskAllowlistConfig {
            auto_approve_repos: vec!["acme/widgets".to_string()],
        };
        let g = guardrails(true, false, true);
        let source = IntentSource::new(SourceType::Operator, "tester");

        let allowed = Intent::task(
            source.clone(),
            "sprite-1",
            "acme/widgets",
            "bugfix",
            "fix it",
            Map::new(),
            IntentOptions::default(),
        )
        .unwrap();
        let outcome = check_intent(&allowed, Classification::Controlled, &g, &allowlist);
        assert_eq!(outcome.decision, GateDecision::Allow);
        assert_eq!(outcome.reason, "auto-approved (allowlisted repo)");

        let other = Intent::task(
            source,
            "sprite-1",
            "acme/other",
            "bugfix",
            "fix it",
            Map::new(),
            IntentOptions::default(),
        )
        .unwrap();
        let outcome = check_intent(&other, Classification::Controlled, &g, &allowlist);
        assert_eq!(outcome.decision, GateDecision::ApprovalRequired);
    }

    #[test]
    fn test_allowlist_never_bypasses_dangerous() {
        let allowlist = TaskAllowlistConfig {
            auto_approve_repos: vec!["acme/widgets".to_string()],
        };
        let g = guardrails(true, true, true);
        let intent = Intent::task(
            IntentSource::new(SourceType::Operator, "tester"),
            "sprite-1",
            "acme/widgets",
            "bugfix",
            "fix it",
            Map::new(),
            IntentOptions::default(),
        )
        .unwrap();

        let outcome = check_intent(&intent, Classification::Dangerous, &g, &allowlist);
        assert_eq!(outcome.decision, GateDecision::ApprovalRequired);
    }
}
