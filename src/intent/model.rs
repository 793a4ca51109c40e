//! Intent, Plan, and Step records with per-kind constructors
//!
//! Construction enforces per-kind payload requirements; mutation rules
//! (frozen fields, lifecycle transitions) are enforced by the store, which
//! owns the only write path.

use super::IntentError;
use crate::ids;
use crate::safety::classifier::Classification;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Source
// ============================================================================

/// Who proposed an intent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Sprite,
    Agent,
    Cron,
    Operator,
    Webhook,
    /// Internal proposers (auto-rollback, maintenance sweeps)
    System,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sprite => write!(f, "sprite"),
            Self::Agent => write!(f, "agent"),
            Self::Cron => write!(f, "cron"),
            Self::Operator => write!(f, "operator"),
            Self::Webhook => write!(f, "webhook"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Origin of an intent: a source type plus the identity within that type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntentSource {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub id: String,
}

impl IntentSource {
    pub fn new(source_type: SourceType, id: impl Into<String>) -> Self {
        Self {
            source_type,
            id: id.into(),
        }
    }
}

// ============================================================================
// Lifecycle state
// ============================================================================

/// Intent lifecycle state. See `lifecycle::valid_transitions` for the
/// allowed edges.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IntentState {
    Proposed,
    Classified,
    AwaitingApproval,
    Approved,
    Running,
    Completed,
    Failed,
    Rejected,
    Canceled,
    Blocked,
    WaitingForInput,
}

impl IntentState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected | Self::Canceled)
    }
}

impl std::fmt::Display for IntentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Proposed => "proposed",
            Self::Classified => "classified",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Canceled => "canceled",
            Self::Blocked => "blocked",
            Self::WaitingForInput => "waiting_for_input",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Plan / Step
// ============================================================================

/// Who authored a plan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Agent,
    Operator,
    System,
}

/// Execution status of one plan step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    fn marker(self) -> &'static str {
        match self {
            Self::Pending => "[ ]",
            Self::Running => "[~]",
            Self::Completed => "[x]",
            Self::Failed => "[!]",
        }
    }
}

/// One ordered step within a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            skill: None,
            inputs: Map::new(),
            status: StepStatus::Pending,
            output: None,
        }
    }
}

/// An ordered plan attached to an intent. Structure freezes with the intent;
/// step status updates stay allowed through the store's dedicated operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub title: String,
    pub steps: Vec<PlanStep>,
    pub source: PlanSource,
    /// Bumped on every step status change
    pub version: u32,
    pub rendered_markdown: String,
}

impl Plan {
    pub fn new(title: impl Into<String>, steps: Vec<PlanStep>, source: PlanSource) -> Self {
        let mut plan = Self {
            title: title.into(),
            steps,
            source,
            version: 1,
            rendered_markdown: String::new(),
        };
        plan.rendered_markdown = plan.render_markdown();
        plan
    }

    /// Render the plan as a markdown checklist.
    pub fn render_markdown(&self) -> String {
        let mut out = format!("## {}\n", self.title);
        for step in &self.steps {
            out.push_str(&format!("- {} {}\n", step.status.marker(), step.description));
        }
        out
    }

    /// Update one step's status (and optionally its output). Bumps the plan
    /// version and re-renders markdown. Returns `StepNotFound` for unknown
    /// step ids.
    pub fn set_step_status(
        &mut self,
        step_id: &str,
        status: StepStatus,
        output: Option<Value>,
    ) -> Result<(), IntentError> {
        let step = self
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or_else(|| IntentError::StepNotFound(step_id.to_string()))?;
        step.status = status;
        if let Some(output) = output {
            step.output = Some(output);
        }
        self.version += 1;
        self.rendered_markdown = self.render_markdown();
        Ok(())
    }

    /// Serialize to a JSON map. Round-trips through `from_map`.
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Deserialize from a JSON map produced by `to_map`.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self, IntentError> {
        serde_json::from_value(Value::Object(map.clone()))
            .map_err(|e| IntentError::InvalidLifecycle(format!("invalid plan: {e}")))
    }
}

// ============================================================================
// Transition log & artifacts
// ============================================================================

/// Append-only record of one lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionEntry {
    pub from: IntentState,
    pub to: IntentState,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// An append-only record attached to an intent during or after execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub data: Value,
    pub added_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(artifact_type: impl Into<String>, data: Value) -> Self {
        Self {
            artifact_type: artifact_type.into(),
            data,
            added_at: Utc::now(),
        }
    }
}

// ============================================================================
// Intent
// ============================================================================

/// A structured proposal for a side effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    /// `int_` + random; unique within the store
    pub id: String,
    /// Registry kind key (`action`, `inquiry`, `maintenance`, or custom)
    pub kind: String,
    pub source: IntentSource,
    pub state: IntentState,
    pub summary: String,
    pub payload: Map<String, Value>,
    pub affected_resources: Vec<String>,
    pub expected_side_effects: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    /// Id of the failed intent this one rolls back, when applicable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_for: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Free-form metadata; artifacts accumulate under `metadata.artifacts`
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub transition_log: Vec<TransitionEntry>,

    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,

    // Run-bridge fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<DateTime<Utc>>,
}

/// Optional extras accepted by the kind constructors.
#[derive(Debug, Clone, Default)]
pub struct IntentOptions {
    pub rollback_strategy: Option<String>,
    pub plan: Option<Plan>,
    pub rollback_for: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

impl Intent {
    fn base(
        kind: &str,
        source: IntentSource,
        summary: String,
        payload: Map<String, Value>,
        opts: IntentOptions,
    ) -> Result<Self, IntentError> {
        if summary.trim().is_empty() {
            return Err(IntentError::MissingField("summary".to_string()));
        }
        let now = Utc::now();
        Ok(Self {
            id: ids::random_id("int"),
            kind: kind.to_string(),
            source,
            state: IntentState::Proposed,
            summary,
            payload,
            affected_resources: Vec::new(),
            expected_side_effects: Vec::new(),
            rollback_strategy: opts.rollback_strategy,
            plan: opts.plan,
            rollback_for: opts.rollback_for,
            classification: None,
            result: None,
            metadata: opts.metadata.unwrap_or_default(),
            transition_log: Vec::new(),
            inserted_at: now,
            updated_at: now,
            classified_at: None,
            approved_at: None,
            blocked_reason: None,
            pending_question: None,
            blocked_at: None,
            resumed_at: None,
        })
    }

    /// An `action` intent: a concrete side effect with named resources and
    /// declared consequences.
    pub fn action(
        source: IntentSource,
        summary: impl Into<String>,
        payload: Map<String, Value>,
        affected_resources: Vec<String>,
        expected_side_effects: Vec<String>,
        opts: IntentOptions,
    ) -> Result<Self, IntentError> {
        if affected_resources.is_empty() {
            return Err(IntentError::MissingField("affected_resources".to_string()));
        }
        if expected_side_effects.is_empty() {
            return Err(IntentError::MissingField("expected_side_effects".to_string()));
        }
        let mut intent = Self::base("action", source, summary.into(), payload, opts)?;
        intent.affected_resources = affected_resources;
        intent.expected_side_effects = expected_side_effects;
        Ok(intent)
    }

    /// An `inquiry` intent: a request for access or information. The payload
    /// must state what is requested, why, the scope of impact, and when the
    /// grant expires.
    pub fn inquiry(
        source: IntentSource,
        summary: impl Into<String>,
        payload: Map<String, Value>,
        opts: IntentOptions,
    ) -> Result<Self, IntentError> {
        for field in ["what_requested", "why_needed", "scope_of_impact", "expiration"] {
            if !payload.contains_key(field) {
                return Err(IntentError::MissingField(field.to_string()));
            }
        }
        Self::base("inquiry", source, summary.into(), payload, opts)
    }

    /// A `maintenance` intent: routine housekeeping; summary and payload only.
    pub fn maintenance(
        source: IntentSource,
        summary: impl Into<String>,
        payload: Map<String, Value>,
        opts: IntentOptions,
    ) -> Result<Self, IntentError> {
        Self::base("maintenance", source, summary.into(), payload, opts)
    }

    /// A task intent: an action that runs an agent task on a sprite against
    /// a repository. Affected resources are filled in automatically.
    pub fn task(
        source: IntentSource,
        sprite_name: impl Into<String>,
        repo: impl Into<String>,
        task_kind: impl Into<String>,
        instructions: impl Into<String>,
        extra_payload: Map<String, Value>,
        opts: IntentOptions,
    ) -> Result<Self, IntentError> {
        let sprite_name = sprite_name.into();
        let repo = repo.into();
        let task_kind = task_kind.into();
        let instructions = instructions.into();

        let mut payload = extra_payload;
        payload.insert("capability".to_string(), Value::String("sprites".to_string()));
        payload.insert("operation".to_string(), Value::String("run_task".to_string()));
        payload.insert("sprite_name".to_string(), Value::String(sprite_name.clone()));
        payload.insert("repo".to_string(), Value::String(repo.clone()));
        payload.insert("task_kind".to_string(), Value::String(task_kind.clone()));
        payload.insert("instructions".to_string(), Value::String(instructions));

        Self::action(
            source,
            format!("Run {task_kind} task on {sprite_name} against {repo}"),
            payload,
            vec![format!("sprite:{sprite_name}"), format!("repo:{repo}")],
            vec![format!("agent task executed on sprite {sprite_name}")],
            opts,
        )
    }

    /// Whether mutable-field rules have tightened: once an intent has been
    /// approved, its payload, resources, side effects, rollback strategy,
    /// and plan structure are frozen.
    pub fn is_frozen(&self) -> bool {
        self.approved_at.is_some()
    }

    /// The artifacts list under `metadata.artifacts` (empty when absent).
    pub fn artifacts(&self) -> Vec<Artifact> {
        self.metadata
            .get("artifacts")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// The governance issue number recorded by the bridge, if any.
    pub fn governance_issue(&self) -> Option<u64> {
        self.metadata.get("governance_issue").and_then(Value::as_u64)
    }

    /// Payload `capability`/`operation` strings when both are present —
    /// the shape produced by the task constructor.
    pub fn capability_operation(&self) -> Option<(&str, &str)> {
        let capability = self.payload.get("capability")?.as_str()?;
        let operation = self.payload.get("operation")?.as_str()?;
        Some((capability, operation))
    }

    /// The target repository of a task intent, if this is one.
    pub fn task_repo(&self) -> Option<&str> {
        match self.capability_operation() {
            Some(("sprites", "run_task")) => self.payload.get("repo")?.as_str(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> IntentSource {
        IntentSource::new(SourceType::Operator, "tester")
    }

    fn map(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_action_requires_resources_and_side_effects() {
        let err = Intent::action(
            source(),
            "restart the cache",
            Map::new(),
            Vec::new(),
            vec!["cache cleared".to_string()],
            IntentOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err, IntentError::MissingField("affected_resources".to_string()));

        let err = Intent::action(
            source(),
            "restart the cache",
            Map::new(),
            vec!["service:cache".to_string()],
            Vec::new(),
            IntentOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err, IntentError::MissingField("expected_side_effects".to_string()));
    }

    #[test]
    fn test_empty_summary_rejected() {
        let err = Intent::maintenance(source(), "   ", Map::new(), IntentOptions::default())
            .unwrap_err();
        assert_eq!(err, IntentError::MissingField("summary".to_string()));
    }

    #[test]
    fn test_inquiry_requires_payload_fields() {
        let err = Intent::inquiry(
            source(),
            "read access to prod logs",
            map(&[("what_requested", json!("log access"))]),
            IntentOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err, IntentError::MissingField("why_needed".to_string()));

        let ok = Intent::inquiry(
            source(),
            "read access to prod logs",
            map(&[
                ("what_requested", json!("log access")),
                ("why_needed", json!("incident 4821")),
                ("scope_of_impact", json!("read-only")),
                ("expiration", json!("2026-09-01T00:00:00Z")),
            ]),
            IntentOptions::default(),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_task_constructor_fills_resources() {
        let intent = Intent::task(
            source(),
            "sprite-7",
            "acme/widgets",
            "bugfix",
            "fix the flaky login test",
            Map::new(),
            IntentOptions::default(),
        )
        .unwrap();

        assert_eq!(intent.kind, "action");
        assert_eq!(intent.capability_operation(), Some(("sprites", "run_task")));
        assert_eq!(intent.task_repo(), Some("acme/widgets"));
        assert!(intent.affected_resources.contains(&"sprite:sprite-7".to_string()));
        assert!(intent.affected_resources.contains(&"repo:acme/widgets".to_string()));
        assert!(intent.id.starts_with("int_"));
    }

    #[test]
    fn test_plan_version_bumps_on_step_change() {
        let mut plan = Plan::new(
            "Deploy rollout",
            vec![PlanStep::new("s1", "build image"), PlanStep::new("s2", "deploy canary")],
            PlanSource::Agent,
        );
        assert_eq!(plan.version, 1);
        assert!(plan.rendered_markdown.contains("- [ ] build image"));

        plan.set_step_status("s1", StepStatus::Completed, Some(json!("image built"))).unwrap();
        assert_eq!(plan.version, 2);
        assert!(plan.rendered_markdown.contains("- [x] build image"));

        let err = plan.set_step_status("nope", StepStatus::Running, None).unwrap_err();
        assert_eq!(err, IntentError::StepNotFound("nope".to_string()));
        assert_eq!(plan.version, 2);
    }

    #[test]
    fn test_plan_map_roundtrip() {
        let mut plan = Plan::new(
            "Migration",
            vec![PlanStep::new("s1", "snapshot db")],
            PlanSource::Operator,
        );
        plan.set_step_status("s1", StepStatus::Running, None).unwrap();

        let restored = Plan::from_map(&plan.to_map()).unwrap();
        assert_eq!(restored, plan);
        assert_eq!(restored.version, 2);
    }

    #[test]
    fn test_artifacts_accessor_defaults_empty() {
        let intent = Intent::maintenance(source(), "sweep", Map::new(), IntentOptions::default())
            .unwrap();
        assert!(intent.artifacts().is_empty());
        assert!(intent.governance_issue().is_none());
        assert!(!intent.is_frozen());
    }
}
