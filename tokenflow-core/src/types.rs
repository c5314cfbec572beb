use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::error::{EngineError, Result};

// ─── Token ────────────────────────────────────────────────────

/// Token lifecycle states.
///
/// ACTIVE tokens are picked up by the run loop; WAITING tokens are parked on
/// a subprocess, timer, or subscription; COMPENSATION gates compensation
/// handler execution. ERROR tokens are retained at the failing node so
/// `resume_instance` can re-enter from them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenState {
    Active,
    Waiting,
    Completed,
    Cancelled,
    Error,
    Compensation,
}

impl TokenState {
    /// Terminal states are about to be removed; they never dispatch again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TokenState::Completed | TokenState::Cancelled)
    }
}

impl std::fmt::Display for TokenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TokenState::Active => "ACTIVE",
            TokenState::Waiting => "WAITING",
            TokenState::Completed => "COMPLETED",
            TokenState::Cancelled => "CANCELLED",
            TokenState::Error => "ERROR",
            TokenState::Compensation => "COMPENSATION",
        };
        f.write_str(s)
    }
}

/// The runtime quantum: "execution is here" at a node within an instance.
///
/// Tokens live only in the runtime store (`process:{instance}:tokens`); they
/// are never rows in the durable store, but every mutation is transactional
/// so they survive restart.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub node_id: String,
    pub state: TokenState,
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_activity_id: Option<String>,
}

impl Token {
    pub fn new(instance_id: Uuid, node_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            node_id: node_id.into(),
            state: TokenState::Active,
            data: BTreeMap::new(),
            scope_id: None,
            parent_instance_id: None,
            parent_activity_id: None,
        }
    }

    /// Copy this token to a new node. The copy gets a fresh id and starts
    /// ACTIVE; scope and data carry over.
    pub fn copied_to(&self, node_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id: self.instance_id,
            node_id: node_id.into(),
            state: TokenState::Active,
            data: self.data.clone(),
            scope_id: self.scope_id.clone(),
            parent_instance_id: self.parent_instance_id,
            parent_activity_id: self.parent_activity_id.clone(),
        }
    }

    pub fn with_scope(mut self, scope_id: Option<String>) -> Self {
        self.scope_id = scope_id;
        self
    }

    pub fn with_data(mut self, data: BTreeMap<String, serde_json::Value>) -> Self {
        self.data = data;
        self
    }
}

// ─── Scope paths ──────────────────────────────────────────────

/// Append a segment to a scope path.
pub fn push_scope(parent: Option<&str>, segment: &str) -> String {
    match parent {
        Some(p) if !p.is_empty() => format!("{p}/{segment}"),
        _ => segment.to_string(),
    }
}

/// Strip the innermost segment, returning the parent scope (None = global).
pub fn pop_scope(scope: &str) -> Option<String> {
    scope.rsplit_once('/').map(|(parent, _)| parent.to_string())
}

/// Innermost segment of a scope path.
pub fn scope_leaf(scope: &str) -> &str {
    scope.rsplit_once('/').map(|(_, leaf)| leaf).unwrap_or(scope)
}

/// All lookup scopes for a token, innermost first, ending with the global
/// scope (None). Variable resolution walks this list.
pub fn scope_ancestors(scope: Option<&str>) -> Vec<Option<String>> {
    let mut out = Vec::new();
    let mut cur = scope.map(str::to_string);
    while let Some(s) = cur {
        cur = pop_scope(&s);
        out.push(Some(s));
    }
    out.push(None);
    out
}

/// Multi-instance scope segments look like `{nodeId}_instance_{i}`.
/// Returns the activity id and index when the segment matches.
pub fn parse_instance_segment(segment: &str) -> Option<(&str, usize)> {
    let (activity, idx) = segment.rsplit_once("_instance_")?;
    idx.parse().ok().map(|i| (activity, i))
}

// ─── Variables ────────────────────────────────────────────────

/// Declared variable types. Implicit coercion is forbidden outside the
/// expression evaluator's documented numeric rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Integer,
    Float,
    Boolean,
    Json,
}

impl std::fmt::Display for VariableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VariableType::String => "string",
            VariableType::Integer => "integer",
            VariableType::Float => "float",
            VariableType::Boolean => "boolean",
            VariableType::Json => "json",
        };
        f.write_str(s)
    }
}

/// A dynamically-typed variable value, serialized as a `{type, value}` pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableValue {
    #[serde(rename = "type")]
    pub value_type: VariableType,
    pub value: serde_json::Value,
}

impl VariableValue {
    pub fn new(value_type: VariableType, value: serde_json::Value) -> Result<Self> {
        let v = Self { value_type, value };
        v.validate("value")?;
        Ok(v)
    }

    /// Infer the declared type from a JSON value. Used where scripts write
    /// untyped values into the scope.
    pub fn infer(value: serde_json::Value) -> Self {
        let value_type = match &value {
            serde_json::Value::String(_) => VariableType::String,
            serde_json::Value::Bool(_) => VariableType::Boolean,
            serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => VariableType::Integer,
            serde_json::Value::Number(_) => VariableType::Float,
            _ => VariableType::Json,
        };
        Self { value_type, value }
    }

    /// Check that the JSON value matches the declared type.
    pub fn validate(&self, name: &str) -> Result<()> {
        let ok = match self.value_type {
            VariableType::String => self.value.is_string(),
            VariableType::Integer => {
                self.value.as_i64().is_some() || self.value.as_u64().is_some()
            }
            VariableType::Float => self.value.is_number(),
            VariableType::Boolean => self.value.is_boolean(),
            VariableType::Json => self.value.is_object() || self.value.is_array(),
        };
        if ok {
            Ok(())
        } else {
            Err(EngineError::InvalidVariable {
                name: name.to_string(),
                message: format!("value does not match declared type {}", self.value_type),
            })
        }
    }
}

/// A variable row, unique per `(instance_id, scope_id, name)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VariableRecord {
    pub instance_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    pub name: String,
    #[serde(flatten)]
    pub value: VariableValue,
    pub version: i32,
}

/// Declared variable in a process definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: VariableType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
}

// ─── Definitions and instances ────────────────────────────────

/// Immutable (per version) process definition record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessDefinitionRecord {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
    pub bpmn_xml: String,
    #[serde(default)]
    pub variable_definitions: Vec<VariableDefinition>,
}

/// Process instance lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Running,
    Suspended,
    Completed,
    Error,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Suspended => "SUSPENDED",
            InstanceStatus::Completed => "COMPLETED",
            InstanceStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A single execution of a process definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInstanceRecord {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub status: InstanceStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

// ─── Activity log ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityType {
    InstanceCreated,
    InstanceStarted,
    NodeEntered,
    NodeCompleted,
    ServiceTaskExecuted,
    InstanceSuspended,
    InstanceResumed,
    InstanceCompleted,
    InstanceError,
}

impl std::fmt::Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivityType::InstanceCreated => "INSTANCE_CREATED",
            ActivityType::InstanceStarted => "INSTANCE_STARTED",
            ActivityType::NodeEntered => "NODE_ENTERED",
            ActivityType::NodeCompleted => "NODE_COMPLETED",
            ActivityType::ServiceTaskExecuted => "SERVICE_TASK_EXECUTED",
            ActivityType::InstanceSuspended => "INSTANCE_SUSPENDED",
            ActivityType::InstanceResumed => "INSTANCE_RESUMED",
            ActivityType::InstanceCompleted => "INSTANCE_COMPLETED",
            ActivityType::InstanceError => "INSTANCE_ERROR",
        };
        f.write_str(s)
    }
}

/// Append-only audit row, the primary debugging artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityLogRecord {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub activity_type: ActivityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ActivityLogRecord {
    pub fn new(
        instance_id: Uuid,
        activity_type: ActivityType,
        node_id: Option<String>,
        details: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            activity_type,
            node_id,
            details,
            timestamp: Utc::now(),
        }
    }
}

// ─── Transactions ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Active,
    Committed,
    Compensating,
    Compensated,
    Failed,
}

/// Transaction context for a transaction subprocess. At most one active
/// transaction per instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub instance_id: Uuid,
    pub status: TransactionStatus,
    #[serde(default)]
    pub completed_activities: BTreeSet<String>,
}

impl TransactionRecord {
    pub fn start(transaction_id: impl Into<String>, instance_id: Uuid) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            instance_id,
            status: TransactionStatus::Active,
            completed_activities: BTreeSet::new(),
        }
    }
}

// ─── Compensation registry ────────────────────────────────────

/// One registered compensation handler. Entries are appended in
/// activity-completion order; compensation throws iterate in reverse.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompensationEntry {
    pub activity_id: String,
    pub handler_id: String,
    pub boundary_event_id: String,
    /// Snapshot of the compensated activity's token data at completion time,
    /// handed to the handler.
    #[serde(default)]
    pub activity_data: BTreeMap<String, serde_json::Value>,
}

// ─── Subscriptions ────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionKind {
    Message,
    Signal,
}

impl std::fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionKind::Message => f.write_str("message"),
            SubscriptionKind::Signal => f.write_str("signal"),
        }
    }
}

/// "This (instance, node) awaits a message/signal of this name."
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subscription {
    pub kind: SubscriptionKind,
    pub name: String,
    pub instance_id: Uuid,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_value: Option<String>,
}

// ─── Timer metadata ───────────────────────────────────────────

/// Mirrored descriptor for a scheduled timer so a fresh scheduler can
/// rehydrate its jobs on startup. Keyed
/// `pythmata:timer:{definition}:{node}:metadata` in the runtime store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimerMetadata {
    pub definition_id: Uuid,
    pub node_id: String,
    pub timer_def: String,
    pub timer_type: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn token_round_trips_through_json() {
        let mut t = Token::new(Uuid::now_v7(), "Task_1");
        t.data.insert("amount".into(), json!(500));
        t.scope_id = Some("Sub_1/Activity_instance_0".into());
        let s = serde_json::to_string(&t).unwrap();
        let back: Token = serde_json::from_str(&s).unwrap();
        assert_eq!(back.node_id, "Task_1");
        assert_eq!(back.state, TokenState::Active);
        assert_eq!(back.scope_id.as_deref(), Some("Sub_1/Activity_instance_0"));
        assert_eq!(back.data["amount"], json!(500));
    }

    #[test]
    fn scope_paths() {
        assert_eq!(push_scope(None, "A_instance_0"), "A_instance_0");
        assert_eq!(push_scope(Some("outer"), "inner"), "outer/inner");
        assert_eq!(pop_scope("outer/inner"), Some("outer".to_string()));
        assert_eq!(pop_scope("outer"), None);
        assert_eq!(scope_leaf("a/b/c"), "c");
        assert_eq!(
            scope_ancestors(Some("a/b")),
            vec![Some("a/b".to_string()), Some("a".to_string()), None]
        );
        assert_eq!(scope_ancestors(None), vec![None]);
    }

    #[test]
    fn instance_segments() {
        assert_eq!(
            parse_instance_segment("Activity_1_instance_2"),
            Some(("Activity_1", 2))
        );
        assert_eq!(parse_instance_segment("Task_1"), None);
    }

    #[test]
    fn variable_type_validation() {
        assert!(VariableValue::new(VariableType::Integer, json!(42)).is_ok());
        assert!(VariableValue::new(VariableType::Integer, json!("42")).is_err());
        assert!(VariableValue::new(VariableType::Boolean, json!(true)).is_ok());
        assert!(VariableValue::new(VariableType::Float, json!(1)).is_ok());
        assert!(VariableValue::new(VariableType::Json, json!({"a": 1})).is_ok());
        assert!(VariableValue::new(VariableType::Json, json!("str")).is_err());
    }

    #[test]
    fn variable_value_serializes_as_type_value_pair() {
        let v = VariableValue::new(VariableType::Boolean, json!(true)).unwrap();
        let s = serde_json::to_value(&v).unwrap();
        assert_eq!(s, json!({"type": "boolean", "value": true}));
        let back: VariableValue = serde_json::from_value(s).unwrap();
        assert_eq!(back.value, json!(true));
        assert_eq!(back.value_type, VariableType::Boolean);
    }

    #[test]
    fn infer_types() {
        assert_eq!(VariableValue::infer(json!("x")).value_type, VariableType::String);
        assert_eq!(VariableValue::infer(json!(1)).value_type, VariableType::Integer);
        assert_eq!(VariableValue::infer(json!(1.5)).value_type, VariableType::Float);
        assert_eq!(VariableValue::infer(json!([1])).value_type, VariableType::Json);
    }
}
