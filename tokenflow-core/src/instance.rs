//! Process instance lifecycle.
//!
//! Owns the durable instance records and orchestrates the transitions
//! RUNNING ↔ SUSPENDED, RUNNING/SUSPENDED/ERROR → COMPLETED, ERROR → RUNNING
//! (recovery). Variable setup validates declared types and writes both the
//! durable row and the runtime cache.

use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bpmn::{self, EventDefinition, ProcessGraph};
use crate::error::{EngineError, Result};
use crate::expr::Context;
use crate::store::{DurableStore, RuntimeStore};
use crate::token_manager::TokenManager;
use crate::types::*;

pub struct InstanceManager {
    durable: Arc<dyn DurableStore>,
    runtime: Arc<dyn RuntimeStore>,
    tokens: Arc<TokenManager>,
}

impl InstanceManager {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        runtime: Arc<dyn RuntimeStore>,
        tokens: Arc<TokenManager>,
    ) -> Self {
        Self {
            durable,
            runtime,
            tokens,
        }
    }

    // ── Creation ──

    /// Create and initialize a new instance: validate the definition, write
    /// the row, hydrate initial variables, plant the initial token.
    ///
    /// Idempotent with respect to duplicate event delivery: when a row with
    /// the requested id already exists it is reused and token creation is
    /// skipped.
    pub async fn create_instance(
        &self,
        definition_id: Uuid,
        instance_id: Option<Uuid>,
        variables: Option<BTreeMap<String, VariableValue>>,
        start_event_id: Option<&str>,
    ) -> Result<ProcessInstanceRecord> {
        let definition = self
            .durable
            .load_definition(definition_id)
            .await?
            .ok_or(EngineError::DefinitionNotFound(definition_id))?;

        if let Some(id) = instance_id {
            if let Some(existing) = self.durable.load_instance(id).await? {
                info!(instance = %id, "duplicate create_instance; reusing existing row");
                return Ok(existing);
            }
        }

        let instance = ProcessInstanceRecord {
            id: instance_id.unwrap_or_else(Uuid::now_v7),
            definition_id,
            status: InstanceStatus::Running,
            start_time: Utc::now(),
            end_time: None,
        };
        self.durable.save_instance(&instance).await?;
        self.log(instance.id, ActivityType::InstanceCreated, None, None)
            .await?;

        if let Some(vars) = variables {
            self.setup_variables(instance.id, vars).await?;
        }

        let graph = bpmn::parse(&definition.bpmn_xml)?;
        let start = self.find_start_event(&graph, start_event_id)?;
        match self.tokens.create_initial(instance.id, &start).await {
            Ok(_) => {}
            // a crash after token creation but before ack leaves the token in
            // place; duplicate delivery must not produce a second one
            Err(EngineError::TokenExists { .. }) => {
                warn!(instance = %instance.id, "initial token already present; skipping");
            }
            Err(e) => return Err(e),
        }

        Ok(instance)
    }

    /// Initialize execution state for an instance whose row already exists.
    pub async fn start_instance(
        &self,
        instance: &ProcessInstanceRecord,
        bpmn_xml: &str,
        variables: Option<BTreeMap<String, VariableValue>>,
        start_event_id: Option<&str>,
    ) -> Result<ProcessInstanceRecord> {
        if let Some(vars) = variables {
            self.setup_variables(instance.id, vars).await?;
        }
        let graph = bpmn::parse(bpmn_xml)?;
        let start = self.find_start_event(&graph, start_event_id)?;
        self.tokens.create_initial(instance.id, &start).await?;
        self.durable
            .update_instance_status(instance.id, InstanceStatus::Running, None)
            .await?;
        self.log(instance.id, ActivityType::InstanceStarted, None, None)
            .await?;
        let mut updated = instance.clone();
        updated.status = InstanceStatus::Running;
        Ok(updated)
    }

    /// Locate the start event: the explicit id when given, else the single
    /// unambiguous start event of the process.
    fn find_start_event(&self, graph: &ProcessGraph, explicit: Option<&str>) -> Result<String> {
        if let Some(id) = explicit {
            return match graph.find_node(id) {
                Some(_) => Ok(id.to_string()),
                None => Err(EngineError::NodeNotFound(id.to_string())),
            };
        }
        let starts = graph.start_events();
        // timer start events belong to the scheduler; prefer plain ones when
        // both are present
        let plain: Vec<_> = starts
            .iter()
            .filter(|e| e.definition != Some(EventDefinition::Timer))
            .collect();
        let chosen = plain.first().copied().or_else(|| starts.first());
        chosen
            .map(|e| e.id.clone())
            .ok_or(EngineError::MissingStartEvent)
    }

    // ── Variables ──

    /// Validate and write initial variables, both durable and runtime.
    pub async fn setup_variables(
        &self,
        instance_id: Uuid,
        variables: BTreeMap<String, VariableValue>,
    ) -> Result<()> {
        for (name, value) in variables {
            value.validate(&name)?;
            self.set_variable(instance_id, None, &name, value).await?;
        }
        Ok(())
    }

    /// Write one variable to both stores.
    pub async fn set_variable(
        &self,
        instance_id: Uuid,
        scope_id: Option<&str>,
        name: &str,
        value: VariableValue,
    ) -> Result<()> {
        self.durable
            .upsert_variable(&VariableRecord {
                instance_id,
                scope_id: scope_id.map(str::to_string),
                name: name.to_string(),
                value: value.clone(),
                version: 1,
            })
            .await?;
        self.runtime
            .set_variable(instance_id, scope_id, name, &value)
            .await
    }

    /// Resolve a variable by walking scope ancestors, innermost match first.
    /// Absent names return None rather than raising.
    pub async fn resolve_variable(
        &self,
        instance_id: Uuid,
        scope_id: Option<&str>,
        name: &str,
    ) -> Result<Option<VariableValue>> {
        for scope in scope_ancestors(scope_id) {
            if let Some(value) = self
                .runtime
                .get_variable(instance_id, scope.as_deref(), name)
                .await?
            {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Flattened evaluation context for a scope: every visible variable by
    /// name, innermost declaration winning.
    pub async fn variables_context(
        &self,
        instance_id: Uuid,
        scope_id: Option<&str>,
    ) -> Result<Context> {
        let all = self.runtime.list_variables(instance_id).await?;
        let mut ctx = Context::new();
        // outermost first so inner scopes overwrite
        for scope in scope_ancestors(scope_id).into_iter().rev() {
            for (key, value) in &all {
                let name = match &scope {
                    Some(s) => match key.strip_prefix(&format!("{s}:")) {
                        Some(rest) if !rest.contains(':') => rest,
                        _ => continue,
                    },
                    None => {
                        if key.contains(':') {
                            continue;
                        }
                        key.as_str()
                    }
                };
                ctx.insert(name.to_string(), value.value.clone());
            }
        }
        Ok(ctx)
    }

    /// Like [`Self::variables_context`] but preserving declared types, for
    /// service-task contexts.
    pub async fn variables_snapshot(
        &self,
        instance_id: Uuid,
        scope_id: Option<&str>,
    ) -> Result<BTreeMap<String, VariableValue>> {
        let all = self.runtime.list_variables(instance_id).await?;
        let mut out = BTreeMap::new();
        for scope in scope_ancestors(scope_id).into_iter().rev() {
            for (key, value) in &all {
                let name = match &scope {
                    Some(s) => match key.strip_prefix(&format!("{s}:")) {
                        Some(rest) if !rest.contains(':') => rest,
                        _ => continue,
                    },
                    None => {
                        if key.contains(':') {
                            continue;
                        }
                        key.as_str()
                    }
                };
                out.insert(name.to_string(), value.clone());
            }
        }
        Ok(out)
    }

    /// Durable-store variable read, scope-filtered, for the RPC surface.
    pub async fn get_instance_variables(
        &self,
        instance_id: Uuid,
        scope_id: Option<&str>,
    ) -> Result<Vec<VariableRecord>> {
        self.durable.load_variables(instance_id, scope_id).await
    }

    // ── Lifecycle ──

    async fn require_instance(&self, id: Uuid) -> Result<ProcessInstanceRecord> {
        self.durable
            .load_instance(id)
            .await?
            .ok_or(EngineError::InstanceNotFound(id))
    }

    pub async fn get_instance(&self, id: Uuid) -> Result<ProcessInstanceRecord> {
        self.require_instance(id).await
    }

    pub async fn list_instances(&self) -> Result<Vec<ProcessInstanceRecord>> {
        self.durable.list_instances().await
    }

    pub async fn suspend_instance(&self, id: Uuid) -> Result<ProcessInstanceRecord> {
        let mut instance = self.require_instance(id).await?;
        if instance.status != InstanceStatus::Running {
            return Err(EngineError::InvalidStateTransition {
                action: "suspend",
                status: instance.status.to_string(),
            });
        }
        self.durable
            .update_instance_status(id, InstanceStatus::Suspended, None)
            .await?;
        self.log(id, ActivityType::InstanceSuspended, None, None)
            .await?;
        instance.status = InstanceStatus::Suspended;
        info!(instance = %id, "instance suspended");
        Ok(instance)
    }

    pub async fn resume_instance(&self, id: Uuid) -> Result<ProcessInstanceRecord> {
        let mut instance = self.require_instance(id).await?;
        if !matches!(
            instance.status,
            InstanceStatus::Suspended | InstanceStatus::Error
        ) {
            return Err(EngineError::InvalidStateTransition {
                action: "resume",
                status: instance.status.to_string(),
            });
        }
        self.durable
            .update_instance_status(id, InstanceStatus::Running, None)
            .await?;
        self.log(id, ActivityType::InstanceResumed, None, None)
            .await?;
        instance.status = InstanceStatus::Running;
        info!(instance = %id, "instance resumed");
        Ok(instance)
    }

    /// Terminate: any state → COMPLETED with `end_time`; all runtime state
    /// (tokens, subscriptions, locks, timers) cleared.
    pub async fn terminate_instance(&self, id: Uuid) -> Result<ProcessInstanceRecord> {
        let mut instance = self.require_instance(id).await?;
        self.runtime.clear_instance(id).await?;
        let end = Utc::now();
        self.durable
            .update_instance_status(id, InstanceStatus::Completed, Some(end))
            .await?;
        self.log(
            id,
            ActivityType::InstanceCompleted,
            None,
            Some(json!({"terminated": true})),
        )
        .await?;
        instance.status = InstanceStatus::Completed;
        instance.end_time = Some(end);
        info!(instance = %id, "instance terminated");
        Ok(instance)
    }

    pub async fn set_error_state(&self, id: Uuid, message: Option<&str>) -> Result<()> {
        self.require_instance(id).await?;
        self.durable
            .update_instance_status(id, InstanceStatus::Error, None)
            .await?;
        self.log(
            id,
            ActivityType::InstanceError,
            None,
            message.map(|m| json!({ "error": m })),
        )
        .await?;
        warn!(instance = %id, error = message.unwrap_or(""), "instance moved to ERROR");
        Ok(())
    }

    /// Called by the run loop when no ACTIVE tokens remain: clears every
    /// runtime key for the instance and closes the durable row.
    pub async fn complete_instance(&self, id: Uuid) -> Result<ProcessInstanceRecord> {
        let mut instance = self.require_instance(id).await?;
        self.runtime.clear_instance(id).await?;
        let end = Utc::now();
        self.durable
            .update_instance_status(id, InstanceStatus::Completed, Some(end))
            .await?;
        self.log(id, ActivityType::InstanceCompleted, None, None)
            .await?;
        instance.status = InstanceStatus::Completed;
        instance.end_time = Some(end);
        info!(instance = %id, "instance completed");
        Ok(instance)
    }

    // ── Transactions ──

    pub async fn start_transaction(&self, instance_id: Uuid, transaction_id: &str) -> Result<()> {
        self.tokens
            .start_transaction(instance_id, transaction_id)
            .await
    }

    pub async fn complete_transaction(&self, instance_id: Uuid) -> Result<()> {
        self.tokens.complete_transaction(instance_id).await
    }

    // ── Activity log ──

    pub async fn log(
        &self,
        instance_id: Uuid,
        activity_type: ActivityType,
        node_id: Option<&str>,
        details: Option<serde_json::Value>,
    ) -> Result<()> {
        self.durable
            .append_activity(&ActivityLogRecord::new(
                instance_id,
                activity_type,
                node_id.map(str::to_string),
                details,
            ))
            .await
    }

    pub async fn read_activities(&self, instance_id: Uuid) -> Result<Vec<ActivityLogRecord>> {
        self.durable.read_activities(instance_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::{MemoryDurableStore, MemoryRuntimeStore};

    const LINEAR: &str = r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
      <process id="p">
        <startEvent id="Start_1" />
        <task id="Task_1" />
        <endEvent id="End_1" />
        <sequenceFlow id="F_1" sourceRef="Start_1" targetRef="Task_1" />
        <sequenceFlow id="F_2" sourceRef="Task_1" targetRef="End_1" />
      </process>
    </definitions>"#;

    async fn setup() -> (InstanceManager, Arc<MemoryRuntimeStore>, Uuid) {
        let durable = Arc::new(MemoryDurableStore::new());
        let runtime = Arc::new(MemoryRuntimeStore::new());
        let tokens = Arc::new(TokenManager::new(runtime.clone()));
        let manager = InstanceManager::new(durable.clone(), runtime.clone(), tokens);

        let def_id = Uuid::now_v7();
        durable
            .save_definition(&ProcessDefinitionRecord {
                id: def_id,
                name: "linear".into(),
                version: 1,
                bpmn_xml: LINEAR.into(),
                variable_definitions: vec![],
            })
            .await
            .unwrap();
        (manager, runtime, def_id)
    }

    #[tokio::test]
    async fn create_plants_initial_token() {
        let (manager, runtime, def_id) = setup().await;
        let instance = manager
            .create_instance(def_id, None, None, None)
            .await
            .unwrap();
        assert_eq!(instance.status, InstanceStatus::Running);
        let tokens = runtime.list_tokens(instance.id).await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].node_id, "Start_1");
    }

    #[tokio::test]
    async fn duplicate_create_is_idempotent() {
        let (manager, runtime, def_id) = setup().await;
        let id = Uuid::now_v7();
        let first = manager
            .create_instance(def_id, Some(id), None, None)
            .await
            .unwrap();
        let second = manager
            .create_instance(def_id, Some(id), None, None)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(runtime.list_tokens(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_definition_rejected() {
        let (manager, _, _) = setup().await;
        assert!(matches!(
            manager
                .create_instance(Uuid::now_v7(), None, None, None)
                .await,
            Err(EngineError::DefinitionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn suspend_resume_round_trip() {
        let (manager, runtime, def_id) = setup().await;
        let instance = manager
            .create_instance(def_id, None, None, None)
            .await
            .unwrap();

        let tokens_before = runtime.list_tokens(instance.id).await.unwrap();
        manager.suspend_instance(instance.id).await.unwrap();
        assert!(matches!(
            manager.suspend_instance(instance.id).await,
            Err(EngineError::InvalidStateTransition { .. })
        ));
        manager.resume_instance(instance.id).await.unwrap();
        // tokens are preserved across suspend/resume
        let tokens_after = runtime.list_tokens(instance.id).await.unwrap();
        assert_eq!(tokens_before.len(), tokens_after.len());
        assert_eq!(tokens_before[0].node_id, tokens_after[0].node_id);
    }

    #[tokio::test]
    async fn variable_scope_resolution() {
        let (manager, _, def_id) = setup().await;
        let instance = manager
            .create_instance(def_id, None, None, None)
            .await
            .unwrap();
        manager
            .set_variable(
                instance.id,
                None,
                "x",
                VariableValue::infer(serde_json::json!("global")),
            )
            .await
            .unwrap();
        manager
            .set_variable(
                instance.id,
                Some("Sub_1"),
                "x",
                VariableValue::infer(serde_json::json!("inner")),
            )
            .await
            .unwrap();

        let inner = manager
            .resolve_variable(instance.id, Some("Sub_1"), "x")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inner.value, serde_json::json!("inner"));

        // sibling scopes never leak
        let sibling = manager
            .resolve_variable(instance.id, Some("Sub_2"), "x")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sibling.value, serde_json::json!("global"));

        let absent = manager
            .resolve_variable(instance.id, None, "missing")
            .await
            .unwrap();
        assert!(absent.is_none());
    }

    #[tokio::test]
    async fn typed_variable_round_trip() {
        let (manager, _, def_id) = setup().await;
        let instance = manager
            .create_instance(def_id, None, None, None)
            .await
            .unwrap();
        manager
            .set_variable(
                instance.id,
                None,
                "flag",
                VariableValue::new(VariableType::Boolean, serde_json::json!(true)).unwrap(),
            )
            .await
            .unwrap();
        let vars = manager
            .get_instance_variables(instance.id, None)
            .await
            .unwrap();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].value.value_type, VariableType::Boolean);
        assert_eq!(vars[0].value.value, serde_json::json!(true));
    }

    #[tokio::test]
    async fn terminate_clears_runtime_state() {
        let (manager, runtime, def_id) = setup().await;
        let instance = manager
            .create_instance(def_id, None, None, None)
            .await
            .unwrap();
        let done = manager.terminate_instance(instance.id).await.unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
        assert!(done.end_time.is_some());
        assert!(runtime.list_tokens(instance.id).await.unwrap().is_empty());
    }
}
