//! The top-level engine facade: wires stores, token manager, instance
//! manager, and node executors together, and owns the per-instance run loop.

use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bpmn::{self, detect_cycles, EventKind, Node, ProcessGraph};
use crate::error::{EngineError, Result};
use crate::executor::{self, ExecCtx, FollowUp};
use crate::expr::ExpressionEvaluator;
use crate::instance::InstanceManager;
use crate::service::ServiceTaskRegistry;
use crate::store::{DurableStore, RuntimeStore};
use crate::token_manager::TokenManager;
use crate::types::*;

/// Per-call cap on run loop iterations. Cycle detection rejects loops up
/// front; this guards against modeling bugs that slip past it.
pub const MAX_ITERATIONS: usize = 1000;

/// TTL on `lock:process:{instance}`, refreshed between iterations.
pub const LOCK_TTL: Duration = Duration::from_secs(30);

pub struct ProcessEngine {
    durable: Arc<dyn DurableStore>,
    runtime: Arc<dyn RuntimeStore>,
    tokens: Arc<TokenManager>,
    instances: Arc<InstanceManager>,
    registry: Arc<ServiceTaskRegistry>,
    evaluator: ExpressionEvaluator,
    // parse results cached per (definition, version); definitions are
    // immutable per version
    graphs: RwLock<HashMap<(Uuid, i32), Arc<ProcessGraph>>>,
}

impl ProcessEngine {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        runtime: Arc<dyn RuntimeStore>,
        registry: Arc<ServiceTaskRegistry>,
    ) -> Self {
        let tokens = Arc::new(TokenManager::new(runtime.clone()));
        let instances = Arc::new(InstanceManager::new(
            durable.clone(),
            runtime.clone(),
            tokens.clone(),
        ));
        Self {
            durable,
            runtime,
            tokens,
            instances,
            registry,
            evaluator: ExpressionEvaluator::new(),
            graphs: RwLock::new(HashMap::new()),
        }
    }

    pub fn instances(&self) -> &InstanceManager {
        &self.instances
    }

    pub fn durable(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeStore> {
        &self.runtime
    }

    /// Validate and store a process definition.
    pub async fn deploy_definition(&self, definition: &ProcessDefinitionRecord) -> Result<()> {
        let graph = bpmn::parse(&definition.bpmn_xml)?;
        detect_cycles(&graph)?;
        self.durable.save_definition(definition).await?;
        self.graphs
            .write()
            .await
            .insert((definition.id, definition.version), Arc::new(graph));
        info!(definition = %definition.id, name = %definition.name, "definition deployed");
        Ok(())
    }

    async fn graph_for_instance(&self, instance: &ProcessInstanceRecord) -> Result<Arc<ProcessGraph>> {
        let definition = self
            .durable
            .load_definition(instance.definition_id)
            .await?
            .ok_or(EngineError::DefinitionNotFound(instance.definition_id))?;
        let key = (definition.id, definition.version);
        if let Some(graph) = self.graphs.read().await.get(&key) {
            return Ok(graph.clone());
        }
        let graph = bpmn::parse(&definition.bpmn_xml)?;
        detect_cycles(&graph)?;
        let graph = Arc::new(graph);
        self.graphs.write().await.insert(key, graph.clone());
        Ok(graph)
    }

    fn exec_ctx(&self) -> ExecCtx {
        ExecCtx {
            durable: self.durable.clone(),
            runtime: self.runtime.clone(),
            tokens: self.tokens.clone(),
            instances: self.instances.clone(),
            registry: self.registry.clone(),
            evaluator: self.evaluator,
        }
    }

    // ── RPC surface ──

    /// Create an instance and drive it until every token is parked or gone.
    pub async fn create_instance(
        &self,
        definition_id: Uuid,
        instance_id: Option<Uuid>,
        variables: Option<BTreeMap<String, VariableValue>>,
        start_event_id: Option<&str>,
    ) -> Result<ProcessInstanceRecord> {
        let instance = self
            .instances
            .create_instance(definition_id, instance_id, variables, start_event_id)
            .await?;
        self.run_instance(instance.id).await?;
        self.instances.get_instance(instance.id).await
    }

    pub async fn suspend_instance(&self, id: Uuid) -> Result<ProcessInstanceRecord> {
        self.instances.suspend_instance(id).await
    }

    /// Resume re-enters the run loop from the retained tokens.
    pub async fn resume_instance(&self, id: Uuid) -> Result<ProcessInstanceRecord> {
        let instance = self.instances.resume_instance(id).await?;
        self.run_instance(id).await?;
        Ok(instance)
    }

    pub async fn terminate_instance(&self, id: Uuid) -> Result<ProcessInstanceRecord> {
        self.instances.terminate_instance(id).await
    }

    pub async fn get_instance(&self, id: Uuid) -> Result<ProcessInstanceRecord> {
        self.instances.get_instance(id).await
    }

    pub async fn list_instances(&self) -> Result<Vec<ProcessInstanceRecord>> {
        self.instances.list_instances().await
    }

    pub async fn list_variables(
        &self,
        id: Uuid,
        scope_id: Option<&str>,
    ) -> Result<Vec<VariableRecord>> {
        self.instances.get_instance_variables(id, scope_id).await
    }

    // ── Run loop ──

    /// Drive an instance (and any instances its execution spawns or wakes)
    /// until no ACTIVE token remains anywhere.
    pub async fn run_instance(&self, instance_id: Uuid) -> Result<()> {
        let mut queue: VecDeque<Uuid> = VecDeque::from([instance_id]);
        while let Some(id) = queue.pop_front() {
            let follow_ups = self.run_single(id).await?;
            for follow_up in follow_ups {
                match follow_up {
                    FollowUp::RunInstance(other) => queue.push_back(other),
                    FollowUp::Publish {
                        kind,
                        name,
                        payload,
                    } => {
                        let woken = self.deliver(kind, &name, None, None, payload).await?;
                        queue.extend(woken);
                    }
                }
            }
        }
        Ok(())
    }

    /// One instance's batch: hold the lock, drain ACTIVE tokens through the
    /// executors, complete the instance when none remain.
    async fn run_single(&self, instance_id: Uuid) -> Result<Vec<FollowUp>> {
        let Some(instance) = self.durable.load_instance(instance_id).await? else {
            debug!(instance = %instance_id, "run skipped; instance gone");
            return Ok(vec![]);
        };
        if instance.status != InstanceStatus::Running {
            debug!(instance = %instance_id, status = %instance.status, "run skipped; not RUNNING");
            return Ok(vec![]);
        }
        if !self.runtime.acquire_lock(instance_id, LOCK_TTL).await? {
            debug!(instance = %instance_id, "run skipped; lock held elsewhere");
            return Ok(vec![]);
        }

        let result = self.run_locked(&instance).await;
        self.runtime.release_lock(instance_id).await?;
        result
    }

    async fn run_locked(&self, instance: &ProcessInstanceRecord) -> Result<Vec<FollowUp>> {
        let graph = self.graph_for_instance(instance).await?;
        let ctx = self.exec_ctx();
        let mut follow_ups = Vec::new();

        let mut iterations = 0usize;
        loop {
            if iterations >= MAX_ITERATIONS {
                let err = EngineError::ExecutionLimit(MAX_ITERATIONS);
                error!(instance = %instance.id, "{err}");
                self.instances
                    .set_error_state(instance.id, Some(&err.to_string()))
                    .await?;
                return Ok(follow_ups);
            }
            iterations += 1;
            self.runtime.refresh_lock(instance.id, LOCK_TTL).await?;

            let tokens = self.runtime.list_tokens(instance.id).await?;
            let runnable: Vec<Token> = tokens
                .into_iter()
                .filter(|t| matches!(t.state, TokenState::Active | TokenState::Compensation))
                .collect();
            if runnable.is_empty() {
                break;
            }

            for token in &runnable {
                // skip snapshot entries consumed earlier in this batch
                if self
                    .runtime
                    .get_token_by_id(instance.id, token.id)
                    .await?
                    .is_none()
                {
                    continue;
                }
                self.instances
                    .log(
                        instance.id,
                        ActivityType::NodeEntered,
                        Some(&token.node_id),
                        None,
                    )
                    .await?;
                match executor::dispatch(&ctx, &graph, token).await {
                    Ok(mut more) => {
                        follow_ups.append(&mut more);
                        self.instances
                            .log(
                                instance.id,
                                ActivityType::NodeCompleted,
                                Some(&token.node_id),
                                None,
                            )
                            .await?;
                    }
                    Err(e) if e.is_token_state() => {
                        // concurrent terminate or a token consumed by a join
                        // merge; benign either way
                        debug!(instance = %instance.id, node = %token.node_id, "stale token: {e}");
                    }
                    Err(e) => {
                        error!(instance = %instance.id, node = %token.node_id, "executor failed: {e}");
                        self.instances
                            .log(
                                instance.id,
                                ActivityType::InstanceError,
                                Some(&token.node_id),
                                Some(json!({ "error": e.to_string() })),
                            )
                            .await?;
                        self.instances
                            .set_error_state(instance.id, Some(&e.to_string()))
                            .await?;
                        // the failed token is retained for resume
                        return Ok(follow_ups);
                    }
                }
                tokio::task::yield_now().await;
            }
        }

        // zero live tokens on a still-running instance means completion
        let remaining = self.runtime.list_tokens(instance.id).await?;
        if remaining.is_empty() {
            if let Some(current) = self.durable.load_instance(instance.id).await? {
                if current.status == InstanceStatus::Running {
                    self.instances.complete_instance(instance.id).await?;
                }
            }
        }
        Ok(follow_ups)
    }

    // ── Message/signal publication ──

    /// Publish a message: delivered to the first matching subscription.
    pub async fn publish_message(
        &self,
        name: &str,
        instance_id: Option<Uuid>,
        correlation: Option<&str>,
        payload: Option<Value>,
    ) -> Result<()> {
        let woken = self
            .deliver(SubscriptionKind::Message, name, instance_id, correlation, payload)
            .await?;
        for id in woken {
            self.run_instance(id).await?;
        }
        Ok(())
    }

    /// Publish a signal: broadcast to every matching subscription.
    pub async fn publish_signal(
        &self,
        name: &str,
        instance_id: Option<Uuid>,
        payload: Option<Value>,
    ) -> Result<()> {
        let woken = self
            .deliver(SubscriptionKind::Signal, name, instance_id, None, payload)
            .await?;
        for id in woken {
            self.run_instance(id).await?;
        }
        Ok(())
    }

    /// Resolve subscriptions for a publish and wake their tokens. Returns
    /// the instances that need a run-loop pass.
    async fn deliver(
        &self,
        kind: SubscriptionKind,
        name: &str,
        instance_filter: Option<Uuid>,
        correlation: Option<&str>,
        payload: Option<Value>,
    ) -> Result<Vec<Uuid>> {
        let mut matches: Vec<Subscription> = self
            .runtime
            .find_subscriptions(kind, name)
            .await?
            .into_iter()
            .filter(|s| instance_filter.map(|id| s.instance_id == id).unwrap_or(true))
            .filter(|s| match (&s.correlation_value, correlation) {
                (Some(expected), Some(given)) => expected == given,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .collect();
        if kind == SubscriptionKind::Message {
            matches.truncate(1);
        }
        if matches.is_empty() {
            debug!(%kind, name, "publish matched no subscriptions");
            return Ok(vec![]);
        }

        let payload_key = match kind {
            SubscriptionKind::Message => "message_payload",
            SubscriptionKind::Signal => "signal_payload",
        };
        let mut woken = Vec::new();
        for sub in matches {
            let Some(instance) = self.durable.load_instance(sub.instance_id).await? else {
                warn!(instance = %sub.instance_id, "subscription for missing instance; dropping");
                self.runtime
                    .remove_subscription(kind, name, sub.instance_id, &sub.node_id)
                    .await?;
                continue;
            };
            let graph = self.graph_for_instance(&instance).await?;
            self.resolve_subscription(&graph, &sub, payload_key, payload.clone())
                .await?;
            self.runtime
                .remove_subscription(kind, name, sub.instance_id, &sub.node_id)
                .await?;
            woken.push(sub.instance_id);
        }
        Ok(woken)
    }

    /// Wake the token(s) behind one subscription: intermediate catch events
    /// resume in place; boundary events cancel (interrupting) or keep
    /// (non-interrupting) the attached activity's token and spawn a token at
    /// the boundary node.
    async fn resolve_subscription(
        &self,
        graph: &ProcessGraph,
        sub: &Subscription,
        payload_key: &str,
        payload: Option<Value>,
    ) -> Result<()> {
        let Some(Node::Event(event)) = graph.find_node(&sub.node_id) else {
            warn!(node = %sub.node_id, "subscription node is not an event");
            return Ok(());
        };
        let payload = payload.unwrap_or(Value::Null);

        if event.kind == EventKind::Boundary {
            let Some(attached_id) = event.attached_to.clone() else {
                return Ok(());
            };
            let tokens = self.runtime.list_tokens(sub.instance_id).await?;
            let attached = tokens.iter().find(|t| t.node_id == attached_id);

            let mut boundary_token = match attached {
                Some(t) => t.copied_to(&event.id),
                None => Token::new(sub.instance_id, &event.id),
            };
            boundary_token
                .data
                .insert(payload_key.to_string(), payload);

            if event.interrupting {
                match attached {
                    Some(t) => {
                        // drop the activity token and everything inside its scope
                        let inner_scope = push_scope(t.scope_id.as_deref(), &attached_id);
                        self.runtime
                            .swap_tokens(
                                sub.instance_id,
                                &[(t.node_id.clone(), t.scope_id.clone())],
                                &[],
                            )
                            .await?;
                        self.runtime
                            .clear_scope_tokens(sub.instance_id, Some(&inner_scope))
                            .await?;
                    }
                    // subprocess bodies hold no token at the activity node
                    // itself; cancel by scope
                    None => {
                        self.runtime
                            .clear_scope_tokens(sub.instance_id, Some(&attached_id))
                            .await?;
                    }
                }
                debug!(boundary = %event.id, activity = %attached_id, "interrupting boundary cancelled activity");
            }
            self.runtime.add_token(&boundary_token).await?;
            return Ok(());
        }

        // intermediate catch: payload into the parked token, then ACTIVE
        let tokens = self.runtime.list_tokens(sub.instance_id).await?;
        let Some(parked) = tokens
            .iter()
            .find(|t| t.node_id == sub.node_id && t.state == TokenState::Waiting)
        else {
            warn!(node = %sub.node_id, "no parked token behind subscription");
            return Ok(());
        };
        let mut entries = BTreeMap::new();
        entries.insert(payload_key.to_string(), payload);
        self.runtime
            .merge_token_data(
                sub.instance_id,
                &parked.node_id,
                parked.scope_id.as_deref(),
                &entries,
            )
            .await?;
        self.runtime
            .update_token_state_by_id(sub.instance_id, parked.id, TokenState::Active)
            .await?;
        debug!(node = %sub.node_id, "subscription resolved; token resumed");
        Ok(())
    }

    // ── Timer resume ──

    /// A token-level timer (intermediate or boundary) fired.
    pub async fn fire_token_timer(&self, instance_id: Uuid, node_id: &str) -> Result<()> {
        self.runtime.remove_token_timer(instance_id, node_id).await?;
        let Some(instance) = self.durable.load_instance(instance_id).await? else {
            return Ok(());
        };
        let graph = self.graph_for_instance(&instance).await?;
        let Some(Node::Event(event)) = graph.find_node(node_id) else {
            return Ok(());
        };

        if event.kind == EventKind::Boundary {
            let sub = Subscription {
                kind: SubscriptionKind::Message,
                name: String::new(),
                instance_id,
                node_id: node_id.to_string(),
                correlation_value: None,
            };
            self.resolve_subscription(&graph, &sub, "timer_fired", Some(json!(true)))
                .await?;
        } else {
            let tokens = self.runtime.list_tokens(instance_id).await?;
            let Some(parked) = tokens
                .iter()
                .find(|t| t.node_id == node_id && t.state == TokenState::Waiting)
            else {
                debug!(node = node_id, "timer fired but no parked token; ignoring");
                return Ok(());
            };
            let mut entries = BTreeMap::new();
            entries.insert("timer_fired".to_string(), json!(true));
            self.runtime
                .merge_token_data(
                    instance_id,
                    &parked.node_id,
                    parked.scope_id.as_deref(),
                    &entries,
                )
                .await?;
            self.runtime
                .update_token_state_by_id(instance_id, parked.id, TokenState::Active)
                .await?;
        }
        self.run_instance(instance_id).await
    }
}
