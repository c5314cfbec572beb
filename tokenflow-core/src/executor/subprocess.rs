//! Subprocess scope entry/exit and call activities.
//!
//! Subprocess entry appends a scope segment and moves the token to the
//! body's start event; exit strips the segment and continues from the
//! subprocess's outgoing flow. Call activities mint a fresh instance with
//! its own id, copy input variables in, and park the parent token until the
//! child reaches an end event; completion copies output variables back and
//! wakes the parent through a data marker the parent's next dispatch
//! consumes.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bpmn::{
    self, CallActivityNode, EventDefinition, EventKind, EventNode, ProcessGraph, SubProcessNode,
};
use crate::error::{EngineError, Result};
use crate::executor::{event::event_name, task, ExecCtx, FollowUp};
use crate::store::TokenTimer;
use crate::timer::parse_timer;
use crate::types::{
    parse_instance_segment, pop_scope, push_scope, scope_leaf, ActivityType, InstanceStatus,
    ProcessInstanceRecord, Subscription, SubscriptionKind, Token, TokenState,
};

/// Data marker set on the parent token when its called process completes.
const CALL_COMPLETED: &str = "call_activity_completed";
/// Data marker carrying the child's error code when it fails.
const CALL_ERROR: &str = "call_activity_error";

// ─── Subprocess ───────────────────────────────────────────────

pub(crate) async fn enter(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    sp: &SubProcessNode,
) -> Result<Vec<FollowUp>> {
    let start = sp.start_event().ok_or_else(|| {
        EngineError::InvalidBpmn(format!("subprocess '{}' has no start event", sp.id))
    })?;

    if sp.transactional {
        ctx.tokens
            .start_transaction(token.instance_id, &sp.id)
            .await?;
    }
    register_boundary_watchers(ctx, graph, token.instance_id, &sp.id).await?;

    // multi-instance bodies already run inside their own `_instance_` scope;
    // plain entry pushes the subprocess id
    let already_instanced = token
        .scope_id
        .as_deref()
        .map(scope_leaf)
        .and_then(parse_instance_segment)
        .map(|(a, _)| a == sp.id)
        .unwrap_or(false);
    let scope = if already_instanced {
        token.scope_id.clone()
    } else {
        Some(push_scope(token.scope_id.as_deref(), &sp.id))
    };

    let mut inner = token.copied_to(&start.id);
    inner.scope_id = scope;
    ctx.runtime
        .swap_tokens(
            token.instance_id,
            &[(token.node_id.clone(), token.scope_id.clone())],
            std::slice::from_ref(&inner),
        )
        .await?;
    debug!(subprocess = %sp.id, scope = ?inner.scope_id, "entered subprocess");
    Ok(vec![])
}

/// Inner end event reached with this subprocess as the innermost scope.
pub(crate) async fn exit(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    sp: &SubProcessNode,
) -> Result<Vec<FollowUp>> {
    let scope = token.scope_id.clone();
    ctx.runtime
        .swap_tokens(
            token.instance_id,
            &[(token.node_id.clone(), scope.clone())],
            &[],
        )
        .await?;

    // parallel branches inside the body: the last one out closes the scope
    let remaining = ctx
        .runtime
        .list_tokens(token.instance_id)
        .await?
        .into_iter()
        .filter(|t| t.scope_id == scope)
        .count();
    if remaining > 0 {
        debug!(subprocess = %sp.id, remaining, "subprocess branch finished; others still inside");
        return Ok(vec![]);
    }

    remove_boundary_watchers(ctx, graph, token.instance_id, &sp.id).await?;
    if sp.transactional {
        ctx.tokens.complete_transaction(token.instance_id).await?;
    }
    task::finish_activity(ctx, graph, token, &sp.id).await?;

    let parent_scope = scope.as_deref().and_then(pop_scope);
    match graph.outgoing_flows(&sp.id).first() {
        Some(flow) => {
            let mut successor = token.copied_to(&flow.target_ref);
            successor.scope_id = parent_scope;
            ctx.runtime.add_token(&successor).await?;
            debug!(subprocess = %sp.id, to = %successor.node_id, "exited subprocess");
        }
        None => warn!(subprocess = %sp.id, "subprocess has no outgoing flow"),
    }
    Ok(vec![])
}

// ─── Boundary watchers ────────────────────────────────────────

/// Register message/signal subscriptions and timers for the boundary events
/// attached to an activity. Resolved when the trigger fires or the activity
/// completes.
pub(crate) async fn register_boundary_watchers(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    instance_id: Uuid,
    activity_id: &str,
) -> Result<()> {
    for boundary in graph.boundary_events_for(activity_id) {
        match boundary.definition {
            Some(EventDefinition::Message) | Some(EventDefinition::Signal) => {
                let kind = if boundary.definition == Some(EventDefinition::Signal) {
                    SubscriptionKind::Signal
                } else {
                    SubscriptionKind::Message
                };
                ctx.runtime
                    .put_subscription(&Subscription {
                        kind,
                        name: event_name(boundary),
                        instance_id,
                        node_id: boundary.id.clone(),
                        correlation_value: None,
                    })
                    .await?;
            }
            Some(EventDefinition::Timer) => {
                if let Some(def) = &boundary.timer_definition {
                    let parsed = parse_timer(def)?;
                    ctx.runtime
                        .put_token_timer(&TokenTimer {
                            instance_id,
                            node_id: boundary.id.clone(),
                            due: parsed.first_fire(Utc::now()),
                        })
                        .await?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

pub(crate) async fn remove_boundary_watchers(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    instance_id: Uuid,
    activity_id: &str,
) -> Result<()> {
    for boundary in graph.boundary_events_for(activity_id) {
        match boundary.definition {
            Some(EventDefinition::Message) | Some(EventDefinition::Signal) => {
                let kind = if boundary.definition == Some(EventDefinition::Signal) {
                    SubscriptionKind::Signal
                } else {
                    SubscriptionKind::Message
                };
                ctx.runtime
                    .remove_subscription(kind, &event_name(boundary), instance_id, &boundary.id)
                    .await?;
            }
            Some(EventDefinition::Timer) => {
                ctx.runtime
                    .remove_token_timer(instance_id, &boundary.id)
                    .await?;
            }
            _ => {}
        }
    }
    Ok(())
}

// ─── Call activities ──────────────────────────────────────────

pub(crate) async fn execute_call_activity(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    ca: &CallActivityNode,
) -> Result<Vec<FollowUp>> {
    // child finished: clean up watchers and continue along the flow
    if token.data.contains_key(CALL_COMPLETED) {
        remove_boundary_watchers(ctx, graph, token.instance_id, &ca.id).await?;
        task::finish_activity(ctx, graph, token, &ca.id).await?;
        let mut resumed = token.clone();
        resumed.data.remove(CALL_COMPLETED);
        match graph.outgoing_flows(&ca.id).first() {
            Some(flow) => {
                let target = flow.target_ref.clone();
                ctx.tokens.move_token(&resumed, &target).await?;
            }
            None => warn!(activity = %ca.id, "call activity has no outgoing flow"),
        }
        return Ok(vec![]);
    }

    // child failed: route to the error boundary event, or fail the instance
    if let Some(code) = token.data.get(CALL_ERROR).cloned() {
        remove_boundary_watchers(ctx, graph, token.instance_id, &ca.id).await?;
        let error_code = code.as_str().map(str::to_string);
        let boundary = graph
            .boundary_events_for(&ca.id)
            .into_iter()
            .find(|b| b.definition == Some(EventDefinition::Error))
            .cloned();
        match boundary {
            Some(b) => {
                let mut at_boundary = token.copied_to(&b.id);
                at_boundary.data.remove(CALL_ERROR);
                at_boundary
                    .data
                    .insert("error_code".into(), code);
                ctx.runtime
                    .swap_tokens(
                        token.instance_id,
                        &[(token.node_id.clone(), token.scope_id.clone())],
                        std::slice::from_ref(&at_boundary),
                    )
                    .await?;
                debug!(activity = %ca.id, boundary = %b.id, "child error routed to boundary event");
                Ok(vec![])
            }
            None => Err(EngineError::CalledProcessFailed {
                activity: ca.id.clone(),
                error_code,
            }),
        }
    } else {
        start_call_activity(ctx, graph, token, ca).await
    }
}

async fn start_call_activity(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    ca: &CallActivityNode,
) -> Result<Vec<FollowUp>> {
    let called = token
        .data
        .get("called_process_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| ca.called_element.clone())
        .ok_or_else(|| {
            EngineError::InvalidBpmn(format!("call activity '{}' names no called process", ca.id))
        })?;
    let definition = resolve_definition(ctx, &called).await?;

    let child_id = Uuid::now_v7();
    ctx.durable
        .save_instance(&ProcessInstanceRecord {
            id: child_id,
            definition_id: definition.id,
            status: InstanceStatus::Running,
            start_time: Utc::now(),
            end_time: None,
        })
        .await?;
    ctx.instances
        .log(child_id, ActivityType::InstanceCreated, None, None)
        .await?;

    // input variable mapping: {child_var: parent_var}
    if let Some(Value::Object(input_vars)) = token.data.get("input_vars") {
        for (child_var, parent_var) in input_vars {
            let Some(parent_name) = parent_var.as_str() else {
                continue;
            };
            if let Some(value) = ctx
                .instances
                .resolve_variable(token.instance_id, token.scope_id.as_deref(), parent_name)
                .await?
            {
                ctx.instances
                    .set_variable(child_id, None, child_var, value)
                    .await?;
            }
        }
    }

    let child_graph = bpmn::parse(&definition.bpmn_xml)?;
    let start = pick_start_event(&child_graph)?;
    let mut child_token = Token::new(child_id, start);
    child_token.parent_instance_id = Some(token.instance_id);
    child_token.parent_activity_id = Some(ca.id.clone());
    // the completion side needs the output mapping; carry it on the child
    if let Some(output_vars) = token.data.get("output_vars") {
        child_token
            .data
            .insert("output_vars".into(), output_vars.clone());
    }
    ctx.runtime.add_token(&child_token).await?;

    ctx.tokens
        .update_state(token, TokenState::Waiting, None)
        .await?;
    register_boundary_watchers(ctx, graph, token.instance_id, &ca.id).await?;
    debug!(activity = %ca.id, child = %child_id, definition = %definition.id, "call activity started");
    Ok(vec![FollowUp::RunInstance(child_id)])
}

async fn resolve_definition(
    ctx: &ExecCtx,
    called: &str,
) -> Result<crate::types::ProcessDefinitionRecord> {
    if let Ok(id) = Uuid::parse_str(called) {
        return ctx
            .durable
            .load_definition(id)
            .await?
            .ok_or(EngineError::DefinitionNotFound(id));
    }
    ctx.durable
        .list_definitions()
        .await?
        .into_iter()
        .find(|d| d.name == called)
        .ok_or_else(|| EngineError::InvalidBpmn(format!("no process definition named '{called}'")))
}

fn pick_start_event(graph: &ProcessGraph) -> Result<&str> {
    let starts = graph.start_events();
    starts
        .iter()
        .find(|e| e.definition != Some(EventDefinition::Timer))
        .or_else(|| starts.first())
        .map(|e| e.id.as_str())
        .ok_or(EngineError::MissingStartEvent)
}

/// Child instance reached a plain end event: copy output variables back,
/// close the child, wake the parent.
pub(crate) async fn complete_call_activity(
    ctx: &ExecCtx,
    token: &Token,
) -> Result<Vec<FollowUp>> {
    let parent_id = token.parent_instance_id.ok_or_else(|| {
        EngineError::InvalidBpmn(format!(
            "token at '{}' is not from a call activity",
            token.node_id
        ))
    })?;
    let parent_activity = token.parent_activity_id.clone().unwrap_or_default();

    // output variable mapping: {parent_var: child_var}
    if let Some(Value::Object(output_vars)) = token.data.get("output_vars") {
        for (parent_var, child_var) in output_vars {
            let Some(child_name) = child_var.as_str() else {
                continue;
            };
            if let Some(value) = ctx
                .instances
                .resolve_variable(token.instance_id, token.scope_id.as_deref(), child_name)
                .await?
            {
                ctx.instances
                    .set_variable(parent_id, None, parent_var, value)
                    .await?;
            }
        }
    }

    // close the child: durable record, log, and every runtime key
    ctx.runtime.clear_instance(token.instance_id).await?;
    ctx.durable
        .update_instance_status(token.instance_id, InstanceStatus::Completed, Some(Utc::now()))
        .await?;
    ctx.instances
        .log(token.instance_id, ActivityType::InstanceCompleted, None, None)
        .await?;

    wake_parent(ctx, parent_id, &parent_activity, CALL_COMPLETED, json!(true)).await?;
    debug!(child = %token.instance_id, parent = %parent_id, "call activity completed");
    Ok(vec![FollowUp::RunInstance(parent_id)])
}

/// Child instance reached an error end event: fail the child and hand the
/// error code to the parent's call activity.
pub(crate) async fn propagate_child_error(
    ctx: &ExecCtx,
    token: &Token,
    event: &EventNode,
) -> Result<Vec<FollowUp>> {
    debug_assert_eq!(event.kind, EventKind::End);
    let parent_id = token.parent_instance_id.ok_or_else(|| {
        EngineError::InvalidBpmn(format!(
            "token at '{}' is not from a call activity",
            token.node_id
        ))
    })?;
    let parent_activity = token.parent_activity_id.clone().unwrap_or_default();
    let code = event
        .error_code
        .clone()
        .or_else(|| {
            token
                .data
                .get("error_code")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "error".to_string());

    ctx.runtime.clear_instance(token.instance_id).await?;
    ctx.durable
        .update_instance_status(token.instance_id, InstanceStatus::Error, None)
        .await?;
    ctx.instances
        .log(
            token.instance_id,
            ActivityType::InstanceError,
            Some(&event.id),
            Some(json!({ "error_code": code })),
        )
        .await?;

    wake_parent(ctx, parent_id, &parent_activity, CALL_ERROR, json!(code)).await?;
    debug!(child = %token.instance_id, parent = %parent_id, code, "child error propagated");
    Ok(vec![FollowUp::RunInstance(parent_id)])
}

/// Reactivate the parent's waiting call-activity token with a marker its
/// next dispatch consumes.
async fn wake_parent(
    ctx: &ExecCtx,
    parent_id: Uuid,
    parent_activity: &str,
    marker: &str,
    value: Value,
) -> Result<()> {
    let parent_tokens = ctx.runtime.list_tokens(parent_id).await?;
    let Some(waiting) = parent_tokens
        .iter()
        .find(|t| t.node_id == parent_activity && t.state == TokenState::Waiting)
    else {
        warn!(parent = %parent_id, activity = parent_activity, "no waiting parent token to wake");
        return Ok(());
    };
    let mut entries = BTreeMap::new();
    entries.insert(marker.to_string(), value);
    ctx.runtime
        .merge_token_data(
            parent_id,
            &waiting.node_id,
            waiting.scope_id.as_deref(),
            &entries,
        )
        .await?;
    ctx.runtime
        .update_token_state_by_id(parent_id, waiting.id, TokenState::Active)
        .await
}
