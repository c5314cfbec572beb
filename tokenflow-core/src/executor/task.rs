//! Script and service task execution.

use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::bpmn::{EventDefinition, EventKind, ProcessGraph, TaskNode};
use crate::error::{EngineError, Result};
use crate::executor::{multi_instance, ExecCtx, FollowUp};
use crate::script::run_script;
use crate::service::ServiceContext;
use crate::types::{
    parse_instance_segment, scope_leaf, ActivityType, CompensationEntry, Token, TokenState,
    TransactionStatus, VariableValue,
};

pub(crate) async fn execute(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    task: &TaskNode,
) -> Result<Vec<FollowUp>> {
    run_work(ctx, token, task).await?;

    finish_activity(ctx, graph, token, &task.id).await?;

    // Multi-instance instances complete through the multi-instance manager
    // rather than the task's outgoing flow.
    if let Some(mi) = &task.multi_instance {
        let is_instance = token
            .scope_id
            .as_deref()
            .map(scope_leaf)
            .and_then(parse_instance_segment)
            .map(|(activity, _)| activity == task.id)
            .unwrap_or(false);
        if is_instance {
            return multi_instance::complete_instance(ctx, graph, token, &task.id, mi).await;
        }
    }

    take_single_outgoing(ctx, graph, token, &task.id).await?;
    Ok(vec![])
}

/// The task's work itself (script or service call) without any token
/// movement. Compensation handlers reuse this.
pub(crate) async fn run_work(ctx: &ExecCtx, token: &Token, task: &TaskNode) -> Result<()> {
    if let Some(service) = &task.service {
        run_service_task(ctx, token, task, service).await?;
    } else if let Some(script) = &task.script {
        run_script_task(ctx, token, task, script).await?;
    }
    Ok(())
}

/// Move along the task's single outgoing flow. Zero flows parks the token
/// with a warning; more than one requires an explicit gateway.
pub(crate) async fn take_single_outgoing(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    node_id: &str,
) -> Result<()> {
    let outgoing = graph.outgoing_flows(node_id);
    match outgoing.as_slice() {
        [] => {
            warn!(node = node_id, "task has no outgoing flows; token parked");
            ctx.tokens
                .update_state(token, TokenState::Waiting, None)
                .await
        }
        [flow] => {
            let target = flow.target_ref.clone();
            ctx.tokens.move_token(token, &target).await?;
            Ok(())
        }
        _ => Err(EngineError::InvalidBpmn(format!(
            "task '{node_id}' has multiple outgoing flows; branch with an explicit gateway"
        ))),
    }
}

/// Post-work bookkeeping shared by every activity kind: compensation handler
/// registration and transaction participation.
pub(crate) async fn finish_activity(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    activity_id: &str,
) -> Result<()> {
    for boundary in graph.boundary_events_for(activity_id) {
        if boundary.kind == EventKind::Boundary
            && boundary.definition == Some(EventDefinition::Compensation)
        {
            let Some(handler) = graph
                .outgoing_flows(&boundary.id)
                .first()
                .map(|f| f.target_ref.clone())
            else {
                warn!(
                    boundary = %boundary.id,
                    "compensation boundary event has no handler flow"
                );
                continue;
            };
            ctx.runtime
                .push_compensation(
                    token.instance_id,
                    &CompensationEntry {
                        activity_id: activity_id.to_string(),
                        handler_id: handler,
                        boundary_event_id: boundary.id.clone(),
                        activity_data: token.data.clone(),
                    },
                )
                .await?;
            debug!(activity = activity_id, "compensation handler registered");
        }
    }

    if let Some(mut txn) = ctx.runtime.get_transaction(token.instance_id).await? {
        if txn.status == TransactionStatus::Active {
            txn.completed_activities.insert(activity_id.to_string());
            ctx.runtime.put_transaction(&txn).await?;
        }
    }
    Ok(())
}

// ─── Script tasks ─────────────────────────────────────────────

async fn run_script_task(
    ctx: &ExecCtx,
    token: &Token,
    task: &TaskNode,
    script: &str,
) -> Result<()> {
    let mut script_ctx = ctx
        .instances
        .variables_context(token.instance_id, token.scope_id.as_deref())
        .await?;
    // token-carried execution data (item, index, payloads) is visible too
    for (k, v) in &token.data {
        script_ctx.insert(k.clone(), v.clone());
    }

    let outcome = run_script(script, &script_ctx).map_err(|e| {
        error!(task = %task.id, error = %e, "script execution failed");
        EngineError::Script {
            task_id: task.id.clone(),
            message: e.to_string(),
        }
    })?;

    for (name, value) in outcome.writes {
        ctx.instances
            .set_variable(
                token.instance_id,
                token.scope_id.as_deref(),
                &name,
                VariableValue::infer(value),
            )
            .await?;
    }
    if let Some(result) = outcome.result {
        ctx.instances
            .set_variable(
                token.instance_id,
                token.scope_id.as_deref(),
                &format!("{}_result", task.id),
                VariableValue::infer(result),
            )
            .await?;
    }
    Ok(())
}

// ─── Service tasks ────────────────────────────────────────────

async fn run_service_task(
    ctx: &ExecCtx,
    token: &Token,
    task: &TaskNode,
    config: &crate::bpmn::ServiceTaskConfig,
) -> Result<()> {
    let Some(implementation) = ctx.registry.get(&config.task_name) else {
        let err = EngineError::ServiceTaskNotFound(config.task_name.clone());
        log_service_outcome(ctx, token, task, config, "ERROR", json!(err.to_string())).await?;
        return Err(err);
    };

    let variables = ctx
        .instances
        .variables_snapshot(token.instance_id, token.scope_id.as_deref())
        .await?;
    let context = ServiceContext {
        token,
        variables,
        task_id: &task.id,
        instance_id: token.instance_id,
    };

    match implementation.execute(context, &config.properties).await {
        Ok(result) => {
            log_service_outcome(ctx, token, task, config, "COMPLETED", result.clone()).await?;
            if let Some(mapping) = config.properties.get("output_mapping") {
                apply_output_mapping(ctx, token, mapping, &result).await?;
            }
            Ok(())
        }
        Err(source) => {
            error!(task = %task.id, service = %config.task_name, error = %source, "service task failed");
            log_service_outcome(ctx, token, task, config, "ERROR", json!(source.to_string()))
                .await?;
            Err(EngineError::Service {
                task_name: config.task_name.clone(),
                source,
            })
        }
    }
}

async fn log_service_outcome(
    ctx: &ExecCtx,
    token: &Token,
    task: &TaskNode,
    config: &crate::bpmn::ServiceTaskConfig,
    status: &str,
    detail: Value,
) -> Result<()> {
    ctx.instances
        .log(
            token.instance_id,
            ActivityType::ServiceTaskExecuted,
            Some(&task.id),
            Some(json!({
                "service_task": config.task_name,
                "status": status,
                "result": detail,
            })),
        )
        .await
}

/// `output_mapping` maps variable names to dotted paths (with `[i]` array
/// indexing) into the result value.
async fn apply_output_mapping(
    ctx: &ExecCtx,
    token: &Token,
    mapping: &Value,
    result: &Value,
) -> Result<()> {
    let Value::Object(entries) = mapping else {
        warn!("output_mapping is not an object; ignored");
        return Ok(());
    };
    for (variable, path) in entries {
        let Value::String(path) = path else {
            warn!(variable = %variable, "output_mapping path is not a string; skipped");
            continue;
        };
        if let Some(value) = extract_path(result, path) {
            ctx.instances
                .set_variable(
                    token.instance_id,
                    token.scope_id.as_deref(),
                    variable,
                    VariableValue::infer(value),
                )
                .await?;
        }
    }
    Ok(())
}

/// Walk `a.b[0].c` through a JSON value. None when any step is absent.
pub(crate) fn extract_path(value: &Value, path: &str) -> Option<Value> {
    let mut current = value.clone();
    for segment in path.split('.') {
        let (field, indexes) = split_indexes(segment)?;
        if !field.is_empty() {
            current = current.get(field)?.clone();
        }
        for idx in indexes {
            current = current.get(idx)?.clone();
        }
    }
    Some(current)
}

fn split_indexes(segment: &str) -> Option<(&str, Vec<usize>)> {
    match segment.find('[') {
        None => Some((segment, vec![])),
        Some(pos) => {
            let field = &segment[..pos];
            let mut indexes = Vec::new();
            let mut rest = &segment[pos..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let close = stripped.find(']')?;
                indexes.push(stripped[..close].parse().ok()?);
                rest = &stripped[close + 1..];
            }
            if rest.is_empty() {
                Some((field, indexes))
            } else {
                None
            }
        }
    }
}
