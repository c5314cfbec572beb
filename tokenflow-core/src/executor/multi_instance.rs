//! Multi-instance expansion and completion.
//!
//! Parallel expansion replaces the activity's token with one per collection
//! item, each under a `{activityId}_instance_{i}` scope segment. Sequential
//! expansion steps one instance at a time. Completion is observed via fresh
//! reads after each COMPLETED update, never a cached count.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::bpmn::{MultiInstanceSpec, Node, ProcessGraph};
use crate::error::{EngineError, Result};
use crate::executor::{ExecCtx, FollowUp};
use crate::types::{push_scope, scope_leaf, parse_instance_segment, Token, TokenState};

/// Fields the expansion writes into each instance token.
const INSTANCE_FIELDS: [&str; 4] = ["item", "index", "is_parallel", "parent_scope"];

pub(crate) async fn expand(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    node: &Node,
    spec: &MultiInstanceSpec,
) -> Result<Vec<FollowUp>> {
    let collection = resolve_collection(ctx, token, spec).await?;
    let activity_id = node.id();

    if collection.is_empty() {
        debug!(activity = activity_id, "empty collection; skipping multi-instance activity");
        ctx.runtime
            .swap_tokens(
                token.instance_id,
                &[(token.node_id.clone(), token.scope_id.clone())],
                &[],
            )
            .await?;
        emit_successor(ctx, graph, token, activity_id, token.scope_id.clone(), &token.data)
            .await?;
        return Ok(vec![]);
    }

    let parent_scope = token.scope_id.clone();
    if spec.sequential {
        let instance = instance_token(token, activity_id, &collection, 0, false, &parent_scope);
        ctx.runtime
            .swap_tokens(
                token.instance_id,
                &[(token.node_id.clone(), token.scope_id.clone())],
                std::slice::from_ref(&instance),
            )
            .await?;
        debug!(activity = activity_id, total = collection.len(), "sequential multi-instance started");
    } else {
        let instances: Vec<Token> = (0..collection.len())
            .map(|i| instance_token(token, activity_id, &collection, i, true, &parent_scope))
            .collect();
        ctx.runtime
            .swap_tokens(
                token.instance_id,
                &[(token.node_id.clone(), token.scope_id.clone())],
                &instances,
            )
            .await?;
        debug!(activity = activity_id, total = collection.len(), "parallel multi-instance expanded");
    }
    Ok(vec![])
}

/// Collection source precedence: token data `collection`, then the
/// spec's collection variable, then a cardinality expression producing
/// `[0, n)` indices.
async fn resolve_collection(
    ctx: &ExecCtx,
    token: &Token,
    spec: &MultiInstanceSpec,
) -> Result<Vec<Value>> {
    if let Some(Value::Array(items)) = token.data.get("collection") {
        return Ok(items.clone());
    }
    if let Some(name) = &spec.collection {
        let value = ctx
            .instances
            .resolve_variable(token.instance_id, token.scope_id.as_deref(), name)
            .await?;
        return match value.map(|v| v.value) {
            Some(Value::Array(items)) => Ok(items),
            Some(other) => Err(EngineError::InvalidBpmn(format!(
                "multi-instance collection '{name}' is not an array: {other}"
            ))),
            None => Ok(vec![]),
        };
    }
    if let Some(cardinality) = &spec.cardinality {
        let n = if cardinality.trim().starts_with("${") {
            let context = ctx
                .instances
                .variables_context(token.instance_id, token.scope_id.as_deref())
                .await?;
            ctx.evaluator
                .evaluate(cardinality, &context)?
                .as_i64()
                .unwrap_or(0)
        } else {
            cardinality.trim().parse::<i64>().map_err(|_| {
                EngineError::InvalidBpmn(format!("bad loop cardinality '{cardinality}'"))
            })?
        };
        return Ok((0..n.max(0)).map(Value::from).collect());
    }
    Err(EngineError::InvalidBpmn(
        "multi-instance activity has neither collection nor cardinality".into(),
    ))
}

fn instance_token(
    token: &Token,
    activity_id: &str,
    collection: &[Value],
    index: usize,
    parallel: bool,
    parent_scope: &Option<String>,
) -> Token {
    let scope = push_scope(
        parent_scope.as_deref(),
        &format!("{activity_id}_instance_{index}"),
    );
    let mut data = token.data.clone();
    data.insert("item".into(), collection[index].clone());
    data.insert("index".into(), json!(index));
    data.insert("collection".into(), json!(collection));
    data.insert("is_parallel".into(), json!(parallel));
    data.insert(
        "parent_scope".into(),
        json!(parent_scope.clone().unwrap_or_default()),
    );
    let mut t = token.copied_to(activity_id);
    t.scope_id = Some(scope);
    t.data = data;
    t
}

/// One instance finished: account it and either continue the loop or emit
/// the successor outside the multi-instance scope.
pub(crate) async fn complete_instance(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    activity_id: &str,
    spec: &MultiInstanceSpec,
) -> Result<Vec<FollowUp>> {
    let collection = match token.data.get("collection") {
        Some(Value::Array(items)) => items.clone(),
        _ => vec![],
    };
    let total = collection.len();
    let parent_scope = token
        .data
        .get("parent_scope")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    if spec.sequential {
        let index = token
            .data
            .get("index")
            .and_then(|v| v.as_i64())
            .unwrap_or(0) as usize;
        let next = index + 1;
        if next < total {
            let successor =
                instance_token(token, activity_id, &collection, next, false, &parent_scope);
            ctx.runtime
                .swap_tokens(
                    token.instance_id,
                    &[(token.node_id.clone(), token.scope_id.clone())],
                    std::slice::from_ref(&successor),
                )
                .await?;
            debug!(activity = activity_id, index = next, "sequential multi-instance advanced");
        } else {
            ctx.runtime
                .swap_tokens(
                    token.instance_id,
                    &[(token.node_id.clone(), token.scope_id.clone())],
                    &[],
                )
                .await?;
            emit_successor(ctx, graph, token, activity_id, parent_scope, &token.data).await?;
        }
        return Ok(vec![]);
    }

    // parallel: mark this instance COMPLETED, then observe a fresh count
    ctx.runtime
        .update_token_state(
            token.instance_id,
            &token.node_id,
            token.scope_id.as_deref(),
            TokenState::Completed,
        )
        .await?;

    let tokens = ctx.runtime.list_tokens(token.instance_id).await?;
    let instance_tokens: Vec<&Token> = tokens
        .iter()
        .filter(|t| {
            t.node_id == activity_id
                && t.scope_id
                    .as_deref()
                    .map(scope_leaf)
                    .and_then(parse_instance_segment)
                    .map(|(a, _)| a == activity_id)
                    .unwrap_or(false)
        })
        .collect();
    let completed = instance_tokens
        .iter()
        .filter(|t| t.state == TokenState::Completed)
        .count();

    let should_complete = match &spec.completion_condition {
        Some(condition) => {
            let mut context = ctx
                .instances
                .variables_context(token.instance_id, token.scope_id.as_deref())
                .await?;
            context.insert("count".into(), json!(completed));
            match ctx.evaluator.evaluate_condition(condition, &context) {
                Ok(v) => v,
                Err(e) => {
                    warn!(activity = activity_id, error = %e, "completion condition failed; falling back to full count");
                    false
                }
            }
        }
        None => completed == total,
    } || completed == total;

    debug!(
        activity = activity_id,
        completed,
        total,
        should_complete,
        "parallel multi-instance progress"
    );
    if !should_complete {
        return Ok(vec![]);
    }

    // remove every instance scope (including bodies of still-running ones)
    for i in 0..total {
        let prefix = push_scope(
            parent_scope.as_deref(),
            &format!("{activity_id}_instance_{i}"),
        );
        ctx.runtime
            .clear_scope_tokens(token.instance_id, Some(&prefix))
            .await?;
    }
    emit_successor(ctx, graph, token, activity_id, parent_scope, &token.data).await?;
    Ok(vec![])
}

/// Emit the single successor token on the activity's outgoing flow, outside
/// the multi-instance scope, with instance-specific data stripped.
async fn emit_successor(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    activity_id: &str,
    scope: Option<String>,
    data: &std::collections::BTreeMap<String, Value>,
) -> Result<()> {
    let Some(flow) = graph.outgoing_flows(activity_id).first().copied() else {
        warn!(activity = activity_id, "multi-instance activity has no outgoing flow");
        return Ok(());
    };
    let mut cleaned = data.clone();
    for field in INSTANCE_FIELDS {
        cleaned.remove(field);
    }
    let mut successor = Token::new(token.instance_id, flow.target_ref.clone());
    successor.scope_id = scope;
    successor.data = cleaned;
    successor.parent_instance_id = token.parent_instance_id;
    successor.parent_activity_id = token.parent_activity_id.clone();
    ctx.runtime.add_token(&successor).await?;
    debug!(activity = activity_id, to = %successor.node_id, "multi-instance successor emitted");
    Ok(())
}
