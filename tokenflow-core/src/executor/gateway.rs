//! Exclusive, parallel, and inclusive gateway execution.

use serde_json::json;
use std::collections::BTreeSet;
use tracing::debug;

use crate::bpmn::{GatewayKind, GatewayNode, ProcessGraph, SequenceFlow};
use crate::error::{EngineError, Result};
use crate::executor::{ExecCtx, FollowUp};
use crate::expr::Context;
use crate::types::{Token, TokenState};

pub(crate) async fn execute(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    gateway: &GatewayNode,
) -> Result<Vec<FollowUp>> {
    if gateway.incoming.len() > 1 {
        join(ctx, graph, token, gateway).await?;
        return Ok(vec![]);
    }
    match gateway.kind {
        GatewayKind::Exclusive => exclusive_split(ctx, graph, token, gateway).await?,
        GatewayKind::Parallel => parallel_split(ctx, graph, token, gateway).await?,
        GatewayKind::Inclusive => inclusive_split(ctx, graph, token, gateway).await?,
    }
    Ok(vec![])
}

async fn eval_context(ctx: &ExecCtx, token: &Token) -> Result<Context> {
    let mut context = ctx
        .instances
        .variables_context(token.instance_id, token.scope_id.as_deref())
        .await?;
    for (k, v) in &token.data {
        context.insert(k.clone(), v.clone());
    }
    Ok(context)
}

/// The fallback flow: the one marked `default` on the gateway, else the
/// first condition-less flow.
fn fallback_flow<'a>(
    gateway: &GatewayNode,
    flows: &[&'a SequenceFlow],
) -> Option<&'a SequenceFlow> {
    if let Some(id) = &gateway.default_flow {
        return flows.iter().find(|f| &f.id == id).copied();
    }
    flows
        .iter()
        .find(|f| f.condition_expression.is_none())
        .copied()
}

// ─── Splits ───────────────────────────────────────────────────

/// XOR: first flow (in source-declaration order) whose condition is truthy
/// wins; the default flow wins when none are; otherwise no valid path.
async fn exclusive_split(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    gateway: &GatewayNode,
) -> Result<()> {
    let flows = graph.outgoing_flows(&gateway.id);
    let context = eval_context(ctx, token).await?;
    let fallback = fallback_flow(gateway, &flows);

    for &flow in &flows {
        if Some(flow.id.as_str()) == fallback.map(|f| f.id.as_str()) {
            continue;
        }
        let Some(condition) = &flow.condition_expression else {
            continue;
        };
        if ctx.evaluator.evaluate_condition(condition, &context)? {
            debug!(gateway = %gateway.id, flow = %flow.id, "exclusive gateway took conditional flow");
            ctx.tokens.move_token(token, &flow.target_ref).await?;
            return Ok(());
        }
    }

    match fallback {
        Some(flow) => {
            debug!(gateway = %gateway.id, flow = %flow.id, "exclusive gateway took default flow");
            ctx.tokens.move_token(token, &flow.target_ref).await?;
            Ok(())
        }
        None => Err(EngineError::NoValidPath(gateway.id.clone())),
    }
}

/// AND: a token on every outgoing flow.
async fn parallel_split(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    gateway: &GatewayNode,
) -> Result<()> {
    let targets: Vec<String> = graph
        .outgoing_flows(&gateway.id)
        .iter()
        .map(|f| f.target_ref.clone())
        .collect();
    if targets.len() <= 1 {
        if let Some(target) = targets.first() {
            ctx.tokens.move_token(token, target).await?;
        }
        return Ok(());
    }
    ctx.tokens.split_token(token, &targets).await?;
    Ok(())
}

/// OR: every truthy non-default flow; the default flow iff none were truthy.
/// The taken flow-id set rides in each token's `active_flows` so the join
/// knows how many to await.
async fn inclusive_split(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    gateway: &GatewayNode,
) -> Result<()> {
    let flows = graph.outgoing_flows(&gateway.id);
    let context = eval_context(ctx, token).await?;
    let fallback = fallback_flow(gateway, &flows);

    let mut taken: Vec<&SequenceFlow> = Vec::new();
    for &flow in &flows {
        if Some(flow.id.as_str()) == fallback.map(|f| f.id.as_str()) {
            continue;
        }
        match &flow.condition_expression {
            Some(condition) => {
                if ctx.evaluator.evaluate_condition(condition, &context)? {
                    taken.push(flow);
                }
            }
            // an unconditional non-default flow is always taken
            None => taken.push(flow),
        }
    }
    if taken.is_empty() {
        match fallback {
            Some(flow) => taken.push(flow),
            None => return Err(EngineError::NoValidPath(gateway.id.clone())),
        }
    }

    let flow_ids: Vec<String> = taken.iter().map(|f| f.id.clone()).collect();
    let targets: Vec<String> = taken.iter().map(|f| f.target_ref.clone()).collect();
    debug!(gateway = %gateway.id, flows = ?flow_ids, "inclusive gateway split");

    let mut carrier = token.clone();
    carrier.data.insert("active_flows".into(), json!(flow_ids));
    if targets.len() == 1 {
        ctx.tokens.move_token(&carrier, &targets[0]).await?;
    } else {
        ctx.tokens.split_token(&carrier, &targets).await?;
    }
    Ok(())
}

// ─── Joins ────────────────────────────────────────────────────

/// Joins wait for strict arrival counts: each arriving token parks WAITING
/// at the gateway; the arrival that completes the count replaces all of them
/// with a single successor. Never more than one token is forwarded per
/// matched split.
async fn join(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    gateway: &GatewayNode,
) -> Result<()> {
    let all = ctx.runtime.list_tokens(token.instance_id).await?;
    let here: Vec<&Token> = all
        .iter()
        .filter(|t| {
            t.node_id == gateway.id
                && t.scope_id == token.scope_id
                && matches!(t.state, TokenState::Active | TokenState::Waiting)
        })
        .collect();

    let expected = match gateway.kind {
        GatewayKind::Inclusive => {
            // the split recorded the taken flow set; one arrival per branch
            let mut active: BTreeSet<String> = BTreeSet::new();
            for t in &here {
                if let Some(serde_json::Value::Array(ids)) = t.data.get("active_flows") {
                    for id in ids {
                        if let Some(s) = id.as_str() {
                            active.insert(s.to_string());
                        }
                    }
                }
            }
            if active.is_empty() {
                gateway.incoming.len()
            } else {
                active.len()
            }
        }
        _ => gateway.incoming.len(),
    };

    if here.len() < expected {
        debug!(
            gateway = %gateway.id,
            arrived = here.len(),
            expected,
            "join waiting for more arrivals"
        );
        ctx.runtime
            .update_token_state_by_id(token.instance_id, token.id, TokenState::Waiting)
            .await?;
        return Ok(());
    }

    // all arrived: replace every token at this position with one successor
    let mut merged = token.clone();
    merged.data.remove("active_flows");
    let outgoing = graph.outgoing_flows(&gateway.id);
    debug!(gateway = %gateway.id, merged = here.len(), "join released");

    match outgoing.as_slice() {
        [] => {
            ctx.runtime
                .swap_tokens(
                    token.instance_id,
                    &[(gateway.id.clone(), token.scope_id.clone())],
                    &[],
                )
                .await
        }
        [flow] => {
            let successor = merged.copied_to(&flow.target_ref);
            ctx.runtime
                .swap_tokens(
                    token.instance_id,
                    &[(gateway.id.clone(), token.scope_id.clone())],
                    std::slice::from_ref(&successor),
                )
                .await
        }
        many => {
            // merge-then-split for gateways with several incoming and outgoing
            let successors: Vec<Token> = many
                .iter()
                .map(|f| merged.copied_to(&f.target_ref))
                .collect();
            ctx.runtime
                .swap_tokens(
                    token.instance_id,
                    &[(gateway.id.clone(), token.scope_id.clone())],
                    &successors,
                )
                .await
        }
    }
}
