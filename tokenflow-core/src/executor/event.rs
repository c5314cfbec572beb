//! Start, end, intermediate, and boundary event execution.

use chrono::Utc;
use tracing::{debug, warn};

use crate::bpmn::{EventDefinition, EventKind, EventNode, Node, ProcessGraph};
use crate::error::{EngineError, Result};
use crate::executor::{compensation, multi_instance, subprocess, ExecCtx, FollowUp};
use crate::store::TokenTimer;
use crate::timer::parse_timer;
use crate::types::{
    parse_instance_segment, scope_leaf, Subscription, SubscriptionKind, Token, TokenState,
};

pub(crate) async fn execute(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    event: &EventNode,
) -> Result<Vec<FollowUp>> {
    match event.kind {
        EventKind::Start => {
            take_outgoing(ctx, graph, token, event).await?;
            Ok(vec![])
        }
        EventKind::End => execute_end(ctx, graph, token, event).await,
        EventKind::Intermediate => execute_intermediate(ctx, graph, token, event).await,
        // a token only lands on a boundary node after its trigger fired;
        // payload is already merged, so just continue along the flow
        EventKind::Boundary => {
            take_outgoing(ctx, graph, token, event).await?;
            Ok(vec![])
        }
    }
}

async fn take_outgoing(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    event: &EventNode,
) -> Result<()> {
    match graph.outgoing_flows(&event.id).first() {
        Some(flow) => {
            let target = flow.target_ref.clone();
            ctx.tokens.move_token(token, &target).await?;
            Ok(())
        }
        None => {
            warn!(event = %event.id, "event has no outgoing flow; token parked");
            ctx.tokens
                .update_state(token, TokenState::Waiting, None)
                .await
        }
    }
}

// ─── End events ───────────────────────────────────────────────

async fn execute_end(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    event: &EventNode,
) -> Result<Vec<FollowUp>> {
    // terminate ends the whole instance immediately
    if event.definition == Some(EventDefinition::Terminate) {
        debug!(instance = %token.instance_id, "terminate end event reached");
        ctx.instances.terminate_instance(token.instance_id).await?;
        return Ok(vec![]);
    }

    // end events inside a called process complete (or fail) the call activity
    if token.parent_instance_id.is_some() {
        if event.definition == Some(EventDefinition::Error) {
            return subprocess::propagate_child_error(ctx, token, event).await;
        }
        return subprocess::complete_call_activity(ctx, token).await;
    }

    // compensation end event: trigger handlers, then finish normally once
    // they have all run
    if event.definition == Some(EventDefinition::Compensation)
        && token.data.get(compensation::THROW_DONE) != Some(&serde_json::Value::Bool(true))
    {
        return compensation::throw(ctx, graph, token, event).await;
    }

    if let Some(scope) = token.scope_id.as_deref() {
        let leaf = scope_leaf(scope);

        // multi-instance subprocess body reached its end: replace the inner
        // end token with a stand-in at the activity node, then account the
        // finished instance
        if let Some((activity, _)) = parse_instance_segment(leaf) {
            if let Some(node) = graph.find_node(activity) {
                if let Some(mi) = node.multi_instance() {
                    let stand_in = at_activity_token(token, activity);
                    ctx.runtime
                        .swap_tokens(
                            token.instance_id,
                            &[(token.node_id.clone(), token.scope_id.clone())],
                            std::slice::from_ref(&stand_in),
                        )
                        .await?;
                    return multi_instance::complete_instance(ctx, graph, &stand_in, activity, mi)
                        .await;
                }
            }
        }

        // plain subprocess exit: pop the scope segment and continue from the
        // subprocess's outgoing flow once no sibling tokens remain inside
        if let Some(Node::SubProcess(sp)) = graph.find_node(leaf) {
            return subprocess::exit(ctx, graph, token, sp).await;
        }
    }

    // plain end event
    ctx.tokens
        .update_state(token, TokenState::Completed, None)
        .await?;
    ctx.tokens.consume(token).await?;
    debug!(instance = %token.instance_id, event = %event.id, "end event consumed token");
    Ok(vec![])
}

/// A positional stand-in used when accounting a multi-instance completion
/// from inside the instance body: same scope and data, placed at the
/// activity node.
fn at_activity_token(token: &Token, activity: &str) -> Token {
    let mut t = token.clone();
    t.node_id = activity.to_string();
    t
}

// ─── Intermediate events ──────────────────────────────────────

async fn execute_intermediate(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    event: &EventNode,
) -> Result<Vec<FollowUp>> {
    // resumed waiters carry their payload and continue
    if token.data.contains_key("message_payload")
        || token.data.contains_key("signal_payload")
        || token.data.contains_key("timer_fired")
    {
        take_outgoing(ctx, graph, token, event).await?;
        return Ok(vec![]);
    }

    match (event.throwing, event.definition) {
        (true, Some(EventDefinition::Compensation)) => {
            if token.data.get(compensation::THROW_DONE) == Some(&serde_json::Value::Bool(true)) {
                take_outgoing(ctx, graph, token, event).await?;
                return Ok(vec![]);
            }
            compensation::throw(ctx, graph, token, event).await
        }
        (true, Some(EventDefinition::Signal)) | (true, Some(EventDefinition::Message)) => {
            let kind = if event.definition == Some(EventDefinition::Signal) {
                SubscriptionKind::Signal
            } else {
                SubscriptionKind::Message
            };
            let name = event_name(event);
            take_outgoing(ctx, graph, token, event).await?;
            Ok(vec![FollowUp::Publish {
                kind,
                name,
                payload: token.data.get("payload").cloned(),
            }])
        }
        (false, Some(EventDefinition::Message)) | (false, Some(EventDefinition::Signal)) => {
            let kind = if event.definition == Some(EventDefinition::Signal) {
                SubscriptionKind::Signal
            } else {
                SubscriptionKind::Message
            };
            subscribe_and_wait(ctx, token, event, kind).await?;
            Ok(vec![])
        }
        (false, Some(EventDefinition::Timer)) => {
            let Some(def) = &event.timer_definition else {
                return Err(EngineError::InvalidTimer(format!(
                    "timer event '{}' has no definition",
                    event.id
                )));
            };
            let parsed = parse_timer(def)?;
            let due = parsed.first_fire(Utc::now());
            ctx.runtime
                .put_token_timer(&TokenTimer {
                    instance_id: token.instance_id,
                    node_id: event.id.clone(),
                    due,
                })
                .await?;
            ctx.tokens
                .update_state(token, TokenState::Waiting, None)
                .await?;
            debug!(event = %event.id, %due, "token parked on intermediate timer");
            Ok(vec![])
        }
        _ => {
            // pass-through (none event, error throw without catcher here)
            take_outgoing(ctx, graph, token, event).await?;
            Ok(vec![])
        }
    }
}

pub(crate) fn event_name(event: &EventNode) -> String {
    event
        .event_name
        .clone()
        .or_else(|| event.name.clone())
        .unwrap_or_else(|| event.id.clone())
}

async fn subscribe_and_wait(
    ctx: &ExecCtx,
    token: &Token,
    event: &EventNode,
    kind: SubscriptionKind,
) -> Result<()> {
    let name = event_name(event);
    ctx.runtime
        .put_subscription(&Subscription {
            kind,
            name: name.clone(),
            instance_id: token.instance_id,
            node_id: event.id.clone(),
            correlation_value: token
                .data
                .get("correlation_value")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
        .await?;
    ctx.tokens
        .update_state(token, TokenState::Waiting, None)
        .await?;
    debug!(event = %event.id, %kind, %name, "token parked on subscription");
    Ok(())
}
