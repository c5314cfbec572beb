//! Compensation throw events and handler execution.
//!
//! Completed activities with an attached compensation boundary event are
//! registered per scope in completion order; a throw event walks the
//! registry in reverse (LIFO), creating one COMPENSATION-state token per
//! handler. Handlers execute only on COMPENSATION tokens; after the last
//! one finishes, the parked throw event resumes and takes its successor
//! flow.

use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

use crate::bpmn::{EventKind, EventNode, Node, ProcessGraph};
use crate::error::Result;
use crate::executor::{task, ExecCtx, FollowUp};
use crate::types::{Token, TokenState};

/// Marker on a parked throw-event token awaiting its handlers.
pub(crate) const THROW_PENDING: &str = "compensation_throw";
/// Marker meaning every handler ran; the throw event may continue.
pub(crate) const THROW_DONE: &str = "compensation_done";

pub(crate) async fn throw(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    event: &EventNode,
) -> Result<Vec<FollowUp>> {
    let entries = ctx.runtime.compensation_entries(token.instance_id).await?;

    // reverse registration order; a handler fires at most once per throw
    let mut seen: HashSet<&str> = HashSet::new();
    let mut handlers = Vec::new();
    for entry in entries.iter().rev() {
        if let Some(target) = &event.activity_ref {
            if &entry.activity_id != target {
                continue;
            }
        }
        if seen.insert(entry.handler_id.as_str()) {
            handlers.push(entry);
        }
    }

    if handlers.is_empty() {
        debug!(event = %event.id, "compensation throw with no registered handlers");
        finish_throw(ctx, graph, token, event).await?;
        return Ok(vec![]);
    }

    for entry in &handlers {
        let mut handler_token = Token::new(token.instance_id, entry.handler_id.clone());
        handler_token.state = TokenState::Compensation;
        handler_token.scope_id = token.scope_id.clone();
        handler_token
            .data
            .insert("compensated_activity_id".into(), json!(entry.activity_id));
        handler_token.data.insert(
            "activity_data".into(),
            json!(entry.activity_data.clone()),
        );
        ctx.runtime.add_token(&handler_token).await?;
    }
    debug!(event = %event.id, n = handlers.len(), "compensation handlers triggered");

    // park the throw event until every handler completes
    let mut entries_map = BTreeMap::new();
    entries_map.insert(THROW_PENDING.to_string(), json!(true));
    ctx.runtime
        .merge_token_data(
            token.instance_id,
            &token.node_id,
            token.scope_id.as_deref(),
            &entries_map,
        )
        .await?;
    ctx.tokens
        .update_state(token, TokenState::Waiting, None)
        .await?;
    Ok(vec![])
}

/// Continue past the throw event: end events consume, intermediate throws
/// take their outgoing flow.
async fn finish_throw(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
    event: &EventNode,
) -> Result<()> {
    if event.kind == EventKind::End {
        ctx.tokens
            .update_state(token, TokenState::Completed, None)
            .await?;
        ctx.tokens.consume(token).await?;
    } else {
        match graph.outgoing_flows(&event.id).first() {
            Some(flow) => {
                let target = flow.target_ref.clone();
                ctx.tokens.move_token(token, &target).await?;
            }
            None => {
                ctx.tokens
                    .update_state(token, TokenState::Waiting, None)
                    .await?
            }
        }
    }
    Ok(())
}

/// Execute a compensation handler token. Invariant: only COMPENSATION-state
/// tokens reach here.
pub(crate) async fn run_handler(
    ctx: &ExecCtx,
    _graph: &ProcessGraph,
    token: &Token,
    node: &Node,
) -> Result<Vec<FollowUp>> {
    match node {
        Node::Task(t) => {
            task::run_work(ctx, token, t).await?;
        }
        other => {
            warn!(
                node = other.id(),
                "compensation handler is not a task; skipping work"
            );
        }
    }

    // handler done: remove its token
    ctx.runtime
        .swap_tokens(
            token.instance_id,
            &[(token.node_id.clone(), token.scope_id.clone())],
            &[],
        )
        .await?;
    debug!(handler = %token.node_id, "compensation handler completed");

    // last handler out resumes the parked throw event
    let tokens = ctx.runtime.list_tokens(token.instance_id).await?;
    let outstanding = tokens
        .iter()
        .any(|t| t.state == TokenState::Compensation);
    if outstanding {
        return Ok(vec![]);
    }

    if let Some(throwing) = tokens.iter().find(|t| {
        t.state == TokenState::Waiting
            && t.data.get(THROW_PENDING) == Some(&Value::Bool(true))
    }) {
        let mut entries = BTreeMap::new();
        entries.insert(THROW_PENDING.to_string(), json!(false));
        entries.insert(THROW_DONE.to_string(), json!(true));
        ctx.runtime
            .merge_token_data(
                token.instance_id,
                &throwing.node_id,
                throwing.scope_id.as_deref(),
                &entries,
            )
            .await?;
        ctx.runtime
            .update_token_state_by_id(token.instance_id, throwing.id, TokenState::Active)
            .await?;
        debug!(event = %throwing.node_id, "all compensation handlers done; throw event resumed");
    }
    Ok(vec![])
}
