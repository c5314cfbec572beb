//! Node executors, dispatched by node kind from the run loop.

pub(crate) mod compensation;
pub(crate) mod event;
pub(crate) mod gateway;
pub(crate) mod multi_instance;
pub(crate) mod subprocess;
pub(crate) mod task;

use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::bpmn::{Node, ProcessGraph};
use crate::error::{EngineError, Result};
use crate::expr::ExpressionEvaluator;
use crate::instance::InstanceManager;
use crate::service::ServiceTaskRegistry;
use crate::store::{DurableStore, RuntimeStore};
use crate::token_manager::TokenManager;
use crate::types::{parse_instance_segment, scope_leaf, SubscriptionKind, Token, TokenState};

/// Shared handles every executor works against.
pub(crate) struct ExecCtx {
    pub durable: Arc<dyn DurableStore>,
    pub runtime: Arc<dyn RuntimeStore>,
    pub tokens: Arc<TokenManager>,
    pub instances: Arc<InstanceManager>,
    pub registry: Arc<ServiceTaskRegistry>,
    pub evaluator: ExpressionEvaluator,
}

/// Work the engine must do after a dispatch, outside the current instance's
/// lock: drive another instance's run loop, or publish an event.
#[derive(Debug)]
pub(crate) enum FollowUp {
    RunInstance(Uuid),
    Publish {
        kind: SubscriptionKind,
        name: String,
        payload: Option<serde_json::Value>,
    },
}

/// Execute one token at its node. The stored token is re-read first so stale
/// snapshot entries (consumed by a join merge earlier in the same batch) are
/// skipped via `TokenNotFound`.
pub(crate) async fn dispatch(
    ctx: &ExecCtx,
    graph: &ProcessGraph,
    token: &Token,
) -> Result<Vec<FollowUp>> {
    let stored = ctx
        .runtime
        .get_token_by_id(token.instance_id, token.id)
        .await?
        .ok_or_else(|| EngineError::TokenNotFound {
            instance_id: token.instance_id,
            node_id: token.node_id.clone(),
        })?;

    if !matches!(
        stored.state,
        TokenState::Active | TokenState::Compensation
    ) {
        debug!(node = %stored.node_id, state = %stored.state, "token not runnable; skipping");
        return Ok(vec![]);
    }

    let node = graph
        .find_node(&stored.node_id)
        .ok_or_else(|| EngineError::NodeNotFound(stored.node_id.clone()))?;

    // COMPENSATION tokens run their node as a compensation handler; ACTIVE
    // tokens at handler-only nodes are no-ops.
    if stored.state == TokenState::Compensation {
        return compensation::run_handler(ctx, graph, &stored, node).await;
    }
    if graph.is_compensation_handler(&stored.node_id) {
        debug!(node = %stored.node_id, "active token at compensation handler; consuming");
        ctx.tokens.consume(&stored).await?;
        return Ok(vec![]);
    }

    match node {
        Node::Event(ev) => event::execute(ctx, graph, &stored, ev).await,
        Node::Gateway(gw) => gateway::execute(ctx, graph, &stored, gw).await,
        Node::Task(t) => {
            if let Some(mi) = &t.multi_instance {
                if !in_own_instance_scope(&stored, &t.id) {
                    return multi_instance::expand(ctx, graph, &stored, node, mi).await;
                }
            }
            task::execute(ctx, graph, &stored, t).await
        }
        Node::SubProcess(sp) => {
            if let Some(mi) = &sp.multi_instance {
                if !in_own_instance_scope(&stored, &sp.id) {
                    return multi_instance::expand(ctx, graph, &stored, node, mi).await;
                }
            }
            subprocess::enter(ctx, graph, &stored, sp).await
        }
        Node::CallActivity(ca) => subprocess::execute_call_activity(ctx, graph, &stored, ca).await,
    }
}

/// True when the token's innermost scope segment is an expanded
/// multi-instance scope of this activity (`{id}_instance_{i}`).
fn in_own_instance_scope(token: &Token, activity_id: &str) -> bool {
    token
        .scope_id
        .as_deref()
        .map(scope_leaf)
        .and_then(parse_instance_segment)
        .map(|(activity, _)| activity == activity_id)
        .unwrap_or(false)
}
