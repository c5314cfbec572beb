//! Single authority for token state changes.
//!
//! All operations verify the token's current stored state before mutating
//! and perform remove+insert through one atomic store call, so retries and
//! concurrent callers (holding `lock:process:{instance}`) cannot duplicate
//! or orphan tokens.

use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::store::RuntimeStore;
use crate::types::{Token, TokenState, TransactionRecord, TransactionStatus};

/// Synthetic node id recognized on moves: completes the active transaction
/// and continues to the process end.
pub const TRANSACTION_END: &str = "Transaction_End";
/// Synthetic node id tokens are redirected to when entering a transaction.
pub const TRANSACTION_START: &str = "Transaction_Start";

pub struct TokenManager {
    runtime: Arc<dyn RuntimeStore>,
}

impl TokenManager {
    pub fn new(runtime: Arc<dyn RuntimeStore>) -> Self {
        Self { runtime }
    }

    /// Fetch the stored token at this position and require it ACTIVE.
    async fn verify_active(&self, token: &Token) -> Result<Token> {
        let stored = self
            .runtime
            .get_token(token.instance_id, &token.node_id, token.scope_id.as_deref())
            .await?
            .ok_or_else(|| EngineError::TokenNotFound {
                instance_id: token.instance_id,
                node_id: token.node_id.clone(),
            })?;
        if stored.state != TokenState::Active {
            return Err(EngineError::TokenNotActive {
                node_id: token.node_id.clone(),
                state: stored.state.to_string(),
            });
        }
        Ok(stored)
    }

    /// Create the initial token at a start event. Rejects if a token already
    /// sits there; this is the at-most-once guard for duplicate
    /// `process.started` deliveries.
    pub async fn create_initial(&self, instance_id: Uuid, start_node: &str) -> Result<Token> {
        if self
            .runtime
            .get_token(instance_id, start_node, None)
            .await?
            .is_some()
        {
            return Err(EngineError::TokenExists {
                instance_id,
                node_id: start_node.to_string(),
            });
        }
        let token = Token::new(instance_id, start_node);
        self.runtime.add_token(&token).await?;
        debug!(instance = %instance_id, node = start_node, "initial token created");
        Ok(token)
    }

    /// Atomically remove the token and create its successor at `target`.
    /// Recognizes the synthetic `Transaction_*` targets.
    pub async fn move_token(&self, token: &Token, target: &str) -> Result<Token> {
        self.verify_active(token).await?;

        let mut target = target.to_string();
        if target == TRANSACTION_END {
            self.complete_transaction(token.instance_id).await?;
            target = "End_1".to_string();
        } else if target.starts_with("Transaction_") && target != TRANSACTION_START {
            self.start_transaction(token.instance_id, &target).await?;
            target = TRANSACTION_START.to_string();
        }

        let successor = token.copied_to(target);
        self.runtime
            .swap_tokens(
                token.instance_id,
                &[(token.node_id.clone(), token.scope_id.clone())],
                std::slice::from_ref(&successor),
            )
            .await?;
        debug!(
            instance = %token.instance_id,
            from = %token.node_id,
            to = %successor.node_id,
            "token moved"
        );
        Ok(successor)
    }

    /// Remove the original and create one successor per target (parallel and
    /// inclusive splits).
    pub async fn split_token(&self, token: &Token, targets: &[String]) -> Result<Vec<Token>> {
        self.verify_active(token).await?;
        let successors: Vec<Token> = targets.iter().map(|t| token.copied_to(t)).collect();
        self.runtime
            .swap_tokens(
                token.instance_id,
                &[(token.node_id.clone(), token.scope_id.clone())],
                &successors,
            )
            .await?;
        debug!(
            instance = %token.instance_id,
            node = %token.node_id,
            n = targets.len(),
            "token split"
        );
        Ok(successors)
    }

    /// Remove a token from the process (end events).
    pub async fn consume(&self, token: &Token) -> Result<()> {
        let stored = self
            .runtime
            .get_token(token.instance_id, &token.node_id, token.scope_id.as_deref())
            .await?
            .ok_or_else(|| EngineError::TokenNotFound {
                instance_id: token.instance_id,
                node_id: token.node_id.clone(),
            })?;
        if !matches!(stored.state, TokenState::Active | TokenState::Completed) {
            return Err(EngineError::TokenNotActive {
                node_id: token.node_id.clone(),
                state: stored.state.to_string(),
            });
        }
        self.runtime
            .swap_tokens(
                token.instance_id,
                &[(token.node_id.clone(), token.scope_id.clone())],
                &[],
            )
            .await?;
        debug!(instance = %token.instance_id, node = %token.node_id, "token consumed");
        Ok(())
    }

    /// Transition a token's state in place without moving it.
    pub async fn update_state(
        &self,
        token: &Token,
        state: TokenState,
        scope_id: Option<&str>,
    ) -> Result<()> {
        let scope = scope_id.or(token.scope_id.as_deref());
        // verify existence first so a stale caller gets TokenNotFound
        self.runtime
            .get_token(token.instance_id, &token.node_id, scope)
            .await?
            .ok_or_else(|| EngineError::TokenNotFound {
                instance_id: token.instance_id,
                node_id: token.node_id.clone(),
            })?;
        self.runtime
            .update_token_state(token.instance_id, &token.node_id, scope, state)
            .await
    }

    // ── Transactions ──

    /// Start a transaction; at most one active per instance.
    pub async fn start_transaction(&self, instance_id: Uuid, transaction_id: &str) -> Result<()> {
        if let Some(existing) = self.runtime.get_transaction(instance_id).await? {
            if existing.status == TransactionStatus::Active {
                return Err(EngineError::TransactionActive(instance_id));
            }
        }
        self.runtime
            .put_transaction(&TransactionRecord::start(transaction_id, instance_id))
            .await
    }

    /// Commit and drop the active transaction.
    pub async fn complete_transaction(&self, instance_id: Uuid) -> Result<()> {
        let mut txn = self
            .runtime
            .get_transaction(instance_id)
            .await?
            .filter(|t| t.status == TransactionStatus::Active)
            .ok_or(EngineError::NoActiveTransaction(instance_id))?;
        txn.status = TransactionStatus::Committed;
        self.runtime.put_transaction(&txn).await?;
        self.runtime.remove_transaction(instance_id).await
    }
}
