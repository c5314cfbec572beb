//! Persistence traits.
//!
//! Two logical stores with different durability profiles. The **durable
//! store** is the relational record of truth: definitions, instances,
//! variables, the activity log. The **runtime store** is the fast
//! coordination store: live tokens, the variable cache, TTL locks,
//! subscriptions, compensation registries, transaction context, and timer
//! metadata, laid out as
//!
//! ```text
//! process:{instance}:tokens
//! process:{instance}:vars
//! lock:process:{instance}
//! pythmata:timer:{definition}:{node}:metadata
//! subscription:{kind}:{name}:{instance}:{node}
//! compensation:{instance}
//! ```
//!
//! Every multi-step token mutation is a single trait call so a conforming
//! implementation can make it transactional; a crash between steps must not
//! leave orphan keys.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::types::*;

/// Due-time record for a token parked on an intermediate or boundary timer.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TokenTimer {
    pub instance_id: Uuid,
    pub node_id: String,
    pub due: DateTime<Utc>,
}

// ─── Durable store ────────────────────────────────────────────

/// Relational record of truth. All mutations that change instance lifecycle
/// or emit an audit entry happen here; implementations must make
/// lifecycle-plus-log writes transactional.
#[async_trait]
pub trait DurableStore: Send + Sync {
    // ── Definitions ──

    async fn save_definition(&self, definition: &ProcessDefinitionRecord) -> Result<()>;
    async fn load_definition(&self, id: Uuid) -> Result<Option<ProcessDefinitionRecord>>;
    async fn list_definitions(&self) -> Result<Vec<ProcessDefinitionRecord>>;

    // ── Instances ──

    async fn save_instance(&self, instance: &ProcessInstanceRecord) -> Result<()>;
    async fn load_instance(&self, id: Uuid) -> Result<Option<ProcessInstanceRecord>>;
    async fn list_instances(&self) -> Result<Vec<ProcessInstanceRecord>>;
    async fn update_instance_status(
        &self,
        id: Uuid,
        status: InstanceStatus,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<()>;

    // ── Variables ──

    /// Insert or update a variable row, bumping its version on update.
    async fn upsert_variable(&self, variable: &VariableRecord) -> Result<()>;
    /// Load variables, optionally filtered to one scope.
    async fn load_variables(
        &self,
        instance_id: Uuid,
        scope_id: Option<&str>,
    ) -> Result<Vec<VariableRecord>>;

    // ── Activity log ──

    async fn append_activity(&self, entry: &ActivityLogRecord) -> Result<()>;
    async fn read_activities(&self, instance_id: Uuid) -> Result<Vec<ActivityLogRecord>>;
}

// ─── Runtime store ────────────────────────────────────────────

/// Fast coordination store for live execution state. Tokens are ephemeral
/// per transition but survive restart; compound operations are atomic.
#[async_trait]
pub trait RuntimeStore: Send + Sync {
    // ── Tokens ──

    async fn add_token(&self, token: &Token) -> Result<()>;
    /// Atomically remove the listed `(node_id, scope_id)` positions and
    /// insert replacements. This is the single primitive behind token
    /// move/split/consume.
    async fn swap_tokens(
        &self,
        instance_id: Uuid,
        remove: &[(String, Option<String>)],
        insert: &[Token],
    ) -> Result<()>;
    async fn get_token(
        &self,
        instance_id: Uuid,
        node_id: &str,
        scope_id: Option<&str>,
    ) -> Result<Option<Token>>;
    /// Id-addressed read; joins hold several tokens at one position, so
    /// position reads are ambiguous there.
    async fn get_token_by_id(&self, instance_id: Uuid, token_id: Uuid) -> Result<Option<Token>>;
    async fn list_tokens(&self, instance_id: Uuid) -> Result<Vec<Token>>;
    async fn update_token_state(
        &self,
        instance_id: Uuid,
        node_id: &str,
        scope_id: Option<&str>,
        state: TokenState,
    ) -> Result<()>;
    async fn update_token_state_by_id(
        &self,
        instance_id: Uuid,
        token_id: Uuid,
        state: TokenState,
    ) -> Result<()>;
    /// Merge entries into a parked token's data (payload injection).
    async fn merge_token_data(
        &self,
        instance_id: Uuid,
        node_id: &str,
        scope_id: Option<&str>,
        entries: &BTreeMap<String, serde_json::Value>,
    ) -> Result<()>;
    /// Remove every token whose scope starts with the prefix (all tokens
    /// when the prefix is None).
    async fn clear_scope_tokens(&self, instance_id: Uuid, scope_prefix: Option<&str>)
        -> Result<()>;

    // ── Variable cache ──

    async fn set_variable(
        &self,
        instance_id: Uuid,
        scope_id: Option<&str>,
        name: &str,
        value: &VariableValue,
    ) -> Result<()>;
    async fn get_variable(
        &self,
        instance_id: Uuid,
        scope_id: Option<&str>,
        name: &str,
    ) -> Result<Option<VariableValue>>;
    /// The full variable hash, keyed `"{scope}:{name}"` (scope omitted when
    /// global).
    async fn list_variables(&self, instance_id: Uuid) -> Result<BTreeMap<String, VariableValue>>;

    // ── Locks ──

    /// Acquire `lock:process:{instance}`; false when someone else holds it.
    async fn acquire_lock(&self, instance_id: Uuid, ttl: Duration) -> Result<bool>;
    /// Extend a held lock's TTL.
    async fn refresh_lock(&self, instance_id: Uuid, ttl: Duration) -> Result<()>;
    async fn release_lock(&self, instance_id: Uuid) -> Result<()>;

    // ── Subscriptions ──

    async fn put_subscription(&self, subscription: &Subscription) -> Result<()>;
    async fn remove_subscription(
        &self,
        kind: SubscriptionKind,
        name: &str,
        instance_id: Uuid,
        node_id: &str,
    ) -> Result<()>;
    /// All subscriptions for a name, across instances.
    async fn find_subscriptions(
        &self,
        kind: SubscriptionKind,
        name: &str,
    ) -> Result<Vec<Subscription>>;
    async fn list_instance_subscriptions(&self, instance_id: Uuid) -> Result<Vec<Subscription>>;

    // ── Compensation registry ──

    async fn push_compensation(&self, instance_id: Uuid, entry: &CompensationEntry) -> Result<()>;
    async fn compensation_entries(&self, instance_id: Uuid) -> Result<Vec<CompensationEntry>>;
    async fn clear_compensation(&self, instance_id: Uuid) -> Result<()>;

    // ── Transaction context ──

    async fn put_transaction(&self, transaction: &TransactionRecord) -> Result<()>;
    async fn get_transaction(&self, instance_id: Uuid) -> Result<Option<TransactionRecord>>;
    async fn remove_transaction(&self, instance_id: Uuid) -> Result<()>;

    // ── Timer metadata ──

    async fn put_timer_metadata(&self, metadata: &TimerMetadata) -> Result<()>;
    async fn list_timer_metadata(&self) -> Result<Vec<TimerMetadata>>;
    async fn remove_timer_metadata(&self, definition_id: Uuid, node_id: &str) -> Result<()>;

    // ── Token timers (intermediate/boundary) ──

    async fn put_token_timer(&self, timer: &TokenTimer) -> Result<()>;
    async fn list_token_timers(&self) -> Result<Vec<TokenTimer>>;
    async fn remove_token_timer(&self, instance_id: Uuid, node_id: &str) -> Result<()>;

    // ── Instance cleanup ──

    /// Delete every `process:{instance}:*` key, the instance lock, its
    /// subscriptions, compensation registry, transaction context, and token
    /// timers. Called on completion and termination.
    async fn clear_instance(&self, instance_id: Uuid) -> Result<()>;
}
