//! In-memory implementations of [`DurableStore`] and [`RuntimeStore`] for
//! tests and embedded use. Every operation takes the single inner lock, so
//! compound mutations are naturally atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::store::{DurableStore, RuntimeStore, TokenTimer};
use crate::types::*;

// ─── Durable store ────────────────────────────────────────────

#[derive(Default)]
struct DurableInner {
    definitions: HashMap<Uuid, ProcessDefinitionRecord>,
    instances: HashMap<Uuid, ProcessInstanceRecord>,
    // keyed (instance, scope, name)
    variables: HashMap<(Uuid, Option<String>, String), VariableRecord>,
    activities: HashMap<Uuid, Vec<ActivityLogRecord>>,
}

pub struct MemoryDurableStore {
    inner: RwLock<DurableInner>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(DurableInner::default()),
        }
    }
}

impl Default for MemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn save_definition(&self, definition: &ProcessDefinitionRecord) -> Result<()> {
        let mut w = self.inner.write().await;
        w.definitions.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn load_definition(&self, id: Uuid) -> Result<Option<ProcessDefinitionRecord>> {
        let r = self.inner.read().await;
        Ok(r.definitions.get(&id).cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<ProcessDefinitionRecord>> {
        let r = self.inner.read().await;
        let mut defs: Vec<_> = r.definitions.values().cloned().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(defs)
    }

    async fn save_instance(&self, instance: &ProcessInstanceRecord) -> Result<()> {
        let mut w = self.inner.write().await;
        w.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn load_instance(&self, id: Uuid) -> Result<Option<ProcessInstanceRecord>> {
        let r = self.inner.read().await;
        Ok(r.instances.get(&id).cloned())
    }

    async fn list_instances(&self) -> Result<Vec<ProcessInstanceRecord>> {
        let r = self.inner.read().await;
        let mut instances: Vec<_> = r.instances.values().cloned().collect();
        instances.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(instances)
    }

    async fn update_instance_status(
        &self,
        id: Uuid,
        status: InstanceStatus,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        let instance = w
            .instances
            .get_mut(&id)
            .ok_or(EngineError::InstanceNotFound(id))?;
        instance.status = status;
        if end_time.is_some() {
            instance.end_time = end_time;
        }
        Ok(())
    }

    async fn upsert_variable(&self, variable: &VariableRecord) -> Result<()> {
        let mut w = self.inner.write().await;
        let key = (
            variable.instance_id,
            variable.scope_id.clone(),
            variable.name.clone(),
        );
        match w.variables.get_mut(&key) {
            Some(existing) => {
                existing.value = variable.value.clone();
                existing.version += 1;
            }
            None => {
                w.variables.insert(key, variable.clone());
            }
        }
        Ok(())
    }

    async fn load_variables(
        &self,
        instance_id: Uuid,
        scope_id: Option<&str>,
    ) -> Result<Vec<VariableRecord>> {
        let r = self.inner.read().await;
        let mut out: Vec<_> = r
            .variables
            .values()
            .filter(|v| v.instance_id == instance_id)
            .filter(|v| scope_id.is_none() || v.scope_id.as_deref() == scope_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn append_activity(&self, entry: &ActivityLogRecord) -> Result<()> {
        let mut w = self.inner.write().await;
        w.activities
            .entry(entry.instance_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn read_activities(&self, instance_id: Uuid) -> Result<Vec<ActivityLogRecord>> {
        let r = self.inner.read().await;
        Ok(r.activities.get(&instance_id).cloned().unwrap_or_default())
    }
}

// ─── Runtime store ────────────────────────────────────────────

#[derive(Default)]
struct RuntimeInner {
    // ordered token list per instance, as the fast store keeps it
    tokens: HashMap<Uuid, Vec<Token>>,
    variables: HashMap<Uuid, BTreeMap<String, VariableValue>>,
    locks: HashMap<Uuid, Instant>,
    subscriptions: Vec<Subscription>,
    compensation: HashMap<Uuid, Vec<CompensationEntry>>,
    transactions: HashMap<Uuid, TransactionRecord>,
    timer_metadata: HashMap<(Uuid, String), TimerMetadata>,
    token_timers: HashMap<(Uuid, String), TokenTimer>,
}

pub struct MemoryRuntimeStore {
    inner: RwLock<RuntimeInner>,
}

impl MemoryRuntimeStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RuntimeInner::default()),
        }
    }
}

impl Default for MemoryRuntimeStore {
    fn default() -> Self {
        Self::new()
    }
}

fn var_key(scope_id: Option<&str>, name: &str) -> String {
    match scope_id {
        Some(scope) => format!("{scope}:{name}"),
        None => name.to_string(),
    }
}

fn position_matches(token: &Token, node_id: &str, scope_id: Option<&str>) -> bool {
    token.node_id == node_id && token.scope_id.as_deref() == scope_id
}

#[async_trait]
impl RuntimeStore for MemoryRuntimeStore {
    async fn add_token(&self, token: &Token) -> Result<()> {
        let mut w = self.inner.write().await;
        w.tokens
            .entry(token.instance_id)
            .or_default()
            .push(token.clone());
        Ok(())
    }

    async fn swap_tokens(
        &self,
        instance_id: Uuid,
        remove: &[(String, Option<String>)],
        insert: &[Token],
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        let list = w.tokens.entry(instance_id).or_default();
        for (node_id, scope_id) in remove {
            list.retain(|t| !position_matches(t, node_id, scope_id.as_deref()));
        }
        list.extend(insert.iter().cloned());
        Ok(())
    }

    async fn get_token(
        &self,
        instance_id: Uuid,
        node_id: &str,
        scope_id: Option<&str>,
    ) -> Result<Option<Token>> {
        let r = self.inner.read().await;
        Ok(r.tokens.get(&instance_id).and_then(|list| {
            list.iter()
                .find(|t| position_matches(t, node_id, scope_id))
                .cloned()
        }))
    }

    async fn get_token_by_id(&self, instance_id: Uuid, token_id: Uuid) -> Result<Option<Token>> {
        let r = self.inner.read().await;
        Ok(r.tokens
            .get(&instance_id)
            .and_then(|list| list.iter().find(|t| t.id == token_id).cloned()))
    }

    async fn list_tokens(&self, instance_id: Uuid) -> Result<Vec<Token>> {
        let r = self.inner.read().await;
        Ok(r.tokens.get(&instance_id).cloned().unwrap_or_default())
    }

    async fn update_token_state(
        &self,
        instance_id: Uuid,
        node_id: &str,
        scope_id: Option<&str>,
        state: TokenState,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        let token = w
            .tokens
            .get_mut(&instance_id)
            .and_then(|list| {
                list.iter_mut()
                    .find(|t| position_matches(t, node_id, scope_id))
            })
            .ok_or_else(|| EngineError::TokenNotFound {
                instance_id,
                node_id: node_id.to_string(),
            })?;
        token.state = state;
        Ok(())
    }

    async fn update_token_state_by_id(
        &self,
        instance_id: Uuid,
        token_id: Uuid,
        state: TokenState,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        let token = w
            .tokens
            .get_mut(&instance_id)
            .and_then(|list| list.iter_mut().find(|t| t.id == token_id))
            .ok_or_else(|| EngineError::TokenNotFound {
                instance_id,
                node_id: token_id.to_string(),
            })?;
        token.state = state;
        Ok(())
    }

    async fn merge_token_data(
        &self,
        instance_id: Uuid,
        node_id: &str,
        scope_id: Option<&str>,
        entries: &BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        let token = w
            .tokens
            .get_mut(&instance_id)
            .and_then(|list| {
                list.iter_mut()
                    .find(|t| position_matches(t, node_id, scope_id))
            })
            .ok_or_else(|| EngineError::TokenNotFound {
                instance_id,
                node_id: node_id.to_string(),
            })?;
        for (k, v) in entries {
            token.data.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn clear_scope_tokens(
        &self,
        instance_id: Uuid,
        scope_prefix: Option<&str>,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        match scope_prefix {
            None => {
                w.tokens.remove(&instance_id);
            }
            Some(prefix) => {
                if let Some(list) = w.tokens.get_mut(&instance_id) {
                    list.retain(|t| {
                        !t.scope_id
                            .as_deref()
                            .map(|s| s == prefix || s.starts_with(&format!("{prefix}/")))
                            .unwrap_or(false)
                    });
                }
            }
        }
        Ok(())
    }

    async fn set_variable(
        &self,
        instance_id: Uuid,
        scope_id: Option<&str>,
        name: &str,
        value: &VariableValue,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        w.variables
            .entry(instance_id)
            .or_default()
            .insert(var_key(scope_id, name), value.clone());
        Ok(())
    }

    async fn get_variable(
        &self,
        instance_id: Uuid,
        scope_id: Option<&str>,
        name: &str,
    ) -> Result<Option<VariableValue>> {
        let r = self.inner.read().await;
        Ok(r.variables
            .get(&instance_id)
            .and_then(|vars| vars.get(&var_key(scope_id, name)))
            .cloned())
    }

    async fn list_variables(&self, instance_id: Uuid) -> Result<BTreeMap<String, VariableValue>> {
        let r = self.inner.read().await;
        Ok(r.variables.get(&instance_id).cloned().unwrap_or_default())
    }

    async fn acquire_lock(&self, instance_id: Uuid, ttl: Duration) -> Result<bool> {
        let mut w = self.inner.write().await;
        let now = Instant::now();
        match w.locks.get(&instance_id) {
            Some(expiry) if *expiry > now => Ok(false),
            _ => {
                w.locks.insert(instance_id, now + ttl);
                Ok(true)
            }
        }
    }

    async fn refresh_lock(&self, instance_id: Uuid, ttl: Duration) -> Result<()> {
        let mut w = self.inner.write().await;
        w.locks.insert(instance_id, Instant::now() + ttl);
        Ok(())
    }

    async fn release_lock(&self, instance_id: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        w.locks.remove(&instance_id);
        Ok(())
    }

    async fn put_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut w = self.inner.write().await;
        let exists = w.subscriptions.iter().any(|s| {
            s.kind == subscription.kind
                && s.name == subscription.name
                && s.instance_id == subscription.instance_id
                && s.node_id == subscription.node_id
        });
        if !exists {
            w.subscriptions.push(subscription.clone());
        }
        Ok(())
    }

    async fn remove_subscription(
        &self,
        kind: SubscriptionKind,
        name: &str,
        instance_id: Uuid,
        node_id: &str,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        w.subscriptions.retain(|s| {
            !(s.kind == kind
                && s.name == name
                && s.instance_id == instance_id
                && s.node_id == node_id)
        });
        Ok(())
    }

    async fn find_subscriptions(
        &self,
        kind: SubscriptionKind,
        name: &str,
    ) -> Result<Vec<Subscription>> {
        let r = self.inner.read().await;
        Ok(r.subscriptions
            .iter()
            .filter(|s| s.kind == kind && s.name == name)
            .cloned()
            .collect())
    }

    async fn list_instance_subscriptions(&self, instance_id: Uuid) -> Result<Vec<Subscription>> {
        let r = self.inner.read().await;
        Ok(r.subscriptions
            .iter()
            .filter(|s| s.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn push_compensation(&self, instance_id: Uuid, entry: &CompensationEntry) -> Result<()> {
        let mut w = self.inner.write().await;
        w.compensation
            .entry(instance_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn compensation_entries(&self, instance_id: Uuid) -> Result<Vec<CompensationEntry>> {
        let r = self.inner.read().await;
        Ok(r.compensation.get(&instance_id).cloned().unwrap_or_default())
    }

    async fn clear_compensation(&self, instance_id: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        w.compensation.remove(&instance_id);
        Ok(())
    }

    async fn put_transaction(&self, transaction: &TransactionRecord) -> Result<()> {
        let mut w = self.inner.write().await;
        w.transactions
            .insert(transaction.instance_id, transaction.clone());
        Ok(())
    }

    async fn get_transaction(&self, instance_id: Uuid) -> Result<Option<TransactionRecord>> {
        let r = self.inner.read().await;
        Ok(r.transactions.get(&instance_id).cloned())
    }

    async fn remove_transaction(&self, instance_id: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        w.transactions.remove(&instance_id);
        Ok(())
    }

    async fn put_timer_metadata(&self, metadata: &TimerMetadata) -> Result<()> {
        let mut w = self.inner.write().await;
        w.timer_metadata.insert(
            (metadata.definition_id, metadata.node_id.clone()),
            metadata.clone(),
        );
        Ok(())
    }

    async fn list_timer_metadata(&self) -> Result<Vec<TimerMetadata>> {
        let r = self.inner.read().await;
        Ok(r.timer_metadata.values().cloned().collect())
    }

    async fn remove_timer_metadata(&self, definition_id: Uuid, node_id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        w.timer_metadata.remove(&(definition_id, node_id.to_string()));
        Ok(())
    }

    async fn put_token_timer(&self, timer: &TokenTimer) -> Result<()> {
        let mut w = self.inner.write().await;
        w.token_timers
            .insert((timer.instance_id, timer.node_id.clone()), timer.clone());
        Ok(())
    }

    async fn list_token_timers(&self) -> Result<Vec<TokenTimer>> {
        let r = self.inner.read().await;
        Ok(r.token_timers.values().cloned().collect())
    }

    async fn remove_token_timer(&self, instance_id: Uuid, node_id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        w.token_timers.remove(&(instance_id, node_id.to_string()));
        Ok(())
    }

    async fn clear_instance(&self, instance_id: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        w.tokens.remove(&instance_id);
        w.variables.remove(&instance_id);
        w.locks.remove(&instance_id);
        w.subscriptions.retain(|s| s.instance_id != instance_id);
        w.compensation.remove(&instance_id);
        w.transactions.remove(&instance_id);
        w.token_timers.retain(|(iid, _), _| *iid != instance_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn swap_is_atomic_replace() {
        let store = MemoryRuntimeStore::new();
        let iid = Uuid::now_v7();
        let t = Token::new(iid, "Gw_1");
        store.add_token(&t).await.unwrap();

        let a = t.copied_to("Task_A");
        let b = t.copied_to("Task_B");
        store
            .swap_tokens(iid, &[("Gw_1".to_string(), None)], &[a, b])
            .await
            .unwrap();

        let tokens = store.list_tokens(iid).await.unwrap();
        assert_eq!(tokens.len(), 2);
        assert!(tokens.iter().all(|t| t.node_id != "Gw_1"));
    }

    #[tokio::test]
    async fn scope_prefix_clearing() {
        let store = MemoryRuntimeStore::new();
        let iid = Uuid::now_v7();
        for scope in ["A_instance_0", "A_instance_1", "B_instance_0"] {
            store
                .add_token(&Token::new(iid, "Inner").with_scope(Some(scope.into())))
                .await
                .unwrap();
        }
        store
            .add_token(&Token::new(iid, "Outer"))
            .await
            .unwrap();

        store.clear_scope_tokens(iid, Some("A_instance_0")).await.unwrap();
        let remaining = store.list_tokens(iid).await.unwrap();
        assert_eq!(remaining.len(), 3);

        store.clear_scope_tokens(iid, None).await.unwrap();
        assert!(store.list_tokens(iid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lock_ttl() {
        let store = MemoryRuntimeStore::new();
        let iid = Uuid::now_v7();
        assert!(store
            .acquire_lock(iid, Duration::from_secs(30))
            .await
            .unwrap());
        assert!(!store
            .acquire_lock(iid, Duration::from_secs(30))
            .await
            .unwrap());
        store.release_lock(iid).await.unwrap();
        assert!(store
            .acquire_lock(iid, Duration::from_secs(30))
            .await
            .unwrap());
        // expired locks are reacquirable
        store.refresh_lock(iid, Duration::from_millis(0)).await.unwrap();
        assert!(store
            .acquire_lock(iid, Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn variable_cache_keys_include_scope() {
        let store = MemoryRuntimeStore::new();
        let iid = Uuid::now_v7();
        let global = VariableValue::infer(json!("outer"));
        let scoped = VariableValue::infer(json!("inner"));
        store.set_variable(iid, None, "x", &global).await.unwrap();
        store
            .set_variable(iid, Some("Sub_1"), "x", &scoped)
            .await
            .unwrap();

        let all = store.list_variables(iid).await.unwrap();
        assert_eq!(all.get("x").unwrap().value, json!("outer"));
        assert_eq!(all.get("Sub_1:x").unwrap().value, json!("inner"));
    }

    #[tokio::test]
    async fn durable_variable_versioning() {
        let store = MemoryDurableStore::new();
        let iid = Uuid::now_v7();
        let mut var = VariableRecord {
            instance_id: iid,
            scope_id: None,
            name: "count".into(),
            value: VariableValue::infer(json!(1)),
            version: 1,
        };
        store.upsert_variable(&var).await.unwrap();
        var.value = VariableValue::infer(json!(2));
        store.upsert_variable(&var).await.unwrap();

        let vars = store.load_variables(iid, None).await.unwrap();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].version, 2);
        assert_eq!(vars[0].value.value, json!(2));
    }

    #[tokio::test]
    async fn clear_instance_removes_everything() {
        let store = MemoryRuntimeStore::new();
        let iid = Uuid::now_v7();
        store.add_token(&Token::new(iid, "Task_1")).await.unwrap();
        store
            .put_subscription(&Subscription {
                kind: SubscriptionKind::Message,
                name: "order".into(),
                instance_id: iid,
                node_id: "Msg_1".into(),
                correlation_value: None,
            })
            .await
            .unwrap();
        store.acquire_lock(iid, Duration::from_secs(30)).await.unwrap();

        store.clear_instance(iid).await.unwrap();
        assert!(store.list_tokens(iid).await.unwrap().is_empty());
        assert!(store
            .list_instance_subscriptions(iid)
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .acquire_lock(iid, Duration::from_secs(30))
            .await
            .unwrap());
    }
}
