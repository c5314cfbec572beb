//! Pluggable service-task implementations.
//!
//! The registry is an injected interface: the engine receives it at
//! construction and the embedder populates it before starting workers.
//! Implementations return arbitrary embedder errors (`anyhow`); the task
//! executor wraps them into the engine taxonomy.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::types::{Token, VariableValue};

/// Execution context handed to a service task.
pub struct ServiceContext<'a> {
    pub token: &'a Token,
    /// Scope-resolved variables visible to the task.
    pub variables: BTreeMap<String, VariableValue>,
    pub task_id: &'a str,
    pub instance_id: Uuid,
}

#[async_trait]
pub trait ServiceTask: Send + Sync {
    /// The name `serviceTaskConfig[taskName]` resolves against.
    fn name(&self) -> &str;

    async fn execute(
        &self,
        context: ServiceContext<'_>,
        properties: &BTreeMap<String, serde_json::Value>,
    ) -> anyhow::Result<serde_json::Value>;
}

#[derive(Default)]
pub struct ServiceTaskRegistry {
    tasks: RwLock<HashMap<String, Arc<dyn ServiceTask>>>,
}

impl ServiceTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task: Arc<dyn ServiceTask>) {
        let mut w = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        w.insert(task.name().to_string(), task);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceTask>> {
        let r = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        r.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let r = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = r.keys().cloned().collect();
        names.sort();
        names
    }
}
