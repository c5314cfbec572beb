//! Event bus bridge.
//!
//! External triggers (HTTP calls, timer fires, correlated messages) publish
//! `process.started`; the consumer side ensures the instance exists and
//! drives its run loop. The engine is idempotent to redelivery: a duplicate
//! `process.started` for the same instance reuses the row and cannot plant a
//! second initial token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use crate::engine::ProcessEngine;
use crate::error::{EngineError, Result};
use crate::types::VariableValue;

/// The `process.started` message.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ProcessStartedEvent {
    pub instance_id: Uuid,
    pub definition_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<BTreeMap<String, VariableValue>>,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl ProcessStartedEvent {
    pub fn new(instance_id: Uuid, definition_id: Uuid, source: impl Into<String>) -> Self {
        Self {
            instance_id,
            definition_id,
            variables: None,
            source: source.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Producer side of the bus. The delivery/retry/DLQ machinery belongs to the
/// bus implementation, not the engine.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish_process_started(&self, event: ProcessStartedEvent) -> Result<()>;
}

/// Channel-backed bus for tests and single-process deployments.
pub struct InMemoryEventBus {
    tx: mpsc::UnboundedSender<ProcessStartedEvent>,
}

impl InMemoryEventBus {
    /// The bus and its consumer end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProcessStartedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish_process_started(&self, event: ProcessStartedEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|e| EngineError::Bus(e.to_string()))
    }
}

/// Consumes `process.started` and hands each event to the engine.
pub struct EventBusBridge {
    engine: Arc<ProcessEngine>,
    receiver: mpsc::UnboundedReceiver<ProcessStartedEvent>,
}

impl EventBusBridge {
    pub fn new(
        engine: Arc<ProcessEngine>,
        receiver: mpsc::UnboundedReceiver<ProcessStartedEvent>,
    ) -> Self {
        Self { engine, receiver }
    }

    /// Handle one delivery: idempotent instance creation, then the run loop.
    pub async fn handle(engine: &ProcessEngine, event: ProcessStartedEvent) -> Result<()> {
        info!(
            instance = %event.instance_id,
            definition = %event.definition_id,
            source = %event.source,
            "process.started received"
        );
        engine
            .create_instance(
                event.definition_id,
                Some(event.instance_id),
                event.variables,
                None,
            )
            .await?;
        Ok(())
    }

    /// Consume until the producer side closes. Per-event failures are logged
    /// and do not stop the consumer; redelivery is the bus's concern.
    pub async fn run(mut self) {
        while let Some(event) = self.receiver.recv().await {
            let instance_id = event.instance_id;
            if let Err(e) = Self::handle(&self.engine, event).await {
                error!(instance = %instance_id, "process.started handling failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bus_delivers_in_order() {
        let (bus, mut rx) = InMemoryEventBus::channel();
        let def = Uuid::now_v7();
        let a = ProcessStartedEvent::new(Uuid::now_v7(), def, "test");
        let b = ProcessStartedEvent::new(Uuid::now_v7(), def, "test");
        bus.publish_process_started(a.clone()).await.unwrap();
        bus.publish_process_started(b.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().instance_id, a.instance_id);
        assert_eq!(rx.recv().await.unwrap().instance_id, b.instance_id);
    }
}
