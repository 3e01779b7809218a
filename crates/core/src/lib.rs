pub mod config;
pub mod models;

use std::sync::Mutex;

use async_trait::async_trait;

/// Capability for publishing pipeline events to an external event log or
/// queue. The queue itself is not part of this service; consumers (worker
/// schedulers, audit sinks) subscribe on the other side.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event_type: &str, payload: serde_json::Value) -> anyhow::Result<()>;
}

/// Publisher that logs events instead of forwarding them anywhere. Suitable
/// for single-process deployments without an event bus.
pub struct TracingEventPublisher;

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(&self, event_type: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        tracing::debug!(event_type, %payload, "Published event");
        Ok(())
    }
}

/// Publisher that records events in memory, for tests and local inspection.
#[derive(Default)]
pub struct MemoryEventPublisher {
    events: Mutex<Vec<(String, serde_json::Value)>>,
}

#[async_trait]
impl EventPublisher for MemoryEventPublisher {
    async fn publish(&self, event_type: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        self.events.lock().unwrap().push((event_type.to_string(), payload));
        Ok(())
    }
}

impl MemoryEventPublisher {
    pub fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }
}
