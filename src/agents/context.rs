//! AgentContext: an agent's handles to the bus, the ledger and shutdown

use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::bus::{Envelope, Publisher, SignalBus, Subscription, TopicFilter};
use crate::error::{QuorumError, Result};
use crate::ledger::{Ledger, RetryPolicy};
use crate::persistence::DeadLetterSink;

/// Context given to each agent when spawned. Not Clone: it owns the shutdown receiver
pub struct AgentContext {
    pub agent_id: String,
    pub bus: Arc<dyn SignalBus>,
    pub ledger: Arc<dyn Ledger>,
    pub retry: RetryPolicy,
    dead_letters: DeadLetterSink,
    shutdown: broadcast::Receiver<()>,
}

impl AgentContext {
    pub fn new(
        agent_id: impl Into<String>,
        bus: Arc<dyn SignalBus>,
        ledger: Arc<dyn Ledger>,
        retry: RetryPolicy,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let dead_letters = DeadLetterSink::new(ledger.clone(), bus.clone(), retry.clone());
        Self {
            agent_id: agent_id.into(),
            bus,
            ledger,
            retry,
            dead_letters,
            shutdown,
        }
    }

    /// Publisher stamping this agent's sequence ids
    pub async fn publisher(&self) -> Result<Publisher> {
        let bus = &self.bus;
        let agent_id = &self.agent_id;
        self.retry
            .run("publisher_init", move || Publisher::new(bus.clone(), agent_id.clone()))
            .await
    }

    /// Subscribe under this agent's id
    pub async fn subscribe(&self, filter: TopicFilter) -> Result<Subscription> {
        self.bus.subscribe(&self.agent_id, filter).await
    }

    pub async fn ack(&self, envelope: &Envelope) -> Result<()> {
        let bus = &self.bus;
        let agent_id = &self.agent_id;
        self.retry
            .run("ack", move || bus.ack(agent_id, envelope))
            .await
    }

    /// Park an undecodable delivery
    pub async fn dead_letter(&self, envelope: &Envelope, cause: &QuorumError) -> Result<()> {
        self.dead_letters.route(&self.agent_id, envelope, cause).await
    }

    /// Run a ledger operation under the retry policy
    pub async fn with_retry<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry.run(op_name, op).await
    }

    /// Mutable access to the shutdown receiver (for use in select! macros)
    pub fn shutdown_rx(&mut self) -> &mut broadcast::Receiver<()> {
        &mut self.shutdown
    }

    /// Non-blocking shutdown check
    pub fn is_shutting_down(&mut self) -> bool {
        !matches!(
            self.shutdown.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        )
    }
}
