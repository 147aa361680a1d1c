//! Agent trait: every role owns its main loop
//!
//! `run()` consumes the agent: it is a one-shot task spawned on tokio and returns on
//! shutdown or on a fatal error.

use async_trait::async_trait;
use std::fmt;

use crate::error::Result;

use super::context::AgentContext;

/// Role of an agent in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentRole {
    Analyst,
    Manager,
    Trader,
    Risk,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Analyst => "analyst",
            AgentRole::Manager => "manager",
            AgentRole::Trader => "trader",
            AgentRole::Risk => "risk",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[async_trait]
pub trait Agent: Send + 'static {
    /// Unique identifier; also the bus consumer and producer name
    fn id(&self) -> &str;

    fn role(&self) -> AgentRole;

    /// Main agent loop
    async fn run(self, ctx: AgentContext) -> Result<()>;
}
