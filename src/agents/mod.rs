//! Agents: one task per role, each owning its main loop
//!
//! Each agent implements `Agent` and talks to the rest of the system only through
//! the bus and the ledger handed to it in `AgentContext`.

pub mod analyst;
pub mod context;
pub mod manager;
pub mod risk;
pub mod trader;
pub mod traits;

pub use analyst::{AnalystAgent, Profile};
pub use context::AgentContext;
pub use manager::ManagerAgent;
pub use risk::RiskAgent;
pub use trader::TraderAgent;
pub use traits::{Agent, AgentRole};

use tracing::{error, warn};

use crate::bus::{Envelope, Inbox, Subscription};
use crate::error::{QuorumError, Result};

/// Pending deliveries an agent holds before acting
pub const INBOX_CAPACITY: usize = 1024;

/// Let fatal errors through, log everything else
pub(crate) fn only_fatal(agent: &str, op: &str, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => {
            error!(agent, op, error = %e, "ledger unreachable, refusing to act");
            Err(e)
        }
        Err(e) => {
            warn!(agent, op, error = %e, "operation failed");
            Ok(())
        }
    }
}

/// Queue the first delivery plus everything already waiting behind it.
///
/// `Err(BusClosed)` once the subscription has ended.
pub(crate) fn collect_deliveries(
    first: Option<Envelope>,
    subscription: &mut Subscription,
    inbox: &mut Inbox,
) -> Result<()> {
    let Some(first) = first else {
        return Err(QuorumError::BusClosed(format!(
            "subscription of {} ended",
            subscription.consumer()
        )));
    };
    inbox.push(first);
    inbox.fill_from(subscription);
    Ok(())
}
