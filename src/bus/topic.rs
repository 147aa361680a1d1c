use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{QuorumError, Result};

const SIGNALS_PREFIX: &str = "signals.";

/// Logical bus topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// `signals.<producer_id>`
    Signals(String),
    Allocations,
    Transactions,
    RiskIntervention,
    RiskRecovery,
    /// Periodic risk metrics broadcast
    RiskReport,
}

impl Topic {
    pub fn signals(producer_id: impl Into<String>) -> Self {
        Topic::Signals(producer_id.into())
    }

    pub fn name(&self) -> String {
        match self {
            Topic::Signals(producer) => format!("{SIGNALS_PREFIX}{producer}"),
            Topic::Allocations => "allocations".to_string(),
            Topic::Transactions => "transactions".to_string(),
            Topic::RiskIntervention => "risk.intervention".to_string(),
            Topic::RiskRecovery => "risk.recovery".to_string(),
            Topic::RiskReport => "risk.report".to_string(),
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "allocations" => Ok(Topic::Allocations),
            "transactions" => Ok(Topic::Transactions),
            "risk.intervention" => Ok(Topic::RiskIntervention),
            "risk.recovery" => Ok(Topic::RiskRecovery),
            "risk.report" => Ok(Topic::RiskReport),
            other => match other.strip_prefix(SIGNALS_PREFIX) {
                Some(producer) if !producer.is_empty() => Ok(Topic::Signals(producer.to_string())),
                _ => Err(QuorumError::MalformedMessage {
                    topic: other.to_string(),
                    reason: "unknown topic".to_string(),
                }),
            },
        }
    }

    /// Control topics pre-empt normal flow
    pub fn priority(&self) -> MessagePriority {
        match self {
            Topic::RiskIntervention | Topic::RiskRecovery => MessagePriority::Critical,
            _ => MessagePriority::Normal,
        }
    }

    pub fn is_control(&self) -> bool {
        self.priority() == MessagePriority::Critical
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Serialize for Topic {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Topic::parse(&name).map_err(serde::de::Error::custom)
    }
}

/// Delivery priority inside an agent's inbox (smaller is more urgent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessagePriority {
    Critical = 0,
    Normal = 1,
}

/// Which topics a subscription receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFilter {
    Exact(Topic),
    /// Every `signals.*` topic, including producers that appear later
    AllSignals,
    Any(Vec<TopicFilter>),
}

impl TopicFilter {
    pub fn any(filters: impl IntoIterator<Item = TopicFilter>) -> Self {
        TopicFilter::Any(filters.into_iter().collect())
    }

    pub fn exact(topic: Topic) -> Self {
        TopicFilter::Exact(topic)
    }

    pub fn matches(&self, topic: &Topic) -> bool {
        match self {
            TopicFilter::Exact(t) => t == topic,
            TopicFilter::AllSignals => matches!(topic, Topic::Signals(_)),
            TopicFilter::Any(filters) => filters.iter().any(|f| f.matches(topic)),
        }
    }

    /// Leaf filters, flattened
    pub fn leaves(&self) -> Vec<TopicFilter> {
        match self {
            TopicFilter::Any(filters) => filters.iter().flat_map(|f| f.leaves()).collect(),
            leaf => vec![leaf.clone()],
        }
    }
}
