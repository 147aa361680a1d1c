//! Persistence helpers layered on the ledger
//!
//! - Dead letter sink for messages that cannot be decoded

pub mod dead_letter;

pub use dead_letter::{DeadLetterSink, DeadLetterStats};
