pub mod allocation;
pub mod order;
pub mod performance;
pub mod risk;
pub mod signal;
pub mod state;

pub use allocation::*;
pub use order::*;
pub use performance::*;
pub use risk::*;
pub use signal::*;
pub use state::*;
