pub mod broker;
pub mod market_data;
pub mod pg_bus;
pub mod postgres;

pub use broker::{Broker, OrderOutcome, PaperBroker};
pub use market_data::{
    CyclePhase, FundamentalSnapshot, MacroIndicators, MarketDataProvider, Metric, SentimentProvider,
    StaticMarketData,
};
pub use pg_bus::PgBus;
pub use postgres::PgLedger;
