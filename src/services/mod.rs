pub mod metrics_aggregator;
pub mod price_cache;
pub mod runner;

pub use price_cache::PriceCache;
