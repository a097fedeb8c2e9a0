use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Last known market price per asset/market id, fed by the stream consumer
/// and read by the metrics aggregator for unrealized-PnL marks.
#[derive(Clone, Default)]
pub struct PriceCache {
    inner: Arc<RwLock<HashMap<String, Decimal>>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, id: &str, price: Decimal) {
        if price <= Decimal::ZERO {
            return;
        }
        if let Ok(mut map) = self.inner.write() {
            map.insert(id.to_string(), price);
        }
    }

    pub fn get(&self, id: &str) -> Option<Decimal> {
        self.inner.read().ok().and_then(|map| map.get(id).copied())
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
