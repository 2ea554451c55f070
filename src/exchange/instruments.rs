use dashmap::DashMap;
use tracing::debug;

use super::ExchangeClient;
use crate::domain::InstrumentRules;
use crate::error::{Result, RiskonError};

/// Instrument rules fetched once per symbol per session
#[derive(Debug, Default)]
pub struct InstrumentCache {
    rules: DashMap<String, InstrumentRules>,
}

impl InstrumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, exchange: &dyn ExchangeClient, symbol: &str) -> Result<InstrumentRules> {
        if let Some(rules) = self.rules.get(symbol) {
            return Ok(rules.clone());
        }

        let rules = exchange.get_instrument_rules(symbol).await?;
        rules
            .validate()
            .map_err(|errors| RiskonError::InvalidInstrument(errors.join("; ")))?;

        debug!(symbol, "Cached instrument rules from {}", exchange.name());
        // A concurrent fetch may have won; both carry the same session rules
        let entry = self.rules.entry(symbol.to_string()).or_insert(rules);
        Ok(entry.value().clone())
    }

    pub fn insert(&self, rules: InstrumentRules) {
        self.rules.insert(rules.symbol.clone(), rules);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
