use crate::config::EngineConfig;
use crate::domain::money::Currency;
use crate::domain::ports::CurrencyRegistry;
use std::collections::HashSet;

/// Registry backed by a fixed set of codes.
#[derive(Debug, Clone, Default)]
pub struct StaticCurrencyRegistry {
    codes: HashSet<Currency>,
}

impl StaticCurrencyRegistry {
    pub fn new(codes: impl IntoIterator<Item = Currency>) -> Self {
        Self {
            codes: codes.into_iter().collect(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.supported_currencies.iter().cloned())
    }
}

impl CurrencyRegistry for StaticCurrencyRegistry {
    fn is_supported(&self, currency: &Currency) -> bool {
        self.codes.contains(currency)
    }
}
