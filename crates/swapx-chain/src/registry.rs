use std::collections::HashMap;
use std::sync::Arc;

use swapx_core::types::ChainId;
use swapx_core::SwapxError;

use crate::adapter::ChainAdapter;

/// Adapter lookup by chain id, built once at startup and shared.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ChainId, Arc<dyn ChainAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.insert(adapter.chain_id().clone(), adapter);
    }

    pub fn get(&self, chain_id: &ChainId) -> Result<Arc<dyn ChainAdapter>, SwapxError> {
        self.adapters
            .get(chain_id)
            .cloned()
            .ok_or_else(|| SwapxError::ChainNotConfigured(chain_id.to_string()))
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        self.adapters.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChain;
    use swapx_core::config::ChainKind;

    #[test]
    fn lookup_by_chain_id() {
        let mut reg = AdapterRegistry::new();
        reg.insert(Arc::new(MockChain::new(ChainId::new("ETH"), ChainKind::Account, 18)));
        assert!(reg.get(&ChainId::new("ETH")).is_ok());
        assert!(matches!(
            reg.get(&ChainId::new("SOL")),
            Err(SwapxError::ChainNotConfigured(_))
        ));
    }
}
