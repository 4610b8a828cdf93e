//! Re-materialization strategies and the fallback chain
//!
//! The chain is built once from the store's capabilities:
//! 1. primary: `native_view` when the store has native views, otherwise
//!    `transactional_reinsert`
//! 2. `bulk_procedure`, when the store registers one
//! 3. `transactional_reinsert`, when the store allows row mutation
//!
//! A strategy is never repeated. Success through anything but the first entry
//! makes the cycle DEGRADED.

use super::RefreshError;
use async_trait::async_trait;
use ppm_common::db::models::AggregateRow;
use ppm_common::store::{AggregateStore, StoreCapabilities};
use ppm_common::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[async_trait]
pub trait RefreshStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Publish `rows` as the new aggregate; on error the previous snapshot must remain
    async fn apply(&self, store: &dyn AggregateStore, rows: &[AggregateRow]) -> Result<()>;
}

/// Refresh-in-place of the store's materialized view
pub struct NativeViewRefresh;

#[async_trait]
impl RefreshStrategy for NativeViewRefresh {
    fn name(&self) -> &'static str {
        "native_view"
    }

    async fn apply(&self, store: &dyn AggregateStore, rows: &[AggregateRow]) -> Result<()> {
        store.refresh_native_view(rows).await
    }
}

/// Engine-registered bulk refresh procedure
pub struct BulkProcedure;

#[async_trait]
impl RefreshStrategy for BulkProcedure {
    fn name(&self) -> &'static str {
        "bulk_procedure"
    }

    async fn apply(&self, store: &dyn AggregateStore, rows: &[AggregateRow]) -> Result<()> {
        store.run_bulk_procedure(rows).await
    }
}

/// Delete + reinsert inside a single transaction
pub struct TransactionalReinsert;

#[async_trait]
impl RefreshStrategy for TransactionalReinsert {
    fn name(&self) -> &'static str {
        "transactional_reinsert"
    }

    async fn apply(&self, store: &dyn AggregateStore, rows: &[AggregateRow]) -> Result<()> {
        store.replace_all(rows).await
    }
}

/// One failed strategy attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyFailure {
    pub strategy: String,
    pub error: String,
}

/// How a successful publish went
#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutcome {
    pub strategy: &'static str,
    /// Earlier strategies that failed before `strategy` succeeded
    pub failures: Vec<StrategyFailure>,
}

impl ChainOutcome {
    pub fn degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Clone)]
pub struct StrategyChain {
    strategies: Vec<Arc<dyn RefreshStrategy>>,
}

impl std::fmt::Debug for StrategyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl StrategyChain {
    /// Explicit chain, primary first
    pub fn new(strategies: Vec<Arc<dyn RefreshStrategy>>) -> Result<Self> {
        if strategies.is_empty() {
            return Err(Error::Config("refresh strategy chain is empty".to_string()));
        }
        Ok(Self { strategies })
    }

    pub fn for_capabilities(capabilities: StoreCapabilities) -> Result<Self> {
        let mut strategies: Vec<Arc<dyn RefreshStrategy>> = Vec::new();

        if capabilities.native_views {
            strategies.push(Arc::new(NativeViewRefresh));
            if capabilities.bulk_procedure {
                strategies.push(Arc::new(BulkProcedure));
            }
            if capabilities.row_mutation {
                strategies.push(Arc::new(TransactionalReinsert));
            }
        } else {
            if capabilities.row_mutation {
                strategies.push(Arc::new(TransactionalReinsert));
            }
            if capabilities.bulk_procedure {
                strategies.push(Arc::new(BulkProcedure));
            }
        }

        if strategies.is_empty() {
            return Err(Error::Config(format!(
                "store offers no refresh path (capabilities {:?})",
                capabilities
            )));
        }
        Ok(Self { strategies })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Try each strategy in order until one publishes
    pub async fn publish(
        &self,
        store: &dyn AggregateStore,
        rows: &[AggregateRow],
    ) -> std::result::Result<ChainOutcome, RefreshError> {
        let mut failures = Vec::new();

        for strategy in &self.strategies {
            debug!(strategy = strategy.name(), rows = rows.len(), "Publishing aggregate");
            match strategy.apply(store, rows).await {
                Ok(()) => {
                    return Ok(ChainOutcome {
                        strategy: strategy.name(),
                        failures,
                    })
                }
                Err(e) => {
                    let error = RefreshError::Strategy {
                        strategy: strategy.name().to_string(),
                        message: e.to_string(),
                    };
                    warn!(error = %error, "Refresh strategy failed, trying next");
                    failures.push(StrategyFailure {
                        strategy: strategy.name().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Err(RefreshError::Fatal { attempts: failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(native_views: bool, bulk_procedure: bool, row_mutation: bool) -> StoreCapabilities {
        StoreCapabilities {
            native_views,
            bulk_procedure,
            row_mutation,
        }
    }

    #[test]
    fn test_chain_for_embedded_store() {
        let chain = StrategyChain::for_capabilities(caps(false, false, true)).unwrap();
        assert_eq!(chain.names(), vec!["transactional_reinsert"]);
    }

    #[test]
    fn test_chain_for_view_store() {
        let chain = StrategyChain::for_capabilities(caps(true, true, false)).unwrap();
        assert_eq!(chain.names(), vec!["native_view", "bulk_procedure"]);

        let chain = StrategyChain::for_capabilities(caps(true, true, true)).unwrap();
        assert_eq!(chain.names(), vec!["native_view", "bulk_procedure", "transactional_reinsert"]);

        let chain = StrategyChain::for_capabilities(caps(true, false, false)).unwrap();
        assert_eq!(chain.names(), vec!["native_view"]);
    }

    #[test]
    fn test_chain_without_any_path_is_rejected() {
        assert!(StrategyChain::for_capabilities(caps(false, false, false)).is_err());
        assert!(StrategyChain::new(Vec::new()).is_err());
    }
}
