//! Download collaborator seam.
//!
//! The orchestrator hands items that are not yet in the ledger to a
//! [`Materializer`]; what "materialize" means (writing media to disk, in the
//! server's case) is up to the implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RelayResult;
use crate::ledger::DedupLedger;
use crate::types::TaggedItem;

/// Outcome of one materialization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializeSummary {
    pub downloaded: usize,
    /// Items left out because the ledger already had them.
    pub skipped: usize,
    pub errors: Vec<String>,
}

impl MaterializeSummary {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[async_trait]
pub trait Materializer: Send + Sync {
    /// Materialize `items`, recording each success in `ledger`.
    ///
    /// Per-item failures belong in the summary; an `Err` means the pass as a
    /// whole could not run.
    async fn materialize(
        &self,
        api_name: &str,
        items: &[TaggedItem],
        ledger: &dyn DedupLedger,
    ) -> RelayResult<MaterializeSummary>;
}
