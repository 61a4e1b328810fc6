//! Chunked upserts into the performance store.

use std::sync::Arc;

use perfdash_core::PerformanceRecord;
use perfdash_storage::{PerformanceStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub submitted: usize,
    pub saved: usize,
    pub chunks: usize,
}

#[derive(Debug, Error)]
#[error("saved {saved} of {submitted} records before the store failed: {source}")]
pub struct ReconcileError {
    pub saved: usize,
    pub submitted: usize,
    #[source]
    pub source: StoreError,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn PerformanceStore>,
    chunk_size: usize,
}

impl Reconciler {
    pub fn new(store: Arc<dyn PerformanceStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Upserts on `(user_id, date)`; rows that already exist are overwritten, nothing is deleted.
    pub async fn reconcile(
        &self,
        records: &[PerformanceRecord],
    ) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport {
            submitted: records.len(),
            ..Default::default()
        };

        for chunk in records.chunks(self.chunk_size) {
            match self.store.upsert(chunk).await {
                Ok(written) => {
                    report.saved += written;
                    report.chunks += 1;
                }
                Err(source) => {
                    warn!(
                        saved = report.saved,
                        submitted = report.submitted,
                        error = %source,
                        "upsert failed; earlier chunks stay persisted"
                    );
                    return Err(ReconcileError {
                        saved: report.saved,
                        submitted: report.submitted,
                        source,
                    });
                }
            }
        }

        info!(saved = report.saved, chunks = report.chunks, "reconciled performance records");
        Ok(report)
    }
}
