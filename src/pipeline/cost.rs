use super::state::CostEstimate;
use crate::config::PipelineConfig;
use crate::ingest::extract::PageExtractor;
use crate::ingest::schema::FileRecord;
use crate::ingest::storage::WorkStorage;
use tracing::{info, warn};

/// Page and token estimate for the files about to be processed.
/// Documents that cannot be opened count as zero pages.
pub async fn estimate(
    extractor: &PageExtractor,
    storage: &WorkStorage,
    pending: &[FileRecord],
    settings: &PipelineConfig,
) -> CostEstimate {
    let mut pages = 0usize;
    for record in pending {
        let path = storage.file_path(&record.case_id, &record.filename);
        match extractor.page_count(&path).await {
            Ok(count) => pages += count,
            Err(e) => warn!(file = %record.filename, error = %e, "cannot count pages"),
        }
    }

    let tokens = pages as u64 * settings.tokens_per_page;
    let estimate = CostEstimate {
        pending_files: pending.len(),
        pages,
        tokens,
        cost_usd: tokens as f64 / 1000.0 * settings.cost_per_1k_tokens,
    };
    info!(
        files = estimate.pending_files,
        pages = estimate.pages,
        tokens = estimate.tokens,
        cost_usd = estimate.cost_usd,
        "cost estimate"
    );
    estimate
}
