//! Prometheus counters for one pipeline run.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct IngestMetrics {
    registry: Registry,
    files: IntCounterVec,
    pages: IntCounterVec,
    records: IntCounterVec,
    reprocess: IntCounter,
}

impl IngestMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("caseingest".to_string()), None)?;

        let files = IntCounterVec::new(
            Opts::new("files_total", "Files attempted, by outcome"),
            &["outcome"],
        )?;
        let pages = IntCounterVec::new(
            Opts::new("pages_total", "Pages extracted, by outcome"),
            &["outcome"],
        )?;
        let records = IntCounterVec::new(
            Opts::new("embedding_records_total", "Embedding records written, by unit"),
            &["unit"],
        )?;
        let reprocess = IntCounter::new(
            "reprocess_entries_total",
            "Units appended to the reprocess ledger",
        )?;

        registry.register(Box::new(files.clone()))?;
        registry.register(Box::new(pages.clone()))?;
        registry.register(Box::new(records.clone()))?;
        registry.register(Box::new(reprocess.clone()))?;

        Ok(Self {
            registry,
            files,
            pages,
            records,
            reprocess,
        })
    }

    pub fn file_processed(&self) {
        self.files.with_label_values(&["processed"]).inc();
    }

    pub fn file_failed(&self) {
        self.files.with_label_values(&["error"]).inc();
    }

    pub fn page(&self, ok: bool) {
        let outcome = if ok { "ok" } else { "failed" };
        self.pages.with_label_values(&[outcome]).inc();
    }

    pub fn records_written(&self, elements: usize, pages: usize) {
        self.records.with_label_values(&["element"]).inc_by(elements as u64);
        self.records.with_label_values(&["page"]).inc_by(pages as u64);
    }

    pub fn reprocess_entries(&self, count: usize) {
        self.reprocess.inc_by(count as u64);
    }

    /// Prometheus text exposition of every counter.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_carries_prefixed_counters() {
        let metrics = IngestMetrics::new().unwrap();
        metrics.file_processed();
        metrics.file_failed();
        metrics.page(true);
        metrics.page(false);
        metrics.records_written(3, 1);
        metrics.reprocess_entries(2);

        let text = metrics.render().unwrap();
        assert!(text.contains("caseingest_files_total{outcome=\"processed\"} 1"));
        assert!(text.contains("caseingest_embedding_records_total{unit=\"element\"} 3"));
        assert!(text.contains("caseingest_reprocess_entries_total 2"));
    }
}
