use super::embed::{EmbedError, Embedder};
use super::kv::{KeyValueStore, KvError};
use super::ledger::{ReprocessEntry, ReprocessLedger};
use super::render::{render_pages, total_tokens};
use super::schema::{document_key_prefix, EmbeddingRecord, PageResult};
use super::storage::{ArtifactPaths, StorageError, WorkStorage};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default bound on a single embedding call.
pub const DEFAULT_EMBED_TIMEOUT: Duration = Duration::from_secs(30);

/// Tag stored in the `type` field of page aggregates.
pub const PAGE_RECORD_KIND: &str = "page";

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed to clear previous records: {0}")]
    Clear(#[from] KvError),
}

/// Failure of a single element or page unit; recovered by the caller.
#[derive(Debug, thiserror::Error)]
enum UnitError {
    #[error(transparent)]
    Embed(#[from] EmbedError),
    #[error(transparent)]
    Store(#[from] KvError),
    #[error("failed to encode embedding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What one `index` call wrote.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexReport {
    pub element_records: usize,
    pub page_records: usize,
    pub reprocess_entries: usize,
}

/// Writes per-document artifacts, then embeds every element and page
/// aggregate into the key-value store.
#[derive(Clone)]
pub struct EmbeddingIndexer {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn KeyValueStore>,
    storage: WorkStorage,
    embed_timeout: Duration,
}

impl EmbeddingIndexer {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn KeyValueStore>,
        storage: WorkStorage,
        embed_timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            store,
            storage,
            embed_timeout,
        }
    }

    pub async fn index(
        &self,
        file_id: &str,
        artifacts: &ArtifactPaths,
        pages: &[PageResult],
    ) -> Result<IndexReport, IndexError> {
        self.write_artifacts(artifacts, pages).await?;

        let stale = self.store.delete_prefix(&document_key_prefix(file_id))?;
        if stale > 0 {
            debug!(file_id, stale, "previous records removed");
        }

        let ledger = ReprocessLedger::new(artifacts.error_log());
        let mut report = IndexReport::default();

        for page in pages {
            if page.elements.is_empty() {
                debug!(file_id, page = page.page, "page has no elements");
                continue;
            }

            for (offset, element) in page.elements.iter().enumerate() {
                let index = offset + 1;
                let text = element.embedding_text();
                if text.is_empty() {
                    continue;
                }
                let kind = element.kind.as_str();
                match self.write_unit(file_id, page.page, Some(index), text, kind).await {
                    Ok(()) => report.element_records += 1,
                    Err(e) => {
                        warn!(file_id, page = page.page, element = index, error = %e, "element embedding failed");
                        ledger
                            .append(&ReprocessEntry::element(file_id, page.page, index))
                            .await?;
                        report.reprocess_entries += 1;
                    }
                }
            }

            let aggregate = page.aggregate_text();
            if aggregate.is_empty() {
                continue;
            }
            match self
                .write_unit(file_id, page.page, None, aggregate, PAGE_RECORD_KIND)
                .await
            {
                Ok(()) => report.page_records += 1,
                Err(e) => {
                    warn!(file_id, page = page.page, error = %e, "page embedding failed");
                    ledger.append(&ReprocessEntry::page(file_id, page.page)).await?;
                    report.reprocess_entries += 1;
                }
            }
        }

        info!(
            file_id,
            elements = report.element_records,
            pages = report.page_records,
            reprocess = report.reprocess_entries,
            "document indexed"
        );
        Ok(report)
    }

    /// Embed one unit and write its record.
    async fn write_unit(
        &self,
        file_id: &str,
        page: u32,
        element: Option<usize>,
        text: String,
        kind: &str,
    ) -> Result<(), UnitError> {
        let embedding = match tokio::time::timeout(self.embed_timeout, self.embedder.embed(&text)).await {
            Ok(result) => result?,
            Err(_) => return Err(EmbedError::Timeout(self.embed_timeout).into()),
        };
        let record = EmbeddingRecord {
            page,
            element,
            text,
            embedding,
            kind: kind.to_string(),
        };
        let key = record.key(file_id);
        self.store.put_hash(&key, &record.to_fields()?)?;
        debug!(key = %key, "embedding stored");
        Ok(())
    }

    async fn write_artifacts(
        &self,
        artifacts: &ArtifactPaths,
        pages: &[PageResult],
    ) -> Result<(), StorageError> {
        self.storage.ensure_dir(artifacts.dir()).await?;
        self.storage.write_json(&artifacts.results_json(), &pages).await?;
        self.storage
            .write_text(&artifacts.text(), &render_pages(pages))
            .await?;
        self.storage
            .write_text(
                &artifacts.tokens(),
                &format!("Total tokens: {}\n", total_tokens(pages)),
            )
            .await?;
        for page in pages {
            self.storage
                .write_json(&artifacts.page_json(page.page), page)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::kv::SqliteKvStore;
    use crate::ingest::schema::{CheckboxRow, Element, ElementContent, ElementKind};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct FlakyEmbedder {
        fail_on: Vec<&'static str>,
        hang_on: Vec<&'static str>,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
            if self.fail_on.iter().any(|t| *t == text) {
                return Err(EmbedError::Status {
                    status: 500,
                    body: "boom".into(),
                });
            }
            if self.hang_on.iter().any(|t| *t == text) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(vec![text.len() as f32, 0.5])
        }
    }

    fn text(position: u32, body: &str) -> Element {
        Element {
            id: String::new(),
            kind: ElementKind::Text,
            position,
            title: String::new(),
            description: String::new(),
            content: ElementContent::Text(body.into()),
            coordinates: None,
            metadata: BTreeMap::new(),
        }
    }

    fn page(n: u32, elements: Vec<Element>) -> PageResult {
        PageResult {
            page: n,
            title: String::new(),
            confidence: Some(0.8),
            elements,
            raw: "{}".into(),
            tokens_in: 50,
            tokens_out: 5,
            failure: None,
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<SqliteKvStore>,
        artifacts: ArtifactPaths,
        indexer: EmbeddingIndexer,
    }

    fn fixture(embedder: FlakyEmbedder) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteKvStore::open(&dir.path().join("kv.db")).unwrap());
        let storage = WorkStorage::new(dir.path());
        let artifacts = ArtifactPaths::new(dir.path().join("case/.caseingest/bases"), "f1");
        let indexer = EmbeddingIndexer::new(
            Arc::new(embedder),
            store.clone(),
            storage,
            Duration::from_millis(200),
        );
        Fixture {
            _dir: dir,
            store,
            artifacts,
            indexer,
        }
    }

    #[tokio::test]
    async fn failing_element_is_isolated_and_logged() {
        let fx = fixture(FlakyEmbedder {
            fail_on: vec!["dos"],
            hang_on: vec![],
        });
        let pages = vec![page(1, vec![text(1, "uno"), text(2, "dos"), text(3, "tres")])];

        let report = fx.indexer.index("f1", &fx.artifacts, &pages).await.unwrap();

        assert_eq!(report.element_records, 2);
        assert_eq!(report.page_records, 1);
        assert_eq!(report.reprocess_entries, 1);
        assert_eq!(
            fx.store.keys_with_prefix("doc_raw_page:f1:").unwrap(),
            vec!["doc_raw_page:f1:p1", "doc_raw_page:f1:p1_e1", "doc_raw_page:f1:p1_e3"]
        );
        let entries = ReprocessLedger::new(fx.artifacts.error_log()).entries().await.unwrap();
        assert_eq!(entries, vec![ReprocessEntry::element("f1", 1, 2)]);

        let aggregate = fx.store.get_hash("doc_raw_page:f1:p1").unwrap().unwrap();
        assert_eq!(aggregate["text"], "uno\ndos\ntres");
        assert_eq!(aggregate["type"], "page");
        assert!(!aggregate.contains_key("element"));
    }

    #[tokio::test]
    async fn aggregate_timeout_goes_to_the_ledger() {
        let fx = fixture(FlakyEmbedder {
            fail_on: vec![],
            hang_on: vec!["a\nb"],
        });
        let pages = vec![page(4, vec![text(1, "a"), text(2, "b")])];

        let report = fx.indexer.index("f1", &fx.artifacts, &pages).await.unwrap();

        assert_eq!(report.element_records, 2);
        assert_eq!(report.page_records, 0);
        let entries = ReprocessLedger::new(fx.artifacts.error_log()).entries().await.unwrap();
        assert_eq!(entries, vec![ReprocessEntry::page("f1", 4)]);
    }

    #[tokio::test]
    async fn artifacts_are_written_before_embedding() {
        let fx = fixture(FlakyEmbedder {
            fail_on: vec![],
            hang_on: vec![],
        });
        let mut checklist = page(
            2,
            vec![Element {
                kind: ElementKind::CheckboxTable,
                content: ElementContent::Checkboxes(vec![CheckboxRow {
                    label: "Firma".into(),
                    checked: true,
                }]),
                ..text(1, "")
            }],
        );
        checklist.title = "Anexo".into();
        let pages = vec![page(1, vec![]), checklist];

        let report = fx.indexer.index("f1", &fx.artifacts, &pages).await.unwrap();
        assert_eq!(report.element_records, 1);

        assert!(fx.artifacts.results_json().exists());
        assert!(fx.artifacts.page_json(1).exists());
        assert!(fx.artifacts.page_json(2).exists());
        assert!(!fx.artifacts.error_log().exists());

        let tokens = std::fs::read_to_string(fx.artifacts.tokens()).unwrap();
        assert_eq!(tokens, "Total tokens: 110\n");
        let rendered = std::fs::read_to_string(fx.artifacts.text()).unwrap();
        assert!(rendered.contains("# Anexo\n☑ Firma\n"));

        let record = fx.store.get_hash("doc_raw_page:f1:p2_e1").unwrap().unwrap();
        assert_eq!(record["text"], "[x] Firma");
        assert_eq!(record["type"], "checkbox-table");
        assert_eq!(record["element"], "1");
    }

    #[tokio::test]
    async fn reindexing_drops_records_of_the_previous_version() {
        let fx = fixture(FlakyEmbedder {
            fail_on: vec![],
            hang_on: vec![],
        });
        let first = vec![
            page(1, vec![text(1, "uno"), text(2, "dos")]),
            page(2, vec![text(1, "tres")]),
        ];
        fx.indexer.index("f1", &fx.artifacts, &first).await.unwrap();
        fx.store
            .put_hash("doc_raw_page:f2:p1", &[("text", "otro".into())])
            .unwrap();

        let second = vec![page(1, vec![text(1, "uno")])];
        let report = fx.indexer.index("f1", &fx.artifacts, &second).await.unwrap();

        assert_eq!(report.element_records, 1);
        assert_eq!(
            fx.store.keys_with_prefix("doc_raw_page:f1:").unwrap(),
            vec!["doc_raw_page:f1:p1", "doc_raw_page:f1:p1_e1"]
        );
        assert_eq!(fx.store.get_hash("doc_raw_page:f1:p1").unwrap().unwrap()["text"], "uno");
        assert!(fx.store.get_hash("doc_raw_page:f2:p1").unwrap().is_some());
    }
}
