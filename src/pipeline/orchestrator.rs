use super::cost;
use super::state::{CaseContext, FileContext, RunState, RunStatus, Stage};
use crate::config::{IngestConfig, PipelineConfig};
use crate::ingest::embed::Embedder;
use crate::ingest::extract::PageExtractor;
use crate::ingest::indexer::EmbeddingIndexer;
use crate::ingest::kv::{KvError, SqliteKvStore};
use crate::ingest::materialize::{select_case, CaseMaterializer, MaterializeError};
use crate::ingest::raster::PageRasterizer;
use crate::ingest::schema::{FileRecord, FileStatus};
use crate::ingest::storage::{ArtifactPaths, StorageError, WorkStorage};
use crate::ingest::tracker::{ChangeTracker, TrackerError};
use crate::ingest::vision::VisionClient;
use crate::metrics::IngestMetrics;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Materialize(#[from] MaterializeError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("stage `{0}` reached without a case")]
    NoCase(Stage),
}

/// Model services the pipeline drives.
#[derive(Clone)]
pub struct Services {
    pub rasterizer: Arc<dyn PageRasterizer>,
    pub vision: Arc<dyn VisionClient>,
    pub embedder: Arc<dyn Embedder>,
}

/// Ledger and key-value store, opened once a case has been found.
struct Session {
    tracker: ChangeTracker,
    indexer: EmbeddingIndexer,
}

/// Runs one case through discovery, cost estimate, processing and cleanup.
pub struct Pipeline {
    repository: PathBuf,
    database: PathBuf,
    kv_database: PathBuf,
    storage: WorkStorage,
    extractor: PageExtractor,
    embedder: Arc<dyn Embedder>,
    embed_timeout: Duration,
    settings: PipelineConfig,
    metrics: IngestMetrics,
}

impl Pipeline {
    pub fn new(config: &IngestConfig, services: Services) -> Result<Self, PipelineError> {
        Ok(Self {
            repository: config.repository.clone(),
            database: config.database_path(),
            kv_database: config.kv_database_path(),
            storage: WorkStorage::new(&config.storage),
            extractor: PageExtractor::new(
                services.rasterizer,
                services.vision,
                config.openai.vision_timeout(),
            ),
            embedder: services.embedder,
            embed_timeout: config.openai.embedding_timeout(),
            settings: config.pipeline.clone(),
            metrics: IngestMetrics::new()?,
        })
    }

    pub fn metrics(&self) -> &IngestMetrics {
        &self.metrics
    }

    /// Drive every stage to `End`. Fatal errors are recorded in the returned
    /// state rather than returned.
    pub async fn run(&self) -> RunState {
        let mut state = RunState::default();
        let mut session = None;
        let mut stage = Stage::Start;

        loop {
            state.stage = stage;
            let result = match stage {
                Stage::Start => self.start(&mut state).await.map(|opened| session = opened),
                Stage::CostEstimate => self.estimate_cost(session.as_ref(), &mut state).await,
                Stage::ProcessFiles => self.process_files(session.as_ref(), &mut state).await,
                Stage::Cleanup => self.cleanup(&mut state).await,
                Stage::End => break,
            };
            stage = match result {
                Ok(()) => stage.next(state.status),
                Err(e) => {
                    error!(stage = %stage, error = %e, "stage failed");
                    state.fail(stage, e);
                    Stage::End
                }
            };
            info!(stage = %stage, "stage transition");
        }

        if state.status == RunStatus::Running {
            state.status = RunStatus::Ok;
        }
        info!(
            status = ?state.status,
            processed = state.processed(),
            failed = state.failed(),
            "run finished"
        );
        state
    }

    /// Nothing is opened or written before a case is found.
    async fn start(&self, state: &mut RunState) -> Result<Option<Session>, PipelineError> {
        let Some(case_id) = select_case(&self.repository)? else {
            info!(repository = %self.repository.display(), "no case directory found");
            state.status = RunStatus::Empty;
            return Ok(None);
        };

        let session = self.open_session()?;
        let handle = CaseMaterializer::new(self.storage.clone(), session.tracker.clone())
            .materialize_case(&self.repository, case_id)
            .await?;
        state.case = Some(CaseContext::from(&handle));
        Ok(Some(session))
    }

    fn open_session(&self) -> Result<Session, PipelineError> {
        let tracker = ChangeTracker::open(&self.database)?;
        let store = SqliteKvStore::open(&self.kv_database)?;
        Ok(Session {
            tracker,
            indexer: EmbeddingIndexer::new(
                Arc::clone(&self.embedder),
                Arc::new(store),
                self.storage.clone(),
                self.embed_timeout,
            ),
        })
    }

    async fn estimate_cost(
        &self,
        session: Option<&Session>,
        state: &mut RunState,
    ) -> Result<(), PipelineError> {
        let session = session.ok_or(PipelineError::NoCase(Stage::CostEstimate))?;
        let case = state.case.as_ref().ok_or(PipelineError::NoCase(Stage::CostEstimate))?;
        let pending = session.tracker.list_pending(&case.case_id)?;
        state.cost = Some(cost::estimate(&self.extractor, &self.storage, &pending, &self.settings).await);
        Ok(())
    }

    async fn process_files(
        &self,
        session: Option<&Session>,
        state: &mut RunState,
    ) -> Result<(), PipelineError> {
        let session = session.ok_or(PipelineError::NoCase(Stage::ProcessFiles))?;
        let case_id = state
            .case
            .as_ref()
            .map(|c| c.case_id.clone())
            .ok_or(PipelineError::NoCase(Stage::ProcessFiles))?;
        let pending = session.tracker.list_pending(&case_id)?;
        info!(case = %case_id, pending = pending.len(), "processing files");

        for record in &pending {
            let file = self.process_file(&session.indexer, record).await;
            session.tracker.mark_outcome(&record.id, &file.outcome())?;
            match file.status {
                FileStatus::Processed => self.metrics.file_processed(),
                FileStatus::Error | FileStatus::New => self.metrics.file_failed(),
            }
            state.files.push(file);
        }
        Ok(())
    }

    async fn process_file(&self, indexer: &EmbeddingIndexer, record: &FileRecord) -> FileContext {
        let mut file = FileContext {
            file_id: record.id.clone(),
            filename: record.filename.clone(),
            source: self.storage.file_path(&record.case_id, &record.filename),
            artifact_dir: self.storage.document_dir(&record.case_id, &record.filename),
            status: FileStatus::New,
            error: None,
            pages: 0,
            failed_pages: 0,
            element_records: 0,
            page_records: 0,
            reprocess_entries: 0,
        };
        info!(file_id = %file.file_id, file = %file.filename, "processing file");

        let pages = match self.extractor.extract(&file.source).await {
            Ok(pages) => pages,
            Err(e) => {
                warn!(file_id = %file.file_id, error = %e, "extraction failed");
                file.fail(e);
                return file;
            }
        };
        file.pages = pages.len();
        file.failed_pages = pages.iter().filter(|p| p.failure.is_some()).count();
        for page in &pages {
            self.metrics.page(page.failure.is_none());
        }

        let artifacts = ArtifactPaths::new(&file.artifact_dir, &file.file_id);
        match indexer.index(&file.file_id, &artifacts, &pages).await {
            Ok(report) => {
                file.element_records = report.element_records;
                file.page_records = report.page_records;
                file.reprocess_entries = report.reprocess_entries;
                file.status = FileStatus::Processed;
                self.metrics
                    .records_written(report.element_records, report.page_records);
                self.metrics.reprocess_entries(report.reprocess_entries);
                info!(
                    file_id = %file.file_id,
                    pages = file.pages,
                    failed_pages = file.failed_pages,
                    "file processed"
                );
            }
            Err(e) => {
                warn!(file_id = %file.file_id, error = %e, "indexing failed");
                file.fail(e);
            }
        }
        file
    }

    async fn cleanup(&self, state: &mut RunState) -> Result<(), PipelineError> {
        if self.settings.prune_page_artifacts {
            let mut removed = 0usize;
            for file in state.files.iter().filter(|f| f.status == FileStatus::Processed) {
                let artifacts = ArtifactPaths::new(&file.artifact_dir, &file.file_id);
                for page in 1..=file.pages as u32 {
                    if self.storage.remove_file(&artifacts.page_json(page)).await? {
                        removed += 1;
                    }
                }
            }
            info!(removed, "page artifacts pruned");
        }
        state.cleanup_done = true;
        Ok(())
    }
}
