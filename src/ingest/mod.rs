//! Case ingestion: change tracking, page extraction, embedding indexing.
//!
//! Copies a case folder into working storage, tracks file checksums and
//! status, extracts structured page content with a vision model, and stores
//! element and page embeddings in a key-value store.

pub mod embed;
pub mod extract;
pub mod indexer;
pub mod kv;
pub mod ledger;
pub mod materialize;
pub mod raster;
pub mod render;
pub mod schema;
pub mod storage;
pub mod tracker;
pub mod vision;

pub use embed::{EmbedError, Embedder, OpenAiEmbedder};
pub use extract::{ExtractError, PageExtractor};
pub use indexer::{EmbeddingIndexer, IndexError, IndexReport};
pub use kv::{KeyValueStore, KvError, SqliteKvStore};
pub use ledger::{ReprocessEntry, ReprocessLedger};
pub use materialize::{CaseHandle, CaseMaterializer, MaterializeError, Materialized};
pub use raster::{PageImage, PageRasterizer, RasterError};
pub use schema::{Element, ElementKind, FileOutcome, FileRecord, FileStatus, PageResult};
pub use storage::{ArtifactPaths, StorageError, WorkStorage};
pub use tracker::{ChangeTracker, TrackerError};
pub use vision::{OpenAiVisionClient, VisionClient, VisionError, VisionResponse};
