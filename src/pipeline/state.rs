use crate::ingest::materialize::CaseHandle;
use crate::ingest::schema::{FileOutcome, FileStatus, RegisterOutcome};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Orchestrator stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    CostEstimate,
    ProcessFiles,
    Cleanup,
    End,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::CostEstimate => "cost_estimate",
            Self::ProcessFiles => "process_files",
            Self::Cleanup => "cleanup",
            Self::End => "end",
        }
    }

    /// Stage that follows `self` once it completed without a fatal error.
    pub fn next(self, status: RunStatus) -> Self {
        match self {
            Self::Start => match status {
                RunStatus::Empty => Self::End,
                RunStatus::Running | RunStatus::Ok => Self::CostEstimate,
                RunStatus::Failed => Self::End,
            },
            Self::CostEstimate => Self::ProcessFiles,
            Self::ProcessFiles => Self::Cleanup,
            Self::Cleanup | Self::End => Self::End,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Ok,
    /// No case to ingest.
    Empty,
    Failed,
}

/// The case a run works on.
#[derive(Debug, Clone, Serialize)]
pub struct CaseContext {
    pub case_id: String,
    pub work_dir: PathBuf,
    pub files_copied: usize,
    pub files_seen: usize,
    pub files_new: usize,
    pub files_changed: usize,
}

impl From<&CaseHandle> for CaseContext {
    fn from(handle: &CaseHandle) -> Self {
        Self {
            case_id: handle.case_id.clone(),
            work_dir: handle.work_dir.clone(),
            files_copied: handle.copied,
            files_seen: handle.registered.len(),
            files_new: handle.count(RegisterOutcome::Inserted),
            files_changed: handle.count(RegisterOutcome::Reset),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CostEstimate {
    pub pending_files: usize,
    pub pages: usize,
    pub tokens: u64,
    pub cost_usd: f64,
}

/// Per-file processing record, filled in as the file moves through
/// extraction and indexing.
#[derive(Debug, Clone, Serialize)]
pub struct FileContext {
    pub file_id: String,
    pub filename: String,
    pub source: PathBuf,
    pub artifact_dir: PathBuf,
    pub status: FileStatus,
    pub error: Option<String>,
    pub pages: usize,
    pub failed_pages: usize,
    pub element_records: usize,
    pub page_records: usize,
    pub reprocess_entries: usize,
}

impl FileContext {
    pub fn outcome(&self) -> FileOutcome {
        match (&self.status, &self.error) {
            (FileStatus::Error, Some(error)) => FileOutcome::Error(error.clone()),
            (FileStatus::Error, None) => FileOutcome::Error("unknown error".to_string()),
            (FileStatus::New | FileStatus::Processed, _) => FileOutcome::Processed,
        }
    }

    pub fn fail(&mut self, error: impl fmt::Display) {
        self.status = FileStatus::Error;
        self.error = Some(error.to_string());
    }
}

/// Everything a run produced; returned by the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub status: RunStatus,
    pub stage: Stage,
    pub error: Option<String>,
    pub error_stage: Option<Stage>,
    pub case: Option<CaseContext>,
    pub cost: Option<CostEstimate>,
    pub files: Vec<FileContext>,
    pub cleanup_done: bool,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            status: RunStatus::Running,
            stage: Stage::Start,
            error: None,
            error_stage: None,
            case: None,
            cost: None,
            files: Vec::new(),
            cleanup_done: false,
        }
    }
}

impl RunState {
    /// Record the first fatal failure.
    pub fn fail(&mut self, stage: Stage, error: impl fmt::Display) {
        self.status = RunStatus::Failed;
        if self.error.is_none() {
            self.error = Some(error.to_string());
            self.error_stage = Some(stage);
        }
    }

    pub fn processed(&self) -> usize {
        self.count(FileStatus::Processed)
    }

    pub fn failed(&self) -> usize {
        self.count(FileStatus::Error)
    }

    fn count(&self, status: FileStatus) -> usize {
        self.files.iter().filter(|f| f.status == status).count()
    }
}
