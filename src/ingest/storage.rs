use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::fs;
use unicode_normalization::UnicodeNormalization;

/// Hidden folder inside a case working copy that holds per-document artifacts.
pub const ARTIFACT_DIR: &str = ".caseingest";

/// Append-only reprocess log kept next to each document's artifacts.
pub const ERROR_LOG: &str = "log_errores.txt";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub(crate) fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Working storage tree: one copied folder per case, artifacts alongside.
#[derive(Debug, Clone)]
pub struct WorkStorage {
    base_dir: PathBuf,
}

impl WorkStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    /// Working copy of a case.
    pub fn case_dir(&self, case_id: &str) -> PathBuf {
        self.base_dir.join(case_id)
    }

    /// Absolute path of a case file inside the working copy.
    pub fn file_path(&self, case_id: &str, filename: &str) -> PathBuf {
        filename
            .split('/')
            .fold(self.case_dir(case_id), |path, part| path.join(part))
    }

    /// Artifact folder for one document of a case.
    pub fn document_dir(&self, case_id: &str, filename: &str) -> PathBuf {
        self.case_dir(case_id)
            .join(ARTIFACT_DIR)
            .join(document_slug(filename))
    }

    pub async fn ensure_dir(&self, dir: &Path) -> Result<(), StorageError> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| StorageError::io("create directory", dir, e))
    }

    pub async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StorageError> {
        let body = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Serialize {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, body)
            .await
            .map_err(|e| StorageError::io("write", path, e))
    }

    pub async fn write_text(&self, path: &Path, text: &str) -> Result<(), StorageError> {
        fs::write(path, text)
            .await
            .map_err(|e| StorageError::io("write", path, e))
    }

    /// Delete a file if it exists.
    pub async fn remove_file(&self, path: &Path) -> Result<bool, StorageError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io("delete", path, e)),
        }
    }
}

/// Artifact file names for one processed file.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    dir: PathBuf,
    file_id: String,
}

impl ArtifactPaths {
    pub fn new(dir: impl Into<PathBuf>, file_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            file_id: file_id.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn results_json(&self) -> PathBuf {
        self.dir.join(format!("{}_resultado_paginas.json", self.file_id))
    }

    pub fn text(&self) -> PathBuf {
        self.dir.join(format!("{}.txt", self.file_id))
    }

    pub fn tokens(&self) -> PathBuf {
        self.dir.join(format!("{}_tokens.txt", self.file_id))
    }

    pub fn page_json(&self, page: u32) -> PathBuf {
        self.dir.join(format!("{}_pag_{}.json", self.file_id, page))
    }

    pub fn error_log(&self) -> PathBuf {
        self.dir.join(ERROR_LOG)
    }
}

/// Normalize a case-relative filename into a folder-safe slug:
/// lowercase, accents stripped, punctuation dropped, separators collapsed to `_`.
pub fn document_slug(filename: &str) -> String {
    static PUNCT: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[^\w\s/-]").expect("valid slug regex"));
    static SEPARATORS: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[-\s/]+").expect("valid slug regex"));

    let stem = match filename.rfind('.') {
        Some(dot) if dot > filename.rfind('/').map_or(0, |slash| slash + 1) => &filename[..dot],
        _ => filename,
    };

    let ascii: String = stem
        .to_lowercase()
        .nfkd()
        .filter(char::is_ascii)
        .collect();
    let cleaned = PUNCT.replace_all(&ascii, "");
    let slug = SEPARATORS.replace_all(cleaned.trim(), "_");
    let slug = slug.trim_matches('_');

    if slug.is_empty() {
        "document".to_string()
    } else {
        slug.to_string()
    }
}
