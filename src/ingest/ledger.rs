use super::storage::StorageError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// A unit whose embedding step failed and must be retried out of band.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReprocessEntry {
    pub file_id: String,
    pub page: u32,
    /// 1-based element index; `None` means the page aggregate.
    pub element: Option<usize>,
}

impl ReprocessEntry {
    pub fn element(file_id: &str, page: u32, element: usize) -> Self {
        Self {
            file_id: file_id.to_string(),
            page,
            element: Some(element),
        }
    }

    pub fn page(file_id: &str, page: u32) -> Self {
        Self {
            file_id: file_id.to_string(),
            page,
            element: None,
        }
    }
}

impl fmt::Display for ReprocessEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.element {
            Some(element) => write!(f, "{}:p{}_e{}", self.file_id, self.page, element),
            None => write!(f, "{}:p{}", self.file_id, self.page),
        }
    }
}

impl FromStr for ReprocessEntry {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (file_id, unit) = line
            .rsplit_once(':')
            .ok_or_else(|| format!("missing `:` in ledger line `{line}`"))?;
        let unit = unit
            .strip_prefix('p')
            .ok_or_else(|| format!("missing page marker in ledger line `{line}`"))?;
        let (page, element) = match unit.split_once("_e") {
            Some((page, element)) => (page, Some(element)),
            None => (unit, None),
        };
        let page = page
            .parse::<u32>()
            .map_err(|e| format!("bad page in ledger line `{line}`: {e}"))?;
        let element = element
            .map(|e| e.parse::<usize>())
            .transpose()
            .map_err(|e| format!("bad element in ledger line `{line}`: {e}"))?;
        if file_id.is_empty() {
            return Err(format!("empty file id in ledger line `{line}`"));
        }
        Ok(Self {
            file_id: file_id.to_string(),
            page,
            element,
        })
    }
}

/// Append-only text ledger, one entry per line.
#[derive(Debug, Clone)]
pub struct ReprocessLedger {
    path: PathBuf,
}

impl ReprocessLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &ReprocessEntry) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| StorageError::io("create directory", dir, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StorageError::io("open", &self.path, e))?;
        file.write_all(format!("{entry}\n").as_bytes())
            .await
            .map_err(|e| StorageError::io("append to", &self.path, e))?;
        file.flush()
            .await
            .map_err(|e| StorageError::io("flush", &self.path, e))
    }

    /// Every parseable entry, in append order. A missing ledger is empty.
    pub async fn entries(&self) -> Result<Vec<ReprocessEntry>, StorageError> {
        let body = match fs::read_to_string(&self.path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io("read", &self.path, e)),
        };
        Ok(body
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match line.parse::<ReprocessEntry>() {
                Ok(entry) => Some(entry),
                Err(reason) => {
                    tracing::warn!(path = %self.path.display(), %reason, "skipping ledger line");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn entries_render_like_the_key_suffix() {
        assert_eq!(ReprocessEntry::element("f1", 2, 3).to_string(), "f1:p2_e3");
        assert_eq!(ReprocessEntry::page("f1", 2).to_string(), "f1:p2");
        assert_eq!("f1:p2_e3".parse::<ReprocessEntry>().unwrap(), ReprocessEntry::element("f1", 2, 3));
        assert_eq!("f1:p7".parse::<ReprocessEntry>().unwrap(), ReprocessEntry::page("f1", 7));
        assert!("f1:DOCUMENTO".parse::<ReprocessEntry>().is_err());
    }

    #[tokio::test]
    async fn append_keeps_previous_lines() {
        let dir = TempDir::new().unwrap();
        let ledger = ReprocessLedger::new(dir.path().join("doc").join("log_errores.txt"));
        assert!(ledger.entries().await.unwrap().is_empty());

        ledger.append(&ReprocessEntry::element("f1", 1, 2)).await.unwrap();
        ledger.append(&ReprocessEntry::page("f1", 1)).await.unwrap();

        let body = std::fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(body, "f1:p1_e2\nf1:p1\n");
        assert_eq!(
            ledger.entries().await.unwrap(),
            vec![ReprocessEntry::element("f1", 1, 2), ReprocessEntry::page("f1", 1)]
        );
    }
}
