use super::schema::{RegisterOutcome, Registration};
use super::storage::WorkStorage;
use super::tracker::{ChangeTracker, TrackerError};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to walk case tree: {0}")]
    Walk(#[from] walkdir::Error),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("materializer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn io_err<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> MaterializeError + 'a {
    move |source| MaterializeError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

/// The case selected for this run and what happened to its files.
#[derive(Debug, Clone)]
pub struct CaseHandle {
    pub case_id: String,
    pub source_dir: PathBuf,
    pub work_dir: PathBuf,
    /// Files this run copied into the working copy.
    pub copied: usize,
    pub registered: Vec<Registration>,
}

impl CaseHandle {
    pub fn count(&self, outcome: RegisterOutcome) -> usize {
        self.registered.iter().filter(|r| r.outcome == outcome).count()
    }
}

#[derive(Debug, Clone)]
pub enum Materialized {
    /// No case directory under the repository root.
    Empty,
    Case(CaseHandle),
}

/// Picks a case from the repository, brings its working copy up to date and
/// registers every file with the tracker.
#[derive(Clone)]
pub struct CaseMaterializer {
    storage: WorkStorage,
    tracker: ChangeTracker,
}

impl CaseMaterializer {
    pub fn new(storage: WorkStorage, tracker: ChangeTracker) -> Self {
        Self { storage, tracker }
    }

    pub async fn materialize(&self, repository_root: &Path) -> Result<Materialized, MaterializeError> {
        match select_case(repository_root)? {
            Some(case_id) => Ok(Materialized::Case(
                self.materialize_case(repository_root, case_id).await?,
            )),
            None => {
                info!(repository = %repository_root.display(), "no case directory found");
                Ok(Materialized::Empty)
            }
        }
    }

    /// Sync `case_id` from the repository into working storage and register
    /// the checksums of the repository files.
    pub async fn materialize_case(
        &self,
        repository_root: &Path,
        case_id: String,
    ) -> Result<CaseHandle, MaterializeError> {
        let source_dir = repository_root.join(&case_id);
        let work_dir = self.storage.case_dir(&case_id);

        let (copied, files) = {
            let source_dir = source_dir.clone();
            let work_dir = work_dir.clone();
            tokio::task::spawn_blocking(move || sync_tree(&source_dir, &work_dir)).await??
        };

        let mut registered = Vec::with_capacity(files.len());
        for (filename, checksum) in files {
            let registration = self.tracker.register_or_update(&case_id, &filename, &checksum)?;
            debug!(file = %filename, outcome = ?registration.outcome, "file registered");
            registered.push(registration);
        }

        let handle = CaseHandle {
            case_id,
            source_dir,
            work_dir,
            copied,
            registered,
        };
        info!(
            case = %handle.case_id,
            copied = handle.copied,
            files = handle.registered.len(),
            new = handle.count(RegisterOutcome::Inserted),
            changed = handle.count(RegisterOutcome::Reset),
            "case materialized"
        );
        Ok(handle)
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

/// Lexicographically first non-hidden directory directly under `root`.
pub fn select_case(root: &Path) -> Result<Option<String>, MaterializeError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err("read repository", root)(e)),
    };

    let mut cases = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_err("read repository", root))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if entry.file_type().map_err(io_err("inspect", &entry.path()))?.is_dir() {
            cases.push(name);
        }
    }
    cases.sort();
    Ok(cases.into_iter().next())
}

/// Checksum every file under `source` and copy the ones missing or
/// different in `target`. Working files that already match are not touched.
fn sync_tree(
    source: &Path,
    target: &Path,
) -> Result<(usize, Vec<(String, String)>), MaterializeError> {
    let files = checksum_tree(source)?;

    let mut copied = 0usize;
    for (filename, checksum) in &files {
        let destination = target.join(filename);
        if destination.is_file() && file_checksum(&destination)? == *checksum {
            continue;
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(io_err("create directory", parent))?;
        }
        let origin = source.join(filename);
        fs::copy(&origin, &destination).map_err(io_err("copy", &origin))?;
        debug!(file = %filename, "copied to working storage");
        copied += 1;
    }

    if copied > 0 {
        info!(from = %source.display(), to = %target.display(), copied, "working copy updated");
    }
    Ok((copied, files))
}

/// `(relative filename, sha256 hex)` for every regular file, sorted by path.
/// Hidden entries, including the artifact folder, are skipped.
pub fn checksum_tree(root: &Path) -> Result<Vec<(String, String)>, MaterializeError> {
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e));

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let filename = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((filename, file_checksum(entry.path())?));
    }
    Ok(files)
}

pub fn file_checksum(path: &Path) -> Result<String, MaterializeError> {
    let mut file = fs::File::open(path).map_err(io_err("open", path))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(io_err("read", path))?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::schema::FileStatus;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        materializer: CaseMaterializer,
        tracker: ChangeTracker,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            fs::create_dir_all(dir.path().join("repo")).unwrap();
            let tracker = ChangeTracker::open(&dir.path().join("db/ledger.db")).unwrap();
            let storage = WorkStorage::new(dir.path().join("storage"));
            Self {
                materializer: CaseMaterializer::new(storage, tracker.clone()),
                tracker,
                dir,
            }
        }

        fn repo(&self) -> PathBuf {
            self.dir.path().join("repo")
        }

        fn write(&self, relative: &str, body: &str) {
            let path = self.repo().join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }
    }

    #[tokio::test]
    async fn empty_repository_touches_nothing() {
        let fx = Fixture::new();
        fx.write(".hidden/a.pdf", "x");
        fx.write("loose.pdf", "x");

        let result = fx.materializer.materialize(&fx.repo()).await.unwrap();
        assert!(matches!(result, Materialized::Empty));
        assert_eq!(fx.tracker.count().unwrap(), 0);
        assert!(!fx.dir.path().join("storage").exists());

        let missing = fx.materializer.materialize(&fx.dir.path().join("nope")).await.unwrap();
        assert!(matches!(missing, Materialized::Empty));
    }

    #[tokio::test]
    async fn first_case_in_lexicographic_order_is_copied() {
        let fx = Fixture::new();
        fx.write("LIC-200/bases.pdf", "b");
        fx.write("LIC-100/bases.pdf", "a");
        fx.write("LIC-100/anexos/anexo 1.pdf", "c");

        let Materialized::Case(handle) = fx.materializer.materialize(&fx.repo()).await.unwrap() else {
            panic!("expected a case");
        };
        assert_eq!(handle.case_id, "LIC-100");
        assert_eq!(handle.copied, 2);
        assert!(handle.work_dir.join("anexos/anexo 1.pdf").is_file());

        let names: Vec<_> = handle.registered.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, vec!["anexos/anexo 1.pdf", "bases.pdf"]);
        assert_eq!(handle.count(RegisterOutcome::Inserted), 2);

        let record = fx.tracker.find("LIC-100", "bases.pdf").unwrap().unwrap();
        assert_eq!(record.status, FileStatus::New);
        assert_eq!(record.checksum, file_checksum(&handle.work_dir.join("bases.pdf")).unwrap());
    }

    #[tokio::test]
    async fn repository_changes_reach_the_working_copy() {
        let fx = Fixture::new();
        fx.write("LIC-100/a.pdf", "v1");
        fx.write("LIC-100/c.pdf", "same");

        let Materialized::Case(first) = fx.materializer.materialize(&fx.repo()).await.unwrap() else {
            panic!("expected a case");
        };
        assert_eq!(first.copied, 2);
        fs::create_dir_all(first.work_dir.join(".caseingest/a")).unwrap();
        fs::write(first.work_dir.join(".caseingest/a/x_pag_1.json"), "{}").unwrap();

        fx.write("LIC-100/a.pdf", "v2");
        fx.write("LIC-100/b.pdf", "new");

        let Materialized::Case(second) = fx.materializer.materialize(&fx.repo()).await.unwrap() else {
            panic!("expected a case");
        };
        assert_eq!(second.copied, 2);
        assert_eq!(fs::read_to_string(second.work_dir.join("a.pdf")).unwrap(), "v2");
        assert_eq!(fs::read_to_string(second.work_dir.join("b.pdf")).unwrap(), "new");
        assert!(second.work_dir.join(".caseingest/a/x_pag_1.json").is_file());

        let outcomes: Vec<_> = second
            .registered
            .iter()
            .map(|r| (r.filename.as_str(), r.outcome))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                ("a.pdf", RegisterOutcome::Reset),
                ("b.pdf", RegisterOutcome::Inserted),
                ("c.pdf", RegisterOutcome::Unchanged),
            ]
        );
        let record = fx.tracker.find("LIC-100", "a.pdf").unwrap().unwrap();
        assert_eq!(record.checksum, file_checksum(&fx.repo().join("LIC-100/a.pdf")).unwrap());
    }

    #[tokio::test]
    async fn unchanged_case_copies_nothing() {
        let fx = Fixture::new();
        fx.write("LIC-100/bases.pdf", "v1");
        fx.materializer.materialize(&fx.repo()).await.unwrap();

        let Materialized::Case(again) = fx.materializer.materialize(&fx.repo()).await.unwrap() else {
            panic!("expected a case");
        };
        assert_eq!(again.copied, 0);
        assert_eq!(again.registered.len(), 1);
        assert_eq!(again.registered[0].outcome, RegisterOutcome::Unchanged);
    }

    #[test]
    fn checksum_is_sha256_hex() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "abc").unwrap();
        assert_eq!(
            file_checksum(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
