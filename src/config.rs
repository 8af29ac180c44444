//! Configuration loading: TOML file, environment overrides, validation.

use directories::ProjectDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to expand `{value}`: {reason}")]
    Expand { value: String, reason: String },
    #[error("missing OpenAI API key (set openai.api_key or OPENAI_API_KEY)")]
    MissingApiKey,
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct IngestConfig {
    /// Folder holding one sub-folder per case.
    pub repository: PathBuf,
    /// Working storage; case copies and artifacts live here.
    pub storage: PathBuf,
    /// Ledger database. Defaults to `{storage}/caseingest.db`.
    pub database: Option<PathBuf>,
    /// Key-value database for embeddings. Defaults to `{storage}/kv.db`.
    pub kv_database: Option<PathBuf>,
    pub openai: OpenAiConfig,
    pub pipeline: PipelineConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            repository: PathBuf::from("./repositorio"),
            storage: PathBuf::from("./storage"),
            database: None,
            kv_database: None,
            openai: OpenAiConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub vision_model: String,
    pub embedding_model: String,
    /// Requested vector size; model default when unset.
    pub embedding_dimensions: Option<usize>,
    pub vision_timeout_secs: u64,
    pub embedding_timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            vision_model: "gpt-4o".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: None,
            vision_timeout_secs: 60,
            embedding_timeout_secs: 30,
        }
    }
}

impl OpenAiConfig {
    pub fn vision_timeout(&self) -> Duration {
        Duration::from_secs(self.vision_timeout_secs)
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PipelineConfig {
    /// Target page width in pixels when rasterizing PDFs.
    pub render_width: u32,
    /// Pdfium shared library (file or directory). Searched for when unset.
    pub pdfium_library: Option<PathBuf>,
    /// Token estimate per page for the cost stage.
    pub tokens_per_page: u64,
    /// USD per 1000 tokens for the cost stage.
    pub cost_per_1k_tokens: f64,
    /// Delete per-page JSON artifacts of processed files during cleanup.
    pub prune_page_artifacts: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            render_width: crate::ingest::raster::DEFAULT_RENDER_WIDTH,
            pdfium_library: None,
            tokens_per_page: 1500,
            cost_per_1k_tokens: 0.005,
            prune_page_artifacts: false,
        }
    }
}

impl IngestConfig {
    /// Load from `path`, or from the platform config dir when `None`.
    /// A missing default file yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (default_config_path()?, false),
        };

        let mut config = match std::fs::read_to_string(&path) {
            Ok(body) => Self::from_toml(&body, &path)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => Self::default(),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.expand_paths()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(body: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(body).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Environment overrides. Takes a lookup so tests stay off the process env.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(key) = set("OPENAI_API_KEY") {
            self.openai.api_key = Some(key);
        }
        if let Some(url) = set("OPENAI_BASE_URL") {
            self.openai.base_url = url;
        }
        if let Some(repo) = set("CASEINGEST_REPOSITORY") {
            self.repository = PathBuf::from(repo);
        }
        if let Some(storage) = set("CASEINGEST_STORAGE") {
            self.storage = PathBuf::from(storage);
        }
    }

    fn expand_paths(&mut self) -> Result<(), ConfigError> {
        self.repository = expand(&self.repository)?;
        self.storage = expand(&self.storage)?;
        if let Some(db) = &self.database {
            self.database = Some(expand(db)?);
        }
        if let Some(db) = &self.kv_database {
            self.kv_database = Some(expand(db)?);
        }
        if let Some(lib) = &self.pipeline.pdfium_library {
            self.pipeline.pdfium_library = Some(expand(lib)?);
        }
        Ok(())
    }

    /// Checks that hold regardless of which commands run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.openai.vision_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "openai.vision_timeout_secs",
                reason: "must be greater than zero".into(),
            });
        }
        if self.openai.embedding_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "openai.embedding_timeout_secs",
                reason: "must be greater than zero".into(),
            });
        }
        if self.pipeline.render_width == 0 {
            return Err(ConfigError::Invalid {
                field: "pipeline.render_width",
                reason: "must be greater than zero".into(),
            });
        }
        if !self.pipeline.cost_per_1k_tokens.is_finite() || self.pipeline.cost_per_1k_tokens < 0.0 {
            return Err(ConfigError::Invalid {
                field: "pipeline.cost_per_1k_tokens",
                reason: "must be a non-negative number".into(),
            });
        }
        if self.openai.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "openai.base_url",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }

    /// API key, required only by commands that call the model services.
    pub fn api_key(&self) -> Result<&str, ConfigError> {
        self.openai
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(ConfigError::MissingApiKey)
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.storage.join("caseingest.db"))
    }

    pub fn kv_database_path(&self) -> PathBuf {
        self.kv_database
            .clone()
            .unwrap_or_else(|| self.storage.join("kv.db"))
    }
}

pub fn project_dirs() -> Result<ProjectDirs, ConfigError> {
    ProjectDirs::from("dev", "caseingest", "caseingest").ok_or(ConfigError::MissingProjectDirs)
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    Ok(project_dirs()?.config_dir().join(CONFIG_FILE))
}

fn expand(path: &Path) -> Result<PathBuf, ConfigError> {
    let raw = path.to_string_lossy();
    shellexpand::full(&raw)
        .map(|expanded| PathBuf::from(expanded.as_ref()))
        .map_err(|e| ConfigError::Expand {
            value: raw.to_string(),
            reason: e.to_string(),
        })
}

/// JSON schema of the config file, pretty-printed.
pub fn schema_json() -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&schemars::schema_for!(IngestConfig))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_fill_missing_sections() {
        let config = IngestConfig::from_toml(
            r#"
            repository = "/data/repo"

            [openai]
            api_key = "sk-file"
            "#,
            Path::new("config.toml"),
        )
        .unwrap();
        assert_eq!(config.repository, PathBuf::from("/data/repo"));
        assert_eq!(config.openai.vision_model, "gpt-4o");
        assert_eq!(config.openai.embedding_timeout(), Duration::from_secs(30));
        assert_eq!(config.pipeline.render_width, 2480);
        assert_eq!(config.database_path(), PathBuf::from("./storage/caseingest.db"));
        assert_eq!(config.kv_database_path(), PathBuf::from("./storage/kv.db"));
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = IngestConfig::default();
        config.openai.api_key = Some("sk-file".into());
        let env: HashMap<&str, &str> = HashMap::from([
            ("OPENAI_API_KEY", "sk-env"),
            ("CASEINGEST_STORAGE", "/srv/storage"),
            ("OPENAI_BASE_URL", " "),
        ]);
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.api_key().unwrap(), "sk-env");
        assert_eq!(config.storage, PathBuf::from("/srv/storage"));
        assert_eq!(config.openai.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn missing_key_and_bad_values_are_rejected() {
        let config = IngestConfig::default();
        assert!(matches!(config.api_key(), Err(ConfigError::MissingApiKey)));

        let mut config = IngestConfig::default();
        config.openai.vision_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "openai.vision_timeout_secs", .. })
        ));
    }

    #[test]
    fn malformed_toml_reports_the_path() {
        let err = IngestConfig::from_toml("repository = [", Path::new("/etc/x.toml")).unwrap_err();
        assert!(err.to_string().contains("/etc/x.toml"));
    }

    #[test]
    fn schema_names_every_section() {
        let schema = schema_json().unwrap();
        assert!(schema.contains("openai"));
        assert!(schema.contains("prune_page_artifacts"));
    }
}
