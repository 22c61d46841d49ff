use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{
    ChunkGeometry, DEFAULT_GROWTH_DIM, FailurePolicy, FirstBatchPolicy, Location,
    VariableAllowList,
};
use crate::error::IngestError;
use crate::lister::literal_prefix;
use crate::zarr::Compressor;

pub const DEFAULT_CONFIG_FILE: &str = "grid-ingest.json";
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_RETRIES: u32 = 10;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 200;
pub const DEFAULT_GZIP_LEVEL: u32 = 1;

/// `grid-ingest.json`. Missing fields fall back to CLI flags, then defaults.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub store: Option<String>,
    #[serde(default)]
    pub variables: Option<Vec<String>>,
    #[serde(default)]
    pub chunks: Option<ChunkGeometry>,
    #[serde(default)]
    pub growth_dim: Option<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub policy: Option<FailurePolicy>,
    #[serde(default)]
    pub first_batch_policy: Option<FirstBatchPolicy>,
    #[serde(default)]
    pub compression: Option<CompressionEntry>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CompressionEntry {
    /// `"none"` or `"gzip"`.
    Shorthand(String),
    Detailed(Compressor),
}

#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub source: Option<String>,
    pub store: Option<String>,
    pub batch_size: Option<usize>,
    pub retries: Option<u32>,
    pub workers: Option<usize>,
    pub policy: Option<FailurePolicy>,
    pub first_batch_policy: Option<FirstBatchPolicy>,
    pub chunks: Vec<(String, usize)>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub source: String,
    pub store: Location,
    pub allow_list: VariableAllowList,
    pub geometry: ChunkGeometry,
    pub growth_dim: String,
    pub batch_size: usize,
    pub retries: u32,
    pub retry_delay: Duration,
    pub workers: usize,
    pub policy: FailurePolicy,
    pub first_batch_policy: FirstBatchPolicy,
    pub compressor: Option<Compressor>,
    pub limit: Option<usize>,
}

impl RunConfig {
    pub fn new(source: impl Into<String>, store: Location) -> Self {
        Self {
            source: source.into(),
            store,
            allow_list: VariableAllowList::default(),
            geometry: ChunkGeometry::default(),
            growth_dim: DEFAULT_GROWTH_DIM.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            retries: DEFAULT_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            workers: default_workers(),
            policy: FailurePolicy::FailFast,
            first_batch_policy: FirstBatchPolicy::CreateFromPartial,
            compressor: Some(Compressor::Gzip {
                level: DEFAULT_GZIP_LEVEL,
            }),
            limit: None,
        }
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.batch_size == 0 {
            return Err(IngestError::InvalidConfig(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(IngestError::InvalidConfig(
                "workers must be positive".to_string(),
            ));
        }
        if self.allow_list.is_empty() {
            return Err(IngestError::InvalidConfig(
                "variable allow-list is empty".to_string(),
            ));
        }
        if !self.allow_list.contains(&self.growth_dim) {
            return Err(IngestError::InvalidConfig(format!(
                "variable allow-list must include the growth dimension `{}`",
                self.growth_dim
            )));
        }
        if self.geometry.get(&self.growth_dim).is_none() {
            return Err(IngestError::InvalidConfig(format!(
                "chunk geometry must set a length for `{}`",
                self.growth_dim
            )));
        }
        if let Some((dim, _)) = self.geometry.iter().find(|(_, len)| *len == 0) {
            return Err(IngestError::InvalidConfig(format!(
                "chunk length for `{dim}` must be positive"
            )));
        }
        if let Some(compressor) = self.compressor {
            compressor.codec()?;
        }
        self.check_store_location()
    }

    /// Create mode erases everything below the store key, so the store may
    /// neither be a backend root nor hold the source files.
    fn check_store_location(&self) -> Result<(), IngestError> {
        let store = self.store.key();
        if store.is_empty() {
            return Err(IngestError::InvalidLocation(format!(
                "{}: the store must be a directory below the backend root",
                self.store
            )));
        }
        let Ok(source) = self.source.parse::<Location>() else {
            return Ok(());
        };
        if source.scheme() != self.store.scheme() {
            return Ok(());
        }
        let prefix = literal_prefix(source.key());
        if prefix == store || prefix.starts_with(&format!("{store}/")) {
            return Err(IngestError::InvalidLocation(format!(
                "{}: the store would contain the source files of {}",
                self.store, self.source
            )));
        }
        Ok(())
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>, overrides: ConfigOverrides) -> Result<RunConfig, IngestError> {
        let config = Self::load(path)?;
        Self::resolve_config(config, overrides)
    }

    pub fn load(path: Option<&str>) -> Result<Config, IngestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };
        if path.is_none() && !config_path.exists() {
            return Ok(Config::default());
        }
        if !config_path.exists() {
            return Err(IngestError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| IngestError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| IngestError::ConfigParse(err.to_string()))
    }

    pub fn resolve_config(
        config: Config,
        overrides: ConfigOverrides,
    ) -> Result<RunConfig, IngestError> {
        let source = overrides
            .source
            .or(config.source)
            .ok_or_else(|| IngestError::InvalidConfig("a source pattern is required".to_string()))?;
        let store: Location = overrides
            .store
            .or(config.store)
            .ok_or_else(|| IngestError::InvalidConfig("a store location is required".to_string()))?
            .parse()?;

        let mut resolved = RunConfig::new(source, store);
        if let Some(variables) = config.variables {
            resolved.allow_list = VariableAllowList::new(variables);
        }
        if let Some(chunks) = config.chunks {
            resolved.geometry = chunks;
        }
        for (dim, len) in overrides.chunks {
            resolved.geometry.set(dim, len);
        }
        if let Some(growth_dim) = config.growth_dim {
            resolved.growth_dim = growth_dim;
        }
        resolved.batch_size = overrides
            .batch_size
            .or(config.batch_size)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        resolved.retries = overrides
            .retries
            .or(config.retries)
            .unwrap_or(DEFAULT_RETRIES);
        if let Some(delay) = config.retry_delay_ms {
            resolved.retry_delay = Duration::from_millis(delay);
        }
        if let Some(workers) = overrides.workers.or(config.workers) {
            resolved.workers = workers;
        }
        resolved.policy = overrides
            .policy
            .or(config.policy)
            .unwrap_or(FailurePolicy::FailFast);
        resolved.first_batch_policy = overrides
            .first_batch_policy
            .or(config.first_batch_policy)
            .unwrap_or(FirstBatchPolicy::CreateFromPartial);
        if let Some(entry) = config.compression {
            resolved.compressor = resolve_compression(entry)?;
        }
        resolved.limit = overrides.limit.or(config.limit);

        resolved.validate()?;
        Ok(resolved)
    }
}

fn resolve_compression(entry: CompressionEntry) -> Result<Option<Compressor>, IngestError> {
    match entry {
        CompressionEntry::Detailed(compressor) => Ok(Some(compressor)),
        CompressionEntry::Shorthand(name) => match name.to_ascii_lowercase().as_str() {
            "none" | "raw" => Ok(None),
            "gzip" => Ok(Some(Compressor::Gzip {
                level: DEFAULT_GZIP_LEVEL,
            })),
            other => Err(IngestError::InvalidConfig(format!(
                "unknown compression `{other}`"
            ))),
        },
    }
}
