use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Log a progress line every N records scanned within a unit
pub const PROGRESS_INTERVAL: u64 = 10_000;

/// Rows per `upsert_batch` call
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Units processed concurrently
pub const DEFAULT_WORKERS: usize = 4;

/// A unit is aborted once more than this share of attempted records fail to parse
pub const DEFAULT_MAX_ERROR_RATE: f64 = 0.5;

/// Records attempted before the error rate is evaluated mid-unit
pub const DEFAULT_MIN_ERROR_SAMPLE: u64 = 1_000;

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 60_000;

/// SQLite busy handler wait before a lock error is surfaced to the retry policy
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 250;

/// Nested containers deeper than this are treated as corrupt
pub const MAX_ARCHIVE_DEPTH: usize = 8;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Buffer for spilling nested zips to scratch space and reading nested tar streams
pub const EXTRACT_BUFFER_SIZE: usize = 256 * 1024;

pub const READ_BUFFER_SIZE: usize = 1024 * 1024;

pub const DEFAULT_LEGAL_SUFFIXES: &[&str] = &[
    "ag", "bv", "co", "company", "corp", "corporation", "gmbh", "inc", "incorporated", "kg",
    "limited", "llc", "llp", "lp", "ltd", "nv", "plc", "pte", "pty", "sa", "sarl", "sas", "se",
    "spa", "srl",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config syntax: {0}")]
    Syntax(#[from] toml::de::Error),

    #[error("classifier has no categories")]
    NoCategories,

    #[error("category `{0}` is missing a weight")]
    MissingWeight(String),

    #[error("category `{name}` has invalid weight {weight} (must be finite and > 0)")]
    InvalidWeight { name: String, weight: f64 },

    #[error("category `{0}` has no patterns")]
    NoPatterns(String),

    #[error("category `{0}` is declared more than once")]
    DuplicateCategory(String),

    #[error("category `{name}` has invalid pattern: {source}")]
    InvalidPattern { name: String, source: regex::Error },

    #[error("normalization_constant must be finite and > 0, got {0}")]
    InvalidNormalization(f64),

    #[error("min_confidence must be within [0, 1], got {0}")]
    InvalidMinConfidence(f64),

    #[error("max_error_rate must be within (0, 1], got {0}")]
    InvalidErrorRate(f64),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("xml format requires records.xml_record_element")]
    MissingXmlRecordElement,
}

/// Top-level deployment configuration, loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    #[serde(default)]
    pub records: RecordConfig,
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub pipeline: RunConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub name: String,
    /// Only files with these extensions become work units (empty = all)
    #[serde(default)]
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormatChoice {
    #[default]
    Auto,
    Jsonl,
    JsonArray,
    Xml,
}

/// Which parts of a record are searched and which one names the entity.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordConfig {
    #[serde(default)]
    pub format: FormatChoice,
    /// JSON pointer or bare key (JSON), element local name (XML)
    #[serde(default)]
    pub name_field: Option<String>,
    #[serde(default)]
    pub text_fields: Vec<String>,
    /// Object keys leading from the document root to the record array
    #[serde(default)]
    pub json_array_path: Vec<String>,
    #[serde(default)]
    pub xml_record_element: Option<String>,
}

impl RecordConfig {
    /// Name field first, then text fields, without duplicates.
    pub fn xml_fields(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.name_field
            .iter()
            .chain(self.text_fields.iter())
            .filter(|f| seen.insert(f.as_str()))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassifierConfig {
    pub normalization_constant: f64,
    #[serde(default)]
    pub min_confidence: f64,
    #[serde(default)]
    pub categories: Vec<CategoryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CategoryConfig {
    pub name: String,
    pub weight: Option<f64>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub exclusions: Vec<String>,
    #[serde(default)]
    pub regex: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NormalizerConfig {
    #[serde(default = "default_legal_suffixes")]
    pub legal_suffixes: Vec<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            legal_suffixes: default_legal_suffixes(),
        }
    }
}

fn default_legal_suffixes() -> Vec<String> {
    DEFAULT_LEGAL_SUFFIXES.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RunConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub max_error_rate: f64,
    pub min_error_sample: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_error_rate: DEFAULT_MAX_ERROR_RATE,
            min_error_sample: DEFAULT_MIN_ERROR_SAMPLE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StoreConfig {
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parses and validates; an invalid config never reaches the pipeline.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.classifier;
        if !c.normalization_constant.is_finite() || c.normalization_constant <= 0.0 {
            return Err(ConfigError::InvalidNormalization(c.normalization_constant));
        }
        if !(0.0..=1.0).contains(&c.min_confidence) {
            return Err(ConfigError::InvalidMinConfidence(c.min_confidence));
        }
        if c.categories.is_empty() {
            return Err(ConfigError::NoCategories);
        }

        let mut names = HashSet::new();
        for cat in &c.categories {
            if !names.insert(cat.name.as_str()) {
                return Err(ConfigError::DuplicateCategory(cat.name.clone()));
            }
            let weight = cat
                .weight
                .ok_or_else(|| ConfigError::MissingWeight(cat.name.clone()))?;
            if !weight.is_finite() || weight <= 0.0 {
                return Err(ConfigError::InvalidWeight {
                    name: cat.name.clone(),
                    weight,
                });
            }
            if cat.patterns.is_empty() {
                return Err(ConfigError::NoPatterns(cat.name.clone()));
            }
        }

        let run = &self.pipeline;
        if !(run.max_error_rate > 0.0 && run.max_error_rate <= 1.0) {
            return Err(ConfigError::InvalidErrorRate(run.max_error_rate));
        }
        if run.workers == 0 {
            return Err(ConfigError::Zero("pipeline.workers"));
        }
        if run.batch_size == 0 {
            return Err(ConfigError::Zero("pipeline.batch_size"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Zero("retry.max_attempts"));
        }
        if self.records.format == FormatChoice::Xml && self.records.xml_record_element.is_none()
        {
            return Err(ConfigError::MissingXmlRecordElement);
        }
        Ok(())
    }
}
