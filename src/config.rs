//! Configuration for the report pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Main configuration for a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where records come from
    pub source: SourceConfig,

    /// Transformation stages, applied in order
    #[serde(default)]
    pub transforms: Vec<TransformConfig>,

    /// Serialization format
    #[serde(default)]
    pub format: FormatConfig,

    /// Where serialized bytes go
    #[serde(default)]
    pub output: OutputConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Record source configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Synthetic user records, for demos and load tests
    Mock {
        #[serde(default = "default_mock_count")]
        count: usize,
    },

    /// Delimited text file with a header row
    Csv {
        path: String,

        #[serde(default = "default_delimiter")]
        delimiter: char,

        /// Convert cells to numbers and booleans where they parse
        #[serde(default = "default_true")]
        infer_types: bool,
    },

    /// One JSON object per line
    JsonLines { path: String },
}

/// A single transformation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformConfig {
    /// Keep records whose `field` equals `equals`, or is present and
    /// non-null when `equals` is omitted.
    Filter {
        field: String,
        #[serde(default)]
        equals: Option<Value>,
    },

    Rename { from: String, to: String },

    Drop { fields: Vec<String> },

    Set { field: String, value: Value },

    Uppercase { fields: Vec<String> },
}

impl TransformConfig {
    fn field_names(&self) -> Vec<&str> {
        match self {
            TransformConfig::Filter { field, .. } | TransformConfig::Set { field, .. } => {
                vec![field.as_str()]
            }
            TransformConfig::Rename { from, to } => vec![from.as_str(), to.as_str()],
            TransformConfig::Drop { fields } | TransformConfig::Uppercase { fields } => {
                fields.iter().map(String::as_str).collect()
            }
        }
    }
}

/// Output serialization format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FormatConfig {
    /// A single JSON array
    #[default]
    Json,

    /// Newline-delimited JSON
    JsonLines,

    /// Delimited text with a header row. Columns default to the sorted
    /// fields of the first record written.
    Csv {
        #[serde(default)]
        columns: Option<Vec<String>>,

        #[serde(default = "default_delimiter")]
        delimiter: char,
    },

    Yaml,
}

/// Output sink configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputConfig {
    /// Standard output
    #[default]
    Console,

    /// Local file; parent directories are created
    File {
        path: String,

        /// Append instead of truncating
        #[serde(default)]
        append: bool,
    },
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Records per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Worker pool size when `use_worker_pool` is set
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Run transforms on the worker pool instead of inline
    #[serde(default)]
    pub use_worker_pool: bool,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Rayon thread pool size for CPU-bound work
    #[serde(default)]
    pub rayon_threads: Option<usize>,

    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,

    /// Retry configuration for failed transform stages
    #[serde(default)]
    pub retry: RetryConfig,

    /// How long to wait for in-flight pool work on shutdown
    #[serde(default = "default_close_timeout")]
    pub close_timeout_secs: u64,

    /// Maximum idle records kept for reuse
    #[serde(default = "default_record_pool_capacity")]
    pub record_pool_capacity: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            worker_count: default_worker_count(),
            use_worker_pool: false,
            worker_threads: None,
            rayon_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
            retry: RetryConfig::default(),
            close_timeout_secs: default_close_timeout(),
            record_pool_capacity: default_record_pool_capacity(),
        }
    }
}

/// Retry configuration for transient stage failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Wrap every stage in a retry decorator
    #[serde(default)]
    pub enabled: bool,

    /// Maximum attempts per chunk, including the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10000,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // Try YAML first (it's a superset of JSON)
                serde_yaml::from_str(&contents)?
            }
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// A small working configuration: mock users, filtered to active ones,
    /// written to stdout as JSON lines.
    pub fn example() -> Self {
        Self {
            source: SourceConfig::Mock { count: 100 },
            transforms: vec![
                TransformConfig::Filter {
                    field: "active".to_string(),
                    equals: Some(Value::Bool(true)),
                },
                TransformConfig::Drop {
                    fields: vec!["email".to_string()],
                },
                TransformConfig::Uppercase {
                    fields: vec!["name".to_string()],
                },
            ],
            format: FormatConfig::JsonLines,
            output: OutputConfig::Console,
            processing: ProcessingConfig::default(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        match &self.source {
            SourceConfig::Csv { path, .. } | SourceConfig::JsonLines { path } => {
                if path.is_empty() {
                    anyhow::bail!("Source path must not be empty");
                }
            }
            SourceConfig::Mock { .. } => {}
        }
        if let SourceConfig::Csv { delimiter, .. } = &self.source {
            if !delimiter.is_ascii() {
                anyhow::bail!("CSV source delimiter must be a single ASCII character");
            }
        }

        for (i, transform) in self.transforms.iter().enumerate() {
            let fields = transform.field_names();
            if fields.is_empty() {
                anyhow::bail!("Transform {} must name at least one field", i);
            }
            if fields.iter().any(|f| f.is_empty()) {
                anyhow::bail!("Transform {} has an empty field name", i);
            }
        }

        if let FormatConfig::Csv { columns, delimiter } = &self.format {
            if matches!(columns, Some(c) if c.is_empty()) {
                anyhow::bail!("CSV column list must not be empty");
            }
            if !delimiter.is_ascii() {
                anyhow::bail!("CSV format delimiter must be a single ASCII character");
            }
        }

        if let OutputConfig::File { path, .. } = &self.output {
            if path.is_empty() {
                anyhow::bail!("Output path must not be empty");
            }
        }

        if self.processing.chunk_size == 0 {
            anyhow::bail!("Chunk size must be > 0");
        }
        if self.processing.worker_count == 0 {
            anyhow::bail!("Worker count must be > 0");
        }
        if self.processing.retry.max_retries == 0 {
            anyhow::bail!("Retry max_retries must be > 0");
        }
        if self.processing.retry.initial_backoff_ms > self.processing.retry.max_backoff_ms {
            anyhow::bail!("Retry initial backoff must not exceed max backoff");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_mock_count() -> usize { 1000 }
fn default_delimiter() -> char { ',' }
fn default_chunk_size() -> usize { crate::record::DEFAULT_CHUNK_SIZE }
fn default_worker_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 10000 }
fn default_close_timeout() -> u64 { 30 }
fn default_record_pool_capacity() -> usize { crate::record::DEFAULT_POOL_CAPACITY }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_processing() {
        let processing = ProcessingConfig::default();
        assert_eq!(processing.chunk_size, 1000);
        assert!(processing.worker_count >= 1);
        assert!(!processing.use_worker_pool);
        assert!(processing.enable_metrics);
        assert_eq!(processing.metrics_interval_secs, 10);
        assert_eq!(processing.close_timeout_secs, 30);
        assert_eq!(processing.record_pool_capacity, 4096);
        assert_eq!(processing.retry, RetryConfig::default());
        assert!(!processing.retry.enabled);
    }

    #[test]
    fn test_parse_minimal_yaml() {
        let yaml = r#"
source:
  type: csv
  path: data/users.csv
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(
            config.source,
            SourceConfig::Csv {
                path: "data/users.csv".to_string(),
                delimiter: ',',
                infer_types: true,
            }
        );
        assert!(config.transforms.is_empty());
        assert_eq!(config.format, FormatConfig::Json);
        assert_eq!(config.output, OutputConfig::Console);
        assert_eq!(config.processing.chunk_size, 1000);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
source:
  type: json_lines
  path: events.jsonl
transforms:
  - type: filter
    field: status
    equals: ok
  - type: rename
    from: ts
    to: timestamp
  - type: set
    field: batch
    value: 7
format:
  type: csv
  columns: [timestamp, status]
  delimiter: ";"
output:
  type: file
  path: out/report.csv
  append: true
processing:
  chunk_size: 250
  worker_count: 4
  use_worker_pool: true
  retry:
    enabled: true
    max_retries: 5
"#;
        let config = Config::from_yaml(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.transforms.len(), 3);
        assert_eq!(
            config.transforms[0],
            TransformConfig::Filter {
                field: "status".to_string(),
                equals: Some(Value::String("ok".to_string())),
            }
        );
        assert_eq!(
            config.format,
            FormatConfig::Csv {
                columns: Some(vec!["timestamp".to_string(), "status".to_string()]),
                delimiter: ';',
            }
        );
        assert_eq!(
            config.output,
            OutputConfig::File {
                path: "out/report.csv".to_string(),
                append: true,
            }
        );
        assert_eq!(config.processing.chunk_size, 250);
        assert!(config.processing.use_worker_pool);
        assert!(config.processing.retry.enabled);
        assert_eq!(config.processing.retry.max_retries, 5);
        assert_eq!(config.processing.retry.initial_backoff_ms, 100);
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{"source": {"type": "mock", "count": 5}, "format": {"type": "yaml"}}"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.source, SourceConfig::Mock { count: 5 });
        assert_eq!(config.format, FormatConfig::Yaml);
    }

    #[test]
    fn test_from_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let yaml_path = dir.path().join("pipeline.yaml");
        std::fs::write(&yaml_path, Config::example().to_yaml().unwrap()).unwrap();
        let config = Config::from_file(&yaml_path).unwrap();
        assert_eq!(config.source, SourceConfig::Mock { count: 100 });

        let json_path = dir.path().join("pipeline.json");
        std::fs::write(&json_path, r#"{"source": {"type": "mock"}}"#).unwrap();
        let config = Config::from_file(&json_path).unwrap();
        assert_eq!(config.source, SourceConfig::Mock { count: 1000 });

        assert!(Config::from_file(&dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::example();
        let parsed = Config::from_yaml(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(parsed.source, config.source);
        assert_eq!(parsed.transforms, config.transforms);
        assert_eq!(parsed.format, config.format);
        assert_eq!(parsed.output, config.output);
        assert_eq!(parsed.processing.chunk_size, config.processing.chunk_size);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let yaml = "source:\n  type: postgres\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_validation() {
        Config::example().validate().unwrap();

        let mut config = Config::example();
        config.processing.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::example();
        config.processing.worker_count = 0;
        assert!(config.validate().is_err());

        let mut config = Config::example();
        config.processing.retry.max_retries = 0;
        assert!(config.validate().is_err());

        let mut config = Config::example();
        config.source = SourceConfig::JsonLines {
            path: String::new(),
        };
        assert!(config.validate().is_err());

        let mut config = Config::example();
        config.output = OutputConfig::File {
            path: String::new(),
            append: false,
        };
        assert!(config.validate().is_err());

        let mut config = Config::example();
        config.format = FormatConfig::Csv {
            columns: Some(Vec::new()),
            delimiter: ',',
        };
        assert!(config.validate().is_err());

        let mut config = Config::example();
        config.transforms.push(TransformConfig::Rename {
            from: "a".to_string(),
            to: String::new(),
        });
        assert!(config.validate().is_err());

        let mut config = Config::example();
        config.transforms.push(TransformConfig::Drop { fields: Vec::new() });
        assert!(config.validate().is_err());
    }
}
