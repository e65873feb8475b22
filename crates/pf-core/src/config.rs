//! Pipeline configuration
//!
//! Every section has working defaults; a RON file only needs the fields it
//! changes.

use std::path::Path;
use std::time::Duration;

use pf_kernel::{StepExportOptions, TessellationParams};
use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::engine::EngineConfig;
use crate::export::ExportOptions;

/// Tessellation and STEP header settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub linear_tolerance: f64,
    /// Read by B-rep kernel backends only; the implicit kernel meshes on a grid
    pub angular_tolerance: f64,
    /// Sampling resolution along the longest axis
    pub max_cells: u32,
    pub product_name: String,
    pub author: Option<String>,
    pub organization: Option<String>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        let tessellation = TessellationParams::default();
        Self {
            linear_tolerance: tessellation.linear_tolerance,
            angular_tolerance: tessellation.angular_tolerance,
            max_cells: 96,
            product_name: StepExportOptions::default().product_name,
            author: None,
            organization: None,
        }
    }
}

impl ExportConfig {
    pub fn options(&self) -> ExportOptions {
        ExportOptions {
            tessellation: TessellationParams {
                linear_tolerance: self.linear_tolerance,
                angular_tolerance: self.angular_tolerance,
                max_cells: self.max_cells,
            },
            step: StepExportOptions {
                product_name: self.product_name.clone(),
                author: self.author.clone(),
                organization: self.organization.clone(),
            },
        }
    }
}

/// Request concurrency settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Builds running at the same time
    pub count: usize,
    /// Wall-clock limit for one request
    pub request_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            request_timeout_ms: 120_000,
        }
    }
}

impl WorkerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub engine: EngineConfig,
    pub export: ExportConfig,
    pub cache: CacheConfig,
    pub workers: WorkerConfig,
}

impl PipelineConfig {
    /// Load configuration from a RON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_ron(&content)
    }

    pub fn from_ron(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = ron::from_str(content).map_err(|e| ConfigError::Deserialize(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_ron(&self) -> Result<String, ConfigError> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Save configuration to a RON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = self.to_ron()?;
        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Io(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: &str| Err(ConfigError::Invalid(format!("{}: {}", field, reason)));

        if self.engine.node_time_budget_ms == 0 {
            return invalid("engine.node_time_budget_ms", "must be greater than zero");
        }
        if !(self.export.linear_tolerance > 0.0 && self.export.linear_tolerance.is_finite()) {
            return invalid("export.linear_tolerance", "must be a positive number");
        }
        if !(self.export.angular_tolerance > 0.0 && self.export.angular_tolerance.is_finite()) {
            return invalid("export.angular_tolerance", "must be a positive number");
        }
        if self.export.max_cells == 0 {
            return invalid("export.max_cells", "must be greater than zero");
        }
        if self.cache.max_bytes == 0 {
            return invalid("cache.max_bytes", "must be greater than zero");
        }
        if self.cache.disk_max_bytes == Some(0) {
            return invalid("cache.disk_max_bytes", "must be greater than zero");
        }
        if self.workers.count == 0 {
            return invalid("workers.count", "must be greater than zero");
        }
        if self.workers.request_timeout_ms == 0 {
            return invalid("workers.request_timeout_ms", "must be greater than zero");
        }
        Ok(())
    }
}

/// Configuration-related errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialize(String),
    #[error("Deserialization error: {0}")]
    Deserialize(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_ron_keeps_defaults() {
        let config = PipelineConfig::from_ron(
            r#"(
                engine: (node_time_budget_ms: 500),
                cache: (max_bytes: 1024, directory: Some("/tmp/pf-cache")),
            )"#,
        )
        .unwrap();

        assert_eq!(config.engine.node_time_budget(), Duration::from_millis(500));
        assert_eq!(config.cache.max_bytes, 1024);
        assert_eq!(config.cache.max_age_secs, CacheConfig::default().max_age_secs);
        assert_eq!(config.export, ExportConfig::default());
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pf.ron");

        let mut config = PipelineConfig::default();
        config.export.author = Some("Bench".into());
        config.workers.count = 3;
        config.save(&path).unwrap();

        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = PipelineConfig::from_ron("(workers: (count: 0))").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.starts_with("workers.count")));

        let err = PipelineConfig::from_ron("(cache: (disk_max_bytes: Some(0)))").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.starts_with("cache.disk_max_bytes")));

        let err = PipelineConfig::from_ron("(engine: (node_time_budget_ms: 0))").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        assert!(matches!(
            PipelineConfig::from_ron("(engine: 3)"),
            Err(ConfigError::Deserialize(_))
        ));
    }

    #[test]
    fn test_export_options_from_config() {
        let config = ExportConfig {
            max_cells: 20,
            author: Some("a".into()),
            ..ExportConfig::default()
        };
        let options = config.options();
        assert_eq!(options.tessellation.max_cells, 20);
        assert_eq!(options.step.author.as_deref(), Some("a"));
        assert_eq!(options.step.product_name, "part");
    }
}
