//! Request pipeline: parse, graph, cache lookup, evaluate, export
//!
//! One call to [`Pipeline::run`] serves one request on the calling thread.
//! Validation and graph errors are raised before a kernel instance exists;
//! a request whose artifacts are all cached never creates one.

use std::sync::Arc;
use std::time::Instant;

use pf_kernel::{GeometryKernel, KernelFactory};
use serde_json::Value;

use crate::cache::ArtifactCache;
use crate::config::PipelineConfig;
use crate::engine::{BuildWarning, CancelToken, Engine};
use crate::error::PipelineError;
use crate::export::{ExportArtifact, ExportFormat, Exporter};
use crate::graph::BuildGraph;
use crate::request::{BuildSpecification, Fingerprint, ValidationError, parse_request, parse_value};

/// Artifacts produced (or found) for one request, in requested format order
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub fingerprint: Fingerprint,
    pub artifacts: Vec<Arc<ExportArtifact>>,
    /// Degraded optional features; empty when served from cache
    pub warnings: Vec<BuildWarning>,
    /// True when every artifact came from the cache
    pub cache_hit: bool,
}

impl BuildOutcome {
    pub fn artifact(&self, format: ExportFormat) -> Option<&Arc<ExportArtifact>> {
        self.artifacts.iter().find(|a| a.format == format)
    }
}

pub struct Pipeline<F: KernelFactory> {
    factory: F,
    engine: Engine,
    exporter: Exporter,
    cache: Option<Arc<ArtifactCache>>,
}

impl<F: KernelFactory> Pipeline<F> {
    pub fn new(factory: F, config: &PipelineConfig) -> Self {
        Self {
            factory,
            engine: Engine::new(config.engine.clone()),
            exporter: Exporter::new(config.export.options()),
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<ArtifactCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn cache(&self) -> Option<&Arc<ArtifactCache>> {
        self.cache.as_ref()
    }

    /// Serve a JSON request document
    pub fn run(
        &self,
        request: &str,
        formats: &[ExportFormat],
        cancel: &CancelToken,
    ) -> Result<BuildOutcome, PipelineError> {
        let spec = parse_request(request)?;
        self.run_spec(&spec, formats, cancel)
    }

    pub fn run_value(
        &self,
        request: &Value,
        formats: &[ExportFormat],
        cancel: &CancelToken,
    ) -> Result<BuildOutcome, PipelineError> {
        let spec = parse_value(request)?;
        self.run_spec(&spec, formats, cancel)
    }

    pub fn run_spec(
        &self,
        spec: &BuildSpecification,
        formats: &[ExportFormat],
        cancel: &CancelToken,
    ) -> Result<BuildOutcome, PipelineError> {
        let started = Instant::now();
        let mut wanted: Vec<ExportFormat> = Vec::with_capacity(formats.len());
        for &format in formats {
            if !wanted.contains(&format) {
                wanted.push(format);
            }
        }
        if wanted.is_empty() {
            return Err(ValidationError::new("formats", "at least one export format is required").into());
        }

        let graph = BuildGraph::from_spec(spec)?;

        let mut found: Vec<Option<Arc<ExportArtifact>>> = wanted
            .iter()
            .map(|&format| {
                let key = self.exporter.key_for(spec.fingerprint(), format);
                self.cache.as_ref().and_then(|cache| cache.get(&key))
            })
            .collect();

        if found.iter().all(Option::is_some) {
            tracing::info!(
                fingerprint = %spec.fingerprint(),
                formats = wanted.len(),
                "request served from cache"
            );
            return Ok(BuildOutcome {
                fingerprint: spec.fingerprint().clone(),
                artifacts: found.into_iter().flatten().collect(),
                warnings: Vec::new(),
                cache_hit: true,
            });
        }

        let kernel = self
            .factory
            .create()
            .map_err(|e| PipelineError::KernelUnavailable(e.to_string()))?;
        if !kernel.is_available() {
            return Err(PipelineError::KernelUnavailable(format!(
                "kernel '{}' is not available",
                kernel.name()
            )));
        }

        let build = self.engine.evaluate(kernel, spec, &graph, cancel)?;

        for (slot, &format) in found.iter_mut().zip(&wanted) {
            if slot.is_some() {
                continue;
            }
            let artifact = self.exporter.export(&build, format)?;
            *slot = Some(match &self.cache {
                Some(cache) => cache.put(artifact),
                None => Arc::new(artifact),
            });
        }
        let warnings = build.warnings().to_vec();
        drop(build);

        tracing::info!(
            fingerprint = %spec.fingerprint(),
            formats = wanted.len(),
            warnings = warnings.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request complete"
        );
        Ok(BuildOutcome {
            fingerprint: spec.fingerprint().clone(),
            artifacts: found.into_iter().flatten().collect(),
            warnings,
            cache_hit: false,
        })
    }
}

impl<F: KernelFactory> std::fmt::Debug for Pipeline<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("engine", &self.engine)
            .field("exporter", &self.exporter)
            .field("cache", &self.cache)
            .finish()
    }
}
