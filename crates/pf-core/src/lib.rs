//! Headless parametric build-and-export pipeline
//!
//! This crate contains:
//! - Request: JSON descriptor parsing into a fingerprinted BuildSpecification
//! - Graph: validated, deterministically ordered arena of build nodes
//! - Engine: per-build kernel evaluation with all-or-nothing handle release
//! - Export: STEP, STL, GLB and OBJ serialization of finished builds
//! - Cache: shared artifact store with an optional disk tier
//! - Pipeline / Dispatcher: the request path, blocking and async

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod environment;
pub mod error;
pub mod export;
pub mod graph;
pub mod pipeline;
pub mod request;
pub mod template;

pub use cache::{ArtifactCache, CacheConfig, CacheStats, DiskStore};
pub use config::{ConfigError, ExportConfig, PipelineConfig, WorkerConfig};
pub use dispatch::Dispatcher;
pub use engine::{BuildWarning, CancelToken, Engine, EngineConfig, EngineError, FinishedBuild};
pub use environment::{EnvironmentError, EnvironmentReport, check_headless};
pub use error::{BuildFailure, FailureKind, PipelineError};
pub use export::{ExportArtifact, ExportError, ExportFormat, ExportOptions, Exporter};
pub use graph::{BuildGraph, BuildNode, GraphError, NodeId};
pub use pipeline::{BuildOutcome, Pipeline};
pub use request::{ArtifactKey, BuildSpecification, Fingerprint, ValidationError, parse_request, parse_value};
pub use template::basket_stud;
