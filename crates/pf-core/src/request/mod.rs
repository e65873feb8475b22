//! Request descriptors and the normalized build specification

mod fingerprint;
mod parse;

use std::collections::BTreeMap;

use pf_kernel::EdgeSelector;
use serde::{Deserialize, Serialize};

pub use fingerprint::{ArtifactKey, Fingerprint};
pub use parse::{parse_request, parse_value};

/// Largest magnitude accepted for any numeric field
pub const MAX_MAGNITUDE: f64 = 1e6;

/// Most operations accepted in one request
pub const MAX_OPERATIONS: usize = 1000;

/// Largest `polar_array` copy count
pub const MAX_POLAR_COUNT: u32 = 360;

/// A request field failed validation; nothing was built
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Invalid field '{field}': {reason}")]
pub struct ValidationError {
    /// Path of the offending field, e.g. `operations[1].radius`
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A named request parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

/// Operation kind group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Primitive,
    Transform,
    Boolean,
    Feature,
}

/// A modeling step with every parameter reference resolved
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpKind {
    Box {
        size: [f64; 3],
        center: [f64; 3],
    },
    Cylinder {
        radius: f64,
        height: f64,
        center: [f64; 3],
        axis: [f64; 3],
    },
    Sphere {
        radius: f64,
        center: [f64; 3],
    },
    Translate {
        offset: [f64; 3],
    },
    Rotate {
        /// Degrees
        angle: f64,
        axis: [f64; 3],
        origin: [f64; 3],
    },
    Scale {
        factor: f64,
    },
    PolarArray {
        count: u32,
        axis: [f64; 3],
        origin: [f64; 3],
    },
    Union,
    Subtract,
    Intersect,
    Fillet {
        radius: f64,
        edges: EdgeSelector,
    },
    Chamfer {
        distance: f64,
        edges: EdgeSelector,
    },
}

impl OpKind {
    pub fn kind(&self) -> NodeKind {
        match self {
            OpKind::Box { .. } | OpKind::Cylinder { .. } | OpKind::Sphere { .. } => NodeKind::Primitive,
            OpKind::Translate { .. }
            | OpKind::Rotate { .. }
            | OpKind::Scale { .. }
            | OpKind::PolarArray { .. } => NodeKind::Transform,
            OpKind::Union | OpKind::Subtract | OpKind::Intersect => NodeKind::Boolean,
            OpKind::Fillet { .. } | OpKind::Chamfer { .. } => NodeKind::Feature,
        }
    }

    /// Request name of this operation
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Box { .. } => "box",
            OpKind::Cylinder { .. } => "cylinder",
            OpKind::Sphere { .. } => "sphere",
            OpKind::Translate { .. } => "translate",
            OpKind::Rotate { .. } => "rotate",
            OpKind::Scale { .. } => "scale",
            OpKind::PolarArray { .. } => "polar_array",
            OpKind::Union => "union",
            OpKind::Subtract => "subtract",
            OpKind::Intersect => "intersect",
            OpKind::Fillet { .. } => "fillet",
            OpKind::Chamfer { .. } => "chamfer",
        }
    }
}

/// One operation of a normalized request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    pub id: String,
    pub op: OpKind,
    /// Referenced operation ids, in argument order
    pub inputs: Vec<String>,
    /// Feature toggle; a disabled operation passes its first input through
    pub enabled: bool,
    /// Kernel failure degrades to the input with a warning (features only)
    pub optional: bool,
}

/// Normalized, immutable build request
#[derive(Debug, Clone, PartialEq)]
pub struct BuildSpecification {
    parameters: BTreeMap<String, ParamValue>,
    operations: Vec<Operation>,
    outputs: Vec<String>,
    fingerprint: Fingerprint,
}

impl BuildSpecification {
    pub(crate) fn new(
        parameters: BTreeMap<String, ParamValue>,
        operations: Vec<Operation>,
        outputs: Vec<String>,
    ) -> Result<Self, ValidationError> {
        let fingerprint = Fingerprint::of_specification(&parameters, &operations, &outputs)
            .map_err(|e| ValidationError::new("$", format!("cannot normalize request: {}", e)))?;
        Ok(Self {
            parameters,
            operations,
            outputs,
            fingerprint,
        })
    }

    /// Parameters, sorted by name
    pub fn parameters(&self) -> &BTreeMap<String, ParamValue> {
        &self.parameters
    }

    /// Operations in declaration order
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// SHA-256 content hash of the normalized form
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}
