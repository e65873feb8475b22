//! Request descriptor parser
//!
//! Turns a JSON request into a [`BuildSpecification`]. Every `"$name"` value
//! is replaced by the named parameter, every numeric field is range checked,
//! and the first problem is reported with the path of the offending field.
//! Nothing is built here; graph structure (references, cycles) is checked by
//! the build graph.

use std::collections::BTreeMap;

use pf_kernel::EdgeSelector;
use serde_json::{Map, Value};

use super::{
    BuildSpecification, MAX_MAGNITUDE, MAX_OPERATIONS, MAX_POLAR_COUNT, OpKind, Operation, ParamValue, ValidationError,
};

type Result<T> = std::result::Result<T, ValidationError>;

const TOP_LEVEL_FIELDS: &[&str] = &["parameters", "operations", "outputs"];
const COMMON_FIELDS: &[&str] = &["id", "op", "when", "optional"];
const BOX_FIELDS: &[&str] = &["size", "center"];
const CYLINDER_FIELDS: &[&str] = &["radius", "height", "center", "axis"];
const SPHERE_FIELDS: &[&str] = &["radius", "center"];
const TRANSLATE_FIELDS: &[&str] = &["input", "offset"];
const ROTATE_FIELDS: &[&str] = &["input", "angle", "axis", "origin"];
const SCALE_FIELDS: &[&str] = &["input", "factor"];
const POLAR_FIELDS: &[&str] = &["input", "count", "axis", "origin"];
const BOOLEAN_FIELDS: &[&str] = &["inputs"];
const FILLET_FIELDS: &[&str] = &["input", "radius", "edges"];
const CHAMFER_FIELDS: &[&str] = &["input", "distance", "edges"];

const ORIGIN: [f64; 3] = [0.0, 0.0, 0.0];
const Z_AXIS: [f64; 3] = [0.0, 0.0, 1.0];

/// Parse and validate a JSON request document
pub fn parse_request(text: &str) -> Result<BuildSpecification> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ValidationError::new("$", format!("malformed JSON: {}", e)))?;
    parse_value(&value)
}

/// Validate an already decoded request document
pub fn parse_value(value: &Value) -> Result<BuildSpecification> {
    let root = value
        .as_object()
        .ok_or_else(|| ValidationError::new("$", "request must be a JSON object"))?;
    for key in root.keys() {
        if !TOP_LEVEL_FIELDS.contains(&key.as_str()) {
            return Err(ValidationError::new(key.as_str(), "unknown field"));
        }
    }

    let parameters = parse_parameters(root.get("parameters"))?;

    let list = root
        .get("operations")
        .ok_or_else(|| ValidationError::new("operations", "missing required field"))?
        .as_array()
        .ok_or_else(|| ValidationError::new("operations", "expected a list of operations"))?;
    if list.is_empty() {
        return Err(ValidationError::new("operations", "at least one operation is required"));
    }
    if list.len() > MAX_OPERATIONS {
        return Err(ValidationError::new(
            "operations",
            format!("at most {} operations are allowed, got {}", MAX_OPERATIONS, list.len()),
        ));
    }

    let operations = list
        .iter()
        .enumerate()
        .map(|(index, op)| parse_operation(index, op, &parameters))
        .collect::<Result<Vec<_>>>()?;

    let outputs = parse_outputs(root.get("outputs"), &operations)?;

    BuildSpecification::new(parameters, operations, outputs)
}

fn parse_parameters(value: Option<&Value>) -> Result<BTreeMap<String, ParamValue>> {
    let Some(value) = value else {
        return Ok(BTreeMap::new());
    };
    let map = value
        .as_object()
        .ok_or_else(|| ValidationError::new("parameters", "expected an object"))?;

    let mut parameters = BTreeMap::new();
    for (name, value) in map {
        let field = format!("parameters.{}", name);
        if name.is_empty() {
            return Err(ValidationError::new(field, "parameter names must not be empty"));
        }
        let param = match value {
            Value::Bool(b) => ParamValue::Bool(*b),
            Value::Number(n) => ParamValue::Number(finite(n.as_f64(), &field)?),
            Value::String(s) => ParamValue::Text(s.clone()),
            _ => {
                return Err(ValidationError::new(
                    field,
                    "expected a number, boolean or string",
                ));
            }
        };
        parameters.insert(name.clone(), param);
    }
    Ok(parameters)
}

fn parse_outputs(value: Option<&Value>, operations: &[Operation]) -> Result<Vec<String>> {
    let Some(value) = value else {
        // Default output is the last declared operation
        return Ok(operations.last().map(|op| vec![op.id.clone()]).unwrap_or_default());
    };

    let list = value
        .as_array()
        .ok_or_else(|| ValidationError::new("outputs", "expected a list of operation ids"))?;
    if list.is_empty() {
        return Err(ValidationError::new("outputs", "at least one output is required"));
    }

    let mut outputs: Vec<String> = Vec::with_capacity(list.len());
    for (i, item) in list.iter().enumerate() {
        let field = format!("outputs[{}]", i);
        let id = item
            .as_str()
            .ok_or_else(|| ValidationError::new(field.as_str(), "expected an operation id"))?;
        if outputs.iter().any(|o| o == id) {
            return Err(ValidationError::new(field, format!("duplicate output '{}'", id)));
        }
        outputs.push(id.to_string());
    }
    Ok(outputs)
}

fn finite(value: Option<f64>, field: &str) -> Result<f64> {
    match value {
        Some(v) if v.is_finite() => Ok(if v == 0.0 { 0.0 } else { v }),
        _ => Err(ValidationError::new(field, "expected a finite number")),
    }
}

/// Field accessor for one operation object
struct Fields<'a> {
    object: &'a Map<String, Value>,
    path: String,
    parameters: &'a BTreeMap<String, ParamValue>,
}

impl<'a> Fields<'a> {
    fn path(&self, key: &str) -> String {
        format!("{}.{}", self.path, key)
    }

    fn error(&self, key: &str, reason: impl Into<String>) -> ValidationError {
        ValidationError::new(self.path(key), reason)
    }

    /// Replace a `"$name"` reference by the parameter value
    fn resolve(&self, value: &Value, field: &str) -> Result<Value> {
        let Some(name) = value.as_str().and_then(|s| s.strip_prefix('$')) else {
            return Ok(value.clone());
        };
        match self.parameters.get(name) {
            Some(ParamValue::Bool(b)) => Ok(Value::Bool(*b)),
            Some(ParamValue::Number(n)) => Ok(serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null)),
            Some(ParamValue::Text(s)) => Ok(Value::String(s.clone())),
            None => Err(ValidationError::new(
                field,
                format!("undefined parameter '{}'", name),
            )),
        }
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.object.get(key) {
            Some(value) => self.resolve(value, &self.path(key)).map(Some),
            None => Ok(None),
        }
    }

    fn require(&self, key: &str) -> Result<Value> {
        self.get(key)?
            .ok_or_else(|| self.error(key, "missing required field"))
    }

    fn number_value(&self, value: &Value, field: &str) -> Result<f64> {
        let v = finite(value.as_f64(), field)?;
        if v.abs() >= MAX_MAGNITUDE {
            return Err(ValidationError::new(
                field,
                format!("magnitude must be below {:e}", MAX_MAGNITUDE),
            ));
        }
        Ok(v)
    }

    fn number(&self, key: &str) -> Result<f64> {
        let value = self.require(key)?;
        self.number_value(&value, &self.path(key))
    }

    fn positive(&self, key: &str) -> Result<f64> {
        let v = self.number(key)?;
        if v <= 0.0 {
            return Err(self.error(key, format!("must be greater than zero, got {}", v)));
        }
        Ok(v)
    }

    fn non_negative(&self, key: &str) -> Result<f64> {
        let v = self.number(key)?;
        if v < 0.0 {
            return Err(self.error(key, format!("must not be negative, got {}", v)));
        }
        Ok(v)
    }

    fn vec3(&self, key: &str, default: Option<[f64; 3]>) -> Result<[f64; 3]> {
        let value = match (self.get(key)?, default) {
            (Some(value), _) => value,
            (None, Some(default)) => return Ok(default),
            (None, None) => return Err(self.error(key, "missing required field")),
        };
        let items = value
            .as_array()
            .filter(|items| items.len() == 3)
            .ok_or_else(|| self.error(key, "expected a list of three numbers"))?;

        let mut out = [0.0; 3];
        for (i, item) in items.iter().enumerate() {
            let field = format!("{}[{}]", self.path(key), i);
            let item = self.resolve(item, &field)?;
            out[i] = self.number_value(&item, &field)?;
        }
        Ok(out)
    }

    fn direction(&self, key: &str) -> Result<[f64; 3]> {
        let v = self.vec3(key, Some(Z_AXIS))?;
        if v.iter().map(|c| c * c).sum::<f64>().sqrt() < 1e-12 {
            return Err(self.error(key, "axis must not be the zero vector"));
        }
        Ok(v)
    }

    fn flag(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key)? {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(b)),
            Some(_) => Err(self.error(key, "expected a boolean")),
        }
    }

    fn edges(&self) -> Result<EdgeSelector> {
        match self.get("edges")? {
            None => Ok(EdgeSelector::All),
            Some(Value::String(s)) => EdgeSelector::parse(&s).map_err(|reason| self.error("edges", reason)),
            Some(_) => Err(self.error("edges", "expected an edge selector string")),
        }
    }

    /// Operation id referenced by `key`; references are never parameters
    fn reference(&self, key: &str, value: &Value) -> Result<String> {
        match value.as_str() {
            Some(id) if !id.is_empty() => Ok(id.to_string()),
            _ => Err(self.error(key, "expected an operation id")),
        }
    }

    fn input(&self) -> Result<Vec<String>> {
        let value = self
            .object
            .get("input")
            .ok_or_else(|| self.error("input", "missing required field"))?;
        Ok(vec![self.reference("input", value)?])
    }

    fn pair(&self) -> Result<Vec<String>> {
        let items = self
            .object
            .get("inputs")
            .ok_or_else(|| self.error("inputs", "missing required field"))?
            .as_array()
            .filter(|items| items.len() == 2)
            .ok_or_else(|| self.error("inputs", "expected exactly two operation ids"))?;
        items
            .iter()
            .enumerate()
            .map(|(i, item)| self.reference(&format!("inputs[{}]", i), item))
            .collect()
    }

    fn check_known(&self, allowed: &[&str]) -> Result<()> {
        for key in self.object.keys() {
            if !COMMON_FIELDS.contains(&key.as_str()) && !allowed.contains(&key.as_str()) {
                return Err(self.error(key, "unknown field"));
            }
        }
        Ok(())
    }
}

fn parse_operation(index: usize, value: &Value, parameters: &BTreeMap<String, ParamValue>) -> Result<Operation> {
    let path = format!("operations[{}]", index);
    let object = value
        .as_object()
        .ok_or_else(|| ValidationError::new(path.as_str(), "expected an object"))?;
    let fields = Fields {
        object,
        path,
        parameters,
    };

    let id = match object.get("id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(_) => return Err(fields.error("id", "expected a non-empty string")),
        None => return Err(fields.error("id", "missing required field")),
    };
    let name = object
        .get("op")
        .ok_or_else(|| fields.error("op", "missing required field"))?
        .as_str()
        .ok_or_else(|| fields.error("op", "expected an operation name"))?;

    let (op, inputs, allowed) = match name {
        "box" => {
            let size = fields.vec3("size", None)?;
            if let Some(i) = size.iter().position(|v| *v <= 0.0) {
                return Err(ValidationError::new(
                    format!("{}[{}]", fields.path("size"), i),
                    "extents must be greater than zero",
                ));
            }
            let center = fields.vec3("center", Some(ORIGIN))?;
            (OpKind::Box { size, center }, Vec::new(), BOX_FIELDS)
        }
        "cylinder" => (
            OpKind::Cylinder {
                radius: fields.positive("radius")?,
                height: fields.positive("height")?,
                center: fields.vec3("center", Some(ORIGIN))?,
                axis: fields.direction("axis")?,
            },
            Vec::new(),
            CYLINDER_FIELDS,
        ),
        "sphere" => (
            OpKind::Sphere {
                radius: fields.positive("radius")?,
                center: fields.vec3("center", Some(ORIGIN))?,
            },
            Vec::new(),
            SPHERE_FIELDS,
        ),
        "translate" => (
            OpKind::Translate {
                offset: fields.vec3("offset", None)?,
            },
            fields.input()?,
            TRANSLATE_FIELDS,
        ),
        "rotate" => (
            OpKind::Rotate {
                angle: fields.number("angle")?,
                axis: fields.direction("axis")?,
                origin: fields.vec3("origin", Some(ORIGIN))?,
            },
            fields.input()?,
            ROTATE_FIELDS,
        ),
        "scale" => {
            let factor = fields.number("factor")?;
            if factor == 0.0 {
                return Err(fields.error("factor", "scale factor must not be zero"));
            }
            (OpKind::Scale { factor }, fields.input()?, SCALE_FIELDS)
        }
        "polar_array" => {
            let count = fields.number("count")?;
            if count.fract() != 0.0 || count < 1.0 || count > MAX_POLAR_COUNT as f64 {
                return Err(fields.error(
                    "count",
                    format!("must be a whole number in 1..={}, got {}", MAX_POLAR_COUNT, count),
                ));
            }
            (
                OpKind::PolarArray {
                    count: count as u32,
                    axis: fields.direction("axis")?,
                    origin: fields.vec3("origin", Some(ORIGIN))?,
                },
                fields.input()?,
                POLAR_FIELDS,
            )
        }
        "union" => (OpKind::Union, fields.pair()?, BOOLEAN_FIELDS),
        "subtract" => (OpKind::Subtract, fields.pair()?, BOOLEAN_FIELDS),
        "intersect" => (OpKind::Intersect, fields.pair()?, BOOLEAN_FIELDS),
        "fillet" => (
            OpKind::Fillet {
                radius: fields.non_negative("radius")?,
                edges: fields.edges()?,
            },
            fields.input()?,
            FILLET_FIELDS,
        ),
        "chamfer" => (
            OpKind::Chamfer {
                distance: fields.non_negative("distance")?,
                edges: fields.edges()?,
            },
            fields.input()?,
            CHAMFER_FIELDS,
        ),
        other => {
            return Err(fields.error("op", format!("unknown operation '{}'", other)));
        }
    };
    fields.check_known(allowed)?;

    let enabled = match fields.flag("when")? {
        Some(_) if inputs.is_empty() => {
            return Err(fields.error("when", "operations without inputs cannot be disabled"));
        }
        Some(enabled) => enabled,
        None => true,
    };

    let optional = fields.flag("optional")?.unwrap_or(false);
    if optional && !matches!(op, OpKind::Fillet { .. } | OpKind::Chamfer { .. }) {
        return Err(fields.error("optional", "only fillet and chamfer operations can be optional"));
    }

    Ok(Operation {
        id,
        op,
        inputs,
        enabled,
        optional,
    })
}
