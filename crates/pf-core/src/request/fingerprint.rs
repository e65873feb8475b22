use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Operation, ParamValue};
use crate::export::{ExportFormat, ExportOptions};

/// Lowercase hex SHA-256 of a normalized build specification
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

#[derive(Serialize)]
struct Canonical<'a> {
    parameters: &'a BTreeMap<String, ParamValue>,
    operations: &'a [Operation],
    outputs: &'a [String],
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl Fingerprint {
    pub(crate) fn of_specification(
        parameters: &BTreeMap<String, ParamValue>,
        operations: &[Operation],
        outputs: &[String],
    ) -> Result<Self, serde_json::Error> {
        let canonical = serde_json::to_vec(&Canonical {
            parameters,
            operations,
            outputs,
        })?;
        Ok(Self(sha256_hex(&canonical)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one export artifact: what was built, in which format, with which options
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub fingerprint: Fingerprint,
    pub format: ExportFormat,
    /// Short digest of the export options
    pub options: String,
}

impl ArtifactKey {
    pub fn new(fingerprint: &Fingerprint, format: ExportFormat, options: &ExportOptions) -> Self {
        // Plain data, encoding does not fail
        let encoded = serde_json::to_vec(options).unwrap_or_default();
        let digest = sha256_hex(&encoded);
        Self {
            fingerprint: fingerprint.clone(),
            format,
            options: digest[..12].to_string(),
        }
    }

    /// Flat string form, safe for use as a file name
    pub fn as_string(&self) -> String {
        format!("{}-{}-{}", self.fingerprint, self.format.extension(), self.options)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::parse_request;

    const BASE: &str = r#"{
        "parameters": {"size": 10, "radius": 1},
        "operations": [
            {"id": "body", "op": "box", "size": ["$size", "$size", "$size"]},
            {"id": "round", "op": "fillet", "input": "body", "radius": "$radius", "edges": "all"}
        ]
    }"#;

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let reordered = r#"{
            "operations": [
                {"size": ["$size", "$size", "$size"], "op": "box", "id": "body"},
                {"edges": "all", "radius": "$radius", "input": "body", "op": "fillet", "id": "round"}
            ],
            "parameters": {"radius": 1, "size": 10}
        }"#;
        let a = parse_request(BASE).unwrap();
        let b = parse_request(reordered).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_values() {
        let a = parse_request(BASE).unwrap();
        let b = parse_request(&BASE.replace("\"radius\": 1}", "\"radius\": 2}")).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_artifact_key_depends_on_format_and_options() {
        let spec = parse_request(BASE).unwrap();
        let options = ExportOptions::default();
        let step = ArtifactKey::new(spec.fingerprint(), ExportFormat::Step, &options);
        let stl = ArtifactKey::new(spec.fingerprint(), ExportFormat::Stl, &options);
        assert_ne!(step, stl);
        assert_eq!(step, ArtifactKey::new(spec.fingerprint(), ExportFormat::Step, &options));

        let mut finer = options.clone();
        finer.tessellation.max_cells *= 2;
        assert_ne!(stl, ArtifactKey::new(spec.fingerprint(), ExportFormat::Stl, &finer));
        assert!(step.as_string().ends_with(&step.options));
    }
}
