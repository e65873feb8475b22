//! STEP AP203 writer for faceted B-reps
//!
//! Each solid is written as a `FACETED_BREP` bounded by a `CLOSED_SHELL` of
//! triangular `POLY_LOOP` faces. The header carries a fixed timestamp so the
//! same geometry always serializes to the same bytes.

use std::fmt::Write as _;

use crate::kernel::{KernelError, KernelResult, StepExportOptions, TessellatedMesh};

const FIXED_TIMESTAMP: &str = "1970-01-01T00:00:00";

/// Format a STEP real (always with a decimal point)
fn real(v: f32) -> String {
    let text = format!("{:.6}", v as f64);
    if text == "-0.000000" { "0.000000".into() } else { text }
}

/// Escape a string literal for the STEP physical file format
fn string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

struct Writer {
    data: String,
    next_id: usize,
}

impl Writer {
    fn new() -> Self {
        Self {
            data: String::new(),
            next_id: 1,
        }
    }

    fn entity(&mut self, body: impl AsRef<str>) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        // Writing into a String cannot fail
        let _ = writeln!(self.data, "#{}={};", id, body.as_ref());
        id
    }

    fn list(ids: &[usize]) -> String {
        let refs: Vec<String> = ids.iter().map(|id| format!("#{}", id)).collect();
        format!("({})", refs.join(","))
    }
}

/// Serialize closed meshes as one STEP document
pub fn write_faceted_step(meshes: &[TessellatedMesh], options: &StepExportOptions) -> KernelResult<Vec<u8>> {
    if meshes.is_empty() {
        return Err(KernelError::StepExport("nothing to export".into()));
    }
    for (i, mesh) in meshes.iter().enumerate() {
        if mesh.is_empty() {
            return Err(KernelError::StepExport(format!("solid {} has no faces", i)));
        }
        if !mesh.is_watertight() {
            return Err(KernelError::NonManifold(format!(
                "solid {} is not a closed shell",
                i
            )));
        }
    }

    let mut w = Writer::new();

    let app = w.entity(
        "APPLICATION_CONTEXT('configuration controlled 3D designs of mechanical parts and assemblies')",
    );
    w.entity(format!(
        "APPLICATION_PROTOCOL_DEFINITION('international standard','config_control_design',1994,#{})",
        app
    ));
    let mech = w.entity(format!("MECHANICAL_CONTEXT('',#{},'mechanical')", app));
    let name = string(&options.product_name);
    let product = w.entity(format!("PRODUCT({},{},'',(#{}))", name, name, mech));
    let formation = w.entity(format!(
        "PRODUCT_DEFINITION_FORMATION_WITH_SPECIFIED_SOURCE('','',#{},.NOT_KNOWN.)",
        product
    ));
    let design = w.entity(format!("DESIGN_CONTEXT('',#{},'design')", app));
    let definition = w.entity(format!(
        "PRODUCT_DEFINITION('design','',#{},#{})",
        formation, design
    ));
    let shape = w.entity(format!("PRODUCT_DEFINITION_SHAPE('','',#{})", definition));

    let length = w.entity("(LENGTH_UNIT()NAMED_UNIT(*)SI_UNIT(.MILLI.,.METRE.))");
    let angle = w.entity("(NAMED_UNIT(*)PLANE_ANGLE_UNIT()SI_UNIT($,.RADIAN.))");
    let solid_angle = w.entity("(NAMED_UNIT(*)SI_UNIT($,.STERADIAN.)SOLID_ANGLE_UNIT())");
    let uncertainty = w.entity(format!(
        "UNCERTAINTY_MEASURE_WITH_UNIT(LENGTH_MEASURE(1.E-07),#{},'distance_accuracy_value','confusion accuracy')",
        length
    ));
    let context = w.entity(format!(
        "(GEOMETRIC_REPRESENTATION_CONTEXT(3)GLOBAL_UNCERTAINTY_ASSIGNED_CONTEXT((#{}))\
         GLOBAL_UNIT_ASSIGNED_CONTEXT((#{},#{},#{}))REPRESENTATION_CONTEXT('',''))",
        uncertainty, length, angle, solid_angle
    ));

    let origin = w.entity("CARTESIAN_POINT('',(0.000000,0.000000,0.000000))");
    let z_dir = w.entity("DIRECTION('',(0.000000,0.000000,1.000000))");
    let x_dir = w.entity("DIRECTION('',(1.000000,0.000000,0.000000))");
    let placement = w.entity(format!(
        "AXIS2_PLACEMENT_3D('',#{},#{},#{})",
        origin, z_dir, x_dir
    ));

    let mut items = Vec::with_capacity(meshes.len() + 1);
    for mesh in meshes {
        let points: Vec<usize> = mesh
            .vertices
            .iter()
            .map(|v| {
                w.entity(format!(
                    "CARTESIAN_POINT('',({},{},{}))",
                    real(v[0]),
                    real(v[1]),
                    real(v[2])
                ))
            })
            .collect();

        let mut faces = Vec::with_capacity(mesh.triangle_count());
        for tri in mesh.indices.chunks_exact(3) {
            let corners = [
                points[tri[0] as usize],
                points[tri[1] as usize],
                points[tri[2] as usize],
            ];
            let lp = w.entity(format!("POLY_LOOP('',{})", Writer::list(&corners)));
            let bound = w.entity(format!("FACE_OUTER_BOUND('',#{},.T.)", lp));
            faces.push(w.entity(format!("FACE('',(#{}))", bound)));
        }

        let shell = w.entity(format!("CLOSED_SHELL('',{})", Writer::list(&faces)));
        items.push(w.entity(format!("FACETED_BREP('',#{})", shell)));
    }
    items.push(placement);

    let rep = w.entity(format!(
        "FACETED_BREP_SHAPE_REPRESENTATION('',{},#{})",
        Writer::list(&items),
        context
    ));
    w.entity(format!("SHAPE_DEFINITION_REPRESENTATION(#{},#{})", shape, rep));

    let author = string(options.author.as_deref().unwrap_or(""));
    let organization = string(options.organization.as_deref().unwrap_or(""));
    let mut out = String::with_capacity(w.data.len() + 512);
    out.push_str("ISO-10303-21;\nHEADER;\n");
    out.push_str("FILE_DESCRIPTION(('faceted B-rep'),'2;1');\n");
    let _ = writeln!(
        out,
        "FILE_NAME({},'{}',({}),({}),'partforge','partforge','');",
        string(&format!("{}.step", options.product_name)),
        FIXED_TIMESTAMP,
        author,
        organization
    );
    out.push_str("FILE_SCHEMA(('CONFIG_CONTROL_DESIGN'));\nENDSEC;\nDATA;\n");
    out.push_str(&w.data);
    out.push_str("ENDSEC;\nEND-ISO-10303-21;\n");

    Ok(out.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tetrahedron() -> TessellatedMesh {
        TessellatedMesh {
            vertices: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            normals: vec![[0.0, 0.0, 1.0]; 4],
            indices: vec![0, 2, 1, 0, 1, 3, 1, 2, 3, 0, 3, 2],
        }
    }

    #[test]
    fn test_writes_faceted_brep() {
        let bytes = write_faceted_step(&[tetrahedron()], &StepExportOptions::default()).unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.starts_with("ISO-10303-21;"));
        assert!(text.trim_end().ends_with("END-ISO-10303-21;"));
        assert_eq!(text.matches("POLY_LOOP").count(), 4);
        assert_eq!(text.matches("FACETED_BREP(").count(), 1);
        assert!(text.contains("CLOSED_SHELL"));
        assert!(text.contains("1970-01-01T00:00:00"));
    }

    #[test]
    fn test_open_shell_rejected() {
        let mut mesh = tetrahedron();
        mesh.indices.truncate(6);
        let result = write_faceted_step(&[mesh], &StepExportOptions::default());
        assert!(matches!(result, Err(KernelError::NonManifold(_))));
    }

    #[test]
    fn test_quotes_are_escaped() {
        let options = StepExportOptions {
            product_name: "o'ring".into(),
            ..StepExportOptions::default()
        };
        let text = String::from_utf8(write_faceted_step(&[tetrahedron()], &options).unwrap()).unwrap();
        assert!(text.contains("PRODUCT('o''ring','o''ring'"));
    }

    #[test]
    fn test_reals_have_decimal_point() {
        assert_eq!(real(1.0), "1.000000");
        assert_eq!(real(-0.0), "0.000000");
    }
}
